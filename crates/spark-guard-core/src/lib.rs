#![forbid(unsafe_code)]

//! # spark-guard-core
//!
//! ## 定位与职责（Why）
//! - 运行时流量防护引擎的本地部分：对每次资源调用判定放行、排队等待或拒绝；
//! - 判定依据是实时统计（QPS、并发数、RT、异常）与可热替换的规则（流控、熔断、系统、热点参数、授权）；
//! - 集群模式下，流控槽位通过 [`token::TokenService`] 向令牌服务申请配额，服务端与客户端实现位于
//!   `spark-guard-cluster`。
//!
//! ## 架构嵌入（Where）
//! - [`sph`]：业务入口，`Sph::entry` / [`EntryBuilder`]；
//! - [`context`]、[`entry`]：调用上下文与入口生命周期（同步、异步）；
//! - [`slot`]：槽位链模型、链缓存与默认构建器；
//! - [`rule`]：各类规则、管理器与检查槽位；
//! - [`node`]：滑动窗口统计节点；
//! - [`config`]、[`error`]：进程级配置与错误族。
//!
//! ## 线程模型（Trade-offs）
//! - 准入判定在调用线程上同步执行，唯一可能阻塞的点是匀速排队与集群令牌请求；
//! - 上下文绑定在线程本地存储中，跨线程/跨任务必须通过 [`context::run_on_context`] 或
//!   [`context::ContextScope`] 显式传递。

/// 单调毫秒时钟。
pub mod clock;

/// 进程级引擎配置（`serde` + `toml`）。
pub mod config;

/// 调用上下文：线程本地绑定、名称表与跨任务传递。
pub mod context;

/// 同步与异步入口。
pub mod entry;

/// 阻断错误、入口退出错误、规则与配置错误。
pub mod error;

/// 滑动窗口统计节点与节点仓储。
pub mod node;

/// 资源身份与调用参数。
pub mod resource;

/// 流控、授权、熔断、系统、热点参数规则。
pub mod rule;

/// 槽位链模型。
pub mod slot;

/// 资源准入门面。
pub mod sph;

/// 集群令牌服务契约。
pub mod token;

pub use config::EngineConfig;
pub use context::{Context, ContextExt, ContextScope};
pub use entry::{AsyncEntry, Entry, EntryRef, EntryState};
pub use error::{BlockError, BlockKind, BlockReason, ConfigError, EntryExitError, RuleError};
pub use resource::{EntryType, ParamValue, ResourceType, ResourceWrapper};
pub use slot::{ChainRegistry, ProcessorSlot, SlotChain, SlotChainBuilder, SlotContext};
pub use sph::{EntryBuilder, Sph, global, init};
pub use token::{TokenResult, TokenResultStatus, TokenService};
