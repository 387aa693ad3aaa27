//! # server 模块说明
//!
//! ## 核心意图（Why）
//! - 集群流控的“记账中心”：按 `flow_id` 维护全局配额、热点参数计数与并发租约，
//!   向所有客户端给出一致的判定；
//! - 判定逻辑（[`DefaultTokenService`]）与接入层（[`TokenServer`]）分离，
//!   前者也可以在业务进程内直接安装为本地令牌服务。
//!
//! ## 模块组成（What）
//! - [`config`]：TOML 配置与内联集群规则；
//! - [`rules`]、[`connection`]：规则仓储与命名空间成员；
//! - [`metric`]、[`flow`]、[`param`]、[`concurrent`]：三类配额的判定与记账；
//! - [`token_service`]、[`processor`]：判定入口与消息类型分发；
//! - [`limiter`]、[`tcp`]：服务端自我保护与 TCP 接入。

pub mod concurrent;
pub mod config;
pub mod connection;
pub mod flow;
pub mod limiter;
pub mod metric;
pub mod param;
pub mod processor;
pub mod rules;
pub mod tcp;
pub mod token_service;

pub use concurrent::{Lease, LeaseManager};
pub use config::{NamespacedFlowRule, NamespacedParamRule, QuotaConfig, ServerConfig};
pub use connection::ConnectionManager;
pub use processor::{RequestContext, RequestProcessor, dispatch};
pub use rules::{ClusterFlowRule, ClusterParamRule, ClusterRules};
pub use tcp::TokenServer;
pub use token_service::DefaultTokenService;
