#![forbid(unsafe_code)]

//! # spark-guard-cluster
//!
//! ## 定位与职责（Why）
//! - 把单机流量防护扩展到集群：多个业务实例共享同一规则的全局阈值，由令牌服务端统一记账；
//! - 服务端与客户端都实现核心 crate 的 [`TokenService`](spark_guard_core::TokenService)，
//!   流控槽位只依赖这一契约。
//!
//! ## 架构嵌入（Where）
//! - [`protocol`]：长度前缀帧、消息类型与载荷编解码；
//! - [`server`]：配额记账、请求处理器、租约回收与 TCP 接入；
//! - [`client`]：单连接多路复用的阻塞式令牌客户端；
//! - [`error`]：协议、客户端与服务端配置错误。
//!
//! ## 运行模型（Trade-offs）
//! - 服务端完全运行在 tokio 多线程运行时上，每个请求一个任务，响应可乱序返回；
//! - 客户端的判定调用在业务线程上同步阻塞，读写由后台 tokio 任务驱动，
//!   超时与断连都退化为 `FAIL` 状态，交由规则的回退策略处理。

/// 令牌客户端。
pub mod client;

/// 错误族与稳定错误码。
pub mod error;

/// 线上协议。
pub mod protocol;

/// 令牌服务端。
pub mod server;

pub use client::{ClientConfig, ClusterTokenClient};
pub use error::{ClientError, ProtocolError, ServerConfigError};
pub use protocol::{ClusterRequest, ClusterResponse, RequestData, ResponseData};
pub use server::{DefaultTokenService, ServerConfig, TokenServer};
