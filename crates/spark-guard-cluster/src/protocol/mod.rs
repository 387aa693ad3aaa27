//! # protocol 模块说明
//!
//! ## 定位（Why）
//! - 令牌客户端与服务端之间是单条长连接上的请求/响应多路复用：同一连接可以同时挂起多个请求，
//!   响应可以乱序返回，客户端只依赖回显的请求编号完成关联；
//! - 信封（编号、消息类型、状态）与载荷分层：信封由 [`codec`] 处理，载荷由 [`data`] 按消息类型
//!   编解码，服务端因此可以在“帧完整但载荷无法解析”时返回 `BAD_REQUEST` 而不断开连接。
//!
//! ## 契约（What）
//! - 所有整数均为大端序；
//! - 消息类型与状态码的数值即线上协议，不得改动；
//! - 请求编号由客户端分配，服务端原样回显。

pub mod codec;
pub mod data;

pub use codec::{
    DecodeOutcome, MAX_FRAME_LEN, decode_request_frame, decode_response_frame, encode_request,
    encode_response,
};
pub use data::{RequestData, ResponseData};

use spark_guard_core::TokenResultStatus;

/// 消息类型标签。
pub mod msg_type {
    pub const PING: u8 = 0;
    pub const FLOW: u8 = 1;
    pub const PARAM_FLOW: u8 = 2;
    pub const CONCURRENT_FLOW_ACQUIRE: u8 = 3;
    pub const CONCURRENT_FLOW_RELEASE: u8 = 4;
    pub const BATCH_FLOW: u8 = 5;

    /// 标签是否属于已知消息类型。
    pub fn is_known(tag: u8) -> bool {
        tag <= BATCH_FLOW
    }

    pub fn name(tag: u8) -> &'static str {
        match tag {
            PING => "ping",
            FLOW => "flow",
            PARAM_FLOW => "param_flow",
            CONCURRENT_FLOW_ACQUIRE => "concurrent_acquire",
            CONCURRENT_FLOW_RELEASE => "concurrent_release",
            BATCH_FLOW => "batch_flow",
            _ => "unknown",
        }
    }
}

/// 请求信封。
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterRequest<T> {
    pub id: i64,
    pub msg_type: u8,
    pub data: T,
}

impl ClusterRequest<RequestData> {
    /// 以载荷推导消息类型构造请求。
    pub fn new(id: i64, data: RequestData) -> Self {
        Self {
            id,
            msg_type: data.msg_type(),
            data,
        }
    }
}

/// 响应信封；`id` 与 `msg_type` 取自对应请求。
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterResponse<R> {
    pub id: i64,
    pub msg_type: u8,
    pub status: TokenResultStatus,
    pub data: R,
}

impl ClusterResponse<ResponseData> {
    pub fn new(id: i64, msg_type: u8, status: TokenResultStatus, data: ResponseData) -> Self {
        Self {
            id,
            msg_type,
            status,
            data,
        }
    }

    /// 只有状态、没有载荷的响应。
    pub fn status_only(id: i64, msg_type: u8, status: TokenResultStatus) -> Self {
        Self::new(id, msg_type, status, ResponseData::Empty)
    }
}
