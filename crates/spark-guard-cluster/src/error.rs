//! # error 模块说明
//!
//! ## 意图（Why）
//! - 协议层与客户端的失败都需要稳定的错误码，日志与告警按 `code()` 聚合，而不是匹配消息文本；
//! - 客户端错误不会越过 [`TokenService`](spark_guard_core::TokenService) 边界，统一在调用点
//!   映射为 `Fail` 状态，由流控槽位按规则决定回退。

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// 帧编解码失败。
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("truncated payload while reading {field}")]
    Truncated { field: &'static str },

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("unknown token status {0}")]
    UnknownStatus(i8),

    #[error("unknown parameter tag {0}")]
    UnknownParamTag(u8),

    #[error("string field is not valid utf-8")]
    BadUtf8,
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLarge { .. } => "spark.guard.protocol.frame_too_large",
            ProtocolError::Truncated { .. } => "spark.guard.protocol.truncated",
            ProtocolError::UnknownType(_) => "spark.guard.protocol.unknown_type",
            ProtocolError::UnknownStatus(_) => "spark.guard.protocol.unknown_status",
            ProtocolError::UnknownParamTag(_) => "spark.guard.protocol.unknown_param_tag",
            ProtocolError::BadUtf8 => "spark.guard.protocol.bad_utf8",
        }
    }
}

/// 令牌客户端失败。
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("token client is not connected")]
    NotConnected,

    #[error("request {id} timed out after {timeout_ms} ms")]
    Timeout { id: i64, timeout_ms: u64 },

    #[error("connection closed before request {id} was answered")]
    Closed { id: i64 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::NotConnected => "spark.guard.client.not_connected",
            ClientError::Timeout { .. } => "spark.guard.client.timeout",
            ClientError::Closed { .. } => "spark.guard.client.closed",
            ClientError::Io(_) => "spark.guard.client.io",
            ClientError::Protocol(err) => err.code(),
        }
    }
}

/// 服务端配置加载失败。
#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config field `{field}`: {detail}")]
    Invalid { field: &'static str, detail: String },
}

impl ServerConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ServerConfigError::Io { .. } => "spark.guard.server.config.io",
            ServerConfigError::Parse(_) => "spark.guard.server.config.parse",
            ServerConfigError::Invalid { .. } => "spark.guard.server.config.invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_protocol_errors_keep_their_code() {
        let err = ClientError::from(ProtocolError::BadUtf8);
        assert_eq!(err.code(), "spark.guard.protocol.bad_utf8");
        assert_eq!(
            ClientError::Timeout { id: 3, timeout_ms: 20 }.to_string(),
            "request 3 timed out after 20 ms"
        );
    }
}
