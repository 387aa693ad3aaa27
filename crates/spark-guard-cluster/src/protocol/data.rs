//! 请求与响应载荷。
//!
//! # 教案式注释
//! - **意图 (Why)**：载荷的格式只取决于消息类型，把它从帧信封中剥离，服务端可以先读完整帧、
//!   再按类型解析，解析失败时仍能按编号回复 `BAD_REQUEST`；
//! - **契约 (What)**：
//!   - 计数字段在线上是 `i32`，解码不做正负检查，由处理器判定非法值；
//!   - `str16` 为 `u16` 长度前缀加 UTF-8 字节；参数值以标签区分 `0=int`、`1=str`、`2=bool`；
//!   - 空响应载荷统一解码为 [`ResponseData::Empty`]，失败状态的响应通常不带载荷；
//! - **风险 (Trade-offs)**：解码要求载荷被完整消费之前的字段齐全，多余的尾部字节被忽略，
//!   便于后续在末尾追加字段。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use spark_guard_core::token::ATTACHMENT_BLOCK_ID;
use spark_guard_core::{ParamValue, TokenResult, TokenResultStatus};

use super::msg_type;
use crate::error::ProtocolError;

const PARAM_TAG_INT: u8 = 0;
const PARAM_TAG_STR: u8 = 1;
const PARAM_TAG_BOOL: u8 = 2;

/// 批量响应中“无失败规则”的占位值。
pub const NO_BLOCK_ID: i64 = -1;

/// 请求载荷。
#[derive(Clone, Debug, PartialEq)]
pub enum RequestData {
    /// 心跳，同时声明客户端所属的命名空间。
    Ping { namespace: String },
    Flow {
        flow_id: i64,
        count: i32,
        prioritized: bool,
    },
    BatchFlow {
        flow_ids: Vec<i64>,
        count: i32,
        prioritized: bool,
    },
    ParamFlow {
        flow_id: i64,
        count: i32,
        params: Vec<ParamValue>,
    },
    ConcurrentAcquire { flow_id: i64, count: i32 },
    ConcurrentRelease { token_id: i64 },
}

impl RequestData {
    pub fn msg_type(&self) -> u8 {
        match self {
            RequestData::Ping { .. } => msg_type::PING,
            RequestData::Flow { .. } => msg_type::FLOW,
            RequestData::BatchFlow { .. } => msg_type::BATCH_FLOW,
            RequestData::ParamFlow { .. } => msg_type::PARAM_FLOW,
            RequestData::ConcurrentAcquire { .. } => msg_type::CONCURRENT_FLOW_ACQUIRE,
            RequestData::ConcurrentRelease { .. } => msg_type::CONCURRENT_FLOW_RELEASE,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            RequestData::Ping { namespace } => put_str16(dst, namespace)?,
            RequestData::Flow {
                flow_id,
                count,
                prioritized,
            } => {
                dst.put_i64(*flow_id);
                dst.put_i32(*count);
                dst.put_u8(u8::from(*prioritized));
            }
            RequestData::BatchFlow {
                flow_ids,
                count,
                prioritized,
            } => {
                put_len16(dst, flow_ids.len())?;
                for id in flow_ids {
                    dst.put_i64(*id);
                }
                dst.put_i32(*count);
                dst.put_u8(u8::from(*prioritized));
            }
            RequestData::ParamFlow {
                flow_id,
                count,
                params,
            } => {
                dst.put_i64(*flow_id);
                dst.put_i32(*count);
                put_len16(dst, params.len())?;
                for param in params {
                    put_param(dst, param)?;
                }
            }
            RequestData::ConcurrentAcquire { flow_id, count } => {
                dst.put_i64(*flow_id);
                dst.put_i32(*count);
            }
            RequestData::ConcurrentRelease { token_id } => dst.put_i64(*token_id),
        }
        Ok(())
    }

    pub fn decode(tag: u8, mut src: Bytes) -> Result<Self, ProtocolError> {
        let src = &mut src;
        Ok(match tag {
            msg_type::PING => RequestData::Ping {
                namespace: get_str16(src, "namespace")?,
            },
            msg_type::FLOW => RequestData::Flow {
                flow_id: get_i64(src, "flow_id")?,
                count: get_i32(src, "count")?,
                prioritized: get_u8(src, "prioritized")? != 0,
            },
            msg_type::BATCH_FLOW => {
                let n = get_u16(src, "flow_ids.len")?;
                let flow_ids = (0..n)
                    .map(|_| get_i64(src, "flow_ids"))
                    .collect::<Result<Vec<_>, _>>()?;
                RequestData::BatchFlow {
                    flow_ids,
                    count: get_i32(src, "count")?,
                    prioritized: get_u8(src, "prioritized")? != 0,
                }
            }
            msg_type::PARAM_FLOW => {
                let flow_id = get_i64(src, "flow_id")?;
                let count = get_i32(src, "count")?;
                let n = get_u16(src, "params.len")?;
                let params = (0..n)
                    .map(|_| get_param(src))
                    .collect::<Result<Vec<_>, _>>()?;
                RequestData::ParamFlow {
                    flow_id,
                    count,
                    params,
                }
            }
            msg_type::CONCURRENT_FLOW_ACQUIRE => RequestData::ConcurrentAcquire {
                flow_id: get_i64(src, "flow_id")?,
                count: get_i32(src, "count")?,
            },
            msg_type::CONCURRENT_FLOW_RELEASE => RequestData::ConcurrentRelease {
                token_id: get_i64(src, "token_id")?,
            },
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// 响应载荷。
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseData {
    Empty,
    /// 命名空间内当前连接的客户端数。
    Ping { connected: i32 },
    Flow { remaining: i32, wait_in_ms: i32 },
    BatchFlow {
        remaining: i32,
        wait_in_ms: i32,
        block_id: i64,
    },
    ConcurrentAcquire { token_id: i64 },
}

impl ResponseData {
    /// 把令牌服务的判定结果转换为对应消息类型的载荷。
    pub fn from_token_result(tag: u8, result: &TokenResult) -> Self {
        match tag {
            msg_type::FLOW | msg_type::PARAM_FLOW => ResponseData::Flow {
                remaining: result.remaining,
                wait_in_ms: result.wait_in_ms,
            },
            msg_type::BATCH_FLOW => ResponseData::BatchFlow {
                remaining: result.remaining,
                wait_in_ms: result.wait_in_ms,
                block_id: result
                    .attachments
                    .get(ATTACHMENT_BLOCK_ID)
                    .and_then(|id| id.parse().ok())
                    .unwrap_or(NO_BLOCK_ID),
            },
            msg_type::CONCURRENT_FLOW_ACQUIRE => ResponseData::ConcurrentAcquire {
                token_id: result.token_id,
            },
            _ => ResponseData::Empty,
        }
    }

    /// 与响应状态一起还原为令牌结果。
    pub fn into_token_result(self, status: TokenResultStatus) -> TokenResult {
        let result = TokenResult::new(status);
        match self {
            ResponseData::Empty | ResponseData::Ping { .. } => result,
            ResponseData::Flow {
                remaining,
                wait_in_ms,
            } => TokenResult {
                remaining,
                wait_in_ms,
                ..result
            },
            ResponseData::BatchFlow {
                remaining,
                wait_in_ms,
                block_id,
            } => {
                let result = TokenResult {
                    remaining,
                    wait_in_ms,
                    ..result
                };
                if block_id == NO_BLOCK_ID {
                    result
                } else {
                    result.with_attachment(ATTACHMENT_BLOCK_ID, block_id.to_string())
                }
            }
            ResponseData::ConcurrentAcquire { token_id } => result.with_token_id(token_id),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            ResponseData::Empty => {}
            ResponseData::Ping { connected } => dst.put_i32(*connected),
            ResponseData::Flow {
                remaining,
                wait_in_ms,
            } => {
                dst.put_i32(*remaining);
                dst.put_i32(*wait_in_ms);
            }
            ResponseData::BatchFlow {
                remaining,
                wait_in_ms,
                block_id,
            } => {
                dst.put_i32(*remaining);
                dst.put_i32(*wait_in_ms);
                dst.put_i64(*block_id);
            }
            ResponseData::ConcurrentAcquire { token_id } => dst.put_i64(*token_id),
        }
    }

    pub fn decode(tag: u8, mut src: Bytes) -> Result<Self, ProtocolError> {
        if src.is_empty() {
            return Ok(ResponseData::Empty);
        }
        let src = &mut src;
        Ok(match tag {
            msg_type::PING => ResponseData::Ping {
                connected: get_i32(src, "connected")?,
            },
            msg_type::FLOW | msg_type::PARAM_FLOW => ResponseData::Flow {
                remaining: get_i32(src, "remaining")?,
                wait_in_ms: get_i32(src, "wait_in_ms")?,
            },
            msg_type::BATCH_FLOW => ResponseData::BatchFlow {
                remaining: get_i32(src, "remaining")?,
                wait_in_ms: get_i32(src, "wait_in_ms")?,
                block_id: get_i64(src, "block_id")?,
            },
            msg_type::CONCURRENT_FLOW_ACQUIRE => ResponseData::ConcurrentAcquire {
                token_id: get_i64(src, "token_id")?,
            },
            msg_type::CONCURRENT_FLOW_RELEASE => ResponseData::Empty,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

fn ensure(src: &Bytes, len: usize, field: &'static str) -> Result<(), ProtocolError> {
    if src.remaining() < len {
        return Err(ProtocolError::Truncated { field });
    }
    Ok(())
}

fn get_u8(src: &mut Bytes, field: &'static str) -> Result<u8, ProtocolError> {
    ensure(src, 1, field)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes, field: &'static str) -> Result<u16, ProtocolError> {
    ensure(src, 2, field)?;
    Ok(src.get_u16())
}

fn get_i32(src: &mut Bytes, field: &'static str) -> Result<i32, ProtocolError> {
    ensure(src, 4, field)?;
    Ok(src.get_i32())
}

fn get_i64(src: &mut Bytes, field: &'static str) -> Result<i64, ProtocolError> {
    ensure(src, 8, field)?;
    Ok(src.get_i64())
}

fn get_str16(src: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    let len = usize::from(get_u16(src, field)?);
    ensure(src, len, field)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::BadUtf8)
}

fn get_param(src: &mut Bytes) -> Result<ParamValue, ProtocolError> {
    match get_u8(src, "param.tag")? {
        PARAM_TAG_INT => Ok(ParamValue::Int(get_i64(src, "param.int")?)),
        PARAM_TAG_STR => Ok(ParamValue::Str(get_str16(src, "param.str")?)),
        PARAM_TAG_BOOL => Ok(ParamValue::Bool(get_u8(src, "param.bool")? != 0)),
        other => Err(ProtocolError::UnknownParamTag(other)),
    }
}

fn put_len16(dst: &mut BytesMut, len: usize) -> Result<(), ProtocolError> {
    let len16 = u16::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        len,
        max: usize::from(u16::MAX),
    })?;
    dst.put_u16(len16);
    Ok(())
}

fn put_str16(dst: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    put_len16(dst, value.len())?;
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_param(dst: &mut BytesMut, param: &ParamValue) -> Result<(), ProtocolError> {
    match param {
        ParamValue::Int(v) => {
            dst.put_u8(PARAM_TAG_INT);
            dst.put_i64(*v);
        }
        ParamValue::Str(v) => {
            dst.put_u8(PARAM_TAG_STR);
            put_str16(dst, v)?;
        }
        ParamValue::Bool(v) => {
            dst.put_u8(PARAM_TAG_BOOL);
            dst.put_u8(u8::from(*v));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(data: &RequestData) -> Bytes {
        let mut buf = BytesMut::new();
        data.encode(&mut buf).unwrap();
        buf.freeze()
    }

    #[test]
    fn param_request_keeps_value_kinds() {
        let data = RequestData::ParamFlow {
            flow_id: 42,
            count: 1,
            params: vec![
                ParamValue::Int(-7),
                ParamValue::from("用户-9"),
                ParamValue::Bool(true),
            ],
        };
        let decoded = RequestData::decode(msg_type::PARAM_FLOW, encoded(&data)).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn truncated_payload_names_the_missing_field() {
        let mut bytes = encoded(&RequestData::Flow {
            flow_id: 1,
            count: 1,
            prioritized: false,
        });
        bytes.truncate(9);
        let err = RequestData::decode(msg_type::FLOW, bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { field: "count" }));
    }

    #[test]
    fn unknown_param_tag_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i64(1);
        buf.put_i32(1);
        buf.put_u16(1);
        buf.put_u8(9);
        let err = RequestData::decode(msg_type::PARAM_FLOW, buf.freeze()).unwrap_err();
        assert_eq!(err.code(), "spark.guard.protocol.unknown_param_tag");
    }

    #[test]
    fn batch_response_carries_block_id_as_attachment() {
        let blocked = TokenResult::blocked().with_attachment(ATTACHMENT_BLOCK_ID, "12");
        let data = ResponseData::from_token_result(msg_type::BATCH_FLOW, &blocked);
        assert_eq!(
            data,
            ResponseData::BatchFlow {
                remaining: 0,
                wait_in_ms: 0,
                block_id: 12
            }
        );
        let restored = data.into_token_result(TokenResultStatus::Blocked);
        assert_eq!(restored, blocked);

        let passed = ResponseData::from_token_result(msg_type::BATCH_FLOW, &TokenResult::ok(3));
        let restored = passed.into_token_result(TokenResultStatus::Ok);
        assert!(restored.attachments.is_empty(), "无失败规则时不附带 block_id");
    }

    #[test]
    fn empty_response_payload_decodes_for_any_type() {
        for tag in [msg_type::FLOW, msg_type::BATCH_FLOW, msg_type::PING] {
            assert_eq!(
                ResponseData::decode(tag, Bytes::new()).unwrap(),
                ResponseData::Empty
            );
        }
    }
}
