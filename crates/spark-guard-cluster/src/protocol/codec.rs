//! 长度前缀帧编解码。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - TCP 是字节流，读端需要先确定一帧的边界，再交给载荷解析；
//! - 帧解码只负责信封（编号、类型、状态），载荷以原始 [`Bytes`] 交给上层，
//!   上层据此区分“帧损坏需要断开连接”与“载荷非法只需回复错误状态”。
//!
//! ## 逻辑 (How)
//! - 请求帧：`[length:u32][type:u8][id:i64][payload…]`；
//! - 响应帧：`[length:u32][type:u8][id:i64][status:i8][payload…]`；
//! - `length` 计算其后的全部字节；缓冲区不足一帧时返回 [`DecodeOutcome::Incomplete`]
//!   且不消费任何字节，调用方继续读取后重试。
//!
//! ## 契约 (What)
//! - 帧总长（含长度字段）不得超过 [`MAX_FRAME_LEN`]；超限视为协议错误，连接应被关闭；
//! - 信封短于头部长度时返回 [`ProtocolError::Truncated`]。

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use spark_guard_core::TokenResultStatus;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{ClusterRequest, ClusterResponse, RequestData, ResponseData};
use crate::error::ProtocolError;

/// 单帧上限（含长度字段）。
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const LENGTH_FIELD_LEN: usize = 4;
const REQUEST_HEADER_LEN: usize = 1 + 8;
const RESPONSE_HEADER_LEN: usize = 1 + 8 + 1;

/// 一次解码尝试的结果。
#[derive(Debug, PartialEq)]
pub enum DecodeOutcome<T> {
    /// 成功切出一帧。
    Complete(T),
    /// 数据不足，需要继续读取。
    Incomplete,
}

pub fn encode_request(
    request: &ClusterRequest<RequestData>,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let start = begin_frame(dst);
    dst.put_u8(request.msg_type);
    dst.put_i64(request.id);
    request.data.encode(dst)?;
    finish_frame(dst, start)
}

pub fn encode_response(
    response: &ClusterResponse<ResponseData>,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let start = begin_frame(dst);
    dst.put_u8(response.msg_type);
    dst.put_i64(response.id);
    dst.put_i8(response.status.code());
    response.data.encode(dst);
    finish_frame(dst, start)
}

fn begin_frame(dst: &mut BytesMut) -> usize {
    let start = dst.len();
    dst.put_u32(0);
    start
}

fn finish_frame(dst: &mut BytesMut, start: usize) -> Result<(), ProtocolError> {
    let len = dst.len() - start;
    if len > MAX_FRAME_LEN {
        dst.truncate(start);
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let body_len = (len - LENGTH_FIELD_LEN) as u32;
    dst[start..start + LENGTH_FIELD_LEN].copy_from_slice(&body_len.to_be_bytes());
    Ok(())
}

/// 从缓冲区切出一帧的主体（不含长度字段）。
fn split_frame(src: &mut BytesMut, header_len: usize) -> Result<Option<Bytes>, ProtocolError> {
    if src.len() < LENGTH_FIELD_LEN {
        return Ok(None);
    }
    let mut len_bytes = [0u8; LENGTH_FIELD_LEN];
    len_bytes.copy_from_slice(&src[..LENGTH_FIELD_LEN]);
    let body_len = u32::from_be_bytes(len_bytes) as usize;
    let total = body_len.saturating_add(LENGTH_FIELD_LEN);
    if total > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: total,
            max: MAX_FRAME_LEN,
        });
    }
    if body_len < header_len {
        return Err(ProtocolError::Truncated { field: "header" });
    }
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }
    src.advance(LENGTH_FIELD_LEN);
    Ok(Some(src.split_to(body_len).freeze()))
}

/// 解码请求帧；载荷保持原始字节。
pub fn decode_request_frame(
    src: &mut BytesMut,
) -> Result<DecodeOutcome<ClusterRequest<Bytes>>, ProtocolError> {
    let Some(mut body) = split_frame(src, REQUEST_HEADER_LEN)? else {
        return Ok(DecodeOutcome::Incomplete);
    };
    let msg_type = body.get_u8();
    let id = body.get_i64();
    Ok(DecodeOutcome::Complete(ClusterRequest {
        id,
        msg_type,
        data: body,
    }))
}

/// 解码响应帧；未知状态码视为协议错误。
pub fn decode_response_frame(
    src: &mut BytesMut,
) -> Result<DecodeOutcome<ClusterResponse<Bytes>>, ProtocolError> {
    let Some(mut body) = split_frame(src, RESPONSE_HEADER_LEN)? else {
        return Ok(DecodeOutcome::Incomplete);
    };
    let msg_type = body.get_u8();
    let id = body.get_i64();
    let code = body.get_i8();
    let status = TokenResultStatus::from_code(code).ok_or(ProtocolError::UnknownStatus(code))?;
    Ok(DecodeOutcome::Complete(ClusterResponse {
        id,
        msg_type,
        status,
        data: body,
    }))
}

/// 从异步读端读取下一帧；对端正常关闭且缓冲区为空时返回 `Ok(None)`。
///
/// 协议错误以 `InvalidData` 的 IO 错误返回，调用方应关闭连接。
pub async fn read_frame<R, T>(
    reader: &mut R,
    buf: &mut BytesMut,
    decode: fn(&mut BytesMut) -> Result<DecodeOutcome<T>, ProtocolError>,
) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
{
    loop {
        match decode(buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))? {
            DecodeOutcome::Complete(frame) => return Ok(Some(frame)),
            DecodeOutcome::Incomplete => {}
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of a frame",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::msg_type;

    #[test]
    fn request_frame_waits_for_all_bytes() {
        let request = ClusterRequest::new(
            7,
            RequestData::Flow {
                flow_id: 100,
                count: 2,
                prioritized: true,
            },
        );
        let mut encoded = BytesMut::new();
        encode_request(&request, &mut encoded).unwrap();
        assert_eq!(encoded.len(), 4 + 9 + 13);

        let mut partial = BytesMut::from(&encoded[..10]);
        assert_eq!(
            decode_request_frame(&mut partial).unwrap(),
            DecodeOutcome::Incomplete
        );
        assert_eq!(partial.len(), 10, "不完整时不得消费字节");

        partial.extend_from_slice(&encoded[10..]);
        let DecodeOutcome::Complete(frame) = decode_request_frame(&mut partial).unwrap() else {
            panic!("frame should be complete");
        };
        assert_eq!(frame.id, 7);
        assert_eq!(frame.msg_type, msg_type::FLOW);
        assert_eq!(
            RequestData::decode(frame.msg_type, frame.data).unwrap(),
            request.data
        );
        assert!(partial.is_empty());
    }

    #[test]
    fn two_responses_in_one_buffer_decode_in_sequence() {
        let mut buf = BytesMut::new();
        for id in [2, 1] {
            let response = ClusterResponse::new(
                id,
                msg_type::FLOW,
                TokenResultStatus::Ok,
                ResponseData::Flow {
                    remaining: 5,
                    wait_in_ms: 0,
                },
            );
            encode_response(&response, &mut buf).unwrap();
        }
        let mut ids = Vec::new();
        while let DecodeOutcome::Complete(frame) = decode_response_frame(&mut buf).unwrap() {
            assert_eq!(frame.status, TokenResultStatus::Ok);
            ids.push(frame.id);
        }
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn oversized_length_prefix_is_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN as u32);
        let err = decode_request_frame(&mut buf).unwrap_err();
        assert_eq!(err.code(), "spark.guard.protocol.frame_too_large");
    }

    #[test]
    fn short_header_is_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(&[0, 0, 0]);
        assert!(matches!(
            decode_request_frame(&mut buf),
            Err(ProtocolError::Truncated { field: "header" })
        ));
    }

    #[test]
    fn oversized_payload_is_not_written() {
        let request = ClusterRequest::new(
            1,
            RequestData::BatchFlow {
                flow_ids: (0..9000).collect(),
                count: 1,
                prioritized: false,
            },
        );
        let mut buf = BytesMut::new();
        assert!(encode_request(&request, &mut buf).is_err());
        assert!(buf.is_empty(), "失败时回滚已写入的部分帧");
    }

    #[tokio::test]
    async fn read_frame_reports_clean_eof() {
        let mut encoded = BytesMut::new();
        encode_request(
            &ClusterRequest::new(
                3,
                RequestData::Ping {
                    namespace: "orders".into(),
                },
            ),
            &mut encoded,
        )
        .unwrap();
        let bytes = encoded.freeze();
        let mut reader: &[u8] = &bytes;
        let mut buf = BytesMut::new();

        let frame = read_frame(&mut reader, &mut buf, decode_request_frame)
            .await
            .unwrap()
            .expect("first frame");
        assert_eq!(frame.id, 3);
        assert!(
            read_frame(&mut reader, &mut buf, decode_request_frame)
                .await
                .unwrap()
                .is_none()
        );
    }
}
