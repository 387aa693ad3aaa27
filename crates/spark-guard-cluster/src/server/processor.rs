//! 请求处理器注册表。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 每种消息类型对应一个处理器；新增消息类型只需实现 [`RequestProcessor`] 并登记，
//!   连接层的读循环不随之改动。
//!
//! ## 逻辑 (How)
//! - 注册表是进程级的 `HashMap<u8, Arc<dyn RequestProcessor>>`，首次使用时构建，此后只读；
//! - [`dispatch`] 先按类型查处理器，再解析载荷，最后调用处理器；
//!   任何一步失败都以 `BAD_REQUEST` 回复同一编号，不触碰配额状态。
//!
//! ## 契约 (What)
//! - 线上计数字段为 `i32`，非正数视为非法请求；
//! - 响应的 `id` 与 `msg_type` 始终取自请求。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use spark_guard_core::{TokenResult, TokenResultStatus, TokenService};
use tracing::debug;

use super::token_service::DefaultTokenService;
use crate::protocol::{ClusterRequest, ClusterResponse, RequestData, ResponseData, msg_type};

/// 处理一次请求所需的环境。
#[derive(Clone, Copy, Debug)]
pub struct RequestContext<'a> {
    pub service: &'a DefaultTokenService,
    /// 对端地址，用于命名空间登记与租约归属。
    pub peer: &'a str,
}

/// 处理器的判定结果。
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub status: TokenResultStatus,
    pub data: ResponseData,
}

impl Reply {
    pub fn status(status: TokenResultStatus) -> Self {
        Self {
            status,
            data: ResponseData::Empty,
        }
    }

    pub fn bad_request() -> Self {
        Self::status(TokenResultStatus::BadRequest)
    }

    fn from_token_result(tag: u8, result: TokenResult) -> Self {
        Self {
            status: result.status,
            data: ResponseData::from_token_result(tag, &result),
        }
    }
}

pub trait RequestProcessor: Send + Sync {
    fn msg_type(&self) -> u8;

    fn process(&self, ctx: &RequestContext<'_>, data: RequestData) -> Reply;
}

fn positive(count: i32) -> Option<u32> {
    u32::try_from(count).ok().filter(|count| *count > 0)
}

struct PingProcessor;

impl RequestProcessor for PingProcessor {
    fn msg_type(&self) -> u8 {
        msg_type::PING
    }

    fn process(&self, ctx: &RequestContext<'_>, data: RequestData) -> Reply {
        let RequestData::Ping { namespace } = data else {
            return Reply::bad_request();
        };
        if namespace.is_empty() {
            return Reply::bad_request();
        }
        let connected = ctx.service.connections().add(&namespace, ctx.peer);
        Reply {
            status: TokenResultStatus::Ok,
            data: ResponseData::Ping {
                connected: i32::try_from(connected).unwrap_or(i32::MAX),
            },
        }
    }
}

struct FlowProcessor;

impl RequestProcessor for FlowProcessor {
    fn msg_type(&self) -> u8 {
        msg_type::FLOW
    }

    fn process(&self, ctx: &RequestContext<'_>, data: RequestData) -> Reply {
        let RequestData::Flow {
            flow_id,
            count,
            prioritized,
        } = data
        else {
            return Reply::bad_request();
        };
        let Some(count) = positive(count) else {
            return Reply::bad_request();
        };
        let result = ctx.service.request_token(flow_id, count, prioritized);
        Reply::from_token_result(self.msg_type(), result)
    }
}

struct BatchFlowProcessor;

impl RequestProcessor for BatchFlowProcessor {
    fn msg_type(&self) -> u8 {
        msg_type::BATCH_FLOW
    }

    fn process(&self, ctx: &RequestContext<'_>, data: RequestData) -> Reply {
        let RequestData::BatchFlow {
            flow_ids,
            count,
            prioritized,
        } = data
        else {
            return Reply::bad_request();
        };
        let Some(count) = positive(count) else {
            return Reply::bad_request();
        };
        let result = ctx.service.batch_request_token(&flow_ids, count, prioritized);
        Reply::from_token_result(self.msg_type(), result)
    }
}

struct ParamFlowProcessor;

impl RequestProcessor for ParamFlowProcessor {
    fn msg_type(&self) -> u8 {
        msg_type::PARAM_FLOW
    }

    fn process(&self, ctx: &RequestContext<'_>, data: RequestData) -> Reply {
        let RequestData::ParamFlow {
            flow_id,
            count,
            params,
        } = data
        else {
            return Reply::bad_request();
        };
        let Some(count) = positive(count) else {
            return Reply::bad_request();
        };
        let result = ctx.service.request_param_token(flow_id, count, &params);
        Reply::from_token_result(self.msg_type(), result)
    }
}

struct ConcurrentAcquireProcessor;

impl RequestProcessor for ConcurrentAcquireProcessor {
    fn msg_type(&self) -> u8 {
        msg_type::CONCURRENT_FLOW_ACQUIRE
    }

    fn process(&self, ctx: &RequestContext<'_>, data: RequestData) -> Reply {
        let RequestData::ConcurrentAcquire { flow_id, count } = data else {
            return Reply::bad_request();
        };
        let Some(count) = positive(count) else {
            return Reply::bad_request();
        };
        let result = ctx
            .service
            .request_concurrent_token(ctx.peer, flow_id, count);
        Reply::from_token_result(self.msg_type(), result)
    }
}

struct ConcurrentReleaseProcessor;

impl RequestProcessor for ConcurrentReleaseProcessor {
    fn msg_type(&self) -> u8 {
        msg_type::CONCURRENT_FLOW_RELEASE
    }

    fn process(&self, ctx: &RequestContext<'_>, data: RequestData) -> Reply {
        let RequestData::ConcurrentRelease { token_id } = data else {
            return Reply::bad_request();
        };
        let result = ctx.service.release_concurrent_token(token_id);
        Reply::from_token_result(self.msg_type(), result)
    }
}

type ProcessorTable = HashMap<u8, Arc<dyn RequestProcessor>>;

static PROCESSORS: OnceLock<ProcessorTable> = OnceLock::new();

/// 进程级处理器注册表。
pub fn processors() -> &'static ProcessorTable {
    PROCESSORS.get_or_init(|| {
        let all: [Arc<dyn RequestProcessor>; 6] = [
            Arc::new(PingProcessor),
            Arc::new(FlowProcessor),
            Arc::new(BatchFlowProcessor),
            Arc::new(ParamFlowProcessor),
            Arc::new(ConcurrentAcquireProcessor),
            Arc::new(ConcurrentReleaseProcessor),
        ];
        all.into_iter()
            .map(|processor| (processor.msg_type(), processor))
            .collect()
    })
}

/// 把一帧请求交给对应处理器，并组装同编号的响应。
pub fn dispatch(
    ctx: &RequestContext<'_>,
    request: ClusterRequest<Bytes>,
) -> ClusterResponse<ResponseData> {
    let ClusterRequest { id, msg_type, data } = request;
    let Some(processor) = processors().get(&msg_type) else {
        debug!(
            target: "spark.guard.cluster.server",
            id,
            msg_type,
            peer = ctx.peer,
            "no processor for message type"
        );
        return ClusterResponse::status_only(id, msg_type, TokenResultStatus::BadRequest);
    };
    let reply = match RequestData::decode(msg_type, data) {
        Ok(data) => processor.process(ctx, data),
        Err(err) => {
            debug!(
                target: "spark.guard.cluster.server",
                id,
                msg_type,
                peer = ctx.peer,
                code = err.code(),
                error = %err,
                "malformed request payload"
            );
            Reply::bad_request()
        }
    };
    ClusterResponse::new(id, msg_type, reply.status, reply.data)
}
