//! # token 模块说明
//!
//! ## 角色定位（Why）
//! - 集群模式下，流控与热点参数槽位不在本地判定，而是向令牌服务申请配额；
//! - 令牌服务的契约定义在核心 crate，服务端实现（直接读写配额状态）与 TCP 客户端实现
//!   （远程调用）都实现同一个 [`TokenService`]，槽位无需区分二者。
//!
//! ## 契约（What）
//! - [`TokenResultStatus`] 的数值即线上协议的状态码，不得改动；
//! - 令牌服务内部的任何失败（超时、连接断开、编解码错误）都以 `Fail` 状态表达，
//!   由调用方按规则的回退策略处理，不向槽位抛出错误。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::info;

use crate::resource::ParamValue;

/// 令牌请求结果状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenResultStatus {
    BadRequest,
    TooManyRequest,
    Fail,
    Ok,
    Blocked,
    ShouldWait,
    NoRuleExists,
    NoRefRuleExists,
    NotAvailable,
    ReleaseOk,
    AlreadyRelease,
}

impl TokenResultStatus {
    pub fn code(self) -> i8 {
        match self {
            TokenResultStatus::BadRequest => -4,
            TokenResultStatus::TooManyRequest => -2,
            TokenResultStatus::Fail => -1,
            TokenResultStatus::Ok => 0,
            TokenResultStatus::Blocked => 1,
            TokenResultStatus::ShouldWait => 2,
            TokenResultStatus::NoRuleExists => 3,
            TokenResultStatus::NoRefRuleExists => 4,
            TokenResultStatus::NotAvailable => 5,
            TokenResultStatus::ReleaseOk => 6,
            TokenResultStatus::AlreadyRelease => 7,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            -4 => TokenResultStatus::BadRequest,
            -2 => TokenResultStatus::TooManyRequest,
            -1 => TokenResultStatus::Fail,
            0 => TokenResultStatus::Ok,
            1 => TokenResultStatus::Blocked,
            2 => TokenResultStatus::ShouldWait,
            3 => TokenResultStatus::NoRuleExists,
            4 => TokenResultStatus::NoRefRuleExists,
            5 => TokenResultStatus::NotAvailable,
            6 => TokenResultStatus::ReleaseOk,
            7 => TokenResultStatus::AlreadyRelease,
            _ => return None,
        })
    }

    /// 是否为“服务端给出了明确判定”的状态；其余状态触发客户端回退。
    pub fn is_decisive(self) -> bool {
        matches!(
            self,
            TokenResultStatus::Ok | TokenResultStatus::Blocked | TokenResultStatus::ShouldWait
        )
    }
}

impl fmt::Display for TokenResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.code())
    }
}

/// 令牌请求结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenResult {
    pub status: TokenResultStatus,
    pub remaining: i32,
    pub wait_in_ms: i32,
    pub token_id: i64,
    pub attachments: HashMap<String, String>,
}

impl TokenResult {
    pub fn new(status: TokenResultStatus) -> Self {
        Self {
            status,
            remaining: 0,
            wait_in_ms: 0,
            token_id: 0,
            attachments: HashMap::new(),
        }
    }

    pub fn ok(remaining: i32) -> Self {
        Self {
            remaining,
            ..Self::new(TokenResultStatus::Ok)
        }
    }

    pub fn should_wait(wait_in_ms: i32) -> Self {
        Self {
            wait_in_ms,
            ..Self::new(TokenResultStatus::ShouldWait)
        }
    }

    pub fn blocked() -> Self {
        Self::new(TokenResultStatus::Blocked)
    }

    pub fn fail() -> Self {
        Self::new(TokenResultStatus::Fail)
    }

    pub fn with_token_id(mut self, token_id: i64) -> Self {
        self.token_id = token_id;
        self
    }

    pub fn with_remaining(mut self, remaining: i32) -> Self {
        self.remaining = remaining;
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == TokenResultStatus::Ok
    }
}

/// 批量请求中首个失败的 flow id 在附件中的键。
pub const ATTACHMENT_BLOCK_ID: &str = "block_id";

/// 集群令牌服务契约。
pub trait TokenService: Send + Sync {
    /// 为单条流控规则申请 `acquire_count` 个令牌。
    fn request_token(&self, flow_id: i64, acquire_count: u32, prioritized: bool) -> TokenResult;

    /// 一次性为多条规则申请令牌；遇到首个非 `Ok` 结果即返回，并在附件中注明失败的 flow id。
    fn batch_request_token(
        &self,
        flow_ids: &[i64],
        acquire_count: u32,
        prioritized: bool,
    ) -> TokenResult;

    fn request_param_token(
        &self,
        flow_id: i64,
        acquire_count: u32,
        params: &[ParamValue],
    ) -> TokenResult;

    /// 申请并发租约；成功时 `token_id` 为租约编号。
    fn request_concurrent_token(
        &self,
        client_address: &str,
        flow_id: i64,
        acquire_count: u32,
    ) -> TokenResult;

    fn release_concurrent_token(&self, token_id: i64) -> TokenResult;
}

static SERVICE: OnceLock<RwLock<Option<Arc<dyn TokenService>>>> = OnceLock::new();

fn slot() -> &'static RwLock<Option<Arc<dyn TokenService>>> {
    SERVICE.get_or_init(|| RwLock::new(None))
}

/// 安装进程级令牌服务，返回被替换的旧实例。
pub fn install(service: Arc<dyn TokenService>) -> Option<Arc<dyn TokenService>> {
    info!(target: "spark.guard.core", "cluster token service installed");
    slot().write().replace(service)
}

/// 卸载令牌服务，集群规则随即进入回退路径。
pub fn uninstall() -> Option<Arc<dyn TokenService>> {
    slot().write().take()
}

pub fn service() -> Option<Arc<dyn TokenService>> {
    slot().read().clone()
}
