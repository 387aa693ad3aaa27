//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 区分两类截然不同的失败：**阻断**（预期中的控制流信号，高频、廉价）与
//!   **入口释放错误**（调用方编程错误，必须响亮地失败）；
//! - 为配置与规则加载提供结构化错误，便于上层统一观测。
//!
//! ## 设计要求（What）
//! - [`BlockError`] 不捕获回溯，克隆仅复制两个 `Arc`；
//! - 阻断原因通过开放的 [`BlockReason`] trait 表达，新规则模块可以自定义原因而无需修改枚举；
//! - 每个错误都提供稳定的 `code()`，命名遵循 `spark.guard.*` 前缀。

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::resource::ParamValue;

/// 阻断类别标签。
///
/// 使用新类型包装 `&'static str` 而非封闭枚举：扩展规则模块可以声明自己的常量，
/// 调用方依旧可以按类别匹配。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockKind(&'static str);

impl BlockKind {
    pub const FLOW: Self = Self("flow");
    pub const DEGRADE: Self = Self("degrade");
    pub const SYSTEM: Self = Self("system");
    pub const AUTHORITY: Self = Self("authority");
    pub const PARAM_FLOW: Self = Self("param_flow");

    /// 声明扩展类别。
    pub const fn custom(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// 阻断原因的能力接口。
///
/// # 教案式说明
/// - **意图 (Why)**：阻断是“以错误表达的控制流”，不同规则需要携带不同上下文
///   （命中的规则、被限流的参数值等），同时又要让调用方以统一方式分派；
/// - **契约 (What)**：`kind()`/`code()` 必须为常量语义；`limit_param()` 仅在热点参数类阻断时返回值；
/// - **风险 (Trade-offs)**：实现者应避免在构造时做昂贵操作，阻断路径是高频路径。
pub trait BlockReason: Any + fmt::Debug + fmt::Display + Send + Sync {
    fn kind(&self) -> BlockKind;

    fn code(&self) -> &'static str;

    /// 触发阻断的规则描述。
    fn rule_description(&self) -> Option<String> {
        None
    }

    fn limit_param(&self) -> Option<&ParamValue> {
        None
    }
}

/// 资源被拒绝进入时返回的错误。
#[derive(Clone, Debug, Error)]
#[error("resource `{resource}` blocked: {reason}")]
pub struct BlockError {
    resource: Arc<str>,
    reason: Arc<dyn BlockReason>,
}

impl BlockError {
    pub fn new(resource: impl Into<Arc<str>>, reason: impl BlockReason) -> Self {
        Self {
            resource: resource.into(),
            reason: Arc::new(reason),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn kind(&self) -> BlockKind {
        self.reason.kind()
    }

    pub fn code(&self) -> &'static str {
        self.reason.code()
    }

    pub fn reason(&self) -> &dyn BlockReason {
        self.reason.as_ref()
    }

    pub fn limit_param(&self) -> Option<&ParamValue> {
        self.reason.limit_param()
    }

    /// 将原因向下转型为具体类型，便于读取规则细节。
    pub fn downcast_ref<T: BlockReason>(&self) -> Option<&T> {
        let any: &dyn Any = self.reason.as_ref();
        any.downcast_ref::<T>()
    }
}

/// 入口退出阶段的编程错误。
///
/// 这类错误永远意味着调用方 Bug：框架在返回前已经把上下文恢复到一致状态。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EntryExitError {
    /// 退出的入口并非上下文当前入口，入口/退出配对被破坏。
    #[error(
        "entry for `{resource}` exited out of order (current entry: {current:?}); the call tree was reset"
    )]
    ErrorEntryFree {
        resource: String,
        current: Option<String>,
    },

    /// 异步上下文只能初始化一次。
    #[error("async context of `{resource}` is already initialized")]
    AsyncContextAlreadyInitialized { resource: String },
}

impl EntryExitError {
    pub fn code(&self) -> &'static str {
        match self {
            EntryExitError::ErrorEntryFree { .. } => "spark.guard.entry.free_mismatch",
            EntryExitError::AsyncContextAlreadyInitialized { .. } => {
                "spark.guard.entry.async_context_reinit"
            }
        }
    }
}

/// 规则校验失败。
#[derive(Clone, Debug, Error, PartialEq)]
#[error("invalid {kind} rule for `{resource}`: {detail}")]
pub struct RuleError {
    pub kind: BlockKind,
    pub resource: String,
    pub detail: String,
}

impl RuleError {
    pub fn new(kind: BlockKind, resource: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            resource: resource.into(),
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        "spark.guard.rule.invalid"
    }
}

/// 配置加载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config field `{field}`: {detail}")]
    Invalid { field: &'static str, detail: String },

    #[error(transparent)]
    Rule(#[from] RuleError),

    /// 进程级引擎已初始化，配置不可再替换。
    #[error("engine is already initialized")]
    AlreadyInitialized,
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "spark.guard.config.io",
            ConfigError::Parse(_) => "spark.guard.config.parse",
            ConfigError::Invalid { .. } => "spark.guard.config.invalid",
            ConfigError::Rule(_) => "spark.guard.config.rule",
            ConfigError::AlreadyInitialized => "spark.guard.config.already_initialized",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct QuotaExhausted;

    impl fmt::Display for QuotaExhausted {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("quota exhausted")
        }
    }

    impl BlockReason for QuotaExhausted {
        fn kind(&self) -> BlockKind {
            BlockKind::custom("quota")
        }

        fn code(&self) -> &'static str {
            "test.block.quota"
        }
    }

    #[test]
    fn custom_reason_is_dispatchable_without_closed_enum() {
        let err = BlockError::new("billing", QuotaExhausted);
        assert_eq!(err.kind(), BlockKind::custom("quota"));
        assert_eq!(err.code(), "test.block.quota");
        assert!(err.downcast_ref::<QuotaExhausted>().is_some());
        assert_eq!(err.to_string(), "resource `billing` blocked: quota exhausted");
    }
}
