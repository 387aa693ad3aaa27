//! 令牌服务端配置。
//!
//! # 教案式注释
//! - **意图 (Why)**：服务端的监听地址、自我保护阈值、统计窗口与集群规则都来自同一份 TOML，
//!   二进制只需 `--config <path>` 即可启动；
//! - **契约 (What)**：
//!   - 缺省字段取默认值：监听 `0.0.0.0:18730`、每秒最多处理 30000 个请求、空闲 600 秒断开、
//!     租约回收间隔 1000 ms、窗口 10 个样本 / 1000 ms、借用比例 1.0；
//!   - 规则以 `[[flow_rules]]` / `[[param_rules]]` 数组内联书写，`namespace` 缺省为 `default`，
//!     其余字段与本地规则完全一致；
//! - **风险 (Trade-offs)**：配置只在启动时读取，运行期改规则需调用
//!   [`ClusterRules`](super::rules::ClusterRules) 的加载接口。

use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spark_guard_core::rule::{FlowRule, ParamFlowRule};

use crate::error::ServerConfigError;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_PORT: u16 = 18730;

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_owned()
}

/// 归属某个命名空间的集群流控规则。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamespacedFlowRule {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(flatten)]
    pub rule: FlowRule,
}

impl NamespacedFlowRule {
    pub fn new(namespace: impl Into<String>, rule: FlowRule) -> Self {
        Self {
            namespace: namespace.into(),
            rule,
        }
    }
}

/// 归属某个命名空间的集群热点参数规则。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamespacedParamRule {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(flatten)]
    pub rule: ParamFlowRule,
}

impl NamespacedParamRule {
    pub fn new(namespace: impl Into<String>, rule: ParamFlowRule) -> Self {
        Self {
            namespace: namespace.into(),
            rule,
        }
    }
}

/// 服务端配额统计窗口。
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub sample_count: u32,
    pub interval_ms: u32,
    /// 优先请求可借用下一窗口的额度占阈值的比例。
    pub max_occupy_ratio: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            sample_count: 10,
            interval_ms: 1000,
            max_occupy_ratio: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// 服务端自身每秒可处理的请求数，超出部分直接回复 `TOO_MANY_REQUEST`。
    pub max_allowed_qps: u32,
    pub idle_seconds: u64,
    pub reap_interval_ms: u64,
    pub quota: QuotaConfig,
    /// 预先登记的命名空间；客户端也可以通过 PING 声明新的命名空间。
    pub namespaces: Vec<String>,
    pub flow_rules: Vec<NamespacedFlowRule>,
    pub param_rules: Vec<NamespacedParamRule>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_allowed_qps: 30_000,
            idle_seconds: 600,
            reap_interval_ms: 1000,
            quota: QuotaConfig::default(),
            namespaces: vec![default_namespace()],
            flow_rules: Vec::new(),
            param_rules: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ServerConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ServerConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ServerConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ServerConfigError> {
        let invalid = |field, detail: &str| ServerConfigError::Invalid {
            field,
            detail: detail.to_owned(),
        };
        if self.bind.is_empty() {
            return Err(invalid("bind", "must not be empty"));
        }
        if self.max_allowed_qps == 0 {
            return Err(invalid("max_allowed_qps", "must be positive"));
        }
        if self.idle_seconds == 0 {
            return Err(invalid("idle_seconds", "must be positive"));
        }
        if self.reap_interval_ms == 0 {
            return Err(invalid("reap_interval_ms", "must be positive"));
        }
        let quota = self.quota;
        if quota.sample_count == 0 || quota.interval_ms % quota.sample_count != 0 {
            return Err(invalid(
                "quota.interval_ms",
                "must be divisible by a positive sample_count",
            ));
        }
        if !quota.max_occupy_ratio.is_finite() || quota.max_occupy_ratio < 0.0 {
            return Err(invalid("quota.max_occupy_ratio", "must be a non-negative number"));
        }
        Ok(())
    }

    pub fn max_allowed_qps(&self) -> NonZeroU32 {
        NonZeroU32::new(self.max_allowed_qps).unwrap_or(NonZeroU32::MIN)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_seconds)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}
