//! # rule 模块说明
//!
//! ## 核心意图（Why）
//! - 每类规则由“规则定义 + 规则管理器 + 检查槽位”三部分组成：定义可由 `serde` 反序列化，
//!   管理器以 `ArcSwap` 持有按资源分组的只读快照，槽位在热路径上无锁读取；
//! - 规则替换是整体原子替换：`load_rules` 先校验全部规则，任一失败则保持旧快照不变。
//!
//! ## 模块组成（What）
//! - [`flow`]：QPS/并发数流控，支持匀速排队与集群模式；
//! - [`authority`]：来源黑白名单；
//! - [`degrade`]：慢调用比例/异常比例/异常数熔断；
//! - [`system`]：基于全局入站流量的系统保护；
//! - [`param`]：热点参数限流，支持集群模式。

pub mod authority;
pub mod degrade;
pub mod flow;
pub mod param;
pub mod system;

pub use authority::{AuthorityRule, AuthoritySlot, AuthorityStrategy};
pub use degrade::{CircuitState, DegradeGrade, DegradeRule, DegradeSlot};
pub use flow::{ControlBehavior, FlowGrade, FlowRule, FlowSlot};
pub use param::{ParamFlowItem, ParamFlowRule, ParamFlowSlot};
pub use system::{SystemRule, SystemSlot};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::token::{TokenResult, TokenResultStatus};

/// 规则的 `limit_app` 缺省值：对所有来源生效。
pub const LIMIT_APP_DEFAULT: &str = "default";
/// `limit_app` 取该值时，仅对没有专属规则的来源生效。
pub const LIMIT_APP_OTHER: &str = "other";

/// 所有规则定义的公共能力。
pub trait Rule: Clone + fmt::Debug + Send + Sync + 'static {
    fn resource(&self) -> &str;

    fn validate(&self) -> Result<(), RuleError>;
}

/// 按资源分组的规则快照。
///
/// `T` 通常是“规则 + 运行态”的组合（如匀速排队的上次通过时间、熔断器状态），
/// 每次 `replace` 都会重建运行态。
pub struct RuleSet<T> {
    by_resource: ArcSwap<HashMap<Arc<str>, Arc<[Arc<T>]>>>,
}

impl<T> Default for RuleSet<T> {
    fn default() -> Self {
        Self {
            by_resource: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl<T> RuleSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以新的条目整体替换快照；条目按出现顺序分组。
    pub fn replace(&self, items: impl IntoIterator<Item = (Arc<str>, T)>) {
        let mut grouped: HashMap<Arc<str>, Vec<Arc<T>>> = HashMap::new();
        for (resource, item) in items {
            grouped.entry(resource).or_default().push(Arc::new(item));
        }
        let next = grouped
            .into_iter()
            .map(|(resource, items)| (resource, Arc::from(items)))
            .collect();
        self.by_resource.store(Arc::new(next));
    }

    pub fn rules_for(&self, resource: &str) -> Option<Arc<[Arc<T>]>> {
        self.by_resource.load().get(resource).cloned()
    }

    pub fn has_rules(&self, resource: &str) -> bool {
        self.by_resource.load().contains_key(resource)
    }

    pub fn all(&self) -> Vec<Arc<T>> {
        self.by_resource
            .load()
            .values()
            .flat_map(|items| items.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_resource.load().values().map(|items| items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_resource.load().is_empty()
    }
}

impl<T> fmt::Debug for RuleSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSet").field("len", &self.len()).finish()
    }
}

pub(crate) fn validate_all<R: Rule>(rules: &[R]) -> Result<(), RuleError> {
    rules.iter().try_for_each(|rule| rule.validate())
}

/// 集群阈值的解释方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterThresholdType {
    /// 单机均摊：总阈值 = 规则阈值 × 已连接客户端数。
    #[default]
    AvgLocal,
    /// 全局阈值：规则阈值即集群总阈值。
    Global,
}

/// 集群规则的附加配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterFlowConfig {
    /// 全局唯一的规则编号，客户端与服务端据此对齐。
    pub flow_id: i64,
    pub threshold_type: ClusterThresholdType,
    /// 令牌服务不可用时是否退化为本地判定；否则直接放行。
    pub fallback_to_local_when_fail: bool,
    /// 并发租约的存活时间（毫秒），超时未释放的租约由服务端回收。
    pub resource_timeout_ms: u64,
}

impl Default for ClusterFlowConfig {
    fn default() -> Self {
        Self {
            flow_id: 0,
            threshold_type: ClusterThresholdType::AvgLocal,
            fallback_to_local_when_fail: true,
            resource_timeout_ms: 2000,
        }
    }
}

/// 集群判定的本地处理结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClusterVerdict {
    Pass,
    Block,
    Fallback,
}

/// 把令牌结果映射为本地处理方式；`ShouldWait` 在此处休眠后放行。
pub(crate) fn apply_token_result(result: &TokenResult) -> ClusterVerdict {
    match result.status {
        TokenResultStatus::Ok => ClusterVerdict::Pass,
        TokenResultStatus::ShouldWait => {
            if result.wait_in_ms > 0 {
                std::thread::sleep(Duration::from_millis(result.wait_in_ms as u64));
            }
            ClusterVerdict::Pass
        }
        TokenResultStatus::Blocked => ClusterVerdict::Block,
        _ => ClusterVerdict::Fallback,
    }
}

/// 判断规则的 `limit_app` 是否覆盖当前来源。
///
/// `has_specific` 用于 `other` 语义：来源已有专属规则时，`other` 规则不再适用。
pub(crate) fn limit_app_applies(limit_app: &str, origin: &str, has_specific: bool) -> bool {
    match limit_app {
        LIMIT_APP_DEFAULT => true,
        LIMIT_APP_OTHER => !origin.is_empty() && !has_specific,
        specific => specific == origin,
    }
}
