//! 流控规则。
//!
//! # 教案式注释
//! - **意图 (Why)**：限制资源的通过 QPS 或并发数；集群模式下把配额决策交给令牌服务，
//!   使多个实例共享同一个总阈值；
//! - **逻辑 (How)**：
//!   1. 直接拒绝：`当前值 + 本次权重 > 阈值` 即阻断；
//!   2. 匀速排队：按 `1000 / 阈值` 的间隔放行，预计等待不超过 `max_queueing_time_ms` 时休眠后放行；
//!   3. 集群模式：`Ok` 放行、`ShouldWait` 休眠后放行、`Blocked` 阻断，其余状态按
//!      `fallback_to_local_when_fail` 退化为本地判定或直接放行；
//! - **契约 (What)**：按 `limit_app` 选择统计节点，`default` 读取资源节点，其余读取来源节点；
//!   节点缺失时放行。

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ClusterFlowConfig, ClusterVerdict, LIMIT_APP_DEFAULT, Rule, RuleSet, apply_token_result,
    limit_app_applies, validate_all,
};
use crate::clock::current_time_millis;
use crate::error::{BlockError, BlockKind, BlockReason, RuleError};
use crate::node::StatisticNode;
use crate::slot::{ProcessorSlot, SlotContext};
use crate::token;

/// 流控维度。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowGrade {
    Thread,
    #[default]
    Qps,
}

/// 超出阈值后的处理方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlBehavior {
    #[default]
    Reject,
    RateLimiter { max_queueing_time_ms: u64 },
}

fn default_limit_app() -> String {
    LIMIT_APP_DEFAULT.to_owned()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowRule {
    pub resource: String,
    #[serde(default = "default_limit_app")]
    pub limit_app: String,
    #[serde(default)]
    pub grade: FlowGrade,
    pub count: f64,
    #[serde(default)]
    pub control_behavior: ControlBehavior,
    #[serde(default)]
    pub cluster_mode: bool,
    #[serde(default)]
    pub cluster_config: Option<ClusterFlowConfig>,
}

impl FlowRule {
    /// QPS 直接拒绝规则。
    pub fn new(resource: impl Into<String>, count: f64) -> Self {
        Self {
            resource: resource.into(),
            limit_app: default_limit_app(),
            grade: FlowGrade::Qps,
            count,
            control_behavior: ControlBehavior::Reject,
            cluster_mode: false,
            cluster_config: None,
        }
    }

    pub fn with_grade(mut self, grade: FlowGrade) -> Self {
        self.grade = grade;
        self
    }

    pub fn with_limit_app(mut self, limit_app: impl Into<String>) -> Self {
        self.limit_app = limit_app.into();
        self
    }

    pub fn with_control_behavior(mut self, behavior: ControlBehavior) -> Self {
        self.control_behavior = behavior;
        self
    }

    pub fn with_cluster(mut self, config: ClusterFlowConfig) -> Self {
        self.cluster_mode = true;
        self.cluster_config = Some(config);
        self
    }
}

impl Rule for FlowRule {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn validate(&self) -> Result<(), RuleError> {
        let invalid = |detail: &str| RuleError::new(BlockKind::FLOW, &self.resource, detail);
        if self.resource.is_empty() {
            return Err(invalid("resource must not be empty"));
        }
        if !self.count.is_finite() || self.count < 0.0 {
            return Err(invalid("count must be a non-negative number"));
        }
        if self.limit_app.is_empty() {
            return Err(invalid("limit_app must not be empty"));
        }
        if matches!(self.control_behavior, ControlBehavior::RateLimiter { .. })
            && self.grade != FlowGrade::Qps
        {
            return Err(invalid("rate limiter behavior requires the qps grade"));
        }
        if self.cluster_mode && self.cluster_config.is_none() {
            return Err(invalid("cluster mode requires cluster_config"));
        }
        Ok(())
    }
}

/// 流控阻断原因。
#[derive(Clone, Debug)]
pub struct FlowBlocked {
    pub rule: FlowRule,
}

impl fmt::Display for FlowBlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flow limit {:?} {} exceeded (limit_app: {})",
            self.rule.grade, self.rule.count, self.rule.limit_app
        )
    }
}

impl BlockReason for FlowBlocked {
    fn kind(&self) -> BlockKind {
        BlockKind::FLOW
    }

    fn code(&self) -> &'static str {
        "spark.guard.block.flow"
    }

    fn rule_description(&self) -> Option<String> {
        Some(format!("{:?}", self.rule))
    }
}

/// 规则及其运行态。
#[derive(Debug)]
pub(crate) struct FlowController {
    rule: FlowRule,
    latest_passed_time: AtomicI64,
}

impl FlowController {
    fn new(rule: FlowRule) -> Self {
        Self {
            rule,
            latest_passed_time: AtomicI64::new(-1),
        }
    }

    fn can_pass(&self, ctx: &SlotContext<'_>) -> bool {
        if self.rule.cluster_mode
            && let Some(config) = &self.rule.cluster_config
        {
            return self.pass_cluster(ctx, config);
        }
        self.pass_local(ctx)
    }

    fn pass_cluster(&self, ctx: &SlotContext<'_>, config: &ClusterFlowConfig) -> bool {
        let verdict = match token::service() {
            Some(service) => {
                let result = service.request_token(config.flow_id, ctx.count(), ctx.prioritized());
                apply_token_result(&result)
            }
            None => ClusterVerdict::Fallback,
        };
        match verdict {
            ClusterVerdict::Pass => true,
            ClusterVerdict::Block => false,
            ClusterVerdict::Fallback => {
                debug!(
                    target: "spark.guard.core",
                    resource = ctx.resource().name(),
                    flow_id = config.flow_id,
                    to_local = config.fallback_to_local_when_fail,
                    "cluster token unavailable, applying fallback"
                );
                if config.fallback_to_local_when_fail {
                    self.pass_local(ctx)
                } else {
                    true
                }
            }
        }
    }

    fn select_node<'a>(&self, ctx: &'a SlotContext<'_>) -> Option<&'a StatisticNode> {
        if self.rule.limit_app == LIMIT_APP_DEFAULT {
            ctx.cur_node().map(|node| node.stat())
        } else {
            ctx.origin_node().map(|node| node.as_ref())
        }
    }

    fn pass_local(&self, ctx: &SlotContext<'_>) -> bool {
        let Some(node) = self.select_node(ctx) else {
            return true;
        };
        match self.rule.control_behavior {
            ControlBehavior::Reject => {
                let current = match self.rule.grade {
                    FlowGrade::Qps => node.pass_qps(),
                    FlowGrade::Thread => node.cur_thread_num() as f64,
                };
                current + f64::from(ctx.count()) <= self.rule.count
            }
            ControlBehavior::RateLimiter {
                max_queueing_time_ms,
            } => self.pass_rate_limited(ctx.count(), max_queueing_time_ms as i64),
        }
    }

    fn pass_rate_limited(&self, acquire: u32, max_queueing_ms: i64) -> bool {
        if acquire == 0 {
            return true;
        }
        if self.rule.count <= 0.0 {
            return false;
        }
        let cost = (f64::from(acquire) / self.rule.count * 1000.0).round() as i64;
        let now = current_time_millis();
        let latest = self.latest_passed_time.load(Ordering::Acquire);
        if latest < 0 || latest + cost <= now {
            self.latest_passed_time.store(now, Ordering::Release);
            return true;
        }
        if latest + cost - now > max_queueing_ms {
            return false;
        }
        let expected = self.latest_passed_time.fetch_add(cost, Ordering::AcqRel) + cost;
        let wait = expected - current_time_millis();
        if wait > max_queueing_ms {
            self.latest_passed_time.fetch_sub(cost, Ordering::AcqRel);
            return false;
        }
        if wait > 0 {
            std::thread::sleep(Duration::from_millis(wait as u64));
        }
        true
    }
}

/// 流控规则管理器。
#[derive(Debug, Default)]
pub struct FlowRuleManager {
    rules: RuleSet<FlowController>,
}

impl FlowRuleManager {
    /// 校验并整体替换规则；校验失败时保留旧规则。
    pub fn load_rules(&self, rules: Vec<FlowRule>) -> Result<(), RuleError> {
        validate_all(&rules)?;
        let count = rules.len();
        self.rules.replace(
            rules
                .into_iter()
                .map(|rule| (Arc::from(rule.resource.as_str()), FlowController::new(rule))),
        );
        debug!(target: "spark.guard.core", rules = count, "flow rules loaded");
        Ok(())
    }

    pub fn get_rules(&self) -> Vec<FlowRule> {
        self.rules.all().iter().map(|c| c.rule.clone()).collect()
    }

    pub fn rules_for(&self, resource: &str) -> Vec<FlowRule> {
        self.rules
            .rules_for(resource)
            .map(|items| items.iter().map(|c| c.rule.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_rules(&self, resource: &str) -> bool {
        self.rules.has_rules(resource)
    }

    fn check(&self, ctx: &SlotContext<'_>) -> Result<(), BlockError> {
        let Some(controllers) = self.rules.rules_for(ctx.resource().name()) else {
            return Ok(());
        };
        let origin = ctx.origin();
        let has_specific =
            !origin.is_empty() && controllers.iter().any(|c| c.rule.limit_app == origin);
        for controller in controllers.iter() {
            if !limit_app_applies(&controller.rule.limit_app, origin, has_specific) {
                continue;
            }
            if !controller.can_pass(ctx) {
                return Err(BlockError::new(
                    Arc::clone(ctx.resource().name_arc()),
                    FlowBlocked {
                        rule: controller.rule.clone(),
                    },
                ));
            }
        }
        Ok(())
    }
}

static MANAGER: OnceLock<FlowRuleManager> = OnceLock::new();

pub fn manager() -> &'static FlowRuleManager {
    MANAGER.get_or_init(FlowRuleManager::default)
}

pub fn load_rules(rules: Vec<FlowRule>) -> Result<(), RuleError> {
    manager().load_rules(rules)
}

/// 流控槽位。
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowSlot;

impl FlowSlot {
    pub const ORDER: i32 = -2_000;
}

impl ProcessorSlot for FlowSlot {
    fn name(&self) -> &'static str {
        "flow"
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn entry(&self, ctx: &SlotContext<'_>) -> Result<(), BlockError> {
        manager().check(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_rules_and_keeps_previous_set() {
        let manager = FlowRuleManager::default();
        manager
            .load_rules(vec![FlowRule::new("flow-keep", 5.0)])
            .unwrap();

        let err = manager
            .load_rules(vec![
                FlowRule::new("flow-keep", 1.0),
                FlowRule::new("flow-bad", -1.0),
            ])
            .unwrap_err();
        assert_eq!(err.code(), "spark.guard.rule.invalid");
        assert_eq!(manager.rules_for("flow-keep")[0].count, 5.0, "校验失败不得替换旧规则");
    }

    #[test]
    fn rate_limiter_requires_qps_grade() {
        let rule = FlowRule::new("flow-rl", 10.0)
            .with_grade(FlowGrade::Thread)
            .with_control_behavior(ControlBehavior::RateLimiter {
                max_queueing_time_ms: 100,
            });
        assert!(rule.validate().is_err());
    }

    #[test]
    fn rate_limiter_spaces_requests() {
        let controller = FlowController::new(FlowRule::new("flow-spacing", 10.0));
        assert!(controller.pass_rate_limited(1, 0));
        // 10 QPS 意味着 100 ms 间隔，不允许排队时紧随其后的请求被拒绝。
        assert!(!controller.pass_rate_limited(1, 0));
        assert!(controller.pass_rate_limited(1, 500));
    }

    #[test]
    fn deserializes_from_toml() {
        let rule: FlowRule = toml::from_str(
            r#"
            resource = "orders"
            count = 20.0
            control_behavior = { kind = "rate_limiter", max_queueing_time_ms = 500 }
            cluster_mode = true
            cluster_config = { flow_id = 7, threshold_type = "global" }
            "#,
        )
        .unwrap();
        assert_eq!(rule.limit_app, LIMIT_APP_DEFAULT);
        assert_eq!(
            rule.control_behavior,
            ControlBehavior::RateLimiter {
                max_queueing_time_ms: 500
            }
        );
        assert!(rule.validate().is_ok());
        let config = rule.cluster_config.expect("cluster config");
        assert_eq!(config.flow_id, 7);
        assert!(config.fallback_to_local_when_fail);
    }
}
