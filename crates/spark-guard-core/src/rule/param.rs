//! 热点参数限流。
//!
//! # 教案式注释
//! - **意图 (Why)**：同一资源下，个别参数值（热点商品、热点用户）可能独占大部分流量，
//!   需要按参数值分别计数与限流；
//! - **逻辑 (How)**：规则按 `param_idx` 取出调用参数（负数表示从末尾倒数），
//!   每个参数值拥有独立的定长窗口计数器；先计数再比较，超限时回退本次计数并阻断；
//!   后续槽位阻断时，`on_entry_blocked` 回退本槽位已记入的计数；
//! - **契约 (What)**：参数缺失时放行；`item_thresholds` 为特定值覆盖阈值；
//!   集群模式通过 `request_param_token` 向令牌服务申请；
//! - **风险 (Trade-offs)**：每条规则最多跟踪 [`MAX_TRACKED_VALUES`] 个参数值，超出后的新值不受限。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ClusterFlowConfig, ClusterVerdict, Rule, RuleSet, apply_token_result, validate_all};
use crate::clock::current_time_millis;
use crate::error::{BlockError, BlockKind, BlockReason, RuleError};
use crate::node::{MetricEvent, WindowCounter};
use crate::resource::ParamValue;
use crate::slot::{ProcessorSlot, SlotContext};
use crate::token;

/// 单条规则跟踪的参数值上限。
pub const MAX_TRACKED_VALUES: usize = 4000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamFlowItem {
    pub value: ParamValue,
    pub count: f64,
}

fn default_duration_s() -> u32 {
    1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamFlowRule {
    pub resource: String,
    pub param_idx: i32,
    pub count: f64,
    #[serde(default = "default_duration_s")]
    pub duration_s: u32,
    #[serde(default)]
    pub item_thresholds: Vec<ParamFlowItem>,
    #[serde(default)]
    pub cluster_mode: bool,
    #[serde(default)]
    pub cluster_config: Option<ClusterFlowConfig>,
}

impl ParamFlowRule {
    pub fn new(resource: impl Into<String>, param_idx: i32, count: f64) -> Self {
        Self {
            resource: resource.into(),
            param_idx,
            count,
            duration_s: default_duration_s(),
            item_thresholds: Vec::new(),
            cluster_mode: false,
            cluster_config: None,
        }
    }

    pub fn with_item(mut self, value: impl Into<ParamValue>, count: f64) -> Self {
        self.item_thresholds.push(ParamFlowItem {
            value: value.into(),
            count,
        });
        self
    }

    pub fn with_duration_s(mut self, duration_s: u32) -> Self {
        self.duration_s = duration_s;
        self
    }

    pub fn with_cluster(mut self, config: ClusterFlowConfig) -> Self {
        self.cluster_mode = true;
        self.cluster_config = Some(config);
        self
    }

    /// 按 `param_idx` 取出参数值。
    pub fn extract<'a>(&self, args: &'a [ParamValue]) -> Option<&'a ParamValue> {
        let idx = if self.param_idx < 0 {
            args.len().checked_sub(self.param_idx.unsigned_abs() as usize)?
        } else {
            self.param_idx as usize
        };
        args.get(idx)
    }
}

impl Rule for ParamFlowRule {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn validate(&self) -> Result<(), RuleError> {
        let invalid =
            |detail: &str| RuleError::new(BlockKind::PARAM_FLOW, &self.resource, detail);
        if self.resource.is_empty() {
            return Err(invalid("resource must not be empty"));
        }
        let bad = |count: f64| !count.is_finite() || count < 0.0;
        if bad(self.count) || self.item_thresholds.iter().any(|item| bad(item.count)) {
            return Err(invalid("thresholds must be non-negative numbers"));
        }
        if self.duration_s == 0 {
            return Err(invalid("duration_s must be positive"));
        }
        if self.cluster_mode && self.cluster_config.is_none() {
            return Err(invalid("cluster mode requires cluster_config"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ParamFlowBlocked {
    pub rule: ParamFlowRule,
    pub value: ParamValue,
}

impl fmt::Display for ParamFlowBlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hot parameter `{}` at index {} exceeded its limit",
            self.value, self.rule.param_idx
        )
    }
}

impl BlockReason for ParamFlowBlocked {
    fn kind(&self) -> BlockKind {
        BlockKind::PARAM_FLOW
    }

    fn code(&self) -> &'static str {
        "spark.guard.block.param_flow"
    }

    fn rule_description(&self) -> Option<String> {
        Some(format!("{:?}", self.rule))
    }

    fn limit_param(&self) -> Option<&ParamValue> {
        Some(&self.value)
    }
}

#[derive(Debug)]
pub(crate) struct ParamController {
    rule: ParamFlowRule,
    thresholds: HashMap<ParamValue, f64>,
    counters: DashMap<ParamValue, Arc<WindowCounter>>,
}

impl ParamController {
    fn new(rule: ParamFlowRule) -> Self {
        let thresholds = rule
            .item_thresholds
            .iter()
            .map(|item| (item.value.clone(), item.count))
            .collect();
        Self {
            rule,
            thresholds,
            counters: DashMap::new(),
        }
    }

    fn threshold_for(&self, value: &ParamValue) -> f64 {
        self.thresholds
            .get(value)
            .copied()
            .unwrap_or(self.rule.count)
    }

    fn counter_for(&self, value: &ParamValue) -> Option<Arc<WindowCounter>> {
        if let Some(counter) = self.counters.get(value) {
            return Some(Arc::clone(counter.value()));
        }
        if self.counters.len() >= MAX_TRACKED_VALUES {
            debug!(
                target: "spark.guard.core",
                resource = %self.rule.resource,
                value = %value,
                "hot parameter table is full, value is not tracked"
            );
            return None;
        }
        let window_ms = self.rule.duration_s.saturating_mul(1000);
        Some(Arc::clone(
            self.counters
                .entry(value.clone())
                .or_insert_with(|| Arc::new(WindowCounter::new(1, window_ms)))
                .value(),
        ))
    }

    fn pass_local(&self, value: &ParamValue, count: u32) -> bool {
        let Some(counter) = self.counter_for(value) else {
            return true;
        };
        let now = current_time_millis();
        let count = i64::from(count);
        counter.add_at(now, MetricEvent::Pass, count);
        if counter.sum_at(now, MetricEvent::Pass) as f64 > self.threshold_for(value) {
            counter.add_at(now, MetricEvent::Pass, -count);
            return false;
        }
        true
    }

    fn pass_cluster(&self, value: &ParamValue, count: u32, config: &ClusterFlowConfig) -> bool {
        let verdict = match token::service() {
            Some(service) => {
                let result =
                    service.request_param_token(config.flow_id, count, std::slice::from_ref(value));
                apply_token_result(&result)
            }
            None => ClusterVerdict::Fallback,
        };
        match verdict {
            ClusterVerdict::Pass => true,
            ClusterVerdict::Block => false,
            ClusterVerdict::Fallback if config.fallback_to_local_when_fail => {
                self.pass_local(value, count)
            }
            ClusterVerdict::Fallback => true,
        }
    }

    fn can_pass(&self, value: &ParamValue, count: u32) -> bool {
        match (&self.rule.cluster_mode, &self.rule.cluster_config) {
            (true, Some(config)) => self.pass_cluster(value, count, config),
            _ => self.pass_local(value, count),
        }
    }

    fn refund(&self, value: &ParamValue, count: u32) {
        if self.rule.cluster_mode {
            return;
        }
        if let Some(counter) = self.counters.get(value) {
            counter.add(MetricEvent::Pass, -i64::from(count));
        }
    }

    /// 当前窗口内某参数值的通过数。
    fn passed(&self, value: &ParamValue) -> i64 {
        self.counters
            .get(value)
            .map(|counter| counter.sum(MetricEvent::Pass))
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct ParamFlowRuleManager {
    rules: RuleSet<ParamController>,
}

impl ParamFlowRuleManager {
    pub fn load_rules(&self, rules: Vec<ParamFlowRule>) -> Result<(), RuleError> {
        validate_all(&rules)?;
        let count = rules.len();
        self.rules.replace(
            rules
                .into_iter()
                .map(|rule| (Arc::from(rule.resource.as_str()), ParamController::new(rule))),
        );
        debug!(target: "spark.guard.core", rules = count, "param flow rules loaded");
        Ok(())
    }

    pub fn get_rules(&self) -> Vec<ParamFlowRule> {
        self.rules.all().iter().map(|c| c.rule.clone()).collect()
    }

    pub fn rules_for(&self, resource: &str) -> Vec<ParamFlowRule> {
        self.rules
            .rules_for(resource)
            .map(|items| items.iter().map(|c| c.rule.clone()).collect())
            .unwrap_or_default()
    }

    /// 资源上第 `rule_index` 条规则对参数值的当前计数。
    pub fn passed_count(&self, resource: &str, rule_index: usize, value: &ParamValue) -> i64 {
        self.rules
            .rules_for(resource)
            .and_then(|items| items.get(rule_index).map(|c| c.passed(value)))
            .unwrap_or(0)
    }
}

static MANAGER: OnceLock<ParamFlowRuleManager> = OnceLock::new();

pub fn manager() -> &'static ParamFlowRuleManager {
    MANAGER.get_or_init(ParamFlowRuleManager::default)
}

pub fn load_rules(rules: Vec<ParamFlowRule>) -> Result<(), RuleError> {
    manager().load_rules(rules)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ParamFlowSlot;

impl ParamFlowSlot {
    pub const ORDER: i32 = -3_000;
}

impl ProcessorSlot for ParamFlowSlot {
    fn name(&self) -> &'static str {
        "param_flow"
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn entry(&self, ctx: &SlotContext<'_>) -> Result<(), BlockError> {
        let Some(controllers) = manager().rules.rules_for(ctx.resource().name()) else {
            return Ok(());
        };
        for (idx, controller) in controllers.iter().enumerate() {
            let Some(value) = controller.rule.extract(ctx.args()) else {
                continue;
            };
            if !controller.can_pass(value, ctx.count()) {
                // 已放行的前序规则回退计数，保持“阻断不消耗配额”。
                for passed in &controllers[..idx] {
                    if let Some(value) = passed.rule.extract(ctx.args()) {
                        passed.refund(value, ctx.count());
                    }
                }
                return Err(BlockError::new(
                    Arc::clone(ctx.resource().name_arc()),
                    ParamFlowBlocked {
                        rule: controller.rule.clone(),
                        value: value.clone(),
                    },
                ));
            }
        }
        Ok(())
    }

    fn on_entry_blocked(&self, ctx: &SlotContext<'_>, _error: &BlockError) {
        let Some(controllers) = manager().rules.rules_for(ctx.resource().name()) else {
            return;
        };
        for controller in controllers.iter() {
            if let Some(value) = controller.rule.extract(ctx.args()) {
                controller.refund(value, ctx.count());
            }
        }
    }
}
