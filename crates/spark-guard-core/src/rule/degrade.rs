//! 熔断降级规则。
//!
//! # 教案式注释
//! - **意图 (Why)**：下游持续变慢或出错时主动切断调用，给下游恢复时间；
//! - **逻辑 (How)**：每条规则对应一个熔断器，状态机为 `Closed → Open → HalfOpen → Closed/Open`：
//!   1. `Closed`：统计窗口内请求数达到 `min_request_amount` 且坏请求（慢调用或异常）超过阈值时打开；
//!   2. `Open`：拒绝全部请求，直到 `time_window_s` 后的首个请求被放行为探测请求并进入 `HalfOpen`；
//!   3. `HalfOpen`：探测请求退出时决定关闭或重新打开；探测请求被后续槽位阻断时直接重新打开；
//! - **契约 (What)**：熔断器只在入口退出时记录结果，被阻断的请求不计入熔断统计。

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Rule, RuleSet, validate_all};
use crate::clock::current_time_millis;
use crate::error::{BlockError, BlockKind, BlockReason, RuleError};
use crate::node::{MetricEvent, WindowCounter};
use crate::slot::{ProcessorSlot, SlotContext};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeGrade {
    /// `count` 为慢调用比例阈值（0.0 ~ 1.0），RT 超过 `slow_rt_ms` 视为慢调用。
    #[default]
    SlowRequestRatio,
    /// `count` 为异常比例阈值（0.0 ~ 1.0）。
    ErrorRatio,
    /// `count` 为异常数阈值。
    ErrorCount,
}

fn default_min_request_amount() -> u32 {
    5
}

fn default_stat_interval_ms() -> u32 {
    1000
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DegradeRule {
    pub resource: String,
    #[serde(default)]
    pub grade: DegradeGrade,
    pub count: f64,
    #[serde(default)]
    pub slow_rt_ms: u64,
    pub time_window_s: u32,
    #[serde(default = "default_min_request_amount")]
    pub min_request_amount: u32,
    #[serde(default = "default_stat_interval_ms")]
    pub stat_interval_ms: u32,
}

impl DegradeRule {
    pub fn new(resource: impl Into<String>, grade: DegradeGrade, count: f64) -> Self {
        Self {
            resource: resource.into(),
            grade,
            count,
            slow_rt_ms: 0,
            time_window_s: 10,
            min_request_amount: default_min_request_amount(),
            stat_interval_ms: default_stat_interval_ms(),
        }
    }

    pub fn with_slow_rt_ms(mut self, slow_rt_ms: u64) -> Self {
        self.slow_rt_ms = slow_rt_ms;
        self
    }

    pub fn with_time_window_s(mut self, time_window_s: u32) -> Self {
        self.time_window_s = time_window_s;
        self
    }

    pub fn with_min_request_amount(mut self, min_request_amount: u32) -> Self {
        self.min_request_amount = min_request_amount;
        self
    }

    pub fn with_stat_interval_ms(mut self, stat_interval_ms: u32) -> Self {
        self.stat_interval_ms = stat_interval_ms;
        self
    }
}

impl Rule for DegradeRule {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn validate(&self) -> Result<(), RuleError> {
        let invalid = |detail: &str| RuleError::new(BlockKind::DEGRADE, &self.resource, detail);
        if self.resource.is_empty() {
            return Err(invalid("resource must not be empty"));
        }
        if !self.count.is_finite() || self.count < 0.0 {
            return Err(invalid("count must be a non-negative number"));
        }
        if self.grade != DegradeGrade::ErrorCount && self.count > 1.0 {
            return Err(invalid("ratio threshold must be within [0.0, 1.0]"));
        }
        if self.grade == DegradeGrade::SlowRequestRatio && self.slow_rt_ms == 0 {
            return Err(invalid("slow request ratio requires slow_rt_ms"));
        }
        if self.time_window_s == 0 || self.min_request_amount == 0 || self.stat_interval_ms == 0 {
            return Err(invalid(
                "time_window_s, min_request_amount and stat_interval_ms must be positive",
            ));
        }
        Ok(())
    }
}

/// 熔断器状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

// 熔断器窗口只需要两个计数：总请求与坏请求。
const TOTAL: MetricEvent = MetricEvent::Pass;
const BAD: MetricEvent = MetricEvent::Exception;

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    rule: DegradeRule,
    state: AtomicU8,
    next_retry_ms: AtomicI64,
    stat: WindowCounter,
}

impl CircuitBreaker {
    fn new(rule: DegradeRule) -> Self {
        let stat = WindowCounter::new(1, rule.stat_interval_ms);
        Self {
            rule,
            state: AtomicU8::new(CLOSED),
            next_retry_ms: AtomicI64::new(0),
            stat,
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            CLOSED => CircuitState::Closed,
            OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        let switched = self
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if switched {
            if to == OPEN {
                let retry =
                    current_time_millis() + i64::from(self.rule.time_window_s) * 1000;
                self.next_retry_ms.store(retry, Ordering::Release);
            }
            if to == CLOSED {
                self.stat.reset();
            }
            info!(
                target: "spark.guard.core",
                resource = %self.rule.resource,
                grade = ?self.rule.grade,
                from = ?state_name(from),
                to = ?state_name(to),
                "circuit breaker state changed"
            );
        }
        switched
    }

    fn try_pass(self: &Arc<Self>, ctx: &SlotContext<'_>) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED => true,
            OPEN => {
                let due = current_time_millis() >= self.next_retry_ms.load(Ordering::Acquire);
                if due && self.transition(OPEN, HALF_OPEN) {
                    let breaker = Arc::clone(self);
                    ctx.when_terminate(move |entry| {
                        if entry.block_error().is_some() {
                            breaker.transition(HALF_OPEN, OPEN);
                        }
                    });
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    fn on_request_complete(&self, rt_ms: i64, failed: bool) {
        let bad = match self.rule.grade {
            DegradeGrade::SlowRequestRatio => rt_ms > self.rule.slow_rt_ms as i64,
            DegradeGrade::ErrorRatio | DegradeGrade::ErrorCount => failed,
        };
        let now = current_time_millis();
        self.stat.add_at(now, TOTAL, 1);
        if bad {
            self.stat.add_at(now, BAD, 1);
        }

        match self.state.load(Ordering::Acquire) {
            OPEN => return,
            HALF_OPEN => {
                if bad {
                    self.transition(HALF_OPEN, OPEN);
                } else {
                    self.transition(HALF_OPEN, CLOSED);
                }
                return;
            }
            _ => {}
        }

        let total = self.stat.sum_at(now, TOTAL);
        if total < i64::from(self.rule.min_request_amount) {
            return;
        }
        let bad_count = self.stat.sum_at(now, BAD) as f64;
        let threshold = self.rule.count;
        let trip = match self.rule.grade {
            DegradeGrade::ErrorCount => bad_count > threshold,
            DegradeGrade::ErrorRatio | DegradeGrade::SlowRequestRatio => {
                let ratio = bad_count / total as f64;
                ratio > threshold || (ratio >= 1.0 && threshold >= 1.0)
            }
        };
        if trip {
            self.transition(CLOSED, OPEN);
        }
    }
}

fn state_name(raw: u8) -> CircuitState {
    match raw {
        CLOSED => CircuitState::Closed,
        OPEN => CircuitState::Open,
        _ => CircuitState::HalfOpen,
    }
}

#[derive(Clone, Debug)]
pub struct DegradeBlocked {
    pub rule: DegradeRule,
}

impl fmt::Display for DegradeBlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "circuit breaker ({:?}, threshold {}) is open",
            self.rule.grade, self.rule.count
        )
    }
}

impl BlockReason for DegradeBlocked {
    fn kind(&self) -> BlockKind {
        BlockKind::DEGRADE
    }

    fn code(&self) -> &'static str {
        "spark.guard.block.degrade"
    }

    fn rule_description(&self) -> Option<String> {
        Some(format!("{:?}", self.rule))
    }
}

#[derive(Debug, Default)]
pub struct DegradeRuleManager {
    rules: RuleSet<Arc<CircuitBreaker>>,
}

impl DegradeRuleManager {
    /// 替换规则；熔断器随规则一起重建，状态回到 `Closed`。
    pub fn load_rules(&self, rules: Vec<DegradeRule>) -> Result<(), RuleError> {
        validate_all(&rules)?;
        let count = rules.len();
        self.rules.replace(rules.into_iter().map(|rule| {
            (
                Arc::from(rule.resource.as_str()),
                Arc::new(CircuitBreaker::new(rule)),
            )
        }));
        debug!(target: "spark.guard.core", rules = count, "degrade rules loaded");
        Ok(())
    }

    pub fn get_rules(&self) -> Vec<DegradeRule> {
        self.rules.all().iter().map(|b| b.rule.clone()).collect()
    }

    pub fn rules_for(&self, resource: &str) -> Vec<DegradeRule> {
        self.rules
            .rules_for(resource)
            .map(|items| items.iter().map(|b| b.rule.clone()).collect())
            .unwrap_or_default()
    }

    /// 资源上各熔断器的当前状态，按规则加载顺序排列。
    pub fn circuit_states(&self, resource: &str) -> Vec<CircuitState> {
        self.rules
            .rules_for(resource)
            .map(|items| items.iter().map(|b| b.state()).collect())
            .unwrap_or_default()
    }
}

static MANAGER: OnceLock<DegradeRuleManager> = OnceLock::new();

pub fn manager() -> &'static DegradeRuleManager {
    MANAGER.get_or_init(DegradeRuleManager::default)
}

pub fn load_rules(rules: Vec<DegradeRule>) -> Result<(), RuleError> {
    manager().load_rules(rules)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DegradeSlot;

impl DegradeSlot {
    pub const ORDER: i32 = -1_000;
}

impl ProcessorSlot for DegradeSlot {
    fn name(&self) -> &'static str {
        "degrade"
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn entry(&self, ctx: &SlotContext<'_>) -> Result<(), BlockError> {
        let Some(breakers) = manager().rules.rules_for(ctx.resource().name()) else {
            return Ok(());
        };
        match breakers.iter().find(|breaker| !breaker.try_pass(ctx)) {
            Some(breaker) => Err(BlockError::new(
                Arc::clone(ctx.resource().name_arc()),
                DegradeBlocked {
                    rule: breaker.rule.clone(),
                },
            )),
            None => Ok(()),
        }
    }

    fn exit(&self, ctx: &SlotContext<'_>) {
        let Some(breakers) = manager().rules.rules_for(ctx.resource().name()) else {
            return;
        };
        let rt = (current_time_millis() - ctx.create_timestamp()).max(0);
        let failed = ctx.error().is_some();
        for breaker in breakers.iter() {
            breaker.on_request_complete(rt, failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_count_trips_after_threshold_and_half_open_probe_closes() {
        let breaker = CircuitBreaker::new(
            DegradeRule::new("degrade-unit", DegradeGrade::ErrorCount, 2.0)
                .with_min_request_amount(1)
                .with_time_window_s(1),
        );
        breaker.on_request_complete(1, true);
        breaker.on_request_complete(1, true);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_request_complete(1, true);
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.transition(OPEN, HALF_OPEN));
        breaker.on_request_complete(1, false);
        assert_eq!(breaker.state(), CircuitState::Closed, "探测成功后关闭");
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(
            DegradeRule::new("degrade-probe", DegradeGrade::ErrorRatio, 0.5)
                .with_min_request_amount(2),
        );
        breaker.on_request_complete(1, true);
        breaker.on_request_complete(1, true);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.transition(OPEN, HALF_OPEN));
        breaker.on_request_complete(1, true);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn slow_ratio_requires_rt_threshold() {
        let rule = DegradeRule::new("degrade-slow", DegradeGrade::SlowRequestRatio, 0.5);
        assert!(rule.validate().is_err());
        assert!(rule.with_slow_rt_ms(100).validate().is_ok());
    }
}
