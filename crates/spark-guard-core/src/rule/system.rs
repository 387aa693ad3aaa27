//! 系统保护规则：以全局入站流量为整体负载指标，只作用于 `EntryType::In` 的资源。
//!
//! 多条规则同时生效时，每个维度取最严格（最小）的阈值；未设置的维度不检查。

use std::fmt;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BlockError, BlockKind, BlockReason, RuleError};
use crate::node;
use crate::resource::EntryType;
use crate::slot::{ProcessorSlot, SlotContext};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemRule {
    pub qps: Option<f64>,
    pub max_thread: Option<i64>,
    pub avg_rt_ms: Option<f64>,
}

impl SystemRule {
    fn validate(&self) -> Result<(), RuleError> {
        let bad_float = |value: Option<f64>| value.is_some_and(|v| !v.is_finite() || v < 0.0);
        if bad_float(self.qps)
            || bad_float(self.avg_rt_ms)
            || self.max_thread.is_some_and(|v| v < 0)
        {
            return Err(RuleError::new(
                BlockKind::SYSTEM,
                "system",
                "thresholds must be non-negative",
            ));
        }
        Ok(())
    }
}

/// 命中的系统保护维度。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemLimit {
    Qps,
    Thread,
    AvgRt,
}

#[derive(Clone, Debug)]
pub struct SystemBlocked {
    pub limit: SystemLimit,
    pub threshold: f64,
    pub current: f64,
}

impl fmt::Display for SystemBlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "system {:?} limit {} reached (current {:.2})",
            self.limit, self.threshold, self.current
        )
    }
}

impl BlockReason for SystemBlocked {
    fn kind(&self) -> BlockKind {
        BlockKind::SYSTEM
    }

    fn code(&self) -> &'static str {
        "spark.guard.block.system"
    }

    fn rule_description(&self) -> Option<String> {
        Some(format!("{:?} <= {}", self.limit, self.threshold))
    }
}

#[derive(Debug, Default)]
pub struct SystemRuleManager {
    rules: ArcSwap<Vec<SystemRule>>,
    effective: ArcSwap<SystemRule>,
}

impl SystemRuleManager {
    pub fn load_rules(&self, rules: Vec<SystemRule>) -> Result<(), RuleError> {
        rules.iter().try_for_each(SystemRule::validate)?;
        let min_f = |a: Option<f64>, b: Option<f64>| match (a, b) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let effective = rules.iter().fold(SystemRule::default(), |acc, rule| SystemRule {
            qps: min_f(acc.qps, rule.qps),
            avg_rt_ms: min_f(acc.avg_rt_ms, rule.avg_rt_ms),
            max_thread: match (acc.max_thread, rule.max_thread) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        });
        debug!(target: "spark.guard.core", ?effective, "system rules loaded");
        self.effective.store(Arc::new(effective));
        self.rules.store(Arc::new(rules));
        Ok(())
    }

    pub fn get_rules(&self) -> Vec<SystemRule> {
        self.rules.load().as_ref().clone()
    }

    /// 各维度合并后的生效阈值。
    pub fn effective(&self) -> SystemRule {
        self.effective.load().as_ref().clone()
    }

    fn check(&self, count: u32) -> Result<(), SystemBlocked> {
        let limits = self.effective.load();
        let inbound = node::registry().inbound();
        if let Some(qps) = limits.qps {
            let current = inbound.pass_qps();
            if current + f64::from(count) > qps {
                return Err(SystemBlocked {
                    limit: SystemLimit::Qps,
                    threshold: qps,
                    current,
                });
            }
        }
        if let Some(max_thread) = limits.max_thread {
            let current = inbound.cur_thread_num();
            if current >= max_thread {
                return Err(SystemBlocked {
                    limit: SystemLimit::Thread,
                    threshold: max_thread as f64,
                    current: current as f64,
                });
            }
        }
        if let Some(avg_rt) = limits.avg_rt_ms {
            let current = inbound.avg_rt();
            if current > avg_rt {
                return Err(SystemBlocked {
                    limit: SystemLimit::AvgRt,
                    threshold: avg_rt,
                    current,
                });
            }
        }
        Ok(())
    }
}

static MANAGER: OnceLock<SystemRuleManager> = OnceLock::new();

pub fn manager() -> &'static SystemRuleManager {
    MANAGER.get_or_init(SystemRuleManager::default)
}

pub fn load_rules(rules: Vec<SystemRule>) -> Result<(), RuleError> {
    manager().load_rules(rules)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSlot;

impl SystemSlot {
    pub const ORDER: i32 = -5_000;
}

impl ProcessorSlot for SystemSlot {
    fn name(&self) -> &'static str {
        "system"
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn entry(&self, ctx: &SlotContext<'_>) -> Result<(), BlockError> {
        if ctx.resource().entry_type() != EntryType::In {
            return Ok(());
        }
        manager()
            .check(ctx.count())
            .map_err(|reason| BlockError::new(Arc::clone(ctx.resource().name_arc()), reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_thresholds_take_the_minimum() {
        let manager = SystemRuleManager::default();
        manager
            .load_rules(vec![
                SystemRule {
                    qps: Some(100.0),
                    ..SystemRule::default()
                },
                SystemRule {
                    qps: Some(50.0),
                    max_thread: Some(8),
                    ..SystemRule::default()
                },
            ])
            .unwrap();
        let effective = manager.effective();
        assert_eq!(effective.qps, Some(50.0));
        assert_eq!(effective.max_thread, Some(8));
        assert_eq!(effective.avg_rt_ms, None);
    }

    #[test]
    fn negative_threshold_is_rejected() {
        let manager = SystemRuleManager::default();
        let err = manager
            .load_rules(vec![SystemRule {
                max_thread: Some(-1),
                ..SystemRule::default()
            }])
            .unwrap_err();
        assert_eq!(err.kind, BlockKind::SYSTEM);
    }
}
