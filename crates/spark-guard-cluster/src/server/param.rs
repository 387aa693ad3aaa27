//! 集群热点参数配额判定。
//!
//! 每条规则按参数值分别计数，窗口长度取规则的 `duration_s`；一次请求携带的全部参数值
//! 要么一起通过、要么整体阻断，重复的参数值只计一次。每条规则最多跟踪
//! [`MAX_TRACKED_VALUES`](spark_guard_core::rule::param::MAX_TRACKED_VALUES) 个参数值，
//! 超出后的新值不计数也不受限。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use spark_guard_core::clock::current_time_millis;
use spark_guard_core::node::{MetricEvent, WindowCounter};
use spark_guard_core::rule::param::MAX_TRACKED_VALUES;
use spark_guard_core::{ParamValue, TokenResult};

use super::config::QuotaConfig;
use super::rules::{ClusterParamRule, ClusterRules, global_threshold};

#[derive(Debug)]
struct ParamMetric {
    sample_count: u32,
    interval_ms: u32,
    values: Mutex<HashMap<ParamValue, WindowCounter>>,
}

impl ParamMetric {
    fn new(sample_count: u32, duration_s: u32) -> Self {
        Self {
            sample_count,
            interval_ms: duration_s.saturating_mul(1000),
            values: Mutex::new(HashMap::new()),
        }
    }

    /// 窗口长度是否仍与规则一致。
    fn fits(&self, rule: &ClusterParamRule) -> bool {
        self.interval_ms == rule.rule.duration_s.saturating_mul(1000)
    }
}

#[derive(Debug)]
pub struct ParamQuota {
    config: QuotaConfig,
    metrics: DashMap<i64, Arc<ParamMetric>>,
}

impl ParamQuota {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            metrics: DashMap::new(),
        }
    }

    pub fn acquire(
        &self,
        rule: &ClusterParamRule,
        connected: usize,
        count: u32,
        params: &[ParamValue],
    ) -> TokenResult {
        self.acquire_at(current_time_millis(), rule, connected, count, params)
    }

    pub(crate) fn acquire_at(
        &self,
        now: i64,
        rule: &ClusterParamRule,
        connected: usize,
        count: u32,
        params: &[ParamValue],
    ) -> TokenResult {
        let metric = self.metric(rule);
        let acquire = i64::from(count);
        let mut seen = HashSet::with_capacity(params.len());
        let params: Vec<&ParamValue> = params.iter().filter(|value| seen.insert(*value)).collect();
        let mut values = metric.values.lock();

        let mut remaining = f64::MAX;
        for &value in &params {
            let threshold = global_threshold(
                rule.threshold_for(value),
                rule.config.threshold_type,
                connected,
            );
            let passed = values
                .get(value)
                .map_or(0, |window| window.sum_at(now, MetricEvent::Pass));
            let left = threshold - (passed + acquire) as f64;
            if left < 0.0 {
                return TokenResult::blocked();
            }
            remaining = remaining.min(left);
        }

        for &value in &params {
            if !values.contains_key(value) {
                if values.len() >= MAX_TRACKED_VALUES {
                    continue;
                }
                values.insert(
                    value.clone(),
                    WindowCounter::new(metric.sample_count, metric.interval_ms),
                );
            }
            if let Some(window) = values.get(value) {
                window.add_at(now, MetricEvent::Pass, acquire);
            }
        }
        if params.is_empty() {
            remaining = 0.0;
        }
        TokenResult::ok(remaining as i32)
    }

    fn metric(&self, rule: &ClusterParamRule) -> Arc<ParamMetric> {
        let fresh = || Arc::new(ParamMetric::new(self.config.sample_count, rule.rule.duration_s));
        let mut metric = self.metrics.entry(rule.config.flow_id).or_insert_with(fresh);
        if !metric.fits(rule) {
            *metric = fresh();
        }
        Arc::clone(metric.value())
    }

    /// 只保留仍有规则、且窗口长度未变的计数；`duration_s` 变化的规则从空窗口重新计数。
    pub fn retain(&self, rules: &ClusterRules) {
        self.metrics.retain(|id, metric| {
            rules
                .param_rule(*id)
                .is_some_and(|rule| metric.fits(&rule))
        });
    }
}
