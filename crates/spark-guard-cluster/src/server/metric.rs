//! 服务端按 `flow_id` 维护的配额窗口。
//!
//! # 教案式注释
//! - **意图 (Why)**：同一规则的令牌请求来自多个连接、多个任务，“读用量、比阈值、记通过”
//!   必须是一个原子步骤，否则并发请求会同时看到余量而超发；
//! - **逻辑 (How)**：计数复用核心 crate 的 [`WindowCounter`]，每个 `flow_id` 额外持有一把
//!   `parking_lot::Mutex`，判定在锁内完成；锁只覆盖内存计算，不跨 `.await`；
//! - **契约 (What)**：`OccupiedPass` 记录借用下一窗口的额度，在其所在窗口过期前一直计入用量。

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use spark_guard_core::clock::current_time_millis;
use spark_guard_core::node::{MetricEvent, WindowCounter};

use super::config::QuotaConfig;

#[derive(Debug)]
pub struct ClusterMetric {
    window: WindowCounter,
    check: Mutex<()>,
}

impl ClusterMetric {
    pub fn new(sample_count: u32, interval_ms: u32) -> Self {
        Self {
            window: WindowCounter::new(sample_count, interval_ms),
            check: Mutex::new(()),
        }
    }

    /// 获取判定锁；持锁期间的读写构成一次原子判定。
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.check.lock()
    }

    pub fn window(&self) -> &WindowCounter {
        &self.window
    }

    pub fn add(&self, now: i64, event: MetricEvent, n: i64) {
        self.window.add_at(now, event, n);
    }

    pub fn sum(&self, now: i64, event: MetricEvent) -> i64 {
        self.window.sum_at(now, event)
    }

    pub fn pass_qps(&self) -> f64 {
        self.window.rate_at(current_time_millis(), MetricEvent::Pass)
    }

    pub fn block_qps(&self) -> f64 {
        self.window.rate_at(current_time_millis(), MetricEvent::Block)
    }
}

/// `flow_id → 配额窗口`；窗口在首次请求时创建，规则删除后由 [`retain`](Self::retain) 清理。
#[derive(Debug)]
pub struct MetricRegistry {
    config: QuotaConfig,
    metrics: DashMap<i64, Arc<ClusterMetric>>,
}

impl MetricRegistry {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            metrics: DashMap::new(),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn metric(&self, flow_id: i64) -> Arc<ClusterMetric> {
        if let Some(metric) = self.metrics.get(&flow_id) {
            return metric.clone();
        }
        self.metrics
            .entry(flow_id)
            .or_insert_with(|| {
                Arc::new(ClusterMetric::new(
                    self.config.sample_count,
                    self.config.interval_ms,
                ))
            })
            .clone()
    }

    pub fn existing(&self, flow_id: i64) -> Option<Arc<ClusterMetric>> {
        self.metrics.get(&flow_id).map(|metric| metric.clone())
    }

    /// 只保留仍有规则的窗口。
    pub fn retain(&self, flow_ids: &[i64]) {
        self.metrics.retain(|id, _| flow_ids.contains(id));
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_is_created_once_per_flow() {
        let registry = MetricRegistry::new(QuotaConfig::default());
        let a = registry.metric(1);
        let b = registry.metric(1);
        assert!(Arc::ptr_eq(&a, &b));
        registry.metric(2);
        registry.retain(&[2]);
        assert!(registry.existing(1).is_none());
        assert_eq!(registry.len(), 1);
    }
}
