//! 集群 QPS 配额判定。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 多个客户端共享同一规则的总阈值；服务端按 `flow_id` 记账，客户端只拿判定结果。
//!
//! ## 逻辑 (How)
//! - 窗口阈值 = 集群总阈值（QPS）× 窗口秒数；用量 = 通过数 + 借用数；
//! - 余量足够时记一次通过并返回 `OK` 与剩余额度；
//! - 余量不足且请求为优先请求时，尝试借用下一个桶边界之后的额度：若届时仍有效的通过数
//!   加上已借用数与本次请求不超过 `阈值 × max_occupy_ratio`，记一次借用并返回
//!   `SHOULD_WAIT` 与到桶边界的等待时间；
//! - 其余情况记一次阻断并返回 `BLOCKED`。
//!
//! ## 风险 (Trade-offs)
//! - 借用额度在其所在窗口过期前一直计入用量，实际放行量只会低于阈值，不会超发。

use spark_guard_core::clock::current_time_millis;
use spark_guard_core::node::MetricEvent;
use spark_guard_core::{TokenResult, TokenResultStatus};
use tracing::trace;

use super::config::QuotaConfig;
use super::metric::MetricRegistry;
use super::rules::{ClusterFlowRule, global_threshold};

#[derive(Debug)]
pub struct FlowQuota {
    metrics: MetricRegistry,
}

impl FlowQuota {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            metrics: MetricRegistry::new(config),
        }
    }

    pub fn metrics(&self) -> &MetricRegistry {
        &self.metrics
    }

    pub fn acquire(
        &self,
        rule: &ClusterFlowRule,
        connected: usize,
        count: u32,
        prioritized: bool,
    ) -> TokenResult {
        self.acquire_at(current_time_millis(), rule, connected, count, prioritized)
    }

    pub(crate) fn acquire_at(
        &self,
        now: i64,
        rule: &ClusterFlowRule,
        connected: usize,
        count: u32,
        prioritized: bool,
    ) -> TokenResult {
        let flow_id = rule.config.flow_id;
        let metric = self.metrics.metric(flow_id);
        let window = metric.window();
        let threshold = global_threshold(rule.rule.count, rule.config.threshold_type, connected)
            * window.interval_secs();
        let acquire = i64::from(count);

        let _guard = metric.lock();
        let passed = metric.sum(now, MetricEvent::Pass);
        let occupied = metric.sum(now, MetricEvent::OccupiedPass);
        let remaining = threshold - (passed + occupied + acquire) as f64;
        if remaining >= 0.0 {
            metric.add(now, MetricEvent::Pass, acquire);
            return TokenResult::ok(remaining as i32);
        }

        if prioritized {
            let (next_passed, wait) = window.sum_at_next_boundary(now, MetricEvent::Pass);
            let borrow_limit = threshold * self.metrics.config().max_occupy_ratio;
            if (next_passed + occupied + acquire) as f64 <= borrow_limit {
                metric.add(now, MetricEvent::OccupiedPass, acquire);
                trace!(
                    target: "spark.guard.cluster.server",
                    flow_id,
                    wait_ms = wait,
                    "prioritized request borrows the next window"
                );
                return TokenResult::should_wait(wait as i32);
            }
        }

        metric.add(now, MetricEvent::Block, acquire);
        TokenResult::new(TokenResultStatus::Blocked)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use spark_guard_core::rule::{ClusterFlowConfig, ClusterThresholdType, FlowRule};

    use super::*;

    fn rule(count: f64, threshold_type: ClusterThresholdType) -> ClusterFlowRule {
        let config = ClusterFlowConfig {
            flow_id: 11,
            threshold_type,
            ..ClusterFlowConfig::default()
        };
        ClusterFlowRule {
            namespace: Arc::from("default"),
            rule: FlowRule::new("orders", count).with_cluster(config.clone()),
            config,
        }
    }

    #[test]
    fn grants_until_threshold_then_blocks() {
        let quota = FlowQuota::new(QuotaConfig::default());
        let rule = rule(3.0, ClusterThresholdType::Global);
        let now = 10_000;

        let remaining: Vec<i32> = (0..3)
            .map(|_| quota.acquire_at(now, &rule, 1, 1, false).remaining)
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);
        assert_eq!(
            quota.acquire_at(now, &rule, 1, 1, false).status,
            TokenResultStatus::Blocked
        );
        assert_eq!(
            quota.acquire_at(now + 1000, &rule, 1, 1, false).status,
            TokenResultStatus::Ok,
            "窗口滑过后额度恢复"
        );
    }

    #[test]
    fn avg_local_threshold_counts_connected_clients() {
        let quota = FlowQuota::new(QuotaConfig::default());
        let rule = rule(2.0, ClusterThresholdType::AvgLocal);
        let result = quota.acquire_at(10_000, &rule, 3, 6, false);
        assert_eq!(result.status, TokenResultStatus::Ok, "2 × 3 个客户端 = 6");
        assert_eq!(
            quota.acquire_at(10_000, &rule, 3, 1, false).status,
            TokenResultStatus::Blocked
        );
    }

    #[test]
    fn prioritized_request_waits_for_the_next_bucket() {
        let quota = FlowQuota::new(QuotaConfig::default());
        let rule = rule(10.0, ClusterThresholdType::Global);
        assert!(quota.acquire_at(10_000, &rule, 1, 10, false).is_ok());

        let mid = quota.acquire_at(10_500, &rule, 1, 1, true);
        assert_eq!(
            mid.status,
            TokenResultStatus::Blocked,
            "下一个桶边界时旧通过数仍有效，不能借用"
        );

        let late = quota.acquire_at(10_950, &rule, 1, 1, true);
        assert_eq!(late.status, TokenResultStatus::ShouldWait);
        assert_eq!(late.wait_in_ms, 50);

        assert_eq!(
            quota.acquire_at(10_960, &rule, 1, 1, false).status,
            TokenResultStatus::Blocked,
            "非优先请求不借用"
        );
    }

    #[test]
    fn borrowing_respects_occupy_ratio() {
        let quota = FlowQuota::new(QuotaConfig {
            max_occupy_ratio: 0.5,
            ..QuotaConfig::default()
        });
        let rule = rule(10.0, ClusterThresholdType::Global);
        assert!(quota.acquire_at(10_000, &rule, 1, 10, false).is_ok());
        assert_eq!(
            quota.acquire_at(10_950, &rule, 1, 5, true).status,
            TokenResultStatus::ShouldWait
        );
        assert_eq!(
            quota.acquire_at(10_950, &rule, 1, 1, true).status,
            TokenResultStatus::Blocked,
            "借用总量不得超过阈值的一半"
        );
    }
}
