//! # node 模块说明
//!
//! ## 角色定位（Why）
//! - 统计节点是槽位链写入与规则检查读取的共同对象：`StatisticSlot` 写入通过/阻断/异常/RT，
//!   流控、熔断、系统保护槽读取 QPS 与并发数；
//! - 节点按资源全局共享（[`ClusterNode`]），并按调用来源细分（origin 节点）。
//!
//! ## 契约（What）
//! - 所有写入均为原子操作，热路径不持有任何跨资源的锁；
//! - [`NodeRegistry`] 以 `DashMap` 管理资源节点，并持有全局入站节点供系统规则使用。

mod window;

pub use window::{MetricEvent, WindowCounter};

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::config;
use crate::resource::ResourceWrapper;

/// 单个统计维度：秒级窗口 + 当前并发数。
#[derive(Debug)]
pub struct StatisticNode {
    second: WindowCounter,
    cur_thread_num: AtomicI64,
}

impl Default for StatisticNode {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticNode {
    /// 按进程级配置的采样参数创建节点。
    pub fn new() -> Self {
        let stat = config::engine().statistic;
        Self::with_window(stat.sample_count, stat.interval_ms)
    }

    pub fn with_window(sample_count: u32, interval_ms: u32) -> Self {
        Self {
            second: WindowCounter::new(sample_count, interval_ms),
            cur_thread_num: AtomicI64::new(0),
        }
    }

    pub fn add_pass(&self, count: u32) {
        self.second.add(MetricEvent::Pass, i64::from(count));
    }

    pub fn add_block(&self, count: u32) {
        self.second.add(MetricEvent::Block, i64::from(count));
    }

    pub fn add_exception(&self, count: u32) {
        self.second.add(MetricEvent::Exception, i64::from(count));
    }

    pub fn add_rt_and_success(&self, rt_ms: i64, count: u32) {
        self.second.add(MetricEvent::Success, i64::from(count));
        self.second.add(MetricEvent::Rt, rt_ms);
    }

    pub fn increase_thread_num(&self) {
        self.cur_thread_num.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrease_thread_num(&self) {
        self.cur_thread_num.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn cur_thread_num(&self) -> i64 {
        self.cur_thread_num.load(Ordering::Acquire)
    }

    pub fn pass_qps(&self) -> f64 {
        self.second.rate(MetricEvent::Pass)
    }

    pub fn block_qps(&self) -> f64 {
        self.second.rate(MetricEvent::Block)
    }

    pub fn exception_qps(&self) -> f64 {
        self.second.rate(MetricEvent::Exception)
    }

    pub fn success_qps(&self) -> f64 {
        self.second.rate(MetricEvent::Success)
    }

    pub fn total_qps(&self) -> f64 {
        self.pass_qps() + self.block_qps()
    }

    /// 窗口内平均响应时间（毫秒）。
    pub fn avg_rt(&self) -> f64 {
        let success = self.second.sum(MetricEvent::Success);
        if success <= 0 {
            return 0.0;
        }
        self.second.sum(MetricEvent::Rt) as f64 / success as f64
    }

    pub fn window(&self) -> &WindowCounter {
        &self.second
    }
}

/// 资源级聚合节点，跨所有上下文共享。
#[derive(Debug)]
pub struct ClusterNode {
    resource: ResourceWrapper,
    stat: StatisticNode,
    origins: DashMap<Arc<str>, Arc<StatisticNode>>,
}

impl ClusterNode {
    pub fn new(resource: ResourceWrapper) -> Self {
        Self {
            resource,
            stat: StatisticNode::new(),
            origins: DashMap::new(),
        }
    }

    pub fn resource(&self) -> &ResourceWrapper {
        &self.resource
    }

    pub fn stat(&self) -> &StatisticNode {
        &self.stat
    }

    /// 获取（必要时创建）指定来源的统计节点。
    pub fn origin_node(&self, origin: &str) -> Arc<StatisticNode> {
        if let Some(node) = self.origins.get(origin) {
            return Arc::clone(node.value());
        }
        Arc::clone(
            self.origins
                .entry(Arc::from(origin))
                .or_insert_with(|| Arc::new(StatisticNode::new()))
                .value(),
        )
    }

    pub fn existing_origin_node(&self, origin: &str) -> Option<Arc<StatisticNode>> {
        self.origins.get(origin).map(|node| Arc::clone(node.value()))
    }
}

/// 资源节点仓储。
#[derive(Debug, Default)]
pub struct NodeRegistry {
    clusters: DashMap<ResourceWrapper, Arc<ClusterNode>>,
    inbound: StatisticNode,
}

impl NodeRegistry {
    pub fn cluster_node(&self, resource: &ResourceWrapper) -> Arc<ClusterNode> {
        if let Some(node) = self.clusters.get(resource) {
            return Arc::clone(node.value());
        }
        Arc::clone(
            self.clusters
                .entry(resource.clone())
                .or_insert_with(|| Arc::new(ClusterNode::new(resource.clone())))
                .value(),
        )
    }

    /// 按资源名查找节点，方向不限。
    pub fn find_by_name(&self, name: &str) -> Vec<Arc<ClusterNode>> {
        self.clusters
            .iter()
            .filter(|entry| entry.key().name() == name)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// 全局入站流量节点，系统规则据此判断整体负载。
    pub fn inbound(&self) -> &StatisticNode {
        &self.inbound
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

static NODES: OnceLock<NodeRegistry> = OnceLock::new();

/// 进程级节点仓储。
pub fn registry() -> &'static NodeRegistry {
    NODES.get_or_init(NodeRegistry::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::EntryType;

    #[test]
    fn cluster_node_is_shared_per_resource() {
        let registry = NodeRegistry::default();
        let res = ResourceWrapper::new("node-shared", EntryType::Out);
        let a = registry.cluster_node(&res);
        let b = registry.cluster_node(&res);
        assert!(Arc::ptr_eq(&a, &b));

        let origin_a = a.origin_node("app-a");
        let origin_again = b.origin_node("app-a");
        assert!(Arc::ptr_eq(&origin_a, &origin_again));
        assert!(a.existing_origin_node("app-b").is_none());
    }

    #[test]
    fn thread_num_tracks_increments() {
        let node = StatisticNode::with_window(2, 1000);
        node.increase_thread_num();
        node.increase_thread_num();
        node.decrease_thread_num();
        assert_eq!(node.cur_thread_num(), 1);
    }

    #[test]
    fn avg_rt_divides_by_success() {
        let node = StatisticNode::with_window(1, 60_000);
        node.add_rt_and_success(30, 1);
        node.add_rt_and_success(10, 1);
        assert!((node.avg_rt() - 20.0).abs() < f64::EPSILON);
    }
}
