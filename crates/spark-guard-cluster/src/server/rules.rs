//! 集群规则仓储：`flow_id → 规则 + 命名空间`。
//!
//! # 教案式注释
//! - **意图 (Why)**：客户端只上报 `flow_id`，服务端需要据此找到规则阈值、阈值解释方式与
//!   所属命名空间（用于计算单机均摊阈值）；
//! - **逻辑 (How)**：流控与热点参数规则各自保存在 `ArcSwap` 快照中，加载时整体替换，
//!   热路径只做一次无锁读取；
//! - **契约 (What)**：加载的规则必须开启集群模式并携带 `cluster_config`；
//!   同一类规则内 `flow_id` 不得重复；任一规则非法时保留旧快照。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use spark_guard_core::rule::{
    ClusterFlowConfig, ClusterThresholdType, FlowRule, ParamFlowRule, Rule,
};
use spark_guard_core::{BlockKind, ParamValue, RuleError};
use tracing::info;

use super::config::{NamespacedFlowRule, NamespacedParamRule};

/// 已登记的集群流控规则。
#[derive(Clone, Debug)]
pub struct ClusterFlowRule {
    pub namespace: Arc<str>,
    pub rule: FlowRule,
    pub config: ClusterFlowConfig,
}

/// 已登记的集群热点参数规则。
#[derive(Clone, Debug)]
pub struct ClusterParamRule {
    pub namespace: Arc<str>,
    pub rule: ParamFlowRule,
    pub config: ClusterFlowConfig,
}

impl ClusterParamRule {
    /// 参数值对应的单机阈值：特定值覆盖规则阈值。
    pub fn threshold_for(&self, value: &ParamValue) -> f64 {
        self.rule
            .item_thresholds
            .iter()
            .find(|item| &item.value == value)
            .map_or(self.rule.count, |item| item.count)
    }
}

/// 按阈值类型换算集群总阈值；`connected` 至少按 1 计。
pub fn global_threshold(
    count: f64,
    threshold_type: ClusterThresholdType,
    connected: usize,
) -> f64 {
    match threshold_type {
        ClusterThresholdType::Global => count,
        ClusterThresholdType::AvgLocal => count * connected.max(1) as f64,
    }
}

#[derive(Debug, Default)]
pub struct ClusterRules {
    flow: FlowIndex<ClusterFlowRule>,
    param: FlowIndex<ClusterParamRule>,
}

impl ClusterRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_flow_rules(&self, rules: Vec<NamespacedFlowRule>) -> Result<(), RuleError> {
        let mut next = HashMap::with_capacity(rules.len());
        for NamespacedFlowRule { namespace, rule } in rules {
            let config = cluster_config(&rule, BlockKind::FLOW, rule.cluster_config.as_ref())?;
            let flow_id = config.flow_id;
            let entry = ClusterFlowRule {
                namespace: Arc::from(namespace),
                rule,
                config,
            };
            if next.insert(flow_id, Arc::new(entry)).is_some() {
                return Err(duplicate(BlockKind::FLOW, flow_id));
            }
        }
        info!(target: "spark.guard.cluster.server", rules = next.len(), "cluster flow rules loaded");
        self.flow.store(next);
        Ok(())
    }

    pub fn load_param_rules(&self, rules: Vec<NamespacedParamRule>) -> Result<(), RuleError> {
        let mut next = HashMap::with_capacity(rules.len());
        for NamespacedParamRule { namespace, rule } in rules {
            let config =
                cluster_config(&rule, BlockKind::PARAM_FLOW, rule.cluster_config.as_ref())?;
            let flow_id = config.flow_id;
            let entry = ClusterParamRule {
                namespace: Arc::from(namespace),
                rule,
                config,
            };
            if next.insert(flow_id, Arc::new(entry)).is_some() {
                return Err(duplicate(BlockKind::PARAM_FLOW, flow_id));
            }
        }
        info!(target: "spark.guard.cluster.server", rules = next.len(), "cluster param rules loaded");
        self.param.store(next);
        Ok(())
    }

    pub fn flow_rule(&self, flow_id: i64) -> Option<Arc<ClusterFlowRule>> {
        self.flow.get(flow_id)
    }

    pub fn param_rule(&self, flow_id: i64) -> Option<Arc<ClusterParamRule>> {
        self.param.get(flow_id)
    }

    pub fn flow_ids(&self) -> Vec<i64> {
        self.flow.ids()
    }

    pub fn param_ids(&self) -> Vec<i64> {
        self.param.ids()
    }

    /// 规则引用到的全部命名空间。
    pub fn namespaces(&self) -> Vec<Arc<str>> {
        let mut names: Vec<Arc<str>> = self
            .flow
            .values()
            .into_iter()
            .map(|rule| rule.namespace.clone())
            .chain(self.param.values().into_iter().map(|rule| rule.namespace.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

fn cluster_config<R: Rule>(
    rule: &R,
    kind: BlockKind,
    config: Option<&ClusterFlowConfig>,
) -> Result<ClusterFlowConfig, RuleError> {
    rule.validate()?;
    config
        .cloned()
        .ok_or_else(|| RuleError::new(kind, rule.resource(), "cluster rule requires cluster_config"))
}

fn duplicate(kind: BlockKind, flow_id: i64) -> RuleError {
    RuleError::new(kind, "", format!("duplicate flow_id {flow_id}"))
}

/// 以 `flow_id` 为键的只读快照。
struct FlowIndex<T> {
    by_id: ArcSwap<HashMap<i64, Arc<T>>>,
}

impl<T> Default for FlowIndex<T> {
    fn default() -> Self {
        Self {
            by_id: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl<T> FlowIndex<T> {
    fn store(&self, next: HashMap<i64, Arc<T>>) {
        self.by_id.store(Arc::new(next));
    }

    fn get(&self, flow_id: i64) -> Option<Arc<T>> {
        self.by_id.load().get(&flow_id).cloned()
    }

    fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.by_id.load().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn values(&self) -> Vec<Arc<T>> {
        self.by_id.load().values().cloned().collect()
    }
}

impl<T> fmt::Debug for FlowIndex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowIndex")
            .field("len", &self.by_id.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(namespace: &str, resource: &str, flow_id: i64) -> NamespacedFlowRule {
        NamespacedFlowRule::new(
            namespace,
            FlowRule::new(resource, 10.0).with_cluster(ClusterFlowConfig {
                flow_id,
                ..ClusterFlowConfig::default()
            }),
        )
    }

    #[test]
    fn rules_are_indexed_by_flow_id() {
        let rules = ClusterRules::new();
        rules
            .load_flow_rules(vec![flow("a", "orders", 1), flow("b", "items", 2)])
            .unwrap();
        let rule = rules.flow_rule(2).unwrap();
        assert_eq!(&*rule.namespace, "b");
        assert_eq!(rule.rule.resource, "items");
        assert!(rules.flow_rule(3).is_none());
        assert_eq!(rules.flow_ids(), vec![1, 2]);
        assert_eq!(rules.namespaces().len(), 2);
    }

    #[test]
    fn invalid_batch_keeps_previous_rules() {
        let rules = ClusterRules::new();
        rules.load_flow_rules(vec![flow("a", "orders", 1)]).unwrap();

        let duplicate = rules.load_flow_rules(vec![flow("a", "x", 5), flow("a", "y", 5)]);
        assert!(duplicate.is_err());
        let local_only =
            rules.load_flow_rules(vec![NamespacedFlowRule::new("a", FlowRule::new("z", 1.0))]);
        assert!(local_only.is_err(), "缺少 cluster_config 的规则不能登记");

        assert_eq!(rules.flow_ids(), vec![1]);
    }

    #[test]
    fn avg_local_threshold_scales_with_connections() {
        assert_eq!(global_threshold(10.0, ClusterThresholdType::AvgLocal, 3), 30.0);
        assert_eq!(global_threshold(10.0, ClusterThresholdType::AvgLocal, 0), 10.0);
        assert_eq!(global_threshold(10.0, ClusterThresholdType::Global, 3), 10.0);
    }
}
