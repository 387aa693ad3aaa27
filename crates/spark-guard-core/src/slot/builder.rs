use std::sync::Arc;

use super::{NodeSelectorSlot, ProcessorSlot, SlotChain, StatisticSlot};
use crate::resource::ResourceWrapper;
use crate::rule::{AuthoritySlot, DegradeSlot, FlowSlot, ParamFlowSlot, SystemSlot};

/// 槽位链构建器。
///
/// 闭包 `Fn(&ResourceWrapper) -> SlotChain` 自动实现该 trait，便于测试与定制。
pub trait SlotChainBuilder: Send + Sync {
    fn build(&self, resource: &ResourceWrapper) -> SlotChain;
}

impl<F> SlotChainBuilder for F
where
    F: Fn(&ResourceWrapper) -> SlotChain + Send + Sync,
{
    fn build(&self, resource: &ResourceWrapper) -> SlotChain {
        self(resource)
    }
}

/// 默认链：节点选择 → 统计 → 授权 → 系统 → 热点参数 → 流控 → 熔断。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSlotChainBuilder;

impl DefaultSlotChainBuilder {
    /// 默认槽位集合，供定制构建器在其基础上追加自定义槽位。
    pub fn default_slots(resource: &ResourceWrapper) -> Vec<Arc<dyn ProcessorSlot>> {
        vec![
            Arc::new(NodeSelectorSlot::new(resource)),
            Arc::new(StatisticSlot),
            Arc::new(AuthoritySlot),
            Arc::new(SystemSlot),
            Arc::new(ParamFlowSlot),
            Arc::new(FlowSlot),
            Arc::new(DegradeSlot),
        ]
    }
}

impl SlotChainBuilder for DefaultSlotChainBuilder {
    fn build(&self, resource: &ResourceWrapper) -> SlotChain {
        SlotChain::new(Self::default_slots(resource))
    }
}
