use std::sync::Arc;

use super::{ProcessorSlot, SlotContext};
use crate::error::BlockError;
use crate::node::{self, ClusterNode};
use crate::resource::ResourceWrapper;

/// 为入口绑定资源节点与来源节点。
///
/// 资源节点在链构建时解析一次；来源节点按调用方 `origin` 惰性创建，空来源不建节点。
#[derive(Debug)]
pub struct NodeSelectorSlot {
    node: Arc<ClusterNode>,
}

impl NodeSelectorSlot {
    pub const ORDER: i32 = -10_000;

    pub fn new(resource: &ResourceWrapper) -> Self {
        Self {
            node: node::registry().cluster_node(resource),
        }
    }

    pub fn node(&self) -> &Arc<ClusterNode> {
        &self.node
    }
}

impl ProcessorSlot for NodeSelectorSlot {
    fn name(&self) -> &'static str {
        "node_selector"
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn entry(&self, ctx: &SlotContext<'_>) -> Result<(), BlockError> {
        ctx.set_cur_node(Arc::clone(&self.node));
        let origin = ctx.origin();
        if !origin.is_empty() {
            ctx.set_origin_node(self.node.origin_node(origin));
        }
        Ok(())
    }
}
