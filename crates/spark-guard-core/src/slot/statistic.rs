use super::{ProcessorSlot, SlotContext};
use crate::clock::current_time_millis;
use crate::error::BlockError;
use crate::node::{self, StatisticNode};
use crate::resource::EntryType;

/// 统计槽位。
///
/// # 教案式注释
/// - **意图 (Why)**：规则检查读取的 QPS、并发数、RT 全部来自这里写入的节点；
/// - **逻辑 (How)**：
///   1. `on_entry_passed`：所有检查放行后，资源节点、来源节点、上下文入口节点与（入站时）全局入站节点
///      增加通过数与并发数；
///   2. `on_entry_blocked`：同样的节点集合增加阻断数；
///   3. `exit`：记录 RT 与成功数、业务异常数，并减少并发数；
/// - **契约 (What)**：节点缺失（自定义链未放置节点选择槽）时只写入可用的节点。
#[derive(Clone, Copy, Debug, Default)]
pub struct StatisticSlot;

impl StatisticSlot {
    pub const ORDER: i32 = -7_000;

    fn for_each_node(ctx: &SlotContext<'_>, mut f: impl FnMut(&StatisticNode)) {
        if let Some(node) = ctx.cur_node() {
            f(node.stat());
        }
        if let Some(origin) = ctx.origin_node() {
            f(origin);
        }
        f(ctx.context().entrance_node());
        if ctx.resource().entry_type() == EntryType::In {
            f(node::registry().inbound());
        }
    }
}

impl ProcessorSlot for StatisticSlot {
    fn name(&self) -> &'static str {
        "statistic"
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn entry(&self, _ctx: &SlotContext<'_>) -> Result<(), BlockError> {
        Ok(())
    }

    fn on_entry_passed(&self, ctx: &SlotContext<'_>) {
        let count = ctx.count();
        Self::for_each_node(ctx, |node| {
            node.increase_thread_num();
            node.add_pass(count);
        });
    }

    fn on_entry_blocked(&self, ctx: &SlotContext<'_>, _error: &BlockError) {
        let count = ctx.count();
        Self::for_each_node(ctx, |node| node.add_block(count));
    }

    fn exit(&self, ctx: &SlotContext<'_>) {
        let count = ctx.count();
        let rt = (current_time_millis() - ctx.create_timestamp()).max(0);
        let failed = ctx.error().is_some();
        Self::for_each_node(ctx, |node| {
            if failed {
                node.add_exception(count);
            }
            node.add_rt_and_success(rt, count);
            node.decrease_thread_num();
        });
    }
}
