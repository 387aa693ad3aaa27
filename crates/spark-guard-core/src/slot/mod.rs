//! # slot 模块说明
//!
//! ## 核心意图（Why）
//! - 槽位链是每个资源的准入流水线：节点选择、统计、授权、系统保护、热点参数、流控、熔断依次执行，
//!   任一槽位返回 [`BlockError`] 即终止并拒绝本次调用；
//! - 链在资源首次被访问时构建并缓存，此后只读共享，热路径上没有任何写锁。
//!
//! ## 行为契约（What）
//! - 进入阶段：按 `order()` 升序执行 [`ProcessorSlot::entry`]；
//!   - 阻断：此前已执行的槽位按逆序收到 [`ProcessorSlot::on_entry_blocked`]，用于补偿计数与记录阻断；
//!   - 放行：全部槽位按逆序收到 [`ProcessorSlot::on_entry_passed`]，统计在所有检查之后记账；
//! - 退出阶段：按逆序执行 [`ProcessorSlot::exit`]，只对已放行的入口调用；
//! - 槽位只以 `BlockError` 表达拒绝，panic 不被捕获，原样向上传播。
//!
//! ## 风险提示（Trade-offs）
//! - 排序仅在构建时发生一次；同 `order` 的槽位保持注册顺序（稳定排序）。

mod builder;
mod node_selector;
mod registry;
mod statistic;

pub use builder::{DefaultSlotChainBuilder, SlotChainBuilder};
pub use node_selector::NodeSelectorSlot;
pub use registry::ChainRegistry;
pub use statistic::StatisticSlot;

use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::entry::{BizError, EntryInner, EntryRef};
use crate::error::BlockError;
use crate::node::{ClusterNode, StatisticNode};
use crate::resource::{ParamValue, ResourceWrapper};

/// 槽位执行时可见的调用信息。
///
/// 所有槽位共享同一个只读视图；需要写入的字段（当前节点、来源节点、终止回调）
/// 由入口内部的一次性单元或互斥锁承载。
pub struct SlotContext<'a> {
    entry: &'a Arc<EntryInner>,
    context: &'a Arc<Context>,
    count: u32,
    args: &'a [ParamValue],
}

impl<'a> SlotContext<'a> {
    pub(crate) fn new(
        entry: &'a Arc<EntryInner>,
        context: &'a Arc<Context>,
        count: u32,
        args: &'a [ParamValue],
    ) -> Self {
        Self {
            entry,
            context,
            count,
            args,
        }
    }

    pub fn resource(&self) -> &ResourceWrapper {
        self.entry.resource()
    }

    pub fn context(&self) -> &Arc<Context> {
        self.context
    }

    pub fn origin(&self) -> &str {
        self.context.origin()
    }

    /// 本阶段的权重：进入时为入口权重，退出时为 `exit_with` 传入的权重。
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn prioritized(&self) -> bool {
        self.entry.prioritized()
    }

    pub fn args(&self) -> &[ParamValue] {
        self.args
    }

    pub fn create_timestamp(&self) -> i64 {
        self.entry.create_timestamp()
    }

    pub fn entry(&self) -> EntryRef {
        EntryRef::from_inner(Arc::clone(self.entry))
    }

    pub fn cur_node(&self) -> Option<&Arc<ClusterNode>> {
        self.entry.cur_node()
    }

    pub fn set_cur_node(&self, node: Arc<ClusterNode>) {
        self.entry.set_cur_node(node);
    }

    pub fn origin_node(&self) -> Option<&Arc<StatisticNode>> {
        self.entry.origin_node()
    }

    pub fn set_origin_node(&self, node: Arc<StatisticNode>) {
        self.entry.set_origin_node(node);
    }

    /// 调用方通过 `set_error` 记录的业务异常。
    pub fn error(&self) -> Option<BizError> {
        self.entry.error()
    }

    pub fn when_terminate(&self, handler: impl FnOnce(&EntryRef) + Send + 'static) {
        self.entry.when_terminate(Box::new(handler));
    }
}

/// 槽位链中的单个处理阶段。
pub trait ProcessorSlot: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// 排序键，越小越先执行。
    fn order(&self) -> i32 {
        0
    }

    fn entry(&self, ctx: &SlotContext<'_>) -> Result<(), BlockError> {
        let _ = ctx;
        Ok(())
    }

    fn on_entry_passed(&self, ctx: &SlotContext<'_>) {
        let _ = ctx;
    }

    fn on_entry_blocked(&self, ctx: &SlotContext<'_>, error: &BlockError) {
        let _ = (ctx, error);
    }

    fn exit(&self, ctx: &SlotContext<'_>) {
        let _ = ctx;
    }
}

/// 按 `order()` 排序后的槽位序列。
pub struct SlotChain {
    slots: Vec<Arc<dyn ProcessorSlot>>,
}

impl SlotChain {
    pub fn new(mut slots: Vec<Arc<dyn ProcessorSlot>>) -> Self {
        slots.sort_by_key(|slot| slot.order());
        Self { slots }
    }

    pub fn empty() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 按执行顺序列出槽位名称。
    pub fn slot_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|slot| slot.name()).collect()
    }

    pub fn entry(&self, ctx: &SlotContext<'_>) -> Result<(), BlockError> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Err(error) = slot.entry(ctx) {
                for ran in self.slots[..idx].iter().rev() {
                    ran.on_entry_blocked(ctx, &error);
                }
                return Err(error);
            }
        }
        for slot in self.slots.iter().rev() {
            slot.on_entry_passed(ctx);
        }
        Ok(())
    }

    pub fn exit(&self, ctx: &SlotContext<'_>) {
        for slot in self.slots.iter().rev() {
            slot.exit(ctx);
        }
    }
}

impl fmt::Debug for SlotChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotChain")
            .field("slots", &self.slot_names())
            .finish()
    }
}
