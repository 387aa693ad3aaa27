//! # entry 模块说明
//!
//! ## 核心意图（Why）
//! - 入口是一次“被准入的调用”的句柄：它把资源、父入口、统计节点与业务错误串在一起，
//!   并在退出时驱动槽位链的退出侧逻辑（RT、成功数、并发数、熔断探测）；
//! - 每个上下文内的入口构成严格的栈，退出顺序必须与进入顺序相反。
//!
//! ## 行为契约（What）
//! - 状态机 `Created → Entered → Exited` 由原子变量推进，重复退出为无副作用的 `Ok(())`；
//! - 退出的入口不是上下文当前入口时返回 [`EntryExitError::ErrorEntryFree`]：
//!   栈中位于其上的悬挂入口会被逐个退出，上下文当前入口清空，同时记录 `error` 日志；
//! - 被阻断的入口不执行槽位链退出侧，但会执行 `when_terminate` 回调并从上下文中摘除。
//!
//! ## 风险提示（Trade-offs）
//! - [`Entry`] 被丢弃而未退出时只记录 `warn` 日志，不做隐式退出：隐式退出会让统计归属到
//!   错误的时间点，并掩盖调用方的配对错误。

mod async_entry;

pub use async_entry::AsyncEntry;

use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::clock::current_time_millis;
use crate::context::{self, Context};
use crate::error::{BlockError, EntryExitError};
use crate::node::{ClusterNode, StatisticNode};
use crate::resource::{ParamValue, ResourceWrapper};
use crate::slot::{SlotChain, SlotContext};

/// 业务错误的共享表示。
pub type BizError = Arc<dyn StdError + Send + Sync>;

type TerminateHandler = Box<dyn FnOnce(&EntryRef) + Send>;

const STATE_CREATED: u8 = 0;
const STATE_ENTERED: u8 = 1;
const STATE_EXITED: u8 = 2;

/// 入口生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Created,
    Entered,
    Exited,
}

impl EntryState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_CREATED => EntryState::Created,
            STATE_ENTERED => EntryState::Entered,
            _ => EntryState::Exited,
        }
    }
}

pub(crate) struct EntryInner {
    resource: ResourceWrapper,
    chain: Option<Arc<SlotChain>>,
    context: ArcSwap<Context>,
    parent: Option<Arc<EntryInner>>,
    count: u32,
    prioritized: bool,
    args: Arc<[ParamValue]>,
    create_timestamp: i64,
    cur_node: OnceLock<Arc<ClusterNode>>,
    origin_node: OnceLock<Arc<StatisticNode>>,
    error: Mutex<Option<BizError>>,
    block_error: Mutex<Option<BlockError>>,
    terminate_handlers: Mutex<Vec<TerminateHandler>>,
    state: AtomicU8,
}

impl EntryInner {
    /// 创建入口并挂到 `context` 的当前入口之下，随后成为新的当前入口。
    pub(crate) fn link(
        resource: ResourceWrapper,
        chain: Option<Arc<SlotChain>>,
        context: &Arc<Context>,
        count: u32,
        prioritized: bool,
        args: Arc<[ParamValue]>,
    ) -> Arc<Self> {
        let inner = Arc::new(Self {
            resource,
            chain,
            context: ArcSwap::new(Arc::clone(context)),
            parent: context.cur_entry_inner(),
            count,
            prioritized,
            args,
            create_timestamp: current_time_millis(),
            cur_node: OnceLock::new(),
            origin_node: OnceLock::new(),
            error: Mutex::new(None),
            block_error: Mutex::new(None),
            terminate_handlers: Mutex::new(Vec::new()),
            state: AtomicU8::new(STATE_CREATED),
        });
        context.set_cur_entry(Some(&inner));
        inner
    }

    pub(crate) fn resource(&self) -> &ResourceWrapper {
        &self.resource
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn prioritized(&self) -> bool {
        self.prioritized
    }

    pub(crate) fn args(&self) -> &Arc<[ParamValue]> {
        &self.args
    }

    pub(crate) fn create_timestamp(&self) -> i64 {
        self.create_timestamp
    }

    pub(crate) fn context(&self) -> Arc<Context> {
        self.context.load_full()
    }

    pub(crate) fn set_context(&self, context: Arc<Context>) {
        self.context.store(context);
    }

    pub(crate) fn cur_node(&self) -> Option<&Arc<ClusterNode>> {
        self.cur_node.get()
    }

    pub(crate) fn set_cur_node(&self, node: Arc<ClusterNode>) {
        let _ = self.cur_node.set(node);
    }

    pub(crate) fn origin_node(&self) -> Option<&Arc<StatisticNode>> {
        self.origin_node.get()
    }

    pub(crate) fn set_origin_node(&self, node: Arc<StatisticNode>) {
        let _ = self.origin_node.set(node);
    }

    pub(crate) fn error(&self) -> Option<BizError> {
        self.error.lock().clone()
    }

    pub(crate) fn set_error(&self, error: BizError) {
        *self.error.lock() = Some(error);
    }

    pub(crate) fn block_error(&self) -> Option<BlockError> {
        self.block_error.lock().clone()
    }

    pub(crate) fn when_terminate(&self, handler: TerminateHandler) {
        self.terminate_handlers.lock().push(handler);
    }

    pub(crate) fn state(&self) -> EntryState {
        EntryState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn mark_entered(&self) {
        let _ = self.state.compare_exchange(
            STATE_CREATED,
            STATE_ENTERED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// 父入口属于同一上下文时返回它，用于恢复当前入口。
    fn parent_within(&self, context: &Arc<Context>) -> Option<&Arc<EntryInner>> {
        self.parent
            .as_ref()
            .filter(|parent| {
                Arc::ptr_eq(&parent.context.load(), context) || context.is_resumed_from(parent)
            })
    }

    /// 推进到 `Exited`，必要时执行槽位链退出侧，然后执行终止回调。
    fn finish(self: &Arc<Self>, context: &Arc<Context>, count: u32, args: &[ParamValue]) {
        let previous = self.state.swap(STATE_EXITED, Ordering::AcqRel);
        if previous == STATE_EXITED {
            return;
        }
        if previous == STATE_ENTERED
            && let Some(chain) = &self.chain
        {
            chain.exit(&SlotContext::new(self, context, count, args));
        }
        self.run_terminate_handlers();
    }

    fn run_terminate_handlers(self: &Arc<Self>) {
        let handlers = std::mem::take(&mut *self.terminate_handlers.lock());
        if handlers.is_empty() {
            return;
        }
        let handle = EntryRef::from_inner(Arc::clone(self));
        for handler in handlers {
            handler(&handle);
        }
    }

    /// 被阻断的入口：记录阻断错误，不执行槽位链退出侧，从上下文中摘除。
    pub(crate) fn unlink_blocked(self: &Arc<Self>, context: &Arc<Context>, block: &BlockError) {
        *self.block_error.lock() = Some(block.clone());
        if self.state.swap(STATE_EXITED, Ordering::AcqRel) == STATE_EXITED {
            return;
        }
        self.run_terminate_handlers();
        if context.is_cur_entry(self) {
            restore_parent(self, context);
        }
    }

    /// 按照上下文栈语义退出入口。
    pub(crate) fn exit_in(
        self: &Arc<Self>,
        context: &Arc<Context>,
        count: u32,
        args: &[ParamValue],
    ) -> Result<(), EntryExitError> {
        if self.state() == EntryState::Exited {
            return Ok(());
        }

        if !context.is_cur_entry(self) {
            let current = context.cur_entry_inner();
            let current_name = current
                .as_ref()
                .map(|entry| entry.resource.name().to_owned());

            // 退出本上下文中仍悬挂的入口，越过上下文边界即停止。
            let mut cursor = current;
            while let Some(entry) = cursor {
                if !Arc::ptr_eq(&entry.context.load(), context) && !Arc::ptr_eq(&entry, self) {
                    break;
                }
                entry.finish(context, entry.count, &entry.args);
                cursor = entry.parent.clone();
            }
            context.set_cur_entry(context.resumed_from().as_ref());
            if context.is_default() && !context.is_async() {
                context::unbind_if(context);
            }

            error!(
                target: "spark.guard.core",
                resource = self.resource.name(),
                current = current_name.as_deref().unwrap_or("<none>"),
                context = context.name(),
                "entry exited out of order, the call tree of the context was reset"
            );
            return Err(EntryExitError::ErrorEntryFree {
                resource: self.resource.name().to_owned(),
                current: current_name,
            });
        }

        self.finish(context, count, args);
        restore_parent(self, context);
        Ok(())
    }
}

fn restore_parent(entry: &Arc<EntryInner>, context: &Arc<Context>) {
    let parent = entry.parent_within(context);
    context.set_cur_entry(parent);
    if parent.is_none() && context.is_default() && !context.is_async() {
        context::unbind_if(context);
    }
}

/// 入口的只读共享句柄。
///
/// 交给 `when_terminate` 回调与调用方检查使用；持有句柄不会延长入口在上下文中的活跃期。
#[derive(Clone)]
pub struct EntryRef(Arc<EntryInner>);

impl EntryRef {
    pub(crate) fn from_inner(inner: Arc<EntryInner>) -> Self {
        Self(inner)
    }

    pub fn resource(&self) -> &ResourceWrapper {
        &self.0.resource
    }

    pub fn count(&self) -> u32 {
        self.0.count
    }

    pub fn prioritized(&self) -> bool {
        self.0.prioritized
    }

    pub fn args(&self) -> &[ParamValue] {
        &self.0.args
    }

    pub fn create_timestamp(&self) -> i64 {
        self.0.create_timestamp
    }

    pub fn state(&self) -> EntryState {
        self.0.state()
    }

    pub fn parent(&self) -> Option<EntryRef> {
        self.0.parent.clone().map(EntryRef)
    }

    pub fn context(&self) -> Arc<Context> {
        self.0.context()
    }

    pub fn cur_node(&self) -> Option<Arc<ClusterNode>> {
        self.0.cur_node().cloned()
    }

    pub fn origin_node(&self) -> Option<Arc<StatisticNode>> {
        self.0.origin_node().cloned()
    }

    pub fn error(&self) -> Option<BizError> {
        self.0.error()
    }

    pub fn block_error(&self) -> Option<BlockError> {
        self.0.block_error()
    }

    /// 判断两个句柄是否指向同一入口。
    pub fn same_entry(&self, other: &EntryRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for EntryRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_entry(other)
    }
}

impl Eq for EntryRef {}

impl fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("resource", self.resource())
            .field("count", &self.count())
            .field("state", &self.state())
            .finish()
    }
}

/// 同步入口。
///
/// # 教案式注释
/// - **意图 (Why)**：`Sph::entry` 成功时返回的所有权句柄，调用方在业务逻辑结束后必须调用
///   [`Entry::exit`]；
/// - **契约 (What)**：`exit` 消耗句柄；在入口所属上下文上执行栈式退出；
/// - **风险 (Trade-offs)**：未退出即丢弃只会告警，统计与并发数将保持“进行中”状态。
#[must_use = "an entry must be exited, otherwise its statistics stay in flight"]
pub struct Entry {
    inner: Arc<EntryInner>,
}

impl Entry {
    pub(crate) fn new(inner: Arc<EntryInner>) -> Self {
        Self { inner }
    }

    pub fn resource(&self) -> &ResourceWrapper {
        self.inner.resource()
    }

    pub fn count(&self) -> u32 {
        self.inner.count
    }

    pub fn create_timestamp(&self) -> i64 {
        self.inner.create_timestamp
    }

    pub fn context(&self) -> Arc<Context> {
        self.inner.context()
    }

    pub fn parent(&self) -> Option<EntryRef> {
        self.inner.parent.clone().map(EntryRef)
    }

    pub fn cur_node(&self) -> Option<Arc<ClusterNode>> {
        self.inner.cur_node().cloned()
    }

    pub fn origin_node(&self) -> Option<Arc<StatisticNode>> {
        self.inner.origin_node().cloned()
    }

    pub fn state(&self) -> EntryState {
        self.inner.state()
    }

    /// 记录业务异常；退出时计入异常数，并驱动异常类熔断规则。
    pub fn set_error(&self, error: impl StdError + Send + Sync + 'static) {
        self.inner.set_error(Arc::new(error));
    }

    pub fn error(&self) -> Option<BizError> {
        self.inner.error()
    }

    /// 注册入口终止（退出或被阻断）时执行的回调。
    pub fn when_terminate(&self, handler: impl FnOnce(&EntryRef) + Send + 'static) {
        self.inner.when_terminate(Box::new(handler));
    }

    pub fn handle(&self) -> EntryRef {
        EntryRef(Arc::clone(&self.inner))
    }

    /// 以进入时的权重与参数退出。
    pub fn exit(self) -> Result<(), EntryExitError> {
        let args = Arc::clone(&self.inner.args);
        let count = self.inner.count;
        self.exit_with(count, &args)
    }

    pub fn exit_with(self, count: u32, args: &[ParamValue]) -> Result<(), EntryExitError> {
        let context = self.inner.context();
        self.inner.exit_in(&context, count, args)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("resource", self.resource())
            .field("count", &self.count())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if self.inner.state() != EntryState::Exited {
            warn!(
                target: "spark.guard.core",
                resource = self.inner.resource.name(),
                "entry dropped without exit; its statistics will never complete"
            );
        }
    }
}
