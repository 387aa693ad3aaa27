//! # context 模块说明
//!
//! ## 核心意图（Why）
//! - 调用上下文把同一逻辑执行中嵌套的入口串成一条活动路径，统计归属与入口/退出配对校验都依赖它；
//! - 上下文绑定在线程本地存储中，并且只在 `enter`/`exit` 边界被设置、读取、清除；
//!   跨线程或跨任务的交接必须显式重新绑定（[`run_on_context`]、[`ContextScope`]），不会隐式继承。
//!
//! ## 行为契约（What）
//! - [`enter`]：线程已绑定上下文时直接复用；否则按名称查找入口节点，名称表未满时注册新名称，
//!   超出上限时退化为共享的默认上下文；
//! - [`exit`]：解除绑定；未绑定或仍有活动入口时为空操作；
//! - 默认上下文由 `Sph` 在无绑定时隐式创建，并在顶层入口退出后自动解除绑定。
//!
//! ## 风险提示（Trade-offs）
//! - 上下文只保存“当前入口”的弱引用，完整的调用路径靠入口的父指针回溯；
//! - 名称表为进程级、只增不减，名称应为低基数字符串。

mod scope;

pub use scope::{ContextExt, ContextScope};

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config;
use crate::entry::{EntryInner, EntryRef};
use crate::node::StatisticNode;

/// 默认上下文名称。
pub const DEFAULT_CONTEXT_NAME: &str = "spark_guard_default_context";

/// 一次调用树遍历的状态。
pub struct Context {
    name: Arc<str>,
    origin: Arc<str>,
    entrance_node: Arc<StatisticNode>,
    cur_entry: Mutex<Option<Weak<EntryInner>>>,
    is_async: bool,
    /// 恢复上下文的起点入口；普通上下文与异步上下文本身为 `None`。
    resumed_from: Option<Weak<EntryInner>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("is_async", &self.is_async)
            .field(
                "cur_entry",
                &self.cur_entry().map(|entry| entry.resource().name().to_owned()),
            )
            .finish()
    }
}

impl Context {
    fn new(name: Arc<str>, origin: Arc<str>, entrance_node: Arc<StatisticNode>) -> Self {
        Self {
            name,
            origin,
            entrance_node,
            cur_entry: Mutex::new(None),
            is_async: false,
            resumed_from: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn entrance_node(&self) -> &Arc<StatisticNode> {
        &self.entrance_node
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn is_default(&self) -> bool {
        &*self.name == DEFAULT_CONTEXT_NAME
    }

    /// 当前活动入口；入口句柄已全部释放时返回 `None`。
    pub fn cur_entry(&self) -> Option<EntryRef> {
        self.cur_entry_inner().map(EntryRef::from_inner)
    }

    pub(crate) fn cur_entry_inner(&self) -> Option<Arc<EntryInner>> {
        self.cur_entry.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn is_cur_entry(&self, entry: &Arc<EntryInner>) -> bool {
        match self.cur_entry.lock().as_ref() {
            Some(current) => std::ptr::eq(current.as_ptr(), Arc::as_ptr(entry)),
            None => false,
        }
    }

    pub(crate) fn set_cur_entry(&self, entry: Option<&Arc<EntryInner>>) {
        *self.cur_entry.lock() = entry.map(Arc::downgrade);
    }

    /// 派生异步上下文：复制名称、来源与入口节点，当前入口指向 `entry`。
    pub(crate) fn fork_async(&self, entry: &Arc<EntryInner>) -> Arc<Context> {
        Arc::new(Context {
            name: Arc::clone(&self.name),
            origin: Arc::clone(&self.origin),
            entrance_node: Arc::clone(&self.entrance_node),
            cur_entry: Mutex::new(Some(Arc::downgrade(entry))),
            is_async: true,
            resumed_from: None,
        })
    }

    /// 为一次恢复派生独立的上下文。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：同一个异步上下文可能被多个回调同时恢复，若共用一个 `cur_entry`，
    ///   兄弟回调的入口会互相嵌套，按序退出也会触发 ErrorEntryFree；
    /// - **逻辑 (How)**：异步上下文每次恢复都得到新实例，共享名称、来源与入口节点，
    ///   当前入口初始化为被恢复上下文的当前入口，并记为恢复起点；
    /// - **契约 (What)**：恢复起点之下的入口退出后当前入口回到起点；起点本身仍归原上下文管理。
    ///   非异步上下文原样返回。
    pub(crate) fn resume(self: &Arc<Self>) -> Arc<Context> {
        if !self.is_async {
            return Arc::clone(self);
        }
        let base = self.cur_entry.lock().clone();
        Arc::new(Context {
            name: Arc::clone(&self.name),
            origin: Arc::clone(&self.origin),
            entrance_node: Arc::clone(&self.entrance_node),
            cur_entry: Mutex::new(base.clone()),
            is_async: true,
            resumed_from: base,
        })
    }

    /// 恢复起点入口（仍存活时）。
    pub(crate) fn resumed_from(&self) -> Option<Arc<EntryInner>> {
        self.resumed_from.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn is_resumed_from(&self, entry: &Arc<EntryInner>) -> bool {
        self.resumed_from
            .as_ref()
            .is_some_and(|base| std::ptr::eq(base.as_ptr(), Arc::as_ptr(entry)))
    }
}

/// 上下文名称 → 入口节点表。
///
/// # 教案式注释
/// - **意图 (Why)**：每个上下文名称对应一个入口统计节点，名称数量必须有界，否则调用方
///   拼接动态名称会造成内存无限增长；
/// - **逻辑 (How)**：读路径通过 `ArcSwap` 无锁加载快照；首次注册在 `create_lock` 下二次检查，
///   复制快照插入后整体替换；
/// - **契约 (What)**：默认上下文名称永远可以注册，不受上限约束；超限名称返回默认条目。
pub struct ContextNameTable {
    max_size: usize,
    nodes: ArcSwap<HashMap<Arc<str>, Arc<StatisticNode>>>,
    create_lock: Mutex<()>,
}

impl ContextNameTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            nodes: ArcSwap::from_pointee(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    /// 查找或注册名称，返回实际采用的名称与入口节点。
    pub fn resolve(&self, name: &str) -> (Arc<str>, Arc<StatisticNode>) {
        if let Some((key, node)) = self.nodes.load().get_key_value(name) {
            return (Arc::clone(key), Arc::clone(node));
        }

        let _guard = self.create_lock.lock();
        let snapshot = self.nodes.load_full();
        if let Some((key, node)) = snapshot.get_key_value(name) {
            return (Arc::clone(key), Arc::clone(node));
        }

        let is_default = name == DEFAULT_CONTEXT_NAME;
        if !is_default && snapshot.len() >= self.max_size {
            warn!(
                context = name,
                max = self.max_size,
                "context name table is full, falling back to the default context"
            );
            if let Some((key, node)) = snapshot.get_key_value(DEFAULT_CONTEXT_NAME) {
                return (Arc::clone(key), Arc::clone(node));
            }
            return self.insert(&snapshot, DEFAULT_CONTEXT_NAME);
        }
        self.insert(&snapshot, name)
    }

    fn insert(
        &self,
        snapshot: &HashMap<Arc<str>, Arc<StatisticNode>>,
        name: &str,
    ) -> (Arc<str>, Arc<StatisticNode>) {
        let key: Arc<str> = Arc::from(name);
        let node = Arc::new(StatisticNode::new());
        let mut next = snapshot.clone();
        next.insert(Arc::clone(&key), Arc::clone(&node));
        self.nodes.store(Arc::new(next));
        debug!(context = name, "registered context entrance node");
        (key, node)
    }

    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.load().is_empty()
    }
}

static NAME_TABLE: OnceLock<ContextNameTable> = OnceLock::new();

fn name_table() -> &'static ContextNameTable {
    NAME_TABLE.get_or_init(|| ContextNameTable::new(config::engine().max_context_name_size))
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Context>>> = const { RefCell::new(None) };
}

/// 进入（或复用）名为 `name` 的上下文，并绑定到当前线程。
pub fn enter(name: &str, origin: &str) -> Arc<Context> {
    if let Some(current) = current() {
        return current;
    }
    let (name, entrance) = name_table().resolve(name);
    let context = Arc::new(Context::new(name, Arc::from(origin), entrance));
    bind(Some(Arc::clone(&context)));
    context
}

/// 解除当前线程的上下文绑定。
pub fn exit() {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let idle = slot
            .as_ref()
            .is_some_and(|context| context.cur_entry_inner().is_none());
        if idle {
            *slot = None;
        }
    });
}

/// 当前线程绑定的上下文。
pub fn current() -> Option<Arc<Context>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// 替换当前线程绑定，返回旧值。
pub fn replace(context: Option<Arc<Context>>) -> Option<Arc<Context>> {
    CURRENT.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), context))
}

fn bind(context: Option<Arc<Context>>) {
    replace(context);
}

pub(crate) fn current_or_default() -> Arc<Context> {
    match current() {
        Some(context) => context,
        None => enter(DEFAULT_CONTEXT_NAME, ""),
    }
}

/// 若当前线程绑定的正是 `context`，则解除绑定。
pub(crate) fn unbind_if(context: &Arc<Context>) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot
            .as_ref()
            .is_some_and(|bound| Arc::ptr_eq(bound, context))
        {
            *slot = None;
        }
    });
}

struct RestoreGuard {
    previous: Option<Option<Arc<Context>>>,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            replace(previous);
        }
    }
}

/// 在 `context` 绑定的状态下执行 `f`，结束后（包括 panic 展开）恢复原绑定。
///
/// 异步入口把自己的异步上下文交给其他线程时使用：新线程上的嵌套入口会挂到异步入口之下。
/// 异步上下文每次调用都派生独立的恢复上下文，并发的兄弟回调互不干扰。
pub fn run_on_context<R>(context: Arc<Context>, f: impl FnOnce() -> R) -> R {
    bind_during(context.resume(), f)
}

/// 原样绑定 `context` 执行 `f`，不派生恢复上下文。
pub(crate) fn bind_during<R>(context: Arc<Context>, f: impl FnOnce() -> R) -> R {
    let _guard = RestoreGuard {
        previous: Some(replace(Some(context))),
    };
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_coerces_names_beyond_cap_to_default() {
        let table = ContextNameTable::new(2);
        let (a, _) = table.resolve("ctx-a");
        let (b, _) = table.resolve("ctx-b");
        let (c, c_node) = table.resolve("ctx-c");
        let (default, default_node) = table.resolve(DEFAULT_CONTEXT_NAME);

        assert_eq!(&*a, "ctx-a");
        assert_eq!(&*b, "ctx-b");
        assert_eq!(&*c, DEFAULT_CONTEXT_NAME, "超限名称必须退化为默认上下文");
        assert_eq!(&*default, DEFAULT_CONTEXT_NAME);
        assert!(Arc::ptr_eq(&c_node, &default_node));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn existing_names_are_reused_after_cap() {
        let table = ContextNameTable::new(1);
        let (_, first) = table.resolve("ctx-only");
        let (_, again) = table.resolve("ctx-only");
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn enter_reuses_bound_context_and_exit_is_idempotent() {
        exit();
        let first = enter("ctx-reuse", "app-a");
        let second = enter("ctx-other", "app-b");
        assert!(Arc::ptr_eq(&first, &second), "已绑定时 enter 复用现有上下文");
        assert_eq!(first.origin(), "app-a");

        exit();
        assert!(current().is_none());
        exit();
        assert!(current().is_none());
    }

    #[test]
    fn run_on_context_restores_previous_binding() {
        exit();
        let outer = enter("ctx-outer", "");
        let (name, node) = name_table().resolve("ctx-inner");
        let inner = Arc::new(Context::new(name, Arc::from(""), node));

        let seen = run_on_context(Arc::clone(&inner), || current().map(|c| c.name().to_owned()));
        assert_eq!(seen.as_deref(), Some("ctx-inner"));
        assert!(Arc::ptr_eq(&current().unwrap(), &outer));
        exit();
    }
}
