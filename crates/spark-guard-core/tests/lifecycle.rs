//! 入口/退出生命周期的集成测试。
//!
//! # 教案式说明
//! - **意图 (Why)**：验证上下文栈语义：当前入口随进入/退出正确推进与回退，配对错误被检测并恢复，
//!   异步入口不会污染调用方上下文；
//! - **契约 (What)**：每个用例使用独立的资源名，避免与同一进程内其他用例共享规则与统计。

use std::io;
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicBool, Ordering};

use spark_guard_core::context::{self, ContextExt, DEFAULT_CONTEXT_NAME};
use spark_guard_core::node;
use spark_guard_core::rule::{FlowRule, flow};
use spark_guard_core::{BlockKind, EntryExitError, EntryState, global};
use tracing_test::traced_test;

/// 未绑定上下文时进入默认上下文，顶层入口退出后自动解除绑定。
#[test]
fn simple_pass_uses_default_context_and_unbinds_on_exit() {
    context::exit();
    let entry = global().entry("lc-simple").expect("无规则时必须放行");

    let bound = context::current().expect("入口创建后线程必须绑定上下文");
    assert_eq!(bound.name(), DEFAULT_CONTEXT_NAME);
    assert_eq!(bound.cur_entry(), Some(entry.handle()));

    entry.exit().expect("配对退出");
    assert!(context::current().is_none(), "默认上下文在顶层入口退出后解除绑定");
}

#[test]
fn nested_entries_restore_parent_on_exit() {
    let ctx = context::enter("lc-nested", "app-a");
    let outer = global().entry("lc-nested-outer").unwrap();
    let inner = global().entry("lc-nested-inner").unwrap();

    assert_eq!(inner.parent(), Some(outer.handle()));
    assert_eq!(ctx.cur_entry(), Some(inner.handle()));

    inner.exit().unwrap();
    assert_eq!(ctx.cur_entry(), Some(outer.handle()));
    outer.exit().unwrap();
    assert!(ctx.cur_entry().is_none());

    assert!(context::current().is_some(), "显式进入的上下文需显式退出");
    context::exit();
    assert!(context::current().is_none());
}

#[traced_test]
#[test]
fn out_of_order_exit_resets_call_tree() {
    let ctx = context::enter("lc-mismatch", "");
    let outer = global().entry("lc-mismatch-outer").unwrap();
    let inner = global().entry("lc-mismatch-inner").unwrap();
    let outer_handle = outer.handle();
    let inner_handle = inner.handle();

    let err = outer.exit().unwrap_err();
    assert!(matches!(err, EntryExitError::ErrorEntryFree { .. }));
    assert_eq!(err.code(), "spark.guard.entry.free_mismatch");
    assert!(ctx.cur_entry().is_none(), "配对错误后当前入口必须清空");
    assert_eq!(inner_handle.state(), EntryState::Exited, "悬挂入口被逐个退出");
    assert_eq!(outer_handle.state(), EntryState::Exited);

    assert!(inner.exit().is_ok(), "已退出的入口再次退出为空操作");
    assert!(logs_contain("entry exited out of order"));
    context::exit();
}

#[test]
fn blocked_entry_is_not_left_current() {
    flow::manager()
        .load_rules(vec![FlowRule::new("lc-blocked", 0.0)])
        .unwrap();
    let ctx = context::enter("lc-blocked-ctx", "");
    let parent = global().entry("lc-blocked-parent").unwrap();

    let blocked = global().entry("lc-blocked").unwrap_err();
    assert_eq!(blocked.kind(), BlockKind::FLOW);
    assert_eq!(blocked.resource(), "lc-blocked");
    assert_eq!(ctx.cur_entry(), Some(parent.handle()), "被阻断的入口不得成为当前入口");

    let node = node::registry()
        .find_by_name("lc-blocked")
        .pop()
        .expect("阻断前节点已创建");
    assert!(node.stat().block_qps() > 0.0);
    assert_eq!(node.stat().pass_qps(), 0.0, "阻断不得消耗通过配额");

    parent.exit().unwrap();
    context::exit();
}

#[test]
fn business_error_is_counted_and_terminate_hook_fires() {
    context::exit();
    let fired = Arc::new(AtomicBool::new(false));
    let entry = global().entry("lc-error").unwrap();
    entry.set_error(io::Error::other("downstream failed"));
    let flag = Arc::clone(&fired);
    entry.when_terminate(move |handle| {
        assert_eq!(handle.resource().name(), "lc-error");
        assert!(handle.error().is_some());
        flag.store(true, Ordering::SeqCst);
    });
    let node = entry.cur_node().expect("节点选择槽位已绑定资源节点");
    assert_eq!(node.stat().cur_thread_num(), 1);

    entry.exit().unwrap();
    assert!(fired.load(Ordering::SeqCst));
    assert!(node.stat().exception_qps() > 0.0);
    assert_eq!(node.stat().cur_thread_num(), 0);
}

#[test]
fn async_entry_links_children_across_threads() {
    let caller = context::enter("lc-async", "");
    let parent = global().entry("lc-async-parent").unwrap();
    let async_entry = global().async_entry("lc-async-call").unwrap();

    assert_eq!(
        caller.cur_entry(),
        Some(parent.handle()),
        "异步入口创建后调用方上下文恢复为父入口"
    );
    let async_ctx = async_entry.async_context().expect("异步上下文已初始化");
    assert!(async_ctx.is_async());
    assert_eq!(async_ctx.cur_entry(), Some(async_entry.handle()));

    let moved = Arc::clone(&async_ctx);
    let child_parent = std::thread::spawn(move || {
        context::run_on_context(moved, || {
            let child = global().entry("lc-async-child").unwrap();
            let parent = child.parent();
            child.exit().unwrap();
            parent
        })
    })
    .join()
    .unwrap();
    assert_eq!(child_parent, Some(async_entry.handle()));

    assert!(matches!(
        async_entry.init_async_context(),
        Err(EntryExitError::AsyncContextAlreadyInitialized { .. })
    ));

    async_entry.exit().unwrap();
    assert_eq!(
        caller.cur_entry(),
        Some(parent.handle()),
        "异步入口退出不得修改调用方上下文"
    );
    parent.exit().unwrap();
    context::exit();
}

/// 多个回调同时恢复同一异步上下文：兄弟入口都挂在异步入口之下，按任意顺序退出都合法。
#[test]
fn concurrent_resumptions_of_one_async_context_stay_independent() {
    context::exit();
    let async_entry = global().async_entry("lc-fan-call").unwrap();
    let async_ctx = async_entry.async_context().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let first_exited = Arc::new(Barrier::new(2));

    let spawn_sibling = |resource: &'static str, exits_first: bool| {
        let async_ctx = Arc::clone(&async_ctx);
        let entered = Arc::clone(&entered);
        let first_exited = Arc::clone(&first_exited);
        std::thread::spawn(move || {
            context::run_on_context(async_ctx, || {
                let child = global().entry(resource).unwrap();
                let parent = child.parent();
                entered.wait();

                // 在兄弟入口存活期间再向下扇出一层。
                let grandchild_parent = {
                    let resumed = context::current().unwrap();
                    std::thread::spawn(move || {
                        context::run_on_context(resumed, || {
                            let grandchild = global().entry("lc-fan-leaf").unwrap();
                            let parent = grandchild.parent();
                            grandchild.exit().map(|_| parent)
                        })
                    })
                    .join()
                    .unwrap()
                };

                if !exits_first {
                    first_exited.wait();
                }
                let exited = child.exit();
                if exits_first {
                    first_exited.wait();
                }
                (parent, grandchild_parent, exited)
            })
        })
    };

    let first = spawn_sibling("lc-fan-a", true);
    let second = spawn_sibling("lc-fan-b", false);
    let (a_parent, a_leaf_parent, a_exit) = first.join().unwrap();
    let (b_parent, b_leaf_parent, b_exit) = second.join().unwrap();

    assert_eq!(a_parent, Some(async_entry.handle()));
    assert_eq!(b_parent, Some(async_entry.handle()), "兄弟入口不得互相嵌套");
    assert!(a_exit.is_ok(), "先退出的兄弟入口不是乱序退出");
    assert!(b_exit.is_ok());
    assert_eq!(
        a_leaf_parent.unwrap().map(|entry| entry.resource().name().to_owned()),
        Some("lc-fan-a".to_owned())
    );
    assert_eq!(
        b_leaf_parent.unwrap().map(|entry| entry.resource().name().to_owned()),
        Some("lc-fan-b".to_owned())
    );

    assert_eq!(async_entry.state(), EntryState::Entered);
    assert_eq!(
        async_ctx.cur_entry(),
        Some(async_entry.handle()),
        "异步入口仍是异步上下文的当前入口"
    );
    async_entry.exit().unwrap();
}

#[test]
fn out_of_order_exit_in_resumption_keeps_async_entry() {
    context::exit();
    let async_entry = global().async_entry("lc-resume-call").unwrap();
    let async_ctx = async_entry.async_context().unwrap();

    let (result, reset_to) = context::run_on_context(Arc::clone(&async_ctx), || {
        let outer = global().entry("lc-resume-outer").unwrap();
        let inner = global().entry("lc-resume-inner").unwrap();
        let result = outer.exit();
        assert_eq!(inner.state(), EntryState::Exited, "悬挂入口随重置退出");
        (result, context::current().and_then(|ctx| ctx.cur_entry()))
    });

    assert!(matches!(result, Err(EntryExitError::ErrorEntryFree { .. })));
    assert_eq!(reset_to, Some(async_entry.handle()), "恢复上下文重置到恢复起点");
    assert_eq!(async_entry.state(), EntryState::Entered);
    assert_eq!(async_ctx.cur_entry(), Some(async_entry.handle()));
    async_entry.exit().unwrap();
}

#[test]
fn context_scope_binds_async_context_around_polls() {
    context::exit();
    let async_entry = global().async_entry("lc-scope-call").unwrap();
    assert!(context::current().is_none(), "默认上下文随异步入口摘除而解除绑定");
    let async_ctx = async_entry.async_context().unwrap();

    let parent = futures::executor::block_on(
        async {
            let child = global().entry("lc-scope-child").unwrap();
            let parent = child.parent();
            child.exit().unwrap();
            parent
        }
        .in_context(async_ctx),
    );
    assert_eq!(parent, Some(async_entry.handle()));
    assert!(context::current().is_none(), "轮询结束后恢复原绑定");
    async_entry.exit().unwrap();
}
