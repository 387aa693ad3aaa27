//! 在异步任务的每次 `poll` 周围绑定调用上下文。
//!
//! 任务可能在任意工作线程上被唤醒，线程本地绑定不能跨越 `.await` 存活；
//! [`ContextScope`] 在每次轮询前绑定、轮询后恢复，使任务内部创建的入口始终挂到同一上下文。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use pin_project_lite::pin_project;

use super::{Context, bind_during};

pin_project! {
    /// 绑定了调用上下文的 future。
    #[must_use = "futures do nothing unless polled"]
    pub struct ContextScope<F> {
        context: Arc<Context>,
        #[pin]
        inner: F,
    }
}

impl<F> ContextScope<F> {
    /// 异步上下文在此派生一次恢复上下文，之后每次 poll 都绑定同一实例，
    /// 跨 poll 的入口与退出因此落在同一条调用路径上。
    pub fn new(context: Arc<Context>, inner: F) -> Self {
        Self {
            context: context.resume(),
            inner,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }
}

impl<F: Future> Future for ContextScope<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let context = Arc::clone(this.context);
        let inner = this.inner;
        bind_during(context, move || inner.poll(cx))
    }
}

/// 为任意 future 提供 `.in_context(ctx)` 语法。
pub trait ContextExt: Future + Sized {
    fn in_context(self, context: Arc<Context>) -> ContextScope<Self> {
        ContextScope::new(context, self)
    }
}

impl<F: Future> ContextExt for F {}
