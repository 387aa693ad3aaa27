//! 异步入口。
//!
//! # 教案式注释
//! - **意图 (Why)**：调用在当前线程发起、却在回调或其他任务中完成时，入口不能继续占据调用方
//!   上下文的栈顶，否则调用方后续的同步入口会被错误地挂到它之下；
//! - **逻辑 (How)**：准入通过后，入口派生一个带异步标记的上下文（当前入口即自身），
//!   随后把调用方上下文的当前入口恢复为父入口；
//! - **契约 (What)**：异步上下文只初始化一次；退出发生在异步上下文中，不再修改调用方上下文；
//!   其他线程通过 [`AsyncEntry::run`] 或 [`crate::context::ContextExt::in_context`] 绑定异步上下文后，
//!   新建入口会以异步入口为父入口。

use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::warn;

use super::{BizError, EntryInner, EntryRef, EntryState, restore_parent};
use crate::context::{self, Context};
use crate::error::EntryExitError;
use crate::resource::{ParamValue, ResourceWrapper};

#[must_use = "an async entry must be exited, otherwise its statistics stay in flight"]
pub struct AsyncEntry {
    inner: Arc<EntryInner>,
    async_context: OnceLock<Arc<Context>>,
}

impl AsyncEntry {
    pub(crate) fn new(inner: Arc<EntryInner>) -> Self {
        Self {
            inner,
            async_context: OnceLock::new(),
        }
    }

    /// 派生异步上下文；第二次调用返回 [`EntryExitError::AsyncContextAlreadyInitialized`]。
    pub fn init_async_context(&self) -> Result<(), EntryExitError> {
        let origin = self.inner.context();
        let forked = origin.fork_async(&self.inner);
        self.async_context
            .set(Arc::clone(&forked))
            .map_err(|_| EntryExitError::AsyncContextAlreadyInitialized {
                resource: self.inner.resource().name().to_owned(),
            })?;
        self.inner.set_context(forked);
        Ok(())
    }

    /// 若异步入口仍是调用方上下文的当前入口，则恢复为父入口。
    pub(crate) fn clean_current_entry_in_local(&self, origin: &Arc<Context>) {
        if origin.is_cur_entry(&self.inner) {
            restore_parent(&self.inner, origin);
        }
    }

    pub fn async_context(&self) -> Option<Arc<Context>> {
        self.async_context.get().cloned()
    }

    /// 在异步上下文绑定下执行 `f`。
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.async_context.get() {
            Some(async_context) => context::run_on_context(Arc::clone(async_context), f),
            None => f(),
        }
    }

    pub fn resource(&self) -> &ResourceWrapper {
        self.inner.resource()
    }

    pub fn count(&self) -> u32 {
        self.inner.count()
    }

    pub fn state(&self) -> EntryState {
        self.inner.state()
    }

    pub fn set_error(&self, error: impl StdError + Send + Sync + 'static) {
        self.inner.set_error(Arc::new(error));
    }

    pub fn error(&self) -> Option<BizError> {
        self.inner.error()
    }

    pub fn when_terminate(&self, handler: impl FnOnce(&EntryRef) + Send + 'static) {
        self.inner.when_terminate(Box::new(handler));
    }

    pub fn handle(&self) -> EntryRef {
        EntryRef::from_inner(Arc::clone(&self.inner))
    }

    pub fn exit(self) -> Result<(), EntryExitError> {
        let args = Arc::clone(self.inner.args());
        let count = self.inner.count();
        self.exit_with(count, &args)
    }

    pub fn exit_with(self, count: u32, args: &[ParamValue]) -> Result<(), EntryExitError> {
        let context = self.inner.context();
        self.inner.exit_in(&context, count, args)
    }
}

impl fmt::Debug for AsyncEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEntry")
            .field("resource", self.resource())
            .field("state", &self.state())
            .field("async_context", &self.async_context.get().is_some())
            .finish()
    }
}

impl Drop for AsyncEntry {
    fn drop(&mut self) {
        if self.inner.state() != EntryState::Exited {
            warn!(
                target: "spark.guard.core",
                resource = self.inner.resource().name(),
                "async entry dropped without exit; its statistics will never complete"
            );
        }
    }
}
