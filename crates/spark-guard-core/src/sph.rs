//! # sph 模块说明
//!
//! ## 角色定位（Why）
//! - `Sph` 是业务代码唯一需要接触的入口：给定资源名，返回放行的 [`Entry`] 或描述拒绝原因的
//!   [`BlockError`]；
//! - 它把“查找/构建槽位链 → 创建入口并挂到上下文 → 执行进入阶段”串成一次同步调用。
//!
//! ## 行为契约（What）
//! - 线程未绑定上下文时隐式进入默认上下文，该上下文在顶层入口退出后自动解除绑定；
//! - 槽位链缓存已满时返回无链入口：放行、不统计、不保护；
//! - 阻断时入口从上下文中摘除，不消耗任何配额，错误直接返回给调用方。
//!
//! ## 使用示例
//! ```no_run
//! use spark_guard_core::{EntryBuilder, EntryType};
//!
//! match EntryBuilder::new("orders.create").entry_type(EntryType::In).build() {
//!     Ok(entry) => {
//!         // 业务逻辑
//!         entry.exit().expect("paired exit");
//!     }
//!     Err(blocked) => eprintln!("rejected: {blocked}"),
//! }
//! ```

use std::sync::{Arc, OnceLock};

use crate::config::{self, EngineConfig};
use crate::context;
use crate::entry::{AsyncEntry, Entry, EntryInner};
use crate::error::{BlockError, ConfigError};
use crate::resource::{EntryType, ParamValue, ResourceType, ResourceWrapper};
use crate::slot::{ChainRegistry, DefaultSlotChainBuilder, SlotChainBuilder, SlotContext};

/// 资源准入门面。
#[derive(Debug)]
pub struct Sph {
    chains: ChainRegistry,
}

impl Default for Sph {
    fn default() -> Self {
        Self::new(config::engine())
    }
}

impl Sph {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_builder(config.max_slot_chain_size, Arc::new(DefaultSlotChainBuilder))
    }

    /// 使用自定义槽位链构建器。
    pub fn with_builder(max_chains: usize, builder: Arc<dyn SlotChainBuilder>) -> Self {
        Self {
            chains: ChainRegistry::new(max_chains, builder),
        }
    }

    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    pub fn builder(&self, name: impl Into<Arc<str>>) -> EntryBuilder<'_> {
        EntryBuilder::with_sph(self, name)
    }

    /// 以默认参数（出站、权重 1、无参数）进入资源。
    pub fn entry(&self, name: impl Into<Arc<str>>) -> Result<Entry, BlockError> {
        self.builder(name).build()
    }

    /// 布尔风格入口：阻断时返回 `None`。
    pub fn try_entry(&self, name: impl Into<Arc<str>>) -> Option<Entry> {
        self.builder(name).try_build()
    }

    pub fn async_entry(&self, name: impl Into<Arc<str>>) -> Result<AsyncEntry, BlockError> {
        self.builder(name).build_async()
    }

    fn enter(
        &self,
        resource: ResourceWrapper,
        count: u32,
        prioritized: bool,
        args: Arc<[ParamValue]>,
    ) -> Result<Arc<EntryInner>, BlockError> {
        let context = context::current_or_default();
        let chain = self.chains.lookup_or_build(&resource);
        let inner = EntryInner::link(
            resource,
            chain.clone(),
            &context,
            count,
            prioritized,
            Arc::clone(&args),
        );
        if let Some(chain) = chain {
            let slot_ctx = SlotContext::new(&inner, &context, count, &args);
            if let Err(blocked) = chain.entry(&slot_ctx) {
                inner.unlink_blocked(&context, &blocked);
                return Err(blocked);
            }
        }
        inner.mark_entered();
        Ok(inner)
    }
}

/// 入口构建器。
///
/// ```no_run
/// use spark_guard_core::{EntryBuilder, EntryType};
///
/// let entry = EntryBuilder::new("items.query")
///     .entry_type(EntryType::In)
///     .count(2)
///     .arg("sku-42")
///     .prioritized(true)
///     .build();
/// ```
#[must_use = "builders do nothing until `build` is called"]
pub struct EntryBuilder<'a> {
    sph: &'a Sph,
    name: Arc<str>,
    entry_type: EntryType,
    resource_type: ResourceType,
    count: u32,
    args: Vec<ParamValue>,
    prioritized: bool,
}

impl EntryBuilder<'static> {
    /// 基于进程级 [`global`] 实例创建构建器。
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_sph(global(), name)
    }
}

impl<'a> EntryBuilder<'a> {
    pub fn with_sph(sph: &'a Sph, name: impl Into<Arc<str>>) -> Self {
        Self {
            sph,
            name: name.into(),
            entry_type: EntryType::Out,
            resource_type: ResourceType::Common,
            count: 1,
            args: Vec::new(),
            prioritized: false,
        }
    }

    pub fn entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = entry_type;
        self
    }

    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn arg(mut self, arg: impl Into<ParamValue>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ParamValue>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn prioritized(mut self, prioritized: bool) -> Self {
        self.prioritized = prioritized;
        self
    }

    fn enter(self) -> Result<Arc<EntryInner>, BlockError> {
        let resource =
            ResourceWrapper::new(self.name, self.entry_type).with_resource_type(self.resource_type);
        self.sph.enter(
            resource,
            self.count,
            self.prioritized,
            Arc::from(self.args),
        )
    }

    pub fn build(self) -> Result<Entry, BlockError> {
        self.enter().map(Entry::new)
    }

    pub fn try_build(self) -> Option<Entry> {
        self.build().ok()
    }

    /// 异步入口：准入通过后派生异步上下文，并把调用方上下文的当前入口恢复为父入口。
    pub fn build_async(self) -> Result<AsyncEntry, BlockError> {
        let inner = self.enter()?;
        let origin = inner.context();
        let entry = AsyncEntry::new(inner);
        // 新建入口的异步上下文必然尚未初始化。
        let _ = entry.init_async_context();
        entry.clean_current_entry_in_local(&origin);
        Ok(entry)
    }
}

static GLOBAL: OnceLock<Sph> = OnceLock::new();

/// 进程级 `Sph` 实例；未调用 [`init`] 时使用默认配置。
pub fn global() -> &'static Sph {
    GLOBAL.get_or_init(Sph::default)
}

/// 以指定配置初始化进程级引擎，必须先于任何入口调用。
pub fn init(config: EngineConfig) -> Result<&'static Sph, ConfigError> {
    config.validate()?;
    if !config::install(config) {
        return Err(ConfigError::AlreadyInitialized);
    }
    Ok(global())
}
