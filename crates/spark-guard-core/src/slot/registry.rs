use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{SlotChain, SlotChainBuilder};
use crate::resource::ResourceWrapper;

/// 资源 → 槽位链缓存。
///
/// # 教案式注释
/// - **意图 (Why)**：槽位链构建涉及规则与节点解析，只应在资源首次访问时发生一次；
/// - **逻辑 (How)**：读路径从 `ArcSwap` 快照中无锁查找；未命中时在 `build_lock` 下二次检查，
///   构建后复制快照插入并整体替换（写时复制）；
/// - **契约 (What)**：同一资源最多构建一次；缓存达到 `max_size` 后新资源得到 `None`，
///   调用方应直接放行且不做任何保护；
/// - **风险 (Trade-offs)**：写时复制让插入为 `O(n)`，但插入次数受上限约束，只在冷路径发生。
pub struct ChainRegistry {
    max_size: usize,
    builder: Arc<dyn SlotChainBuilder>,
    chains: ArcSwap<HashMap<ResourceWrapper, Arc<SlotChain>>>,
    build_lock: Mutex<()>,
}

impl ChainRegistry {
    pub fn new(max_size: usize, builder: Arc<dyn SlotChainBuilder>) -> Self {
        Self {
            max_size,
            builder,
            chains: ArcSwap::from_pointee(HashMap::new()),
            build_lock: Mutex::new(()),
        }
    }

    pub fn lookup_or_build(&self, resource: &ResourceWrapper) -> Option<Arc<SlotChain>> {
        if let Some(chain) = self.chains.load().get(resource) {
            return Some(Arc::clone(chain));
        }

        let _guard = self.build_lock.lock();
        let snapshot = self.chains.load_full();
        if let Some(chain) = snapshot.get(resource) {
            return Some(Arc::clone(chain));
        }
        if snapshot.len() >= self.max_size {
            warn!(
                target: "spark.guard.core",
                resource = resource.name(),
                max = self.max_size,
                "slot chain cache is full, resource runs without protection"
            );
            return None;
        }

        let chain = Arc::new(self.builder.build(resource));
        let mut next = (*snapshot).clone();
        next.insert(resource.clone(), Arc::clone(&chain));
        self.chains.store(Arc::new(next));
        debug!(
            target: "spark.guard.core",
            resource = resource.name(),
            slots = ?chain.slot_names(),
            "built slot chain"
        );
        Some(chain)
    }

    /// 只查找，不构建。
    pub fn get(&self, resource: &ResourceWrapper) -> Option<Arc<SlotChain>> {
        self.chains.load().get(resource).cloned()
    }

    pub fn len(&self) -> usize {
        self.chains.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.load().is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainRegistry")
            .field("max_size", &self.max_size)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::EntryType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn concurrent_lookups_build_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let registry = Arc::new(ChainRegistry::new(
            16,
            Arc::new(move |_: &ResourceWrapper| {
                counter.fetch_add(1, Ordering::SeqCst);
                SlotChain::empty()
            }),
        ));
        let resource = ResourceWrapper::new("registry-once", EntryType::Out);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let resource = resource.clone();
                std::thread::spawn(move || registry.lookup_or_build(&resource))
            })
            .collect();
        let chains: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();

        assert_eq!(builds.load(Ordering::SeqCst), 1, "同一资源只允许构建一次");
        assert!(chains.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[test]
    fn direction_is_part_of_identity() {
        let registry = ChainRegistry::new(16, Arc::new(|_: &ResourceWrapper| SlotChain::empty()));
        let inbound = registry.lookup_or_build(&ResourceWrapper::new("dir", EntryType::In));
        let outbound = registry.lookup_or_build(&ResourceWrapper::new("dir", EntryType::Out));
        assert!(!Arc::ptr_eq(&inbound.unwrap(), &outbound.unwrap()));
        assert_eq!(registry.len(), 2);
    }
}
