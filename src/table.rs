//! The per-scope pool of dynamic method descriptors.
//!
//! Slots are carved from a synthetic declaring type and never given back to
//! it; a torn-down slot goes on the free list and is handed out again before
//! any new slot is carved. Slot identity is the index into the pool's backing
//! store, so it stays stable across reuse.
//!
//! # Teardown
//!
//! The pool lock and the code heap lock are never held together. Releasing a
//! method therefore happens in stages:
//!
//! 1. Free the scratch heaps, then try to return the method's code heap blocks
//!    with a non-blocking lock attempt.
//! 2. If that worked, destroy the rest of the resolver and push the slot on the
//!    free list. If the lock was busy, mark the slot
//!    [`PendingRegionRelease`](SlotState::PendingRegionRelease) and queue it
//!    for [`retry_delayed_cleanup`](DynamicMethodTable::retry_delayed_cleanup).
use crate::{
    code_heap::CodeHeapManager,
    config::DynamicMethodConfig,
    error::{Result, StateError},
    metrics::DynamicMethodMetrics,
    method::{DynamicMethodDesc, SlotState},
    resolver::{
        AnyResolver, DynamicResolver, IlStubResolver, LcgMethodResolver, ResolverLifecycle,
    },
    services::{
        ManagedTokenTable, ObjectHandle, ReportRoots, RootVisitor, RuntimeServices,
        StaticTokenTable,
    },
    utils::{
        sync::{Arc, AtomicU64, Mutex, Ordering},
        MethodSlot, ModuleId, TableId,
    },
};
use serde::Serialize;
use std::collections::VecDeque;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Name of the synthetic type every pooled descriptor is declared on.
pub const DYNAMIC_CLASS_NAME: &str = "dynamicClass";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TeardownOutcome {
    /// The slot is back on the free list.
    Completed,
    /// The code heap was busy; the slot is on the delayed-cleanup queue.
    Deferred,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Every slot ever carved.
    pub managed: usize,
    pub free: usize,
    pub pending: usize,
    pub in_use: usize,
}

/// The synthetic type record that descriptors are carved from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyntheticType {
    pub name: &'static str,
    pub module: ModuleId,
}

#[derive(Debug, Default)]
struct PoolLists {
    methods: Vec<Arc<DynamicMethodDesc>>,
    /// Popped from the back.
    free: Vec<MethodSlot>,
    delayed: VecDeque<MethodSlot>,
    destroyed: bool,
}

pub struct DynamicMethodTable {
    id: TableId,
    dynamic_class: SyntheticType,
    lists: Mutex<PoolLists>,
    services: RuntimeServices,
    config: DynamicMethodConfig,
    metrics: Arc<DynamicMethodMetrics>,
}

impl std::fmt::Debug for DynamicMethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicMethodTable")
            .field("id", &self.id)
            .field("module", &self.dynamic_class.module)
            .field("stats", &self.stats())
            .finish()
    }
}

impl DynamicMethodTable {
    pub fn create(
        module: ModuleId,
        services: RuntimeServices,
        config: DynamicMethodConfig,
        metrics: Arc<DynamicMethodMetrics>,
    ) -> Self {
        let id = TableId(NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("created dynamic method {} for {}", id, module);
        Self {
            id,
            dynamic_class: SyntheticType {
                name: DYNAMIC_CLASS_NAME,
                module,
            },
            lists: Mutex::new(PoolLists::default()),
            services,
            config: config.normalized(),
            metrics,
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn module(&self) -> ModuleId {
        self.dynamic_class.module
    }

    pub fn dynamic_class(&self) -> &SyntheticType {
        &self.dynamic_class
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    pub fn metrics(&self) -> &Arc<DynamicMethodMetrics> {
        &self.metrics
    }

    pub fn method(&self, slot: MethodSlot) -> Option<Arc<DynamicMethodDesc>> {
        self.lists.lock().methods.get(slot.index()).cloned()
    }

    /// Returns a descriptor ready for a resolver: the most recently freed slot
    /// if there is one, otherwise a newly carved slot.
    pub fn get_dynamic_method(&self, signature: &[u8], name: &str) -> Result<Arc<DynamicMethodDesc>> {
        let reused = {
            let mut lists = self.lists.lock();
            if lists.destroyed {
                return Err(StateError::TableDestroyed.into());
            }
            let popped = lists.free.pop();
            match popped {
                Some(slot) => lists.methods[slot.index()].clone(),
                None => {
                    let slot = MethodSlot(lists.methods.len());
                    let desc = Arc::new(DynamicMethodDesc::new(
                        slot,
                        self.id,
                        self.dynamic_class.module,
                        name,
                        signature,
                    ));
                    lists.methods.push(desc.clone());
                    drop(lists);
                    self.metrics.record_method_carved();
                    tracing::debug!(
                        "{}: carved method {} '{}' from {}",
                        self.id,
                        slot,
                        name,
                        self.dynamic_class.name
                    );
                    return Ok(desc);
                }
            }
        };

        {
            let mut state = reused.lock();
            debug_assert_eq!(state.status, SlotState::Free);
            state.status = SlotState::InUse;
            state.name.clear();
            state.name.push_str(name);
            state.signature.clear();
            state.signature.extend_from_slice(signature);
        }
        self.metrics.record_method_reused();
        tracing::debug!("{}: reused method {} for '{}'", self.id, reused.slot(), name);
        Ok(reused)
    }

    /// Creates a lightweight code generation method backed by a managed-side
    /// token table.
    pub fn create_lcg_method(
        &self,
        signature: &[u8],
        name: &str,
        managed: Arc<dyn ManagedTokenTable>,
        managed_handle: ObjectHandle,
    ) -> Result<Arc<DynamicMethodDesc>> {
        let desc = self.get_dynamic_method(signature, name)?;
        let resolver = LcgMethodResolver::new(
            desc.slot(),
            self.id,
            managed,
            managed_handle,
            self.services.clone(),
            self.config.chunk_size,
        );
        self.attach_or_free(desc, resolver)
    }

    pub fn create_il_stub(
        &self,
        signature: &[u8],
        name: &str,
        tokens: StaticTokenTable,
    ) -> Result<Arc<DynamicMethodDesc>> {
        let desc = self.get_dynamic_method(signature, name)?;
        let resolver = IlStubResolver::new(
            desc.slot(),
            tokens,
            self.services.clone(),
            self.config.chunk_size,
        );
        self.attach_or_free(desc, resolver)
    }

    fn attach_or_free(
        &self,
        desc: Arc<DynamicMethodDesc>,
        resolver: impl Into<AnyResolver>,
    ) -> Result<Arc<DynamicMethodDesc>> {
        match desc.attach_resolver(resolver) {
            Ok(()) => Ok(desc),
            Err(e) => {
                self.add_to_free_list(&desc)?;
                Err(e)
            }
        }
    }

    /// Returns a descriptor whose resolver has already been torn down.
    pub fn add_to_free_list(&self, desc: &DynamicMethodDesc) -> Result<()> {
        self.check_owned(desc)?;
        {
            let mut state = desc.lock();
            match state.status {
                SlotState::InUse => {}
                SlotState::PendingRegionRelease => {
                    return Err(StateError::PendingRegionRelease(desc.slot()).into())
                }
                SlotState::Free => return Err(StateError::SlotNotInUse(desc.slot()).into()),
            }
            if let Some(mut resolver) = state.resolver.take() {
                tracing::warn!(
                    "method {} returned to the pool with a live resolver",
                    desc.slot()
                );
                resolver.destroy_resolver();
            }
            state.status = SlotState::Free;
        }
        self.lists.lock().free.push(desc.slot());
        Ok(())
    }

    /// Tears down a method and returns its slot to the pool, or defers the
    /// code heap part if the code heap lock is busy.
    pub fn destroy_method(
        &self,
        desc: &DynamicMethodDesc,
        heaps: &CodeHeapManager,
    ) -> Result<TeardownOutcome> {
        self.check_owned(desc)?;
        let mut state = desc.lock();
        match state.status {
            SlotState::InUse => {}
            SlotState::PendingRegionRelease => {
                return Err(StateError::PendingRegionRelease(desc.slot()).into())
            }
            SlotState::Free => return Err(StateError::SlotNotInUse(desc.slot()).into()),
        }

        if let Some(resolver) = state.resolver.as_mut() {
            resolver.free_compile_time_state();
            if !resolver.try_destroy_code_heap_memory(heaps) {
                state.status = SlotState::PendingRegionRelease;
                drop(state);
                self.lists.lock().delayed.push_back(desc.slot());
                self.metrics.record_teardown_deferred();
                tracing::warn!(
                    "{}: code heap busy, deferring teardown of method {}",
                    self.id,
                    desc.slot()
                );
                return Ok(TeardownOutcome::Deferred);
            }
        }

        if let Some(resolver) = state.resolver.take() {
            self.finish_resolver(resolver);
        }
        state.status = SlotState::Free;
        drop(state);

        self.lists.lock().free.push(desc.slot());
        self.metrics.record_teardown_completed();
        tracing::debug!("{}: method {} returned to the pool", self.id, desc.slot());
        Ok(TeardownOutcome::Completed)
    }

    /// Retries every deferred teardown once. Slots whose code heap memory can
    /// now be released move to the free list; the rest stay queued. Returns
    /// how many completed.
    pub fn retry_delayed_cleanup(&self, heaps: &CodeHeapManager) -> usize {
        let queued: Vec<MethodSlot> = {
            let mut lists = self.lists.lock();
            lists.delayed.drain(..).collect()
        };
        if queued.is_empty() {
            return 0;
        }

        let mut completed = Vec::new();
        let mut still_pending = Vec::new();
        for slot in queued {
            self.metrics.record_delayed_cleanup_retry();
            let Some(desc) = self.method(slot) else {
                continue;
            };
            let mut state = desc.lock();
            debug_assert_eq!(state.status, SlotState::PendingRegionRelease);
            let released = state
                .resolver
                .as_mut()
                .map_or(true, |resolver| resolver.try_destroy_code_heap_memory(heaps));
            if !released {
                still_pending.push(slot);
                continue;
            }
            if let Some(resolver) = state.resolver.take() {
                self.finish_resolver(resolver);
            }
            state.status = SlotState::Free;
            completed.push(slot);
        }

        let count = completed.len();
        {
            let mut lists = self.lists.lock();
            lists.free.extend(completed);
            // Keep the retried slots ahead of anything deferred meanwhile.
            for slot in still_pending.into_iter().rev() {
                lists.delayed.push_front(slot);
            }
        }
        for _ in 0..count {
            self.metrics.record_teardown_completed();
        }
        if count > 0 {
            tracing::debug!("{}: completed {} delayed teardowns", self.id, count);
        }
        count
    }

    /// Tears down every descriptor the table still owns and returns empty
    /// code heap regions. Only for scope teardown; the table is unusable
    /// afterwards.
    pub fn destroy(&self, heaps: &CodeHeapManager) -> Result<usize> {
        let methods = {
            let mut lists = self.lists.lock();
            if lists.destroyed {
                return Err(StateError::TableDestroyed.into());
            }
            lists.destroyed = true;
            lists.free.clear();
            lists.delayed.clear();
            std::mem::take(&mut lists.methods)
        };

        let mut torn_down = 0;
        for desc in &methods {
            let resolver = {
                let mut state = desc.lock();
                state.status = SlotState::Free;
                state.resolver.take()
            };
            let Some(mut resolver) = resolver else {
                continue;
            };
            resolver.free_compile_time_state();
            let blocks = resolver.release_code_heap_blocks();
            let freed = heaps.free_code_blocks(&blocks);
            if !freed.stale.is_empty() {
                tracing::warn!(
                    "method {}: skipped {} blocks that were already free",
                    desc.slot(),
                    freed.stale.len()
                );
            }
            self.finish_resolver(resolver);
            torn_down += 1;
        }
        let regions = heaps.release_empty_heaps();
        tracing::debug!(
            "{} destroyed: {} methods torn down, {} regions released",
            self.id,
            torn_down,
            regions
        );
        Ok(torn_down)
    }

    pub fn stats(&self) -> PoolStats {
        let lists = self.lists.lock();
        let managed = lists.methods.len();
        PoolStats {
            managed,
            free: lists.free.len(),
            pending: lists.delayed.len(),
            in_use: managed - lists.free.len() - lists.delayed.len(),
        }
    }

    pub fn free_slots(&self) -> Vec<MethodSlot> {
        self.lists.lock().free.clone()
    }

    pub fn delayed_slots(&self) -> Vec<MethodSlot> {
        self.lists.lock().delayed.iter().copied().collect()
    }

    fn finish_resolver(&self, mut resolver: AnyResolver) {
        self.metrics
            .record_scratch_pages(resolver.scratch_pages_created());
        resolver.destroy_resolver();
    }

    fn check_owned(&self, desc: &DynamicMethodDesc) -> Result<()> {
        if desc.table() != self.id {
            return Err(StateError::ForeignSlot(desc.slot()).into());
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<DynamicMethodDesc>> {
        self.lists.lock().methods.clone()
    }
}

impl ReportRoots for DynamicMethodTable {
    fn enumerate_roots(&self, visitor: &mut dyn RootVisitor) {
        for desc in self.snapshot() {
            let state = desc.lock();
            if state.status == SlotState::Free {
                continue;
            }
            if let Some(resolver) = state.resolver.as_ref() {
                resolver.enumerate_roots(visitor);
            }
        }
    }

    fn object_moved(&mut self, from: ObjectHandle, to: ObjectHandle) -> usize {
        self.lists
            .get_mut()
            .methods
            .iter()
            .filter_map(|desc| desc.lock().resolver.as_mut().map(|r| r.object_moved(from, to)))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ManagedCodeInfo;

    fn table() -> DynamicMethodTable {
        DynamicMethodTable::create(
            ModuleId(1),
            RuntimeServices::in_process(),
            DynamicMethodConfig::default(),
            Arc::new(DynamicMethodMetrics::new()),
        )
    }

    fn stub_tokens() -> StaticTokenTable {
        StaticTokenTable::new(ManagedCodeInfo {
            code: vec![0x2A],
            ..Default::default()
        })
    }

    #[test]
    fn test_free_list_is_lifo() {
        let table = table();
        let a = table.get_dynamic_method(&[0x00], "a").unwrap();
        let b = table.get_dynamic_method(&[0x00], "b").unwrap();
        table.add_to_free_list(&a).unwrap();
        table.add_to_free_list(&b).unwrap();
        assert_eq!(table.free_slots(), vec![a.slot(), b.slot()]);

        let c = table.get_dynamic_method(&[0x01], "c").unwrap();
        assert_eq!(c.slot(), b.slot());
        assert_eq!(c.name(), "c");
        assert_eq!(c.signature(), vec![0x01]);
        let d = table.get_dynamic_method(&[0x00], "d").unwrap();
        assert_eq!(d.slot(), a.slot());
        assert_eq!(table.stats().managed, 2);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let table = table();
        let a = table.get_dynamic_method(&[], "a").unwrap();
        table.add_to_free_list(&a).unwrap();
        assert_eq!(
            table.add_to_free_list(&a),
            Err(StateError::SlotNotInUse(a.slot()).into())
        );
        assert_eq!(table.stats().free, 1);
    }

    #[test]
    fn test_foreign_descriptors_are_rejected() {
        let first = table();
        let second = table();
        let a = first.get_dynamic_method(&[], "a").unwrap();
        assert_eq!(
            second.add_to_free_list(&a),
            Err(StateError::ForeignSlot(a.slot()).into())
        );
    }

    #[test]
    fn test_destroyed_table_refuses_work() {
        let table = table();
        let heaps = CodeHeapManager::in_process(DynamicMethodConfig::default());
        let stub = table.create_il_stub(&[], "stub", stub_tokens()).unwrap();
        stub.install_code(&heaps, &[0xC3], 0, 8, 0).unwrap();

        assert_eq!(table.destroy(&heaps).unwrap(), 1);
        assert_eq!(heaps.lock().region_count(), 0);
        assert_eq!(
            table.get_dynamic_method(&[], "late").map(|_| ()),
            Err(StateError::TableDestroyed.into())
        );
        assert_eq!(table.destroy(&heaps), Err(StateError::TableDestroyed.into()));
    }

    #[test]
    fn test_teardown_returns_code_and_slot() {
        let table = table();
        let heaps = CodeHeapManager::in_process(DynamicMethodConfig::default());
        let stub = table.create_il_stub(&[], "stub", stub_tokens()).unwrap();
        let addr = stub.install_code(&heaps, &[0x90; 40], 0, 16, 0).unwrap();

        assert_eq!(
            table.destroy_method(&stub, &heaps).unwrap(),
            TeardownOutcome::Completed
        );
        assert!(heaps.get_track_allocation(addr).is_none());
        assert_eq!(stub.status(), SlotState::Free);
        assert!(!stub.has_resolver());
        assert_eq!(table.stats().free, 1);

        let snap = table.metrics().snapshot();
        assert_eq!(snap.teardowns_completed, 1);
        assert_eq!(snap.methods_carved, 1);
    }
}
