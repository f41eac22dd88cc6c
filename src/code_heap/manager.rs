use super::{CodeHeapStats, HostCodeHeap, HostMemory, LoaderAllocator, TrackAllocation};
use crate::{
    config::DynamicMethodConfig,
    error::{MemoryError, StateError},
    metrics::DynamicMethodMetrics,
    utils::{
        align_up,
        sync::{Arc, Mutex, MutexGuard},
        CodeAddr, RegionId, WORD_SIZE,
    },
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of returning a batch of blocks to the code heap.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BlocksFreed {
    pub bytes: usize,
    /// Addresses that were not live allocations; nothing was freed for them.
    pub stale: Vec<CodeAddr>,
}

/// Every code heap region belonging to one allocator context.
///
/// Only reachable through [`CodeHeapManager`], whose lock linearizes allocate,
/// free and destroy across all regions.
pub struct CodeHeapSet {
    /// Indexed by [`RegionId`]; destroyed regions leave a `None` so ids are
    /// never reused.
    regions: Vec<Option<HostCodeHeap>>,
    by_base: BTreeMap<CodeAddr, RegionId>,
    /// Regions whose allocation count has dropped to zero, oldest first.
    release_list: Vec<RegionId>,
    allocator: Arc<LoaderAllocator>,
    config: DynamicMethodConfig,
    metrics: Arc<DynamicMethodMetrics>,
}

impl CodeHeapSet {
    fn new(
        host: Arc<dyn HostMemory>,
        config: DynamicMethodConfig,
        metrics: Arc<DynamicMethodMetrics>,
    ) -> Self {
        Self {
            regions: Vec::new(),
            by_base: BTreeMap::new(),
            release_list: Vec::new(),
            allocator: Arc::new(LoaderAllocator::new(host)),
            config: config.normalized(),
            metrics,
        }
    }

    /// Reserves a new region of at least `reserve_size` bytes.
    pub fn create_code_heap(&mut self, reserve_size: usize) -> Option<RegionId> {
        self.create_region(reserve_size, self.config.code_heap_initial_commit)
    }

    fn create_region(&mut self, reserve_size: usize, initial_commit: usize) -> Option<RegionId> {
        let size = align_up(
            reserve_size.max(self.config.commit_granularity),
            self.config.code_heap_size_align,
        )?;
        let id = RegionId(self.regions.len());
        let heap = HostCodeHeap::create(
            id,
            self.allocator.clone(),
            size,
            initial_commit.min(size),
            self.config.commit_granularity,
            self.config.executable,
        )?;
        self.by_base.insert(heap.base(), id);
        self.regions.push(Some(heap));
        self.metrics.record_region_created();
        Some(id)
    }

    /// Allocates from the first region that can satisfy the request, creating
    /// a new region sized for it if none can.
    pub fn alloc_code(
        &mut self,
        header: usize,
        size: usize,
        alignment: usize,
        reserve_for_jump_stubs: usize,
    ) -> Option<CodeAddr> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return None;
        }

        let found = self.regions.iter_mut().flatten().find_map(|heap| {
            heap.alloc_mem_for_code_no_throw(header, size, alignment, reserve_for_jump_stubs)
                .map(|code| (heap.id(), code))
        });

        let (id, code) = match found {
            Some(hit) => hit,
            None => {
                let needed = super::TRACK_ALLOCATION_SIZE
                    .checked_add(header)?
                    .checked_add(size)?
                    .checked_add(alignment)?
                    .checked_add(WORD_SIZE)?
                    .checked_add(reserve_for_jump_stubs)?;
                // Nothing is committed up front so the first commit can cover
                // the whole request in one block.
                let id = self.create_region(needed.max(self.config.code_heap_reserve), 0)?;
                let heap = self.region_mut(id)?;
                let code = heap.alloc_mem_for_code_no_throw(
                    header,
                    size,
                    alignment,
                    reserve_for_jump_stubs,
                )?;
                (id, code)
            }
        };

        self.release_list.retain(|&queued| queued != id);
        if let Some((_, track)) = self.get_track_allocation(code) {
            self.metrics.record_code_allocated(track.size());
        }
        Some(code)
    }

    /// Frees the block holding `code`. A region left with no allocations is
    /// queued for release.
    pub fn free_code(&mut self, code: CodeAddr) -> Result<usize, MemoryError> {
        let id = self
            .get_code_heap(code)
            .ok_or(MemoryError::RegionNotFound(code))?;
        let heap = self
            .region_mut(id)
            .ok_or(MemoryError::RegionNotFound(code))?;
        let size = heap.free_mem_for_code(code)?;
        let now_empty = heap.allocation_count() == 0;

        self.metrics.record_code_freed(size);
        if now_empty && !self.release_list.contains(&id) {
            tracing::debug!("{} has no live code, queued for release", id);
            self.release_list.push(id);
        }
        Ok(size)
    }

    /// The live region whose reservation contains `addr`.
    pub fn get_code_heap(&self, addr: CodeAddr) -> Option<RegionId> {
        let (_, &id) = self.by_base.range(..=addr).next_back()?;
        self.region(id)
            .filter(|heap| heap.contains(addr))
            .map(HostCodeHeap::id)
    }

    pub fn get_track_allocation(&self, code: CodeAddr) -> Option<(CodeAddr, TrackAllocation)> {
        self.region(self.get_code_heap(code)?)?
            .get_track_allocation(code)
    }

    pub fn region(&self, id: RegionId) -> Option<&HostCodeHeap> {
        self.regions.get(id.0)?.as_ref()
    }

    fn region_mut(&mut self, id: RegionId) -> Option<&mut HostCodeHeap> {
        self.regions.get_mut(id.0)?.as_mut()
    }

    /// Releases a region back to the host. Rejected while the region still
    /// holds any code.
    pub fn destroy_code_heap(&mut self, id: RegionId) -> Result<(), StateError> {
        let heap = self.region(id).ok_or(StateError::RegionDestroyed(id))?;
        if heap.allocation_count() > 0 {
            return Err(StateError::RegionInUse {
                region: id,
                allocations: heap.allocation_count(),
            });
        }
        let base = heap.base();
        if let Some(mut heap) = self.regions[id.0].take() {
            heap.release();
        }
        self.by_base.remove(&base);
        self.release_list.retain(|&queued| queued != id);
        self.metrics.record_region_destroyed();
        tracing::debug!("destroyed {}", id);
        Ok(())
    }

    /// Destroys every queued region that is still empty. Returns how many
    /// regions were released.
    pub fn release_empty_heaps(&mut self) -> usize {
        let queued = std::mem::take(&mut self.release_list);
        let mut released = 0;
        for id in queued {
            match self.destroy_code_heap(id) {
                Ok(()) => released += 1,
                Err(StateError::RegionInUse { .. }) => {}
                Err(e) => tracing::trace!("skipping queued region: {}", e),
            }
        }
        released
    }

    pub fn release_list(&self) -> &[RegionId] {
        &self.release_list
    }

    pub fn live_regions(&self) -> impl Iterator<Item = &HostCodeHeap> {
        self.regions.iter().flatten()
    }

    pub fn region_count(&self) -> usize {
        self.live_regions().count()
    }

    /// Copies compiled code into the block starting at `code`.
    pub fn write_code(&self, code: CodeAddr, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check_extent(code, bytes.len())?;
        // SAFETY: the range lies inside a live block of a live region, and the
        // manager lock is held, so no other write or free can race with it.
        unsafe { self.allocator.host().write(code, bytes) };
        Ok(())
    }

    pub fn read_code(&self, code: CodeAddr, out: &mut [u8]) -> Result<(), MemoryError> {
        self.check_extent(code, out.len())?;
        // SAFETY: as in `write_code`.
        unsafe { self.allocator.host().read(code, out) };
        Ok(())
    }

    fn check_extent(&self, code: CodeAddr, len: usize) -> Result<(), MemoryError> {
        let heap = self
            .get_code_heap(code)
            .and_then(|id| self.region(id))
            .ok_or(MemoryError::RegionNotFound(code))?;
        let (_, available) = heap
            .code_extent(code)
            .ok_or(MemoryError::NotAllocated(code))?;
        if len > available {
            return Err(MemoryError::RegionExhausted { requested: len });
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<CodeHeapStats> {
        self.live_regions().map(HostCodeHeap::stats).collect()
    }
}

/// Owns the code heap lock and every region behind it.
///
/// Region operations are not individually synchronized; everything goes
/// through this one non-reentrant lock. Teardown paths use
/// [`try_free_code_blocks`](Self::try_free_code_blocks) so they can defer
/// instead of blocking while another component's lock is held.
pub struct CodeHeapManager {
    heaps: Mutex<CodeHeapSet>,
    metrics: Arc<DynamicMethodMetrics>,
}

impl CodeHeapManager {
    pub fn new(
        host: Arc<dyn HostMemory>,
        config: DynamicMethodConfig,
        metrics: Arc<DynamicMethodMetrics>,
    ) -> Self {
        Self {
            heaps: Mutex::new(CodeHeapSet::new(host, config, metrics.clone())),
            metrics,
        }
    }

    /// A manager over [`SystemHostMemory`](super::SystemHostMemory) with its own metrics.
    pub fn in_process(config: DynamicMethodConfig) -> Self {
        Self::new(
            Arc::new(super::SystemHostMemory::new()),
            config,
            Arc::new(DynamicMethodMetrics::new()),
        )
    }

    pub fn metrics(&self) -> &Arc<DynamicMethodMetrics> {
        &self.metrics
    }

    pub fn lock(&self) -> MutexGuard<'_, CodeHeapSet> {
        self.heaps.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, CodeHeapSet>> {
        self.heaps.try_lock()
    }

    pub fn alloc_code(
        &self,
        header: usize,
        size: usize,
        alignment: usize,
        reserve_for_jump_stubs: usize,
    ) -> Result<CodeAddr, MemoryError> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        self.lock()
            .alloc_code(header, size, alignment, reserve_for_jump_stubs)
            .ok_or(MemoryError::OutOfMemory)
    }

    pub fn free_code(&self, code: CodeAddr) -> Result<usize, MemoryError> {
        self.lock().free_code(code)
    }

    /// Frees every block in `blocks` if the lock is free right now. Returns
    /// `None` without touching anything when it is held elsewhere.
    pub fn try_free_code_blocks(&self, blocks: &[CodeAddr]) -> Option<BlocksFreed> {
        let mut heaps = self.try_lock()?;
        Some(Self::free_all(&mut heaps, blocks))
    }

    pub fn free_code_blocks(&self, blocks: &[CodeAddr]) -> BlocksFreed {
        Self::free_all(&mut self.lock(), blocks)
    }

    /// Frees each block independently. Addresses that no longer name a live
    /// allocation are skipped and reported.
    fn free_all(heaps: &mut CodeHeapSet, blocks: &[CodeAddr]) -> BlocksFreed {
        let mut freed = BlocksFreed::default();
        for &code in blocks {
            match heaps.free_code(code) {
                Ok(bytes) => freed.bytes += bytes,
                Err(_) => freed.stale.push(code),
            }
        }
        freed
    }

    pub fn get_code_heap(&self, addr: CodeAddr) -> Option<RegionId> {
        self.lock().get_code_heap(addr)
    }

    pub fn get_track_allocation(&self, code: CodeAddr) -> Option<(CodeAddr, TrackAllocation)> {
        self.lock().get_track_allocation(code)
    }

    pub fn destroy_code_heap(&self, id: RegionId) -> Result<(), StateError> {
        self.lock().destroy_code_heap(id)
    }

    pub fn release_empty_heaps(&self) -> usize {
        self.lock().release_empty_heaps()
    }

    pub fn write_code(&self, code: CodeAddr, bytes: &[u8]) -> Result<(), MemoryError> {
        self.lock().write_code(code, bytes)
    }

    pub fn read_code(&self, code: CodeAddr, out: &mut [u8]) -> Result<(), MemoryError> {
        self.lock().read_code(code, out)
    }

    pub fn stats(&self) -> Vec<CodeHeapStats> {
        self.lock().stats()
    }
}

impl std::fmt::Debug for CodeHeapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.heaps.try_lock() {
            Some(heaps) => f
                .debug_struct("CodeHeapManager")
                .field("regions", &heaps.region_count())
                .field("release_list", &heaps.release_list)
                .finish(),
            None => f.write_str("CodeHeapManager { <locked> }"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_heap::SystemHostMemory;

    fn manager(reserve: usize) -> CodeHeapManager {
        CodeHeapManager::in_process(DynamicMethodConfig::new().with_code_heap_reserve(reserve))
    }

    #[test]
    fn test_destroyed_region_disappears_from_lookup() {
        let heaps = manager(64 * 1024);
        let code = heaps.alloc_code(8, 64, 16, 0).unwrap();
        let region = heaps.get_code_heap(code).unwrap();

        assert_eq!(
            heaps.destroy_code_heap(region),
            Err(StateError::RegionInUse {
                region,
                allocations: 1
            })
        );

        heaps.free_code(code).unwrap();
        assert_eq!(heaps.lock().release_list(), &[region]);
        heaps.destroy_code_heap(region).unwrap();

        assert_eq!(heaps.get_code_heap(code), None);
        assert_eq!(heaps.get_track_allocation(code), None);
        assert_eq!(
            heaps.destroy_code_heap(region),
            Err(StateError::RegionDestroyed(region))
        );
        assert!(heaps.lock().release_list().is_empty());
    }

    #[test]
    fn test_oversized_request_gets_its_own_region() {
        let heaps = manager(8192);
        let small = heaps.alloc_code(0, 128, 8, 0).unwrap();
        let big = heaps.alloc_code(0, 20_000, 8, 0).unwrap();
        let (r1, r2) = (
            heaps.get_code_heap(small).unwrap(),
            heaps.get_code_heap(big).unwrap(),
        );
        assert_ne!(r1, r2);

        let stats = heaps.stats();
        assert_eq!(stats.len(), 2);
        assert!(stats[1].reserved_bytes >= 20_000);
        assert_eq!(stats[1].reserved_bytes % HOST_ALIGN, 0);
    }

    const HOST_ALIGN: usize = crate::config::HOST_CODEHEAP_SIZE_ALIGN;

    #[test]
    fn test_release_empty_heaps_skips_reused_regions() {
        let heaps = manager(8192);
        let a = heaps.alloc_code(0, 64, 8, 0).unwrap();
        heaps.free_code(a).unwrap();
        assert_eq!(heaps.lock().release_list().len(), 1);

        // Allocating again takes the region off the release list.
        let b = heaps.alloc_code(0, 64, 8, 0).unwrap();
        assert!(heaps.lock().release_list().is_empty());
        assert_eq!(heaps.release_empty_heaps(), 0);

        heaps.free_code(b).unwrap();
        assert_eq!(heaps.release_empty_heaps(), 1);
        assert_eq!(heaps.lock().region_count(), 0);
        assert_eq!(heaps.metrics().snapshot().regions_destroyed, 1);
    }

    #[test]
    fn test_write_and_read_code() {
        let heaps = manager(8192);
        let code = heaps.alloc_code(0, 16, 16, 0).unwrap();
        heaps.write_code(code, &[0xC3; 16]).unwrap();

        let mut out = [0u8; 16];
        heaps.read_code(code, &mut out).unwrap();
        assert_eq!(out, [0xC3; 16]);

        assert_eq!(
            heaps.write_code(code + 4, &[0x90]),
            Err(MemoryError::NotAllocated(code + 4))
        );
        assert!(matches!(
            heaps.write_code(code, &[0u8; 4096]),
            Err(MemoryError::RegionExhausted { .. })
        ));
    }

    #[test]
    fn test_try_free_defers_while_locked() {
        let heaps = manager(8192);
        let code = heaps.alloc_code(0, 32, 8, 0).unwrap();

        let guard = heaps.lock();
        assert!(heaps.try_free_code_blocks(&[code]).is_none());
        drop(guard);

        let freed = heaps.try_free_code_blocks(&[code]).unwrap();
        assert!(freed.bytes >= 32);
        assert!(freed.stale.is_empty());
        assert!(heaps.get_track_allocation(code).is_none());
    }

    #[test]
    fn test_free_blocks_skips_stale_addresses() {
        let heaps = manager(8192);
        let first = heaps.alloc_code(0, 32, 8, 0).unwrap();
        let second = heaps.alloc_code(0, 32, 8, 0).unwrap();
        let stale = first + 8;

        let freed = heaps.free_code_blocks(&[first, stale, second]);
        assert_eq!(freed.stale, vec![stale]);
        assert!(heaps.get_track_allocation(first).is_none());
        assert!(heaps.get_track_allocation(second).is_none());
        assert!(heaps.stats().iter().all(|r| r.allocation_count == 0));
    }

    #[test]
    fn test_host_exhaustion_reports_out_of_memory() {
        let host = Arc::new(SystemHostMemory::new().with_limit(8192));
        let heaps = CodeHeapManager::new(
            host.clone(),
            DynamicMethodConfig::new().with_code_heap_reserve(8192),
            Arc::new(DynamicMethodMetrics::new()),
        );
        heaps.alloc_code(0, 6000, 8, 0).unwrap();
        assert_eq!(heaps.alloc_code(0, 6000, 8, 0), Err(MemoryError::OutOfMemory));
        assert_eq!(
            heaps.alloc_code(0, 16, 3, 0),
            Err(MemoryError::InvalidAlignment(3))
        );
        assert_eq!(host.live_reservations(), 1);
    }
}
