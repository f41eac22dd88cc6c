//! Executable memory for the compiled bodies of dynamic methods.
//!
//! A [`HostCodeHeap`] is one region: a reservation from the host memory
//! manager whose committed prefix is carved into variable-size blocks. Every
//! block is tracked by a [`TrackAllocation`] record, either in use (owned by a
//! method's compiled code) or free (linked into the region's free list).
//!
//! # Block layout
//!
//! ```text
//! block start
//! | track record | padding | header | code (size bytes) | word padding |
//!                                   ^ address returned to the JIT
//! ```
//!
//! The track record area is reserved in every block so the accounting matches
//! the in-memory layout, but the records themselves are kept in a side table
//! keyed by block start.
//!
//! # Free list policy
//!
//! Allocation is first-fit over the free list; a fitting block is split when
//! the tail is at least `HOST_CODEHEAP_SIZE_ALIGN` bytes. Freed blocks are
//! pushed on the front of the list and are **never coalesced** with their
//! neighbours, so freeing two adjacent blocks leaves two entries. A region whose allocation
//! count reaches zero is released as a whole.
//!
//! Regions hold no lock of their own; [`CodeHeapManager`] serializes access.
use crate::{
    config::HOST_CODEHEAP_SIZE_ALIGN,
    error::MemoryError,
    utils::{align_up, validate_alignment, CodeAddr, RegionId, WORD_SIZE},
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

mod host;
mod manager;

pub use host::{HostMemory, Reservation, SystemHostMemory};
pub use manager::{BlocksFreed, CodeHeapManager, CodeHeapSet};

/// Bytes reserved at the start of every block for its track record: one word
/// for the owning heap (or next free block) and one for the size.
pub const TRACK_ALLOCATION_SIZE: usize = 2 * WORD_SIZE;

/// A block is split only when the tail left over is at least this large.
const MIN_SPLIT_REMAINDER: usize = if HOST_CODEHEAP_SIZE_ALIGN > TRACK_ALLOCATION_SIZE {
    HOST_CODEHEAP_SIZE_ALIGN
} else {
    TRACK_ALLOCATION_SIZE
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TrackAllocation {
    /// Holds compiled code. `code` is the aligned address handed to the JIT.
    Used {
        heap: RegionId,
        size: usize,
        code: CodeAddr,
    },
    Free {
        size: usize,
        next: Option<CodeAddr>,
    },
}

impl TrackAllocation {
    pub fn size(&self) -> usize {
        match *self {
            TrackAllocation::Used { size, .. } | TrackAllocation::Free { size, .. } => size,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, TrackAllocation::Free { .. })
    }
}

/// The allocator context that owns a set of regions. Each region holds a
/// reference, so the context outlives every region carved from it.
pub struct LoaderAllocator {
    host: Arc<dyn HostMemory>,
}

impl LoaderAllocator {
    pub fn new(host: Arc<dyn HostMemory>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<dyn HostMemory> {
        &self.host
    }
}

impl std::fmt::Debug for LoaderAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderAllocator")
            .field("page_size", &self.host.page_size())
            .finish()
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct CodeHeapStats {
    pub region: RegionId,
    pub base: CodeAddr,
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    pub allocation_count: u32,
    pub free_list_len: usize,
    pub approximate_largest_block: usize,
    pub is_executable: bool,
}

pub struct HostCodeHeap {
    id: RegionId,
    reservation: Option<Reservation>,
    base: CodeAddr,
    reserved: usize,
    /// End of committed memory. Everything in `[base, last_committed)` is
    /// covered by exactly one track record.
    last_committed: CodeAddr,
    /// Bytes currently in free blocks.
    total_bytes_available: usize,
    /// Upper bound on the largest free block. A failed free-list search
    /// lowers it to the largest block that search walked past. Only used to
    /// skip searches that cannot succeed.
    approximate_largest_block: usize,
    allocation_count: u32,
    is_executable: bool,
    commit_granularity: usize,
    allocator: Arc<LoaderAllocator>,
    free_list: Option<CodeAddr>,
    blocks: BTreeMap<CodeAddr, TrackAllocation>,
}

impl std::fmt::Debug for HostCodeHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCodeHeap")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("committed", &self.committed_bytes())
            .field("allocations", &self.allocation_count)
            .finish()
    }
}

impl HostCodeHeap {
    /// Reserves a region of `reserve_size` bytes and commits the first
    /// `initial_commit` of them.
    pub fn create(
        id: RegionId,
        allocator: Arc<LoaderAllocator>,
        reserve_size: usize,
        initial_commit: usize,
        commit_granularity: usize,
        executable: bool,
    ) -> Option<Self> {
        let reservation = allocator.host().reserve(reserve_size, executable)?;
        let mut heap = Self {
            id,
            base: reservation.base,
            reserved: reservation.size,
            last_committed: reservation.base,
            reservation: Some(reservation),
            total_bytes_available: 0,
            approximate_largest_block: 0,
            allocation_count: 0,
            is_executable: executable,
            commit_granularity: commit_granularity.max(1).next_power_of_two(),
            allocator,
            free_list: None,
            blocks: BTreeMap::new(),
        };
        if initial_commit > 0 && !heap.commit_more(initial_commit) {
            return None;
        }
        tracing::debug!(
            "created code heap {} at {} ({} reserved, {} committed)",
            id,
            heap.base,
            heap.reserved,
            heap.committed_bytes()
        );
        Some(heap)
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn base(&self) -> CodeAddr {
        self.base
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved
    }

    pub fn committed_bytes(&self) -> usize {
        self.last_committed.offset_from(self.base)
    }

    pub fn total_bytes_available(&self) -> usize {
        self.total_bytes_available
    }

    pub fn approximate_largest_block(&self) -> usize {
        self.approximate_largest_block
    }

    pub fn allocation_count(&self) -> u32 {
        self.allocation_count
    }

    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    pub fn allocator(&self) -> &Arc<LoaderAllocator> {
        &self.allocator
    }

    pub fn contains(&self, addr: CodeAddr) -> bool {
        addr >= self.base && addr.offset_from(self.base) < self.reserved
    }

    /// Allocates `size` bytes of code aligned to `alignment`, with `header`
    /// bytes of bookkeeping space immediately before it. The block also keeps
    /// `reserve_for_jump_stubs` bytes free after the code for later stubs.
    ///
    /// Returns `None` if the region cannot satisfy the request even after
    /// committing the rest of its reservation.
    pub fn alloc_mem_for_code_no_throw(
        &mut self,
        header: usize,
        size: usize,
        alignment: usize,
        reserve_for_jump_stubs: usize,
    ) -> Option<CodeAddr> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return None;
        }
        let code = self.alloc_memory_no_throw(header, size, alignment, reserve_for_jump_stubs)?;
        validate_alignment(code, alignment);
        Some(code)
    }

    /// Returns the block holding the code at `code` to the free list.
    pub fn free_mem_for_code(&mut self, code: CodeAddr) -> Result<usize, MemoryError> {
        let (block, size) = self
            .find_used(code)
            .ok_or(MemoryError::NotAllocated(code))?;
        self.add_to_free_list(block, size);
        self.approximate_largest_block = self.approximate_largest_block.max(size);
        self.allocation_count -= 1;
        tracing::trace!("{}: freed {} bytes at {}", self.id, size, code);
        Ok(size)
    }

    /// Looks up the record of the live allocation whose code starts at `code`.
    pub fn get_track_allocation(&self, code: CodeAddr) -> Option<(CodeAddr, TrackAllocation)> {
        let (&block, &track) = self.blocks.range(..=code).next_back()?;
        match track {
            TrackAllocation::Used { code: start, .. } if start == code => Some((block, track)),
            _ => None,
        }
    }

    /// Blocks on the free list, in list order.
    pub fn free_blocks(&self) -> Vec<(CodeAddr, usize)> {
        let mut out = Vec::new();
        let mut cursor = self.free_list;
        while let Some(block) = cursor {
            match self.blocks.get(&block) {
                Some(TrackAllocation::Free { size, next }) => {
                    out.push((block, *size));
                    cursor = *next;
                }
                _ => break,
            }
        }
        out
    }

    pub fn used_blocks(&self) -> impl Iterator<Item = (CodeAddr, TrackAllocation)> + '_ {
        self.blocks
            .iter()
            .filter(|(_, t)| !t.is_free())
            .map(|(&b, &t)| (b, t))
    }

    /// The usable range `[code, block end)` of a live allocation.
    pub fn code_extent(&self, code: CodeAddr) -> Option<(CodeAddr, usize)> {
        let (block, size) = self.find_used(code)?;
        Some((code, (block + size).offset_from(code)))
    }

    pub fn stats(&self) -> CodeHeapStats {
        let free = self.free_blocks();
        CodeHeapStats {
            region: self.id,
            base: self.base,
            reserved_bytes: self.reserved,
            committed_bytes: self.committed_bytes(),
            free_bytes: self.total_bytes_available,
            used_bytes: self.used_blocks().map(|(_, t)| t.size()).sum(),
            allocation_count: self.allocation_count,
            free_list_len: free.len(),
            approximate_largest_block: self.approximate_largest_block,
            is_executable: self.is_executable,
        }
    }

    /// Returns the reservation to the host. Only reachable through
    /// [`CodeHeapSet::destroy_code_heap`] once the allocation count is zero,
    /// or on drop.
    fn release(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            debug_assert_eq!(self.allocation_count, 0, "releasing a code heap with live code");
            tracing::debug!("releasing code heap {} at {}", self.id, self.base);
            self.blocks.clear();
            self.free_list = None;
            self.allocator.host().release(reservation);
        }
    }

    fn alloc_memory_no_throw(
        &mut self,
        header: usize,
        size: usize,
        alignment: usize,
        reserve_for_jump_stubs: usize,
    ) -> Option<CodeAddr> {
        if self.free_list.is_some() && self.approximate_largest_block >= size {
            if let Some(code) =
                self.alloc_from_free_list(header, size, alignment, reserve_for_jump_stubs)
            {
                return Some(code);
            }
        }

        // Enough for the worst-case padding wherever the new block lands.
        let needed = TRACK_ALLOCATION_SIZE
            .checked_add(header)?
            .checked_add(size)?
            .checked_add(alignment)?
            .checked_add(WORD_SIZE)?
            .checked_add(reserve_for_jump_stubs)?;
        if !self.commit_more(needed) {
            tracing::debug!(
                "{}: cannot commit {} more bytes ({} of {} committed)",
                self.id,
                needed,
                self.committed_bytes(),
                self.reserved
            );
            return None;
        }
        self.alloc_from_free_list(header, size, alignment, reserve_for_jump_stubs)
    }

    fn alloc_from_free_list(
        &mut self,
        header: usize,
        size: usize,
        alignment: usize,
        reserve_for_jump_stubs: usize,
    ) -> Option<CodeAddr> {
        let mut previous: Option<CodeAddr> = None;
        let mut cursor = self.free_list;
        let mut largest_seen = 0;

        while let Some(block) = cursor {
            let (block_size, next) = match self.blocks.get(&block) {
                Some(&TrackAllocation::Free { size, next }) => (size, next),
                other => {
                    debug_assert!(false, "free list reached non-free block {:?}", other);
                    return None;
                }
            };

            let fits = Self::layout_in_block(block, header, size, alignment).and_then(
                |(code, real_size)| {
                    let needed = real_size.checked_add(reserve_for_jump_stubs)?;
                    (needed <= block_size).then_some((code, real_size))
                },
            );

            if let Some((code, real_size)) = fits {
                let remainder = block_size - real_size;
                let (used_size, successor) = if remainder >= MIN_SPLIT_REMAINDER {
                    let tail = block + real_size;
                    self.blocks.insert(
                        tail,
                        TrackAllocation::Free {
                            size: remainder,
                            next,
                        },
                    );
                    (real_size, Some(tail))
                } else {
                    (block_size, next)
                };

                match previous {
                    Some(prev) => self.set_next_free(prev, successor),
                    None => self.free_list = successor,
                }
                self.blocks.insert(
                    block,
                    TrackAllocation::Used {
                        heap: self.id,
                        size: used_size,
                        code,
                    },
                );
                self.allocation_count += 1;
                self.total_bytes_available -= used_size;
                tracing::trace!(
                    "{}: allocated {} bytes at {} (block {}, {} bytes)",
                    self.id,
                    size,
                    code,
                    block,
                    used_size
                );
                return Some(code);
            }

            largest_seen = largest_seen.max(block_size);
            previous = Some(block);
            cursor = next;
        }
        self.approximate_largest_block = largest_seen;
        None
    }

    /// Pushes a block on the front of the free list. Neighbouring free blocks
    /// are left alone.
    fn add_to_free_list(&mut self, block: CodeAddr, size: usize) {
        self.blocks.insert(
            block,
            TrackAllocation::Free {
                size,
                next: self.free_list,
            },
        );
        self.free_list = Some(block);
        self.total_bytes_available += size;
    }

    fn set_next_free(&mut self, block: CodeAddr, successor: Option<CodeAddr>) {
        if let Some(TrackAllocation::Free { next, .. }) = self.blocks.get_mut(&block) {
            *next = successor;
        }
    }

    /// Commits at least `bytes` more (rounded to the commit granularity, or
    /// whatever is left of the reservation if that still suffices) and adds
    /// the new memory to the free list as one block.
    fn commit_more(&mut self, bytes: usize) -> bool {
        let Some(reservation) = self.reservation else {
            return false;
        };
        let remaining = self.reserved - self.committed_bytes();
        let size = match align_up(bytes, self.commit_granularity) {
            Some(rounded) if rounded <= remaining => rounded,
            _ if bytes <= remaining => remaining,
            _ => return false,
        };
        if size == 0 {
            return false;
        }
        if !self
            .allocator
            .host()
            .commit(&reservation, self.last_committed, size)
        {
            return false;
        }
        let block = self.last_committed;
        self.last_committed = block + size;
        self.add_to_free_list(block, size);
        self.approximate_largest_block = self.approximate_largest_block.max(size);
        tracing::debug!("{}: committed {} bytes at {}", self.id, size, block);
        true
    }

    /// Where the code lands in a block starting at `block`, and how many bytes
    /// the block must span to hold it.
    fn layout_in_block(
        block: CodeAddr,
        header: usize,
        size: usize,
        alignment: usize,
    ) -> Option<(CodeAddr, usize)> {
        let code = align_up(
            block
                .as_usize()
                .checked_add(TRACK_ALLOCATION_SIZE)?
                .checked_add(header)?,
            alignment,
        )?;
        let end = align_up(code.checked_add(size)?, WORD_SIZE)?;
        Some((CodeAddr(code), end - block.as_usize()))
    }

    fn find_used(&self, code: CodeAddr) -> Option<(CodeAddr, usize)> {
        match self.get_track_allocation(code)? {
            (block, TrackAllocation::Used { size, .. }) => Some((block, size)),
            _ => None,
        }
    }
}

impl Drop for HostCodeHeap {
    fn drop(&mut self) {
        if self.reservation.is_some() && self.allocation_count > 0 {
            tracing::warn!(
                "dropping code heap {} with {} live allocations",
                self.id,
                self.allocation_count
            );
            self.allocation_count = 0;
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(reserve: usize, initial: usize) -> HostCodeHeap {
        let allocator = Arc::new(LoaderAllocator::new(Arc::new(SystemHostMemory::new())));
        HostCodeHeap::create(RegionId(0), allocator, reserve, initial, 4096, true).unwrap()
    }

    /// Every committed byte is in exactly one block, every free record is on
    /// the free list, and the cached counters agree with the records.
    fn assert_conserved(heap: &HostCodeHeap) {
        let used: usize = heap.used_blocks().map(|(_, t)| t.size()).sum();
        let free_list = heap.free_blocks();
        let free: usize = free_list.iter().map(|(_, s)| s).sum();
        assert_eq!(used + free, heap.committed_bytes());
        assert_eq!(free, heap.total_bytes_available());
        assert_eq!(
            free_list.len(),
            heap.blocks.values().filter(|t| t.is_free()).count()
        );
        assert_eq!(
            heap.used_blocks().count(),
            heap.allocation_count() as usize
        );

        let mut expected = heap.base();
        for (&block, track) in &heap.blocks {
            assert_eq!(block, expected, "gap or overlap before {}", block);
            expected = block + track.size();
        }
        assert_eq!(expected, heap.last_committed);
    }

    #[test]
    fn test_alloc_then_free_scenario() {
        let mut heap = region(64 * 1024, 4096);
        assert_eq!(heap.committed_bytes(), 4096);

        let code = heap.alloc_mem_for_code_no_throw(8, 64, 16, 0).unwrap();
        assert_eq!(code.as_usize() % 16, 0);
        assert_eq!(heap.allocation_count(), 1);
        assert_conserved(&heap);

        let (block, track) = heap.get_track_allocation(code).unwrap();
        assert!(code.offset_from(block) >= TRACK_ALLOCATION_SIZE + 8);
        assert!(matches!(track, TrackAllocation::Used { heap: RegionId(0), .. }));

        let before = heap.free_blocks().len();
        heap.free_mem_for_code(code).unwrap();
        assert_eq!(heap.allocation_count(), 0);
        let free = heap.free_blocks();
        assert_eq!(free.len(), before + 1);
        assert_eq!(free[0].0, block);
        assert!(free[0].1 >= 64);
        assert!(heap.get_track_allocation(code).is_none());
        assert_conserved(&heap);
    }

    #[test]
    fn test_adjacent_frees_are_not_coalesced() {
        let mut heap = region(64 * 1024, 4096);
        let a = heap.alloc_mem_for_code_no_throw(0, 100, 8, 0).unwrap();
        let b = heap.alloc_mem_for_code_no_throw(0, 100, 8, 0).unwrap();
        let (block_a, track_a) = heap.get_track_allocation(a).unwrap();
        let (block_b, _) = heap.get_track_allocation(b).unwrap();
        assert_eq!(block_a + track_a.size(), block_b, "blocks should be adjacent");

        let entries_before = heap.free_blocks().len();
        let size_a = heap.free_mem_for_code(a).unwrap();
        let size_b = heap.free_mem_for_code(b).unwrap();

        // Known fragmentation characteristic: two entries, not one merged block.
        let free = heap.free_blocks();
        assert_eq!(free.len(), entries_before + 2);
        assert_eq!(free[0], (block_b, size_b));
        assert_eq!(free[1], (block_a, size_a));
        assert!(free.iter().all(|&(_, s)| s != size_a + size_b));
        assert_conserved(&heap);
    }

    #[test]
    fn test_freed_block_is_reused_first_fit() {
        let mut heap = region(64 * 1024, 4096);
        let a = heap.alloc_mem_for_code_no_throw(0, 200, 8, 0).unwrap();
        let _b = heap.alloc_mem_for_code_no_throw(0, 200, 8, 0).unwrap();
        heap.free_mem_for_code(a).unwrap();

        let c = heap.alloc_mem_for_code_no_throw(0, 200, 8, 0).unwrap();
        assert_eq!(c, a);
        assert_conserved(&heap);
    }

    #[test]
    fn test_jump_stub_reserve_is_left_free() {
        let mut heap = region(64 * 1024, 4096);
        let code = heap.alloc_mem_for_code_no_throw(0, 64, 8, 512).unwrap();
        let (block, track) = heap.get_track_allocation(code).unwrap();
        let tail = block + track.size();

        let free = heap.free_blocks();
        let (start, size) = free[0];
        assert_eq!(start, tail);
        assert!(size >= 512);
        assert_conserved(&heap);
    }

    #[test]
    fn test_block_too_small_for_reserve_is_skipped() {
        let mut heap = region(64 * 1024, 4096);
        let a = heap.alloc_mem_for_code_no_throw(0, 64, 8, 0).unwrap();
        let _b = heap.alloc_mem_for_code_no_throw(0, 64, 8, 0).unwrap();
        heap.free_mem_for_code(a).unwrap();

        // Same size fits in the freed block, but not with a stub reserve.
        let c = heap.alloc_mem_for_code_no_throw(0, 64, 8, 256).unwrap();
        assert_ne!(c, a);
        assert_conserved(&heap);
    }

    #[test]
    fn test_commits_more_when_free_list_is_exhausted() {
        let mut heap = region(64 * 1024, 4096);
        let code = heap.alloc_mem_for_code_no_throw(0, 6000, 16, 0).unwrap();
        assert!(heap.committed_bytes() > 4096);
        assert_eq!(heap.committed_bytes() % 4096, 0);
        assert_eq!(code.as_usize() % 16, 0);
        assert_conserved(&heap);
    }

    #[test]
    fn test_region_exhaustion_fails_without_panicking() {
        let mut heap = region(8192, 4096);
        assert!(heap.alloc_mem_for_code_no_throw(0, 3000, 8, 0).is_some());
        assert!(heap.alloc_mem_for_code_no_throw(0, 3000, 8, 0).is_some());
        assert!(heap.alloc_mem_for_code_no_throw(0, 3000, 8, 0).is_none());
        assert_eq!(heap.committed_bytes(), 8192);
        assert_eq!(heap.allocation_count(), 2);
        assert_conserved(&heap);
    }

    #[test]
    fn test_failed_search_keeps_smaller_free_blocks_reachable() {
        let mut heap = region(8192, 8192);
        assert!(heap.alloc_mem_for_code_no_throw(0, 5000, 8, 0).is_some());
        let leftover = heap.free_blocks();
        assert_eq!(leftover.len(), 1);

        assert!(heap.alloc_mem_for_code_no_throw(0, 5000, 8, 0).is_none());
        assert_eq!(heap.approximate_largest_block(), leftover[0].1);

        let small = heap.alloc_mem_for_code_no_throw(0, 64, 8, 0).unwrap();
        let (block, _) = heap.get_track_allocation(small).unwrap();
        assert_eq!(block, leftover[0].0);
        assert_conserved(&heap);
    }

    #[test]
    fn test_small_tail_stays_in_the_used_block() {
        let mut heap = region(4096, 4096);
        // Leaves a 32-byte tail, too small to split off.
        let size = 4096 - TRACK_ALLOCATION_SIZE - 32;
        let code = heap.alloc_mem_for_code_no_throw(0, size, 8, 0).unwrap();
        let (_, track) = heap.get_track_allocation(code).unwrap();
        assert_eq!(track.size(), 4096);
        assert!(heap.free_blocks().is_empty());
        assert_conserved(&heap);
    }

    #[test]
    fn test_rejects_bad_alignment_and_unknown_frees() {
        let mut heap = region(8192, 4096);
        assert!(heap.alloc_mem_for_code_no_throw(0, 16, 12, 0).is_none());
        assert!(heap.alloc_mem_for_code_no_throw(0, 16, 0, 0).is_none());

        let code = heap.alloc_mem_for_code_no_throw(0, 16, 8, 0).unwrap();
        assert_eq!(
            heap.free_mem_for_code(code + 8),
            Err(MemoryError::NotAllocated(code + 8))
        );
        heap.free_mem_for_code(code).unwrap();
        assert_eq!(
            heap.free_mem_for_code(code),
            Err(MemoryError::NotAllocated(code))
        );
    }

    #[test]
    fn test_conservation_over_mixed_sequence() {
        let mut heap = region(256 * 1024, 4096);
        let mut live = Vec::new();
        let mut seed: u32 = 0x1234_5678;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        for _ in 0..400 {
            let roll = next();
            if roll % 3 == 0 && !live.is_empty() {
                let victim = live.swap_remove((next() as usize) % live.len());
                heap.free_mem_for_code(victim).unwrap();
            } else {
                let size = 16 + (next() as usize % 700);
                let alignment = 1 << (next() % 6);
                let header = (next() as usize % 3) * 8;
                let reserve = if next() % 4 == 0 { 64 } else { 0 };
                if let Some(code) =
                    heap.alloc_mem_for_code_no_throw(header, size, alignment, reserve)
                {
                    assert_eq!(code.as_usize() % alignment, 0);
                    live.push(code);
                }
            }
            assert_conserved(&heap);
        }

        for code in live.drain(..) {
            heap.free_mem_for_code(code).unwrap();
        }
        assert_eq!(heap.allocation_count(), 0);
        assert_conserved(&heap);
    }
}
