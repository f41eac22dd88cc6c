/// Code heap behaviour observed through the public API: the allocate/free/
/// destroy scenario, byte conservation, fragmentation and region release.
use dotnet_dynmethod::{
    code_heap::{
        CodeHeapManager, HostCodeHeap, LoaderAllocator, SystemHostMemory, TrackAllocation,
        TRACK_ALLOCATION_SIZE,
    },
    config::DynamicMethodConfig,
    error::StateError,
    utils::{CodeAddr, RegionId},
};
use std::sync::Arc;

fn region(reserve: usize, initial_commit: usize) -> HostCodeHeap {
    let allocator = Arc::new(LoaderAllocator::new(Arc::new(SystemHostMemory::new())));
    HostCodeHeap::create(RegionId(0), allocator, reserve, initial_commit, 4096, true).unwrap()
}

fn assert_conserved(heap: &HostCodeHeap) {
    let used: usize = heap.used_blocks().map(|(_, t)| t.size()).sum();
    let free: usize = heap.free_blocks().iter().map(|&(_, size)| size).sum();
    assert_eq!(used + free, heap.committed_bytes());
    assert_eq!(free, heap.total_bytes_available());
}

// ============================================================================
// Scenario
// ============================================================================

#[test]
fn test_alloc_free_destroy_scenario() {
    let heaps = CodeHeapManager::in_process(DynamicMethodConfig::default());
    let id = heaps.lock().create_code_heap(64 * 1024).unwrap();
    assert_eq!(heaps.stats()[0].committed_bytes, 4096);

    let code = heaps.alloc_code(8, 64, 16, 0).unwrap();
    assert_eq!(code.as_usize() % 16, 0);
    assert_eq!(heaps.get_code_heap(code), Some(id));
    assert_eq!(heaps.stats()[0].allocation_count, 1);
    assert!(matches!(
        heaps.get_track_allocation(code),
        Some((_, TrackAllocation::Used { heap, .. })) if heap == id
    ));

    heaps.free_code(code).unwrap();
    {
        let set = heaps.lock();
        let heap = set.region(id).unwrap();
        assert_eq!(heap.allocation_count(), 0);
        assert!(heap.free_blocks().iter().any(|&(_, size)| size >= 64));
    }

    heaps.destroy_code_heap(id).unwrap();
    assert_eq!(heaps.get_code_heap(code), None);
    assert!(heaps.lock().region(id).is_none());
    assert!(heaps.stats().is_empty());
}

// ============================================================================
// Invariants
// ============================================================================

#[test]
fn test_bytes_are_conserved_across_random_sequences() {
    for seed in [1u64, 7, 0xDEAD_BEEF, 42_424_242] {
        let mut heap = region(512 * 1024, 4096);
        let mut state = seed;
        let mut live: Vec<CodeAddr> = Vec::new();
        for _ in 0..500 {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let roll = (state >> 33) as usize;
            if roll % 5 < 2 && !live.is_empty() {
                let code = live.swap_remove(roll % live.len());
                heap.free_mem_for_code(code).unwrap();
            } else {
                let size = 8 + roll % 1500;
                let alignment = 1usize << (roll % 7);
                let header = if roll % 2 == 0 { 0 } else { 16 };
                let reserve = if roll % 11 == 0 { 128 } else { 0 };
                if let Some(code) = heap.alloc_mem_for_code_no_throw(header, size, alignment, reserve) {
                    assert_eq!(code.as_usize() % alignment, 0);
                    let (block, _) = heap.get_track_allocation(code).unwrap();
                    assert!(code.offset_from(block) >= TRACK_ALLOCATION_SIZE + header);
                    live.push(code);
                }
            }
            assert_conserved(&heap);
            assert_eq!(heap.allocation_count() as usize, live.len());
        }
    }
}

/// Freeing adjacent blocks leaves separate free-list entries. This is a known
/// fragmentation characteristic of the allocator, kept on purpose.
#[test]
fn test_adjacent_free_blocks_stay_fragmented() {
    let mut heap = region(64 * 1024, 4096);
    let blocks: Vec<_> = (0..4)
        .map(|_| heap.alloc_mem_for_code_no_throw(0, 240, 16, 0).unwrap())
        .collect();
    let tracked: Vec<_> = blocks
        .iter()
        .map(|&code| heap.get_track_allocation(code).unwrap())
        .collect();
    let entries_before = heap.free_blocks().len();

    for &code in &blocks {
        heap.free_mem_for_code(code).unwrap();
    }
    let free = heap.free_blocks();
    assert_eq!(free.len(), entries_before + 4);
    for (block, track) in &tracked {
        assert!(free.contains(&(*block, track.size())));
    }

    // A request bigger than any single freed block leaves all four in place.
    heap.alloc_mem_for_code_no_throw(0, 600, 16, 0).unwrap();
    let free = heap.free_blocks();
    for (block, _) in &tracked {
        assert!(free.iter().any(|(start, _)| start == block));
    }
    assert_conserved(&heap);
}

#[test]
fn test_destroy_rejected_until_region_is_empty() {
    let heaps = CodeHeapManager::in_process(DynamicMethodConfig::default());
    let a = heaps.alloc_code(0, 100, 8, 0).unwrap();
    let b = heaps.alloc_code(0, 100, 8, 0).unwrap();
    let id = heaps.get_code_heap(a).unwrap();
    assert_eq!(heaps.get_code_heap(b), Some(id));

    heaps.free_code(a).unwrap();
    assert_eq!(
        heaps.destroy_code_heap(id),
        Err(StateError::RegionInUse {
            region: id,
            allocations: 1
        })
    );
    assert_eq!(heaps.release_empty_heaps(), 0);

    heaps.free_code(b).unwrap();
    assert_eq!(heaps.release_empty_heaps(), 1);
    assert_eq!(heaps.get_code_heap(b), None);

    // Ids are not reused after a region is destroyed.
    let c = heaps.alloc_code(0, 100, 8, 0).unwrap();
    assert_ne!(heaps.get_code_heap(c), Some(id));
}

#[test]
fn test_regions_are_filled_in_creation_order() {
    let heaps = CodeHeapManager::in_process(
        DynamicMethodConfig::new()
            .with_code_heap_reserve(8192)
            .with_initial_commit(8192),
    );
    let first = heaps.alloc_code(0, 5000, 8, 0).unwrap();
    let second = heaps.alloc_code(0, 5000, 8, 0).unwrap();
    let r1 = heaps.get_code_heap(first).unwrap();
    let r2 = heaps.get_code_heap(second).unwrap();
    assert_ne!(r1, r2);

    // Small requests go to the first region that still has room.
    let small = heaps.alloc_code(0, 64, 8, 0).unwrap();
    assert_eq!(heaps.get_code_heap(small), Some(r1));
}

#[cfg(feature = "memory-validation")]
#[test]
fn test_alignment_is_validated() {
    let mut heap = region(64 * 1024, 4096);
    for shift in 0..8 {
        let alignment = 1 << shift;
        let code = heap.alloc_mem_for_code_no_throw(3, 17, alignment, 0).unwrap();
        assert_eq!(code.as_usize() % alignment, 0);
    }
}
