//! Bump allocator for resolver-owned scratch data.
//!
//! A [`ChunkAllocator`] hands out zeroed, word-aligned blocks from a chain of
//! fixed-size pages. There is no per-allocation free: [`ChunkAllocator::delete`]
//! releases the whole chain at once. One allocator belongs to exactly one
//! in-flight compilation, so none of this is thread-safe.
//!
//! Blocks are identified by [`ChunkSpan`] handles rather than raw pointers. A
//! span records the allocator and the generation it was carved in, so a span
//! that outlives a `delete()` is rejected instead of reading released memory.
use crate::{
    config::CHUNK_SIZE,
    utils::{
        align_up,
        sync::{AtomicU32, Ordering},
        WORD_SIZE,
    },
};
use std::ptr::NonNull;

static NEXT_ALLOCATOR_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkSpan {
    allocator: u32,
    generation: u32,
    page: u32,
    offset: u32,
    len: u32,
}

impl ChunkSpan {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A span covering `[start, start + len)` of this one, if it fits.
    pub fn sub_span(&self, start: usize, len: usize) -> Option<ChunkSpan> {
        let end = start.checked_add(len)?;
        if end > self.len() {
            return None;
        }
        Some(ChunkSpan {
            offset: self.offset + start as u32,
            len: len as u32,
            ..*self
        })
    }
}

struct Page {
    words: Box<[usize]>,
    available: usize,
}

impl Page {
    fn zeroed(bytes: usize) -> Option<Self> {
        let words = bytes.div_ceil(WORD_SIZE);
        let mut storage: Vec<usize> = Vec::new();
        storage.try_reserve_exact(words).ok()?;
        storage.resize(words, 0);
        Some(Self {
            words: storage.into_boxed_slice(),
            available: bytes,
        })
    }

    fn capacity(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the page owns `words.len() * WORD_SIZE` initialized bytes and
        // `u8` has no alignment requirement.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.capacity()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let capacity = self.capacity();
        // SAFETY: as in `bytes`, and we hold the only borrow of the page.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, capacity) }
    }
}

pub struct ChunkAllocator {
    id: u32,
    generation: u32,
    chunk_size: usize,
    pages: Vec<Page>,
    /// Page that small requests are carved from. Oversized requests get a
    /// dedicated page and leave this one in place so its remainder is not lost.
    current: Option<usize>,
    pages_created: u64,
    pages_released: u64,
}

impl std::fmt::Debug for ChunkAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkAllocator")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("pages", &self.pages.len())
            .field("bytes_reserved", &self.bytes_reserved())
            .finish()
    }
}

impl Default for ChunkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAllocator {
    pub fn new() -> Self {
        Self::with_chunk_size(CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let chunk_size = align_up(chunk_size.max(WORD_SIZE), WORD_SIZE).unwrap_or(CHUNK_SIZE);
        Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            chunk_size,
            pages: Vec::new(),
            current: None,
            pages_created: 0,
            pages_released: 0,
        }
    }

    /// Carves `size` zeroed bytes. Returns `None` when memory is exhausted.
    pub fn alloc(&mut self, size: usize) -> Option<ChunkSpan> {
        let len = u32::try_from(size).ok()?;
        let aligned = align_up(size, WORD_SIZE)?;

        if let Some(index) = self.current {
            let page = &mut self.pages[index];
            if aligned <= page.available {
                let offset = page.capacity() - page.available;
                page.available -= aligned;
                return Some(self.span(index, offset, len));
            }
        }

        if aligned <= self.chunk_size {
            let mut page = Page::zeroed(self.chunk_size)?;
            page.available -= aligned;
            let index = self.push_page(page)?;
            self.current = Some(index);
            tracing::trace!(
                "chunk allocator {}: new page {} for {} bytes",
                self.id,
                index,
                aligned
            );
            Some(self.span(index, 0, len))
        } else {
            let mut page = Page::zeroed(aligned)?;
            page.available = 0;
            let index = self.push_page(page)?;
            if self.current.is_none() {
                self.current = Some(index);
            }
            tracing::trace!(
                "chunk allocator {}: dedicated page {} for {} bytes",
                self.id,
                index,
                aligned
            );
            Some(self.span(index, 0, len))
        }
    }

    /// Allocates a block and copies `data` into it.
    pub fn alloc_copy(&mut self, data: &[u8]) -> Option<ChunkSpan> {
        let span = self.alloc(data.len())?;
        self.bytes_mut(span)?.copy_from_slice(data);
        Some(span)
    }

    /// Releases every page. Safe to call on an empty allocator.
    pub fn delete(&mut self) {
        if self.pages.is_empty() {
            return;
        }
        tracing::trace!(
            "chunk allocator {}: releasing {} pages",
            self.id,
            self.pages.len()
        );
        self.pages_released += self.pages.len() as u64;
        self.pages = Vec::new();
        self.current = None;
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn bytes(&self, span: ChunkSpan) -> Option<&[u8]> {
        let page = self.page_for(span)?;
        let start = span.offset as usize;
        page.bytes().get(start..start + span.len())
    }

    pub fn bytes_mut(&mut self, span: ChunkSpan) -> Option<&mut [u8]> {
        self.page_for(span)?;
        let start = span.offset as usize;
        self.pages[span.page as usize]
            .bytes_mut()
            .get_mut(start..start + span.len())
    }

    /// Raw address of a live span, for handing scratch data to native consumers.
    pub fn as_ptr(&self, span: ChunkSpan) -> Option<NonNull<u8>> {
        let page = self.page_for(span)?;
        // SAFETY: `offset` lies within the page; `page_for` validated the span.
        NonNull::new(unsafe { (page.words.as_ptr() as *mut u8).add(span.offset as usize) })
    }

    pub fn owns(&self, span: ChunkSpan) -> bool {
        self.page_for(span).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn pages_created(&self) -> u64 {
        self.pages_created
    }

    pub fn pages_released(&self) -> u64 {
        self.pages_released
    }

    pub fn bytes_reserved(&self) -> usize {
        self.pages.iter().map(Page::capacity).sum()
    }

    fn push_page(&mut self, page: Page) -> Option<usize> {
        u32::try_from(self.pages.len()).ok()?;
        self.pages.try_reserve(1).ok()?;
        self.pages.push(page);
        self.pages_created += 1;
        Some(self.pages.len() - 1)
    }

    fn span(&self, page: usize, offset: usize, len: u32) -> ChunkSpan {
        ChunkSpan {
            allocator: self.id,
            generation: self.generation,
            page: page as u32,
            offset: offset as u32,
            len,
        }
    }

    fn page_for(&self, span: ChunkSpan) -> Option<&Page> {
        if span.allocator != self.id || span.generation != self.generation {
            return None;
        }
        self.pages.get(span.page as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_writable() {
        let mut chunks = ChunkAllocator::new();
        let span = chunks.alloc(24).unwrap();
        assert_eq!(chunks.bytes(span).unwrap(), &[0u8; 24]);

        chunks.bytes_mut(span).unwrap()[3] = 0xAB;
        assert_eq!(chunks.bytes(span).unwrap()[3], 0xAB);
    }

    #[test]
    fn test_small_allocations_share_a_page() {
        let mut chunks = ChunkAllocator::with_chunk_size(64);
        let a = chunks.alloc(16).unwrap();
        let b = chunks.alloc(16).unwrap();
        assert_eq!(chunks.page_count(), 1);
        assert_ne!(chunks.as_ptr(a), chunks.as_ptr(b));

        let pa = chunks.as_ptr(a).unwrap().as_ptr() as usize;
        let pb = chunks.as_ptr(b).unwrap().as_ptr() as usize;
        assert_eq!(pb - pa, 16);
        assert_eq!(pa % WORD_SIZE, 0);
    }

    #[test]
    fn test_page_count_is_minimal_for_uniform_requests() {
        let mut chunks = ChunkAllocator::with_chunk_size(64);
        let mut total: usize = 0;
        for n in 1..=20 {
            chunks.alloc(16).unwrap();
            total += 16;
            let minimal = total.div_ceil(64);
            assert_eq!(chunks.page_count(), minimal, "after {} allocations", n);
        }
    }

    #[test]
    fn test_oversized_request_keeps_current_page() {
        let mut chunks = ChunkAllocator::with_chunk_size(64);
        chunks.alloc(16).unwrap();
        let big = chunks.alloc(500).unwrap();
        assert_eq!(big.len(), 500);
        assert_eq!(chunks.page_count(), 2);

        // The remainder of the first page is still used for small requests.
        chunks.alloc(40).unwrap();
        assert_eq!(chunks.page_count(), 2);
    }

    #[test]
    fn test_delete_releases_everything_and_is_idempotent() {
        let mut chunks = ChunkAllocator::with_chunk_size(64);
        let stale = chunks.alloc_copy(b"signature").unwrap();
        chunks.alloc(200).unwrap();
        chunks.alloc(60).unwrap();
        assert_eq!(chunks.pages_created(), 3);

        chunks.delete();
        assert!(chunks.is_empty());
        assert_eq!(chunks.pages_released(), 3);
        assert!(chunks.bytes(stale).is_none());

        chunks.delete();
        assert_eq!(chunks.pages_released(), 3);

        let fresh = chunks.alloc(8).unwrap();
        assert_eq!(chunks.page_count(), 1);
        assert_eq!(chunks.pages_created() - chunks.pages_released(), 1);
        assert!(chunks.owns(fresh));
    }

    #[test]
    fn test_spans_are_not_interchangeable_between_allocators() {
        let mut a = ChunkAllocator::new();
        let b = ChunkAllocator::new();
        let span = a.alloc_copy(&[1, 2, 3]).unwrap();
        assert!(b.bytes(span).is_none());
        assert_eq!(a.bytes(span).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_sub_span() {
        let mut chunks = ChunkAllocator::new();
        let span = chunks.alloc_copy(&[9, 8, 7, 6]).unwrap();
        let tail = span.sub_span(2, 2).unwrap();
        assert_eq!(chunks.bytes(tail).unwrap(), &[7, 6]);
        assert!(span.sub_span(3, 2).is_none());
    }
}
