//! Top-level allocator: ties all tiers together.
//!
//! An [`Allocator`] owns the size-class table, the page heap, and one
//! central free list per class. It is built once at startup and shared by
//! reference; each execution context borrows a [`ThreadCache`] from it.
//! Large objects bypass the caches and central lists and get a dedicated
//! span straight from the heap.

use core::ptr::{self, NonNull};

use crate::central_free_list::{CentralCache, CentralFreeList};
use crate::config::Config;
use crate::error::{AllocError, throw};
use crate::page_heap::PageHeap;
use crate::platform::{OsPages, PageSource};
use crate::size_class::SizeClassTable;
use crate::span::SpanId;
use crate::stats::{CentralStats, HeapStats};
use crate::thread_cache::ThreadCache;
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Quiesces every execution context. Supplied by the scheduler.
pub trait WorldStopper {
    fn stop_the_world(&self);
    fn start_the_world(&self);
}

/// A [`WorldStopper`] for embedders with a single context.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWorld;

impl WorldStopper for NoopWorld {
    fn stop_the_world(&self) {}
    fn start_the_world(&self) {}
}

/// What the collector needs to know about the span behind a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanInfo {
    pub span: SpanId,
    pub base: NonNull<u8>,
    pub pages: usize,
    /// 0 for a large object.
    pub size_class: usize,
    /// Object size in bytes; the whole span for a large object.
    pub object_size: usize,
    /// The pages held data before the span was handed out.
    pub needs_zero: bool,
}

impl SpanInfo {
    /// Start of the object containing `ptr`, or `None` if `ptr` falls in the
    /// span's tail padding or outside the span.
    pub fn object_start(&self, ptr: *const u8) -> Option<NonNull<u8>> {
        let offset = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        let span_bytes = self.pages * PAGE_SIZE;
        let usable = span_bytes - span_bytes % self.object_size;
        if offset >= usable {
            return None;
        }
        // SAFETY: the offset stays inside the span.
        Some(unsafe { self.base.add(offset - offset % self.object_size) })
    }
}

/// Segregated size-class allocator.
pub struct Allocator {
    config: Config,
    table: SizeClassTable,
    heap: PageHeap,
    central: CentralCache,
}

impl Allocator {
    /// Allocator with the default size classes and OS pages.
    pub fn new(config: Config) -> Self {
        Self::with_table(config, SizeClassTable::new())
    }

    pub fn with_table(config: Config, table: SizeClassTable) -> Self {
        Self::with_source(config, table, Box::new(OsPages))
    }

    pub fn with_source(config: Config, table: SizeClassTable, source: Box<dyn PageSource>) -> Self {
        let heap = PageHeap::with_source(&config, source);
        let central = CentralCache::new(&table, &config.growth);
        tracing::debug!(
            classes = table.num_classes() - 1,
            max_small = table.max_size(),
            "allocator initialized"
        );
        Self {
            config,
            table,
            heap,
            central,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn size_classes(&self) -> &SizeClassTable {
        &self.table
    }

    /// Size class for `size` bytes; 0 means large object.
    #[inline]
    pub fn class_for(&self, size: usize) -> usize {
        self.table.class_for(size)
    }

    pub fn heap(&self) -> &PageHeap {
        &self.heap
    }

    pub fn central(&self, size_class: usize) -> &CentralFreeList {
        self.central.get(size_class)
    }

    /// New cache for the calling execution context.
    pub fn cache(&self) -> ThreadCache<'_> {
        ThreadCache::new(self)
    }

    /// Allocate a dedicated span for an object above the largest size class.
    /// The memory is zeroed.
    pub fn alloc_large(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let npages = size.max(1).div_ceil(PAGE_SIZE);
        let Some(id) = self.heap.alloc(npages, 0) else {
            return Err(AllocError::OutOfMemory { requested: size });
        };
        let spans = self.heap.spans();
        let base = match NonNull::new(spans.base(id)) {
            Some(p) => p,
            None => throw!("large span {} has no pages", id.index()),
        };
        if spans.needs_zero(id) {
            // SAFETY: the span is ours and covers `npages` pages.
            unsafe { ptr::write_bytes(base.as_ptr(), 0, npages * PAGE_SIZE) };
        }
        tracing::trace!(size, npages, ptr = ?base, "large allocation");
        Ok(base)
    }

    /// Free a large object. `ptr` must be exactly what
    /// [`alloc_large`](Self::alloc_large) returned.
    pub fn free_large(&self, ptr: NonNull<u8>) {
        self.heap.free_large(ptr);
    }

    /// Span behind a pointer known to be inside an allocated span. A miss is
    /// fatal.
    pub fn lookup(&self, ptr: *const u8) -> SpanInfo {
        match self.span_info(ptr) {
            Some(info) => info,
            None => throw!("lookup of {:p}: not inside an allocated span", ptr),
        }
    }

    /// Span behind an arbitrary pointer, or `None` if it is not heap memory.
    pub fn span_info(&self, ptr: *const u8) -> Option<SpanInfo> {
        let entry = self.heap.try_lookup(ptr)?;
        let spans = self.heap.spans();
        let base = NonNull::new(spans.base(entry.span))?;
        let pages = spans.pages(entry.span);
        if (ptr as usize >> PAGE_SHIFT).wrapping_sub(base.as_ptr() as usize >> PAGE_SHIFT) >= pages {
            // Span was recycled between the two reads.
            return None;
        }
        let object_size = match entry.size_class {
            0 => pages * PAGE_SIZE,
            cls => self.table.class_to_size(cls),
        };
        Some(SpanInfo {
            span: entry.span,
            base,
            pages,
            size_class: entry.size_class,
            object_size,
            needs_zero: spans.needs_zero(entry.span),
        })
    }

    /// Stop the world and release every free page to the OS. Returns the
    /// number of pages released.
    pub fn free_os_memory(&self, world: &dyn WorldStopper) -> usize {
        world.stop_the_world();
        let released = self.heap.scavenge_all();
        world.start_the_world();
        tracing::info!(released_pages = released, "freed OS memory");
        released
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn central_stats(&self) -> Vec<CentralStats> {
        self.central.iter().map(CentralFreeList::stats).collect()
    }

    /// Verify every central list. Fatal on any inconsistency.
    pub fn check_invariants(&self) {
        for list in self.central.iter() {
            list.check_invariants(&self.heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_allocator_is_sync() {
        fn assert_sync<T: Sync + Send>() {}
        assert_sync::<Allocator>();
    }

    #[test]
    fn test_large_alloc_round_trip() {
        let alloc = Allocator::new(Config::default());
        let size = alloc.size_classes().max_size() + 1;
        assert_eq!(alloc.class_for(size), 0);

        let p = alloc.alloc_large(size).unwrap();
        assert_eq!(p.as_ptr() as usize % PAGE_SIZE, 0);
        let info = alloc.lookup(unsafe { p.as_ptr().add(size - 1) });
        assert_eq!(info.size_class, 0);
        assert_eq!(info.base, p);
        assert_eq!(info.pages, size.div_ceil(PAGE_SIZE));
        assert_eq!(alloc.heap_stats().large_spans, 1);

        alloc.free_large(p);
        assert_eq!(alloc.heap_stats().large_spans, 0);
        assert!(alloc.span_info(p.as_ptr()).is_none());
    }

    #[test]
    fn test_reused_large_span_is_zeroed() {
        let alloc = Allocator::new(Config::default());
        let size = 64 * 1024;
        let p = alloc.alloc_large(size).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0x5A, size) };
        alloc.free_large(p);

        let q = alloc.alloc_large(size).unwrap();
        assert_eq!(p, q);
        assert!(alloc.lookup(q.as_ptr()).needs_zero);
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == 0));
        alloc.free_large(q);
    }

    #[test]
    fn test_object_start_for_interior_pointer() {
        let table = SizeClassTable::from_sizes(&[16, 32, 48]).unwrap();
        let alloc = Allocator::with_table(Config::default(), table);
        let mut cache = alloc.cache();
        let p = cache.alloc(40).unwrap();

        let interior = unsafe { p.as_ptr().add(17) };
        let info = alloc.span_info(interior).unwrap();
        assert_eq!(info.size_class, 3);
        assert_eq!(info.object_size, 48);
        assert_eq!(info.object_start(interior), Some(p));

        // 4096 / 48 leaves 16 bytes of tail padding.
        let tail = unsafe { info.base.as_ptr().add(PAGE_SIZE - 8) };
        assert_eq!(info.object_start(tail), None);
        cache.free(p);
    }

    #[test]
    fn test_span_info_of_foreign_pointer() {
        let alloc = Allocator::new(Config::default());
        let local = 7u32;
        assert!(alloc.span_info(&local as *const u32 as *const u8).is_none());
    }

    #[test]
    fn test_large_alloc_out_of_memory() {
        let mut cfg = Config::default();
        cfg.heap.initial_reserve_pages = 16;
        cfg.heap.max_heap_bytes = 16 * PAGE_SIZE;
        let alloc = Allocator::new(cfg);
        let err = alloc.alloc_large(32 * PAGE_SIZE).unwrap_err();
        assert_eq!(err, AllocError::OutOfMemory { requested: 32 * PAGE_SIZE });
    }

    #[derive(Default)]
    struct CountingWorld {
        stops: Cell<u32>,
        starts: Cell<u32>,
    }

    impl WorldStopper for CountingWorld {
        fn stop_the_world(&self) {
            self.stops.set(self.stops.get() + 1);
        }
        fn start_the_world(&self) {
            assert_eq!(self.stops.get(), self.starts.get() + 1);
            self.starts.set(self.starts.get() + 1);
        }
    }

    #[test]
    fn test_free_os_memory_stops_the_world() {
        let mut cfg = Config::default();
        cfg.heap.initial_reserve_pages = 64;
        let alloc = Allocator::new(cfg);
        let p = alloc.alloc_large(40 * 1024).unwrap();
        alloc.free_large(p);

        let world = CountingWorld::default();
        assert_eq!(alloc.free_os_memory(&world), 64);
        assert_eq!(world.stops.get(), 1);
        assert_eq!(world.starts.get(), 1);
        assert_eq!(alloc.heap_stats().released_pages, 64);
        assert_eq!(alloc.free_os_memory(&NoopWorld), 0);
    }
}
