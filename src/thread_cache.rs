//! Thread Cache (front-end): per-context free lists for lock-free allocation.
//!
//! Each execution context owns one `ThreadCache`. The fast path (cache hit)
//! needs no synchronization. When a list is empty or too long, objects move
//! to and from the central free list one transfer batch at a time.

use core::ptr::{self, NonNull};
use std::collections::HashSet;

use crate::allocator::Allocator;
use crate::error::{AllocError, throw};
use crate::stats::CacheStats;

/// Per-size-class free list within the cache.
struct FreeList {
    objects: Vec<NonNull<u8>>,
    /// Same contents as `objects`, for O(1) duplicate checks.
    members: HashSet<NonNull<u8>>,
    /// Objects moved per refill or flush.
    batch_size: usize,
}

impl FreeList {
    fn new(batch_size: usize) -> Self {
        Self {
            objects: Vec::new(),
            members: HashSet::new(),
            batch_size,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    fn pop(&mut self) -> Option<NonNull<u8>> {
        let obj = self.objects.pop()?;
        self.members.remove(&obj);
        Some(obj)
    }

    /// Push `obj`. Returns false if the list already holds it.
    #[inline]
    fn push(&mut self, obj: NonNull<u8>) -> bool {
        if !self.members.insert(obj) {
            return false;
        }
        self.objects.push(obj);
        true
    }

    /// Record objects appended to `objects` from index `start` on.
    fn adopt_from(&mut self, start: usize) {
        self.members.extend(self.objects[start..].iter().copied());
    }

    /// The `count` most recently pushed objects.
    fn tail(&self, count: usize) -> &[NonNull<u8>] {
        &self.objects[self.objects.len() - count..]
    }

    fn truncate_tail(&mut self, count: usize) {
        let len = self.objects.len();
        for obj in self.objects.drain(len - count..) {
            self.members.remove(&obj);
        }
    }
}

/// Per-context cache holding free lists for each size class.
///
/// Borrowing the [`Allocator`] ties the cache's lifetime to the heap it
/// draws from. Dropping the cache flushes everything back to the central
/// lists.
pub struct ThreadCache<'a> {
    allocator: &'a Allocator,
    /// Indexed by size class; slot 0 (large) is never used.
    lists: Box<[FreeList]>,
    /// Total bytes cached across all size classes.
    total_size: usize,
    max_list_len: usize,
    max_size: usize,
    hits: u64,
    misses: u64,
    flushes: u64,
}

// SAFETY: cached objects are plain addresses owned by this cache, and the
// allocator it borrows is `Sync`.
unsafe impl Send for ThreadCache<'_> {}

impl<'a> ThreadCache<'a> {
    pub fn new(allocator: &'a Allocator) -> Self {
        let table = allocator.size_classes();
        let config = &allocator.config().cache;
        Self {
            allocator,
            lists: (0..table.num_classes())
                .map(|cls| FreeList::new(table.info(cls).batch_size.max(1)))
                .collect(),
            total_size: 0,
            max_list_len: config.max_list_len.max(1),
            max_size: config.max_bytes,
            hits: 0,
            misses: 0,
            flushes: 0,
        }
    }

    pub fn allocator(&self) -> &'a Allocator {
        self.allocator
    }

    /// Allocate `size` bytes. Small sizes come from the cache and are zeroed;
    /// sizes above the largest class get a dedicated span.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let cls = self.allocator.class_for(size);
        if cls == 0 {
            return self.allocator.alloc_large(size);
        }
        let obj = self.alloc_one(cls)?;
        let obj_size = self.allocator.size_classes().class_to_size(cls);
        // SAFETY: the object spans `obj_size` bytes and is exclusively ours.
        unsafe { ptr::write_bytes(obj.as_ptr(), 0, obj_size) };
        Ok(obj)
    }

    /// Free a pointer returned by [`alloc`](Self::alloc). The owning span
    /// decides whether it is a small or a large object.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let entry = self.allocator.heap().lookup(ptr.as_ptr());
        if entry.size_class == 0 {
            self.allocator.free_large(ptr);
        } else {
            self.free_one(ptr, entry.size_class);
        }
    }

    /// Allocate one object of `size_class`. Contents are unspecified.
    #[inline]
    pub fn alloc_one(&mut self, size_class: usize) -> Result<NonNull<u8>, AllocError> {
        if let Some(obj) = self.list_mut(size_class).pop() {
            self.total_size -= self.allocator.size_classes().class_to_size(size_class);
            self.hits += 1;
            return Ok(obj);
        }
        // Slow path: fetch from central cache
        self.fetch_from_central(size_class)
    }

    /// Return one object of `size_class` to the cache. Freeing an object the
    /// cache already holds is fatal.
    #[inline]
    pub fn free_one(&mut self, ptr: NonNull<u8>, size_class: usize) {
        let list = self.list_mut(size_class);
        if !list.push(ptr) {
            throw!("double free of {:p}", ptr);
        }
        let (len, batch) = (list.len(), list.batch_size);
        self.total_size += self.allocator.size_classes().class_to_size(size_class);

        if len > self.max_list_len {
            self.release_to_central(size_class, batch);
        }
        if self.total_size > self.max_size {
            self.scavenge();
        }
    }

    /// Flush every cached object back to the central lists.
    pub fn teardown(&mut self) {
        for cls in 1..self.lists.len() {
            let len = self.lists[cls].len();
            if len > 0 {
                self.release_to_central(cls, len);
            }
        }
        debug_assert_eq!(self.total_size, 0);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached_bytes: self.total_size,
            cached_objects: self.lists.iter().map(FreeList::len).sum(),
            hits: self.hits,
            misses: self.misses,
            flushes: self.flushes,
        }
    }

    #[inline]
    fn list_mut(&mut self, size_class: usize) -> &mut FreeList {
        match self.lists.get_mut(size_class) {
            Some(list) if size_class != 0 => list,
            _ => throw!("no cached free list for size class {}", size_class),
        }
    }

    /// Slow path: fetch a batch of objects from the central free list.
    #[cold]
    fn fetch_from_central(&mut self, size_class: usize) -> Result<NonNull<u8>, AllocError> {
        let allocator = self.allocator;
        let size = allocator.size_classes().class_to_size(size_class);
        let list = &mut self.lists[size_class];
        let start = list.len();

        let count =
            allocator
                .central(size_class)
                .alloc_list(allocator.heap(), list.batch_size, &mut list.objects);
        list.adopt_from(start);
        self.misses += 1;
        tracing::trace!(size_class, count, "refilled thread cache");

        let Some(obj) = list.pop() else {
            return Err(AllocError::OutOfMemory { requested: size });
        };
        self.total_size += (count - 1) * size;
        Ok(obj)
    }

    /// Hand the `count` most recently freed objects of a class back to central.
    fn release_to_central(&mut self, size_class: usize, count: usize) {
        let allocator = self.allocator;
        let list = &mut self.lists[size_class];
        let count = count.min(list.len());
        if count == 0 {
            return;
        }

        allocator
            .central(size_class)
            .free_list(allocator.heap(), list.tail(count));
        list.truncate_tail(count);
        self.total_size -= count * allocator.size_classes().class_to_size(size_class);
        self.flushes += 1;
        tracing::trace!(size_class, count, "flushed thread cache");
    }

    /// Cache grew past its byte limit: empty every list.
    #[cold]
    fn scavenge(&mut self) {
        tracing::trace!(cached_bytes = self.total_size, "thread cache over limit");
        self.teardown();
    }
}

impl Drop for ThreadCache<'_> {
    fn drop(&mut self) {
        // Not while unwinding from a fatal error.
        if !std::thread::panicking() {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::size_class::SizeClassTable;

    fn make_test_env() -> Allocator {
        Allocator::new(Config::default())
    }

    #[test]
    fn test_allocate_and_deallocate() {
        let alloc = make_test_env();
        let mut tc = alloc.cache();

        // Allocate a small object (size class 1 = 8 bytes)
        let ptr = tc.alloc_one(1).unwrap();
        assert!(alloc.heap().try_lookup(ptr.as_ptr()).is_some());

        // Deallocate it
        tc.free_one(ptr, 1);
    }

    #[test]
    fn test_allocate_many() {
        let alloc = make_test_env();
        let mut tc = alloc.cache();
        let cls = alloc.class_for(32);

        let mut ptrs = Vec::new();
        for _ in 0..1000 {
            ptrs.push(tc.alloc_one(cls).unwrap());
        }
        ptrs.sort();
        ptrs.dedup();
        assert_eq!(ptrs.len(), 1000);
        for ptr in ptrs {
            tc.free_one(ptr, cls);
        }
        assert!(tc.stats().cached_objects <= 256);
    }

    #[test]
    fn test_mixed_sizes() {
        let alloc = make_test_env();
        let mut tc = alloc.cache();

        let mut allocs: Vec<(usize, NonNull<u8>)> = Vec::new();
        for cls in [1, 4, 8, 12, 16, 20, 24] {
            for _ in 0..50 {
                allocs.push((cls, tc.alloc_one(cls).unwrap()));
            }
        }
        for (cls, ptr) in allocs {
            assert_eq!(alloc.heap().lookup(ptr.as_ptr()).size_class, cls);
            tc.free_one(ptr, cls);
        }
    }

    #[test]
    fn test_reuse_from_cache() {
        let alloc = make_test_env();
        let mut tc = alloc.cache();

        // Allocate and free to populate thread cache
        let ptr1 = tc.alloc_one(2).unwrap();
        tc.free_one(ptr1, 2);

        // Next allocation should come from thread cache (same pointer)
        let ptr2 = tc.alloc_one(2).unwrap();
        assert_eq!(ptr1, ptr2);
        assert_eq!(tc.stats().misses, 1);
        assert_eq!(tc.stats().hits, 1);

        tc.free_one(ptr2, 2);
    }

    #[test]
    fn test_refill_moves_one_batch() {
        let alloc = make_test_env();
        let mut tc = alloc.cache();
        let cls = alloc.class_for(16);
        let batch = alloc.size_classes().info(cls).batch_size;
        assert!(batch < alloc.size_classes().info(cls).objects_per_span());

        let p = tc.alloc_one(cls).unwrap();
        let stats = tc.stats();
        assert_eq!(stats.cached_objects, batch - 1);
        assert_eq!(stats.cached_bytes, (batch - 1) * 16);
        tc.free_one(p, cls);
    }

    #[test]
    fn test_long_list_flushes_one_batch() {
        let mut cfg = Config::default();
        cfg.cache.max_list_len = 8;
        let table = SizeClassTable::from_sizes(&[16, 32, 64]).unwrap();
        let alloc = Allocator::with_table(cfg, table);
        let mut tc = alloc.cache();
        let batch = alloc.size_classes().info(1).batch_size;

        let ptrs: Vec<_> = (0..40).map(|_| tc.alloc_one(1).unwrap()).collect();
        let before = tc.stats();
        for p in ptrs {
            tc.free_one(p, 1);
        }
        let after = tc.stats();
        assert!(after.flushes > before.flushes);
        assert!(after.cached_objects <= 8);
        assert!(batch >= 2);
        assert_eq!(
            alloc.central(1).stats().free_objects + after.cached_objects,
            256
        );
    }

    #[test]
    fn test_byte_limit_flushes_everything() {
        let mut cfg = Config::default();
        cfg.cache.max_bytes = 4096;
        let alloc = Allocator::new(cfg);
        let mut tc = alloc.cache();
        let cls = alloc.class_for(2048);

        let a = tc.alloc_one(cls).unwrap();
        let b = tc.alloc_one(cls).unwrap();
        let c = tc.alloc_one(cls).unwrap();
        tc.free_one(a, cls);
        tc.free_one(b, cls);
        tc.free_one(c, cls);
        assert!(tc.stats().cached_bytes <= 4096);
    }

    #[test]
    fn test_teardown_returns_everything() {
        let alloc = make_test_env();
        {
            let mut tc = alloc.cache();
            let ptrs: Vec<_> = (0..100).map(|_| tc.alloc(48).unwrap()).collect();
            for p in ptrs {
                tc.free(p);
            }
        }
        let cls = alloc.class_for(48);
        let stats = alloc.central(cls).stats();
        assert_eq!(stats.spans_grown, stats.spans_returned);
        assert_eq!(alloc.heap().stats().in_use_pages, 0);
    }

    #[test]
    fn test_alloc_zeroes_reused_objects() {
        let alloc = make_test_env();
        let mut tc = alloc.cache();
        let p = tc.alloc(64).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0xEE, 64) };
        tc.free(p);
        let q = tc.alloc(64).unwrap();
        assert_eq!(p, q);
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        tc.free(q);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_into_cache_is_fatal() {
        let alloc = make_test_env();
        let mut tc = alloc.cache();
        let p = tc.alloc_one(3).unwrap();
        tc.free_one(p, 3);
        tc.free_one(p, 3);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_after_reuse_is_fatal() {
        let alloc = make_test_env();
        let mut tc = alloc.cache();
        let p = tc.alloc_one(3).unwrap();
        tc.free_one(p, 3);
        let q = tc.alloc_one(3).unwrap();
        assert_eq!(p, q);
        tc.free_one(q, 3);
        let cached = tc.stats().cached_objects;
        assert!(cached > 1);
        tc.free_one(p, 3);
    }

    #[test]
    #[should_panic(expected = "no cached free list for size class 0")]
    fn test_free_to_large_class_is_fatal() {
        let alloc = make_test_env();
        let mut tc = alloc.cache();
        let p = tc.alloc_one(1).unwrap();
        tc.free_one(p, 0);
    }

    #[test]
    #[should_panic(expected = "no cached free list for size class")]
    fn test_alloc_from_unknown_class_is_fatal() {
        let alloc = make_test_env();
        let mut tc = alloc.cache();
        let _ = tc.alloc_one(alloc.size_classes().num_classes());
    }
}
