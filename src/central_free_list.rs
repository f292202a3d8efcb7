//! Central Free List (middle-end): per-size-class span management.
//!
//! Each size class has its own `CentralFreeList` protected by its own mutex.
//! The list does not hold objects itself; spans do. It keeps two span lists:
//! `nonempty` (spans with at least one free object) and `empty` (spans fully
//! handed out). A span moves to `empty` when its last free object is taken
//! and back to `nonempty` when the first object is returned, both under the
//! list's lock.
//!
//! The lock is never held across a call into the page heap: growing and
//! returning spans drop it first, so the heap lock is never nested inside a
//! central lock.

use core::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use crate::config::GrowthPolicy;
use crate::error::throw;
use crate::page_heap::PageHeap;
use crate::size_class::{SizeClassInfo, SizeClassTable};
use crate::span::{ListKind, SpanList, SpanState};
use crate::stats::CentralStats;
use crate::PAGE_SIZE;

struct CentralInner {
    nonempty: SpanList,
    empty: SpanList,
    /// Free objects across both lists. Must equal the summed span free lists.
    nfree: usize,
    spans_grown: usize,
    spans_returned: usize,
}

/// Central free list for a single size class.
pub struct CentralFreeList {
    size_class: usize,
    info: SizeClassInfo,
    /// Pages requested from the heap per growth.
    grow_pages: usize,
    inner: Mutex<CentralInner>,
}

impl CentralFreeList {
    pub fn new(size_class: usize, info: SizeClassInfo, growth: &GrowthPolicy) -> Self {
        Self {
            size_class,
            info,
            grow_pages: growth.pages_for(info.pages),
            inner: Mutex::new(CentralInner {
                nonempty: SpanList::new(ListKind::CentralNonempty),
                empty: SpanList::new(ListKind::CentralEmpty),
                nfree: 0,
                spans_grown: 0,
                spans_returned: 0,
            }),
        }
    }

    pub fn size_class(&self) -> usize {
        self.size_class
    }

    pub fn info(&self) -> &SizeClassInfo {
        &self.info
    }

    /// Take up to `n` objects, appending them to `out`. Returns how many were
    /// taken; 0 means the heap could not grow and the caller is out of memory.
    pub fn alloc_list(&self, heap: &PageHeap, n: usize, out: &mut Vec<NonNull<u8>>) -> usize {
        if n == 0 {
            return 0;
        }
        let mut c = self.inner.lock();
        if c.nonempty.is_empty() && !self.grow(&mut c, heap) {
            return 0;
        }

        // The first pop cannot fail: the list is nonempty here.
        let mut count = 0;
        while count < n {
            match self.alloc_one(&mut c, heap) {
                Some(obj) => out.push(obj),
                None => break,
            }
            count += 1;
        }
        c.nfree -= count;

        if cfg!(any(debug_assertions, feature = "debug")) {
            self.check_locked(&c, heap);
        }
        count
    }

    /// Return a batch of objects of this size class.
    ///
    /// Any object whose owning span cannot be found, belongs to another class,
    /// or is already free is a fatal error.
    pub fn free_list(&self, heap: &PageHeap, objects: &[NonNull<u8>]) {
        let mut c = self.inner.lock();
        for &obj in objects {
            self.free_one(&mut c, heap, obj);
        }
        if cfg!(any(debug_assertions, feature = "debug")) {
            self.check_locked(&c, heap);
        }
    }

    /// Pop one object from the first nonempty span.
    fn alloc_one(&self, c: &mut CentralInner, heap: &PageHeap) -> Option<NonNull<u8>> {
        let arena = heap.spans();
        let id = c.nonempty.first()?;
        let base = arena.base(id);
        let (idx, exhausted) = {
            // SAFETY: central lock held; the span is on our nonempty list.
            let s = unsafe { arena.get_mut(id) };
            let Some(idx) = s.free_objects.pop() else {
                throw!("span {} on nonempty list has no free objects", id.index());
            };
            s.free_map.set(idx as usize, false);
            s.refcount += 1;
            (idx as usize, s.free_objects.is_empty())
        };
        if exhausted {
            // SAFETY: central lock held; `id` is on `nonempty`.
            unsafe {
                c.nonempty.remove(arena, id);
                c.empty.insert(arena, id);
            }
        }
        // SAFETY: `idx` indexes an object slot inside the span's pages.
        Some(unsafe { NonNull::new_unchecked(base.add(idx * self.info.size)) })
    }

    fn free_one(&self, c: &mut MutexGuard<'_, CentralInner>, heap: &PageHeap, obj: NonNull<u8>) {
        let arena = heap.spans();
        let entry = heap.lookup(obj.as_ptr());
        if entry.size_class != self.size_class {
            throw!(
                "invalid free of {:p}: object is size class {}, freed to {}",
                obj,
                entry.size_class,
                self.size_class
            );
        }
        let id = entry.span;
        let base = arena.base(id) as usize;
        let offset = obj.as_ptr() as usize - base;
        let nobjs = arena.pages(id) * PAGE_SIZE / self.info.size;
        if offset % self.info.size != 0 || offset / self.info.size >= nobjs {
            throw!("invalid free of {:p}: not the start of an object", obj);
        }
        let idx = offset / self.info.size;

        let (was_empty, dead) = {
            // SAFETY: central lock held; the span's class tag says it is ours.
            let s = unsafe { arena.get_mut(id) };
            if s.state != SpanState::InUse
                || !matches!(s.list, Some(ListKind::CentralNonempty | ListKind::CentralEmpty))
            {
                throw!("invalid free of {:p}: span {} is not held by a central list", obj, id.index());
            }
            if s.refcount == 0 || s.free_map.contains(idx) {
                throw!("double free of {:p}", obj);
            }
            let was_empty = s.list == Some(ListKind::CentralEmpty);
            s.free_objects.push(idx as u32);
            s.free_map.insert(idx);
            s.refcount -= 1;
            (was_empty, s.refcount == 0)
        };
        c.nfree += 1;

        if was_empty {
            // SAFETY: central lock held; `id` is on `empty`.
            unsafe {
                c.empty.remove(arena, id);
                c.nonempty.insert(arena, id);
            }
        }

        if dead {
            // SAFETY: central lock held; `id` is on `nonempty` after the move above.
            unsafe { c.nonempty.remove(arena, id) };
            {
                // SAFETY: unlinked but still ours until handed to the heap.
                let s = unsafe { arena.get_mut(id) };
                s.free_objects.clear();
                s.free_map.clear();
            }
            c.nfree -= nobjs;
            c.spans_returned += 1;
            heap.unmark_span(id);
            tracing::debug!(size_class = self.size_class, span = id.index(), "returning span to heap");
            MutexGuard::unlocked(c, || heap.free(id));
        }
    }

    /// Fetch a span from the heap and carve it into objects. Drops the lock
    /// while the heap works.
    fn grow(&self, c: &mut MutexGuard<'_, CentralInner>, heap: &PageHeap) -> bool {
        let grown = MutexGuard::unlocked(c, || {
            let id = heap.alloc(self.grow_pages, self.size_class)?;
            let nobjs = heap.spans().pages(id) * PAGE_SIZE / self.info.size;
            // SAFETY: the span was just handed to us and is on no list.
            let s = unsafe { heap.spans().get_mut(id) };
            s.refcount = 0;
            s.free_objects.clear();
            s.free_objects.extend((0..nobjs as u32).rev());
            s.free_map.clear();
            s.free_map.grow(nobjs);
            s.free_map.insert_range(..nobjs);
            Some((id, nobjs))
        });

        let Some((id, nobjs)) = grown else {
            tracing::warn!(
                size_class = self.size_class,
                pages = self.grow_pages,
                "central free list could not grow"
            );
            return false;
        };

        // SAFETY: central lock re-acquired; the span is ours and unlinked.
        unsafe { c.nonempty.insert(heap.spans(), id) };
        c.nfree += nobjs;
        c.spans_grown += 1;
        tracing::debug!(
            size_class = self.size_class,
            span = id.index(),
            objects = nobjs,
            "grew central free list"
        );
        true
    }

    /// Verify the list partition and the free counter. Fatal on mismatch.
    pub fn check_invariants(&self, heap: &PageHeap) {
        let c = self.inner.lock();
        self.check_locked(&c, heap);
    }

    fn check_locked(&self, c: &CentralInner, heap: &PageHeap) {
        let arena = heap.spans();
        let mut counted = 0;
        for (list, want_free) in [(&c.nonempty, true), (&c.empty, false)] {
            // SAFETY: central lock held for the whole walk.
            for id in unsafe { list.iter(arena) } {
                let nobjs = arena.pages(id) * PAGE_SIZE / self.info.size;
                // SAFETY: as above; the iterator does not hold a reference.
                let s = unsafe { arena.get_mut(id) };
                if s.has_free_objects() != want_free {
                    throw!(
                        "span {} on the wrong central list (free objects: {})",
                        id.index(),
                        s.free_objects.len()
                    );
                }
                if s.size_class != self.size_class || s.state != SpanState::InUse {
                    throw!("span {} does not belong to size class {}", id.index(), self.size_class);
                }
                if s.free_map.count_ones(..) != s.free_objects.len()
                    || s.free_objects.len() + s.refcount as usize != nobjs
                {
                    throw!(
                        "span {} free list disagrees with its counts ({} free, {} live, {} total)",
                        id.index(),
                        s.free_objects.len(),
                        s.refcount,
                        nobjs
                    );
                }
                counted += s.free_objects.len();
            }
        }
        if counted != c.nfree {
            throw!(
                "size class {} free counter {} but lists hold {}",
                self.size_class,
                c.nfree,
                counted
            );
        }
    }

    pub fn stats(&self) -> CentralStats {
        let c = self.inner.lock();
        CentralStats {
            size_class: self.size_class,
            free_objects: c.nfree,
            nonempty_spans: c.nonempty.len(),
            empty_spans: c.empty.len(),
            spans_grown: c.spans_grown,
            spans_returned: c.spans_returned,
        }
    }
}

/// The array of all central free lists, indexed by size class.
pub struct CentralCache {
    lists: Box<[CentralFreeList]>,
}

impl CentralCache {
    pub fn new(table: &SizeClassTable, growth: &GrowthPolicy) -> Self {
        Self {
            lists: (1..table.num_classes())
                .map(|cls| CentralFreeList::new(cls, *table.info(cls), growth))
                .collect(),
        }
    }

    #[inline]
    pub fn get(&self, size_class: usize) -> &CentralFreeList {
        match size_class.checked_sub(1).and_then(|i| self.lists.get(i)) {
            Some(list) => list,
            None => throw!("no central free list for size class {}", size_class),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CentralFreeList> {
        self.lists.iter()
    }
}
