//! Page Heap (back-end): hands out and reclaims runs of pages.
//!
//! Free spans are indexed by page count: one list per exact length below
//! [`MAX_PAGE_LIST`], plus a `large` list for everything longer. Requests
//! search the exact lists first-fit from the requested length upward and
//! fall back to a best-fit scan of `large`. When nothing fits, more memory is
//! reserved from the [`PageSource`] in batches that double each time.
//!
//! Freed spans are merged with free neighbours from the same reservation.
//! Pages that stay free long enough are released to the OS by the scavenger.
//!
//! One mutex protects all of this. The page map is readable without it.

use core::ptr::NonNull;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{Config, HeapConfig, ScavengeConfig};
use crate::error::throw;
use crate::pagemap::{MAX_PAGE, PageEntry, PageMap};
use crate::platform::{OsPages, PageSource};
use crate::span::{ListKind, SpanArena, SpanId, SpanList, SpanState};
use crate::stats::HeapStats;
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Free spans shorter than this many pages live on exact-length lists.
pub const MAX_PAGE_LIST: usize = 128;

/// One reservation obtained from the page source.
struct Chunk {
    base: NonNull<u8>,
    pages: usize,
}

// SAFETY: a chunk is only an address range record; the memory it names is
// managed through the span arena's ownership rules.
unsafe impl Send for Chunk {}

struct HeapInner {
    /// `free[n]` holds free spans of exactly `n` pages (index 0 unused).
    free: Vec<SpanList>,
    /// Free spans of `MAX_PAGE_LIST` pages or more.
    large: SpanList,
    chunks: Vec<Chunk>,
    /// Span records available for reuse.
    dead: Vec<SpanId>,
    next_reserve_pages: usize,
    last_scavenge: Instant,
    stats: HeapStats,
}

pub struct PageHeap {
    inner: Mutex<HeapInner>,
    pagemap: PageMap,
    spans: SpanArena,
    source: Box<dyn PageSource>,
    config: HeapConfig,
    scavenge: ScavengeConfig,
}

impl PageHeap {
    pub fn new(config: &Config) -> Self {
        Self::with_source(config, Box::new(OsPages))
    }

    pub fn with_source(config: &Config, source: Box<dyn PageSource>) -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                free: (0..MAX_PAGE_LIST)
                    .map(|_| SpanList::new(ListKind::HeapFree))
                    .collect(),
                large: SpanList::new(ListKind::HeapFree),
                chunks: Vec::new(),
                dead: Vec::new(),
                next_reserve_pages: config.heap.initial_reserve_pages.max(1),
                last_scavenge: Instant::now(),
                stats: HeapStats::default(),
            }),
            pagemap: PageMap::new(),
            spans: SpanArena::new(),
            source,
            config: config.heap.clone(),
            scavenge: config.scavenge.clone(),
        }
    }

    #[inline]
    pub fn pagemap(&self) -> &PageMap {
        &self.pagemap
    }

    #[inline]
    pub fn spans(&self) -> &SpanArena {
        &self.spans
    }

    /// Allocate a span of exactly `npages` pages tagged with `size_class`
    /// (0 for a large object). Returns `None` only if the page source refuses
    /// to reserve more memory.
    ///
    /// The returned span is owned by the caller and on no list.
    pub fn alloc(&self, npages: usize, size_class: usize) -> Option<SpanId> {
        assert!(npages > 0, "zero-page span requested");
        let mut h = self.inner.lock();
        let id = match self.find_locked(&h, npages) {
            Some(id) => id,
            None => {
                if !self.grow_locked(&mut h, npages) {
                    return None;
                }
                self.find_locked(&h, npages)?
            }
        };
        Some(self.carve_locked(&mut h, id, npages, size_class))
    }

    /// Return an in-use span to the free index, merging it with free
    /// neighbours. The caller gives up ownership of `id`.
    pub fn free(&self, id: SpanId) {
        let mut h = self.inner.lock();
        self.free_locked(&mut h, id);
        self.maybe_scavenge_locked(&mut h);
    }

    /// Free the large object starting at `ptr`.
    ///
    /// The page map is consulted under the heap lock so a racing double free
    /// is caught rather than releasing somebody else's span.
    pub fn free_large(&self, ptr: NonNull<u8>) {
        let mut h = self.inner.lock();
        let page = ptr.as_ptr() as usize >> PAGE_SHIFT;
        let Some(entry) = self.pagemap.get(page).filter(|e| e.in_use) else {
            throw!("invalid free of {:p}: not an allocated object", ptr);
        };
        if entry.size_class != 0 || self.spans.base(entry.span) != ptr.as_ptr() {
            throw!("invalid free of {:p}: not the start of a large object", ptr);
        }
        self.free_locked(&mut h, entry.span);
        self.maybe_scavenge_locked(&mut h);
    }

    /// Clear the page tags of a span its owner is about to hand back.
    ///
    /// Lock-free; the caller must own the span.
    pub fn unmark_span(&self, id: SpanId) {
        self.pagemap
            .clear_range(self.spans.start_page(id), self.spans.pages(id));
    }

    /// Owning span of a pointer into an allocated span. A miss means the
    /// pointer was never handed out, which is fatal.
    #[inline]
    pub fn lookup(&self, ptr: *const u8) -> PageEntry {
        match self.try_lookup(ptr) {
            Some(entry) => entry,
            None => throw!("lookup of {:p}: not inside an allocated span", ptr),
        }
    }

    /// Like [`lookup`](Self::lookup) but returns `None` for pointers outside
    /// any allocated span.
    #[inline]
    pub fn try_lookup(&self, ptr: *const u8) -> Option<PageEntry> {
        self.pagemap
            .get(ptr as usize >> PAGE_SHIFT)
            .filter(|e| e.in_use)
    }

    /// Release free pages that have been idle longer than the configured
    /// threshold. Returns the number of pages newly released.
    pub fn scavenge(&self) -> usize {
        let mut h = self.inner.lock();
        self.scavenge_locked(&mut h, Instant::now(), self.scavenge.idle_threshold)
    }

    /// Release every free page regardless of idle time.
    pub fn scavenge_all(&self) -> usize {
        let mut h = self.inner.lock();
        self.scavenge_locked(&mut h, Instant::now(), Duration::ZERO)
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats
    }

    // =========================================================================
    // Locked helpers
    // =========================================================================

    fn find_locked(&self, h: &HeapInner, npages: usize) -> Option<SpanId> {
        if let Some(id) = h.free[npages.min(MAX_PAGE_LIST)..]
            .iter()
            .find_map(|list| list.first())
        {
            return Some(id);
        }

        // Best fit among the large spans; ties go to the lowest address.
        let mut best: Option<(usize, usize, SpanId)> = None;
        // SAFETY: heap lock held; free spans are owned by the heap.
        for id in unsafe { h.large.iter(&self.spans) } {
            let pages = self.spans.pages(id);
            if pages < npages {
                continue;
            }
            let key = (pages, self.spans.base(id) as usize);
            if best.is_none_or(|(p, b, _)| key < (p, b)) {
                best = Some((key.0, key.1, id));
            }
        }
        best.map(|(_, _, id)| id)
    }

    /// Take `id` out of the free index, trim it to `npages`, and publish it
    /// as in use.
    fn carve_locked(
        &self,
        h: &mut HeapInner,
        id: SpanId,
        npages: usize,
        size_class: usize,
    ) -> SpanId {
        self.remove_free_locked(h, id);

        let pages = self.spans.pages(id);
        let base = self.base_of(id);
        // SAFETY: heap lock held and the span was just taken off the free index.
        let (needs_zero, chunk, unused_since, released) = {
            let s = unsafe { self.spans.get_mut(id) };
            if s.state != SpanState::Free {
                throw!("span {} in free index with state {:?}", id.index(), s.state);
            }
            let released = core::mem::take(&mut s.released_pages);
            (s.needs_zero, s.chunk, s.unused_since, released)
        };

        if pages > npages {
            let rest = self.new_span_locked(h);
            // SAFETY: `base` covers `pages` pages, so the offset stays in bounds.
            let rest_base = unsafe { base.add(npages * PAGE_SIZE) };
            self.spans.set_geometry(rest, rest_base, pages - npages);
            // SAFETY: freshly minted record, not published anywhere yet.
            let t = unsafe { self.spans.get_mut(rest) };
            t.init();
            t.state = SpanState::Free;
            t.chunk = chunk;
            t.needs_zero = needs_zero;
            // Released pages are not tracked by position; the carved head
            // absorbs them first.
            t.released_pages = released.saturating_sub(npages);
            t.unused_since = unused_since;
            self.insert_free_locked(h, rest);
            self.spans.set_geometry(id, base, npages);
        }

        // SAFETY: heap lock held; the span now belongs to the caller-to-be.
        let s = unsafe { self.spans.get_mut(id) };
        s.state = SpanState::InUse;
        s.size_class = size_class;
        s.refcount = 0;
        s.unused_since = None;
        self.spans.publish_needs_zero(id, needs_zero);

        h.stats.in_use_pages += npages;
        h.stats.in_use_spans += 1;
        if size_class == 0 {
            h.stats.large_spans += 1;
        }
        self.pagemap.set_range(
            base.as_ptr() as usize >> PAGE_SHIFT,
            npages,
            PageEntry::in_use(id, size_class),
        );
        id
    }

    fn free_locked(&self, h: &mut HeapInner, id: SpanId) {
        let mut base = self.base_of(id);
        let mut pages = self.spans.pages(id);
        let start = base.as_ptr() as usize >> PAGE_SHIFT;
        let now = Instant::now();

        // SAFETY: the caller handed ownership of `id` to the heap; lock held.
        let (chunk, size_class, mut needs_zero, mut released) = {
            let s = unsafe { self.spans.get_mut(id) };
            if s.state != SpanState::InUse || s.list.is_some() {
                throw!("freeing span {} in state {:?} on {:?}", id.index(), s.state, s.list);
            }
            if s.refcount != 0 {
                throw!("freeing span {} with {} live objects", id.index(), s.refcount);
            }
            (s.chunk, s.size_class, true, 0)
        };

        self.pagemap.clear_range(start, pages);
        h.stats.in_use_pages -= pages;
        h.stats.in_use_spans -= 1;
        if size_class == 0 {
            h.stats.large_spans -= 1;
        }

        // Merge with the span ending just before us.
        if let Some(left) = start
            .checked_sub(1)
            .and_then(|p| self.pagemap.get(p))
            .filter(|e| !e.in_use)
            .map(|e| e.span)
            .filter(|&t| self.is_free_neighbour(t, chunk))
        {
            self.remove_free_locked(h, left);
            // SAFETY: heap lock held; `left` was a free span owned by the heap.
            let t = unsafe { self.spans.get_mut(left) };
            needs_zero |= t.needs_zero;
            released += t.released_pages;
            base = self.base_of(left);
            pages += self.spans.pages(left);
            self.kill_locked(h, left);
        }

        // And with the span starting just after us.
        let end = (base.as_ptr() as usize >> PAGE_SHIFT) + pages;
        if let Some(right) = self
            .pagemap
            .get(end)
            .filter(|e| !e.in_use)
            .map(|e| e.span)
            .filter(|&t| self.is_free_neighbour(t, chunk))
        {
            self.remove_free_locked(h, right);
            // SAFETY: as above.
            let t = unsafe { self.spans.get_mut(right) };
            needs_zero |= t.needs_zero;
            released += t.released_pages;
            pages += self.spans.pages(right);
            self.kill_locked(h, right);
        }

        self.spans.set_geometry(id, base, pages);
        // SAFETY: heap lock held; the span is owned by the heap from here on.
        let s = unsafe { self.spans.get_mut(id) };
        s.init();
        s.state = SpanState::Free;
        s.chunk = chunk;
        s.needs_zero = needs_zero;
        s.released_pages = released;
        s.unused_since = Some(now);
        self.insert_free_locked(h, id);
    }

    /// Whether `id` is a free span from the same reservation. Only spans in
    /// the free index are examined; in-use spans never reach this point
    /// because their page tags carry the in-use bit.
    fn is_free_neighbour(&self, id: SpanId, chunk: u32) -> bool {
        // SAFETY: heap lock held by every caller; free spans belong to the heap.
        let t = unsafe { self.spans.get_mut(id) };
        t.state == SpanState::Free && t.chunk == chunk
    }

    fn insert_free_locked(&self, h: &mut HeapInner, id: SpanId) {
        let pages = self.spans.pages(id);
        let start = self.spans.start_page(id);
        // SAFETY: heap lock held; span owned by the heap.
        let released = unsafe { self.spans.get_mut(id) }.released_pages;
        unsafe {
            if pages < MAX_PAGE_LIST {
                h.free[pages].insert(&self.spans, id);
            } else {
                h.large.insert(&self.spans, id);
            }
        }
        // Boundary tags let neighbours find this span when they are freed.
        self.pagemap.set(start, PageEntry::free(id));
        self.pagemap.set(start + pages - 1, PageEntry::free(id));
        h.stats.free_pages += pages;
        h.stats.released_pages += released;
        h.stats.free_spans += 1;
    }

    fn remove_free_locked(&self, h: &mut HeapInner, id: SpanId) {
        let pages = self.spans.pages(id);
        // SAFETY: heap lock held; span is on a free list owned by the heap.
        let released = unsafe { self.spans.get_mut(id) }.released_pages;
        unsafe {
            if pages < MAX_PAGE_LIST {
                h.free[pages].remove(&self.spans, id);
            } else {
                h.large.remove(&self.spans, id);
            }
        }
        h.stats.free_pages -= pages;
        h.stats.released_pages -= released;
        h.stats.free_spans -= 1;
    }

    fn new_span_locked(&self, h: &mut HeapInner) -> SpanId {
        match h.dead.pop().or_else(|| self.spans.push()) {
            Some(id) => id,
            None => throw!("span arena exhausted"),
        }
    }

    fn kill_locked(&self, h: &mut HeapInner, id: SpanId) {
        // SAFETY: heap lock held; the record was just unlinked from the free index.
        unsafe { self.spans.get_mut(id) }.init();
        h.dead.push(id);
    }

    /// Reserve at least `npages` more pages from the page source.
    fn grow_locked(&self, h: &mut HeapInner, npages: usize) -> bool {
        let limit_pages = match self.config.max_heap_bytes {
            0 => usize::MAX,
            bytes => bytes / PAGE_SIZE,
        };
        let room = limit_pages.saturating_sub(h.stats.reserved_pages);

        let mut ask = npages.max(h.next_reserve_pages).min(room);
        if ask < npages {
            tracing::warn!(npages, reserved = h.stats.reserved_pages, "heap limit reached");
            return false;
        }

        let mut reservation = self.source.reserve(ask * PAGE_SIZE);
        if reservation.is_none() && ask > npages {
            ask = npages;
            reservation = self.source.reserve(ask * PAGE_SIZE);
        }
        let Some(base) = reservation else {
            tracing::warn!(npages, ask, "page source refused reservation");
            return false;
        };
        if (base.as_ptr() as usize >> PAGE_SHIFT) + ask > MAX_PAGE {
            // SAFETY: exactly what `reserve` just returned.
            unsafe { self.source.unreserve(base, ask * PAGE_SIZE) };
            tracing::warn!(ptr = ?base, "reservation outside the addressable range");
            return false;
        }

        let chunk = h.chunks.len() as u32;
        h.chunks.push(Chunk { base, pages: ask });
        h.stats.reservations += 1;
        h.stats.reserved_pages += ask;
        h.next_reserve_pages = (h.next_reserve_pages * 2).min(self.config.max_reserve_pages.max(1));
        tracing::debug!(pages = ask, chunk, ptr = ?base, "reserved pages");

        let id = self.new_span_locked(h);
        self.spans.set_geometry(id, base, ask);
        // SAFETY: freshly minted record, not published anywhere yet.
        let s = unsafe { self.spans.get_mut(id) };
        s.init();
        s.state = SpanState::Free;
        s.chunk = chunk;
        s.unused_since = Some(Instant::now());
        self.insert_free_locked(h, id);
        true
    }

    fn maybe_scavenge_locked(&self, h: &mut HeapInner) {
        let now = Instant::now();
        if now.duration_since(h.last_scavenge) >= self.scavenge.interval {
            self.scavenge_locked(h, now, self.scavenge.idle_threshold);
        }
    }

    fn scavenge_locked(&self, h: &mut HeapInner, now: Instant, idle: Duration) -> usize {
        h.last_scavenge = now;
        h.stats.scavenges += 1;

        let mut candidates = Vec::new();
        for list in h.free.iter().chain(std::iter::once(&h.large)) {
            // SAFETY: heap lock held for the whole walk; nothing is unlinked.
            candidates.extend(unsafe { list.iter(&self.spans) });
        }

        let mut released = 0;
        for id in candidates {
            let pages = self.spans.pages(id);
            let base = self.base_of(id);
            // SAFETY: heap lock held; free spans belong to the heap.
            let s = unsafe { self.spans.get_mut(id) };
            let idle_long_enough = s
                .unused_since
                .is_some_and(|t| now.duration_since(t) >= idle);
            if s.released_pages >= pages || !idle_long_enough {
                continue;
            }
            // SAFETY: free span inside one reservation with no live objects.
            let zeroed = unsafe { self.source.release(base, pages * PAGE_SIZE) };
            if zeroed {
                s.needs_zero = false;
            }
            released += pages - s.released_pages;
            h.stats.released_pages += pages - s.released_pages;
            s.released_pages = pages;
        }

        if released > 0 {
            tracing::info!(
                released_pages = released,
                free_pages = h.stats.free_pages,
                "scavenger returned pages to the OS"
            );
        }
        released
    }

    fn base_of(&self, id: SpanId) -> NonNull<u8> {
        match NonNull::new(self.spans.base(id)) {
            Some(p) => p,
            None => throw!("span {} has no pages", id.index()),
        }
    }
}

impl Drop for PageHeap {
    fn drop(&mut self) {
        let h = self.inner.get_mut();
        for chunk in h.chunks.drain(..) {
            // SAFETY: every chunk came from `reserve` with exactly these sizes,
            // and dropping the heap ends all use of its pages.
            unsafe { self.source.unreserve(chunk.base, chunk.pages * PAGE_SIZE) };
        }
    }
}
