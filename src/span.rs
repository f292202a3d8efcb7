//! Span metadata, the span arena, and intrusive span lists.
//!
//! A span is a run of contiguous pages. Span records live in a [`SpanArena`]
//! and are addressed by [`SpanId`]; list links are ids, not pointers, so a
//! recycled record can never be reached through a dangling reference.
//!
//! At any moment a span belongs to exactly one container: a free bucket of
//! the page heap, one of the two lists of a central free list, or the caller
//! that holds a large object. Only the holder of that container's lock may
//! touch the span's [`Span`] record. The page geometry (base address and
//! length) is mirrored in atomics so lock-free readers such as the collector
//! can resolve interior pointers.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use fixedbitset::FixedBitSet;

use crate::PAGE_SHIFT;

/// Handle to a span record in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u32);

impl SpanId {
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    /// Record is on the arena's recycle list.
    Dead,
    /// Pages are in the page heap's free index.
    Free,
    /// Pages back objects of one size class, or one large object.
    InUse,
}

/// Which list currently threads the span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    HeapFree,
    CentralNonempty,
    CentralEmpty,
}

/// Mutable span metadata.
#[derive(Debug)]
pub struct Span {
    pub state: SpanState,
    /// Size class of the objects carved from this span; 0 for a large object.
    pub size_class: usize,
    /// Objects handed out and not yet returned.
    pub refcount: u32,
    /// Stack of free object indices; the last entry is handed out next.
    pub free_objects: Vec<u32>,
    /// Bit set for every object index currently on `free_objects`.
    pub free_map: FixedBitSet,
    /// Pages previously held objects and may contain stale data.
    pub needs_zero: bool,
    /// Index of the OS reservation the pages came from.
    pub chunk: u32,
    /// When the span last entered the free index.
    pub unused_since: Option<Instant>,
    /// Pages of this free span already returned to the OS.
    pub released_pages: usize,
    pub(crate) list: Option<ListKind>,
    prev: Option<SpanId>,
    next: Option<SpanId>,
}

impl Span {
    fn empty() -> Self {
        Self {
            state: SpanState::Dead,
            size_class: 0,
            refcount: 0,
            free_objects: Vec::new(),
            free_map: FixedBitSet::new(),
            needs_zero: false,
            chunk: 0,
            unused_since: None,
            released_pages: 0,
            list: None,
            prev: None,
            next: None,
        }
    }

    /// Reset all bookkeeping. Keeps the free-list allocations for reuse.
    pub fn init(&mut self) {
        self.state = SpanState::Dead;
        self.size_class = 0;
        self.refcount = 0;
        self.free_objects.clear();
        self.free_map.clear();
        self.needs_zero = false;
        self.chunk = 0;
        self.unused_since = None;
        self.released_pages = 0;
        self.list = None;
        self.prev = None;
        self.next = None;
    }

    pub fn has_free_objects(&self) -> bool {
        !self.free_objects.is_empty()
    }
}

/// One arena slot: atomic geometry plus the lock-protected record.
struct SpanSlot {
    base: AtomicPtr<u8>,
    pages: AtomicUsize,
    /// Copy of `Span::needs_zero` taken when the span was handed out.
    dirty: AtomicBool,
    meta: UnsafeCell<Span>,
}

impl SpanSlot {
    fn new() -> Self {
        Self {
            base: AtomicPtr::new(ptr::null_mut()),
            pages: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            meta: UnsafeCell::new(Span::empty()),
        }
    }
}

const CHUNK_SHIFT: usize = 10;
const CHUNK_LEN: usize = 1 << CHUNK_SHIFT;
const MAX_CHUNKS: usize = 4096;

/// Stable storage for span records.
///
/// Slots are created in chunks and never move, so a [`SpanId`] stays valid for
/// the arena's lifetime. New ids are only minted by the page heap while it
/// holds its lock.
pub struct SpanArena {
    chunks: Box<[OnceLock<Box<[SpanSlot]>>]>,
    len: AtomicUsize,
}

// SAFETY: `meta` is only accessed through `get_mut`, whose contract requires
// the caller to hold the lock of the span's owning container. Everything else
// in a slot is atomic.
unsafe impl Sync for SpanArena {}
unsafe impl Send for SpanArena {}

impl SpanArena {
    pub fn new() -> Self {
        Self {
            chunks: (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect(),
            len: AtomicUsize::new(0),
        }
    }

    /// Number of ids ever minted.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mint a fresh id. Returns `None` when the arena is exhausted.
    ///
    /// Must be called with the page heap lock held.
    pub(crate) fn push(&self) -> Option<SpanId> {
        let idx = self.len.load(Ordering::Relaxed);
        if idx >= MAX_CHUNKS * CHUNK_LEN {
            return None;
        }
        self.chunks[idx >> CHUNK_SHIFT]
            .get_or_init(|| (0..CHUNK_LEN).map(|_| SpanSlot::new()).collect());
        self.len.store(idx + 1, Ordering::Release);
        Some(SpanId(idx as u32))
    }

    fn slot(&self, id: SpanId) -> &SpanSlot {
        let idx = id.index();
        match self.chunks[idx >> CHUNK_SHIFT].get() {
            Some(chunk) if idx < self.len() => &chunk[idx & (CHUNK_LEN - 1)],
            _ => crate::error::throw!("span id {} was never allocated", idx),
        }
    }

    /// Access a span record mutably.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock of the container that currently owns the
    /// span (or own the span outright, e.g. a freshly allocated span not yet
    /// published), and must not hold another reference to the same record.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn get_mut(&self, id: SpanId) -> &mut Span {
        unsafe { &mut *self.slot(id).meta.get() }
    }

    /// Base address of the span's first page.
    #[inline]
    pub fn base(&self, id: SpanId) -> *mut u8 {
        self.slot(id).base.load(Ordering::Acquire)
    }

    #[inline]
    pub fn pages(&self, id: SpanId) -> usize {
        self.slot(id).pages.load(Ordering::Acquire)
    }

    /// First page number covered by the span.
    #[inline]
    pub fn start_page(&self, id: SpanId) -> usize {
        self.base(id) as usize >> PAGE_SHIFT
    }

    /// Whether the span's pages held data before it was last handed out.
    #[inline]
    pub fn needs_zero(&self, id: SpanId) -> bool {
        self.slot(id).dirty.load(Ordering::Acquire)
    }

    pub(crate) fn publish_needs_zero(&self, id: SpanId, needs_zero: bool) {
        self.slot(id).dirty.store(needs_zero, Ordering::Release);
    }

    /// Update the span's geometry. Page heap lock must be held.
    pub(crate) fn set_geometry(&self, id: SpanId, base: NonNull<u8>, pages: usize) {
        let slot = self.slot(id);
        slot.pages.store(pages, Ordering::Release);
        slot.base.store(base.as_ptr(), Ordering::Release);
    }
}

impl Default for SpanArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Intrusive doubly-linked list of spans threaded through the arena.
///
/// The list performs no locking; every method that touches links requires
/// the caller to hold the lock of the container the list belongs to.
#[derive(Debug)]
pub struct SpanList {
    head: Option<SpanId>,
    tail: Option<SpanId>,
    len: usize,
    kind: Option<ListKind>,
}

impl SpanList {
    pub const fn new(kind: ListKind) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            kind: Some(kind),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Option<SpanId> {
        self.head
    }

    /// Insert at the front.
    ///
    /// # Safety
    ///
    /// Caller holds the owning container's lock and owns `id`, which must not
    /// be on any list.
    pub unsafe fn insert(&mut self, arena: &SpanArena, id: SpanId) {
        let old_head = self.head;
        {
            let s = unsafe { arena.get_mut(id) };
            if s.list.is_some() {
                crate::error::throw!("span {} inserted while on {:?}", id.index(), s.list);
            }
            s.list = self.kind;
            s.prev = None;
            s.next = old_head;
        }
        match old_head {
            Some(h) => unsafe { arena.get_mut(h) }.prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// Unlink `id`.
    ///
    /// # Safety
    ///
    /// Caller holds the owning container's lock and `id` is on this list.
    pub unsafe fn remove(&mut self, arena: &SpanArena, id: SpanId) {
        let (prev, next) = {
            let s = unsafe { arena.get_mut(id) };
            if s.list != self.kind {
                crate::error::throw!(
                    "span {} removed from {:?} but is on {:?}",
                    id.index(),
                    self.kind,
                    s.list
                );
            }
            let links = (s.prev, s.next);
            s.prev = None;
            s.next = None;
            s.list = None;
            links
        };
        match prev {
            Some(p) => unsafe { arena.get_mut(p) }.next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => unsafe { arena.get_mut(n) }.prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Iterate over the ids on this list, front to back.
    ///
    /// # Safety
    ///
    /// Caller holds the owning container's lock for the whole iteration and
    /// does not unlink the span it has just been handed.
    pub unsafe fn iter<'a>(&'a self, arena: &'a SpanArena) -> SpanIter<'a> {
        SpanIter {
            arena,
            next: self.head,
        }
    }
}

pub struct SpanIter<'a> {
    arena: &'a SpanArena,
    next: Option<SpanId>,
}

impl Iterator for SpanIter<'_> {
    type Item = SpanId;

    fn next(&mut self) -> Option<SpanId> {
        let id = self.next?;
        // SAFETY: upheld by the contract of `SpanList::iter`.
        self.next = unsafe { self.arena.get_mut(id) }.next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with(n: usize) -> (SpanArena, Vec<SpanId>) {
        let arena = SpanArena::new();
        let ids = (0..n).map(|_| arena.push().unwrap()).collect();
        (arena, ids)
    }

    #[test]
    fn test_insert_remove() {
        let (arena, ids) = arena_with(3);
        let mut list = SpanList::new(ListKind::CentralNonempty);
        assert!(list.is_empty());
        unsafe {
            for &id in &ids {
                list.insert(&arena, id);
            }
            assert_eq!(list.len(), 3);
            assert_eq!(list.first(), Some(ids[2]));
            let order: Vec<_> = list.iter(&arena).collect();
            assert_eq!(order, vec![ids[2], ids[1], ids[0]]);

            list.remove(&arena, ids[1]);
            let order: Vec<_> = list.iter(&arena).collect();
            assert_eq!(order, vec![ids[2], ids[0]]);
            assert_eq!(arena.get_mut(ids[1]).list, None);

            list.remove(&arena, ids[2]);
            list.remove(&arena, ids[0]);
        }
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_move_between_lists() {
        let (arena, ids) = arena_with(2);
        let mut nonempty = SpanList::new(ListKind::CentralNonempty);
        let mut empty = SpanList::new(ListKind::CentralEmpty);
        unsafe {
            nonempty.insert(&arena, ids[0]);
            nonempty.insert(&arena, ids[1]);
            nonempty.remove(&arena, ids[0]);
            empty.insert(&arena, ids[0]);
            assert_eq!(arena.get_mut(ids[0]).list, Some(ListKind::CentralEmpty));
            assert_eq!(nonempty.iter(&arena).collect::<Vec<_>>(), vec![ids[1]]);
            assert_eq!(empty.iter(&arena).collect::<Vec<_>>(), vec![ids[0]]);
        }
    }

    #[test]
    #[should_panic(expected = "inserted while on")]
    fn test_double_insert_is_fatal() {
        let (arena, ids) = arena_with(1);
        let mut a = SpanList::new(ListKind::CentralNonempty);
        let mut b = SpanList::new(ListKind::CentralEmpty);
        unsafe {
            a.insert(&arena, ids[0]);
            b.insert(&arena, ids[0]);
        }
    }

    #[test]
    fn test_init_clears_state() {
        let (arena, ids) = arena_with(1);
        let s = unsafe { arena.get_mut(ids[0]) };
        s.state = SpanState::InUse;
        s.refcount = 3;
        s.free_objects.extend([1, 2]);
        s.free_map.grow(8);
        s.free_map.insert(1);
        s.init();
        assert_eq!(s.state, SpanState::Dead);
        assert_eq!(s.refcount, 0);
        assert!(!s.has_free_objects());
        assert_eq!(s.free_map.count_ones(..), 0);
    }

    #[test]
    fn test_geometry() {
        let (arena, ids) = arena_with(1);
        let base = NonNull::new((5usize << PAGE_SHIFT) as *mut u8).unwrap();
        arena.set_geometry(ids[0], base, 3);
        assert_eq!(arena.start_page(ids[0]), 5);
        assert_eq!(arena.pages(ids[0]), 3);
    }
}
