//! Page map: page number to owning span, with size class tags.
//!
//! A three-level radix tree over 48-bit addresses. Interior levels are
//! created on first write and never freed until the map is dropped, so
//! readers walk the tree without locks. Writes happen under the page heap
//! lock, except `clear_range`, which a central free list uses to unpublish
//! a span it still owns.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::span::SpanId;
use crate::PAGE_SHIFT;

/// Addresses handed out by the page heap must fit in this many bits.
pub const ADDRESS_BITS: usize = 48;
const PAGE_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;
const LEAF_BITS: usize = PAGE_BITS / 3;
const MID_BITS: usize = PAGE_BITS / 3;
const ROOT_BITS: usize = PAGE_BITS - LEAF_BITS - MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;

/// One past the highest page number the map can hold.
pub const MAX_PAGE: usize = 1 << PAGE_BITS;

const SPAN_MASK: u64 = 0xffff_ffff;
const CLASS_SHIFT: u32 = 32;
const IN_USE_BIT: u64 = 1 << 40;

/// Decoded page map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    pub span: SpanId,
    /// Size class tag for the collector; 0 for large objects and free spans.
    pub size_class: usize,
    /// False for the boundary pages of a free span, which are tagged only so
    /// neighbours can find them when coalescing.
    pub in_use: bool,
}

impl PageEntry {
    pub const fn in_use(span: SpanId, size_class: usize) -> Self {
        Self {
            span,
            size_class,
            in_use: true,
        }
    }

    pub const fn free(span: SpanId) -> Self {
        Self {
            span,
            size_class: 0,
            in_use: false,
        }
    }

    fn encode(self) -> u64 {
        let mut v = (self.span.raw() as u64 + 1) | ((self.size_class as u64 & 0xff) << CLASS_SHIFT);
        if self.in_use {
            v |= IN_USE_BIT;
        }
        v
    }

    fn decode(v: u64) -> Option<Self> {
        let raw = v & SPAN_MASK;
        if raw == 0 {
            return None;
        }
        Some(Self {
            span: SpanId::from_raw((raw - 1) as u32),
            size_class: ((v >> CLASS_SHIFT) & 0xff) as usize,
            in_use: v & IN_USE_BIT != 0,
        })
    }
}

type Leaf = Box<[AtomicU64]>;
type Mid = Box<[OnceLock<Leaf>]>;

pub struct PageMap {
    root: Box<[OnceLock<Mid>]>,
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            root: (0..ROOT_LEN).map(|_| OnceLock::new()).collect(),
        }
    }

    #[inline]
    fn split(page: usize) -> (usize, usize, usize) {
        let leaf = page & (LEAF_LEN - 1);
        let mid = (page >> LEAF_BITS) & (MID_LEN - 1);
        let root = page >> (LEAF_BITS + MID_BITS);
        (root, mid, leaf)
    }

    fn leaf(&self, page: usize) -> Option<(&Leaf, usize)> {
        if page >= MAX_PAGE {
            return None;
        }
        let (r, m, l) = Self::split(page);
        let leaf = self.root[r].get()?.get(m)?.get()?;
        Some((leaf, l))
    }

    fn leaf_or_create(&self, page: usize) -> (&Leaf, usize) {
        if page >= MAX_PAGE {
            crate::error::throw!("page {:#x} is outside the addressable range", page);
        }
        let (r, m, l) = Self::split(page);
        let mid = self.root[r].get_or_init(|| (0..MID_LEN).map(|_| OnceLock::new()).collect());
        let leaf = mid[m].get_or_init(|| (0..LEAF_LEN).map(|_| AtomicU64::new(0)).collect());
        (leaf, l)
    }

    /// Look up the entry for a page. Lock-free.
    #[inline]
    pub fn get(&self, page: usize) -> Option<PageEntry> {
        let (leaf, idx) = self.leaf(page)?;
        PageEntry::decode(leaf[idx].load(Ordering::Acquire))
    }

    pub fn set(&self, page: usize, entry: PageEntry) {
        let (leaf, idx) = self.leaf_or_create(page);
        leaf[idx].store(entry.encode(), Ordering::Release);
    }

    /// Tag `count` pages starting at `start` with the same entry.
    pub fn set_range(&self, start: usize, count: usize, entry: PageEntry) {
        let v = entry.encode();
        for page in start..start + count {
            let (leaf, idx) = self.leaf_or_create(page);
            leaf[idx].store(v, Ordering::Release);
        }
    }

    /// Remove the tags of `count` pages starting at `start`.
    pub fn clear_range(&self, start: usize, count: usize) {
        for page in start..start + count {
            if let Some((leaf, idx)) = self.leaf(page) {
                leaf[idx].store(0, Ordering::Release);
            }
        }
    }
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}
