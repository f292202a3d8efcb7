//! Point-in-time statistics snapshots.

/// Page heap counters. All values are in pages unless noted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Pages obtained from the OS and not given back.
    pub reserved_pages: usize,
    /// Pages sitting in the free index (including released ones).
    pub free_pages: usize,
    /// Free pages whose contents were handed back to the OS.
    pub released_pages: usize,
    /// Pages inside spans held by central lists or large objects.
    pub in_use_pages: usize,
    /// Spans currently handed out (small-object and large).
    pub in_use_spans: usize,
    /// In-use spans holding a single large object.
    pub large_spans: usize,
    /// Spans in the free index.
    pub free_spans: usize,
    /// Number of successful OS reservations.
    pub reservations: usize,
    /// Number of scavenger passes that ran.
    pub scavenges: usize,
}

/// Counters for one central free list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CentralStats {
    pub size_class: usize,
    /// Free objects across all spans of the class.
    pub free_objects: usize,
    pub nonempty_spans: usize,
    pub empty_spans: usize,
    /// Spans obtained from the heap over the list's lifetime.
    pub spans_grown: usize,
    /// Spans handed back to the heap over the list's lifetime.
    pub spans_returned: usize,
}

/// Counters for one per-context cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Bytes sitting in the cache's free lists.
    pub cached_bytes: usize,
    pub cached_objects: usize,
    /// Allocations served without touching a central list.
    pub hits: u64,
    /// Allocations that had to refill from a central list.
    pub misses: u64,
    /// Batches flushed back to central lists.
    pub flushes: u64,
}
