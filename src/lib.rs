//! spanalloc: a segregated size-class allocator core for a managed runtime.
//!
//! Three tiers, in the tcmalloc tradition:
//! - Per-context caches (fast path, no locks)
//! - Central free lists (one lock per size class)
//! - Page heap (span management, OS interface, one lock)
//!
//! Nothing is global. Build an [`Allocator`] at startup, share it by
//! reference, and give each execution context its own [`ThreadCache`].
//!
//! # Usage
//!
//! ```
//! use spanalloc::{Allocator, Config};
//!
//! let alloc = Allocator::new(Config::default());
//! let mut cache = alloc.cache();
//! let p = cache.alloc(48).unwrap();
//! assert_eq!(alloc.lookup(p.as_ptr()).object_size, 48);
//! cache.free(p);
//! ```

pub mod size_class;
pub mod platform;
pub mod span;
pub mod pagemap;
pub mod page_heap;
pub mod central_free_list;
pub mod thread_cache;
pub mod allocator;
pub mod config;
pub mod error;
pub mod stats;

/// Page size used by the allocator (4 KiB).
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub use allocator::{Allocator, NoopWorld, SpanInfo, WorldStopper};
pub use config::Config;
pub use error::{AllocError, ConfigError};
pub use size_class::SizeClassTable;
pub use thread_cache::ThreadCache;
