//! Error types.
//!
//! Two classes of failure exist. Running out of pages is recoverable and
//! surfaces as [`AllocError`]. Corrupted allocator state (a free of a pointer
//! the heap never handed out, a double free, counters that disagree with the
//! lists they summarize) is not: it goes through [`invariant_violation`] and
//! never returns.

use thiserror::Error;

/// Recoverable allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The page source refused to reserve more memory. Callers should run a
    /// collection and retry before treating this as fatal.
    #[error("out of memory: could not satisfy a request for {requested} bytes")]
    OutOfMemory { requested: usize },
}

/// Errors produced while building a size class table or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("size class list is empty")]
    EmptySizeList,
    #[error("size class {size} is not a multiple of {align}")]
    MisalignedSize { size: usize, align: usize },
    #[error("size classes must be strictly increasing ({prev} then {next})")]
    NotIncreasing { prev: usize, next: usize },
    #[error("size class {size} exceeds the small object limit of {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("too many size classes: {count} (limit {max})")]
    TooManyClasses { count: usize, max: usize },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Report a broken allocator invariant and terminate.
///
/// Continuing after one of these risks handing the same memory out twice, so
/// there is no recovery path. Release builds are compiled with
/// `panic = "abort"`.
#[cold]
#[inline(never)]
#[track_caller]
pub fn invariant_violation(msg: std::fmt::Arguments<'_>) -> ! {
    tracing::error!(target: "spanalloc", "fatal allocator invariant violation: {msg}");
    panic!("spanalloc: {msg}");
}

/// `throw!("invalid free of {:p}", ptr)` formats and calls [`invariant_violation`].
macro_rules! throw {
    ($($arg:tt)*) => {
        $crate::error::invariant_violation(format_args!($($arg)*))
    };
}

pub(crate) use throw;
