//! Size class table and lookup functions.
//!
//! Objects are bucketed into size classes to reduce fragmentation and enable
//! free list management. The default table covers sizes from 8 bytes up to
//! 32 KiB and is generated once at startup; embedders can also supply their
//! own list of sizes. Either way the table is immutable after construction
//! and shared by reference.

use crate::error::ConfigError;
use crate::PAGE_SIZE;

/// Information about a single size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes). All allocations in this class
    /// are rounded up to this size.
    pub size: usize,
    /// Number of pages per span for this class.
    pub pages: usize,
    /// Number of objects to transfer between a cache and the central list at once.
    pub batch_size: usize,
}

impl SizeClassInfo {
    pub const fn objects_per_span(&self) -> usize {
        (self.pages * PAGE_SIZE) / self.size
    }
}

/// Maximum allocation size that goes through size classes.
/// Anything larger is a "large" allocation handled directly by the page heap.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

/// Class ids are stored in a byte inside page tags; id 0 means "large".
pub const MAX_CLASSES: usize = 255;

/// Sizes up to this bound are looked up with 8-byte granularity, larger ones
/// with 128-byte granularity.
const SMALL_LOOKUP_MAX: usize = 1024;

#[derive(Debug, Clone)]
pub struct SizeClassTable {
    /// Index 0 is a sentinel (unused).
    classes: Vec<SizeClassInfo>,
    /// Index = (size + 7) / 8, for sizes <= 1024.
    small_lookup: Vec<u8>,
    /// Index = (size - 1024 + 127) / 128, for sizes > 1024.
    large_lookup: Vec<u8>,
}

impl Default for SizeClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SizeClassTable {
    /// Generate the default table.
    ///
    /// Sizes step by the current alignment, which widens at powers of two.
    /// When a size would use the same span length and fit the same number of
    /// objects as the previous class, it replaces that class instead.
    pub fn new() -> Self {
        let mut classes = vec![SENTINEL];
        let mut align = 8;
        let mut size = align;
        while size <= MAX_SMALL_SIZE {
            if size & (size - 1) == 0 {
                if size >= 2048 {
                    align = 256;
                } else if size >= 128 {
                    align = size / 8;
                } else if size >= 16 {
                    align = 16;
                }
            }
            let info = make_class(size);
            match classes.last_mut() {
                Some(prev)
                    if prev.size != 0
                        && prev.pages == info.pages
                        && prev.objects_per_span() == info.objects_per_span() =>
                {
                    *prev = info;
                }
                _ => classes.push(info),
            }
            size += align;
        }
        Self::from_classes(classes)
    }

    /// Build a table from an explicit list of object sizes.
    pub fn from_sizes(sizes: &[usize]) -> Result<Self, ConfigError> {
        if sizes.is_empty() {
            return Err(ConfigError::EmptySizeList);
        }
        if sizes.len() > MAX_CLASSES {
            return Err(ConfigError::TooManyClasses {
                count: sizes.len(),
                max: MAX_CLASSES,
            });
        }
        let mut prev = 0;
        for &size in sizes {
            if size <= prev {
                return Err(ConfigError::NotIncreasing { prev, next: size });
            }
            if size > MAX_SMALL_SIZE {
                return Err(ConfigError::TooLarge {
                    size,
                    max: MAX_SMALL_SIZE,
                });
            }
            let align = if size <= SMALL_LOOKUP_MAX { 8 } else { 128 };
            if size % align != 0 {
                return Err(ConfigError::MisalignedSize { size, align });
            }
            prev = size;
        }
        let classes = std::iter::once(SENTINEL)
            .chain(sizes.iter().map(|&s| make_class(s)))
            .collect();
        Ok(Self::from_classes(classes))
    }

    fn from_classes(classes: Vec<SizeClassInfo>) -> Self {
        debug_assert!(classes.len() > 1 && classes.len() <= MAX_CLASSES + 1);
        let max = classes[classes.len() - 1].size;

        let smallest_fit = |size: usize| -> u8 {
            let cls = classes[1..]
                .iter()
                .position(|c| c.size >= size)
                .map_or(classes.len() - 1, |i| i + 1);
            cls as u8
        };

        let small_len = max.min(SMALL_LOOKUP_MAX) / 8 + 1;
        let small_lookup = (0..small_len).map(|i| smallest_fit(i * 8)).collect();

        let large_lookup = if max > SMALL_LOOKUP_MAX {
            let len = (max - SMALL_LOOKUP_MAX + 127) / 128 + 1;
            (0..len)
                .map(|i| smallest_fit(SMALL_LOOKUP_MAX + i * 128))
                .collect()
        } else {
            Vec::new()
        };

        Self {
            classes,
            small_lookup,
            large_lookup,
        }
    }

    /// Map an allocation size to its size class index.
    ///
    /// Size 0 maps to the smallest class. Sizes above the largest class
    /// return 0, which marks a large allocation.
    #[inline]
    pub fn class_for(&self, size: usize) -> usize {
        if size > self.max_size() {
            return 0;
        }
        if size <= SMALL_LOOKUP_MAX {
            return self.small_lookup[(size + 7) >> 3] as usize;
        }
        self.large_lookup[(size - SMALL_LOOKUP_MAX + 127) >> 7] as usize
    }

    /// Get the size class info for a given class index.
    #[inline]
    pub fn info(&self, cls: usize) -> &SizeClassInfo {
        &self.classes[cls]
    }

    /// Get the allocation size for a given size class.
    #[inline]
    pub fn class_to_size(&self, cls: usize) -> usize {
        self.classes[cls].size
    }

    /// Number of entries including the sentinel at index 0.
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Largest size served by a size class.
    pub fn max_size(&self) -> usize {
        self.classes[self.classes.len() - 1].size
    }
}

const SENTINEL: SizeClassInfo = SizeClassInfo {
    size: 0,
    pages: 0,
    batch_size: 0,
};

/// Choose a span length whose unusable tail is at most 1/8 of the span.
fn make_class(size: usize) -> SizeClassInfo {
    let mut span_bytes = PAGE_SIZE;
    while span_bytes % size > span_bytes / 8 {
        span_bytes += PAGE_SIZE;
    }
    SizeClassInfo {
        size,
        pages: span_bytes / PAGE_SIZE,
        batch_size: ((64 * 1024) / size).clamp(2, 32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_to_class_zero() {
        let t = SizeClassTable::new();
        let cls = t.class_for(0);
        assert_eq!(cls, 1);
        assert_eq!(t.class_to_size(cls), 8);
    }

    #[test]
    fn test_size_to_class_exact() {
        let t = SizeClassTable::new();
        for size in [8, 16, 32, 48, 64, 128, 256, 1024, 2048, 4096, 8192, 32768] {
            assert_eq!(t.class_to_size(t.class_for(size)), size, "size {size}");
        }
    }

    #[test]
    fn test_size_to_class_rounds_up() {
        let t = SizeClassTable::new();
        assert_eq!(t.class_to_size(t.class_for(1)), 8);
        assert_eq!(t.class_to_size(t.class_for(7)), 8);
        assert_eq!(t.class_to_size(t.class_for(9)), 16);
        assert_eq!(t.class_to_size(t.class_for(17)), 32);
        assert_eq!(t.class_to_size(t.class_for(65)), 80);
        assert!(t.class_to_size(t.class_for(1025)) >= 1025);
    }

    #[test]
    fn test_size_to_class_large() {
        let t = SizeClassTable::new();
        assert_eq!(t.max_size(), MAX_SMALL_SIZE);
        assert_eq!(t.class_for(MAX_SMALL_SIZE + 1), 0);
        assert_eq!(t.class_for(1_000_000), 0);
    }

    #[test]
    fn test_every_size_gets_smallest_fitting_class() {
        let t = SizeClassTable::new();
        for size in 1..=MAX_SMALL_SIZE {
            let cls = t.class_for(size);
            assert!(t.class_to_size(cls) >= size, "size {size} class {cls}");
            if cls > 1 {
                assert!(t.class_to_size(cls - 1) < size, "size {size} class {cls}");
            }
        }
    }

    #[test]
    fn test_round_trip_all_classes() {
        let t = SizeClassTable::new();
        for cls in 1..t.num_classes() {
            assert_eq!(t.class_for(t.class_to_size(cls)), cls);
        }
    }

    #[test]
    fn test_classes_monotonically_increasing() {
        let t = SizeClassTable::new();
        for i in 2..t.num_classes() {
            assert!(t.info(i).size > t.info(i - 1).size);
        }
    }

    #[test]
    fn test_fragmentation_bound() {
        let t = SizeClassTable::new();
        for cls in 1..t.num_classes() {
            let info = t.info(cls);
            let span = info.pages * PAGE_SIZE;
            let objs = info.objects_per_span();
            assert!(objs >= 1, "class {cls} has 0 objects per span");
            assert!(span - objs * info.size <= span / 8, "class {cls} wastes too much");
            assert!((2..=32).contains(&info.batch_size));
        }
    }

    #[test]
    fn test_custom_sizes() {
        let t = SizeClassTable::from_sizes(&[16, 32, 64]).unwrap();
        assert_eq!(t.num_classes(), 4);
        assert_eq!(t.class_for(1), 1);
        assert_eq!(t.class_for(17), 2);
        assert_eq!(t.class_for(64), 3);
        assert_eq!(t.class_for(65), 0);
        assert_eq!(t.info(1).pages, 1);
        assert_eq!(t.info(1).objects_per_span(), 256);
    }

    #[test]
    fn test_custom_sizes_rejected() {
        assert!(matches!(
            SizeClassTable::from_sizes(&[]),
            Err(ConfigError::EmptySizeList)
        ));
        assert!(matches!(
            SizeClassTable::from_sizes(&[16, 12]),
            Err(ConfigError::NotIncreasing { prev: 16, next: 12 })
        ));
        assert!(matches!(
            SizeClassTable::from_sizes(&[20]),
            Err(ConfigError::MisalignedSize { size: 20, align: 8 })
        ));
        assert!(matches!(
            SizeClassTable::from_sizes(&[1100]),
            Err(ConfigError::MisalignedSize { size: 1100, align: 128 })
        ));
        assert!(SizeClassTable::from_sizes(&[MAX_SMALL_SIZE * 2]).is_err());
    }
}
