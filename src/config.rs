//! Allocator configuration.
//!
//! Every value has a default, so `Config::default()` is a working setup.
//! Configuration can also be read from TOML or from `SPANALLOC_*` environment
//! variables. Invalid environment values fall back to the default with a
//! warning instead of failing startup.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `SPANALLOC_INITIAL_RESERVE_PAGES` | 256 | First OS reservation (pages) |
//! | `SPANALLOC_MAX_RESERVE_PAGES` | 16384 | Cap for the doubling reservation batch |
//! | `SPANALLOC_MAX_HEAP_BYTES` | 0 | Total reservation limit, 0 = unlimited |
//! | `SPANALLOC_CACHE_MAX_LIST_LEN` | 256 | Cached objects per class before a flush |
//! | `SPANALLOC_CACHE_MAX_BYTES` | 2097152 | Cached bytes per context before a full flush |
//! | `SPANALLOC_SCAVENGE_INTERVAL_MS` | 150000 | Minimum time between scavenger passes |
//! | `SPANALLOC_SCAVENGE_IDLE_MS` | 300000 | Idle time before free pages go back to the OS |
//! | `SPANALLOC_GROWTH_SPAN_MULTIPLIER` | 1 | Central growth size, in class span lengths |

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Page heap reservation policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Pages requested from the OS on the first growth.
    pub initial_reserve_pages: usize,
    /// Upper bound for the exponentially growing reservation batch.
    pub max_reserve_pages: usize,
    /// Total bytes the heap may reserve. 0 means no limit.
    pub max_heap_bytes: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_reserve_pages: 256,
            max_reserve_pages: 16 * 1024,
            max_heap_bytes: 0,
        }
    }
}

/// Per-context cache limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_list_len: usize,
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_list_len: 256,
            max_bytes: 2 * 1024 * 1024,
        }
    }
}

/// When idle free pages are handed back to the OS.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScavengeConfig {
    #[serde(with = "millis")]
    pub interval: Duration,
    #[serde(with = "millis")]
    pub idle_threshold: Duration,
}

impl Default for ScavengeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(150_000),
            idle_threshold: Duration::from_millis(300_000),
        }
    }
}

/// How many pages a central free list asks the heap for when it runs dry.
///
/// The request is `span_multiplier` times the class's natural span length.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrowthPolicy {
    pub span_multiplier: usize,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self { span_multiplier: 1 }
    }
}

impl GrowthPolicy {
    pub fn pages_for(&self, class_pages: usize) -> usize {
        class_pages * self.span_multiplier.max(1)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub heap: HeapConfig,
    pub cache: CacheConfig,
    pub scavenge: ScavengeConfig,
    pub growth: GrowthPolicy,
}

impl Config {
    /// Parse a TOML document. Missing tables and keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Build a configuration from `SPANALLOC_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            heap: HeapConfig {
                initial_reserve_pages: env_usize(
                    "SPANALLOC_INITIAL_RESERVE_PAGES",
                    d.heap.initial_reserve_pages,
                ),
                max_reserve_pages: env_usize("SPANALLOC_MAX_RESERVE_PAGES", d.heap.max_reserve_pages),
                max_heap_bytes: env_usize("SPANALLOC_MAX_HEAP_BYTES", d.heap.max_heap_bytes),
            },
            cache: CacheConfig {
                max_list_len: env_usize("SPANALLOC_CACHE_MAX_LIST_LEN", d.cache.max_list_len),
                max_bytes: env_usize("SPANALLOC_CACHE_MAX_BYTES", d.cache.max_bytes),
            },
            scavenge: ScavengeConfig {
                interval: env_millis("SPANALLOC_SCAVENGE_INTERVAL_MS", d.scavenge.interval),
                idle_threshold: env_millis("SPANALLOC_SCAVENGE_IDLE_MS", d.scavenge.idle_threshold),
            },
            growth: GrowthPolicy {
                span_multiplier: env_usize(
                    "SPANALLOC_GROWTH_SPAN_MULTIPLIER",
                    d.growth.span_multiplier,
                ),
            },
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(raw) => parse_or_default(key, &raw, default),
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    let ms = env_usize(key, default.as_millis() as usize);
    Duration::from_millis(ms as u64)
}

fn parse_or_default(key: &str, raw: &str, default: usize) -> usize {
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value = raw, default, "ignoring invalid configuration value");
            default
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.heap.initial_reserve_pages, 256);
        assert_eq!(cfg.heap.max_heap_bytes, 0);
        assert_eq!(cfg.cache.max_list_len, 256);
        assert_eq!(cfg.growth.pages_for(3), 3);
    }

    #[test]
    fn test_partial_toml() {
        let cfg = Config::from_toml_str(
            r#"
            [heap]
            max_heap_bytes = 1048576

            [scavenge]
            idle_threshold = 10

            [growth]
            span_multiplier = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.heap.max_heap_bytes, 1 << 20);
        assert_eq!(cfg.heap.initial_reserve_pages, 256);
        assert_eq!(cfg.scavenge.idle_threshold, Duration::from_millis(10));
        assert_eq!(cfg.scavenge.interval, Duration::from_millis(150_000));
        assert_eq!(cfg.growth.pages_for(2), 8);
    }

    #[test]
    fn test_bad_toml() {
        assert!(Config::from_toml_str("[heap]\nmax_heap_bytes = \"lots\"").is_err());
    }

    #[test]
    fn test_invalid_value_falls_back() {
        assert_eq!(parse_or_default("X", "abc", 7), 7);
        assert_eq!(parse_or_default("X", " 12 ", 7), 12);
    }

    #[test]
    fn test_zero_multiplier_is_clamped() {
        let policy = GrowthPolicy { span_multiplier: 0 };
        assert_eq!(policy.pages_for(5), 5);
    }
}
