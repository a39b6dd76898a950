//! Tunables for call-site promotion, deoptimization and cache size.

use serde::{Deserialize, Serialize};

const DEFAULT_OPTIMIZE_THRESHOLD: u64 = 1_000;
const DEFAULT_FALLBACK_THRESHOLD: u64 = 1_000;
const DEFAULT_FALLBACK_CUTOFF: u64 = 100;
const DEFAULT_CACHE_CAPACITY: usize = 4;

pub const ENV_OPTIMIZE_THRESHOLD: &str = "SOLI_INDY_OPTIMIZE_THRESHOLD";
pub const ENV_FALLBACK_THRESHOLD: &str = "SOLI_INDY_FALLBACK_THRESHOLD";
pub const ENV_FALLBACK_CUTOFF: &str = "SOLI_INDY_FALLBACK_CUTOFF";
pub const ENV_CACHE_CAPACITY: &str = "SOLI_INDY_CACHE_CAPACITY";

/// Dispatch tunables.
///
/// All thresholds are compared with `>`: a call site is promoted on the
/// `optimize_threshold + 1`-th hit of the same cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Cache hits before a single entry becomes the call site's direct target.
    pub optimize_threshold: u64,
    /// Guard failures on a direct target before the site is reset to the cache path.
    pub fallback_threshold: u64,
    /// Total guard failures after which a site is never promoted again.
    pub fallback_cutoff: u64,
    /// Entries per call site cache.
    pub cache_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            optimize_threshold: DEFAULT_OPTIMIZE_THRESHOLD,
            fallback_threshold: DEFAULT_FALLBACK_THRESHOLD,
            fallback_cutoff: DEFAULT_FALLBACK_CUTOFF,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl DispatchConfig {
    /// Read tunables from `SOLI_INDY_*` environment variables.
    ///
    /// Missing, unparsable or zero values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(default)
        };

        Self {
            optimize_threshold: read(ENV_OPTIMIZE_THRESHOLD, defaults.optimize_threshold),
            fallback_threshold: read(ENV_FALLBACK_THRESHOLD, defaults.fallback_threshold),
            fallback_cutoff: read(ENV_FALLBACK_CUTOFF, defaults.fallback_cutoff),
            cache_capacity: read(ENV_CACHE_CAPACITY, defaults.cache_capacity as u64) as usize,
        }
    }

    /// Parse a JSON config fragment; omitted keys keep their defaults.
    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(source)?;
        config.cache_capacity = config.cache_capacity.max(1);
        Ok(config)
    }

    pub fn with_optimize_threshold(mut self, threshold: u64) -> Self {
        self.optimize_threshold = threshold;
        self
    }

    pub fn with_fallback_threshold(mut self, threshold: u64) -> Self {
        self.fallback_threshold = threshold;
        self
    }

    pub fn with_fallback_cutoff(mut self, cutoff: u64) -> Self {
        self.fallback_cutoff = cutoff;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }
}
