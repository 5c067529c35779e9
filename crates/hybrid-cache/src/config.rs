//! Cache configuration

use crate::error::{CacheError, Result};
use std::path::PathBuf;
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Configuration for a [`HybridCache`](crate::HybridCache), fixed at construction
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root for blob files and the persisted index
    pub cache_directory: PathBuf,
    /// Entries younger than this are never evicted
    pub min_age_to_delete: Duration,
    /// Pending write bytes allowed in memory before writes go synchronous
    pub write_queue_memory_budget: u64,
    /// Soft ceiling on total cached bytes
    pub cache_size_cap: u64,
    /// When false, every request calls the producer directly
    pub caching_enabled: bool,
    /// Number of background write workers
    pub write_workers: usize,
    /// How often the eviction sweeper runs
    pub sweep_interval: Duration,
}

impl CacheConfig {
    pub fn new(cache_directory: impl Into<PathBuf>) -> Self {
        Self {
            cache_directory: cache_directory.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_directory.as_os_str().is_empty() {
            return Err(CacheError::Config(
                "cache_directory must not be empty".to_string(),
            ));
        }
        if self.write_workers == 0 {
            return Err(CacheError::Config(
                "write_workers must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(CacheError::Config(
                "sweep_interval must be positive".to_string(),
            ));
        }
        if self.cache_size_cap == 0 {
            return Err(CacheError::Config(
                "cache_size_cap must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: PathBuf::from("./cache/derivatives"),
            min_age_to_delete: Duration::from_secs(10),
            write_queue_memory_budget: 100 * MB,
            cache_size_cap: 1000 * MB,
            caching_enabled: true,
            write_workers: 4,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.min_age_to_delete, Duration::from_secs(10));
        assert_eq!(config.write_queue_memory_budget, 100 * 1024 * 1024);
        assert_eq!(config.cache_size_cap, 1000 * 1024 * 1024);
        assert!(config.caching_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CacheConfig::new("/tmp/cache");
        config.write_workers = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::new("");
        config.write_workers = 1;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::new("/tmp/cache");
        config.cache_size_cap = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cache_size_cap"));

        let mut config = CacheConfig::new("/tmp/cache");
        config.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
