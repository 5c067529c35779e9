//! Cache types

use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for a cached derivative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub fingerprint: Fingerprint,
    /// Blob location relative to the blob root
    pub location: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_read_at: DateTime<Utc>,
    /// In-flight readers; never persisted
    #[serde(skip)]
    pub read_refcount: u32,
}

impl IndexEntry {
    pub fn new(fingerprint: Fingerprint, location: PathBuf, size: u64) -> Self {
        let now = Utc::now();
        Self {
            fingerprint,
            location,
            size,
            created_at: now,
            last_read_at: now,
            read_refcount: 0,
        }
    }
}

/// How a `get_or_compute` call was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from disk
    Hit,
    /// This caller's producer invocation computed the bytes
    Miss,
    /// Joined another caller's in-flight producer invocation
    Coalesced,
    /// Caching is turned off
    Disabled,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Coalesced => "COALESCED",
            CacheStatus::Disabled => "DISABLED",
        }
    }
}

/// Bytes returned by the cache facade
#[derive(Debug, Clone)]
pub struct Derivative {
    pub bytes: Bytes,
    pub status: CacheStatus,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub pending_writes: usize,
    pub pending_bytes: u64,
    pub evictions: u64,
    pub write_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.pending_writes, 0);
    }

    #[test]
    fn test_index_entry_serialization_skips_refcount() {
        let mut entry = IndexEntry::new(
            Fingerprint::from_parts(["cat.png", "width=100"]),
            PathBuf::from("ab/abc123.1"),
            12345,
        );
        entry.read_refcount = 3;

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("12345"));
        assert!(!json.contains("read_refcount"));

        let deserialized: IndexEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.size, entry.size);
        assert_eq!(deserialized.location, entry.location);
        assert_eq!(deserialized.read_refcount, 0);
    }

    #[test]
    fn test_cache_status_header_values() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::Miss.as_str(), "MISS");
    }
}
