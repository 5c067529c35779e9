//! Hybrid disk-backed cache for computed image derivatives
//!
//! Derivative bytes are stored one file per entry on disk, while an
//! in-memory index (persisted alongside the files) tracks size, timestamps and
//! in-flight readers. Misses are computed once per fingerprint no matter how
//! many requests race for it, written asynchronously under a memory budget,
//! and evicted least-recently-read first once the cache outgrows its cap.

pub mod blob_store;
mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod sweeper;
mod types;
pub mod write_queue;

pub use cache::HybridCache;
pub use config::CacheConfig;
pub use error::{BlobError, CacheError, IndexError, ProducerError, Result};
pub use fingerprint::Fingerprint;
pub use index::{Index, ReadGuard, ReconcileReport};
pub use sweeper::{SweepReport, Sweeper};
pub use types::{CacheStats, CacheStatus, Derivative, IndexEntry};
pub use write_queue::{Enqueued, WriteQueue};
