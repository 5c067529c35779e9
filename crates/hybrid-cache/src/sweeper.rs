//! Size-based eviction
//!
//! Evicts least-recently-read entries while the index is over the size cap.
//! Entries with active readers or younger than the minimum age are skipped;
//! if only such entries remain the cap is left exceeded until a later sweep.

use crate::blob_store::BlobStore;
use crate::error::BlobError;
use crate::index::{old_enough, Index};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay after a write notification before sweeping, so bursts of writes
/// share one sweep
const WRITE_DEBOUNCE: Duration = Duration::from_millis(250);

/// Result of a single sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub freed: u64,
    pub remaining: u64,
}

pub struct Sweeper {
    index: Arc<Index>,
    blobs: Arc<BlobStore>,
    index_path: PathBuf,
    cap: u64,
    min_age: Duration,
    evictions: AtomicU64,
    /// Serializes sweeps so concurrent runs cannot over-evict
    running: Mutex<()>,
}

impl Sweeper {
    pub fn new(
        index: Arc<Index>,
        blobs: Arc<BlobStore>,
        index_path: PathBuf,
        cap: u64,
        min_age: Duration,
    ) -> Self {
        Self {
            index,
            blobs,
            index_path,
            cap,
            min_age,
            evictions: AtomicU64::new(0),
            running: Mutex::new(()),
        }
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let _running = self.running.lock().await;
        let mut report = SweepReport {
            remaining: self.index.total_size(),
            ..SweepReport::default()
        };
        if report.remaining <= self.cap {
            return report;
        }

        let mut candidates: Vec<_> = self
            .index
            .snapshot()
            .into_iter()
            .filter(|entry| entry.read_refcount == 0 && old_enough(entry, now, self.min_age))
            .collect();
        candidates.sort_by_key(|entry| entry.last_read_at);

        for candidate in candidates {
            if self.index.total_size() <= self.cap {
                break;
            }
            // Re-checked under the shard lock; a reader may have arrived
            let Some(entry) = self
                .index
                .try_evict(&candidate.fingerprint, now, self.min_age)
            else {
                continue;
            };

            match self.blobs.delete(&entry.location).await {
                Ok(()) | Err(BlobError::NotFound) => {}
                Err(e) => {
                    // The bytes are still on disk, so they stay accounted for
                    warn!(fingerprint = %entry.fingerprint, error = %e, "Failed to delete evicted blob, keeping entry");
                    self.index.restore(entry);
                    continue;
                }
            }

            debug!(fingerprint = %entry.fingerprint, size = entry.size, "Evicted cache entry");
            report.evicted += 1;
            report.freed += entry.size;
        }

        report.remaining = self.index.total_size();
        self.evictions
            .fetch_add(report.evicted as u64, Ordering::Relaxed);

        if report.remaining > self.cap {
            info!(
                remaining = report.remaining,
                cap = self.cap,
                "Cache over cap but no eligible entries left, retrying next sweep"
            );
        } else {
            info!(evicted = report.evicted, freed = report.freed, "Sweep complete");
        }

        report
    }

    async fn persist_index(&self) {
        if let Err(e) = self.index.persist_if_dirty(&self.index_path).await {
            warn!(error = %e, "Failed to persist index");
        }
    }

    /// Run periodically until `shutdown` flips to true. A notification on
    /// `written` triggers an early, debounced sweep.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        written: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = written.notified() => {
                        tokio::time::sleep(WRITE_DEBOUNCE).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                self.sweep().await;
                self.persist_index().await;
            }

            debug!("Sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::types::IndexEntry;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        index: Arc<Index>,
        blobs: Arc<BlobStore>,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path().join("blobs")));
        blobs.init().await.unwrap();
        Fixture {
            _dir: dir,
            index: Arc::new(Index::new()),
            blobs,
        }
    }

    /// Store a 10-byte entry created `age_secs` ago and last read
    /// `read_secs_ago` ago
    async fn add(f: &Fixture, name: &str, age_secs: i64, read_secs_ago: i64) -> Fingerprint {
        let fp = Fingerprint::from_parts([name]);
        let location = f.blobs.allocate(&fp);
        f.blobs.put(&location, b"0123456789").await.unwrap();
        let now = Utc::now();
        f.index
            .insert(IndexEntry {
                fingerprint: fp,
                location,
                size: 10,
                created_at: now - chrono::Duration::seconds(age_secs),
                last_read_at: now - chrono::Duration::seconds(read_secs_ago),
                read_refcount: 0,
            })
            .unwrap();
        fp
    }

    fn sweeper(f: &Fixture, cap: u64, min_age: Duration) -> Sweeper {
        Sweeper::new(
            Arc::clone(&f.index),
            Arc::clone(&f.blobs),
            f.blobs.root().join("index.json"),
            cap,
            min_age,
        )
    }

    #[tokio::test]
    async fn test_under_cap_does_nothing() {
        let f = fixture().await;
        add(&f, "a", 60, 60).await;

        let report = sweeper(&f, 100, Duration::ZERO).sweep().await;
        assert_eq!(report.evicted, 0);
        assert_eq!(f.index.len(), 1);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_read_first() {
        let f = fixture().await;
        let stale = add(&f, "stale", 120, 100).await;
        let warm = add(&f, "warm", 120, 50).await;
        let hot = add(&f, "hot", 120, 1).await;

        let sweeper = sweeper(&f, 20, Duration::from_secs(10));
        let report = sweeper.sweep().await;

        assert_eq!(report.evicted, 1);
        assert_eq!(report.remaining, 20);
        assert!(f.index.lookup(&stale).is_none());
        assert!(f.index.lookup(&warm).is_some());
        assert!(f.index.lookup(&hot).is_some());
        assert_eq!(sweeper.evictions(), 1);
    }

    #[tokio::test]
    async fn test_young_entries_survive_size_pressure() {
        let f = fixture().await;
        let old = add(&f, "old", 60, 60).await;
        let young_a = add(&f, "young-a", 2, 50).await;
        let young_b = add(&f, "young-b", 5, 40).await;

        let report = sweeper(&f, 1, Duration::from_secs(10)).sweep().await;

        assert_eq!(report.evicted, 1);
        assert!(f.index.lookup(&old).is_none());
        assert!(f.index.lookup(&young_a).is_some());
        assert!(f.index.lookup(&young_b).is_some());
        assert_eq!(report.remaining, 20);
    }

    #[tokio::test]
    async fn test_active_reader_blocks_eviction() {
        let f = fixture().await;
        let oldest = add(&f, "oldest", 3600, 3600).await;
        let other = add(&f, "other", 60, 10).await;

        let guard = f.index.read_guard(&oldest).unwrap();
        let report = sweeper(&f, 1, Duration::ZERO).sweep().await;

        assert!(f.index.lookup(&oldest).is_some());
        assert!(f.index.lookup(&other).is_none());
        assert_eq!(report.remaining, 10);
        let location = guard.entry().location.clone();
        assert!(f.blobs.get(&location).await.is_ok());

        drop(guard);
        let report = sweeper(&f, 1, Duration::ZERO).sweep().await;
        assert_eq!(report.evicted, 1);
        assert!(f.index.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_removes_blob_files() {
        let f = fixture().await;
        let fp = add(&f, "gone", 60, 60).await;
        let location = f.index.lookup(&fp).unwrap().location;

        sweeper(&f, 1, Duration::ZERO).sweep().await;
        assert!(matches!(
            f.blobs.get(&location).await,
            Err(BlobError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_failed_unlink_keeps_entry() {
        let f = fixture().await;
        let stuck = add(&f, "stuck", 60, 60).await;
        let location = f.index.lookup(&stuck).unwrap().location;

        // A non-empty directory at the blob path cannot be unlinked
        let path = f.blobs.root().join(&location);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("pinned"), b"x").unwrap();

        let sweeper = sweeper(&f, 1, Duration::ZERO);
        let report = sweeper.sweep().await;

        assert_eq!(report.evicted, 0);
        assert_eq!(report.remaining, 10);
        assert_eq!(sweeper.evictions(), 0);
        assert_eq!(f.index.lookup(&stuck).unwrap().location, location);
        assert_eq!(f.index.total_size(), 10);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_spawned_sweeper_stops_on_shutdown() {
        let f = fixture().await;
        let sweeper = Arc::new(sweeper(&f, 1, Duration::ZERO));
        let (tx, rx) = watch::channel(false);
        let handle = sweeper.spawn(Duration::from_secs(3600), Arc::new(Notify::new()), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
