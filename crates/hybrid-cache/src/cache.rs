//! Cache facade: the get-or-compute contract used by the transformation pipeline

use crate::blob_store::BlobStore;
use crate::config::CacheConfig;
use crate::error::{BlobError, ProducerError, Result};
use crate::fingerprint::Fingerprint;
use crate::index::Index;
use crate::sweeper::{SweepReport, Sweeper};
use crate::types::{CacheStats, CacheStatus, Derivative};
use crate::write_queue::WriteQueue;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BLOB_DIR: &str = "blobs";
const INDEX_FILE: &str = "index.json";

type Flight = Shared<BoxFuture<'static, std::result::Result<Bytes, ProducerError>>>;
type WeakFlight = WeakShared<BoxFuture<'static, std::result::Result<Bytes, ProducerError>>>;

struct Engine {
    index: Arc<Index>,
    blobs: Arc<BlobStore>,
    writes: Arc<WriteQueue>,
    sweeper: Arc<Sweeper>,
    index_path: PathBuf,
    /// Producer invocations in progress. Only weak handles are kept so that a
    /// flight is dropped, and its producer cancelled, once every waiter leaves.
    inflight: Mutex<HashMap<Fingerprint, WeakFlight>>,
    hits: AtomicU64,
    misses: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a process-wide derivative cache. Cheap to clone.
#[derive(Clone)]
pub struct HybridCache {
    engine: Option<Arc<Engine>>,
}

impl HybridCache {
    /// Create directories, load and reconcile the index, start the write
    /// workers and the sweeper.
    ///
    /// With caching disabled nothing touches the disk and every request goes
    /// straight to its producer.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        if !config.caching_enabled {
            info!("Caching disabled");
            return Ok(Self { engine: None });
        }

        fs::create_dir_all(&config.cache_directory).await?;
        let blobs = Arc::new(BlobStore::new(config.cache_directory.join(BLOB_DIR)));
        blobs.init().await?;

        let index_path = config.cache_directory.join(INDEX_FILE);
        let (index, report) = Index::open(&index_path, &blobs).await?;
        let index = Arc::new(index);
        if report.dropped > 0 || report.adopted > 0 || report.purged > 0 {
            index.persist(&index_path).await?;
        }

        let written = Arc::new(Notify::new());
        let writes = Arc::new(WriteQueue::start(
            Arc::clone(&blobs),
            Arc::clone(&index),
            config.write_queue_memory_budget,
            config.write_workers,
            Arc::clone(&written),
        ));

        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&index),
            Arc::clone(&blobs),
            index_path.clone(),
            config.cache_size_cap,
            config.min_age_to_delete,
        ));
        sweeper.sweep().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper_task = Arc::clone(&sweeper).spawn(config.sweep_interval, written, shutdown_rx);

        info!(
            cache_dir = ?config.cache_directory,
            entries = index.len(),
            total_size = index.total_size(),
            cap = config.cache_size_cap,
            "Cache initialized"
        );

        Ok(Self {
            engine: Some(Arc::new(Engine {
                index,
                blobs,
                writes,
                sweeper,
                index_path,
                inflight: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                shutdown_tx,
                sweeper_task: Mutex::new(Some(sweeper_task)),
            })),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.is_some()
    }

    /// Return the derivative for `fingerprint`, calling `producer` on a miss.
    ///
    /// Concurrent misses for one fingerprint share a single producer call.
    /// The producer's failure is returned to every waiter; cache-internal
    /// failures never are.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        fingerprint: Fingerprint,
        producer: F,
    ) -> std::result::Result<Derivative, ProducerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Some(engine) = &self.engine else {
            let bytes = producer().await.map_err(ProducerError::new)?;
            return Ok(Derivative {
                bytes,
                status: CacheStatus::Disabled,
            });
        };

        if let Some(bytes) = engine.read_hit(&fingerprint).await {
            return Ok(Derivative {
                bytes,
                status: CacheStatus::Hit,
            });
        }

        let mut producer = producer;
        let mut recheck = true;
        let (flight, leader) = loop {
            match engine.join_or_start(fingerprint, producer, recheck) {
                Joined::Flight(flight, leader) => break (flight, leader),
                Joined::Pending(bytes) => {
                    engine.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Derivative {
                        bytes,
                        status: CacheStatus::Hit,
                    });
                }
                Joined::Stored(returned) => {
                    if let Some(bytes) = engine.read_hit(&fingerprint).await {
                        return Ok(Derivative {
                            bytes,
                            status: CacheStatus::Hit,
                        });
                    }
                    producer = returned;
                    recheck = false;
                }
            }
        };
        engine.misses.fetch_add(1, Ordering::Relaxed);
        let mut ticket = FlightTicket {
            engine: Arc::clone(engine),
            fingerprint,
            flight: Some(flight.clone()),
            done: false,
        };

        let result = flight.await;
        ticket.done = true;
        drop(ticket);

        let bytes = result?;
        Ok(Derivative {
            bytes,
            status: if leader {
                CacheStatus::Miss
            } else {
                CacheStatus::Coalesced
            },
        })
    }

    pub fn stats(&self) -> CacheStats {
        let Some(engine) = &self.engine else {
            return CacheStats::default();
        };
        CacheStats {
            entries: engine.index.len(),
            total_size: engine.index.total_size(),
            hits: engine.hits.load(Ordering::Relaxed),
            misses: engine.misses.load(Ordering::Relaxed),
            pending_writes: engine.writes.pending_writes(),
            pending_bytes: engine.writes.pending_bytes(),
            evictions: engine.sweeper.evictions(),
            write_failures: engine.writes.write_failures(),
        }
    }

    /// Run an eviction sweep now instead of waiting for the next interval
    pub async fn sweep(&self) -> Option<SweepReport> {
        let engine = self.engine.as_ref()?;
        Some(engine.sweeper.sweep().await)
    }

    /// Wait for buffered writes to reach disk
    pub async fn flush(&self) {
        if let Some(engine) = &self.engine {
            engine.writes.flush().await;
        }
    }

    /// Drain the write queue, stop the sweeper and persist the index
    pub async fn shutdown(&self) -> Result<()> {
        let Some(engine) = &self.engine else {
            return Ok(());
        };

        engine.writes.shutdown().await;

        let _ = engine.shutdown_tx.send(true);
        let task = engine.sweeper_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Sweeper task panicked");
            }
        }

        engine.index.persist(&engine.index_path).await?;
        info!(
            entries = engine.index.len(),
            total_size = engine.index.total_size(),
            "Cache shut down"
        );
        Ok(())
    }

    #[cfg(test)]
    fn engine(&self) -> &Arc<Engine> {
        self.engine.as_ref().unwrap()
    }
}

impl Engine {
    /// Serve from disk or from the write buffer. Any failure reads as a miss;
    /// a corrupt entry is purged on the way.
    async fn read_hit(&self, fingerprint: &Fingerprint) -> Option<Bytes> {
        if let Some(guard) = self.index.read_guard(fingerprint) {
            let location = guard.entry().location.clone();
            let read = self.blobs.get(&location).await;
            drop(guard);

            match read {
                Ok(bytes) => {
                    self.index.touch(fingerprint);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(fingerprint = %fingerprint, "Cache hit");
                    return Some(bytes);
                }
                Err(e) => {
                    warn!(fingerprint = %fingerprint, error = %e, "Cached blob unreadable, purging entry");
                    if let Some(entry) = self.index.remove_if_location(fingerprint, &location) {
                        match self.blobs.delete(&location).await {
                            Ok(()) | Err(BlobError::NotFound) => {}
                            Err(e) => {
                                warn!(fingerprint = %fingerprint, error = %e, "Failed to delete corrupt blob, keeping entry");
                                self.index.restore(entry);
                            }
                        }
                    }
                }
            }
        }

        let pending = self.writes.get(fingerprint)?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %fingerprint, "Cache hit from write queue");
        Some(pending)
    }

    /// Join the running flight for `fingerprint` or start one.
    ///
    /// A flight can finish and clear its slot between the caller's hit check
    /// and this lock. Its bytes are then pending or indexed, since the flight
    /// enqueues before it completes, so with `recheck` both are consulted
    /// again under the lock.
    fn join_or_start<F, Fut, E>(&self, fingerprint: Fingerprint, producer: F, recheck: bool) -> Joined<F>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(&fingerprint).and_then(|weak| weak.upgrade()) {
            debug!(fingerprint = %fingerprint, "Joining in-flight computation");
            return Joined::Flight(existing, false);
        }
        if recheck {
            if let Some(bytes) = self.writes.get(&fingerprint) {
                return Joined::Pending(bytes);
            }
            if self.index.contains(&fingerprint) {
                return Joined::Stored(producer);
            }
        }

        let computation = producer();
        let writes = Arc::clone(&self.writes);
        let flight = async move {
            let bytes = computation.await.map_err(ProducerError::new)?;
            // Persistence runs regardless of whether waiters are still attached
            writes.enqueue(fingerprint, bytes.clone()).await;
            Ok(bytes)
        }
        .boxed()
        .shared();

        if let Some(weak) = flight.downgrade() {
            inflight.insert(fingerprint, weak);
        }
        Joined::Flight(flight, true)
    }
}

/// Outcome of [`Engine::join_or_start`]
enum Joined<F> {
    /// Attached to a flight; true when this caller started it
    Flight(Flight, bool),
    /// Bytes still in the write queue
    Pending(Bytes),
    /// Indexed on disk; the producer is handed back for a fallback
    Stored(F),
}

/// A waiter's attachment to a flight. Dropping it, whether on completion or
/// cancellation, clears the in-flight slot once it is finished or abandoned.
struct FlightTicket {
    engine: Arc<Engine>,
    fingerprint: Fingerprint,
    flight: Option<Flight>,
    done: bool,
}

impl Drop for FlightTicket {
    fn drop(&mut self) {
        let flight = self.flight.take();
        let mut inflight = self.engine.inflight.lock();

        if self.done {
            let current = inflight.get(&self.fingerprint).and_then(|weak| weak.upgrade());
            if let (Some(current), Some(flight)) = (current, flight.as_ref()) {
                if current.ptr_eq(flight) {
                    inflight.remove(&self.fingerprint);
                }
            }
        }

        // Releasing the last handle cancels the producer
        drop(flight);
        let abandoned = inflight
            .get(&self.fingerprint)
            .is_some_and(|weak| weak.upgrade().is_none());
        if abandoned {
            inflight.remove(&self.fingerprint);
        }
    }
}
