//! Asynchronous blob writer with a memory budget
//!
//! Writes are buffered in memory and drained by a pool of workers. A write
//! that would push the buffered bytes past the budget is performed on the
//! caller's own path instead (write-through), which is the back-pressure.

use crate::blob_store::BlobStore;
use crate::error::IndexError;
use crate::fingerprint::Fingerprint;
use crate::index::Index;
use crate::types::IndexEntry;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of [`WriteQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Buffered for a background worker
    Queued,
    /// Over budget: written synchronously before returning
    WrittenThrough,
    /// Already cached, pending or in flight
    Duplicate,
}

struct PendingWrite {
    fingerprint: Fingerprint,
    bytes: Bytes,
}

struct Writer {
    blobs: Arc<BlobStore>,
    index: Arc<Index>,
    budget: u64,
    pending_bytes: AtomicU64,
    /// Buffered or in-flight writes, readable until they land in the index
    pending: Mutex<HashMap<Fingerprint, Bytes>>,
    failures: AtomicU64,
    written: Arc<Notify>,
    drained: Notify,
}

impl Writer {
    /// Reserve `size` bytes of the budget; false when it would overflow
    fn reserve(&self, size: u64) -> bool {
        let mut current = self.pending_bytes.load(Ordering::Acquire);
        loop {
            let Some(next) = current.checked_add(size) else {
                return false;
            };
            if next > self.budget {
                return false;
            }
            match self.pending_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, size: u64) {
        self.pending_bytes.fetch_sub(size, Ordering::AcqRel);
    }

    /// Persist one blob and record it in the index. Failures are logged and
    /// the write is dropped.
    async fn write(&self, fingerprint: Fingerprint, bytes: Bytes) {
        let location = self.blobs.allocate(&fingerprint);
        let size = bytes.len() as u64;

        match self.blobs.put(&location, &bytes).await {
            Ok(()) => match self.index.insert(IndexEntry::new(fingerprint, location.clone(), size)) {
                Ok(()) => {
                    debug!(fingerprint = %fingerprint, size, "Cached derivative");
                    self.written.notify_one();
                }
                Err(IndexError::AlreadyExists) | Err(IndexError::Miss) => {
                    debug!(fingerprint = %fingerprint, "Entry appeared concurrently, discarding write");
                    let _ = self.blobs.delete(&location).await;
                }
            },
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(fingerprint = %fingerprint, size, error = %e, "Failed to write cached derivative");
            }
        }

        self.finish(&fingerprint);
    }

    fn finish(&self, fingerprint: &Fingerprint) {
        let mut pending = self.pending.lock();
        pending.remove(fingerprint);
        if pending.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

pub struct WriteQueue {
    writer: Arc<Writer>,
    tx: Mutex<Option<mpsc::UnboundedSender<PendingWrite>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Start `workers` background writers. `written` is notified after every
    /// successful insert.
    pub fn start(
        blobs: Arc<BlobStore>,
        index: Arc<Index>,
        budget: u64,
        workers: usize,
        written: Arc<Notify>,
    ) -> Self {
        let writer = Arc::new(Writer {
            blobs,
            index,
            budget,
            pending_bytes: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            failures: AtomicU64::new(0),
            written,
            drained: Notify::new(),
        });

        let (tx, rx) = mpsc::unbounded_channel::<PendingWrite>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|id| {
                let writer = Arc::clone(&writer);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        let size = job.bytes.len() as u64;
                        writer.write(job.fingerprint, job.bytes).await;
                        writer.release(size);
                    }
                    debug!(worker = id, "Write worker stopped");
                })
            })
            .collect();

        Self {
            writer,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Hand a computed derivative over for persistence.
    ///
    /// Returns once the bytes are either buffered or, when over budget,
    /// written. A second enqueue for a fingerprint that is already cached or
    /// pending is a no-op.
    pub async fn enqueue(&self, fingerprint: Fingerprint, bytes: Bytes) -> Enqueued {
        if self.writer.index.contains(&fingerprint) {
            return Enqueued::Duplicate;
        }
        {
            let mut pending = self.writer.pending.lock();
            if pending.contains_key(&fingerprint) {
                return Enqueued::Duplicate;
            }
            pending.insert(fingerprint, bytes.clone());
        }

        let size = bytes.len() as u64;
        if self.writer.reserve(size) {
            let job = PendingWrite { fingerprint, bytes };
            let sent = match self.tx.lock().as_ref() {
                Some(tx) => tx.send(job).map_err(|e| e.0),
                None => Err(job),
            };
            match sent {
                Ok(()) => return Enqueued::Queued,
                Err(job) => {
                    self.writer.release(size);
                    return self.write_through(job.fingerprint, job.bytes).await;
                }
            }
        }

        debug!(fingerprint = %fingerprint, size, "Write queue over budget, writing through");
        self.write_through(fingerprint, bytes).await
    }

    /// Runs on its own task so a cancelled caller cannot abort the write.
    async fn write_through(&self, fingerprint: Fingerprint, bytes: Bytes) -> Enqueued {
        let writer = Arc::clone(&self.writer);
        let task = tokio::spawn(async move { writer.write(fingerprint, bytes).await });
        if let Err(e) = task.await {
            warn!(fingerprint = %fingerprint, error = %e, "Write-through task failed");
            self.writer.finish(&fingerprint);
        }
        Enqueued::WrittenThrough
    }

    /// Bytes of a write that has not reached the index yet
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Bytes> {
        self.writer.pending.lock().get(fingerprint).cloned()
    }

    /// Wait until every buffered write has been persisted or dropped
    pub async fn flush(&self) {
        loop {
            let drained = self.writer.drained.notified();
            if self.pending_writes() == 0 {
                return;
            }
            drained.await;
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.writer.pending.lock().len()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.writer.pending_bytes.load(Ordering::Acquire)
    }

    pub fn write_failures(&self) -> u64 {
        self.writer.failures.load(Ordering::Relaxed)
    }

    /// Stop accepting queued writes and wait for the buffer to drain.
    /// Later enqueues are written through.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Write worker panicked");
            }
        }
        info!("Write queue drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn queue(dir: &std::path::Path, budget: u64) -> (WriteQueue, Arc<Index>, Arc<BlobStore>) {
        let blobs = Arc::new(BlobStore::new(dir.to_path_buf()));
        blobs.init().await.unwrap();
        let index = Arc::new(Index::new());
        let queue = WriteQueue::start(
            Arc::clone(&blobs),
            Arc::clone(&index),
            budget,
            2,
            Arc::new(Notify::new()),
        );
        (queue, index, blobs)
    }

    #[tokio::test]
    async fn test_queued_write_lands_after_shutdown() {
        let dir = tempdir().unwrap();
        let (queue, index, blobs) = queue(dir.path(), 1024).await;
        let fp = Fingerprint::from_parts(["a"]);

        let outcome = queue.enqueue(fp, Bytes::from_static(b"queued")).await;
        assert_eq!(outcome, Enqueued::Queued);

        queue.shutdown().await;
        let entry = index.lookup(&fp).unwrap();
        assert_eq!(entry.size, 6);
        assert_eq!(blobs.get(&entry.location).await.unwrap(), "queued");
        assert_eq!(queue.pending_writes(), 0);
        assert_eq!(queue.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn test_pending_bytes_readable_until_flushed() {
        let dir = tempdir().unwrap();
        let (queue, index, _blobs) = queue(dir.path(), 1024).await;
        let fp = Fingerprint::from_parts(["pending"]);

        queue.enqueue(fp, Bytes::from_static(b"soon")).await;
        assert!(queue.get(&fp).is_some() || index.lookup(&fp).is_some());

        queue.flush().await;
        assert!(queue.get(&fp).is_none());
        assert!(index.lookup(&fp).is_some());
    }

    #[tokio::test]
    async fn test_over_budget_writes_through() {
        let dir = tempdir().unwrap();
        let (queue, index, _blobs) = queue(dir.path(), 4).await;
        let fp = Fingerprint::from_parts(["big"]);

        let outcome = queue.enqueue(fp, Bytes::from_static(b"larger than four")).await;
        assert_eq!(outcome, Enqueued::WrittenThrough);
        assert!(index.lookup(&fp).is_some());
        assert_eq!(queue.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_noop() {
        let dir = tempdir().unwrap();
        let (queue, index, _blobs) = queue(dir.path(), 0).await;
        let fp = Fingerprint::from_parts(["dup"]);

        assert_eq!(
            queue.enqueue(fp, Bytes::from_static(b"one")).await,
            Enqueued::WrittenThrough
        );
        assert_eq!(
            queue.enqueue(fp, Bytes::from_static(b"two")).await,
            Enqueued::Duplicate
        );
        assert_eq!(index.len(), 1);
        assert_eq!(index.total_size(), 3);
    }

    #[tokio::test]
    async fn test_write_failure_is_dropped() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("blobs");
        let (queue, index, _blobs) = queue(&root, 0).await;
        // A file where the shard directory should be makes every write fail
        std::fs::remove_dir_all(&root).unwrap();
        std::fs::write(&root, b"not a directory").unwrap();

        let fp = Fingerprint::from_parts(["fail"]);
        let outcome = queue.enqueue(fp, Bytes::from_static(b"data")).await;

        assert_eq!(outcome, Enqueued::WrittenThrough);
        assert!(index.lookup(&fp).is_none());
        assert_eq!(queue.write_failures(), 1);
        assert_eq!(queue.pending_writes(), 0);
    }
}
