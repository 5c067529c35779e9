//! In-memory, persisted index from fingerprint to blob metadata
//!
//! Entries are spread over a fixed number of shards, each behind its own
//! lock. Every per-fingerprint operation runs entirely under its shard lock,
//! which makes them linearizable per fingerprint without a global lock. No
//! lock is ever held across an await point.

use crate::blob_store::{BlobStore, StoredBlob};
use crate::error::{IndexError, Result};
use crate::fingerprint::Fingerprint;
use crate::types::IndexEntry;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

const SHARDS: usize = 16;
const INDEX_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    entries: Vec<IndexEntry>,
}

/// What startup reconciliation did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub kept: usize,
    pub dropped: usize,
    pub adopted: usize,
    pub purged: usize,
}

pub struct Index {
    shards: Vec<RwLock<HashMap<Fingerprint, IndexEntry>>>,
    total_size: AtomicU64,
    dirty: AtomicBool,
}

impl Index {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            total_size: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    fn shard(&self, fingerprint: &Fingerprint) -> &RwLock<HashMap<Fingerprint, IndexEntry>> {
        &self.shards[fingerprint.shard(SHARDS)]
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<IndexEntry> {
        self.shard(fingerprint).read().get(fingerprint).cloned()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.shard(fingerprint).read().contains_key(fingerprint)
    }

    pub fn insert(&self, entry: IndexEntry) -> std::result::Result<(), IndexError> {
        let mut shard = self.shard(&entry.fingerprint).write();
        if shard.contains_key(&entry.fingerprint) {
            return Err(IndexError::AlreadyExists);
        }
        self.total_size.fetch_add(entry.size, Ordering::Relaxed);
        shard.insert(entry.fingerprint, entry);
        self.mark_dirty();
        Ok(())
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> std::result::Result<IndexEntry, IndexError> {
        let removed = self.shard(fingerprint).write().remove(fingerprint);
        match removed {
            Some(entry) => {
                self.total_size.fetch_sub(entry.size, Ordering::Relaxed);
                self.mark_dirty();
                Ok(entry)
            }
            None => Err(IndexError::Miss),
        }
    }

    /// Remove the entry only if it still points at `location`.
    ///
    /// Used to purge a corrupt entry without clobbering a newer generation
    /// written in the meantime.
    pub fn remove_if_location(&self, fingerprint: &Fingerprint, location: &Path) -> Option<IndexEntry> {
        let mut shard = self.shard(fingerprint).write();
        if shard.get(fingerprint)?.location != location {
            return None;
        }
        let entry = shard.remove(fingerprint)?;
        self.total_size.fetch_sub(entry.size, Ordering::Relaxed);
        self.mark_dirty();
        Some(entry)
    }

    pub fn touch(&self, fingerprint: &Fingerprint) {
        if let Some(entry) = self.shard(fingerprint).write().get_mut(fingerprint) {
            entry.last_read_at = Utc::now();
            self.mark_dirty();
        }
    }

    /// Register an in-flight reader; the entry cannot be evicted until the
    /// matching [`release_read`](Self::release_read).
    pub fn acquire_read(&self, fingerprint: &Fingerprint) -> std::result::Result<IndexEntry, IndexError> {
        let mut shard = self.shard(fingerprint).write();
        let entry = shard.get_mut(fingerprint).ok_or(IndexError::Miss)?;
        entry.read_refcount += 1;
        Ok(entry.clone())
    }

    pub fn release_read(&self, fingerprint: &Fingerprint) {
        if let Some(entry) = self.shard(fingerprint).write().get_mut(fingerprint) {
            entry.read_refcount = entry.read_refcount.saturating_sub(1);
        }
    }

    /// [`acquire_read`](Self::acquire_read) with release on drop
    pub fn read_guard(self: &Arc<Self>, fingerprint: &Fingerprint) -> Option<ReadGuard> {
        let entry = self.acquire_read(fingerprint).ok()?;
        Some(ReadGuard {
            index: Arc::clone(self),
            entry,
        })
    }

    /// Atomically remove an entry if it has no readers and is at least
    /// `min_age` old at `now`.
    pub fn try_evict(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
        min_age: Duration,
    ) -> Option<IndexEntry> {
        let mut shard = self.shard(fingerprint).write();
        let entry = shard.get(fingerprint)?;
        if entry.read_refcount > 0 || !old_enough(entry, now, min_age) {
            return None;
        }
        let entry = shard.remove(fingerprint)?;
        self.total_size.fetch_sub(entry.size, Ordering::Relaxed);
        self.mark_dirty();
        Some(entry)
    }

    /// Put back an entry whose blob could not be deleted, so its bytes stay
    /// counted. Returns false when a newer generation took its place; the
    /// stale file is then purged by the next startup reconciliation.
    pub fn restore(&self, mut entry: IndexEntry) -> bool {
        let fingerprint = entry.fingerprint;
        entry.read_refcount = 0;
        match self.insert(entry) {
            Ok(()) => true,
            Err(_) => {
                warn!(fingerprint = %fingerprint, "Newer entry replaced an undeletable blob");
                false
            }
        }
    }

    pub fn snapshot(&self) -> Vec<IndexEntry> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the index to `path` if anything changed since the last persist
    pub async fn persist_if_dirty(&self, path: &Path) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(false);
        }
        if let Err(e) = self.persist(path).await {
            self.mark_dirty();
            return Err(e);
        }
        Ok(true)
    }

    pub async fn persist(&self, path: &Path) -> Result<()> {
        let persisted = PersistedIndex {
            version: INDEX_VERSION,
            entries: self.snapshot(),
        };
        let json = serde_json::to_vec(&persisted)?;

        let mut tmp = path.to_path_buf().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, path).await?;

        debug!(path = ?path, entries = persisted.entries.len(), "Persisted index");
        Ok(())
    }

    /// Load the index from `path` and reconcile it against the blob store.
    ///
    /// Entries whose blob is missing or has the wrong size are dropped.
    /// Blob files with no entry are adopted; when several generations of one
    /// fingerprint exist, the newest wins and the rest are purged.
    pub async fn open(path: &Path, blobs: &BlobStore) -> Result<(Self, ReconcileReport)> {
        let loaded = match fs::read(path).await {
            Ok(data) => match serde_json::from_slice::<PersistedIndex>(&data) {
                Ok(persisted) if persisted.version == INDEX_VERSION => persisted.entries,
                Ok(persisted) => {
                    warn!(version = persisted.version, "Unknown index version, rebuilding from disk");
                    Vec::new()
                }
                Err(e) => {
                    warn!(error = %e, "Corrupt index file, rebuilding from disk");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut on_disk: HashMap<PathBuf, StoredBlob> = blobs
            .scan()
            .await?
            .into_iter()
            .map(|blob| (blob.location.clone(), blob))
            .collect();

        let index = Index::new();
        let mut report = ReconcileReport::default();

        for mut entry in loaded {
            match on_disk.remove(&entry.location) {
                Some(blob) if blob.size == entry.size && blob.fingerprint == entry.fingerprint => {
                    entry.read_refcount = 0;
                    let fingerprint = entry.fingerprint;
                    if index.insert(entry).is_err() {
                        debug!(fingerprint = %fingerprint, "Duplicate index row, keeping first");
                        on_disk.insert(blob.location.clone(), blob);
                        continue;
                    }
                    report.kept += 1;
                }
                Some(blob) => {
                    warn!(fingerprint = %entry.fingerprint, "Blob size mismatch, dropping entry");
                    on_disk.insert(blob.location.clone(), blob);
                    report.dropped += 1;
                }
                None => {
                    warn!(fingerprint = %entry.fingerprint, "Blob missing, dropping entry");
                    report.dropped += 1;
                }
            }
        }

        let mut orphans: Vec<StoredBlob> = on_disk.into_values().collect();
        orphans.sort_by(|a, b| b.modified.cmp(&a.modified));

        for blob in orphans {
            if index.contains(&blob.fingerprint) {
                if blobs.delete(&blob.location).await.is_ok() {
                    report.purged += 1;
                }
                continue;
            }
            let entry = IndexEntry {
                fingerprint: blob.fingerprint,
                location: blob.location,
                size: blob.size,
                created_at: blob.modified,
                last_read_at: blob.modified,
                read_refcount: 0,
            };
            if index.insert(entry).is_ok() {
                report.adopted += 1;
            }
        }

        info!(
            kept = report.kept,
            dropped = report.dropped,
            adopted = report.adopted,
            purged = report.purged,
            total_size = index.total_size(),
            "Index reconciled"
        );

        if report.dropped > 0 || report.adopted > 0 || report.purged > 0 {
            index.mark_dirty();
        } else {
            index.dirty.store(false, Ordering::Relaxed);
        }

        Ok((index, report))
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn old_enough(entry: &IndexEntry, now: DateTime<Utc>, min_age: Duration) -> bool {
    match (now - entry.created_at).to_std() {
        Ok(age) => age >= min_age,
        // created in the future relative to `now`
        Err(_) => min_age.is_zero(),
    }
}

/// Holds a read reference on an index entry until dropped
pub struct ReadGuard {
    index: Arc<Index>,
    entry: IndexEntry,
}

impl ReadGuard {
    pub fn entry(&self) -> &IndexEntry {
        &self.entry
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.index.release_read(&self.entry.fingerprint);
    }
}
