//! On-disk layout for cached derivative bytes
//!
//! Blobs live under `<root>/<first two hex chars>/<fingerprint>.<generation>`.
//! Every write goes to a `.tmp` sibling first and is renamed into place, so a
//! partially written file is never visible under its final name. Deleting a
//! blob that is being read relies on unlink-while-open semantics.

use crate::error::BlobError;
use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const TMP_SUFFIX: &str = "tmp";

/// A blob file discovered on disk during reconciliation
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub fingerprint: Fingerprint,
    pub location: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// File-per-blob store rooted at a directory
pub struct BlobStore {
    root: PathBuf,
    generation: AtomicU32,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            generation: AtomicU32::new(0),
        }
    }

    pub async fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh location for a new blob of `fingerprint`.
    ///
    /// The generation suffix makes a recreated entry land on a different path
    /// than any previous incarnation.
    pub fn allocate(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        let seq = self.generation.fetch_add(1, Ordering::Relaxed);
        let micros = Utc::now().timestamp_micros();
        PathBuf::from(&hex[..2]).join(format!("{}.{:x}{:04x}", hex, micros, seq & 0xffff))
    }

    fn resolve(&self, location: &Path) -> PathBuf {
        self.root.join(location)
    }

    /// Atomically write `data` at `location`
    pub async fn put(&self, location: &Path, data: &[u8]) -> Result<(), BlobError> {
        let path = self.resolve(location);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".");
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(BlobError::Io(Box::new(e)));
        }

        debug!(location = ?location, size = data.len(), "Wrote blob");
        Ok(())
    }

    pub async fn get(&self, location: &Path) -> Result<Bytes, BlobError> {
        let data = fs::read(self.resolve(location)).await?;
        Ok(Bytes::from(data))
    }

    pub async fn delete(&self, location: &Path) -> Result<(), BlobError> {
        fs::remove_file(self.resolve(location)).await?;
        debug!(location = ?location, "Deleted blob");
        Ok(())
    }

    pub async fn size(&self, location: &Path) -> Result<u64, BlobError> {
        let meta = fs::metadata(self.resolve(location)).await?;
        Ok(meta.len())
    }

    /// List every complete blob on disk, purging leftover temp files
    pub async fn scan(&self) -> std::io::Result<Vec<StoredBlob>> {
        let mut blobs = Vec::new();
        let mut shards = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(blobs),
            Err(e) => return Err(e),
        };

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let shard_name = PathBuf::from(shard.file_name());
            let mut files = fs::read_dir(shard.path()).await?;

            while let Some(file) = files.next_entry().await? {
                let name = file.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };

                if name.ends_with(&format!(".{}", TMP_SUFFIX)) {
                    debug!(file = %name, "Purging leftover temp file");
                    let _ = fs::remove_file(file.path()).await;
                    continue;
                }

                let Some(fingerprint) = parse_blob_name(name) else {
                    warn!(file = %name, "Ignoring unrecognised file in cache directory");
                    continue;
                };

                let meta = file.metadata().await?;
                let modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                blobs.push(StoredBlob {
                    fingerprint,
                    location: shard_name.join(name),
                    size: meta.len(),
                    modified,
                });
            }
        }

        Ok(blobs)
    }
}

fn parse_blob_name(name: &str) -> Option<Fingerprint> {
    let (hex, generation) = name.split_once('.')?;
    if hex.len() != Fingerprint::HEX_LEN || generation.is_empty() {
        return None;
    }
    hex.parse().ok()
}
