//! Error types for the hybrid cache

use std::fmt;
use std::sync::Arc;

/// Errors surfaced while opening, reconciling or shutting down the cache.
///
/// None of these reach a request caller: the read and write paths absorb
/// them and degrade to a miss or a skipped write.
#[derive(Debug)]
pub enum CacheError {
    Io(Box<std::io::Error>),
    Index(String),
    Config(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Index(msg) => write!(f, "Index error: {}", msg),
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Index(err.to_string())
    }
}

impl From<BlobError> for CacheError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound => CacheError::Index("blob not found".to_string()),
            BlobError::Io(err) => CacheError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Blob store failures. `NotFound` is the normal miss condition.
#[derive(Debug)]
pub enum BlobError {
    NotFound,
    Io(Box<std::io::Error>),
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::NotFound => write!(f, "Blob not found"),
            BlobError::Io(err) => write!(f, "Blob IO error: {}", err),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobError::Io(err) => Some(err.as_ref()),
            BlobError::NotFound => None,
        }
    }
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            BlobError::NotFound
        } else {
            BlobError::Io(Box::new(err))
        }
    }
}

/// Index mutation outcomes that are not successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    AlreadyExists,
    Miss,
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::AlreadyExists => write!(f, "Index entry already exists"),
            IndexError::Miss => write!(f, "Index entry not found"),
        }
    }
}

impl std::error::Error for IndexError {}

/// The producer's own failure, shared by every waiter of a single-flight group.
///
/// The original error is kept intact behind an `Arc`; callers recover it with
/// [`ProducerError::downcast_ref`].
#[derive(Debug, Clone)]
pub struct ProducerError(Arc<dyn std::error::Error + Send + Sync>);

impl ProducerError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ProducerError(Arc::new(err))
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Display for ProducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ProducerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
