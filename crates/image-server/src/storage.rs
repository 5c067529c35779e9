//! Source image resolution by path prefix
//!
//! Each mount maps a URL path prefix to a backend. The longest matching
//! prefix wins.

use crate::error::{ImageServerError, Result};
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Filesystem { root: PathBuf },
    Remote { base: Url },
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub prefix: String,
    pub ignore_case: bool,
    pub backend: StorageBackend,
}

impl Mount {
    pub fn new(prefix: impl Into<String>, backend: StorageBackend) -> Self {
        Self {
            prefix: prefix.into(),
            ignore_case: false,
            backend,
        }
    }

    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    /// The path remainder after this mount's prefix, if it matches
    fn strip<'a>(&self, path: &'a str) -> Option<&'a str> {
        if path.len() < self.prefix.len() || !path.is_char_boundary(self.prefix.len()) {
            return None;
        }
        let (head, rest) = path.split_at(self.prefix.len());
        let matches = if self.ignore_case {
            head.eq_ignore_ascii_case(&self.prefix)
        } else {
            head == self.prefix
        };
        // `/folder` must not claim `/folderX/...`
        let at_boundary = self.prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/');
        (matches && at_boundary).then(|| rest.trim_start_matches('/'))
    }
}

/// A resolved source image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    File(PathBuf),
    Remote(Url),
}

impl Source {
    /// Stable identity used in fingerprints
    pub fn identity(&self) -> String {
        match self {
            Source::File(path) => format!("file:{}", path.display()),
            Source::Remote(url) => format!("remote:{}", url),
        }
    }
}

pub struct StorageRouter {
    mounts: Vec<Mount>,
    client: Client,
}

impl StorageRouter {
    pub fn new(mut mounts: Vec<Mount>) -> Self {
        mounts.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            mounts,
            client: Client::new(),
        }
    }

    pub fn resolve(&self, path: &str) -> Result<Source> {
        for mount in &self.mounts {
            let Some(key) = mount.strip(path) else {
                continue;
            };
            return match &mount.backend {
                StorageBackend::Filesystem { root } => Ok(Source::File(safe_join(root, key)?)),
                StorageBackend::Remote { base } => {
                    let url = base.join(key).map_err(|e| {
                        ImageServerError::BadRequest(format!("invalid remote key '{}': {}", key, e))
                    })?;
                    if !url.as_str().starts_with(base.as_str()) {
                        return Err(ImageServerError::BadRequest(format!(
                            "remote key escapes its mount: {}",
                            key
                        )));
                    }
                    Ok(Source::Remote(url))
                }
            };
        }
        Err(ImageServerError::NotFound(format!("no storage mounted for {}", path)))
    }

    /// Version tag folded into the fingerprint so edited files get new
    /// derivatives. Remote sources are treated as immutable.
    pub async fn version(&self, source: &Source) -> Result<String> {
        match source {
            Source::File(path) => {
                let meta = fs::metadata(path).await?;
                if !meta.is_file() {
                    return Err(ImageServerError::NotFound(path.display().to_string()));
                }
                let modified = meta
                    .modified()
                    .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_micros())
                    .unwrap_or_default();
                Ok(format!("{}:{}", meta.len(), modified))
            }
            Source::Remote(_) => Ok(String::new()),
        }
    }

    pub async fn fetch(&self, source: &Source) -> Result<Bytes> {
        match source {
            Source::File(path) => {
                debug!(path = ?path, "Reading source image");
                Ok(Bytes::from(fs::read(path).await?))
            }
            Source::Remote(url) => {
                debug!(url = %url, "Fetching remote source image");
                let response = self.client.get(url.clone()).send().await?;

                if response.status() == StatusCode::NOT_FOUND {
                    return Err(ImageServerError::NotFound(url.to_string()));
                }
                if !response.status().is_success() {
                    warn!(status = %response.status(), url = %url, "Failed to fetch source image");
                    return Err(ImageServerError::Upstream(format!(
                        "remote returned status {}",
                        response.status()
                    )));
                }

                let data = response.bytes().await?;
                debug!(size = data.len(), "Fetched remote source image");
                Ok(data)
            }
        }
    }
}

/// Join `key` under `root`, refusing anything that could leave it
fn safe_join(root: &Path, key: &str) -> Result<PathBuf> {
    let relative = Path::new(key);
    if key.is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ImageServerError::BadRequest(format!("invalid path '{}'", key)));
    }
    Ok(root.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn router() -> StorageRouter {
        StorageRouter::new(vec![
            Mount::new(
                "/",
                StorageBackend::Filesystem {
                    root: PathBuf::from("/srv/www"),
                },
            ),
            Mount::new(
                "/folder",
                StorageBackend::Filesystem {
                    root: PathBuf::from("/srv/folder"),
                },
            ),
            Mount::new(
                "/remote/",
                StorageBackend::Remote {
                    base: Url::parse("https://images.example.com/assets/").unwrap(),
                },
            )
            .ignore_case(),
        ])
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = router();
        assert_eq!(
            router.resolve("/folder/cat.png").unwrap(),
            Source::File(PathBuf::from("/srv/folder/cat.png"))
        );
        assert_eq!(
            router.resolve("/other/cat.png").unwrap(),
            Source::File(PathBuf::from("/srv/www/other/cat.png"))
        );
    }

    #[test]
    fn test_prefix_matches_whole_segments_only() {
        let router = router();
        assert_eq!(
            router.resolve("/folderX/cat.png").unwrap(),
            Source::File(PathBuf::from("/srv/www/folderX/cat.png"))
        );
        assert_eq!(
            router.resolve("/folder/sub/cat.png").unwrap(),
            Source::File(PathBuf::from("/srv/folder/sub/cat.png"))
        );
    }

    #[test]
    fn test_remote_prefix_ignores_case() {
        let router = router();
        assert_eq!(
            router.resolve("/REMOTE/dog.jpg").unwrap(),
            Source::Remote(Url::parse("https://images.example.com/assets/dog.jpg").unwrap())
        );
    }

    #[test]
    fn test_rejects_traversal() {
        let router = router();
        assert!(matches!(
            router.resolve("/folder/../etc/passwd"),
            Err(ImageServerError::BadRequest(_))
        ));
        assert!(router.resolve("/remote/../../secret").is_err());
    }

    #[test]
    fn test_unmounted_path_is_not_found() {
        let router = StorageRouter::new(vec![Mount::new(
            "/s3/",
            StorageBackend::Filesystem {
                root: PathBuf::from("/srv"),
            },
        )]);
        assert!(matches!(
            router.resolve("/azure/x.png"),
            Err(ImageServerError::NotFound(_))
        ));
    }

    #[test]
    fn test_identity_distinguishes_backends() {
        let file = Source::File(PathBuf::from("/srv/a.png"));
        let remote = Source::Remote(Url::parse("https://x.test/a.png").unwrap());
        assert_ne!(file.identity(), remote.identity());
    }

    #[tokio::test]
    async fn test_fetch_and_version_for_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"abc").unwrap();
        let router = StorageRouter::new(vec![Mount::new(
            "/",
            StorageBackend::Filesystem {
                root: dir.path().to_path_buf(),
            },
        )]);

        let source = router.resolve("/a.bin").unwrap();
        assert_eq!(router.fetch(&source).await.unwrap(), "abc");
        assert!(router.version(&source).await.unwrap().starts_with("3:"));

        let missing = router.resolve("/missing.bin").unwrap();
        assert!(matches!(
            router.version(&missing).await,
            Err(ImageServerError::NotFound(_))
        ));
    }
}
