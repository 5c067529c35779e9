//! Server configuration loaded from the environment

use crate::error::{ImageServerError, Result};
use crate::request::RewriteRule;
use crate::storage::{Mount, StorageBackend};
use hybrid_cache::CacheConfig;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cache: CacheConfig,
    pub web_root: PathBuf,
    /// `(prefix, directory)` pairs
    pub path_mappings: Vec<(String, PathBuf)>,
    /// `(prefix, base url)` pairs
    pub remote_mappings: Vec<(String, Url)>,
    pub rewrite_rules: Vec<RewriteRule>,
    pub default_cache_control: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = var("PORT")
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(3001);

        let defaults = CacheConfig::default();
        let cache = CacheConfig {
            cache_directory: var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_directory),
            min_age_to_delete: var("MIN_AGE_TO_DELETE_SECS")
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.min_age_to_delete),
            write_queue_memory_budget: var("WRITE_QUEUE_MEMORY_MB")
                .and_then(|s| s.parse::<u64>().ok())
                .map(|mb| mb * MB)
                .unwrap_or(defaults.write_queue_memory_budget),
            cache_size_cap: var("CACHE_SIZE_MB")
                .and_then(|s| s.parse::<u64>().ok())
                .map(|mb| mb * MB)
                .unwrap_or(defaults.cache_size_cap),
            caching_enabled: var("ALLOW_CACHING")
                .map(|s| !matches!(s.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(defaults.caching_enabled),
            ..defaults
        };
        cache.validate()?;

        let web_root = var("WEB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./wwwroot"));

        let path_mappings = parse_mappings(var("PATH_MAPPINGS"))?
            .into_iter()
            .map(|(prefix, dir)| (prefix, PathBuf::from(dir)))
            .collect();

        let remote_mappings = parse_mappings(var("REMOTE_MAPPINGS"))?
            .into_iter()
            .map(|(prefix, base)| {
                // A base without a trailing slash would drop its last segment on join
                let base = if base.ends_with('/') { base } else { format!("{}/", base) };
                Url::parse(&base)
                    .map(|url| (prefix, url))
                    .map_err(|e| ImageServerError::Config(format!("invalid remote base '{}': {}", base, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let rewrite_rules = match var("REWRITE_RULES") {
            Some(rules) => split_list(&rules)
                .map(|rule| {
                    RewriteRule::parse(rule).ok_or_else(|| {
                        ImageServerError::Config(format!("invalid rewrite rule '{}'", rule))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let default_cache_control = var("DEFAULT_CACHE_CONTROL")
            .unwrap_or_else(|| "public, max-age=2592000".to_string());

        Ok(Self {
            port,
            cache,
            web_root,
            path_mappings,
            remote_mappings,
            rewrite_rules,
            default_cache_control,
        })
    }

    /// Storage mounts: the web root at `/`, then each mapping
    pub fn mounts(&self) -> Vec<Mount> {
        let mut mounts = vec![Mount::new(
            "/",
            StorageBackend::Filesystem {
                root: self.web_root.clone(),
            },
        )];
        mounts.extend(self.path_mappings.iter().map(|(prefix, root)| {
            Mount::new(prefix.clone(), StorageBackend::Filesystem { root: root.clone() })
        }));
        mounts.extend(self.remote_mappings.iter().map(|(prefix, base)| {
            Mount::new(prefix.clone(), StorageBackend::Remote { base: base.clone() }).ignore_case()
        }));
        mounts
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse `/prefix=target,/other=target`
fn parse_mappings(value: Option<String>) -> Result<Vec<(String, String)>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    split_list(&value)
        .map(|pair| {
            let (prefix, target) = pair
                .split_once('=')
                .ok_or_else(|| ImageServerError::Config(format!("invalid mapping '{}'", pair)))?;
            if !prefix.starts_with('/') || target.is_empty() {
                return Err(ImageServerError::Config(format!("invalid mapping '{}'", pair)));
            }
            Ok((prefix.to_string(), target.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.cache.min_age_to_delete, Duration::from_secs(10));
        assert_eq!(config.cache.write_queue_memory_budget, 100 * MB);
        assert_eq!(config.cache.cache_size_cap, 1000 * MB);
        assert!(config.cache.caching_enabled);
        assert_eq!(config.default_cache_control, "public, max-age=2592000");
        assert_eq!(config.mounts().len(), 1);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PORT", "8080"),
            ("CACHE_DIR", "/var/cache/img"),
            ("MIN_AGE_TO_DELETE_SECS", "60"),
            ("WRITE_QUEUE_MEMORY_MB", "8"),
            ("CACHE_SIZE_MB", "64"),
            ("ALLOW_CACHING", "false"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.cache.cache_directory, PathBuf::from("/var/cache/img"));
        assert_eq!(config.cache.min_age_to_delete, Duration::from_secs(60));
        assert_eq!(config.cache.write_queue_memory_budget, 8 * MB);
        assert_eq!(config.cache.cache_size_cap, 64 * MB);
        assert!(!config.cache.caching_enabled);
    }

    #[test]
    fn test_mappings() {
        let config = config(&[
            ("PATH_MAPPINGS", "/folder=/srv/folder, /images=/srv/images"),
            ("REMOTE_MAPPINGS", "/remote=https://images.example.com/assets"),
            ("REWRITE_RULES", "/gallery:format=webp"),
        ])
        .unwrap();

        assert_eq!(config.path_mappings.len(), 2);
        assert_eq!(
            config.remote_mappings[0].1.as_str(),
            "https://images.example.com/assets/"
        );
        assert_eq!(config.rewrite_rules[0].key, "format");
        assert_eq!(config.mounts().len(), 4);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        assert!(matches!(
            config(&[("PATH_MAPPINGS", "folder-without-equals")]),
            Err(ImageServerError::Config(_))
        ));
        assert!(matches!(
            config(&[("REMOTE_MAPPINGS", "/r=not a url")]),
            Err(ImageServerError::Config(_))
        ));
        assert!(matches!(
            config(&[("CACHE_SIZE_MB", "0")]),
            Err(ImageServerError::Cache(_))
        ));
    }
}
