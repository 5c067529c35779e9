//! Request canonicalization
//!
//! An [`ImageRequest`] is never mutated in place. Presets, rewrite rules and
//! command defaults are applied as an ordered list of steps, each producing a
//! new request, so the final command set (and so the fingerprint) depends
//! only on the incoming path and query.

use crate::error::{ImageServerError, Result};
use std::collections::{BTreeMap, HashMap};

/// Commands that actually change the output bytes
const TRANSFORM_COMMANDS: &[&str] = &["width", "height", "mode", "format", "quality", "f.sharpen"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    path: String,
    commands: BTreeMap<String, String>,
}

impl ImageRequest {
    /// Keys are case-insensitive and stored lowercased
    pub fn new<I, K, V>(path: impl Into<String>, commands: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            path: path.into(),
            commands: commands
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn commands(&self) -> &BTreeMap<String, String> {
        &self.commands
    }

    pub fn command(&self, key: &str) -> Option<&str> {
        self.commands.get(key).map(String::as_str)
    }

    pub fn with_command(&self, key: &str, value: &str) -> Self {
        let mut next = self.clone();
        next.commands.insert(key.to_string(), value.to_string());
        next
    }

    pub fn with_default(&self, key: &str, value: &str) -> Self {
        if self.commands.contains_key(key) {
            return self.clone();
        }
        self.with_command(key, value)
    }

    pub fn without_command(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.commands.remove(key);
        next
    }

    /// `k=v&k=v` with keys in sorted order
    pub fn canonical_query(&self) -> String {
        self.commands
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// True when the output differs from the source bytes
    pub fn transforms(&self) -> bool {
        TRANSFORM_COMMANDS
            .iter()
            .any(|key| self.commands.contains_key(*key))
    }
}

/// Forces a command on every request under a path prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub prefix: String,
    pub key: String,
    pub value: String,
}

impl RewriteRule {
    /// Parse `/prefix:key=value`
    pub fn parse(s: &str) -> Option<Self> {
        let (prefix, assignment) = s.trim().rsplit_once(':')?;
        let (key, value) = assignment.split_once('=')?;
        if prefix.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self {
            prefix: prefix.to_string(),
            key: key.to_ascii_lowercase(),
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
enum Step {
    ExpandPreset(HashMap<String, Vec<(String, String)>>),
    Rewrite(RewriteRule),
    Defaults(Vec<(String, String)>),
}

impl Step {
    fn apply(&self, request: ImageRequest) -> Result<ImageRequest> {
        match self {
            Step::ExpandPreset(presets) => {
                let Some(name) = request.command("preset").map(str::to_string) else {
                    return Ok(request);
                };
                let commands = presets.get(&name).ok_or_else(|| {
                    ImageServerError::BadRequest(format!("unknown preset '{}'", name))
                })?;
                Ok(commands
                    .iter()
                    .fold(request.without_command("preset"), |req, (k, v)| {
                        req.with_default(k, v)
                    }))
            }
            Step::Rewrite(rule) => {
                if request.path().starts_with(&rule.prefix) {
                    Ok(request.with_command(&rule.key, &rule.value))
                } else {
                    Ok(request)
                }
            }
            // Only requests that are already being processed pick up defaults
            Step::Defaults(defaults) => {
                if !request.transforms() {
                    return Ok(request);
                }
                Ok(defaults
                    .iter()
                    .fold(request, |req, (k, v)| req.with_default(k, v)))
            }
        }
    }
}

/// Ordered canonicalization steps
#[derive(Debug, Clone)]
pub struct RequestPipeline {
    steps: Vec<Step>,
}

impl RequestPipeline {
    pub fn new(rewrites: Vec<RewriteRule>) -> Self {
        let mut presets = HashMap::new();
        presets.insert(
            "large".to_string(),
            pairs(&[("width", "1024"), ("height", "1024"), ("mode", "max")]),
        );

        let mut steps = vec![Step::ExpandPreset(presets)];
        steps.extend(rewrites.into_iter().map(Step::Rewrite));
        steps.push(Step::Defaults(pairs(&[
            ("down.filter", "mitchell"),
            ("f.sharpen", "15"),
            ("webp.quality", "90"),
            ("ignore_icc_errors", "true"),
        ])));

        Self { steps }
    }

    pub fn apply(&self, request: ImageRequest) -> Result<ImageRequest> {
        self.steps
            .iter()
            .try_fold(request, |request, step| step.apply(request))
    }
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
