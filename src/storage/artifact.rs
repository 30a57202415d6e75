//! Artifact key layout and target repository mapping.
//!
//! Keys look like `{prefix}{shard}/{repo path}.bundle.enc`, for example
//! `shard/fedramp/platform/api.bundle.enc`.  The repository path is derived
//! from the key alone, so the same key always maps to the same mirror.

use std::fmt;

use chrono::{DateTime, Utc};

/// Suffix every snapshot object carries.
pub const ARTIFACT_SUFFIX: &str = ".bundle.enc";

/// One pending unit of work discovered in object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncArtifact {
    pub key: String,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

impl SyncArtifact {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            etag: None,
            last_modified: None,
            size: None,
        }
    }
}

/// Reasons a key cannot be mapped to a mirror repository.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("key {key} is outside shard prefix {prefix}")]
    OutsideShard { key: String, prefix: String },

    #[error("key {0} does not end with {ARTIFACT_SUFFIX}")]
    NotAnArtifact(String),

    #[error("invalid repository path segment {segment:?} in key {key}")]
    InvalidSegment { key: String, segment: String },
}

/// Destination repository path on the Git hosting side, e.g. `group/repo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoPath(String);

impl RepoPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace part (everything before the last `/`).
    pub fn namespace(&self) -> &str {
        self.0.rsplit_once('/').map(|(ns, _)| ns).unwrap_or("")
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.0.rsplit_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }

    /// File-system friendly form used to prefix scratch directories.
    pub fn scratch_prefix(&self) -> String {
        format!("{}-", self.0.replace('/', "__"))
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// True when `key` lies under `shard_prefix`.  Matching is by whole path
/// component: `shard/fedramp/` never matches `shard/fedramp-dev/x`.
pub fn in_shard(key: &str, shard_prefix: &str) -> bool {
    debug_assert!(shard_prefix.ends_with('/'));
    key.starts_with(shard_prefix) && key.len() > shard_prefix.len()
}

/// True when `key` names a snapshot object (and not, say, a folder marker).
pub fn is_artifact_key(key: &str) -> bool {
    key.ends_with(ARTIFACT_SUFFIX) && !key.ends_with('/')
}

/// Map an artifact key to its mirror repository.
///
/// Single-segment paths are placed under `default_namespace`.
pub fn target_for_key(
    key: &str,
    shard_prefix: &str,
    default_namespace: &str,
) -> Result<RepoPath, TargetError> {
    if !in_shard(key, shard_prefix) {
        return Err(TargetError::OutsideShard {
            key: key.to_string(),
            prefix: shard_prefix.to_string(),
        });
    }
    let relative = key[shard_prefix.len()..]
        .strip_suffix(ARTIFACT_SUFFIX)
        .ok_or_else(|| TargetError::NotAnArtifact(key.to_string()))?;

    for segment in relative.split('/') {
        if !valid_segment(segment) {
            return Err(TargetError::InvalidSegment {
                key: key.to_string(),
                segment: segment.to_string(),
            });
        }
    }

    let path = if relative.contains('/') || default_namespace.is_empty() {
        relative.to_string()
    } else {
        format!("{default_namespace}/{relative}")
    };
    Ok(RepoPath(path))
}

/// GitLab path segment rules: alphanumerics, `_`, `-`, `.`; may not start
/// with `-` or `.`, may not end in `.git` or `.atom`.
fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !segment.starts_with(['-', '.'])
        && !segment.ends_with(".git")
        && !segment.ends_with(".atom")
}
