//! Object storage access for partition snapshots.
//!
//! The engine talks to an [`ArtifactStore`]; [`s3::S3ArtifactStore`] is the
//! production implementation.  Listing is restartable and carries no cursor
//! state between passes.

pub mod artifact;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;

pub use artifact::{RepoPath, SyncArtifact};
pub use s3::S3ArtifactStore;

use crate::error::{Classify, ErrorClass};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("access denied by object store ({code}): {message}")]
    AccessDenied { code: String, message: String },

    #[error("transient object store error: {0}")]
    Transient(String),
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::AccessDenied { .. } => ErrorClass::Fatal,
            // A listed object that vanished before the fetch is expected to
            // be replaced by the producer; look again next pass.
            Self::NotFound { .. } | Self::Transient(_) => ErrorClass::Retryable,
        }
    }
}

/// Read-only view of the shared snapshot bucket.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<SyncArtifact>, StoreError>;

    /// The full body of the object at `key`.
    async fn fetch(&self, key: &str) -> Result<Bytes, StoreError>;
}
