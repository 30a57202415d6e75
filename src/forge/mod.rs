//! Forge API abstraction.
//!
//! [`ForgeBackend`] covers the project-level calls the mirror needs: look a
//! project up, create it, and move its default branch.  Git transport
//! itself goes through the `git` binary, not through this trait.

pub mod gitlab;
pub mod rate_limit;

use async_trait::async_trait;

pub use gitlab::GitLabBackend;

use crate::storage::RepoPath;

/// A project on the hosting side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRepo {
    pub id: u64,
    pub path_with_namespace: String,
    /// HTTPS clone URL without credentials.
    pub http_url: String,
    /// `None` for a project with no commits yet.
    pub default_branch: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("forge rejected credentials (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{what} already exists")]
    AlreadyExists { what: String },

    #[error("forge refused request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transient forge error: {0}")]
    Transient(String),
}

#[async_trait]
pub trait ForgeBackend: Send + Sync {
    /// Look up a project by full path; `Ok(None)` when it does not exist.
    async fn find_project(&self, path: &RepoPath) -> Result<Option<MirrorRepo>, ForgeError>;

    /// Create a private project at `path` inside an existing namespace.
    async fn create_project(&self, path: &RepoPath) -> Result<MirrorRepo, ForgeError>;

    async fn set_default_branch(&self, repo: &MirrorRepo, branch: &str) -> Result<(), ForgeError>;
}
