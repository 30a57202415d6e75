//! Applying decoded bundles to mirror repositories.
//!
//! [`GitMirror`] resolves (or creates) the GitLab project for a target,
//! compares the bundle's refs with what the project has, and pushes the
//! difference atomically.  Under dry-run the same plan is computed and
//! returned but nothing on the hosting side changes.

pub mod plan;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

pub use plan::{PlannedRef, RefUpdate};

use crate::bundle::DecodedBundle;
use crate::config::UpdatePolicy;
use crate::credentials::PushCredential;
use crate::error::{Classify, ErrorClass};
use crate::forge::{ForgeBackend, ForgeError, MirrorRepo};
use crate::git::{self, PushError};
use crate::storage::RepoPath;

/// Local name of the scratch repository inside a bundle's scratch dir.
const SCRATCH_REPO: &str = "mirror.git";

// ---------------------------------------------------------------------------
// Report & errors
// ---------------------------------------------------------------------------

/// What an apply did (or, under dry-run, would do).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub project: String,
    /// The project was created by this apply, or would be under a dry run.
    pub created: bool,
    pub refs: Vec<PlannedRef>,
    /// Default branch set by this apply.
    pub default_branch: Option<String>,
    pub dry_run: bool,
}

impl ApplyReport {
    /// Nothing differed between the bundle and the mirror.
    pub fn is_noop(&self) -> bool {
        !self.created
            && self.default_branch.is_none()
            && self.refs.iter().all(|r| r.update == RefUpdate::UpToDate)
    }

    pub fn changed_refs(&self) -> usize {
        self.refs
            .iter()
            .filter(|r| r.update != RefUpdate::UpToDate)
            .count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("repository {path} not found and could not be created: {reason}")]
    RepositoryNotFoundOrCreateFailed { path: String, reason: String },

    #[error("push rejected: {0}")]
    PushRejected(String),

    #[error("history diverged on {}", refs.join(", "))]
    Diverged { refs: Vec<String> },

    #[error("transient mirror error: {0}")]
    Transient(String),
}

impl Classify for MirrorError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Auth(_) => ErrorClass::Fatal,
            Self::RepositoryNotFoundOrCreateFailed { .. }
            | Self::PushRejected(_)
            | Self::Diverged { .. } => ErrorClass::Permanent,
            Self::Transient(_) => ErrorClass::Retryable,
        }
    }
}

impl From<PushError> for MirrorError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::Auth(msg) => Self::Auth(msg),
            PushError::Rejected(msg) => Self::PushRejected(msg),
            PushError::Other(e) => Self::Transient(format!("{e:#}")),
        }
    }
}

fn forge_failure(err: ForgeError, path: &RepoPath) -> MirrorError {
    match err {
        ForgeError::Unauthorized { .. } => MirrorError::Auth(err.to_string()),
        ForgeError::Transient(msg) => MirrorError::Transient(msg),
        ForgeError::NotFound { .. } | ForgeError::AlreadyExists { .. } | ForgeError::Rejected { .. } => {
            MirrorError::RepositoryNotFoundOrCreateFailed {
                path: path.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// Map a failed git command that is not a push.
fn git_failure(err: anyhow::Error) -> MirrorError {
    let text = format!("{err:#}");
    if git::is_auth_failure(&text) {
        MirrorError::Auth(text)
    } else {
        MirrorError::Transient(text)
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MirrorClient: Send + Sync {
    /// Make the repository at `target` carry the refs of `bundle`.
    async fn apply(
        &self,
        target: &RepoPath,
        bundle: &DecodedBundle,
        dry_run: bool,
    ) -> Result<ApplyReport, MirrorError>;
}

// ---------------------------------------------------------------------------
// GitLab + git implementation
// ---------------------------------------------------------------------------

pub struct GitMirror {
    forge: Arc<dyn ForgeBackend>,
    credential: PushCredential,
    policy: UpdatePolicy,
    git_timeout: Duration,
}

impl GitMirror {
    pub fn new(
        forge: Arc<dyn ForgeBackend>,
        credential: PushCredential,
        policy: UpdatePolicy,
        git_timeout: Duration,
    ) -> Self {
        Self {
            forge,
            credential,
            policy,
            git_timeout,
        }
    }

    /// Find the project, creating it unless this is a dry run.
    ///
    /// Returns the project (if it exists now) and whether it was created.
    async fn resolve(
        &self,
        target: &RepoPath,
        dry_run: bool,
    ) -> Result<(Option<MirrorRepo>, bool), MirrorError> {
        if let Some(repo) = self
            .forge
            .find_project(target)
            .await
            .map_err(|e| forge_failure(e, target))?
        {
            return Ok((Some(repo), false));
        }
        if dry_run {
            info!(%target, "dry run: project would be created");
            return Ok((None, true));
        }
        match self.forge.create_project(target).await {
            Ok(repo) => Ok((Some(repo), true)),
            // Someone else created it between our lookup and create.
            Err(ForgeError::AlreadyExists { .. }) => {
                debug!(%target, "project appeared concurrently; resolving again");
                let repo = self
                    .forge
                    .find_project(target)
                    .await
                    .map_err(|e| forge_failure(e, target))?
                    .ok_or_else(|| MirrorError::RepositoryNotFoundOrCreateFailed {
                        path: target.to_string(),
                        reason: "project reported as taken but cannot be found".to_string(),
                    })?;
                Ok((Some(repo), false))
            }
            Err(e) => Err(forge_failure(e, target)),
        }
    }

    /// Clone URL with the push credential embedded for HTTP(S) remotes.
    fn remote_url(&self, repo: &MirrorRepo) -> Result<String, MirrorError> {
        if repo.http_url.starts_with("https://") || repo.http_url.starts_with("http://") {
            self.credential
                .authenticated_url(&repo.http_url)
                .map_err(|e| MirrorError::Transient(format!("invalid clone URL {}: {e}", repo.http_url)))
        } else {
            Ok(repo.http_url.clone())
        }
    }

    /// Bare repository holding the remote's current objects plus the
    /// bundle's, so ancestry can be tested and refs pushed from it.
    async fn prepare_scratch(
        &self,
        bundle: &DecodedBundle,
        remote_url: Option<&str>,
        remote_tips: &[String],
    ) -> Result<PathBuf, MirrorError> {
        let repo_dir = bundle.scratch_dir().join(SCRATCH_REPO);
        let secret = self.credential.token();

        git::git_init_bare(&repo_dir, self.git_timeout)
            .await
            .map_err(git_failure)?;
        if let (Some(url), false) = (remote_url, remote_tips.is_empty()) {
            let refspecs: Vec<&str> = remote_tips.iter().map(String::as_str).collect();
            git::git_fetch(&repo_dir, url, &refspecs, secret, self.git_timeout)
                .await
                .map_err(git_failure)?;
        }
        git::git_bundle_unbundle(bundle.path(), &repo_dir, self.git_timeout)
            .await
            .map_err(git_failure)?;
        Ok(repo_dir)
    }

    async fn ancestry(
        &self,
        scratch: &Path,
        bundle: &DecodedBundle,
        remote: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, bool>, MirrorError> {
        let mut result = BTreeMap::new();
        for (name, from, to) in plan::needs_ancestry(bundle.header.pushable_refs(), remote) {
            let ff = git::git_is_ancestor(scratch, from, to, self.git_timeout)
                .await
                .map_err(git_failure)?;
            result.insert(name.to_string(), ff);
        }
        Ok(result)
    }
}

#[async_trait]
impl MirrorClient for GitMirror {
    #[instrument(skip(self, target, bundle), fields(%target, policy = self.policy.as_str()))]
    async fn apply(
        &self,
        target: &RepoPath,
        bundle: &DecodedBundle,
        dry_run: bool,
    ) -> Result<ApplyReport, MirrorError> {
        let secret = self.credential.token();
        let (repo, created) = self.resolve(target, dry_run).await?;

        let remote_url = repo.as_ref().map(|r| self.remote_url(r)).transpose()?;
        let remote_refs = match &remote_url {
            Some(url) => git::git_ls_remote(url, secret, self.git_timeout)
                .await
                .map_err(git_failure)?,
            None => BTreeMap::new(),
        };

        let header = &bundle.header;
        let stale = header
            .pushable_refs()
            .any(|(name, oid)| remote_refs.get(name).map(String::as_str) != Some(oid));

        let scratch = if stale {
            let remote_tips = plan::remote_tip_refspecs(header.pushable_refs(), &remote_refs);
            Some(
                self.prepare_scratch(bundle, remote_url.as_deref(), &remote_tips)
                    .await?,
            )
        } else {
            None
        };
        let ancestry = match &scratch {
            Some(dir) => self.ancestry(dir, bundle, &remote_refs).await?,
            None => BTreeMap::new(),
        };

        let refs = plan::plan_updates(header.pushable_refs(), &remote_refs, &ancestry, self.policy);
        let diverged: Vec<String> = refs
            .iter()
            .filter(|r| matches!(r.update, RefUpdate::Diverged { .. }))
            .map(|r| r.refname.clone())
            .collect();
        if !diverged.is_empty() {
            warn!(refs = ?diverged, "mirror history diverged; nothing pushed");
            return Err(MirrorError::Diverged { refs: diverged });
        }

        let current_default = repo.as_ref().and_then(|r| r.default_branch.as_deref());
        let default_branch = header
            .head_branch()
            .filter(|branch| current_default != Some(*branch))
            .map(str::to_string);

        let report = ApplyReport {
            project: repo
                .as_ref()
                .map_or_else(|| target.to_string(), |r| r.path_with_namespace.clone()),
            created,
            refs,
            default_branch,
            dry_run,
        };

        for planned in report.refs.iter().filter(|r| r.update != RefUpdate::UpToDate) {
            debug!(update = planned.update.as_str(), "{planned}");
        }

        if dry_run || report.is_noop() {
            return Ok(report);
        }
        let (Some(repo), Some(url)) = (repo.as_ref(), remote_url.as_deref()) else {
            return Ok(report);
        };

        let refspecs: Vec<String> = report.refs.iter().filter_map(PlannedRef::refspec).collect();
        if let Some(dir) = scratch.as_deref().filter(|_| !refspecs.is_empty()) {
            git::git_push(dir, url, &refspecs, secret, self.git_timeout).await?;
            info!(pushed = refspecs.len(), "refs pushed");
        }

        if let Some(branch) = &report.default_branch {
            self.forge
                .set_default_branch(repo, branch)
                .await
                .map_err(|e| forge_failure(e, target))?;
        }

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
