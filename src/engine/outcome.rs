//! Per-artifact outcomes and the aggregate pass result.

use std::fmt;
use std::time::Duration;

use crate::error::{Classify, ErrorClass};
use crate::mirror::ApplyReport;
use crate::storage::{RepoPath, StoreError};

/// Where an artifact's processing stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Target,
    Fetch,
    Unpack,
    Apply,
    Cancelled,
    /// The processing task itself died.
    Internal,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Target => "target",
            Self::Fetch => "fetch",
            Self::Unpack => "unpack",
            Self::Apply => "apply",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied { report: ApplyReport },
    Skipped { reason: String },
    Failed {
        stage: Stage,
        error: String,
        class: ErrorClass,
    },
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactOutcome {
    pub key: String,
    /// `None` when the key did not map to a repository.
    pub target: Option<RepoPath>,
    /// Bytes downloaded from the store for this artifact.
    pub downloaded: u64,
    pub outcome: Outcome,
}

impl ArtifactOutcome {
    pub(crate) fn failed<E: fmt::Display>(
        key: String,
        target: Option<RepoPath>,
        stage: Stage,
        error: &E,
        class: ErrorClass,
    ) -> Self {
        Self {
            key,
            target,
            downloaded: 0,
            outcome: Outcome::Failed {
                stage,
                error: error.to_string(),
                class,
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }
}

/// Everything one reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassResult {
    /// Sorted by artifact key.
    pub outcomes: Vec<ArtifactOutcome>,
    pub dry_run: bool,
    pub duration: Duration,
}

impl PassResult {
    pub fn summary(&self) -> PassSummary {
        let mut summary = PassSummary::default();
        for o in &self.outcomes {
            match &o.outcome {
                Outcome::Applied { .. } => summary.applied += 1,
                Outcome::Skipped { .. } => summary.skipped += 1,
                Outcome::Failed { class, .. } => {
                    summary.failed += 1;
                    summary.worst = Some(summary.worst.map_or(*class, |w| w.max(*class)));
                }
            }
        }
        summary
    }

    pub fn failures(&self) -> impl Iterator<Item = &ArtifactOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Most severe class among the failures.
    pub worst: Option<ErrorClass>,
}

impl PassSummary {
    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.failed
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} artifacts failed ({} applied, {} skipped)",
            self.failed,
            self.total(),
            self.applied,
            self.skipped
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("artifact discovery failed: {0}")]
    Discovery(#[source] StoreError),

    #[error("pass cancelled before processing started")]
    Cancelled,

    /// Some artifacts failed; `result` still holds every outcome.
    #[error("{summary}")]
    Artifacts {
        result: PassResult,
        summary: PassSummary,
    },
}

impl PassError {
    pub fn result(&self) -> Option<&PassResult> {
        match self {
            Self::Artifacts { result, .. } => Some(result),
            _ => None,
        }
    }
}

impl Classify for PassError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Discovery(e) => e.class(),
            Self::Cancelled => ErrorClass::Retryable,
            Self::Artifacts { summary, .. } => summary.worst.unwrap_or(ErrorClass::Retryable),
        }
    }
}
