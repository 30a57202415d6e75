//! Ref update planning.
//!
//! Pure comparison of the refs a bundle carries against the refs the mirror
//! currently has.  Ancestry has already been worked out by the caller and is
//! passed in as `refname -> remote tip is an ancestor of bundle tip`.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::UpdatePolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefUpdate {
    UpToDate,
    Create,
    FastForward { from: String },
    ForceUpdate { from: String },
    Diverged { from: String },
}

impl RefUpdate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpToDate => "up_to_date",
            Self::Create => "create",
            Self::FastForward { .. } => "fast_forward",
            Self::ForceUpdate { .. } => "force_update",
            Self::Diverged { .. } => "diverged",
        }
    }
}

/// One bundle ref and what applying it will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRef {
    pub refname: String,
    pub oid: String,
    pub update: RefUpdate,
}

impl PlannedRef {
    /// `git push` refspec for this ref, `None` when nothing needs pushing.
    pub fn refspec(&self) -> Option<String> {
        match self.update {
            RefUpdate::UpToDate | RefUpdate::Diverged { .. } => None,
            RefUpdate::Create | RefUpdate::FastForward { .. } => {
                Some(format!("{}:{}", self.oid, self.refname))
            }
            RefUpdate::ForceUpdate { .. } => Some(format!("+{}:{}", self.oid, self.refname)),
        }
    }
}

impl fmt::Display for PlannedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = |oid: &str| oid.chars().take(12).collect::<String>();
        match &self.update {
            RefUpdate::UpToDate => write!(f, "{} = {}", self.refname, short(&self.oid)),
            RefUpdate::Create => write!(f, "{} * {}", self.refname, short(&self.oid)),
            RefUpdate::FastForward { from } => {
                write!(f, "{} {}..{}", self.refname, short(from), short(&self.oid))
            }
            RefUpdate::ForceUpdate { from } | RefUpdate::Diverged { from } => {
                write!(f, "{} {}...{}", self.refname, short(from), short(&self.oid))
            }
        }
    }
}

/// Refs whose remote value differs from the bundle and that need an
/// ancestry check before they can be classified.
pub fn needs_ancestry<'a>(
    bundle_refs: impl IntoIterator<Item = (&'a str, &'a str)>,
    remote: &'a BTreeMap<String, String>,
) -> impl Iterator<Item = (&'a str, &'a str, &'a str)> {
    bundle_refs.into_iter().filter_map(move |(name, oid)| {
        let current = remote.get(name)?;
        (current != oid && !is_tag(name)).then_some((name, current.as_str(), oid))
    })
}

/// Fetch refspecs parking the remote tip of every ref in
/// [`needs_ancestry`] under `refs/mirror/`, whatever its namespace.
pub fn remote_tip_refspecs<'a>(
    bundle_refs: impl IntoIterator<Item = (&'a str, &'a str)>,
    remote: &'a BTreeMap<String, String>,
) -> Vec<String> {
    needs_ancestry(bundle_refs, remote)
        .map(|(name, _, _)| {
            let local = name.strip_prefix("refs/").unwrap_or(name);
            format!("+{name}:refs/mirror/{local}")
        })
        .collect()
}

/// Classify every bundle ref.
///
/// Tags are never fast-forwarded: git refuses to move an existing tag
/// without force, so a moved tag is treated like divergent history.
pub fn plan_updates<'a>(
    bundle_refs: impl IntoIterator<Item = (&'a str, &'a str)>,
    remote: &BTreeMap<String, String>,
    is_ancestor: &BTreeMap<String, bool>,
    policy: UpdatePolicy,
) -> Vec<PlannedRef> {
    bundle_refs
        .into_iter()
        .map(|(name, oid)| {
            let update = match remote.get(name) {
                None => RefUpdate::Create,
                Some(current) if current == oid => RefUpdate::UpToDate,
                Some(current) => {
                    let from = current.clone();
                    let ff = !is_tag(name) && is_ancestor.get(name).copied().unwrap_or(false);
                    match (ff, policy) {
                        (true, _) => RefUpdate::FastForward { from },
                        (false, UpdatePolicy::Force) => RefUpdate::ForceUpdate { from },
                        (false, UpdatePolicy::FastForwardOnly) => RefUpdate::Diverged { from },
                    }
                }
            };
            PlannedRef {
                refname: name.to_string(),
                oid: oid.to_string(),
                update,
            }
        })
        .collect()
}

fn is_tag(refname: &str) -> bool {
    refname.starts_with("refs/tags/")
}
