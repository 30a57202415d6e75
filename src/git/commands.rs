//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the system `git` binary.
//! Each invocation is bounded by a timeout and the child is killed if the
//! future is dropped, so a hung remote cannot block shutdown.  Credentials
//! travel inside URLs; `secret` parameters are scrubbed from any error text.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::credentials::upstream::redact;

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Spawn `git <args>` and wait for it, failing after `timeout`.
async fn run_git<I, S>(args: I, timeout: Duration, what: &str) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new("git");
    cmd.args(args);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    debug!("spawning git {what}");

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(output) => output.with_context(|| format!("failed to spawn git {what}")),
        Err(_) => bail!("git {what} timed out after {}s", timeout.as_secs()),
    }
}

fn stderr_of(output: &Output, secret: &str) -> String {
    redact(String::from_utf8_lossy(&output.stderr).trim(), secret)
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Run `git init --bare <path>`.
#[instrument(fields(path = %path.display()))]
pub async fn git_init_bare(path: &Path, timeout: Duration) -> Result<()> {
    let output = run_git(
        [OsStr::new("init"), OsStr::new("--bare"), OsStr::new("--quiet"), path.as_os_str()],
        timeout,
        "init --bare",
    )
    .await?;

    if !output.status.success() {
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr_of(&output, ""),
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ls-remote
// ---------------------------------------------------------------------------

/// Run `git ls-remote <url>` and return `ref_name -> object_id`.
///
/// Peeled tag entries (`refs/tags/x^{}`) and `HEAD` are left out.
#[instrument(skip(url, secret))]
pub async fn git_ls_remote(
    url: &str,
    secret: &str,
    timeout: Duration,
) -> Result<BTreeMap<String, String>> {
    let output = run_git(["ls-remote", url], timeout, "ls-remote").await?;

    if !output.status.success() {
        bail!(
            "git ls-remote failed (status {}): {}",
            output.status,
            stderr_of(&output, secret),
        );
    }

    let refs = parse_ls_remote(&String::from_utf8_lossy(&output.stdout));
    debug!(ref_count = refs.len(), "git ls-remote complete");
    Ok(refs)
}

fn parse_ls_remote(stdout: &str) -> BTreeMap<String, String> {
    let mut refs = BTreeMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Format: "<oid>\t<refname>"
        if let Some((oid, refname)) = line.split_once('\t') {
            let refname = refname.trim();
            if refname == "HEAD" || refname.ends_with("^{}") {
                continue;
            }
            refs.insert(refname.to_string(), oid.trim().to_ascii_lowercase());
        }
    }
    refs
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Run `git fetch --no-tags <remote_url> <refspecs...>` inside a bare repo.
#[instrument(skip(remote_url, secret), fields(repo = %repo_path.display()))]
pub async fn git_fetch(
    repo_path: &Path,
    remote_url: &str,
    refspecs: &[&str],
    secret: &str,
    timeout: Duration,
) -> Result<()> {
    let mut args: Vec<&OsStr> = vec![
        OsStr::new("-C"),
        repo_path.as_os_str(),
        OsStr::new("fetch"),
        OsStr::new("--quiet"),
        OsStr::new("--no-tags"),
        OsStr::new(remote_url),
    ];
    args.extend(refspecs.iter().map(OsStr::new));

    let output = run_git(args, timeout, "fetch").await?;

    if !output.status.success() {
        bail!(
            "git fetch failed (status {}): {}",
            output.status,
            stderr_of(&output, secret),
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Bundle unbundle
// ---------------------------------------------------------------------------

/// Run `git bundle unbundle <bundle_path>` inside a bare repo.
///
/// Stores the bundle's objects; fails when prerequisites are missing.
#[instrument(fields(bundle = %bundle_path.display(), repo = %repo_path.display()))]
pub async fn git_bundle_unbundle(
    bundle_path: &Path,
    repo_path: &Path,
    timeout: Duration,
) -> Result<()> {
    let output = run_git(
        [
            OsStr::new("-C"),
            repo_path.as_os_str(),
            OsStr::new("bundle"),
            OsStr::new("unbundle"),
            bundle_path.as_os_str(),
        ],
        timeout,
        "bundle unbundle",
    )
    .await?;

    if !output.status.success() {
        bail!(
            "git bundle unbundle failed (status {}): {}",
            output.status,
            stderr_of(&output, ""),
        );
    }

    debug!("git bundle unbundle succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Ancestry
// ---------------------------------------------------------------------------

/// `git merge-base --is-ancestor <ancestor> <descendant>`.
///
/// An `ancestor` object that is not present locally is reported as not an
/// ancestor.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_is_ancestor(
    repo_path: &Path,
    ancestor: &str,
    descendant: &str,
    timeout: Duration,
) -> Result<bool> {
    if !git_has_commit(repo_path, ancestor, timeout).await? {
        return Ok(false);
    }

    let output = run_git(
        [
            OsStr::new("-C"),
            repo_path.as_os_str(),
            OsStr::new("merge-base"),
            OsStr::new("--is-ancestor"),
            OsStr::new(ancestor),
            OsStr::new(descendant),
        ],
        timeout,
        "merge-base --is-ancestor",
    )
    .await?;

    // Exit 0: ancestor, 1: not an ancestor, anything else: error.
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => bail!(
            "git merge-base --is-ancestor failed (status {}): {}",
            output.status,
            stderr_of(&output, ""),
        ),
    }
}

/// `git cat-file -e <oid>^{commit}`.
async fn git_has_commit(repo_path: &Path, oid: &str, timeout: Duration) -> Result<bool> {
    let spec = format!("{oid}^{{commit}}");
    let output = run_git(
        [
            OsStr::new("-C"),
            repo_path.as_os_str(),
            OsStr::new("cat-file"),
            OsStr::new("-e"),
            OsStr::new(&spec),
        ],
        timeout,
        "cat-file -e",
    )
    .await?;
    Ok(output.status.success())
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Why a push did not go through.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("remote rejected the push: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Run `git push --atomic --porcelain <url> <refspecs...>` from a bare repo.
#[instrument(skip(remote_url, secret), fields(repo = %repo_path.display(), refs = refspecs.len()))]
pub async fn git_push(
    repo_path: &Path,
    remote_url: &str,
    refspecs: &[String],
    secret: &str,
    timeout: Duration,
) -> std::result::Result<(), PushError> {
    let mut args: Vec<&OsStr> = vec![
        OsStr::new("-C"),
        repo_path.as_os_str(),
        OsStr::new("push"),
        OsStr::new("--atomic"),
        OsStr::new("--porcelain"),
        OsStr::new(remote_url),
    ];
    args.extend(refspecs.iter().map(OsStr::new));

    let output = run_git(args, timeout, "push").await?;

    if output.status.success() {
        debug!("git push succeeded");
        return Ok(());
    }

    let stdout = redact(String::from_utf8_lossy(&output.stdout).trim(), secret);
    let stderr = stderr_of(&output, secret);
    Err(classify_push_failure(&stdout, &stderr))
}

const AUTH_MARKERS: &[&str] = &[
    "authentication failed",
    "http basic: access denied",
    "the requested url returned error: 401",
    "the requested url returned error: 403",
    "you are not allowed to push code",
    "invalid username or password",
];

/// Whether git output reports rejected credentials.
pub fn is_auth_failure(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    AUTH_MARKERS.iter().any(|m| lower.contains(m))
}

/// Sort a failed push into auth / remote-policy / other.
fn classify_push_failure(stdout: &str, stderr: &str) -> PushError {
    let combined = format!("{stdout}\n{stderr}");
    let lower = combined.to_ascii_lowercase();

    const REJECT_MARKERS: &[&str] = &[
        "[remote rejected]",
        "protected branch",
        "pre-receive hook declined",
        "[rejected]",
    ];

    // GitLab's protected-branch refusal also says "not allowed to push code",
    // so remote policy markers take precedence over credential markers.
    if REJECT_MARKERS.iter().any(|m| lower.contains(m)) {
        let detail = combined
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with('!') || l.contains("rejected") || l.contains("protected"))
            .collect::<Vec<_>>()
            .join("; ");
        return PushError::Rejected(if detail.is_empty() { stderr.to_string() } else { detail });
    }
    if is_auth_failure(&combined) {
        return PushError::Auth(stderr.to_string());
    }
    PushError::Other(anyhow::anyhow!("git push failed: {stderr}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ls_remote_skips_head_and_peeled() {
        let stdout = "\
AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\tHEAD
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\trefs/heads/main
bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb\trefs/tags/v1
cccccccccccccccccccccccccccccccccccccccc\trefs/tags/v1^{}
";
        let refs = parse_ls_remote(stdout);
        assert_eq!(refs.len(), 2);
        assert_eq!(
            refs.get("refs/heads/main").map(String::as_str),
            Some("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
        );
        assert!(refs.contains_key("refs/tags/v1"));
    }

    #[test]
    fn parse_ls_remote_empty_repo() {
        assert!(parse_ls_remote("").is_empty());
    }

    #[test]
    fn push_auth_failure_classified() {
        let err = classify_push_failure(
            "",
            "remote: HTTP Basic: Access denied\nfatal: Authentication failed for 'https://gitlab.example.com/x.git/'",
        );
        assert!(matches!(err, PushError::Auth(_)));
    }

    #[test]
    fn push_protected_branch_classified() {
        let stdout = "To https://gitlab.example.com/m/repo.git\n!\trefs/heads/main:refs/heads/main\t[remote rejected] (pre-receive hook declined)\nDone";
        let stderr = "remote: GitLab: You are not allowed to force push code to a protected branch on this project.";
        // "not allowed to force push" is a policy rejection, not an auth failure.
        let err = classify_push_failure(stdout, stderr);
        match err {
            PushError::Rejected(detail) => assert!(detail.contains("remote rejected")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn gitlab_protected_branch_message_is_not_auth() {
        let stdout = "To https://gitlab.example.com/m/repo.git\n!\trefs/heads/main:refs/heads/main\t[remote rejected] (pre-receive hook declined)\nDone";
        let stderr = "remote: GitLab: You are not allowed to push code to protected branches on this project.\nTo https://gitlab.example.com/m/repo.git\n ! [remote rejected] main -> main (pre-receive hook declined)\nerror: failed to push some refs";
        assert!(matches!(classify_push_failure(stdout, stderr), PushError::Rejected(_)));

        // Same message without porcelain output still reads as a policy refusal.
        let stderr = "remote: GitLab: You are not allowed to push code to protected branches on this project.";
        assert!(matches!(classify_push_failure("", stderr), PushError::Rejected(_)));
    }

    #[test]
    fn push_without_project_access_is_auth() {
        let stderr = "remote: You are not allowed to push code to this project.\nfatal: unable to access 'https://gitlab.example.com/m/repo.git/': The requested URL returned error: 403";
        assert!(matches!(classify_push_failure("", stderr), PushError::Auth(_)));
    }

    #[test]
    fn push_network_failure_is_other() {
        let err = classify_push_failure("", "fatal: unable to access: Could not resolve host");
        assert!(matches!(err, PushError::Other(_)));
    }

    #[tokio::test]
    async fn init_and_ancestry_on_empty_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("scratch.git");
        if git_init_bare(&repo, Duration::from_secs(30)).await.is_err() {
            // No git binary in this environment.
            return;
        }
        assert!(repo.join("HEAD").is_file());
        let missing = "1111111111111111111111111111111111111111";
        assert!(!git_is_ancestor(&repo, missing, missing, Duration::from_secs(30))
            .await
            .unwrap());
    }
}
