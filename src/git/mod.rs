//! Git command wrappers.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.  HTTPS credentials are injected by URL
//! rewriting and scrubbed from anything that is returned.

pub mod commands;

pub use commands::{
    git_bundle_unbundle, git_fetch, git_init_bare, git_is_ancestor, git_ls_remote, git_push,
    is_auth_failure, PushError,
};
