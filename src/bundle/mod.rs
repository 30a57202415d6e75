//! Decryption and unpacking of snapshot artifacts.
//!
//! Turns the raw bytes of an artifact into a validated git bundle on local
//! scratch storage.  The scratch directory belongs to a single attempt and is
//! removed when the [`DecodedBundle`] is dropped.

pub mod header;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, instrument, warn};

pub use header::{parse_header, BundleHeader, HeaderError};

use crate::credentials::{DecryptError, KeyMaterial};
use crate::error::{Classify, ErrorClass};
use crate::storage::RepoPath;

/// Suffix that marks scratch directories created by this process.
const SCRATCH_SUFFIX: &str = ".partition-sync";
const BUNDLE_FILE: &str = "snapshot.bundle";

#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("decryption failed: {0}")]
    Decryption(#[from] DecryptError),

    #[error("corrupt bundle: {0}")]
    Corrupt(#[from] HeaderError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for UnpackError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Decryption(_) | Self::Io { .. } => ErrorClass::Retryable,
            Self::Corrupt(_) => ErrorClass::Permanent,
        }
    }
}

/// A validated bundle materialised in its own scratch directory.
#[derive(Debug)]
pub struct DecodedBundle {
    pub header: BundleHeader,
    /// Hex SHA-256 of the decrypted bundle.
    pub sha256: String,
    pub size: u64,
    path: PathBuf,
    scratch: TempDir,
}

impl DecodedBundle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory owned by this attempt; callers may create more files here.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

/// Decrypt `ciphertext`, validate the payload and write it under `workdir`.
#[instrument(skip(ciphertext, keys, target), fields(%target, bytes = ciphertext.len()))]
pub async fn decrypt_and_unpack(
    ciphertext: Bytes,
    keys: Arc<KeyMaterial>,
    workdir: &Path,
    target: &RepoPath,
) -> Result<DecodedBundle, UnpackError> {
    let (plaintext, header, sha256) = tokio::task::spawn_blocking(move || {
        let plaintext = keys.decrypt(&ciphertext)?;
        let header = parse_header(&plaintext)?;
        let sha256 = format!("{:x}", Sha256::digest(&plaintext));
        Ok::<_, UnpackError>((plaintext, header, sha256))
    })
    .await
    .map_err(|e| UnpackError::Io {
        context: "decrypt task failed".to_string(),
        source: std::io::Error::other(e),
    })??;

    tokio::fs::create_dir_all(workdir)
        .await
        .map_err(|source| UnpackError::Io {
            context: format!("create workdir {}", workdir.display()),
            source,
        })?;

    let scratch = tempfile::Builder::new()
        .prefix(&target.scratch_prefix())
        .suffix(SCRATCH_SUFFIX)
        .tempdir_in(workdir)
        .map_err(|source| UnpackError::Io {
            context: format!("create scratch dir in {}", workdir.display()),
            source,
        })?;

    let path = scratch.path().join(BUNDLE_FILE);
    tokio::fs::write(&path, &plaintext)
        .await
        .map_err(|source| UnpackError::Io {
            context: format!("write {}", path.display()),
            source,
        })?;

    debug!(
        path = %path.display(),
        refs = header.refs.len(),
        prerequisites = header.prerequisites.len(),
        %sha256,
        "bundle unpacked"
    );

    Ok(DecodedBundle {
        header,
        sha256,
        size: plaintext.len() as u64,
        path,
        scratch,
    })
}

/// Remove scratch directories left behind by an earlier process.
///
/// Only directories carrying this process's scratch suffix are touched.
#[instrument]
pub async fn sweep_workdir(workdir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(workdir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(SCRATCH_SUFFIX) {
            continue;
        }
        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove stale scratch dir"),
        }
    }
    if removed > 0 {
        debug!(removed, "stale scratch directories removed");
    }
    Ok(removed)
}
