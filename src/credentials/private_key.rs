use std::fmt;
use std::io::Read;
use std::str::FromStr;

use age::x25519::Identity;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

/// Problems with the configured `PRIVATE_KEY` value.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("PRIVATE_KEY contains no age identities")]
    Empty,

    #[error("PRIVATE_KEY line {line}: {reason}")]
    Malformed { line: usize, reason: &'static str },
}

/// Why an artifact could not be decrypted.
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("artifact is not a readable age envelope: {0}")]
    Envelope(String),

    #[error("no configured identity matches the artifact recipients")]
    NoMatchingKey,

    #[error("payload decryption failed: {0}")]
    Payload(String),
}

/// The decryption identities for this consumer.
///
/// Accepts the contents of an age identity file: comment lines (`#`) and
/// blank lines are ignored, every other line must be an
/// `AGE-SECRET-KEY-1...` identity.  Several identities may be listed so a
/// producer key rotation can overlap.
pub struct KeyMaterial {
    identities: Vec<Identity>,
}

impl KeyMaterial {
    pub fn parse(key: &SecretString) -> Result<Self, KeyError> {
        let mut identities = Vec::new();
        for (idx, raw) in key.expose_secret().lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let identity = Identity::from_str(line).map_err(|reason| KeyError::Malformed {
                line: idx + 1,
                reason,
            })?;
            identities.push(identity);
        }
        Self::from_identities(identities)
    }

    pub fn from_identities(identities: Vec<Identity>) -> Result<Self, KeyError> {
        if identities.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self { identities })
    }

    /// Public recipients matching the identities, safe to log.
    pub fn recipients(&self) -> Vec<String> {
        self.identities
            .iter()
            .map(|i| i.to_public().to_string())
            .collect()
    }

    /// Open an age envelope.  CPU bound; callers on the async runtime should
    /// use `spawn_blocking`.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        // Anything rejected while reading the header means the bytes are not an
        // age file at all.
        let decryptor =
            age::Decryptor::new(ciphertext).map_err(|e| DecryptError::Envelope(e.to_string()))?;
        let mut reader = decryptor
            .decrypt(self.identities.iter().map(|i| i as &dyn age::Identity))
            .map_err(map_age_error)?;

        let mut plaintext = Vec::with_capacity(ciphertext.len());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| DecryptError::Payload(e.to_string()))?;

        debug!(
            ciphertext_bytes = ciphertext.len(),
            plaintext_bytes = plaintext.len(),
            "artifact decrypted"
        );
        Ok(plaintext)
    }
}

fn map_age_error(err: age::DecryptError) -> DecryptError {
    match err {
        age::DecryptError::NoMatchingKeys => DecryptError::NoMatchingKey,
        age::DecryptError::InvalidHeader | age::DecryptError::UnknownFormat => {
            DecryptError::Envelope(err.to_string())
        }
        other => DecryptError::Payload(other.to_string()),
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("recipients", &self.recipients())
            .finish()
    }
}
