//! Secret material used during a pass.
//!
//! Holds the age identities that open producer envelopes, and builds the
//! token-bearing push URLs for the Git hosting side.

pub mod private_key;
pub mod upstream;

pub use private_key::{DecryptError, KeyError, KeyMaterial};
pub use upstream::PushCredential;
