//! Shared secret verification

use sha2::digest::Output;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

/// Secret shared between the relay and its tunnel clients
///
/// Only the SHA-256 digest is kept. Candidates are hashed and compared in
/// constant time, so neither the content nor the length of the secret leaks
/// through timing.
#[derive(Clone)]
pub struct SharedSecret {
    digest: Output<Sha256>,
}

impl SharedSecret {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            digest: Sha256::digest(secret.as_ref()),
        }
    }

    /// Returns true if `candidate` matches the configured secret
    pub fn verify(&self, candidate: impl AsRef<[u8]>) -> bool {
        let candidate = Sha256::digest(candidate.as_ref());
        self.digest.as_slice().ct_eq(candidate.as_slice()).into()
    }
}

impl From<&str> for SharedSecret {
    fn from(secret: &str) -> Self {
        Self::new(secret)
    }
}

impl From<String> for SharedSecret {
    fn from(secret: String) -> Self {
        Self::new(secret)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}
