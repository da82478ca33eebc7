//! Client identifier generation and validation
//!
//! Identifiers double as subdomain labels, so they are restricted to the
//! characters allowed in a DNS label.

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

/// Length of generated client identifiers
pub const CLIENT_ID_LENGTH: usize = 10;

/// Longest identifier a client may request (DNS label limit)
pub const MAX_CLIENT_ID_LENGTH: usize = 63;

/// Client id errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientIdError {
    #[error("Client id is empty")]
    Empty,

    #[error("Client id is {0} characters long, maximum is 63")]
    TooLong(usize),

    #[error("Client id contains invalid character {0:?}")]
    InvalidCharacter(char),

    #[error("Client id must not start or end with '-'")]
    InvalidHyphen,
}

/// Generate a random, unguessable client id of lowercase alphanumerics
pub fn generate_client_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_LENGTH)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Check that `id` is usable as a client id and as a DNS label
pub fn validate_client_id(id: &str) -> Result<(), ClientIdError> {
    if id.is_empty() {
        return Err(ClientIdError::Empty);
    }

    if id.len() > MAX_CLIENT_ID_LENGTH {
        return Err(ClientIdError::TooLong(id.len()));
    }

    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(ClientIdError::InvalidCharacter(c));
    }

    if id.starts_with('-') || id.ends_with('-') {
        return Err(ClientIdError::InvalidHyphen);
    }

    Ok(())
}
