//! Authentication primitives for the control channel
//!
//! The relay authenticates tunnel clients with a single shared secret and
//! hands each authenticated client a DNS-label safe identifier.

pub mod client_id;
pub mod secret;

pub use client_id::{generate_client_id, validate_client_id, ClientIdError, CLIENT_ID_LENGTH};
pub use secret::SharedSecret;
