//! Error types for the vcx-msg crate.

use std::result;
use thiserror::Error;

/// Errors raised while building, parsing or validating plain messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Error related to serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A body failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The message type is not one this crate understands, or does not
    /// match the body it is being decoded into.
    #[error("Invalid message type: {0}")]
    InvalidMessageType(String),

    /// A required header (thid, pthid, from, ...) is missing.
    #[error("Missing header `{0}` on message {1}")]
    MissingHeader(&'static str, String),

    /// An attachment could not be decoded.
    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),
}

/// Custom Result type for message operations.
pub type Result<T> = result::Result<T, Error>;
