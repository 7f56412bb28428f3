//! Error types for the vcx-agent crate.
//!
//! [`CryptoError`] and [`DidError`] are raw failures of the crypto provider
//! and the DID resolvers. They never leave this crate on their own: the
//! [`MessagingError`] variants name the action that failed and keep the raw
//! failure as their source.

use thiserror::Error;

/// Failures raised by the crypto provider and the envelope primitives.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Key wrap failed: {0}")]
    KeyWrap(String),

    #[error("Content encryption failed: {0}")]
    Encryption(String),

    /// Tag, wrapped key or key mismatch detected while decrypting.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No recipient in envelope matches a local key")]
    NoMatchingRecipient,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Key store error: {0}")]
    KeyStore(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures raised while parsing or resolving DIDs.
#[derive(Error, Debug)]
pub enum DidError {
    #[error("Invalid DID: {0}")]
    InvalidDid(String),

    #[error("Unsupported DID method: {0}")]
    UnsupportedMethod(String),

    #[error("DID not found: {0}")]
    NotFound(String),

    #[error("Invalid DID document: {0}")]
    InvalidDocument(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors of the messaging module.
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("error resolving DID `{did}`")]
    DidResolution {
        did: String,
        #[source]
        source: DidError,
    },

    #[error("DID document of `{did}` has no usable DIDComm service")]
    InvalidDidDocService { did: String },

    #[error("DID document of `{did}` has no key agreement key")]
    MissingKeyAgreement { did: String },

    #[error("error encrypting message")]
    EncryptMessage {
        #[source]
        source: CryptoError,
    },

    #[error("error decrypting message")]
    DecryptMessage {
        #[source]
        source: CryptoError,
    },

    #[error("error resolving sender peer DID `{did}`")]
    DidResolutionPeerDid {
        did: String,
        #[source]
        source: DidError,
    },

    #[error("error parsing envelope")]
    InvalidEnvelope {
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, MessagingError>;
