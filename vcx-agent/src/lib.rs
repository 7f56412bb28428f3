//! VCX agent layer
//!
//! DID documents and resolution (`did:key`, `did:peer:2`), the crypto
//! provider capability with its in-memory key store, authcrypt envelopes,
//! and the stateless Messaging Module that ties them together.

/// Cryptographic primitives and the crypto provider
pub mod crypto;

/// DID documents and resolvers
pub mod did;

/// Error types
pub mod error;

/// Envelope encryption and decryption
pub mod messaging;

pub use crypto::{CryptoProvider, Envelope, KeyBinding, KeyRef, LocalCryptoProvider};
pub use did::{
    create_peer_did_2, DIDMethodResolver, DidDoc, DidResolver, KeyResolver, MultiResolver,
    PeerResolver, Service, StaticResolver, VerificationMethod,
};
pub use error::{CryptoError, DidError, MessagingError, Result};
pub use messaging::{EncryptedMessage, MessagingModule};

/// Version of the VCX agent layer
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
