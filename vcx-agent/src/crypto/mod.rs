//! Cryptographic primitives and the crypto provider capability
//!
//! - Concat KDF for ECDH key agreement
//! - AES Key Wrap per RFC 3394
//! - Multikey encoded public key references
//! - Authcrypt envelopes (ECDH-1PU+A256KW with A256GCM)

mod authcrypt;
pub mod envelope;
mod kdf;
mod key_wrap;
pub mod keys;
pub mod provider;

pub use envelope::{Envelope, EnvelopeRecipient, ProtectedHeader, DIDCOMM_ENCRYPTED};
pub use kdf::{derive_kek, derive_key, ECDH_1PU_A256KW};
pub use key_wrap::{unwrap_key_aes_kw, wrap_key_aes_kw};
pub use keys::{decode_multikey, encode_multikey, KeyBinding, KeyRef, KeyType};
pub use provider::{CryptoProvider, LocalCryptoProvider};
