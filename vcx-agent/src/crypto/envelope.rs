//! Encrypted DIDComm envelope (JWE general JSON serialization).
//!
//! The rest of the framework treats [`Envelope`] as opaque; only the
//! crypto provider looks inside it.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Media type of an encrypted DIDComm message.
pub const DIDCOMM_ENCRYPTED: &str = "application/didcomm-encrypted+json";

/// Content encryption algorithm.
pub const ENC_A256GCM: &str = "A256GCM";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Base64url protected header.
    pub protected: String,
    pub recipients: Vec<EnvelopeRecipient>,
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeRecipient {
    pub encrypted_key: String,
    pub header: RecipientHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientHeader {
    pub kid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub typ: String,
    pub alg: String,
    pub enc: String,
    /// Sender key id (DID URL).
    pub skid: String,
    pub epk: EphemeralPublicKey,
    pub apu: String,
    pub apv: String,
}

/// Ephemeral X25519 key in JWK form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralPublicKey {
    pub kty: String,
    pub crv: String,
    pub x: String,
}

impl Envelope {
    /// Decode the protected header.
    pub fn protected_header(&self) -> Result<ProtectedHeader, CryptoError> {
        let bytes = b64_decode(&self.protected)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("protected header: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("protected header: {}", e)))
    }

    /// Sender key id from the protected header.
    pub fn sender_kid(&self) -> Result<String, CryptoError> {
        Ok(self.protected_header()?.skid)
    }

    /// Key ids of all recipients.
    pub fn recipient_kids(&self) -> Vec<&str> {
        self.recipients
            .iter()
            .map(|r| r.header.kid.as_str())
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

pub(crate) fn b64_encode(bytes: impl AsRef<[u8]>) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn b64_decode(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(value.trim_end_matches('='))
}
