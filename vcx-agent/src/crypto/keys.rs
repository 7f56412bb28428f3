//! Key references and multikey encoding.
//!
//! Public keys travel as multibase (base58btc) strings prefixed with their
//! multicodec code, the same encoding used by `did:key` and `did:peer`.

use multibase::Base;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CryptoError;

/// Multicodec prefix of an X25519 public key (varint of 0xec).
pub const X25519_PUB_CODEC: [u8; 2] = [0xec, 0x01];

/// Multicodec prefix of an Ed25519 public key (varint of 0xed).
pub const ED25519_PUB_CODEC: [u8; 2] = [0xed, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    X25519,
    Ed25519,
}

impl KeyType {
    /// Verification method type used in DID documents.
    pub fn verification_method_type(&self) -> &'static str {
        match self {
            KeyType::X25519 => "X25519KeyAgreementKey2020",
            KeyType::Ed25519 => "Ed25519VerificationKey2020",
        }
    }
}

/// Multibase-encoded public key identifying a key pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyRef(String);

impl KeyRef {
    /// Wrap an already encoded multikey, checking that it decodes.
    pub fn parse(multikey: &str) -> Result<Self, CryptoError> {
        decode_multikey(multikey)?;
        Ok(Self(multikey.to_string()))
    }

    /// Encode a raw X25519 public key.
    pub fn from_x25519(public: &[u8; 32]) -> Self {
        Self(encode_multikey(KeyType::X25519, public))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw X25519 public key bytes.
    pub fn x25519_bytes(&self) -> Result<[u8; 32], CryptoError> {
        match decode_multikey(&self.0)? {
            (KeyType::X25519, bytes) => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&bytes);
                Ok(out)
            }
            (other, _) => Err(CryptoError::InvalidKey(format!(
                "{} is a {:?} key, X25519 required",
                self.0, other
            ))),
        }
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A public key together with the DID URL naming it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBinding {
    /// Verification method id (`did#fragment`).
    pub kid: String,
    pub key: KeyRef,
}

impl KeyBinding {
    pub fn new(kid: impl Into<String>, key: KeyRef) -> Self {
        Self {
            kid: kid.into(),
            key,
        }
    }
}

pub fn encode_multikey(key_type: KeyType, public: &[u8]) -> String {
    let codec = match key_type {
        KeyType::X25519 => X25519_PUB_CODEC,
        KeyType::Ed25519 => ED25519_PUB_CODEC,
    };
    let mut bytes = Vec::with_capacity(codec.len() + public.len());
    bytes.extend_from_slice(&codec);
    bytes.extend_from_slice(public);
    multibase::encode(Base::Base58Btc, bytes)
}

pub fn decode_multikey(multikey: &str) -> Result<(KeyType, Vec<u8>), CryptoError> {
    let (_base, bytes) = multibase::decode(multikey)
        .map_err(|e| CryptoError::InvalidKey(format!("{}: {}", multikey, e)))?;

    if bytes.len() != 34 {
        return Err(CryptoError::InvalidKey(format!(
            "{}: expected 34 bytes with codec, got {}",
            multikey,
            bytes.len()
        )));
    }

    let key_type = match [bytes[0], bytes[1]] {
        X25519_PUB_CODEC => KeyType::X25519,
        ED25519_PUB_CODEC => KeyType::Ed25519,
        _ => {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported key codec {:02x}{:02x}",
                bytes[0], bytes[1]
            )))
        }
    };

    Ok((key_type, bytes[2..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_x25519_multikey() {
        let key = KeyRef::from_x25519(&[7u8; 32]);
        assert!(key.as_str().starts_with("z6LS"));
        assert_eq!(key.x25519_bytes().unwrap(), [7u8; 32]);
        assert_eq!(KeyRef::parse(key.as_str()).unwrap(), key);
    }

    #[test]
    fn test_ed25519_is_not_x25519() {
        let multikey = encode_multikey(KeyType::Ed25519, &[1u8; 32]);
        assert!(multikey.starts_with("z6Mk"));
        let key = KeyRef::parse(&multikey).unwrap();
        assert_matches!(key.x25519_bytes(), Err(CryptoError::InvalidKey(_)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(KeyRef::parse("not-multibase").is_err());
        assert!(KeyRef::parse(&multibase::encode(Base::Base58Btc, [0xec, 0x01, 1, 2])).is_err());
    }
}
