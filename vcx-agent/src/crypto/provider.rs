//! Crypto provider capability.
//!
//! Modules never touch secret key material. They ask a [`CryptoProvider`]
//! to create keys and to pack or unpack envelopes, naming keys only by
//! their public [`KeyRef`].

use async_trait::async_trait;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::RwLock;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::authcrypt;
use crate::crypto::envelope::Envelope;
use crate::crypto::keys::{KeyBinding, KeyRef};
use crate::error::CryptoError;

#[async_trait]
pub trait CryptoProvider: Send + Sync + Debug {
    /// Generate a new X25519 key pair and return its public reference.
    async fn create_key(&self) -> Result<KeyRef, CryptoError>;

    /// Whether the provider holds the secret for `key`.
    async fn has_key(&self, key: &KeyRef) -> bool;

    /// Encrypt `plaintext` from `sender` (whose secret must be held) to
    /// every recipient.
    async fn pack(
        &self,
        plaintext: &[u8],
        sender: &KeyBinding,
        recipients: &[KeyBinding],
    ) -> Result<Envelope, CryptoError>;

    /// Decrypt `envelope` for `recipient` (whose secret must be held),
    /// authenticating the sender key `sender`.
    async fn unpack(
        &self,
        envelope: &Envelope,
        recipient: &KeyBinding,
        sender: &KeyRef,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// In-process provider keeping X25519 secrets in memory.
#[derive(Default)]
pub struct LocalCryptoProvider {
    keys: RwLock<HashMap<KeyRef, StaticSecret>>,
}

// Secrets must never end up in logs.
impl Debug for LocalCryptoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.keys.read().map(|k| k.len()).unwrap_or(0);
        f.debug_struct("LocalCryptoProvider")
            .field("keys", &count)
            .finish()
    }
}

impl LocalCryptoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import an existing 32-byte X25519 secret.
    pub fn import_secret(&self, secret: [u8; 32]) -> Result<KeyRef, CryptoError> {
        self.insert(StaticSecret::from(secret))
    }

    /// Copy out the 32-byte secret of `key`, for key stores that persist it.
    pub fn export_secret(&self, key: &KeyRef) -> Result<[u8; 32], CryptoError> {
        Ok(self.secret(key)?.to_bytes())
    }

    fn insert(&self, secret: StaticSecret) -> Result<KeyRef, CryptoError> {
        let key = KeyRef::from_x25519(PublicKey::from(&secret).as_bytes());
        self.keys
            .write()
            .map_err(|_| CryptoError::KeyStore("key store lock poisoned".to_string()))?
            .insert(key.clone(), secret);
        Ok(key)
    }

    fn secret(&self, key: &KeyRef) -> Result<StaticSecret, CryptoError> {
        self.keys
            .read()
            .map_err(|_| CryptoError::KeyStore("key store lock poisoned".to_string()))?
            .get(key)
            .cloned()
            .ok_or_else(|| CryptoError::KeyNotFound(key.to_string()))
    }
}

#[async_trait]
impl CryptoProvider for LocalCryptoProvider {
    async fn create_key(&self) -> Result<KeyRef, CryptoError> {
        let key = self.insert(StaticSecret::random_from_rng(OsRng))?;
        debug!("Created X25519 key {}", key);
        Ok(key)
    }

    async fn has_key(&self, key: &KeyRef) -> bool {
        self.keys
            .read()
            .map(|keys| keys.contains_key(key))
            .unwrap_or(false)
    }

    async fn pack(
        &self,
        plaintext: &[u8],
        sender: &KeyBinding,
        recipients: &[KeyBinding],
    ) -> Result<Envelope, CryptoError> {
        let secret = self.secret(&sender.key)?;
        authcrypt::pack(plaintext, &secret, &sender.kid, recipients)
    }

    async fn unpack(
        &self,
        envelope: &Envelope,
        recipient: &KeyBinding,
        sender: &KeyRef,
    ) -> Result<Vec<u8>, CryptoError> {
        let secret = self.secret(&recipient.key)?;
        authcrypt::unpack(envelope, &secret, &recipient.kid, &sender.x25519_bytes()?)
    }
}
