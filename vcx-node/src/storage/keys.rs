//! Crypto provider backed by a [`StorageBackend`]
//!
//! Secrets live in the `keys` category, base64 encoded, next to the DID
//! records that reference them. They are loaded into an in-memory
//! [`LocalCryptoProvider`] the first time a key is used.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use vcx_agent::crypto::KeyType;
use vcx_agent::{CryptoError, CryptoProvider, Envelope, KeyBinding, KeyRef, LocalCryptoProvider};

use super::StorageBackend;

pub const KEYS_CATEGORY: &str = "keys";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKey {
    /// Multikey of the public half
    public_key: String,
    key_type: String,
    /// Base64-encoded secret
    private_key: String,
}

/// [`CryptoProvider`] whose keys survive a restart with their storage.
#[derive(Debug)]
pub struct StoredCryptoProvider {
    storage: Arc<dyn StorageBackend>,
    keys: LocalCryptoProvider,
}

impl StoredCryptoProvider {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            keys: LocalCryptoProvider::new(),
        }
    }

    /// Make the secret of `key` available in memory.
    async fn load(&self, key: &KeyRef) -> Result<(), CryptoError> {
        if self.keys.has_key(key).await {
            return Ok(());
        }
        let row = self
            .storage
            .get(KEYS_CATEGORY, key.as_str())
            .await
            .map_err(|e| CryptoError::KeyStore(e.to_string()))?
            .ok_or_else(|| CryptoError::KeyNotFound(key.to_string()))?;

        let stored: StoredKey = serde_json::from_value(row.value)?;
        let secret: [u8; 32] = STANDARD
            .decode(&stored.private_key)
            .map_err(|e| CryptoError::KeyStore(format!("key {}: {}", key, e)))?
            .try_into()
            .map_err(|_| CryptoError::KeyStore(format!("key {} is not a 32-byte secret", key)))?;

        let loaded = self.keys.import_secret(secret)?;
        if &loaded != key {
            return Err(CryptoError::KeyStore(format!(
                "stored secret of {} belongs to {}",
                key, loaded
            )));
        }
        debug!("Loaded key {} from storage", key);
        Ok(())
    }
}

#[async_trait]
impl CryptoProvider for StoredCryptoProvider {
    async fn create_key(&self) -> Result<KeyRef, CryptoError> {
        let key = self.keys.create_key().await?;
        let stored = StoredKey {
            public_key: key.to_string(),
            key_type: format!("{:?}", KeyType::X25519),
            private_key: STANDARD.encode(self.keys.export_secret(&key)?),
        };
        let tags = HashMap::from([("key_type".to_string(), stored.key_type.clone())]);
        self.storage
            .insert(KEYS_CATEGORY, key.as_str(), serde_json::to_value(&stored)?, tags)
            .await
            .map_err(|e| CryptoError::KeyStore(e.to_string()))?;
        Ok(key)
    }

    async fn has_key(&self, key: &KeyRef) -> bool {
        self.load(key).await.is_ok()
    }

    async fn pack(
        &self,
        plaintext: &[u8],
        sender: &KeyBinding,
        recipients: &[KeyBinding],
    ) -> Result<Envelope, CryptoError> {
        self.load(&sender.key).await?;
        self.keys.pack(plaintext, sender, recipients).await
    }

    async fn unpack(
        &self,
        envelope: &Envelope,
        recipient: &KeyBinding,
        sender: &KeyRef,
    ) -> Result<Vec<u8>, CryptoError> {
        self.load(&recipient.key).await?;
        self.keys.unpack(envelope, recipient, sender).await
    }
}
