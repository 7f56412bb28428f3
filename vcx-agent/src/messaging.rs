//! Messaging Module
//!
//! Encrypts outbound and decrypts inbound DIDComm envelopes. The module
//! keeps no state of its own: every call resolves what it needs through the
//! injected [`DidResolver`] and delegates key operations to the injected
//! [`CryptoProvider`]. Nothing is retried here; retry policy belongs to the
//! caller.

use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::crypto::{CryptoProvider, Envelope, KeyBinding};
use crate::did::{did_from_url, DidDoc, DidResolver};
use crate::error::{CryptoError, MessagingError, Result};

/// An envelope ready for the transport, with the place to send it.
#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    pub envelope: Envelope,
    pub endpoint: Url,
    /// Routing keys advertised by the recipient's service.
    pub routing_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MessagingModule {
    resolver: Arc<dyn DidResolver>,
    crypto: Arc<dyn CryptoProvider>,
}

impl MessagingModule {
    pub fn new(resolver: Arc<dyn DidResolver>, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { resolver, crypto }
    }

    pub fn resolver(&self) -> &Arc<dyn DidResolver> {
        &self.resolver
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    /// Encrypt `plaintext` from `sender_did` to `recipient_did`.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        recipient_did: &str,
        sender_did: &str,
    ) -> Result<EncryptedMessage> {
        let recipient_doc = self.resolve(recipient_did).await?;
        let service = recipient_doc
            .didcomm_service()
            .ok_or_else(|| MessagingError::InvalidDidDocService {
                did: recipient_did.to_string(),
            })?;
        let recipient_key = recipient_doc.key_agreement_key().ok_or_else(|| {
            MessagingError::MissingKeyAgreement {
                did: recipient_did.to_string(),
            }
        })?;

        let sender_doc = self.resolve(sender_did).await?;
        let sender_key =
            sender_doc
                .key_agreement_key()
                .ok_or_else(|| MessagingError::MissingKeyAgreement {
                    did: sender_did.to_string(),
                })?;

        let envelope = self
            .crypto
            .pack(plaintext, &sender_key, &[recipient_key])
            .await
            .map_err(|source| MessagingError::EncryptMessage { source })?;

        debug!(
            "Encrypted {} bytes from {} to {} via {}",
            plaintext.len(),
            sender_did,
            recipient_did,
            service.service_endpoint
        );

        Ok(EncryptedMessage {
            envelope,
            endpoint: service.service_endpoint.clone(),
            routing_keys: service.routing_keys.clone(),
        })
    }

    /// Decrypt an envelope addressed to one of our keys. Returns the
    /// plaintext and the sender DID.
    pub async fn decrypt(&self, envelope: &Envelope) -> Result<(Vec<u8>, String)> {
        let skid = envelope
            .sender_kid()
            .map_err(|source| MessagingError::DecryptMessage { source })?;
        let sender_did = did_from_url(&skid).to_string();

        let sender_doc = self.resolver.resolve(&sender_did).await.map_err(|source| {
            warn!("Cannot resolve sender {} of inbound envelope: {}", sender_did, source);
            MessagingError::DidResolutionPeerDid {
                did: sender_did.clone(),
                source,
            }
        })?;
        let sender_key = sender_doc
            .key_for(&skid)
            .ok_or_else(|| MessagingError::DecryptMessage {
                source: CryptoError::KeyNotFound(skid.clone()),
            })?;

        let recipient = self.find_local_recipient(envelope).await.ok_or_else(|| {
            warn!("Inbound envelope from {} has no recipient we hold a key for", sender_did);
            MessagingError::DecryptMessage {
                source: CryptoError::NoMatchingRecipient,
            }
        })?;

        let plaintext = self
            .crypto
            .unpack(envelope, &recipient, &sender_key)
            .await
            .map_err(|source| {
                warn!("Failed to decrypt envelope from {}: {}", sender_did, source);
                MessagingError::DecryptMessage { source }
            })?;

        debug!("Decrypted {} bytes from {} for {}", plaintext.len(), sender_did, recipient.kid);
        Ok((plaintext, sender_did))
    }

    pub fn envelope_to_bytes(envelope: &Envelope) -> Result<Vec<u8>> {
        envelope
            .to_bytes()
            .map_err(|source| MessagingError::InvalidEnvelope { source })
    }

    pub fn envelope_from_bytes(bytes: &[u8]) -> Result<Envelope> {
        Envelope::from_bytes(bytes).map_err(|source| MessagingError::InvalidEnvelope { source })
    }

    async fn resolve(&self, did: &str) -> Result<DidDoc> {
        self.resolver
            .resolve(did)
            .await
            .map_err(|source| MessagingError::DidResolution {
                did: did.to_string(),
                source,
            })
    }

    // Recipients we cannot resolve are skipped; another kid may still match.
    async fn find_local_recipient(&self, envelope: &Envelope) -> Option<KeyBinding> {
        for kid in envelope.recipient_kids() {
            let doc = match self.resolver.resolve(did_from_url(kid)).await {
                Ok(doc) => doc,
                Err(e) => {
                    debug!("Skipping recipient {}: {}", kid, e);
                    continue;
                }
            };
            if let Some(key) = doc.key_for(kid) {
                if self.crypto.has_key(&key).await {
                    return Some(KeyBinding::new(kid, key));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalCryptoProvider;
    use crate::did::{create_peer_did_2, KeyResolver, MultiResolver};
    use assert_matches::assert_matches;

    async fn setup() -> (MessagingModule, Arc<LocalCryptoProvider>, String, String) {
        let crypto = Arc::new(LocalCryptoProvider::new());
        let endpoint = Url::parse("http://localhost:8080/didcomm").unwrap();
        let alice = create_peer_did_2(&crypto.create_key().await.unwrap(), &endpoint, &[]).unwrap();
        let bob = create_peer_did_2(&crypto.create_key().await.unwrap(), &endpoint, &[]).unwrap();
        let module = MessagingModule::new(Arc::new(MultiResolver::default()), crypto.clone());
        (module, crypto, alice, bob)
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_round_trip() {
        let (module, _, alice, bob) = setup().await;

        let encrypted = module.encrypt(b"{\"hello\":1}", &bob, &alice).await.unwrap();
        assert_eq!(encrypted.endpoint.as_str(), "http://localhost:8080/didcomm");

        let bytes = MessagingModule::envelope_to_bytes(&encrypted.envelope).unwrap();
        let envelope = MessagingModule::envelope_from_bytes(&bytes).unwrap();
        let (plaintext, sender) = module.decrypt(&envelope).await.unwrap();
        assert_eq!(plaintext, b"{\"hello\":1}");
        assert_eq!(sender, alice);
    }

    #[tokio::test]
    async fn test_encrypt_to_did_without_service() {
        let (module, crypto, alice, _) = setup().await;
        let key_did = KeyResolver::did_for(&crypto.create_key().await.unwrap());

        assert_matches!(
            module.encrypt(b"x", &key_did, &alice).await,
            Err(MessagingError::InvalidDidDocService { .. })
        );
    }

    #[tokio::test]
    async fn test_encrypt_to_unresolvable_did() {
        let (module, _, alice, _) = setup().await;
        assert_matches!(
            module.encrypt(b"x", "did:example:nobody", &alice).await,
            Err(MessagingError::DidResolution { did, .. }) if did == "did:example:nobody"
        );
    }

    #[tokio::test]
    async fn test_encrypt_without_sender_secret() {
        let (module, _, _, bob) = setup().await;
        let stranger = LocalCryptoProvider::new();
        let endpoint = Url::parse("http://localhost:9/").unwrap();
        let mallory =
            create_peer_did_2(&stranger.create_key().await.unwrap(), &endpoint, &[]).unwrap();

        assert_matches!(
            module.encrypt(b"x", &bob, &mallory).await,
            Err(MessagingError::EncryptMessage {
                source: CryptoError::KeyNotFound(_)
            })
        );
    }

    #[tokio::test]
    async fn test_decrypt_not_for_us() {
        let (sender_module, _, alice, bob) = setup().await;
        let encrypted = sender_module.encrypt(b"x", &bob, &alice).await.unwrap();

        // Same resolver, but a key store that holds none of the keys.
        let other = MessagingModule::new(
            Arc::new(MultiResolver::default()),
            Arc::new(LocalCryptoProvider::new()),
        );
        assert_matches!(
            other.decrypt(&encrypted.envelope).await,
            Err(MessagingError::DecryptMessage {
                source: CryptoError::NoMatchingRecipient
            })
        );
    }

    #[test]
    fn test_envelope_from_garbage() {
        assert_matches!(
            MessagingModule::envelope_from_bytes(b"not json"),
            Err(MessagingError::InvalidEnvelope { .. })
        );
    }
}
