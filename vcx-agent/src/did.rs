//! DID documents and DID resolution.
//!
//! [`MultiResolver`] dispatches on the DID method to a registered
//! [`DIDMethodResolver`]. `did:key` and `did:peer:2` are supported out of
//! the box; [`StaticResolver`] serves documents handed to it directly,
//! which is how tests and embedded deployments register `did:example`
//! style identifiers.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use url::Url;

use crate::crypto::keys::{decode_multikey, KeyBinding, KeyRef, KeyType};
use crate::error::DidError;

/// Service type carrying DIDComm v2 messages.
pub const DIDCOMM_MESSAGING: &str = "DIDCommMessaging";

/// Abbreviated service type used inside did:peer:2 service elements.
const DIDCOMM_MESSAGING_ABBREV: &str = "dm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub controller: String,
    pub public_key_multibase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub service_endpoint: Url,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accept: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDoc {
    pub id: String,
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
    #[serde(default)]
    pub authentication: Vec<String>,
    #[serde(default)]
    pub key_agreement: Vec<String>,
    #[serde(default)]
    pub service: Vec<Service>,
}

impl DidDoc {
    /// Find a verification method by absolute or relative (`#frag`) id.
    pub fn find_method(&self, id: &str) -> Option<&VerificationMethod> {
        let absolute = if id.starts_with('#') {
            format!("{}{}", self.id, id)
        } else {
            id.to_string()
        };
        self.verification_method.iter().find(|vm| vm.id == absolute)
    }

    /// First key agreement key, as a binding usable for encryption.
    pub fn key_agreement_key(&self) -> Option<KeyBinding> {
        self.key_agreement
            .iter()
            .filter_map(|id| self.find_method(id))
            .find_map(|vm| {
                KeyRef::parse(&vm.public_key_multibase)
                    .ok()
                    .filter(|key| key.x25519_bytes().is_ok())
                    .map(|key| KeyBinding::new(vm.id.clone(), key))
            })
    }

    /// Resolve the public key named by `kid`.
    pub fn key_for(&self, kid: &str) -> Option<KeyRef> {
        self.find_method(kid)
            .and_then(|vm| KeyRef::parse(&vm.public_key_multibase).ok())
    }

    /// First DIDComm messaging service.
    pub fn didcomm_service(&self) -> Option<&Service> {
        self.service.iter().find(|s| s.type_ == DIDCOMM_MESSAGING)
    }
}

/// Resolves any DID to its document.
#[async_trait]
pub trait DidResolver: Send + Sync + Debug {
    async fn resolve(&self, did: &str) -> Result<DidDoc, DidError>;
}

/// A resolver for a specific DID method.
#[async_trait]
pub trait DIDMethodResolver: Send + Sync + Debug {
    /// Returns the method name this resolver handles (e.g., "key", "peer").
    fn method(&self) -> &str;

    /// Resolve a DID of this method. `Ok(None)` means the DID is well formed
    /// but unknown.
    async fn resolve_method(&self, did: &str) -> Result<Option<DidDoc>, DidError>;
}

/// Strip a fragment or query from a DID URL.
pub fn did_from_url(did_url: &str) -> &str {
    did_url
        .split(|c| c == '#' || c == '?')
        .next()
        .unwrap_or(did_url)
}

/// Method name of a DID.
pub fn did_method(did: &str) -> Result<&str, DidError> {
    let mut parts = did.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("did"), Some(method), Some(id)) if !method.is_empty() && !id.is_empty() => Ok(method),
        _ => Err(DidError::InvalidDid(did.to_string())),
    }
}

// ---------------------------------------------------------------------------
// did:key
// ---------------------------------------------------------------------------

/// A resolver for the did:key method.
#[derive(Debug, Default)]
pub struct KeyResolver;

impl KeyResolver {
    /// did:key for an X25519 public key.
    pub fn did_for(key: &KeyRef) -> String {
        format!("did:key:{}", key)
    }
}

#[async_trait]
impl DIDMethodResolver for KeyResolver {
    fn method(&self) -> &str {
        "key"
    }

    async fn resolve_method(&self, did: &str) -> Result<Option<DidDoc>, DidError> {
        let multikey = did
            .strip_prefix("did:key:")
            .ok_or_else(|| DidError::InvalidDid(format!("Not a did:key format: {}", did)))?;

        let (key_type, _) =
            decode_multikey(multikey).map_err(|e| DidError::Encoding(e.to_string()))?;

        let vm_id = format!("{}#{}", did, multikey);
        let verification_method = VerificationMethod {
            id: vm_id.clone(),
            type_: key_type.verification_method_type().to_string(),
            controller: did.to_string(),
            public_key_multibase: multikey.to_string(),
        };

        let (authentication, key_agreement) = match key_type {
            KeyType::X25519 => (vec![], vec![vm_id]),
            KeyType::Ed25519 => (vec![vm_id], vec![]),
        };

        Ok(Some(DidDoc {
            id: did.to_string(),
            verification_method: vec![verification_method],
            authentication,
            key_agreement,
            service: vec![],
        }))
    }
}

// ---------------------------------------------------------------------------
// did:peer:2
// ---------------------------------------------------------------------------

/// A resolver for did:peer numalgo 2. The document is generated from the
/// DID itself; nothing is looked up.
#[derive(Debug, Default)]
pub struct PeerResolver;

/// Build a did:peer:2 from a key agreement key and a DIDComm endpoint.
pub fn create_peer_did_2(
    key_agreement: &KeyRef,
    endpoint: &Url,
    routing_keys: &[String],
) -> Result<String, DidError> {
    let service = json!({
        "t": DIDCOMM_MESSAGING_ABBREV,
        "s": {
            "uri": endpoint.as_str(),
            "a": ["didcomm/v2"],
            "r": routing_keys,
        }
    });
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(serde_json::to_vec(&service)?);
    Ok(format!("did:peer:2.E{}.S{}", key_agreement, encoded))
}

impl PeerResolver {
    fn decode_service(did: &str, index: usize, encoded: &str) -> Result<Service, DidError> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| DidError::Encoding(format!("service element: {}", e)))?;
        let value: Value = serde_json::from_slice(&bytes)?;

        let type_ = match value.get("t").and_then(Value::as_str) {
            Some(DIDCOMM_MESSAGING_ABBREV) | None => DIDCOMM_MESSAGING.to_string(),
            Some(other) => other.to_string(),
        };

        // Both the legacy flat form ("s": uri, "r", "a") and the nested form
        // ("s": {"uri", "r", "a"}) are accepted.
        let (endpoint, routing, accept) = match value.get("s") {
            Some(Value::String(uri)) => (uri.clone(), value.get("r"), value.get("a")),
            Some(Value::Object(obj)) => (
                obj.get("uri")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                obj.get("r"),
                obj.get("a"),
            ),
            _ => {
                return Err(DidError::InvalidDocument(format!(
                    "{}: service element has no endpoint",
                    did
                )))
            }
        };

        let service_endpoint = Url::parse(&endpoint)
            .map_err(|e| DidError::InvalidDocument(format!("{}: bad endpoint: {}", did, e)))?;
        let strings = |v: Option<&Value>| -> Vec<String> {
            v.and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                .unwrap_or_default()
        };

        Ok(Service {
            id: if index == 0 {
                format!("{}#service", did)
            } else {
                format!("{}#service-{}", did, index)
            },
            type_,
            service_endpoint,
            routing_keys: strings(routing),
            accept: strings(accept),
        })
    }
}

#[async_trait]
impl DIDMethodResolver for PeerResolver {
    fn method(&self) -> &str {
        "peer"
    }

    async fn resolve_method(&self, did: &str) -> Result<Option<DidDoc>, DidError> {
        let rest = did
            .strip_prefix("did:peer:2")
            .ok_or_else(|| DidError::UnsupportedMethod(format!("only did:peer:2 is supported: {}", did)))?;

        let mut doc = DidDoc {
            id: did.to_string(),
            verification_method: vec![],
            authentication: vec![],
            key_agreement: vec![],
            service: vec![],
        };

        for element in rest.split('.').filter(|e| !e.is_empty()) {
            let (purpose, value) = element.split_at(1);
            match purpose {
                "E" | "V" => {
                    let (key_type, _) =
                        decode_multikey(value).map_err(|e| DidError::Encoding(e.to_string()))?;
                    let id = format!("{}#key-{}", did, doc.verification_method.len() + 1);
                    doc.verification_method.push(VerificationMethod {
                        id: id.clone(),
                        type_: key_type.verification_method_type().to_string(),
                        controller: did.to_string(),
                        public_key_multibase: value.to_string(),
                    });
                    if purpose == "E" {
                        doc.key_agreement.push(id);
                    } else {
                        doc.authentication.push(id);
                    }
                }
                "S" => {
                    let service = Self::decode_service(did, doc.service.len(), value)?;
                    doc.service.push(service);
                }
                other => {
                    return Err(DidError::InvalidDid(format!(
                        "{}: unknown purpose code `{}`",
                        did, other
                    )))
                }
            }
        }

        if doc.verification_method.is_empty() {
            return Err(DidError::InvalidDocument(format!("{}: no keys", did)));
        }
        Ok(Some(doc))
    }
}

// ---------------------------------------------------------------------------
// Static documents
// ---------------------------------------------------------------------------

/// Serves documents registered with [`StaticResolver::insert`] for one method.
#[derive(Debug)]
pub struct StaticResolver {
    method: String,
    docs: RwLock<HashMap<String, DidDoc>>,
}

impl StaticResolver {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, doc: DidDoc) {
        if let Ok(mut docs) = self.docs.write() {
            docs.insert(doc.id.clone(), doc);
        }
    }
}

#[async_trait]
impl DIDMethodResolver for StaticResolver {
    fn method(&self) -> &str {
        &self.method
    }

    async fn resolve_method(&self, did: &str) -> Result<Option<DidDoc>, DidError> {
        Ok(self.docs.read().ok().and_then(|docs| docs.get(did).cloned()))
    }
}

// ---------------------------------------------------------------------------
// Multi resolver
// ---------------------------------------------------------------------------

/// A multi-resolver that aggregates multiple DID method resolvers.
#[derive(Debug)]
pub struct MultiResolver {
    resolvers: RwLock<HashMap<String, Arc<dyn DIDMethodResolver>>>,
}

impl Default for MultiResolver {
    fn default() -> Self {
        let resolver = Self::new();
        resolver.add_resolver(Arc::new(KeyResolver));
        resolver.add_resolver(Arc::new(PeerResolver));
        resolver
    }
}

impl MultiResolver {
    /// Creates a new empty multi-resolver.
    pub fn new() -> Self {
        Self {
            resolvers: RwLock::new(HashMap::new()),
        }
    }

    /// Adds (or replaces) the resolver for its method.
    pub fn add_resolver(&self, resolver: Arc<dyn DIDMethodResolver>) {
        if let Ok(mut resolvers) = self.resolvers.write() {
            resolvers.insert(resolver.method().to_string(), resolver);
        }
    }

    /// Gets all supported DID methods.
    pub fn supported_methods(&self) -> Vec<String> {
        self.resolvers
            .read()
            .map(|resolvers| resolvers.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DidResolver for MultiResolver {
    async fn resolve(&self, did: &str) -> Result<DidDoc, DidError> {
        let did = did_from_url(did);
        let method = did_method(did)?;

        let resolver = self
            .resolvers
            .read()
            .ok()
            .and_then(|resolvers| resolvers.get(method).cloned())
            .ok_or_else(|| DidError::UnsupportedMethod(method.to_string()))?;

        resolver
            .resolve_method(did)
            .await?
            .ok_or_else(|| DidError::NotFound(did.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn endpoint() -> Url {
        Url::parse("http://alice.example/didcomm").unwrap()
    }

    #[tokio::test]
    async fn test_key_resolver() {
        let key = KeyRef::from_x25519(&[3u8; 32]);
        let did = KeyResolver::did_for(&key);

        let doc = KeyResolver.resolve_method(&did).await.unwrap().unwrap();
        assert_eq!(doc.id, did);
        assert_eq!(doc.key_agreement_key().unwrap().key, key);
        assert!(doc.didcomm_service().is_none());
    }

    #[tokio::test]
    async fn test_peer_did_2_round_trip() {
        let key = KeyRef::from_x25519(&[5u8; 32]);
        let did = create_peer_did_2(&key, &endpoint(), &["did:example:mediator".to_string()]).unwrap();
        assert!(did.starts_with("did:peer:2.Ez6LS"));

        let doc = PeerResolver.resolve_method(&did).await.unwrap().unwrap();
        let binding = doc.key_agreement_key().unwrap();
        assert_eq!(binding.kid, format!("{}#key-1", did));
        assert_eq!(binding.key, key);

        let service = doc.didcomm_service().unwrap();
        assert_eq!(service.service_endpoint, endpoint());
        assert_eq!(service.routing_keys, vec!["did:example:mediator".to_string()]);
        assert_eq!(service.id, format!("{}#service", did));
    }

    #[tokio::test]
    async fn test_peer_did_legacy_service() {
        let key = KeyRef::from_x25519(&[5u8; 32]);
        let service = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(br#"{"t":"dm","s":"https://bob.example/","r":[],"a":["didcomm/v2"]}"#);
        let did = format!("did:peer:2.E{}.S{}", key, service);

        let doc = PeerResolver.resolve_method(&did).await.unwrap().unwrap();
        assert_eq!(
            doc.didcomm_service().unwrap().service_endpoint.as_str(),
            "https://bob.example/"
        );
    }

    #[tokio::test]
    async fn test_peer_did_bad_purpose() {
        let key = KeyRef::from_x25519(&[5u8; 32]);
        let did = format!("did:peer:2.X{}", key);
        assert_matches!(PeerResolver.resolve_method(&did).await, Err(DidError::InvalidDid(_)));
    }

    #[tokio::test]
    async fn test_multi_resolver() {
        let resolver = MultiResolver::default();
        let mut methods = resolver.supported_methods();
        methods.sort();
        assert_eq!(methods, vec!["key".to_string(), "peer".to_string()]);

        let key = KeyRef::from_x25519(&[3u8; 32]);
        let did = KeyResolver::did_for(&key);
        let with_fragment = format!("{}#{}", did, key);
        assert_eq!(resolver.resolve(&with_fragment).await.unwrap().id, did);

        assert_matches!(
            resolver.resolve("did:unsupported:123").await,
            Err(DidError::UnsupportedMethod(_))
        );
        assert_matches!(resolver.resolve("not-a-did").await, Err(DidError::InvalidDid(_)));
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let statics = Arc::new(StaticResolver::new("example"));
        let resolver = MultiResolver::new();
        resolver.add_resolver(statics.clone());

        assert_matches!(
            resolver.resolve("did:example:abc").await,
            Err(DidError::NotFound(_))
        );

        statics.insert(DidDoc {
            id: "did:example:abc".to_string(),
            verification_method: vec![],
            authentication: vec![],
            key_agreement: vec![],
            service: vec![],
        });
        assert!(resolver.resolve("did:example:abc").await.is_ok());
    }

    #[test]
    fn test_find_method_relative() {
        let doc = DidDoc {
            id: "did:example:abc".to_string(),
            verification_method: vec![VerificationMethod {
                id: "did:example:abc#key-1".to_string(),
                type_: "X25519KeyAgreementKey2020".to_string(),
                controller: "did:example:abc".to_string(),
                public_key_multibase: KeyRef::from_x25519(&[1u8; 32]).to_string(),
            }],
            authentication: vec![],
            key_agreement: vec!["#key-1".to_string()],
            service: vec![],
        };
        assert!(doc.find_method("#key-1").is_some());
        assert!(doc.key_agreement_key().is_some());
        assert!(doc.key_for("did:example:abc#key-1").is_some());
        assert!(doc.key_for("did:example:abc#key-2").is_none());
    }
}
