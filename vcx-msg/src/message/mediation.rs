//! Coordinate-mediation 2.0 bodies.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::message::message_trait::{require_did, MessageBody};

pub const MEDIATE_REQUEST_TYPE: &str = "https://didcomm.org/coordinate-mediation/2.0/mediate-request";
pub const MEDIATE_GRANT_TYPE: &str = "https://didcomm.org/coordinate-mediation/2.0/mediate-grant";
pub const MEDIATE_DENY_TYPE: &str = "https://didcomm.org/coordinate-mediation/2.0/mediate-deny";
pub const KEYLIST_UPDATE_TYPE: &str = "https://didcomm.org/coordinate-mediation/2.0/keylist-update";
pub const KEYLIST_UPDATE_RESPONSE_TYPE: &str =
    "https://didcomm.org/coordinate-mediation/2.0/keylist-update-response";

/// Ask a mediator to route messages for us.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediateRequest {}

impl MessageBody for MediateRequest {
    fn message_type() -> &'static str {
        MEDIATE_REQUEST_TYPE
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Mediator accepted the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediateGrant {
    /// DID senders must use as the routing hop towards us.
    pub routing_did: Vec<String>,
}

impl MessageBody for MediateGrant {
    fn message_type() -> &'static str {
        MEDIATE_GRANT_TYPE
    }

    fn validate(&self) -> Result<()> {
        if self.routing_did.is_empty() {
            return Err(Error::Validation(
                "mediate-grant must carry at least one routing_did".to_string(),
            ));
        }
        for did in &self.routing_did {
            require_did("routing_did", did)?;
        }
        Ok(())
    }
}

/// Mediator refused the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediateDeny {}

impl MessageBody for MediateDeny {
    fn message_type() -> &'static str {
        MEDIATE_DENY_TYPE
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeylistAction {
    Add,
    Remove,
}

impl fmt::Display for KeylistAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeylistAction::Add => write!(f, "add"),
            KeylistAction::Remove => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdateItem {
    pub recipient_did: String,
    pub action: KeylistAction,
}

/// Add or remove recipient DIDs routed by the mediator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdate {
    pub updates: Vec<KeylistUpdateItem>,
}

impl KeylistUpdate {
    pub fn single(recipient_did: &str, action: KeylistAction) -> Self {
        Self {
            updates: vec![KeylistUpdateItem {
                recipient_did: recipient_did.to_string(),
                action,
            }],
        }
    }
}

impl MessageBody for KeylistUpdate {
    fn message_type() -> &'static str {
        KEYLIST_UPDATE_TYPE
    }

    fn validate(&self) -> Result<()> {
        if self.updates.is_empty() {
            return Err(Error::Validation("keylist-update has no updates".to_string()));
        }
        for update in &self.updates {
            require_did("recipient_did", &update.recipient_did)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeylistResult {
    ClientError,
    ServerError,
    NoChange,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdated {
    pub recipient_did: String,
    pub action: KeylistAction,
    pub result: KeylistResult,
}

/// Mediator's answer to a [`KeylistUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdateResponse {
    pub updated: Vec<KeylistUpdated>,
}

impl MessageBody for KeylistUpdateResponse {
    fn message_type() -> &'static str {
        KEYLIST_UPDATE_RESPONSE_TYPE
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_grant_requires_routing_did() {
        let grant = MediateGrant {
            routing_did: vec![],
        };
        assert_matches!(grant.validate(), Err(Error::Validation(_)));

        let grant = MediateGrant {
            routing_did: vec!["did:example:mediator".to_string()],
        };
        assert!(grant.validate().is_ok());
    }

    #[test]
    fn test_keylist_update_serialization() {
        let update = KeylistUpdate::single("did:example:bob", KeylistAction::Add);
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["updates"][0]["action"], "add");
        assert_eq!(value["updates"][0]["recipient_did"], "did:example:bob");

        let response: KeylistUpdateResponse = serde_json::from_value(serde_json::json!({
            "updated": [{"recipient_did": "did:example:bob", "action": "add", "result": "no_change"}]
        }))
        .unwrap();
        assert_eq!(response.updated[0].result, KeylistResult::NoChange);
    }

    #[test]
    fn test_empty_keylist_update_is_invalid() {
        let update = KeylistUpdate { updates: vec![] };
        assert_matches!(update.validate(), Err(Error::Validation(_)));
    }
}
