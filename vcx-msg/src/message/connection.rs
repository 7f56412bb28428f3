//! Out-of-band invitation and DID exchange bodies.
//!
//! The handshake runs on a single thread whose id is the id of the request
//! message. The invitation id is carried as the parent thread (`pthid`).

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::didcomm::PlainMessage;
use crate::error::{Error, Result};
use crate::message::message_trait::{require_did, MessageBody};

pub const INVITATION_TYPE: &str = "https://didcomm.org/out-of-band/2.0/invitation";
pub const REQUEST_TYPE: &str = "https://didcomm.org/didexchange/1.1/request";
pub const RESPONSE_TYPE: &str = "https://didcomm.org/didexchange/1.1/response";
pub const COMPLETE_TYPE: &str = "https://didcomm.org/didexchange/1.1/complete";

/// Handshake protocol advertised in invitations.
pub const DID_EXCHANGE_PROTOCOL: &str = "https://didcomm.org/didexchange/1.1";

/// Query parameter used when an invitation is shared as a URL.
const OOB_QUERY_PARAM: &str = "_oob";

/// An out-of-band invitation to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    /// Invitation id. Becomes the parent thread of the handshake.
    pub id: String,

    /// DID of the inviter; requests are sent to it.
    pub from: String,

    /// Human readable label of the inviter.
    pub label: String,

    /// Optional goal statement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    /// Handshake protocols the inviter accepts.
    pub handshake_protocols: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InvitationBody {
    label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    goal: Option<String>,
    #[serde(default)]
    handshake_protocols: Vec<String>,
}

impl Invitation {
    /// Create a new invitation from `from` with a fresh id.
    pub fn new(from: &str, label: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            label: label.to_string(),
            goal: None,
            handshake_protocols: vec![DID_EXCHANGE_PROTOCOL.to_string()],
        }
    }

    /// Builder method to set a goal
    pub fn with_goal(mut self, goal: &str) -> Self {
        self.goal = Some(goal.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Validation("invitation id must not be empty".to_string()));
        }
        require_did("invitation from", &self.from)?;
        if self.label.trim().is_empty() {
            return Err(Error::Validation(
                "invitation label must not be empty".to_string(),
            ));
        }
        if !self
            .handshake_protocols
            .iter()
            .any(|p| p == DID_EXCHANGE_PROTOCOL)
        {
            return Err(Error::Validation(format!(
                "invitation {} does not offer {}",
                self.id, DID_EXCHANGE_PROTOCOL
            )));
        }
        Ok(())
    }

    /// Encode as a plain message. The message id is the invitation id.
    pub fn to_plain(&self) -> Result<PlainMessage> {
        self.validate()?;
        let body = serde_json::to_value(InvitationBody {
            label: self.label.clone(),
            goal: self.goal.clone(),
            handshake_protocols: self.handshake_protocols.clone(),
        })?;
        Ok(PlainMessage::with_id(self.id.clone(), INVITATION_TYPE, body).with_sender(&self.from))
    }

    /// Decode from a plain message.
    pub fn from_plain(message: &PlainMessage) -> Result<Self> {
        if message.type_ != INVITATION_TYPE {
            return Err(Error::InvalidMessageType(format!(
                "expected {}, got {}",
                INVITATION_TYPE, message.type_
            )));
        }
        let from = message
            .from
            .clone()
            .ok_or_else(|| Error::MissingHeader("from", message.id.clone()))?;
        let body: InvitationBody = serde_json::from_value(message.body.clone())?;
        let invitation = Self {
            id: message.id.clone(),
            from,
            label: body.label,
            goal: body.goal,
            handshake_protocols: body.handshake_protocols,
        };
        invitation.validate()?;
        Ok(invitation)
    }

    /// Render as an invitation URL (`<base>?_oob=<base64url json>`).
    pub fn to_url(&self, base: &str) -> Result<String> {
        let json = serde_json::to_vec(&self.to_plain()?)?;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json);
        let separator = if base.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}{}={}", base, separator, OOB_QUERY_PARAM, encoded))
    }

    /// Parse an invitation URL produced by [`Invitation::to_url`].
    pub fn from_url(url: &str) -> Result<Self> {
        let (_, query) = url
            .split_once('?')
            .ok_or_else(|| Error::Validation("invitation url has no query".to_string()))?;
        let encoded = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("_oob="))
            .ok_or_else(|| Error::Validation("invitation url has no _oob parameter".to_string()))?;
        let json = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| Error::Validation(format!("invalid _oob encoding: {}", e)))?;
        let message: PlainMessage = serde_json::from_slice(&json)?;
        Self::from_plain(&message)
    }
}

/// DID exchange request, sent by the invitee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// Label of the requester.
    pub label: String,

    /// DID the requester will use on this connection.
    pub did: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

impl MessageBody for ConnectionRequest {
    fn message_type() -> &'static str {
        REQUEST_TYPE
    }

    fn validate(&self) -> Result<()> {
        require_did("request did", &self.did)
    }
}

/// DID exchange response, sent by the inviter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    /// DID the responder will use on this connection.
    pub did: String,
}

impl MessageBody for ConnectionResponse {
    fn message_type() -> &'static str {
        RESPONSE_TYPE
    }

    fn validate(&self) -> Result<()> {
        require_did("response did", &self.did)
    }
}

/// DID exchange completion acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionComplete {
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl MessageBody for ConnectionComplete {
    fn message_type() -> &'static str {
        COMPLETE_TYPE
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}
