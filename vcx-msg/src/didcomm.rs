use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Media type of an unencrypted DIDComm message.
pub const PLAINTEXT_TYP: &str = "application/didcomm-plain+json";

/// Header used to ask the receiver to reply on the same transport exchange.
pub const RETURN_ROUTE_HEADER: &str = "return_route";

/// Plain (unencrypted) DIDComm message.
///
/// The body is kept untyped here; protocol bodies are decoded through
/// [`MessageBody::from_plain`](crate::message::MessageBody::from_plain).
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PlainMessage {
    /// Message id. Must be unique to the sender.
    pub id: String,

    /// Optional, if present it must be "application/didcomm-plain+json"
    #[serde(default = "default_typ")]
    pub typ: String,

    /// Message type URI.
    #[serde(rename = "type")]
    pub type_: String,

    /// Message body.
    #[serde(default)]
    pub body: Value,

    /// Sender DID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Recipient DIDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,

    /// Thread the message belongs to. When absent the message id is the thread id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,

    /// Parent thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,

    /// Creation time in UTC epoch seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_time: Option<u64>,

    /// Expiry time in UTC epoch seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_time: Option<u64>,

    /// Attachments (used by pickup delivery).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,

    /// Custom message headers.
    #[serde(flatten)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra_headers: HashMap<String, Value>,
}

fn default_typ() -> String {
    PLAINTEXT_TYP.to_string()
}

impl PlainMessage {
    /// Create a new message with a fresh id and the current creation time.
    pub fn new(type_: &str, body: Value) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), type_, body)
    }

    /// Create a new message with an explicit id.
    pub fn with_id(id: String, type_: &str, body: Value) -> Self {
        Self {
            id,
            typ: default_typ(),
            type_: type_.to_string(),
            body,
            from: None,
            to: vec![],
            thid: None,
            pthid: None,
            created_time: Some(chrono::Utc::now().timestamp() as u64),
            expires_time: None,
            attachments: None,
            extra_headers: HashMap::new(),
        }
    }

    /// Builder method to set the sender
    pub fn with_sender(mut self, from: &str) -> Self {
        self.from = Some(from.to_string());
        self
    }

    /// Builder method to add a single recipient
    pub fn with_recipient(mut self, recipient: &str) -> Self {
        self.to.push(recipient.to_string());
        self
    }

    /// Builder method to set thread ID
    pub fn with_thread_id(mut self, thid: Option<String>) -> Self {
        self.thid = thid;
        self
    }

    /// Builder method to set parent thread ID
    pub fn with_parent_thread_id(mut self, pthid: Option<String>) -> Self {
        self.pthid = pthid;
        self
    }

    /// Builder method to set expiration time
    pub fn with_expires_at(mut self, expires_time: u64) -> Self {
        self.expires_time = Some(expires_time);
        self
    }

    /// Builder method to add attachments
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    /// Builder method to add a custom header
    pub fn with_header(mut self, key: &str, value: Value) -> Self {
        self.extra_headers.insert(key.to_string(), value);
        self
    }

    /// Ask the receiver to answer on the same transport exchange.
    pub fn with_return_route(self) -> Self {
        self.with_header(RETURN_ROUTE_HEADER, Value::String("all".to_string()))
    }

    /// Whether the sender asked for replies on the same exchange.
    pub fn wants_return_route(&self) -> bool {
        matches!(
            self.extra_headers.get(RETURN_ROUTE_HEADER),
            Some(Value::String(v)) if v == "all"
        )
    }

    /// The thread id, falling back to the message id.
    pub fn thread_id(&self) -> &str {
        self.thid.as_deref().unwrap_or(&self.id)
    }

    /// Whether the message has expired relative to `now` (epoch seconds).
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_time.map(|exp| exp <= now).unwrap_or(false)
    }

    /// Serialize to compact JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let message: PlainMessage = serde_json::from_slice(bytes)?;
        if message.id.is_empty() {
            return Err(Error::Validation("message id must not be empty".to_string()));
        }
        Ok(message)
    }
}

/// A DIDComm v2 attachment carrying base64url-encoded data.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Attachment {
    /// Attachment id, unique within the message.
    pub id: String,

    /// Media type of the attached data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Attached payload.
    pub data: AttachmentData,
}

/// Attachment payload.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct AttachmentData {
    /// Base64url (unpadded) encoded bytes.
    pub base64: String,
}

impl Attachment {
    /// Wrap raw bytes into an attachment.
    pub fn from_bytes(id: &str, media_type: Option<&str>, bytes: &[u8]) -> Self {
        use base64::Engine;
        Self {
            id: id.to_string(),
            media_type: media_type.map(str::to_string),
            data: AttachmentData {
                base64: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes),
            },
        }
    }

    /// Decode the attached bytes.
    pub fn decode(&self) -> Result<Vec<u8>> {
        use base64::Engine;
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(self.data.base64.trim_end_matches('='))
            .map_err(|e| Error::InvalidAttachment(format!("{}: {}", self.id, e)))
    }
}
