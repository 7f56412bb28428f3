use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use url::Url;
use vcx_agent::KeyRef;
use vcx_msg::message::Invitation;

use super::Record;
use crate::event::EventTopic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DidRole {
    /// We hold the secrets behind the DID.
    Owned,
    /// A peer's DID received during a connection.
    SharedByPeer,
}

impl fmt::Display for DidRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DidRole::Owned => write!(f, "owned"),
            DidRole::SharedByPeer => write!(f, "shared_by_peer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Invited,
    Requested,
    Responded,
    Complete,
    Error,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Complete | ConnectionState::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Invited => write!(f, "invited"),
            ConnectionState::Requested => write!(f, "requested"),
            ConnectionState::Responded => write!(f, "responded"),
            ConnectionState::Complete => write!(f, "complete"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

impl TryFrom<&str> for ConnectionState {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, <Self as TryFrom<&str>>::Error> {
        match value {
            "invited" => Ok(ConnectionState::Invited),
            "requested" => Ok(ConnectionState::Requested),
            "responded" => Ok(ConnectionState::Responded),
            "complete" => Ok(ConnectionState::Complete),
            "error" => Ok(ConnectionState::Error),
            _ => Err(format!("Invalid connection state: {}", value)),
        }
    }
}

/// Which side of the handshake we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    /// We published the invitation and receive the request.
    Inviter,
    /// We received the invitation and send the request.
    Invitee,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Inviter => write!(f, "inviter"),
            ConnectionRole::Invitee => write!(f, "invitee"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediatorState {
    Requested,
    Granted,
    Denied,
    Active,
}

impl fmt::Display for MediatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediatorState::Requested => write!(f, "requested"),
            MediatorState::Granted => write!(f, "granted"),
            MediatorState::Denied => write!(f, "denied"),
            MediatorState::Active => write!(f, "active"),
        }
    }
}

impl TryFrom<&str> for MediatorState {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "requested" => Ok(MediatorState::Requested),
            "granted" => Ok(MediatorState::Granted),
            "denied" => Ok(MediatorState::Denied),
            "active" => Ok(MediatorState::Active),
            _ => Err(format!("Invalid mediator state: {}", value)),
        }
    }
}

/// A DID we own or one a peer shared with us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidRecord {
    pub did: String,
    pub role: DidRole,
    /// Public halves of the keys behind the DID. For owned DIDs the crypto
    /// provider holds the matching secrets.
    #[serde(default)]
    pub key_refs: Vec<KeyRef>,
    #[serde(default)]
    pub service_endpoints: Vec<Url>,
    /// Invitation this DID was published in, for DIDs created by
    /// `create_invitation`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invitation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DidRecord {
    pub fn new(did: &str, role: DidRole) -> Self {
        let now = Utc::now();
        Self {
            did: did.to_string(),
            role,
            key_refs: Vec::new(),
            service_endpoints: Vec::new(),
            invitation_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_key(mut self, key: KeyRef) -> Self {
        self.key_refs.push(key);
        self
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.service_endpoints.push(endpoint);
        self
    }
}

impl Record for DidRecord {
    const CATEGORY: &'static str = "dids";
    const TOPIC: EventTopic = EventTopic::Did;
    type State = DidRole;

    fn id(&self) -> &str {
        &self.did
    }

    fn state(&self) -> DidRole {
        self.role
    }

    fn tags(&self) -> HashMap<String, String> {
        let mut tags = HashMap::from([("role".to_string(), self.role.to_string())]);
        if let Some(invitation_id) = &self.invitation_id {
            tags.insert("invitation_id".to_string(), invitation_id.clone());
        }
        tags
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// One pairwise relationship with a peer, from invitation to completion.
///
/// `our_did` and `their_did` are ids into the DID registry; the connection
/// does not own those records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub state: ConnectionState,
    pub role: ConnectionRole,
    pub invitation_id: String,
    /// The invitation we accepted. Only set on the invitee side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invitation: Option<Invitation>,
    pub our_did: Option<String>,
    pub their_did: Option<String>,
    pub their_label: Option<String>,
    /// Id of the connection request, once there is one.
    pub thread_id: Option<String>,
    /// Id of the last message that moved this record.
    pub last_message_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionRecord {
    /// Invitee side: we received `invitation`.
    pub fn from_invitation(invitation: Invitation) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: ConnectionState::Invited,
            role: ConnectionRole::Invitee,
            invitation_id: invitation.id.clone(),
            our_did: None,
            their_did: Some(invitation.from.clone()),
            their_label: Some(invitation.label.clone()),
            thread_id: None,
            last_message_id: Some(invitation.id.clone()),
            last_error: None,
            invitation: Some(invitation),
            created_at: now,
            updated_at: now,
        }
    }

    /// Inviter side: a request `request_id` arrived for our invitation.
    pub fn from_request(
        invitation_id: &str,
        request_id: &str,
        our_did: &str,
        their_did: &str,
        their_label: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: ConnectionState::Requested,
            role: ConnectionRole::Inviter,
            invitation_id: invitation_id.to_string(),
            invitation: None,
            our_did: Some(our_did.to_string()),
            their_did: Some(their_did.to_string()),
            their_label: Some(their_label.to_string()),
            thread_id: Some(request_id.to_string()),
            last_message_id: Some(request_id.to_string()),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ConnectionState::Complete
    }
}

impl Record for ConnectionRecord {
    const CATEGORY: &'static str = "connections";
    const TOPIC: EventTopic = EventTopic::Connection;
    type State = ConnectionState;

    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn tags(&self) -> HashMap<String, String> {
        let mut tags = HashMap::from([
            ("state".to_string(), self.state.to_string()),
            ("role".to_string(), self.role.to_string()),
            ("invitation_id".to_string(), self.invitation_id.clone()),
        ]);
        if let Some(thread_id) = &self.thread_id {
            tags.insert("thread_id".to_string(), thread_id.clone());
        }
        if let Some(their_did) = &self.their_did {
            tags.insert("their_did".to_string(), their_did.clone());
        }
        tags
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Our relationship with one mediator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediatorRecord {
    pub id: String,
    pub mediator_did: String,
    pub our_did: String,
    /// Connection the mediation protocol runs over.
    pub connection_id: String,
    pub state: MediatorState,
    /// Id of the mediate-request.
    pub thread_id: String,
    /// Routing DIDs granted by the mediator.
    #[serde(default)]
    pub routing_did: Vec<String>,
    /// Connections whose messages are picked up through this mediator.
    #[serde(default)]
    pub pickup_connections: BTreeSet<String>,
    pub last_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MediatorRecord {
    pub fn new(mediator_did: &str, our_did: &str, connection_id: &str, request_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mediator_did: mediator_did.to_string(),
            our_did: our_did.to_string(),
            connection_id: connection_id.to_string(),
            state: MediatorState::Requested,
            thread_id: request_id.to_string(),
            routing_did: Vec::new(),
            pickup_connections: BTreeSet::new(),
            last_message_id: Some(request_id.to_string()),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for MediatorRecord {
    const CATEGORY: &'static str = "mediators";
    const TOPIC: EventTopic = EventTopic::Mediator;
    type State = MediatorState;

    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> MediatorState {
        self.state
    }

    fn tags(&self) -> HashMap<String, String> {
        HashMap::from([
            ("state".to_string(), self.state.to_string()),
            ("mediator_did".to_string(), self.mediator_did.clone()),
            ("thread_id".to_string(), self.thread_id.clone()),
            ("connection_id".to_string(), self.connection_id.clone()),
        ])
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}
