//! Connection Module
//!
//! Runs the DID exchange handshake on both sides:
//!
//! ```text
//!   invitee                                   inviter
//!   receive_invitation         ◀── invitation ── create_invitation
//!   send_request               ── request ──▶   handle_request
//!   handle_response            ◀── response ──  send_response
//!   send_complete              ── complete ──▶  handle_complete
//! ```
//!
//! Every step goes through the [`ConnectionFsm`]: the record is persisted in
//! its new state (publishing one `updated` event) before the message that
//! caused or announces the transition leaves. Repeating a step that is
//! already reflected in the record re-sends the same message id and
//! publishes nothing.
//!
//! Threading follows DID exchange: the request's `pthid` is the invitation
//! id, the request id is the thread id of every later message.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use vcx_agent::{create_peer_did_2, DidDoc, MessagingModule};
use vcx_msg::message::{
    ConnectionComplete, ConnectionRequest, ConnectionResponse, Invitation, ProblemReport,
};
use vcx_msg::{AgentMessage, MessageBody, PlainMessage};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, RegistryError};
use crate::event::{Event, EventBus, EventKind, EventTopic};
use crate::registry::{
    ConnectionRecord, ConnectionRegistry, ConnectionState, DidRecord, DidRegistry, DidRole,
};
use crate::state_machine::{ConnectionEvent, ConnectionFsm, Outcome};
use crate::transport::TransportService;

type Result<T> = std::result::Result<T, ConnectionError>;

/// Problem code sent to the peer when we abandon a connection.
pub const CONNECTION_PROBLEM_CODE: &str = "e.p.connection";

#[derive(Debug, Clone)]
pub struct ConnectionModule {
    config: ConnectionConfig,
    label: String,
    endpoint: Url,
    connections: ConnectionRegistry,
    dids: DidRegistry,
    messaging: MessagingModule,
    transport: Arc<TransportService>,
    events: Arc<EventBus>,
}

impl ConnectionModule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConnectionConfig,
        label: impl Into<String>,
        endpoint: Url,
        connections: ConnectionRegistry,
        dids: DidRegistry,
        messaging: MessagingModule,
        transport: Arc<TransportService>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            label: label.into(),
            endpoint,
            connections,
            dids,
            messaging,
            transport,
            events,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    // -----------------------------------------------------------------------
    // Inviter
    // -----------------------------------------------------------------------

    /// Create a fresh DID and an invitation naming it.
    ///
    /// No connection record exists until a request for the invitation
    /// arrives; the DID record remembers which invitation it belongs to.
    pub async fn create_invitation(&self, label: Option<&str>) -> Result<(Invitation, DidRecord)> {
        let invitation_did = self.create_owned_did().await?;
        let invitation = Invitation::new(&invitation_did.did, label.unwrap_or(&self.label));

        let record = DidRecord {
            invitation_id: Some(invitation.id.clone()),
            ..invitation_did
        };
        self.dids
            .create(record.clone())
            .await
            .map_err(|source| ConnectionError::Registry {
                id: record.did.clone(),
                source,
            })?;

        info!("Created invitation {} from {}", invitation.id, record.did);
        Ok((invitation, record))
    }

    /// A request for one of our invitations arrived.
    pub async fn handle_request(&self, plain: &PlainMessage, sender_did: &str) -> Result<ConnectionRecord> {
        let request = ConnectionRequest::from_plain(plain).map_err(|source| {
            ConnectionError::ParseMessage {
                message_id: plain.id.clone(),
                source,
            }
        })?;
        if request.did != sender_did {
            return Err(ConnectionError::UnexpectedSender {
                id: plain.id.clone(),
                sender: sender_did.to_string(),
            });
        }
        let invitation_id = plain.pthid.as_deref().ok_or_else(|| ConnectionError::ParseMessage {
            message_id: plain.id.clone(),
            source: vcx_msg::Error::MissingHeader("pthid", plain.id.clone()),
        })?;

        // Redelivered request: let the state machine decide.
        if let Some(existing) = self.find_by_thread(&plain.id).await? {
            let event = ConnectionEvent::RequestReceived {
                message_id: plain.id.clone(),
            };
            let (record, _) = self.advance(&existing, event, |_| {}).await?;
            return Ok(record);
        }

        let invitation_did = self
            .dids
            .find_by_tag("invitation_id", invitation_id)
            .await
            .map_err(|source| ConnectionError::Registry {
                id: invitation_id.to_string(),
                source,
            })?
            .into_iter()
            .find(|record| record.role == DidRole::Owned)
            .ok_or_else(|| ConnectionError::UnknownThread {
                message_id: plain.id.clone(),
            })?;

        self.remember_peer_did(sender_did).await?;

        let record = ConnectionRecord::from_request(
            invitation_id,
            &plain.id,
            &invitation_did.did,
            sender_did,
            &request.label,
        );
        self.connections
            .create(record.clone())
            .await
            .map_err(|source| ConnectionError::Registry {
                id: record.id.clone(),
                source,
            })?;
        info!(
            "Connection {} requested by {} ({}) for invitation {}",
            record.id, request.label, sender_did, invitation_id
        );

        if self.config.auto_respond_to_requests {
            return self.send_response(&record.id).await;
        }
        Ok(record)
    }

    /// Answer the request on `connection_id`.
    pub async fn send_response(&self, connection_id: &str) -> Result<ConnectionRecord> {
        let record = self.get_required(connection_id).await?;
        let message_id = Self::outbound_id(&record, ConnectionState::Responded);
        let event = ConnectionEvent::ResponseSent {
            message_id: message_id.clone(),
        };
        let (record, replayed) = self.advance(&record, event, |_| {}).await?;

        let (our_did, their_did) = Self::pair(&record)?;
        let plain = ConnectionResponse {
            did: our_did.to_string(),
        }
        .to_plain(our_did, their_did)
        .map(|plain| Self::threaded(plain, message_id, &record, false))
        .map_err(|source| ConnectionError::BuildMessage {
            kind: "response",
            source,
        })?;

        self.send_message(&record, &plain, replayed).await?;
        Ok(record)
    }

    /// The invitee confirmed the connection.
    pub async fn handle_complete(&self, plain: &PlainMessage, sender_did: &str) -> Result<ConnectionRecord> {
        ConnectionComplete::from_plain(plain).map_err(|source| ConnectionError::ParseMessage {
            message_id: plain.id.clone(),
            source,
        })?;
        let record = self.thread_record(plain, sender_did).await?;
        let event = ConnectionEvent::CompleteReceived {
            message_id: plain.id.clone(),
        };
        let (record, _) = self.advance(&record, event, |_| {}).await?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Invitee
    // -----------------------------------------------------------------------

    /// Record an invitation we were given.
    ///
    /// Receiving the same invitation twice returns the existing record.
    pub async fn receive_invitation(&self, invitation: Invitation) -> Result<ConnectionRecord> {
        invitation
            .validate()
            .map_err(|source| ConnectionError::InvalidInvitation { source })?;

        let event = ConnectionEvent::InvitationReceived {
            message_id: invitation.id.clone(),
        };
        let existing = self
            .connections
            .find_by_tag("invitation_id", &invitation.id)
            .await
            .map_err(|source| ConnectionError::Registry {
                id: invitation.id.clone(),
                source,
            })?;
        for record in existing {
            if let Ok(Outcome::Replay) = ConnectionFsm::apply(&record, &event) {
                debug!("Invitation {} already recorded as {}", invitation.id, record.id);
                return Ok(record);
            }
        }

        self.remember_peer_did(&invitation.from).await?;

        let record = ConnectionRecord::from_invitation(invitation);
        self.connections
            .create(record.clone())
            .await
            .map_err(|source| ConnectionError::Registry {
                id: record.id.clone(),
                source,
            })?;
        info!(
            "Received invitation {} from {}, connection {}",
            record.invitation_id,
            record.their_did.as_deref().unwrap_or_default(),
            record.id
        );

        if self.config.auto_accept_invitations {
            return self.send_request(&record.id).await;
        }
        Ok(record)
    }

    /// Accept the invitation on `connection_id` with a fresh DID.
    pub async fn send_request(&self, connection_id: &str) -> Result<ConnectionRecord> {
        let record = self.get_required(connection_id).await?;
        let message_id = Self::outbound_id(&record, ConnectionState::Requested);
        let event = ConnectionEvent::RequestSent {
            message_id: message_id.clone(),
        };

        // Check before minting a DID so rejected calls leave nothing behind.
        let outcome = ConnectionFsm::apply(&record, &event).map_err(|source| {
            ConnectionError::InvalidStateTransition {
                id: record.id.clone(),
                source,
            }
        })?;
        let our_did = match (&outcome, &record.our_did) {
            (Outcome::Replay, Some(did)) => did.clone(),
            _ => {
                let did_record = self.create_owned_did().await?;
                self.dids
                    .create(did_record.clone())
                    .await
                    .map_err(|source| ConnectionError::Registry {
                        id: did_record.did.clone(),
                        source,
                    })?;
                did_record.did
            }
        };

        let patched_did = our_did.clone();
        let thread_id = message_id.clone();
        let (record, replayed) = self
            .advance(&record, event, move |r| {
                r.our_did = Some(patched_did);
                r.thread_id = Some(thread_id);
            })
            .await?;

        let (_, their_did) = Self::pair(&record)?;
        let plain = ConnectionRequest {
            label: self.label.clone(),
            did: our_did.clone(),
            goal: None,
        }
        .to_plain(&our_did, their_did)
        .map(|plain| {
            PlainMessage {
                id: message_id,
                ..plain
            }
            .with_parent_thread_id(Some(record.invitation_id.clone()))
        })
        .map_err(|source| ConnectionError::BuildMessage {
            kind: "request",
            source,
        })?;

        self.send_message(&record, &plain, replayed).await?;
        Ok(record)
    }

    /// The inviter answered our request.
    pub async fn handle_response(&self, plain: &PlainMessage, sender_did: &str) -> Result<ConnectionRecord> {
        let response = ConnectionResponse::from_plain(plain).map_err(|source| {
            ConnectionError::ParseMessage {
                message_id: plain.id.clone(),
                source,
            }
        })?;
        let record = self.thread_record(plain, sender_did).await?;
        if response.did != sender_did {
            if let Err(e) = self.remember_peer_did(&response.did).await {
                return Err(self.abort(&record, e).await);
            }
        }

        let event = ConnectionEvent::ResponseReceived {
            message_id: plain.id.clone(),
        };
        let their_did = response.did.clone();
        let (record, replayed) = self
            .advance(&record, event, move |r| r.their_did = Some(their_did))
            .await?;

        if !replayed && self.config.auto_complete_requests {
            return self.send_complete(&record.id).await;
        }
        Ok(record)
    }

    /// Acknowledge the response on `connection_id`.
    pub async fn send_complete(&self, connection_id: &str) -> Result<ConnectionRecord> {
        let record = self.get_required(connection_id).await?;
        let message_id = Self::outbound_id(&record, ConnectionState::Complete);
        let event = ConnectionEvent::CompleteSent {
            message_id: message_id.clone(),
        };
        let (record, replayed) = self.advance(&record, event, |_| {}).await?;

        let (our_did, their_did) = Self::pair(&record)?;
        let plain = ConnectionComplete::default()
            .to_plain(our_did, their_did)
            .map(|plain| Self::threaded(plain, message_id, &record, true))
            .map_err(|source| ConnectionError::BuildMessage {
                kind: "complete",
                source,
            })?;

        self.send_message(&record, &plain, replayed).await?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    /// Move `connection_id` to `Error` and tell the peer, if we can reach it.
    pub async fn fail(&self, connection_id: &str, detail: &str) -> Result<ConnectionRecord> {
        let record = self.get_required(connection_id).await?;
        let event = ConnectionEvent::Failed {
            detail: detail.to_string(),
        };
        let (record, replayed) = self.advance(&record, event, |_| {}).await?;
        if replayed {
            return Ok(record);
        }

        if let Err(e) = self.send_problem_report(&record, detail).await {
            warn!("Could not report failure of connection {} to peer: {}", record.id, e);
        }
        Ok(record)
    }

    /// End a live connection on an error it cannot recover from, then hand
    /// the error back. Terminal records are left as they are.
    async fn abort(&self, record: &ConnectionRecord, cause: ConnectionError) -> ConnectionError {
        if record.state.is_terminal() {
            return cause;
        }
        let detail = match std::error::Error::source(&cause) {
            Some(source) => format!("{}: {}", cause, source),
            None => cause.to_string(),
        };
        if let Err(e) = self.fail(&record.id, &detail).await {
            warn!("Could not fail connection {}: {}", record.id, e);
        }
        cause
    }

    /// The peer abandoned the connection.
    pub async fn handle_problem_report(
        &self,
        plain: &PlainMessage,
        sender_did: &str,
    ) -> Result<ConnectionRecord> {
        let report = ProblemReport::from_plain(plain).map_err(|source| {
            ConnectionError::ParseMessage {
                message_id: plain.id.clone(),
                source,
            }
        })?;
        let record = self.thread_record(plain, sender_did).await?;
        let detail = match &report.comment {
            Some(comment) => format!("{}: {}", report.code, comment),
            None => report.code.clone(),
        };
        warn!("Connection {} failed by peer: {}", record.id, detail);

        self.events
            .publish(Event::new(
                EventKind::ProblemReported,
                EventTopic::Connection,
                record.id.clone(),
                json!({ "message_id": plain.id, "code": report.code, "comment": report.comment }),
            ))
            .await;

        let event = ConnectionEvent::Failed { detail };
        let (record, _) = self.advance(&record, event, |_| {}).await?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, connection_id: &str) -> Result<Option<ConnectionRecord>> {
        self.connections
            .read(connection_id)
            .await
            .map_err(|source| ConnectionError::Registry {
                id: connection_id.to_string(),
                source,
            })
    }

    pub async fn list(&self) -> Result<Vec<ConnectionRecord>> {
        self.connections
            .list()
            .await
            .map_err(|source| ConnectionError::Registry {
                id: "*".to_string(),
                source,
            })
    }

    /// The connection whose handshake runs on `thread_id`.
    pub async fn find_by_thread(&self, thread_id: &str) -> Result<Option<ConnectionRecord>> {
        let mut found = self
            .connections
            .find_by_tag("thread_id", thread_id)
            .await
            .map_err(|source| ConnectionError::Registry {
                id: thread_id.to_string(),
                source,
            })?;
        Ok(found.pop())
    }

    /// Complete connections to `their_did`, newest last.
    pub async fn find_by_their_did(&self, their_did: &str) -> Result<Vec<ConnectionRecord>> {
        let found = self
            .connections
            .find_by_tag("their_did", their_did)
            .await
            .map_err(|source| ConnectionError::Registry {
                id: their_did.to_string(),
                source,
            })?;
        Ok(found.into_iter().filter(ConnectionRecord::is_complete).collect())
    }

    /// Route an inbound connection-protocol message.
    pub async fn handle_inbound(
        &self,
        message: &AgentMessage,
        plain: &PlainMessage,
        sender_did: &str,
    ) -> Result<ConnectionRecord> {
        match message {
            AgentMessage::Invitation(invitation) => self.receive_invitation(invitation.clone()).await,
            AgentMessage::Request(_) => self.handle_request(plain, sender_did).await,
            AgentMessage::Response(_) => self.handle_response(plain, sender_did).await,
            AgentMessage::Complete(_) => self.handle_complete(plain, sender_did).await,
            AgentMessage::ProblemReport(_) => self.handle_problem_report(plain, sender_did).await,
            other => Err(ConnectionError::UnsupportedMessage(other.name())),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Apply `event` to `record`, persisting the result unless it is a
    /// replay. Returns the resulting record and whether it was a replay.
    async fn advance(
        &self,
        record: &ConnectionRecord,
        event: ConnectionEvent,
        patch: impl FnOnce(&mut ConnectionRecord),
    ) -> Result<(ConnectionRecord, bool)> {
        let outcome = ConnectionFsm::apply(record, &event).map_err(|source| {
            ConnectionError::InvalidStateTransition {
                id: record.id.clone(),
                source,
            }
        })?;

        let (from, to) = match outcome {
            Outcome::Replay => {
                debug!("Connection {} already reflects {}", record.id, event);
                return Ok((record.clone(), true));
            }
            Outcome::Transition { from, to } => (from, to),
        };

        let updated = self
            .connections
            .update(&record.id, Some(from), |r| {
                r.state = to;
                match &event {
                    ConnectionEvent::Failed { detail } => r.last_error = Some(detail.clone()),
                    _ => r.last_message_id = event.message_id().map(str::to_string),
                }
                patch(r);
            })
            .await
            .map_err(|source| match source {
                RegistryError::NotFound { .. } => ConnectionError::NotFound(record.id.clone()),
                source => ConnectionError::Registry {
                    id: record.id.clone(),
                    source,
                },
            })?;

        info!("Connection {}: {} -> {} on {}", updated.id, from, to, event);
        Ok((updated, false))
    }

    /// Encrypt `plain` for the peer and hand it to the transport.
    async fn send_message(&self, record: &ConnectionRecord, plain: &PlainMessage, replayed: bool) -> Result<()> {
        let (our_did, their_did) = Self::pair(record)?;
        let bytes = plain.to_bytes().map_err(|source| ConnectionError::BuildMessage {
            kind: "outbound",
            source,
        })?;

        let encrypted = self
            .messaging
            .encrypt(&bytes, their_did, our_did)
            .await
            .map_err(|source| ConnectionError::Messaging {
                id: record.id.clone(),
                source,
            })?;
        if !encrypted.routing_keys.is_empty() {
            debug!(
                "Peer {} advertises routing keys {:?}; sending directly to {}",
                their_did, encrypted.routing_keys, encrypted.endpoint
            );
        }
        let envelope = MessagingModule::envelope_to_bytes(&encrypted.envelope).map_err(|source| {
            ConnectionError::Messaging {
                id: record.id.clone(),
                source,
            }
        })?;

        self.transport
            .send(&envelope, &encrypted.endpoint)
            .await
            .map_err(|source| ConnectionError::Transport {
                id: record.id.clone(),
                source,
            })?;

        if replayed {
            debug!("Re-sent {} on connection {}", plain.id, record.id);
        } else {
            self.events
                .publish(Event::new(
                    EventKind::MessageSent,
                    EventTopic::Messaging,
                    plain.id.clone(),
                    json!({
                        "connection_id": record.id,
                        "type": plain.type_,
                        "to": their_did,
                    }),
                ))
                .await;
        }
        Ok(())
    }

    async fn send_problem_report(&self, record: &ConnectionRecord, detail: &str) -> Result<()> {
        let (Some(_), Some(_), Some(thread_id)) = (&record.our_did, &record.their_did, &record.thread_id) else {
            debug!("Connection {} has no thread with the peer yet, not reporting", record.id);
            return Ok(());
        };
        let (our_did, their_did) = Self::pair(record)?;
        let plain = ProblemReport::new(CONNECTION_PROBLEM_CODE, detail)
            .to_plain(our_did, their_did)
            .map(|plain| plain.with_thread_id(Some(thread_id.clone())))
            .map_err(|source| ConnectionError::BuildMessage {
                kind: "problem-report",
                source,
            })?;
        self.send_message(record, &plain, false).await
    }

    /// Find the record for a threaded reply and check who sent it.
    async fn thread_record(&self, plain: &PlainMessage, sender_did: &str) -> Result<ConnectionRecord> {
        let thread_id = plain.thid.as_deref().ok_or_else(|| ConnectionError::UnknownThread {
            message_id: plain.id.clone(),
        })?;
        let record = self
            .find_by_thread(thread_id)
            .await?
            .ok_or_else(|| ConnectionError::UnknownThread {
                message_id: plain.id.clone(),
            })?;
        if record.their_did.as_deref() != Some(sender_did) {
            return Err(ConnectionError::UnexpectedSender {
                id: record.id,
                sender: sender_did.to_string(),
            });
        }
        Ok(record)
    }

    async fn get_required(&self, connection_id: &str) -> Result<ConnectionRecord> {
        self.get(connection_id)
            .await?
            .ok_or_else(|| ConnectionError::NotFound(connection_id.to_string()))
    }

    /// A new key and a did:peer:2 on our endpoint. Not persisted.
    async fn create_owned_did(&self) -> Result<DidRecord> {
        let key = self
            .messaging
            .crypto()
            .create_key()
            .await
            .map_err(|source| ConnectionError::CreateKey { source })?;
        let did = create_peer_did_2(&key, &self.endpoint, &[])
            .map_err(|source| ConnectionError::CreatePeerDid { source })?;
        debug!("Created DID {}", did);
        Ok(DidRecord::new(&did, DidRole::Owned)
            .with_key(key)
            .with_endpoint(self.endpoint.clone()))
    }

    /// Resolve a peer DID and keep what it advertises in the DID registry.
    async fn remember_peer_did(&self, did: &str) -> Result<DidDoc> {
        let doc = self
            .messaging
            .resolver()
            .resolve(did)
            .await
            .map_err(|source| ConnectionError::DidResolution {
                did: did.to_string(),
                source,
            })?;

        let known = self
            .dids
            .read(did)
            .await
            .map_err(|source| ConnectionError::Registry {
                id: did.to_string(),
                source,
            })?;
        if known.is_some() {
            return Ok(doc);
        }

        let mut record = DidRecord::new(did, DidRole::SharedByPeer);
        if let Some(binding) = doc.key_agreement_key() {
            record = record.with_key(binding.key);
        }
        if let Some(service) = doc.didcomm_service() {
            record = record.with_endpoint(service.service_endpoint.clone());
        }
        match self.dids.create(record).await {
            Ok(_) | Err(RegistryError::Duplicate { .. }) => Ok(doc),
            Err(source) => Err(ConnectionError::Registry {
                id: did.to_string(),
                source,
            }),
        }
    }

    /// Id for the message moving `record` to `target`: the one already sent
    /// if the record is there, a fresh one otherwise.
    fn outbound_id(record: &ConnectionRecord, target: ConnectionState) -> String {
        match (&record.last_message_id, record.state == target) {
            (Some(id), true) => id.clone(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    fn threaded(plain: PlainMessage, id: String, record: &ConnectionRecord, with_parent: bool) -> PlainMessage {
        let plain = PlainMessage { id, ..plain }.with_thread_id(record.thread_id.clone());
        if with_parent {
            plain.with_parent_thread_id(Some(record.invitation_id.clone()))
        } else {
            plain
        }
    }

    fn pair(record: &ConnectionRecord) -> Result<(&str, &str)> {
        match (record.our_did.as_deref(), record.their_did.as_deref()) {
            (Some(ours), Some(theirs)) => Ok((ours, theirs)),
            _ => Err(ConnectionError::InvalidStateTransition {
                id: record.id.clone(),
                source: crate::state_machine::InvalidTransition::new(
                    record.state,
                    "send",
                    "connection has no DID pair yet",
                ),
            }),
        }
    }
}
