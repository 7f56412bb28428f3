//! Mediation Module
//!
//! Our side of coordinate-mediation and message pickup: we ask a mediator
//! to route for us, tell it which of our DIDs to accept messages for, and
//! fetch what it queued. Mediator records follow the [`MediationFsm`] with
//! the same persist-then-emit discipline as connections.
//!
//! The module owns no timers. Periodic pickup is driven from outside by
//! the [`PickupWorker`](crate::pickup::PickupWorker).

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vcx_agent::MessagingModule;
use vcx_msg::message::mediation::KeylistAction;
use vcx_msg::message::{
    Delivery, DeliveryRequest, KeylistUpdate, KeylistUpdateResponse, MediateDeny, MediateGrant,
    MediateRequest, MessagesReceived, Status, StatusRequest,
};
use vcx_msg::{AgentMessage, MessageBody, PlainMessage};

use crate::config::MediationConfig;
use crate::error::{MediationError, RegistryError};
use crate::event::{Event, EventBus, EventKind, EventTopic};
use crate::registry::{
    ConnectionRecord, ConnectionRegistry, MediatorRecord, MediatorRegistry, MediatorState,
};
use crate::state_machine::{MediationEvent, MediationFsm, Outcome};
use crate::transport::TransportService;

type Result<T> = std::result::Result<T, MediationError>;

#[derive(Debug, Clone)]
pub struct MediationModule {
    config: MediationConfig,
    mediators: MediatorRegistry,
    connections: ConnectionRegistry,
    messaging: MessagingModule,
    transport: Arc<TransportService>,
    events: Arc<EventBus>,
}

impl MediationModule {
    pub fn new(
        config: MediationConfig,
        mediators: MediatorRegistry,
        connections: ConnectionRegistry,
        messaging: MessagingModule,
        transport: Arc<TransportService>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            mediators,
            connections,
            messaging,
            transport,
            events,
        }
    }

    pub fn config(&self) -> &MediationConfig {
        &self.config
    }

    /// Ask `mediator_did` to mediate for us over the complete connection
    /// `connection_id`.
    ///
    /// While a request to that mediator is still unanswered, calling again
    /// re-sends the same request.
    pub async fn request_mediation(
        &self,
        mediator_did: &str,
        connection_id: &str,
    ) -> Result<MediatorRecord> {
        let connection = self.ready_connection(connection_id).await?;
        if connection.their_did.as_deref() != Some(mediator_did) {
            return Err(MediationError::MediatorMismatch {
                connection_id: connection_id.to_string(),
                mediator_did: mediator_did.to_string(),
            });
        }
        let our_did = connection
            .our_did
            .clone()
            .ok_or_else(|| MediationError::ConnectionNotReady {
                connection_id: connection_id.to_string(),
                state: connection.state.to_string(),
            })?;

        let pending = self
            .find_by_mediator(mediator_did)
            .await?
            .into_iter()
            .find(|r| r.state == MediatorState::Requested && r.connection_id == connection_id);

        let (record, resend) = match pending {
            Some(record) => (record, true),
            None => {
                let record = MediatorRecord::new(
                    mediator_did,
                    &our_did,
                    connection_id,
                    &Uuid::new_v4().to_string(),
                );
                self.mediators
                    .create(record.clone())
                    .await
                    .map_err(|source| MediationError::Registry {
                        id: record.id.clone(),
                        source,
                    })?;
                info!("Requested mediation from {} as {}", mediator_did, record.id);
                (record, false)
            }
        };

        let plain = MediateRequest::default()
            .to_plain(&record.our_did, &record.mediator_did)
            .map(|plain| PlainMessage {
                id: record.thread_id.clone(),
                ..plain
            })
            .map_err(|source| MediationError::BuildMessage {
                kind: "mediate-request",
                source,
            })?;
        self.send_message(&record, &plain, !resend).await?;
        Ok(record)
    }

    /// The mediator granted our request.
    pub async fn handle_grant(&self, plain: &PlainMessage, sender_did: &str) -> Result<MediatorRecord> {
        let grant = MediateGrant::from_plain(plain).map_err(|source| MediationError::ParseMessage {
            message_id: plain.id.clone(),
            source,
        })?;
        let record = self.thread_record(plain, sender_did).await?;
        let event = MediationEvent::GrantReceived {
            message_id: plain.id.clone(),
        };
        let (record, _) = self
            .advance(&record, event, move |r| r.routing_did = grant.routing_did)
            .await?;
        Ok(record)
    }

    /// The mediator refused our request.
    pub async fn handle_deny(&self, plain: &PlainMessage, sender_did: &str) -> Result<MediatorRecord> {
        MediateDeny::from_plain(plain).map_err(|source| MediationError::ParseMessage {
            message_id: plain.id.clone(),
            source,
        })?;
        let record = self.thread_record(plain, sender_did).await?;
        let event = MediationEvent::DenyReceived {
            message_id: plain.id.clone(),
        };
        let (record, _) = self.advance(&record, event, |_| {}).await?;
        warn!("Mediator {} denied mediation {}", record.mediator_did, record.id);
        Ok(record)
    }

    /// Route messages for `connection_id` through a mediator and pick them
    /// up from there.
    ///
    /// Without `mediator_id` the configured default mediator is used, or the
    /// only granted one.
    pub async fn register_connection_for_pickup(
        &self,
        mediator_id: Option<&str>,
        connection_id: &str,
    ) -> Result<MediatorRecord> {
        let mediator = self.select_mediator(mediator_id).await?;
        let connection = self.ready_connection(connection_id).await?;

        let event = MediationEvent::PickupRegistered {
            connection_id: connection_id.to_string(),
        };
        let registered = connection_id.to_string();
        let (mediator, replayed) = self
            .advance(&mediator, event, move |r| {
                r.pickup_connections.insert(registered);
            })
            .await?;
        if replayed {
            return Ok(mediator);
        }

        if let Some(our_did) = &connection.our_did {
            self.send_keylist_update(&mediator, our_did, KeylistAction::Add)
                .await?;
        }
        Ok(mediator)
    }

    /// Stop picking up messages for `connection_id`.
    pub async fn unregister_connection_for_pickup(
        &self,
        mediator_id: Option<&str>,
        connection_id: &str,
    ) -> Result<MediatorRecord> {
        let mediator = self.select_mediator(mediator_id).await?;
        let event = MediationEvent::PickupUnregistered {
            connection_id: connection_id.to_string(),
        };
        let unregistered = connection_id.to_string();
        let (mediator, replayed) = self
            .advance(&mediator, event, move |r| {
                r.pickup_connections.remove(&unregistered);
            })
            .await?;
        if replayed {
            return Ok(mediator);
        }

        // The connection is only a weak reference; it may be gone by now.
        match self.connections.read(connection_id).await {
            Ok(Some(ConnectionRecord {
                our_did: Some(our_did),
                ..
            })) => {
                self.send_keylist_update(&mediator, &our_did, KeylistAction::Remove)
                    .await?;
            }
            Ok(_) => debug!(
                "Connection {} no longer exists, not updating mediator keylist",
                connection_id
            ),
            Err(e) => warn!("Cannot read connection {}: {}", connection_id, e),
        }
        Ok(mediator)
    }

    pub async fn handle_keylist_update_response(
        &self,
        plain: &PlainMessage,
        sender_did: &str,
    ) -> Result<MediatorRecord> {
        let response = KeylistUpdateResponse::from_plain(plain).map_err(|source| {
            MediationError::ParseMessage {
                message_id: plain.id.clone(),
                source,
            }
        })?;
        let mediator = self.sender_mediator(plain, sender_did).await?;
        for updated in &response.updated {
            info!(
                "Mediator {} keylist {} {}: {:?}",
                mediator.id, updated.action, updated.recipient_did, updated.result
            );
        }
        Ok(mediator)
    }

    /// Delete the mediator record.
    pub async fn remove_mediator(&self, mediator_id: &str) -> Result<()> {
        self.mediators
            .delete(mediator_id)
            .await
            .map_err(|source| match source {
                RegistryError::NotFound { .. } => MediationError::NotFound(mediator_id.to_string()),
                source => MediationError::Registry {
                    id: mediator_id.to_string(),
                    source,
                },
            })?;
        info!("Removed mediator {}", mediator_id);
        Ok(())
    }

    pub async fn get(&self, mediator_id: &str) -> Result<Option<MediatorRecord>> {
        self.mediators
            .read(mediator_id)
            .await
            .map_err(|source| MediationError::Registry {
                id: mediator_id.to_string(),
                source,
            })
    }

    pub async fn list(&self) -> Result<Vec<MediatorRecord>> {
        self.mediators
            .list()
            .await
            .map_err(|source| MediationError::Registry {
                id: "*".to_string(),
                source,
            })
    }

    // -----------------------------------------------------------------------
    // Pickup
    // -----------------------------------------------------------------------

    /// A status request for the mediator `mediator_id`, asking for a reply
    /// on the same transport.
    pub async fn build_status_request(&self, mediator_id: &str) -> Result<PlainMessage> {
        let mediator = self.routing_mediator(mediator_id).await?;
        StatusRequest::default()
            .to_plain(&mediator.our_did, &mediator.mediator_did)
            .map(PlainMessage::with_return_route)
            .map_err(|source| MediationError::BuildMessage {
                kind: "status-request",
                source,
            })
    }

    /// A delivery request for up to `pickup_batch_size` queued messages.
    pub async fn build_pickup_request(&self, mediator_id: &str) -> Result<PlainMessage> {
        let mediator = self.routing_mediator(mediator_id).await?;
        DeliveryRequest {
            limit: self.config.pickup_batch_size,
            recipient_did: None,
        }
        .to_plain(&mediator.our_did, &mediator.mediator_did)
        .map(PlainMessage::with_return_route)
        .map_err(|source| MediationError::BuildMessage {
            kind: "delivery-request",
            source,
        })
    }

    /// Ask the mediator for queued messages. The delivery comes back as an
    /// inbound message.
    pub async fn send_delivery_request(&self, mediator_id: &str) -> Result<()> {
        let mediator = self.routing_mediator(mediator_id).await?;
        let plain = self.build_pickup_request(mediator_id).await?;
        self.send_message(&mediator, &plain, true).await
    }

    pub async fn send_status_request(&self, mediator_id: &str) -> Result<()> {
        let mediator = self.routing_mediator(mediator_id).await?;
        let plain = self.build_status_request(mediator_id).await?;
        self.send_message(&mediator, &plain, true).await
    }

    /// One pickup round: a delivery request to every active mediator.
    /// Returns how many requests were sent.
    pub async fn pickup_all(&self) -> Result<usize> {
        let mut sent = 0;
        for mediator in self.list().await? {
            if mediator.state != MediatorState::Active {
                continue;
            }
            match self.send_delivery_request(&mediator.id).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Pickup from mediator {} failed: {}", mediator.id, e),
            }
        }
        Ok(sent)
    }

    /// The mediator reported how many messages it holds for us. Fetches them
    /// when there are any.
    pub async fn handle_status(&self, plain: &PlainMessage, sender_did: &str) -> Result<Status> {
        let status = Status::from_plain(plain).map_err(|source| MediationError::ParseMessage {
            message_id: plain.id.clone(),
            source,
        })?;
        let mediator = self.sender_mediator(plain, sender_did).await?;
        debug!("Mediator {} holds {} messages", mediator.id, status.message_count);
        if status.message_count > 0 {
            self.send_delivery_request(&mediator.id).await?;
        }
        Ok(status)
    }

    /// Unwrap a delivery. Returns the queued envelopes, still encrypted, and
    /// acknowledges them to the mediator.
    pub async fn handle_delivery(&self, plain: &PlainMessage, sender_did: &str) -> Result<Vec<Vec<u8>>> {
        Delivery::from_plain(plain).map_err(|source| MediationError::ParseMessage {
            message_id: plain.id.clone(),
            source,
        })?;
        let mediator = self.sender_mediator(plain, sender_did).await?;

        let attachments = plain.attachments.as_deref().unwrap_or_default();
        let mut envelopes = Vec::with_capacity(attachments.len());
        let mut received = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let bytes = attachment
                .decode()
                .map_err(|source| MediationError::MalformedDelivery {
                    message_id: plain.id.clone(),
                    source,
                })?;
            envelopes.push(bytes);
            received.push(attachment.id.clone());
        }
        info!("Mediator {} delivered {} messages", mediator.id, envelopes.len());

        if !received.is_empty() {
            let ack = MessagesReceived {
                message_id_list: received,
            }
            .to_plain(&mediator.our_did, &mediator.mediator_did)
            .map(|ack| ack.with_thread_id(Some(plain.thread_id().to_string())))
            .map_err(|source| MediationError::BuildMessage {
                kind: "messages-received",
                source,
            })?;
            if let Err(e) = self.send_message(&mediator, &ack, true).await {
                // The mediator re-delivers unacknowledged messages.
                warn!("Could not acknowledge delivery {}: {}", plain.id, e);
            }
        }
        Ok(envelopes)
    }

    /// Route an inbound mediation or pickup message. Returns the envelopes
    /// carried by a delivery, empty for everything else.
    pub async fn handle_inbound(
        &self,
        message: &AgentMessage,
        plain: &PlainMessage,
        sender_did: &str,
    ) -> Result<Vec<Vec<u8>>> {
        match message {
            AgentMessage::MediateGrant(_) => {
                self.handle_grant(plain, sender_did).await?;
            }
            AgentMessage::MediateDeny(_) => {
                self.handle_deny(plain, sender_did).await?;
            }
            AgentMessage::KeylistUpdateResponse(_) => {
                self.handle_keylist_update_response(plain, sender_did).await?;
            }
            AgentMessage::Status(_) => {
                self.handle_status(plain, sender_did).await?;
            }
            AgentMessage::Delivery(_) => return self.handle_delivery(plain, sender_did).await,
            other => return Err(MediationError::UnsupportedMessage(other.name())),
        }
        Ok(Vec::new())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn advance(
        &self,
        record: &MediatorRecord,
        event: MediationEvent,
        patch: impl FnOnce(&mut MediatorRecord),
    ) -> Result<(MediatorRecord, bool)> {
        let outcome =
            MediationFsm::apply(record, &event).map_err(|source| MediationError::InvalidStateTransition {
                id: record.id.clone(),
                source,
            })?;

        let (from, to) = match outcome {
            Outcome::Replay => {
                debug!("Mediator {} already reflects {}", record.id, event);
                return Ok((record.clone(), true));
            }
            Outcome::Transition { from, to } => (from, to),
        };

        let updated = self
            .mediators
            .update(&record.id, Some(from), |r| {
                r.state = to;
                if let MediationEvent::GrantReceived { message_id }
                | MediationEvent::DenyReceived { message_id } = &event
                {
                    r.last_message_id = Some(message_id.clone());
                }
                patch(r);
            })
            .await
            .map_err(|source| match source {
                RegistryError::NotFound { .. } => MediationError::NotFound(record.id.clone()),
                source => MediationError::Registry {
                    id: record.id.clone(),
                    source,
                },
            })?;

        info!("Mediator {}: {} -> {} on {}", updated.id, from, to, event);
        Ok((updated, false))
    }

    async fn send_keylist_update(
        &self,
        mediator: &MediatorRecord,
        recipient_did: &str,
        action: KeylistAction,
    ) -> Result<()> {
        let plain = KeylistUpdate::single(recipient_did, action)
            .to_plain(&mediator.our_did, &mediator.mediator_did)
            .map_err(|source| MediationError::BuildMessage {
                kind: "keylist-update",
                source,
            })?;
        self.send_message(mediator, &plain, true).await
    }

    async fn send_message(&self, mediator: &MediatorRecord, plain: &PlainMessage, announce: bool) -> Result<()> {
        let bytes = plain.to_bytes().map_err(|source| MediationError::BuildMessage {
            kind: "outbound",
            source,
        })?;
        let encrypted = self
            .messaging
            .encrypt(&bytes, &mediator.mediator_did, &mediator.our_did)
            .await
            .map_err(|source| MediationError::Messaging {
                id: mediator.id.clone(),
                source,
            })?;
        let envelope = MessagingModule::envelope_to_bytes(&encrypted.envelope).map_err(|source| {
            MediationError::Messaging {
                id: mediator.id.clone(),
                source,
            }
        })?;

        self.transport
            .send(&envelope, &encrypted.endpoint)
            .await
            .map_err(|source| MediationError::Transport {
                id: mediator.id.clone(),
                source,
            })?;

        if announce {
            self.events
                .publish(Event::new(
                    EventKind::MessageSent,
                    EventTopic::Messaging,
                    plain.id.clone(),
                    json!({
                        "mediator_id": mediator.id,
                        "type": plain.type_,
                        "to": mediator.mediator_did,
                    }),
                ))
                .await;
        } else {
            debug!("Re-sent {} to mediator {}", plain.id, mediator.id);
        }
        Ok(())
    }

    async fn ready_connection(&self, connection_id: &str) -> Result<ConnectionRecord> {
        let connection = self
            .connections
            .read(connection_id)
            .await
            .map_err(|source| MediationError::Registry {
                id: connection_id.to_string(),
                source,
            })?
            .ok_or_else(|| MediationError::ConnectionNotFound(connection_id.to_string()))?;
        if !connection.is_complete() {
            return Err(MediationError::ConnectionNotReady {
                connection_id: connection_id.to_string(),
                state: connection.state.to_string(),
            });
        }
        Ok(connection)
    }

    async fn find_by_mediator(&self, mediator_did: &str) -> Result<Vec<MediatorRecord>> {
        self.mediators
            .find_by_tag("mediator_did", mediator_did)
            .await
            .map_err(|source| MediationError::Registry {
                id: mediator_did.to_string(),
                source,
            })
    }

    /// The explicitly named mediator, else the configured default, else the
    /// only one that has granted.
    async fn select_mediator(&self, mediator_id: Option<&str>) -> Result<MediatorRecord> {
        if let Some(id) = mediator_id {
            return self.routing_mediator(id).await;
        }

        let routing = |r: &MediatorRecord| {
            matches!(r.state, MediatorState::Granted | MediatorState::Active)
        };
        if let Some(default_did) = &self.config.default_mediator {
            return self
                .find_by_mediator(default_did)
                .await?
                .into_iter()
                .rev()
                .find(routing)
                .ok_or(MediationError::NoMediator);
        }

        let mut granted: Vec<_> = self.list().await?.into_iter().filter(routing).collect();
        match granted.len() {
            1 => Ok(granted.remove(0)),
            0 => Err(MediationError::NoMediator),
            n => {
                warn!("{} mediators have granted and none is the default", n);
                Err(MediationError::NoMediator)
            }
        }
    }

    /// A mediator that has granted and so can route and hold messages.
    async fn routing_mediator(&self, mediator_id: &str) -> Result<MediatorRecord> {
        let mediator = self
            .get(mediator_id)
            .await?
            .ok_or_else(|| MediationError::NotFound(mediator_id.to_string()))?;
        match mediator.state {
            MediatorState::Granted | MediatorState::Active => Ok(mediator),
            MediatorState::Requested | MediatorState::Denied => Err(MediationError::NoMediator),
        }
    }

    /// The mediator record a grant or deny answers.
    async fn thread_record(&self, plain: &PlainMessage, sender_did: &str) -> Result<MediatorRecord> {
        let thread_id = plain.thid.as_deref().ok_or_else(|| MediationError::UnknownThread {
            message_id: plain.id.clone(),
        })?;
        let record = self
            .mediators
            .find_by_tag("thread_id", thread_id)
            .await
            .map_err(|source| MediationError::Registry {
                id: thread_id.to_string(),
                source,
            })?
            .pop()
            .ok_or_else(|| MediationError::UnknownThread {
                message_id: plain.id.clone(),
            })?;
        if record.mediator_did != sender_did {
            return Err(MediationError::UnexpectedSender {
                id: record.id,
                sender: sender_did.to_string(),
            });
        }
        Ok(record)
    }

    /// The granted mediator that sent an unthreaded pickup message.
    async fn sender_mediator(&self, plain: &PlainMessage, sender_did: &str) -> Result<MediatorRecord> {
        self.find_by_mediator(sender_did)
            .await?
            .into_iter()
            .rev()
            .find(|r| matches!(r.state, MediatorState::Granted | MediatorState::Active))
            .ok_or_else(|| MediationError::UnexpectedSender {
                id: plain.id.clone(),
                sender: sender_did.to_string(),
            })
    }
}
