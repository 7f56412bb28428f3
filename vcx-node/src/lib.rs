//! # VCX Node
//!
//! Connection and mediation protocol engine for DIDComm v2 agents. The node
//! establishes authenticated, encrypted connections between two parties
//! (DID exchange), coordinates a mediator relationship for message pickup,
//! and persists all protocol state with an event for every change.
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - **Storage**: pluggable [`StorageBackend`] (in-memory, SQLite).
//! - **Registries**: typed persistence for DIDs, connections and mediators;
//!   every mutation publishes exactly one event.
//! - **Events Service**: the [`EventBus`], the main integration point for
//!   application code.
//! - **Transport Service**: moves encrypted envelopes over HTTP, WebSocket or
//!   an in-process channel.
//! - **Messaging Module** ([`vcx_agent::MessagingModule`]): encrypts and
//!   decrypts envelopes; holds no state.
//! - **Connection Module** and **Mediation Module**: drive the protocol
//!   state machines.
//!
//! The [`Framework`] builds this graph from a [`FrameworkConfig`] and routes
//! inbound envelopes to the owning module.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vcx_node::{Framework, FrameworkConfig};
//!
//! async fn example() -> vcx_node::Result<()> {
//!     let framework = Arc::new(Framework::initialize(FrameworkConfig::from_env()?).await?);
//!     framework.start_inbound().await;
//!
//!     let (invitation, _) = framework.connections().create_invitation(None).await?;
//!     println!("{}", invitation.to_url("https://example.org/invite").map_err(|source| {
//!         vcx_node::Error::ParseMessage { source }
//!     })?);
//!
//!     framework.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod mediation;
pub mod pickup;
pub mod registry;
pub mod state_machine;
pub mod storage;
pub mod transport;

pub use config::FrameworkConfig;
pub use connection::ConnectionModule;
pub use error::{Error, Result};
pub use event::{Event, EventBus, EventKind, EventTopic};
pub use mediation::MediationModule;
pub use registry::{ConnectionRecord, ConnectionState, DidRecord, MediatorRecord, MediatorState};

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vcx_agent::{CryptoProvider, DidResolver, MessagingModule, MultiResolver};
use vcx_msg::{AgentMessage, PlainMessage};

use event::logger::EventLogger;
use pickup::{PickupHandle, PickupWorker};
use registry::{ConnectionRegistry, DidRegistry, MediatorRegistry};
use storage::{StorageBackend, StoredCryptoProvider};
use transport::{InboundHandler, ReceiverHandle, TransportService};

/// Version of the vcx-node crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// # The VCX Framework
///
/// Owns one agent's object graph. Every collaborator is injected at
/// construction; nothing is reachable globally, so several frameworks can
/// live in one process (which is how the tests run two agents against each
/// other over a [`ChannelTransport`](transport::ChannelTransport)).
///
/// Share it as `Arc<Framework>`: [`start_inbound`](Self::start_inbound)
/// needs the `Arc` to register itself with the Transport Service.
pub struct Framework {
    config: FrameworkConfig,
    events: Arc<EventBus>,
    storage: Arc<dyn StorageBackend>,
    did_registry: DidRegistry,
    messaging: MessagingModule,
    transport: Arc<TransportService>,
    connections: ConnectionModule,
    mediation: MediationModule,
    receiver: Mutex<Option<ReceiverHandle>>,
    pickup: Mutex<Option<PickupHandle>>,
    inbound_pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("label", &self.config.agent_label)
            .field("endpoint", &self.config.agent_endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl Framework {
    /// Build a framework on `storage` with the default DID resolvers
    /// (did:key, did:peer). Secret keys are kept in `storage` too.
    pub fn new(config: FrameworkConfig, storage: Arc<dyn StorageBackend>) -> Self {
        Self::with_components(
            config,
            storage.clone(),
            Arc::new(MultiResolver::default()),
            Arc::new(StoredCryptoProvider::new(storage)),
        )
    }

    /// Build a framework from explicit collaborators.
    ///
    /// No transport is registered; add them through [`transport`](Self::transport).
    pub fn with_components(
        config: FrameworkConfig,
        storage: Arc<dyn StorageBackend>,
        resolver: Arc<dyn DidResolver>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.event_channel_capacity));

        if let Some(logger_config) = &config.event_logger {
            events.subscribe_all(Arc::new(EventLogger::new(logger_config.clone())));
        }

        let did_registry = DidRegistry::new(storage.clone(), events.clone());
        let connection_registry = ConnectionRegistry::new(storage.clone(), events.clone());
        let mediator_registry = MediatorRegistry::new(storage.clone(), events.clone());

        let messaging = MessagingModule::new(resolver, crypto);
        let transport = Arc::new(TransportService::new(events.clone()));

        let connections = ConnectionModule::new(
            config.connection.clone(),
            config.agent_label.clone(),
            config.agent_endpoint.clone(),
            connection_registry.clone(),
            did_registry.clone(),
            messaging.clone(),
            transport.clone(),
            events.clone(),
        );
        let mediation = MediationModule::new(
            config.mediation.clone(),
            mediator_registry,
            connection_registry,
            messaging.clone(),
            transport.clone(),
            events.clone(),
        );

        info!(
            "Framework {} v{} ready at {}",
            config.agent_label, VERSION, config.agent_endpoint
        );

        Self {
            config,
            events,
            storage,
            did_registry,
            messaging,
            transport,
            connections,
            mediation,
            receiver: Mutex::new(None),
            pickup: Mutex::new(None),
            inbound_pump: Mutex::new(None),
        }
    }

    /// Build a framework with the storage and transports enabled by the
    /// crate features.
    ///
    /// With `storage` the records live in SQLite at `storage_path`,
    /// otherwise in memory. With `native` an HTTP transport is registered,
    /// with `websocket` a WebSocket transport whose inbound frames are
    /// pumped into the Transport Service.
    pub async fn initialize(config: FrameworkConfig) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "storage")]
        let storage: Arc<dyn StorageBackend> = Arc::new(
            storage::SqliteStorage::new(config.storage_path.clone())
                .await
                .map_err(|source| Error::Storage { source })?,
        );
        #[cfg(not(feature = "storage"))]
        let storage: Arc<dyn StorageBackend> = Arc::new(storage::InMemoryStorage::new());

        let framework = Self::new(config, storage);

        for protocol in framework.config.transport.preferred_protocols.clone() {
            match protocol {
                #[cfg(feature = "native")]
                transport::TransportProtocol::Http => {
                    let http = transport::HttpTransport::new(framework.config.transport.http_timeout)?;
                    framework.transport.register_transport(Arc::new(http)).await;
                }
                #[cfg(feature = "websocket")]
                transport::TransportProtocol::Ws => {
                    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(100);
                    let ws = transport::WsTransport::new(
                        framework.config.transport.http_timeout,
                        inbound_tx,
                    );
                    framework.transport.register_transport(Arc::new(ws)).await;
                    let pump = framework.transport.spawn_inbound_pump(inbound_rx);
                    *lock(&framework.inbound_pump) = Some(pump);
                }
                #[allow(unreachable_patterns)]
                other => debug!("{} transport not compiled in", other),
            }
        }

        Ok(framework)
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn connections(&self) -> &ConnectionModule {
        &self.connections
    }

    pub fn mediation(&self) -> &MediationModule {
        &self.mediation
    }

    pub fn transport(&self) -> &Arc<TransportService> {
        &self.transport
    }

    pub fn messaging(&self) -> &MessagingModule {
        &self.messaging
    }

    pub fn did_registry(&self) -> &DidRegistry {
        &self.did_registry
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Process one inbound envelope.
    ///
    /// The envelope is decrypted, parsed and handed to the module owning its
    /// protocol. Envelopes delivered by a mediator are processed in turn;
    /// their failures are logged and do not fail the outer call.
    pub async fn receive_message(&self, bytes: &[u8]) -> Result<()> {
        let delivered = self.process_envelope(bytes).await?;

        let mut queue: VecDeque<Vec<u8>> = delivered.into();
        while let Some(envelope) = queue.pop_front() {
            match self.process_envelope(&envelope).await {
                Ok(more) => queue.extend(more),
                Err(e) => warn!("Failed to process delivered message: {}", e),
            }
        }
        Ok(())
    }

    /// Register this framework as a receive handler of its Transport
    /// Service. Calling it again replaces the previous registration.
    pub async fn start_inbound(self: &Arc<Self>) {
        let handler = Arc::new(FrameworkInbound {
            framework: Arc::downgrade(self),
        });
        let handle = self.transport.on_receive(handler).await;
        *lock(&self.receiver) = Some(handle);
        debug!("Framework {} receives inbound messages", self.config.agent_label);
    }

    /// Start the pickup worker. Does nothing if it is already running.
    pub fn start_pickup(&self) {
        let mut pickup = lock(&self.pickup);
        if pickup.as_ref().is_some_and(PickupHandle::is_running) {
            return;
        }
        *pickup = Some(PickupWorker::spawn(
            self.mediation.clone(),
            self.config.mediation.pickup_interval,
        ));
    }

    /// Stop background work and inbound processing.
    pub async fn shutdown(&self) {
        let pickup = lock(&self.pickup).take();
        if let Some(pickup) = pickup {
            pickup.shutdown().await;
        }
        lock(&self.receiver).take();
        if let Some(pump) = lock(&self.inbound_pump).take() {
            pump.abort();
        }
        info!("Framework {} shut down", self.config.agent_label);
    }

    /// Decrypt, parse and dispatch one envelope. Returns the envelopes it
    /// carried if it was a mediator delivery.
    async fn process_envelope(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let envelope = match MessagingModule::envelope_from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report_problem(EventTopic::Messaging, "envelope", &e).await;
                return Err(e.into());
            }
        };
        let (plaintext, sender_did) = match self.messaging.decrypt(&envelope).await {
            Ok(decrypted) => decrypted,
            Err(e) => {
                self.report_problem(EventTopic::Messaging, "envelope", &e).await;
                return Err(e.into());
            }
        };
        let plain = match PlainMessage::from_bytes(&plaintext) {
            Ok(plain) => plain,
            Err(source) => {
                self.report_problem(EventTopic::Messaging, &sender_did, &source).await;
                return Err(Error::ParseMessage { source });
            }
        };

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if plain.is_expired(now) {
            warn!("Dropping expired message {} from {}", plain.id, sender_did);
            self.report_problem(EventTopic::Messaging, &plain.id, &"message expired")
                .await;
            return Ok(Vec::new());
        }

        self.events
            .publish(Event::new(
                EventKind::MessageReceived,
                EventTopic::Messaging,
                plain.id.clone(),
                json!({
                    "type": plain.type_,
                    "from": sender_did,
                    "thid": plain.thid,
                }),
            ))
            .await;

        let message = match AgentMessage::parse(&plain) {
            Ok(message) => message,
            Err(source) => {
                self.fail_thread(&plain, &source).await;
                return Err(Error::ParseMessage { source });
            }
        };
        debug!("Dispatching {} {} from {}", message.name(), plain.id, sender_did);

        match message {
            AgentMessage::Invitation(_)
            | AgentMessage::Request(_)
            | AgentMessage::Response(_)
            | AgentMessage::Complete(_)
            | AgentMessage::ProblemReport(_) => {
                self.connections
                    .handle_inbound(&message, &plain, &sender_did)
                    .await?;
                Ok(Vec::new())
            }
            _ => Ok(self
                .mediation
                .handle_inbound(&message, &plain, &sender_did)
                .await?),
        }
    }

    /// A malformed message on a known connection thread ends that
    /// connection.
    async fn fail_thread(&self, plain: &PlainMessage, cause: &vcx_msg::Error) {
        let Some(thread_id) = plain.thid.as_deref() else {
            self.report_problem(EventTopic::Messaging, &plain.id, cause).await;
            return;
        };
        match self.connections.find_by_thread(thread_id).await {
            Ok(Some(record)) if !record.state.is_terminal() => {
                let detail = format!("malformed message {}: {}", plain.id, cause);
                if let Err(e) = self.connections.fail(&record.id, &detail).await {
                    warn!("Could not fail connection {}: {}", record.id, e);
                }
            }
            Ok(_) => self.report_problem(EventTopic::Messaging, &plain.id, cause).await,
            Err(e) => warn!("Cannot look up thread {}: {}", thread_id, e),
        }
    }

    async fn report_problem(&self, topic: EventTopic, source_id: &str, problem: &(dyn Display + Sync)) {
        warn!("Inbound problem on {}: {}", source_id, problem);
        self.events
            .publish(Event::new(
                EventKind::ProblemReported,
                topic,
                source_id,
                json!({ "error": problem.to_string() }),
            ))
            .await;
    }
}

/// Receive handler registered with the Transport Service. Holds the
/// framework weakly so the service never keeps it alive.
struct FrameworkInbound {
    framework: Weak<Framework>,
}

#[async_trait]
impl InboundHandler for FrameworkInbound {
    async fn on_receive(&self, bytes: Vec<u8>) {
        let Some(framework) = self.framework.upgrade() else {
            return;
        };
        if let Err(e) = framework.receive_message(&bytes).await {
            warn!("Failed to process inbound message: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn test_inbound_processing_runs_on_spawned_tasks() {
        let framework = Arc::new(Framework::new(
            FrameworkConfig::default(),
            Arc::new(InMemoryStorage::new()),
        ));
        let mut stream = framework.events().subscribe_channel();

        let inbound = framework.clone();
        let result = tokio::spawn(async move { inbound.receive_message(b"not an envelope").await })
            .await
            .unwrap();
        assert!(result.is_err());

        let event = stream.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::ProblemReported);
        assert_eq!(event.topic, EventTopic::Messaging);
    }
}
