//! Shared setup for the integration tests: agents wired to each other over
//! an in-process channel, an event recorder and a scripted mediator.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use url::Url;

use vcx_agent::did::DIDCOMM_MESSAGING;
use vcx_agent::{
    CryptoProvider, DidDoc, KeyRef, LocalCryptoProvider, MessagingModule, MultiResolver, Service,
    StaticResolver, VerificationMethod,
};
use vcx_msg::message::mediation::{
    KeylistResult, KeylistUpdate, KeylistUpdateResponse, KeylistUpdated, MediateDeny,
    MediateGrant, KEYLIST_UPDATE_TYPE, MEDIATE_REQUEST_TYPE,
};
use vcx_msg::message::pickup::{
    Delivery, MessagesReceived, DELIVERY_REQUEST_TYPE, MESSAGES_RECEIVED_TYPE,
};
use vcx_msg::message::connection::Invitation;
use vcx_msg::{Attachment, MessageBody, PlainMessage};
use vcx_node::event::{Event, EventTopic, FnListener};
use vcx_node::storage::InMemoryStorage;
use vcx_node::transport::{ChannelTransport, InboundHandler, ReceiverHandle, TransportService};
use vcx_node::{EventBus, Framework, FrameworkConfig};

pub fn test_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(label: &str, endpoint: &str) -> FrameworkConfig {
    FrameworkConfig {
        agent_label: label.to_string(),
        agent_endpoint: Url::parse(endpoint).unwrap(),
        ..Default::default()
    }
}

/// A framework on in-memory storage, reachable at its endpoint through
/// `channel`, processing inbound messages.
pub async fn agent(config: FrameworkConfig, channel: &Arc<ChannelTransport>) -> Arc<Framework> {
    agent_with_resolver(config, channel, Arc::new(MultiResolver::default())).await
}

pub async fn agent_with_resolver(
    config: FrameworkConfig,
    channel: &Arc<ChannelTransport>,
    resolver: Arc<MultiResolver>,
) -> Arc<Framework> {
    let endpoint = config.agent_endpoint.clone();
    let framework = Arc::new(Framework::with_components(
        config,
        Arc::new(InMemoryStorage::new()),
        resolver,
        Arc::new(LocalCryptoProvider::new()),
    ));
    framework
        .transport()
        .register_transport(channel.clone())
        .await;
    channel.connect(&endpoint, framework.transport());
    framework.start_inbound().await;
    framework
}

/// Records every event matching a predicate.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventRecorder {
    pub fn attach<P>(bus: &EventBus, predicate: P) -> Self
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let recorder = Self::default();
        let events = recorder.events.clone();
        bus.subscribe(
            predicate,
            FnListener::new(move |event: &Event| {
                events.lock().unwrap().push(event.clone());
                Ok(())
            }),
        );
        recorder
    }

    pub fn topic(bus: &EventBus, topic: EventTopic) -> Self {
        Self::attach(bus, move |event| event.topic == topic)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

/// Inbound handler that keeps every envelope it is handed.
#[derive(Default)]
pub struct Inbox {
    received: Mutex<Vec<Vec<u8>>>,
}

impl Inbox {
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl InboundHandler for Inbox {
    async fn on_receive(&self, bytes: Vec<u8>) {
        self.received.lock().unwrap().push(bytes);
    }
}

/// A peer that only exists as a `did:example` document. Its key lives in
/// a crypto provider of its own; whatever is sent to its endpoint is kept
/// in `inbox`.
pub struct ExamplePeer {
    pub did: String,
    pub endpoint: Url,
    pub messaging: MessagingModule,
    pub inbox: Arc<Inbox>,
    service: Arc<TransportService>,
    _handle: ReceiverHandle,
}

impl ExamplePeer {
    /// `resolver` must also be able to resolve the DIDs of whoever talks
    /// to this peer.
    pub async fn new(
        name: &str,
        resolver: Arc<MultiResolver>,
        documents: &StaticResolver,
        channel: &ChannelTransport,
    ) -> Self {
        let did = format!("did:example:{}", name);
        let endpoint = Url::parse(&format!("http://{}.test/didcomm", name)).unwrap();
        let crypto = Arc::new(LocalCryptoProvider::new());
        let key = crypto.create_key().await.unwrap();
        documents.insert(example_doc(&did, &key, &endpoint));

        let service = Arc::new(TransportService::new(Arc::new(EventBus::default())));
        let inbox = Arc::new(Inbox::default());
        let handle = service.on_receive(inbox.clone()).await;
        channel.connect(&endpoint, &service);
        Self {
            did,
            endpoint,
            messaging: MessagingModule::new(resolver, crypto),
            inbox,
            service,
            _handle: handle,
        }
    }

    /// Encrypt `plain` from this peer for `to`, as it would go on the wire.
    pub async fn seal(&self, plain: &PlainMessage, to: &str) -> Vec<u8> {
        let sealed = self
            .messaging
            .encrypt(&plain.to_bytes().unwrap(), to, &self.did)
            .await
            .unwrap();
        MessagingModule::envelope_to_bytes(&sealed.envelope).unwrap()
    }

    /// Decrypt everything received so far.
    pub async fn opened(&self) -> Vec<(PlainMessage, String)> {
        let mut opened = Vec::new();
        for bytes in self.inbox.received() {
            let envelope = MessagingModule::envelope_from_bytes(&bytes).unwrap();
            let (plaintext, sender) = self.messaging.decrypt(&envelope).await.unwrap();
            opened.push((PlainMessage::from_bytes(&plaintext).unwrap(), sender));
        }
        opened
    }
}

pub fn example_doc(did: &str, key: &KeyRef, endpoint: &Url) -> DidDoc {
    let kid = format!("{}#key-1", did);
    DidDoc {
        id: did.to_string(),
        verification_method: vec![VerificationMethod {
            id: kid.clone(),
            type_: "X25519KeyAgreementKey2020".to_string(),
            controller: did.to_string(),
            public_key_multibase: key.as_str().to_string(),
        }],
        authentication: vec![],
        key_agreement: vec![kid],
        service: vec![Service {
            id: format!("{}#didcomm", did),
            type_: DIDCOMM_MESSAGING.to_string(),
            service_endpoint: endpoint.clone(),
            routing_keys: vec![],
            accept: vec!["didcomm/v2".to_string()],
        }],
    }
}

/// Run the full handshake between `inviter` and `invitee`. Returns the
/// connection ids on both sides, inviter first.
pub async fn connect(inviter: &Framework, invitee: &Framework) -> (String, String) {
    let (invitation, _) = inviter.connections().create_invitation(None).await.unwrap();
    connect_with(inviter, invitee, invitation).await
}

/// Like [`connect`], on an invitation `inviter` already created.
pub async fn connect_with(
    inviter: &Framework,
    invitee: &Framework,
    invitation: Invitation,
) -> (String, String) {
    let record = invitee
        .connections()
        .receive_invitation(invitation.clone())
        .await
        .unwrap();
    invitee.connections().send_request(&record.id).await.unwrap();

    let inviter_record = inviter
        .connections()
        .list()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.invitation_id == invitation.id)
        .expect("inviter has a connection for its invitation");
    (inviter_record.id, record.id)
}

/// The mediator half of coordinate-mediation and pickup, scripted on top
/// of a framework that acts as the mediator's agent for DID exchange.
pub struct ScriptedMediator {
    pub framework: Arc<Framework>,
    pub deny: bool,
    pub queue: Mutex<Vec<Vec<u8>>>,
    pub keylist: Mutex<Vec<String>>,
    pub acknowledged: Mutex<Vec<String>>,
    handle: Mutex<Option<ReceiverHandle>>,
}

impl ScriptedMediator {
    pub async fn start(framework: Arc<Framework>, deny: bool) -> Arc<Self> {
        let mediator = Arc::new(Self {
            framework,
            deny,
            queue: Mutex::new(Vec::new()),
            keylist: Mutex::new(Vec::new()),
            acknowledged: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        });
        let handle = mediator
            .framework
            .transport()
            .on_receive(mediator.clone())
            .await;
        *mediator.handle.lock().unwrap() = Some(handle);
        mediator
    }

    /// Queue `plain` from the mediator's `from` DID to `to` for pickup.
    pub async fn enqueue(&self, plain: &PlainMessage, from: &str, to: &str) {
        let encrypted = self
            .framework
            .messaging()
            .encrypt(&plain.to_bytes().unwrap(), to, from)
            .await
            .unwrap();
        let bytes = MessagingModule::envelope_to_bytes(&encrypted.envelope).unwrap();
        self.queue.lock().unwrap().push(bytes);
    }

    async fn reply(&self, plain: PlainMessage, to: &str) {
        let from = plain.from.clone().unwrap();
        let encrypted = self
            .framework
            .messaging()
            .encrypt(&plain.to_bytes().unwrap(), to, &from)
            .await
            .unwrap();
        let bytes = MessagingModule::envelope_to_bytes(&encrypted.envelope).unwrap();
        self.framework
            .transport()
            .send(&bytes, &encrypted.endpoint)
            .await
            .unwrap();
    }
}

#[async_trait]
impl InboundHandler for ScriptedMediator {
    async fn on_receive(&self, bytes: Vec<u8>) {
        let Ok(envelope) = MessagingModule::envelope_from_bytes(&bytes) else {
            return;
        };
        let Ok((plaintext, sender)) = self.framework.messaging().decrypt(&envelope).await else {
            return;
        };
        let plain = PlainMessage::from_bytes(&plaintext).unwrap();
        let me = plain.to[0].clone();
        let thid = Some(plain.id.clone());

        match plain.type_.as_str() {
            MEDIATE_REQUEST_TYPE => {
                let reply = if self.deny {
                    MediateDeny::default().to_plain(&me, &sender).unwrap()
                } else {
                    MediateGrant {
                        routing_did: vec![me.clone()],
                    }
                    .to_plain(&me, &sender)
                    .unwrap()
                };
                self.reply(reply.with_thread_id(thid), &sender).await;
            }
            KEYLIST_UPDATE_TYPE => {
                let update = KeylistUpdate::from_plain(&plain).unwrap();
                let mut updated = Vec::new();
                for item in update.updates {
                    self.keylist.lock().unwrap().push(item.recipient_did.clone());
                    updated.push(KeylistUpdated {
                        recipient_did: item.recipient_did,
                        action: item.action,
                        result: KeylistResult::Success,
                    });
                }
                let reply = KeylistUpdateResponse { updated }
                    .to_plain(&me, &sender)
                    .unwrap()
                    .with_thread_id(thid);
                self.reply(reply, &sender).await;
            }
            DELIVERY_REQUEST_TYPE => {
                let queued: Vec<Vec<u8>> = self.queue.lock().unwrap().drain(..).collect();
                let attachments = queued
                    .iter()
                    .enumerate()
                    .map(|(i, bytes)| {
                        Attachment::from_bytes(
                            &format!("queued-{}", i),
                            Some("application/didcomm-encrypted+json"),
                            bytes,
                        )
                    })
                    .collect();
                let reply = Delivery::default()
                    .to_plain(&me, &sender)
                    .unwrap()
                    .with_thread_id(thid)
                    .with_attachments(attachments);
                self.reply(reply, &sender).await;
            }
            MESSAGES_RECEIVED_TYPE => {
                let received = MessagesReceived::from_plain(&plain).unwrap();
                self.acknowledged
                    .lock()
                    .unwrap()
                    .extend(received.message_id_list);
            }
            _ => {}
        }
    }
}
