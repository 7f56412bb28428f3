//! Transport Service
//!
//! Holds the transports able to move encrypted envelopes and the handlers
//! interested in inbound bytes. Modules only ever call [`TransportService::send`];
//! which transport is used depends on the endpoint's URL scheme.
//!
//! Implementations:
//!
//! - [`HttpTransport`] (feature `native`): one POST per envelope.
//! - [`WsTransport`] (feature `websocket`): one long-lived connection per endpoint.
//! - [`ChannelTransport`]: in-process delivery between transport services.
//!
//! A transport may return a reply received on the same exchange (return
//! route). The service feeds such replies back into [`TransportService::receive`].

pub mod channel;
#[cfg(feature = "native")]
pub mod http;
#[cfg(feature = "websocket")]
pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::TransportError;
use crate::event::{Event, EventBus, EventKind, EventTopic};

pub use channel::ChannelTransport;
#[cfg(feature = "native")]
pub use http::HttpTransport;
#[cfg(feature = "websocket")]
pub use ws::WsTransport;

/// Media type of an encrypted envelope on the wire.
pub const DIDCOMM_ENCRYPTED_MEDIA_TYPE: &str = "application/didcomm-encrypted+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Http,
    Ws,
}

/// Protocols in order of preference when a peer offers several endpoints.
pub const PREFERRED_PROTOCOL_ORDER: [TransportProtocol; 2] =
    [TransportProtocol::Ws, TransportProtocol::Http];

impl TransportProtocol {
    pub fn from_url(url: &Url) -> Option<Self> {
        match url.scheme() {
            "http" | "https" => Some(TransportProtocol::Http),
            "ws" | "wss" => Some(TransportProtocol::Ws),
            _ => None,
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Http => write!(f, "http"),
            TransportProtocol::Ws => write!(f, "ws"),
        }
    }
}

/// Moves envelope bytes to an endpoint.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn protocol(&self) -> TransportProtocol;

    /// Send `bytes` to `endpoint`. `Ok(Some(reply))` carries a message the
    /// peer returned on the same exchange.
    async fn send(&self, bytes: &[u8], endpoint: &Url) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Consumer of inbound envelope bytes.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_receive(&self, bytes: Vec<u8>);
}

/// Keeps an inbound handler registered. The service only holds a weak
/// reference; once the handle is dropped the handler is pruned.
pub struct ReceiverHandle {
    _handler: Arc<dyn InboundHandler>,
}

impl fmt::Debug for ReceiverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverHandle").finish_non_exhaustive()
    }
}

pub struct TransportService {
    transports: RwLock<HashMap<TransportProtocol, Arc<dyn Transport>>>,
    handlers: RwLock<Vec<Weak<dyn InboundHandler>>>,
    events: Arc<EventBus>,
}

impl fmt::Debug for TransportService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportService").finish_non_exhaustive()
    }
}

impl TransportService {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Register `transport` for its protocol, replacing any previous one.
    pub async fn register_transport(&self, transport: Arc<dyn Transport>) {
        let protocol = transport.protocol();
        debug!("Registering {} transport", protocol);
        self.transports.write().await.insert(protocol, transport);
    }

    /// Registered protocols, in preference order.
    pub async fn supported_protocols(&self) -> Vec<TransportProtocol> {
        let transports = self.transports.read().await;
        PREFERRED_PROTOCOL_ORDER
            .iter()
            .copied()
            .filter(|p| transports.contains_key(p))
            .collect()
    }

    /// Send an envelope. A return-route reply is dispatched to the inbound
    /// handlers before this returns.
    pub async fn send(&self, bytes: &[u8], endpoint: &Url) -> Result<(), TransportError> {
        let protocol = TransportProtocol::from_url(endpoint)
            .ok_or_else(|| TransportError::NoTransportForScheme(endpoint.scheme().to_string()))?;
        let transport = self
            .transports
            .read()
            .await
            .get(&protocol)
            .cloned()
            .ok_or_else(|| TransportError::NoTransportForScheme(endpoint.scheme().to_string()))?;

        trace!("Sending {} bytes to {} via {}", bytes.len(), endpoint, protocol);
        match transport.send(bytes, endpoint).await {
            Ok(Some(reply)) => {
                debug!("Received {} byte return-route reply from {}", reply.len(), endpoint);
                self.receive(reply).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                warn!("Sending to {} failed: {}", endpoint, err);
                self.events
                    .publish(Event::new(
                        EventKind::ProblemReported,
                        EventTopic::Transport,
                        endpoint.as_str(),
                        json!({ "error": err.to_string() }),
                    ))
                    .await;
                Err(err)
            }
        }
    }

    /// Register an inbound handler.
    pub async fn on_receive(&self, handler: Arc<dyn InboundHandler>) -> ReceiverHandle {
        self.handlers.write().await.push(Arc::downgrade(&handler));
        ReceiverHandle { _handler: handler }
    }

    /// Hand inbound bytes to every live handler.
    pub async fn receive(&self, bytes: Vec<u8>) {
        let live: Vec<Arc<dyn InboundHandler>> = {
            let mut handlers = self.handlers.write().await;
            handlers.retain(|h| h.strong_count() > 0);
            handlers.iter().filter_map(Weak::upgrade).collect()
        };

        if live.is_empty() {
            warn!("Dropping {} inbound bytes: no receive handler registered", bytes.len());
            return;
        }
        for handler in live {
            handler.on_receive(bytes.clone()).await;
        }
    }

    /// Forward everything arriving on `inbound` to [`receive`](Self::receive)
    /// until the channel closes.
    pub fn spawn_inbound_pump(self: &Arc<Self>, mut inbound: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(bytes) = inbound.recv().await {
                match service.upgrade() {
                    Some(service) => service.receive(bytes).await,
                    None => break,
                }
            }
            debug!("Inbound pump stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn on_receive(&self, bytes: Vec<u8>) {
            self.0.lock().unwrap().push(bytes);
        }
    }

    #[derive(Debug)]
    struct EchoTransport;

    #[async_trait]
    impl Transport for EchoTransport {
        fn protocol(&self) -> TransportProtocol {
            TransportProtocol::Ws
        }

        async fn send(&self, bytes: &[u8], _endpoint: &Url) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(Some(bytes.to_vec()))
        }
    }

    #[test]
    fn test_protocol_from_scheme() {
        let url = |s: &str| Url::parse(s).unwrap();
        assert_eq!(TransportProtocol::from_url(&url("https://a.example")), Some(TransportProtocol::Http));
        assert_eq!(TransportProtocol::from_url(&url("wss://a.example")), Some(TransportProtocol::Ws));
        assert_eq!(TransportProtocol::from_url(&url("mailto:a@example.com")), None);
    }

    #[tokio::test]
    async fn test_send_without_transport() {
        let service = TransportService::new(Arc::new(EventBus::default()));
        let endpoint = Url::parse("http://peer.example/didcomm").unwrap();
        assert_matches!(
            service.send(b"x", &endpoint).await,
            Err(TransportError::NoTransportForScheme(s)) if s == "http"
        );
        assert!(service.supported_protocols().await.is_empty());
    }

    #[tokio::test]
    async fn test_return_route_reply_is_received() {
        let service = TransportService::new(Arc::new(EventBus::default()));
        service.register_transport(Arc::new(EchoTransport)).await;
        assert_eq!(service.supported_protocols().await, vec![TransportProtocol::Ws]);

        let recorder = Arc::new(Recorder::default());
        let _handle = service.on_receive(recorder.clone()).await;

        let endpoint = Url::parse("ws://peer.example/didcomm").unwrap();
        service.send(b"ping", &endpoint).await.unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![b"ping".to_vec()]);
    }

    #[tokio::test]
    async fn test_dropped_handle_is_pruned() {
        let service = TransportService::new(Arc::new(EventBus::default()));
        let handle = service.on_receive(Arc::new(Recorder::default())).await;

        service.receive(b"one".to_vec()).await;
        assert_eq!(service.handlers.read().await.len(), 1);
        drop(handle);
        service.receive(b"two".to_vec()).await;
        assert!(service.handlers.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_pump() {
        let service = Arc::new(TransportService::new(Arc::new(EventBus::default())));
        let recorder = Arc::new(Recorder::default());
        let _handle = service.on_receive(recorder.clone()).await;

        let (tx, rx) = mpsc::channel(4);
        let pump = service.spawn_inbound_pump(rx);
        tx.send(b"frame".to_vec()).await.unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![b"frame".to_vec()]);
    }
}
