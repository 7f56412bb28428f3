use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::trace;
use url::Url;

use super::{Transport, TransportProtocol, TransportService};
use crate::error::TransportError;

/// In-process transport.
///
/// Endpoints are mapped to the [`TransportService`] of the agent living
/// there, and `send` hands the bytes straight to that service's receive
/// path. The call returns once the peer has processed the message, which
/// makes multi-agent tests deterministic.
///
/// Services are held weakly: a route to an agent that has been dropped
/// fails with [`TransportError::ConnectionClosed`].
#[derive(Debug)]
pub struct ChannelTransport {
    protocol: TransportProtocol,
    routes: DashMap<String, Weak<TransportService>>,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(TransportProtocol::Http)
    }
}

impl ChannelTransport {
    /// A transport serving endpoints of `protocol`'s schemes.
    pub fn new(protocol: TransportProtocol) -> Self {
        Self {
            protocol,
            routes: DashMap::new(),
        }
    }

    /// Route `endpoint` to `service`.
    pub fn connect(&self, endpoint: &Url, service: &Arc<TransportService>) {
        self.routes
            .insert(endpoint.to_string(), Arc::downgrade(service));
    }

    pub fn disconnect(&self, endpoint: &Url) -> bool {
        self.routes.remove(endpoint.as_str()).is_some()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    async fn send(&self, bytes: &[u8], endpoint: &Url) -> Result<Option<Vec<u8>>, TransportError> {
        // Clone the route out so no map guard is held across the await.
        let route = self
            .routes
            .get(endpoint.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Send {
                endpoint: endpoint.to_string(),
                reason: "no in-process route".to_string(),
            })?;
        let service = route
            .upgrade()
            .ok_or_else(|| TransportError::ConnectionClosed(endpoint.to_string()))?;

        trace!("Delivering {} bytes in-process to {}", bytes.len(), endpoint);
        service.receive(bytes.to_vec()).await;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::transport::InboundHandler;
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

    #[tokio::test]
    async fn test_delivers_to_peer_service() {
        let events = Arc::new(EventBus::default());
        let sender = TransportService::new(events.clone());
        let receiver = Arc::new(TransportService::new(events));
        let recorder = Arc::new(Recorder::default());
        let _handle = receiver.on_receive(recorder.clone()).await;

        let channel = Arc::new(ChannelTransport::default());
        let endpoint = Url::parse("http://bob.test/didcomm").unwrap();
        channel.connect(&endpoint, &receiver);
        sender.register_transport(channel.clone()).await;

        sender.send(b"hello", &endpoint).await.unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![b"hello".to_vec()]);

        assert!(channel.disconnect(&endpoint));
        assert_matches!(
            sender.send(b"again", &endpoint).await,
            Err(TransportError::Send { .. })
        );
    }

    #[tokio::test]
    async fn test_dropped_peer_is_closed() {
        let channel = ChannelTransport::default();
        let endpoint = Url::parse("http://gone.test/didcomm").unwrap();
        {
            let peer = Arc::new(TransportService::new(Arc::new(EventBus::default())));
            channel.connect(&endpoint, &peer);
        }
        assert_matches!(
            channel.send(b"x", &endpoint).await,
            Err(TransportError::ConnectionClosed(_))
        );
    }
}
