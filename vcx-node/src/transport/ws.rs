use async_trait::async_trait;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info};
use url::Url;

use super::{Transport, TransportProtocol};
use crate::error::TransportError;

/// WebSocket transport
///
/// Keeps one connection per endpoint, opened on first use. Each connection
/// is served by a task that writes queued envelopes and forwards every
/// inbound frame to the sink given at construction; pair the sink's
/// receiver with [`TransportService::spawn_inbound_pump`](super::TransportService::spawn_inbound_pump).
#[derive(Debug)]
pub struct WsTransport {
    connect_timeout: Duration,
    inbound: mpsc::Sender<Vec<u8>>,
    connections: Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    task_handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration, inbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            connect_timeout,
            inbound,
            connections: Mutex::new(HashMap::new()),
            task_handles: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, endpoint: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections
            .get(endpoint)
            .filter(|tx| !tx.is_closed())
            .cloned()
    }

    fn forget(&self, endpoint: &str) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(endpoint);
        if let Some(handle) = self
            .task_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(endpoint)
        {
            handle.abort();
        }
    }

    async fn ensure_connection(&self, endpoint: &Url) -> Result<mpsc::Sender<Vec<u8>>, TransportError> {
        let key = endpoint.to_string();
        if let Some(tx) = self.cached(&key) {
            return Ok(tx);
        }

        info!("Opening WebSocket connection to {}", endpoint);
        let (ws_stream, _) = match tokio::time::timeout(
            self.connect_timeout,
            connect_async(endpoint.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Send {
                    endpoint: key,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(TransportError::Timeout(key)),
        };

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(100);
        let inbound = self.inbound.clone();
        let peer = key.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = rx.recv() => {
                        let Some(bytes) = outgoing else { break };
                        if let Err(e) = write.send(Message::Binary(bytes)).await {
                            error!("Failed to write WebSocket frame to {}: {}", peer, e);
                            break;
                        }
                    }
                    incoming = read.next() => {
                        let bytes = match incoming {
                            Some(Ok(Message::Binary(bytes))) => bytes,
                            Some(Ok(Message::Text(text))) => text.into_bytes(),
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                error!("WebSocket error from {}: {}", peer, e);
                                break;
                            }
                            None => break,
                        };
                        debug!("Received {} bytes via WebSocket from {}", bytes.len(), peer);
                        if inbound.send(bytes).await.is_err() {
                            debug!("Inbound sink closed, dropping frame from {}", peer);
                        }
                    }
                }
            }
            info!("WebSocket connection to {} closed", peer);
        });

        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), tx.clone());
        self.task_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, handle);
        Ok(tx)
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Ws
    }

    async fn send(&self, bytes: &[u8], endpoint: &Url) -> Result<Option<Vec<u8>>, TransportError> {
        let tx = self.ensure_connection(endpoint).await?;
        if tx.send(bytes.to_vec()).await.is_err() {
            self.forget(endpoint.as_str());
            return Err(TransportError::ConnectionClosed(endpoint.to_string()));
        }
        debug!("Queued {} bytes for {}", bytes.len(), endpoint);
        // Replies arrive as frames through the inbound sink.
        Ok(None)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let handles = self.task_handles.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in handles.drain() {
            handle.abort();
        }
    }
}
