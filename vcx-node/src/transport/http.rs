use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{Transport, TransportProtocol, DIDCOMM_ENCRYPTED_MEDIA_TYPE};
use crate::error::TransportError;

/// HTTP transport
///
/// POSTs every envelope to the endpoint. A 2xx answer with a non-empty body
/// is a return-route reply. The transport does not retry; a failed send is
/// reported to the caller.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Send {
                endpoint: String::new(),
                reason: format!("cannot build HTTP client: {}", e),
            })?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Http
    }

    async fn send(&self, bytes: &[u8], endpoint: &Url) -> Result<Option<Vec<u8>>, TransportError> {
        debug!("Sending {} bytes via HTTP to {}", bytes.len(), endpoint);

        let response = self
            .client
            .post(endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, DIDCOMM_ENCRYPTED_MEDIA_TYPE)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(endpoint.to_string())
                } else {
                    TransportError::Send {
                        endpoint: endpoint.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("HTTP {} from {}", status, endpoint);
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| TransportError::Send {
            endpoint: endpoint.to_string(),
            reason: format!("reading response body: {}", e),
        })?;

        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(body.to_vec()))
        }
    }
}
