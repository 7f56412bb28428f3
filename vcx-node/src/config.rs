//! Framework configuration
//!
//! [`FrameworkConfig::default`] gives a working local setup;
//! [`FrameworkConfig::from_env`] overlays these environment variables:
//!
//! - `VCX_AGENT_LABEL`: label put on invitations and requests
//! - `VCX_AGENT_ENDPOINT`: DIDComm endpoint advertised in our peer DIDs
//! - `VCX_DB_PATH`: SQLite database path (feature `storage`)
//! - `VCX_DEFAULT_MEDIATOR`: DID of the mediator used when none is given

use serde::{Deserialize, Serialize};
use std::env;
#[cfg(feature = "storage")]
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};
use crate::event::logger::EventLoggerConfig;
use crate::transport::{TransportProtocol, PREFERRED_PROTOCOL_ORDER};

const DEFAULT_ENDPOINT: &str = "http://localhost:8080/didcomm";

pub const DEFAULT_PICKUP_INTERVAL: Duration = Duration::from_secs(10);

/// Handshake automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Inviter side: answer incoming requests right away.
    pub auto_respond_to_requests: bool,
    /// Invitee side: send `complete` as soon as the response arrives.
    pub auto_complete_requests: bool,
    /// Invitee side: send a request as soon as an invitation is received.
    pub auto_accept_invitations: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_respond_to_requests: true,
            auto_complete_requests: true,
            auto_accept_invitations: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediationConfig {
    pub default_mediator: Option<String>,
    /// Time between two pickup rounds of the pickup worker.
    pub pickup_interval: Duration,
    /// `limit` sent in delivery requests.
    pub pickup_batch_size: u32,
}

impl Default for MediationConfig {
    fn default() -> Self {
        Self {
            default_mediator: None,
            pickup_interval: DEFAULT_PICKUP_INTERVAL,
            pickup_batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub preferred_protocols: Vec<TransportProtocol>,
    pub http_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            preferred_protocols: PREFERRED_PROTOCOL_ORDER.to_vec(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for a [`Framework`](crate::Framework)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    pub agent_label: String,
    pub agent_endpoint: Url,
    pub connection: ConnectionConfig,
    pub mediation: MediationConfig,
    pub transport: TransportConfig,
    /// Capacity of the broadcast channel behind `EventBus::subscribe_channel`.
    pub event_channel_capacity: usize,
    /// Database location; `None` falls back to `VCX_DB_PATH`, then `vcx-node.db`.
    #[cfg(feature = "storage")]
    pub storage_path: Option<PathBuf>,
    /// Configuration for the event logger
    #[serde(skip)]
    pub event_logger: Option<EventLoggerConfig>,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            agent_label: "VCX Agent".to_string(),
            agent_endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid URL"),
            connection: ConnectionConfig::default(),
            mediation: MediationConfig::default(),
            transport: TransportConfig::default(),
            event_channel_capacity: 100,
            #[cfg(feature = "storage")]
            storage_path: None,
            event_logger: None,
        }
    }
}

impl FrameworkConfig {
    /// Defaults overlaid with the `VCX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(label) = env::var("VCX_AGENT_LABEL") {
            config.agent_label = label;
        }
        if let Ok(endpoint) = env::var("VCX_AGENT_ENDPOINT") {
            config.agent_endpoint = Url::parse(&endpoint).map_err(|e| {
                Error::Configuration(format!("VCX_AGENT_ENDPOINT `{}`: {}", endpoint, e))
            })?;
        }
        #[cfg(feature = "storage")]
        if let Ok(path) = env::var("VCX_DB_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Ok(mediator) = env::var("VCX_DEFAULT_MEDIATOR") {
            if !mediator.starts_with("did:") {
                return Err(Error::Configuration(format!(
                    "VCX_DEFAULT_MEDIATOR `{}` is not a DID",
                    mediator
                )));
            }
            config.mediation.default_mediator = Some(mediator);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_label.trim().is_empty() {
            return Err(Error::Configuration("agent_label must not be empty".to_string()));
        }
        if self.mediation.pickup_batch_size == 0 {
            return Err(Error::Configuration(
                "mediation.pickup_batch_size must be positive".to_string(),
            ));
        }
        if self.mediation.pickup_interval.is_zero() {
            return Err(Error::Configuration(
                "mediation.pickup_interval must be positive".to_string(),
            ));
        }
        if TransportProtocol::from_url(&self.agent_endpoint).is_none() {
            return Err(Error::Configuration(format!(
                "agent_endpoint `{}` has no supported scheme",
                self.agent_endpoint
            )));
        }
        Ok(())
    }
}
