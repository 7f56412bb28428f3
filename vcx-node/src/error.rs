//! Error handling for the VCX node
//!
//! Each module has its own error enum whose variants name the action that
//! failed. Raw failures of collaborators (storage, crypto, DID resolution,
//! message parsing) are kept as the `#[source]` of those variants and are
//! never returned on their own.

use thiserror::Error;
use tokio::task::JoinError;

use crate::state_machine::InvalidTransition;
use crate::storage::StorageError;
use vcx_agent::{CryptoError, DidError, MessagingError};

/// Errors of the generic registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{category} record `{id}` not found")]
    NotFound { category: &'static str, id: String },

    /// The stored record changed since it was read, or is not in the
    /// expected state.
    #[error("conflicting update on {category} record `{id}`: {reason}")]
    Conflict {
        category: &'static str,
        id: String,
        reason: String,
    },

    #[error("{category} record `{id}` already exists")]
    Duplicate { category: &'static str, id: String },

    #[error("error persisting record `{id}`")]
    Storage {
        id: String,
        #[source]
        source: StorageError,
    },

    #[error("error serializing record `{id}`")]
    Serialization {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("registry operation on `{id}` was aborted")]
    Aborted {
        id: String,
        #[source]
        source: JoinError,
    },
}

/// Errors of the transport service and its transports.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no transport registered for scheme `{0}`")]
    NoTransportForScheme(String),

    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),

    #[error("error sending to {endpoint}: {reason}")]
    Send { endpoint: String, reason: String },

    #[error("{endpoint} answered with status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("timed out sending to {0}")]
    Timeout(String),

    #[error("connection to {0} is closed")]
    ConnectionClosed(String),
}

/// Errors of the connection module.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection `{0}` not found")]
    NotFound(String),

    #[error("invalid state transition on connection `{id}`")]
    InvalidStateTransition {
        id: String,
        #[source]
        source: InvalidTransition,
    },

    #[error("error creating key")]
    CreateKey {
        #[source]
        source: CryptoError,
    },

    #[error("error creating peer DID")]
    CreatePeerDid {
        #[source]
        source: DidError,
    },

    #[error("error resolving DID `{did}`")]
    DidResolution {
        did: String,
        #[source]
        source: DidError,
    },

    #[error("error storing connection `{id}`")]
    Registry {
        id: String,
        #[source]
        source: RegistryError,
    },

    #[error("error building {kind} message")]
    BuildMessage {
        kind: &'static str,
        #[source]
        source: vcx_msg::Error,
    },

    #[error("error encrypting message for connection `{id}`")]
    Messaging {
        id: String,
        #[source]
        source: MessagingError,
    },

    #[error("error sending message for connection `{id}`")]
    Transport {
        id: String,
        #[source]
        source: TransportError,
    },

    #[error("error parsing message `{message_id}`")]
    ParseMessage {
        message_id: String,
        #[source]
        source: vcx_msg::Error,
    },

    #[error("error reading invitation")]
    InvalidInvitation {
        #[source]
        source: vcx_msg::Error,
    },

    #[error("message `{message_id}` does not belong to a known connection")]
    UnknownThread { message_id: String },

    #[error("connection `{id}` does not accept messages from `{sender}`")]
    UnexpectedSender { id: String, sender: String },

    #[error("connection module does not handle {0} messages")]
    UnsupportedMessage(&'static str),
}

/// Errors of the mediation module.
#[derive(Error, Debug)]
pub enum MediationError {
    #[error("mediator record `{0}` not found")]
    NotFound(String),

    #[error("no mediator is granted or configured")]
    NoMediator,

    #[error("connection `{0}` not found")]
    ConnectionNotFound(String),

    #[error("connection `{connection_id}` is not complete (state {state})")]
    ConnectionNotReady { connection_id: String, state: String },

    #[error("connection `{connection_id}` is not a connection to mediator `{mediator_did}`")]
    MediatorMismatch {
        connection_id: String,
        mediator_did: String,
    },

    #[error("invalid state transition on mediator `{id}`")]
    InvalidStateTransition {
        id: String,
        #[source]
        source: InvalidTransition,
    },

    #[error("error storing mediator record `{id}`")]
    Registry {
        id: String,
        #[source]
        source: RegistryError,
    },

    #[error("error building {kind} message")]
    BuildMessage {
        kind: &'static str,
        #[source]
        source: vcx_msg::Error,
    },

    #[error("error encrypting message for mediator `{id}`")]
    Messaging {
        id: String,
        #[source]
        source: MessagingError,
    },

    #[error("error sending message to mediator `{id}`")]
    Transport {
        id: String,
        #[source]
        source: TransportError,
    },

    #[error("error parsing message `{message_id}`")]
    ParseMessage {
        message_id: String,
        #[source]
        source: vcx_msg::Error,
    },

    #[error("message `{message_id}` does not belong to a known mediation")]
    UnknownThread { message_id: String },

    #[error("mediator `{id}` does not accept messages from `{sender}`")]
    UnexpectedSender { id: String, sender: String },

    #[error("error reading delivered message `{message_id}`")]
    MalformedDelivery {
        message_id: String,
        #[source]
        source: vcx_msg::Error,
    },

    #[error("mediation module does not handle {0} messages")]
    UnsupportedMessage(&'static str),
}

/// Error types for the VCX node
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Mediation(#[from] MediationError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("error parsing inbound message")]
    ParseMessage {
        #[source]
        source: vcx_msg::Error,
    },

    #[error("error opening storage")]
    Storage {
        #[source]
        source: StorageError,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for the VCX node
pub type Result<T> = std::result::Result<T, Error>;
