//! Connection (DID exchange) state machine
//!
//! ```text
//!   (none) ──invitation──▶ Invited ──request──▶ Requested ──response──▶ Responded ──complete──▶ Complete
//!                             │                    │                       │
//!                             └──────── failure ───┴───────────────────────┴──────▶ Error
//! ```
//!
//! The invitee starts in `Invited` when it receives the invitation; the
//! inviter's record is born in `Requested` when the request arrives.
//! `Complete` and `Error` are terminal.
//!
//! Every message event carries the id of the message that caused it. An
//! event whose target state is the current state and whose message id is
//! the record's `last_message_id` is a replay of something already applied
//! and yields [`Outcome::Replay`].

use std::fmt;

use super::{InvalidTransition, Outcome};
use crate::registry::{ConnectionRecord, ConnectionRole, ConnectionState};

/// Inputs of the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    InvitationReceived { message_id: String },
    RequestSent { message_id: String },
    RequestReceived { message_id: String },
    ResponseSent { message_id: String },
    ResponseReceived { message_id: String },
    CompleteSent { message_id: String },
    CompleteReceived { message_id: String },
    /// Unrecoverable failure on the connection's thread.
    Failed { detail: String },
}

impl ConnectionEvent {
    /// State the event leads to.
    pub fn target(&self) -> ConnectionState {
        match self {
            ConnectionEvent::InvitationReceived { .. } => ConnectionState::Invited,
            ConnectionEvent::RequestSent { .. } | ConnectionEvent::RequestReceived { .. } => {
                ConnectionState::Requested
            }
            ConnectionEvent::ResponseSent { .. } | ConnectionEvent::ResponseReceived { .. } => {
                ConnectionState::Responded
            }
            ConnectionEvent::CompleteSent { .. } | ConnectionEvent::CompleteReceived { .. } => {
                ConnectionState::Complete
            }
            ConnectionEvent::Failed { .. } => ConnectionState::Error,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            ConnectionEvent::InvitationReceived { message_id }
            | ConnectionEvent::RequestSent { message_id }
            | ConnectionEvent::RequestReceived { message_id }
            | ConnectionEvent::ResponseSent { message_id }
            | ConnectionEvent::ResponseReceived { message_id }
            | ConnectionEvent::CompleteSent { message_id }
            | ConnectionEvent::CompleteReceived { message_id } => Some(message_id),
            ConnectionEvent::Failed { .. } => None,
        }
    }

    /// The side of the handshake allowed to produce this event.
    fn required_role(&self) -> Option<ConnectionRole> {
        match self {
            ConnectionEvent::InvitationReceived { .. }
            | ConnectionEvent::RequestSent { .. }
            | ConnectionEvent::ResponseReceived { .. }
            | ConnectionEvent::CompleteSent { .. } => Some(ConnectionRole::Invitee),
            ConnectionEvent::RequestReceived { .. }
            | ConnectionEvent::ResponseSent { .. }
            | ConnectionEvent::CompleteReceived { .. } => Some(ConnectionRole::Inviter),
            ConnectionEvent::Failed { .. } => None,
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::InvitationReceived { message_id } => {
                write!(f, "InvitationReceived({})", message_id)
            }
            ConnectionEvent::RequestSent { message_id } => write!(f, "RequestSent({})", message_id),
            ConnectionEvent::RequestReceived { message_id } => {
                write!(f, "RequestReceived({})", message_id)
            }
            ConnectionEvent::ResponseSent { message_id } => {
                write!(f, "ResponseSent({})", message_id)
            }
            ConnectionEvent::ResponseReceived { message_id } => {
                write!(f, "ResponseReceived({})", message_id)
            }
            ConnectionEvent::CompleteSent { message_id } => {
                write!(f, "CompleteSent({})", message_id)
            }
            ConnectionEvent::CompleteReceived { message_id } => {
                write!(f, "CompleteReceived({})", message_id)
            }
            ConnectionEvent::Failed { detail } => write!(f, "Failed({})", detail),
        }
    }
}

pub struct ConnectionFsm;

impl ConnectionFsm {
    /// State of a record created by `event`, if the event creates records.
    pub fn initial_state(event: &ConnectionEvent) -> Option<ConnectionState> {
        match event {
            ConnectionEvent::InvitationReceived { .. } => Some(ConnectionState::Invited),
            ConnectionEvent::RequestReceived { .. } => Some(ConnectionState::Requested),
            _ => None,
        }
    }

    /// Decide what `event` does to `record`.
    pub fn apply(
        record: &ConnectionRecord,
        event: &ConnectionEvent,
    ) -> Result<Outcome<ConnectionState>, InvalidTransition> {
        let from = record.state;
        let to = event.target();

        if Self::is_replay(record, event) {
            return Ok(Outcome::Replay);
        }

        if from.is_terminal() {
            return Err(InvalidTransition::new(
                from,
                event,
                "connection is in a terminal state",
            ));
        }

        if let Some(role) = event.required_role() {
            if role != record.role {
                return Err(InvalidTransition::new(
                    from,
                    event,
                    format!("only the {} produces this event, we are the {}", role, record.role),
                ));
            }
        }

        let valid = matches!(
            (from, event),
            (
                ConnectionState::Invited,
                ConnectionEvent::RequestSent { .. } | ConnectionEvent::RequestReceived { .. }
            ) | (
                ConnectionState::Requested,
                ConnectionEvent::ResponseSent { .. } | ConnectionEvent::ResponseReceived { .. }
            ) | (
                ConnectionState::Responded,
                ConnectionEvent::CompleteSent { .. } | ConnectionEvent::CompleteReceived { .. }
            ) | (
                ConnectionState::Invited | ConnectionState::Requested | ConnectionState::Responded,
                ConnectionEvent::Failed { .. }
            )
        );

        if valid {
            Ok(Outcome::Transition { from, to })
        } else {
            Err(InvalidTransition::new(
                from,
                event,
                format!("event {} is not valid in state {}", event, from),
            ))
        }
    }

    fn is_replay(record: &ConnectionRecord, event: &ConnectionEvent) -> bool {
        if record.state != event.target() {
            return false;
        }
        match event {
            ConnectionEvent::Failed { detail } => record.last_error.as_deref() == Some(detail),
            _ => record.last_message_id.as_deref() == event.message_id(),
        }
    }

    /// Returns all valid events for a given state (for documentation/diagnostics).
    pub fn valid_events(state: ConnectionState) -> Vec<&'static str> {
        match state {
            ConnectionState::Invited => vec!["RequestSent", "RequestReceived", "Failed"],
            ConnectionState::Requested => vec!["ResponseSent", "ResponseReceived", "Failed"],
            ConnectionState::Responded => vec!["CompleteSent", "CompleteReceived", "Failed"],
            ConnectionState::Complete | ConnectionState::Error => vec![],
        }
    }
}
