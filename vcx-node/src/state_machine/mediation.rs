//! Mediation state machine
//!
//! ```text
//!   Requested ──grant──▶ Granted ──first pickup registration──▶ Active ⟲ pickup set changes
//!       │
//!       └──deny──▶ Denied
//! ```

use std::fmt;

use super::{InvalidTransition, Outcome};
use crate::registry::{MediatorRecord, MediatorState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediationEvent {
    GrantReceived { message_id: String },
    DenyReceived { message_id: String },
    PickupRegistered { connection_id: String },
    PickupUnregistered { connection_id: String },
}

impl fmt::Display for MediationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediationEvent::GrantReceived { message_id } => {
                write!(f, "GrantReceived({})", message_id)
            }
            MediationEvent::DenyReceived { message_id } => write!(f, "DenyReceived({})", message_id),
            MediationEvent::PickupRegistered { connection_id } => {
                write!(f, "PickupRegistered({})", connection_id)
            }
            MediationEvent::PickupUnregistered { connection_id } => {
                write!(f, "PickupUnregistered({})", connection_id)
            }
        }
    }
}

pub struct MediationFsm;

impl MediationFsm {
    pub fn apply(
        record: &MediatorRecord,
        event: &MediationEvent,
    ) -> Result<Outcome<MediatorState>, InvalidTransition> {
        let from = record.state;
        let invalid = |reason: String| Err(InvalidTransition::new(from, event, reason));

        match (from, event) {
            (MediatorState::Granted | MediatorState::Active, MediationEvent::GrantReceived { message_id })
            | (MediatorState::Denied, MediationEvent::DenyReceived { message_id })
                if record.last_message_id.as_deref() == Some(message_id.as_str()) =>
            {
                Ok(Outcome::Replay)
            }
            (MediatorState::Denied, _) => invalid("mediation was denied".to_string()),
            (MediatorState::Requested, MediationEvent::GrantReceived { .. }) => {
                Ok(Outcome::Transition {
                    from,
                    to: MediatorState::Granted,
                })
            }
            (MediatorState::Requested, MediationEvent::DenyReceived { .. }) => {
                Ok(Outcome::Transition {
                    from,
                    to: MediatorState::Denied,
                })
            }
            (
                MediatorState::Granted | MediatorState::Active,
                MediationEvent::PickupRegistered { connection_id },
            ) => {
                if record.pickup_connections.contains(connection_id) {
                    Ok(Outcome::Replay)
                } else {
                    Ok(Outcome::Transition {
                        from,
                        to: MediatorState::Active,
                    })
                }
            }
            (
                MediatorState::Granted | MediatorState::Active,
                MediationEvent::PickupUnregistered { connection_id },
            ) => {
                if record.pickup_connections.contains(connection_id) {
                    Ok(Outcome::Transition { from, to: from })
                } else {
                    Ok(Outcome::Replay)
                }
            }
            _ => invalid(format!("event {} is not valid in state {}", event, from)),
        }
    }

    /// Returns all valid events for a given state (for documentation/diagnostics).
    pub fn valid_events(state: MediatorState) -> Vec<&'static str> {
        match state {
            MediatorState::Requested => vec!["GrantReceived", "DenyReceived"],
            MediatorState::Granted | MediatorState::Active => {
                vec!["PickupRegistered", "PickupUnregistered"]
            }
            MediatorState::Denied => vec![],
        }
    }
}
