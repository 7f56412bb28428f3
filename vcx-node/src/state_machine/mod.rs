//! Protocol state machines
//!
//! Both machines are pure: they look at a record and an event and decide
//! what the next state is, without touching storage. The connection and
//! mediation modules persist the outcome through their registries.
//!
//! ## Sub-modules
//!
//! - [`connection`]: the DID exchange handshake (`Invited` to `Complete`).
//! - [`mediation`]: our relationship with a mediator (`Requested` to `Active`).

pub mod connection;
pub mod mediation;

use std::fmt;

pub use connection::{ConnectionEvent, ConnectionFsm};
pub use mediation::{MediationEvent, MediationFsm};

/// Result of applying an event to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<S> {
    /// The record moves from `from` to `to` (which may be equal when only
    /// data changes).
    Transition { from: S, to: S },
    /// The event is already reflected in the record. Nothing to persist.
    Replay,
}

impl<S> Outcome<S> {
    pub fn is_replay(&self) -> bool {
        matches!(self, Outcome::Replay)
    }
}

/// Error returned when an event is not valid in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub event: String,
    pub reason: String,
}

impl InvalidTransition {
    pub(crate) fn new(
        current_state: impl fmt::Display,
        event: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            current_state: current_state.to_string(),
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid transition: cannot apply {} in state {} ({})",
            self.event, self.current_state, self.reason
        )
    }
}

impl std::error::Error for InvalidTransition {}
