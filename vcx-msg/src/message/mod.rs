//! Protocol message bodies.
//!
//! Each protocol body implements [`MessageBody`] and is carried inside a
//! [`PlainMessage`](crate::didcomm::PlainMessage). [`AgentMessage`] decodes
//! any supported message by its type URI.

pub mod agent_message;
pub mod connection;
pub mod mediation;
pub mod message_trait;
pub mod pickup;
pub mod problem_report;

pub use agent_message::AgentMessage;
pub use connection::{ConnectionComplete, ConnectionRequest, ConnectionResponse, Invitation};
pub use mediation::{
    KeylistAction, KeylistResult, KeylistUpdate, KeylistUpdateItem, KeylistUpdateResponse,
    KeylistUpdated, MediateDeny, MediateGrant, MediateRequest,
};
pub use message_trait::MessageBody;
pub use pickup::{Delivery, DeliveryRequest, MessagesReceived, Status, StatusRequest};
pub use problem_report::ProblemReport;
