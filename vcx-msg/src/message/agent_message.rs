//! Enum for every protocol message this framework understands.

use crate::didcomm::PlainMessage;
use crate::error::{Error, Result};
use crate::message::connection::{self, ConnectionComplete, ConnectionRequest, ConnectionResponse, Invitation};
use crate::message::mediation::{
    self, KeylistUpdate, KeylistUpdateResponse, MediateDeny, MediateGrant, MediateRequest,
};
use crate::message::message_trait::MessageBody;
use crate::message::pickup::{
    self, Delivery, DeliveryRequest, MessagesReceived, Status, StatusRequest,
};
use crate::message::problem_report::{self, ProblemReport};

/// A typed protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// Out-of-band invitation
    Invitation(Invitation),
    /// DID exchange request
    Request(ConnectionRequest),
    /// DID exchange response
    Response(ConnectionResponse),
    /// DID exchange completion
    Complete(ConnectionComplete),
    /// Problem report
    ProblemReport(ProblemReport),
    MediateRequest(MediateRequest),
    MediateGrant(MediateGrant),
    MediateDeny(MediateDeny),
    KeylistUpdate(KeylistUpdate),
    KeylistUpdateResponse(KeylistUpdateResponse),
    StatusRequest(StatusRequest),
    Status(Status),
    DeliveryRequest(DeliveryRequest),
    Delivery(Delivery),
    MessagesReceived(MessagesReceived),
}

impl AgentMessage {
    /// Decode the body of `plain` according to its type.
    pub fn parse(plain: &PlainMessage) -> Result<Self> {
        if plain.type_.is_empty() {
            return Err(Error::Validation(
                "Message type not found in PlainMessage".to_string(),
            ));
        }

        let message = match plain.type_.as_str() {
            connection::INVITATION_TYPE => AgentMessage::Invitation(Invitation::from_plain(plain)?),
            connection::REQUEST_TYPE => AgentMessage::Request(ConnectionRequest::from_plain(plain)?),
            connection::RESPONSE_TYPE => {
                AgentMessage::Response(ConnectionResponse::from_plain(plain)?)
            }
            connection::COMPLETE_TYPE => {
                AgentMessage::Complete(ConnectionComplete::from_plain(plain)?)
            }
            problem_report::PROBLEM_REPORT_TYPE => {
                AgentMessage::ProblemReport(ProblemReport::from_plain(plain)?)
            }
            mediation::MEDIATE_REQUEST_TYPE => {
                AgentMessage::MediateRequest(MediateRequest::from_plain(plain)?)
            }
            mediation::MEDIATE_GRANT_TYPE => {
                AgentMessage::MediateGrant(MediateGrant::from_plain(plain)?)
            }
            mediation::MEDIATE_DENY_TYPE => AgentMessage::MediateDeny(MediateDeny::from_plain(plain)?),
            mediation::KEYLIST_UPDATE_TYPE => {
                AgentMessage::KeylistUpdate(KeylistUpdate::from_plain(plain)?)
            }
            mediation::KEYLIST_UPDATE_RESPONSE_TYPE => {
                AgentMessage::KeylistUpdateResponse(KeylistUpdateResponse::from_plain(plain)?)
            }
            pickup::STATUS_REQUEST_TYPE => {
                AgentMessage::StatusRequest(StatusRequest::from_plain(plain)?)
            }
            pickup::STATUS_TYPE => AgentMessage::Status(Status::from_plain(plain)?),
            pickup::DELIVERY_REQUEST_TYPE => {
                AgentMessage::DeliveryRequest(DeliveryRequest::from_plain(plain)?)
            }
            pickup::DELIVERY_TYPE => AgentMessage::Delivery(Delivery::from_plain(plain)?),
            pickup::MESSAGES_RECEIVED_TYPE => {
                AgentMessage::MessagesReceived(MessagesReceived::from_plain(plain)?)
            }
            other => return Err(Error::InvalidMessageType(other.to_string())),
        };

        tracing::trace!("Parsed {} message {}", message.name(), plain.id);
        Ok(message)
    }

    /// Short name used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            AgentMessage::Invitation(_) => "invitation",
            AgentMessage::Request(_) => "request",
            AgentMessage::Response(_) => "response",
            AgentMessage::Complete(_) => "complete",
            AgentMessage::ProblemReport(_) => "problem-report",
            AgentMessage::MediateRequest(_) => "mediate-request",
            AgentMessage::MediateGrant(_) => "mediate-grant",
            AgentMessage::MediateDeny(_) => "mediate-deny",
            AgentMessage::KeylistUpdate(_) => "keylist-update",
            AgentMessage::KeylistUpdateResponse(_) => "keylist-update-response",
            AgentMessage::StatusRequest(_) => "status-request",
            AgentMessage::Status(_) => "status",
            AgentMessage::DeliveryRequest(_) => "delivery-request",
            AgentMessage::Delivery(_) => "delivery",
            AgentMessage::MessagesReceived(_) => "messages-received",
        }
    }
}
