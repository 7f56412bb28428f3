//! Message pickup 3.0 bodies.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::message_trait::MessageBody;

pub const STATUS_REQUEST_TYPE: &str = "https://didcomm.org/messagepickup/3.0/status-request";
pub const STATUS_TYPE: &str = "https://didcomm.org/messagepickup/3.0/status";
pub const DELIVERY_REQUEST_TYPE: &str = "https://didcomm.org/messagepickup/3.0/delivery-request";
pub const DELIVERY_TYPE: &str = "https://didcomm.org/messagepickup/3.0/delivery";
pub const MESSAGES_RECEIVED_TYPE: &str = "https://didcomm.org/messagepickup/3.0/messages-received";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_did: Option<String>,
}

impl MessageBody for StatusRequest {
    fn message_type() -> &'static str {
        STATUS_REQUEST_TYPE
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Number of messages queued at the mediator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub message_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_did: Option<String>,
}

impl MessageBody for Status {
    fn message_type() -> &'static str {
        STATUS_TYPE
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_did: Option<String>,
}

impl MessageBody for DeliveryRequest {
    fn message_type() -> &'static str {
        DELIVERY_REQUEST_TYPE
    }

    fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::Validation(
                "delivery-request limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Queued envelopes travel as attachments of the plain message; the body
/// only names the recipient they were queued for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_did: Option<String>,
}

impl MessageBody for Delivery {
    fn message_type() -> &'static str {
        DELIVERY_TYPE
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesReceived {
    pub message_id_list: Vec<String>,
}

impl MessageBody for MessagesReceived {
    fn message_type() -> &'static str {
        MESSAGES_RECEIVED_TYPE
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_request_limit() {
        assert!(DeliveryRequest {
            limit: 0,
            recipient_did: None
        }
        .validate()
        .is_err());
        assert!(DeliveryRequest {
            limit: 10,
            recipient_did: None
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_status_request_omits_absent_recipient() {
        let value = serde_json::to_value(StatusRequest::default()).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }
}
