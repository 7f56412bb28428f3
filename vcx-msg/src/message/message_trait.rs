//! Conversion between typed protocol bodies and plain messages.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::didcomm::PlainMessage;
use crate::error::{Error, Result};

/// A protocol message body that can be carried in a [`PlainMessage`].
pub trait MessageBody: Serialize + DeserializeOwned + Send + Sync {
    /// Get the message type URI for this body type.
    fn message_type() -> &'static str
    where
        Self: Sized;

    /// Validate the message body.
    fn validate(&self) -> Result<()>;

    /// Wrap this body into a plain message from `from` to `to`.
    fn to_plain(&self, from: &str, to: &str) -> Result<PlainMessage>
    where
        Self: Sized,
    {
        self.validate()?;
        let body = serde_json::to_value(self)?;
        Ok(PlainMessage::new(Self::message_type(), body)
            .with_sender(from)
            .with_recipient(to))
    }

    /// Decode this body from a plain message, checking the type first.
    fn from_plain(message: &PlainMessage) -> Result<Self>
    where
        Self: Sized,
    {
        if message.type_ != Self::message_type() {
            return Err(Error::InvalidMessageType(format!(
                "expected {}, got {}",
                Self::message_type(),
                message.type_
            )));
        }
        let body: Self = serde_json::from_value(message.body.clone())?;
        body.validate()?;
        Ok(body)
    }
}

pub(crate) fn require_did(field: &str, did: &str) -> Result<()> {
    if did.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    if !did.starts_with("did:") {
        return Err(Error::Validation(format!(
            "{} must be a DID, got `{}`",
            field, did
        )));
    }
    Ok(())
}
