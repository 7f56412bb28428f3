//! Plain DIDComm message model for the VCX framework
//!
//! This crate defines the unencrypted message structure exchanged between
//! agents and the typed bodies of the protocols the framework speaks:
//! out-of-band invitations, DID exchange, coordinate-mediation, message
//! pickup and problem reports. It performs no I/O and no cryptography.

pub mod didcomm;
pub mod error;
pub mod message;

pub use didcomm::{Attachment, AttachmentData, PlainMessage};
pub use error::{Error, Result};
pub use message::{AgentMessage, MessageBody};
