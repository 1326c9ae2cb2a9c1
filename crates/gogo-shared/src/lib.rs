//! # gogo-shared
//!
//! Wire protocol and domain vocabulary shared by the chat services:
//! message types and statuses, receiver addressing, the inbound
//! [`protocol::ChatRequest`] frame and the outbound
//! [`protocol::MessageView`] envelope.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
