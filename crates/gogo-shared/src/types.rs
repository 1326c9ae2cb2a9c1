use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{
    GROUP_PREFIX, MESSAGE_ID_PREFIX, MESSAGE_ID_RANDOM_LEN, TIMESTAMP_FORMAT, USER_PREFIX,
};
use crate::error::ProtocolError;

/// Kind of chat payload. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageType {
    Text = 0,
    File = 2,
    AudioOrVideo = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Text),
            2 => Ok(Self::File),
            3 => Ok(Self::AudioOrVideo),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// Delivery status of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Unsent,
    Sent,
}

impl MessageStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Unsent => 0,
            Self::Sent => 1,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Unsent),
            1 => Ok(Self::Sent),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Addressing mode of a receiver id, decided by its first character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverKind {
    User,
    Group,
}

impl ReceiverKind {
    pub fn of(receiver_id: &str) -> Result<Self, ProtocolError> {
        match receiver_id.chars().next() {
            Some(USER_PREFIX) => Ok(Self::User),
            Some(GROUP_PREFIX) => Ok(Self::Group),
            _ => Err(ProtocolError::InvalidReceiver(receiver_id.to_string())),
        }
    }
}

/// Generate a fresh message id: `M` followed by random alphanumerics.
pub fn new_message_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(MESSAGE_ID_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{MESSAGE_ID_PREFIX}{suffix}")
}

/// Strip the scheme/host part of an avatar URL, keeping everything from
/// `/static/` onwards. URLs without a `/static/` segment are kept verbatim.
pub fn normalize_avatar(url: &str) -> String {
    match url.find("/static/") {
        Some(idx) => url[idx..].to_string(),
        None => url.to_string(),
    }
}

/// Render a timestamp the way outbound envelopes carry it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
