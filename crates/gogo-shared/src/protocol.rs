use serde::{Deserialize, Serialize};

use crate::constants::{
    NOTICE_NOT_FRIENDS, NOTICE_NOT_IN_GROUP, NOTICE_SERVER_ERROR, PROXY_SIGNAL_ID, RECORDED_SIGNAL_TYPES,
};
use crate::error::ProtocolError;
use crate::types::{MessageType, ReceiverKind};

/// Chat request frame sent by a client over its WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation the message belongs to.
    #[serde(default)]
    pub session_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: String,
    /// File URL for file messages.
    #[serde(default)]
    pub url: String,
    pub send_id: String,
    #[serde(default)]
    pub send_name: String,
    #[serde(default)]
    pub send_avatar: String,
    /// `U...` for a user, `G...` for a group.
    pub receive_id: String,
    #[serde(default)]
    pub file_size: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub file_name: String,
    /// JSON-encoded [`AvSignal`] for audio/video messages.
    #[serde(default)]
    pub av_data: String,
}

impl ChatRequest {
    /// Decode and sanity-check a raw frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let request: Self = serde_json::from_slice(data)?;
        if request.send_id.is_empty() {
            return Err(ProtocolError::MissingField("send_id"));
        }
        ReceiverKind::of(&request.receive_id)?;
        Ok(request)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn receiver_kind(&self) -> Result<ReceiverKind, ProtocolError> {
        ReceiverKind::of(&self.receive_id)
    }

    /// Parse the nested signaling payload of an audio/video message.
    pub fn av_signal(&self) -> Result<AvSignal, ProtocolError> {
        Ok(serde_json::from_str(&self.av_data)?)
    }
}

/// Audio/video signaling payload carried inside [`ChatRequest::av_data`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvSignal {
    /// Call id, or [`PROXY_SIGNAL_ID`] for server-relayed call events.
    #[serde(default)]
    pub message_id: String,
    #[serde(rename = "type")]
    pub signal_type: String,
}

impl AvSignal {
    /// Whether this signal is a call event kept in message history.
    pub fn is_call_record(&self) -> bool {
        self.message_id == PROXY_SIGNAL_ID
            && RECORDED_SIGNAL_TYPES.contains(&self.signal_type.as_str())
    }
}

/// Envelope delivered to clients and kept in cached message lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub send_id: String,
    pub send_name: String,
    pub send_avatar: String,
    pub receive_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub url: String,
    pub file_size: String,
    pub file_name: String,
    pub file_type: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub av_data: Option<String>,
}

impl MessageView {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Copy of this envelope whose content is replaced by a system notice.
    pub fn with_notice(&self, notice: SystemNotice) -> Self {
        Self {
            content: notice.content().to_string(),
            ..self.clone()
        }
    }
}

/// Canned replies sent to a sender whose message was not routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemNotice {
    /// A collaborator failed or timed out.
    ServerError,
    /// Sender and receiver are not in a valid relationship.
    NotFriends,
    /// Sender posted to a group it does not belong to.
    NotInGroup,
}

impl SystemNotice {
    pub fn content(self) -> &'static str {
        match self {
            Self::ServerError => NOTICE_SERVER_ERROR,
            Self::NotFriends => NOTICE_NOT_FRIENDS,
            Self::NotInGroup => NOTICE_NOT_IN_GROUP,
        }
    }
}
