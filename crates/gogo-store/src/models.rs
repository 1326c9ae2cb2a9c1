//! Domain model structs persisted in the chat database.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use gogo_shared::protocol::{ChatRequest, MessageView};
use gogo_shared::types::{
    format_timestamp, new_message_id, normalize_avatar, MessageStatus, MessageType,
};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message as stored by the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Generated message id (`M` + 11 alphanumerics).
    pub id: String,
    pub session_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub url: String,
    pub send_id: String,
    pub send_name: String,
    /// Avatar path, normalized to start at `/static/`.
    pub send_avatar: String,
    pub receive_id: String,
    pub file_size: String,
    pub file_type: String,
    pub file_name: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    /// Raw signaling payload for audio/video messages, empty otherwise.
    pub av_data: String,
}

impl Message {
    /// Build a fresh, unsent message from a client request.
    ///
    /// Only the fields meaningful for the request's type are carried over.
    pub fn from_request(req: &ChatRequest) -> Self {
        let mut message = Self {
            id: new_message_id(),
            session_id: req.session_id.clone(),
            message_type: req.message_type,
            content: String::new(),
            url: String::new(),
            send_id: req.send_id.clone(),
            send_name: req.send_name.clone(),
            send_avatar: normalize_avatar(&req.send_avatar),
            receive_id: req.receive_id.clone(),
            file_size: String::new(),
            file_type: String::new(),
            file_name: String::new(),
            status: MessageStatus::Unsent,
            // Stored with microsecond precision.
            created_at: Utc::now().trunc_subsecs(6),
            av_data: String::new(),
        };

        match req.message_type {
            MessageType::Text => {
                message.content = req.content.clone();
                message.file_size = "0B".to_string();
            }
            MessageType::File => {
                message.url = req.url.clone();
                message.file_size = req.file_size.clone();
                message.file_type = req.file_type.clone();
                message.file_name = req.file_name.clone();
            }
            MessageType::AudioOrVideo => {
                message.av_data = req.av_data.clone();
            }
        }

        message
    }

    /// The envelope clients receive for this message.
    pub fn to_view(&self) -> MessageView {
        MessageView {
            send_id: self.send_id.clone(),
            send_name: self.send_name.clone(),
            send_avatar: self.send_avatar.clone(),
            receive_id: self.receive_id.clone(),
            message_type: self.message_type,
            content: self.content.clone(),
            url: self.url.clone(),
            file_size: self.file_size.clone(),
            file_name: self.file_name.clone(),
            file_type: self.file_type.clone(),
            created_at: format_timestamp(&self.created_at),
            av_data: (self.message_type == MessageType::AudioOrVideo)
                .then(|| self.av_data.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// Membership snapshot of a group, maintained by the group-management
/// service and only read by the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group id (`G...`).
    pub id: String,
    pub name: String,
    pub owner_id: String,
    /// Member ids in join order.
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl GroupInfo {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}
