use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ClientId, ConversationId, Message, MessageId, Participant, UserId};

/// Frames written by the client on a conversation socket, or `Ping`/`Pong` on the
/// notification socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "chat.message")]
    ChatMessage { content: String, client_id: ClientId },
    #[serde(rename = "swapanza.request")]
    SwapanzaRequest { duration: u32 },
    #[serde(rename = "swapanza.confirm")]
    SwapanzaConfirm,
    #[serde(rename = "swapanza.cancel")]
    SwapanzaCancel,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub content: String,
    pub sender: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub during_swapanza: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparent_sender: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparent_sender_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_messages: Option<i64>,
}

impl From<MessagePayload> for Message {
    fn from(value: MessagePayload) -> Self {
        Self {
            id: value.id,
            client_id: value.client_id,
            sender: value.sender,
            content: value.content,
            created_at: value.created_at,
            during_swapanza: value.during_swapanza,
            apparent_sender: value.apparent_sender,
            pending: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatePayload {
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_messages: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_profile_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<DateTime<Utc>>,
}

impl ActivatePayload {
    pub fn partner(&self) -> Option<Participant> {
        match (self.partner_id, &self.partner_username) {
            (Some(id), Some(username)) => Some(Participant {
                id,
                username: username.clone(),
                profile_image: self.partner_profile_image.clone(),
            }),
            _ => None,
        }
    }
}

/// Frames received on a conversation socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "chat.message")]
    ChatMessage(MessagePayload),
    #[serde(rename = "chat.messages_read")]
    MessagesRead {
        #[serde(default)]
        user_id: Option<UserId>,
    },
    #[serde(rename = "chat.message.error")]
    MessageError {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        client_id: Option<ClientId>,
    },
    #[serde(rename = "swapanza.request")]
    SwapanzaRequest {
        duration: u32,
        requested_by: UserId,
        #[serde(default)]
        requested_by_username: Option<String>,
    },
    #[serde(rename = "swapanza.confirm")]
    SwapanzaConfirm {
        user_id: UserId,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        all_confirmed: bool,
    },
    #[serde(rename = "swapanza.activate")]
    SwapanzaActivate(ActivatePayload),
    #[serde(rename = "swapanza.expire")]
    SwapanzaExpire {
        #[serde(default)]
        force_redirect: bool,
    },
    #[serde(rename = "swapanza.cancel")]
    SwapanzaCancel {
        #[serde(default)]
        cancelled_by: Option<UserId>,
        #[serde(default)]
        cancelled_by_username: Option<String>,
    },
    #[serde(rename = "swapanza.logout")]
    SwapanzaLogout {
        #[serde(default)]
        force_redirect: bool,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Frames received on the user-scoped notification socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotificationFrame {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "unread_count")]
    UnreadCount { chat_id: ConversationId, count: i64 },
    #[serde(rename = "swapanza_invite")]
    SwapanzaInvite {
        chat_id: ConversationId,
        #[serde(default)]
        from: Option<String>,
    },
    #[serde(rename = "swapanza_cancel")]
    SwapanzaCancel {
        chat_id: ConversationId,
        #[serde(default)]
        from: Option<String>,
    },
    #[serde(rename = "swapanza.logout")]
    SwapanzaLogout {
        #[serde(default)]
        force_redirect: bool,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

impl NotificationFrame {
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::UnreadCount { chat_id, .. }
            | Self::SwapanzaInvite { chat_id, .. }
            | Self::SwapanzaCancel { chat_id, .. } => Some(*chat_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub results: Vec<MessagePayload>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityResponse {
    pub can_start: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Poll-able snapshot of the session currently active for the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveSessionSnapshot {
    pub active: bool,
    #[serde(default)]
    pub chat_id: Option<ConversationId>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remaining_messages: Option<i64>,
    #[serde(default)]
    pub partner_id: Option<UserId>,
    #[serde(default)]
    pub partner_username: Option<String>,
    #[serde(default)]
    pub partner_profile_image: Option<String>,
    #[serde(default)]
    pub server_time: Option<DateTime<Utc>>,
}

impl ActiveSessionSnapshot {
    /// Activation payload equivalent, when the snapshot describes a running session.
    pub fn as_activation(&self) -> Option<ActivatePayload> {
        if !self.active {
            return None;
        }
        Some(ActivatePayload {
            started_at: self.started_at?,
            ends_at: self.ends_at?,
            remaining_messages: self.remaining_messages,
            partner_id: self.partner_id,
            partner_username: self.partner_username.clone(),
            partner_profile_image: self.partner_profile_image.clone(),
            server_time: self.server_time,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    /// The other participant; the server adds the caller.
    pub participants: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelSwapanzaRequest {
    pub chat_id: ConversationId,
}

/// `GET /api/unread-counts/` body; JSON object keys are conversation ids.
pub type UnreadCountsResponse = HashMap<String, i64>;

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
