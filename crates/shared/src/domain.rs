use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

/// Correlation token attached to every locally authored message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub username: String,
    #[serde(
        default,
        alias = "profile_image_url",
        skip_serializing_if = "Option::is_none"
    )]
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    participants: [Participant; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swapanza_requested_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swapanza_duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swapanza_ends_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(id: ConversationId, participants: Vec<Participant>) -> Result<Self, DomainError> {
        let count = participants.len();
        let participants: [Participant; 2] = participants
            .try_into()
            .map_err(|_| DomainError::ParticipantCount { id: id.0, count })?;
        Ok(Self {
            id,
            participants,
            swapanza_requested_by: None,
            swapanza_duration: None,
            swapanza_ends_at: None,
        })
    }

    pub fn participants(&self) -> &[Participant; 2] {
        &self.participants
    }

    pub fn participant(&self, user_id: UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == user_id)
    }

    /// The participant that is not `user_id`.
    pub fn partner_of(&self, user_id: UserId) -> Option<&Participant> {
        if !self.participants.iter().any(|p| p.id == user_id) {
            return None;
        }
        self.participants.iter().find(|p| p.id != user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub sender: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub during_swapanza: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparent_sender: Option<UserId>,
    #[serde(default)]
    pub pending: bool,
}

impl Message {
    pub fn display_sender(&self) -> UserId {
        match (self.during_swapanza, self.apparent_sender) {
            (true, Some(apparent)) => apparent,
            _ => self.sender,
        }
    }
}
