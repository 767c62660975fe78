use shared::{domain::ConversationId, error::ApiException};
use thiserror::Error;

/// Why a credential cannot be used. Every variant is fatal: the engine signs out
/// instead of retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("no credential available")]
    Missing,
    #[error("credential expired")]
    Expired,
    #[error("credential is not a decodable token")]
    Malformed,
    #[error("credential rejected by server")]
    Revoked,
}

/// Local rejection of a send while a Swapanza session is running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaViolation {
    #[error("message is empty")]
    Empty,
    #[error("message is {len} characters, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("message must not contain spaces")]
    ContainsWhitespace,
    #[error("no messages left in this session")]
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error(transparent)]
    Quota(#[from] QuotaViolation),
    #[error("conversation is not open")]
    NotOpen,
    #[error("not connected")]
    NotConnected,
    #[error("engine stopped")]
    EngineStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionCommandError {
    #[error("a swapanza request is already pending")]
    AlreadyPending,
    #[error("a swapanza session is already active")]
    AlreadyActive,
    #[error("cannot start swapanza: {0}")]
    NotEligible(String),
    #[error("conversation is not open")]
    NotOpen,
    #[error("not connected")]
    NotConnected,
    #[error("no swapanza request to answer")]
    NoRequest,
    #[error("request failed: {0}")]
    Rest(String),
    #[error("engine stopped")]
    EngineStopped,
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("credential rejected by server")]
    Unauthorized,
    #[error(transparent)]
    Api(#[from] ApiException),
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response body: {0}")]
    Decode(String),
}

/// Failure of an engine command that is not a send or a session command.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("conversation {0} is not open")]
    NotOpen(ConversationId),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("invalid endpoint: {0:#}")]
    Endpoint(anyhow::Error),
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
    #[error("engine stopped")]
    Stopped,
}

impl RestError {
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Unauthorized => true,
            Self::Api(api) => api.is_unauthorized(),
            _ => false,
        }
    }
}
