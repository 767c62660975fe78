use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Conversation, ConversationId, UserId},
    error::{ApiException, ErrorCode},
    protocol::{
        ActiveSessionSnapshot, CancelSwapanzaRequest, CreateConversationRequest,
        EligibilityResponse, HistoryPage, UnreadCountsResponse,
    },
};
use tracing::warn;
use url::Url;

use crate::{credential::Credential, error::RestError};

/// REST collaborators the engine relies on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Newest-first page of messages older than `cursor`.
    async fn fetch_history(
        &self,
        conversation_id: ConversationId,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, RestError>;
    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Conversation, RestError>;
    async fn list_conversations(&self) -> Result<Vec<Conversation>, RestError>;
    async fn create_conversation(&self, partner: UserId) -> Result<Conversation, RestError>;
    async fn find_conversation_with(
        &self,
        partner: UserId,
    ) -> Result<Option<Conversation>, RestError>;
    async fn can_start_swapanza(&self) -> Result<EligibilityResponse, RestError>;
    async fn cancel_swapanza(&self, conversation_id: ConversationId) -> Result<(), RestError>;
    async fn active_swapanza(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ActiveSessionSnapshot, RestError>;
    async fn unread_counts(&self) -> Result<Vec<(ConversationId, i64)>, RestError>;
    async fn reset_notifications(&self) -> Result<(), RestError>;
}

#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base: Url,
    credential: Credential,
}

impl RestClient {
    pub fn new(base: Url, credential: Credential) -> Self {
        Self {
            http: Client::new(),
            base,
            credential,
        }
    }

    fn url(&self, path: &str) -> Result<Url, RestError> {
        self.base
            .join(path)
            .map_err(|err| RestError::Decode(format!("invalid path {path}: {err}")))
    }

    fn get(&self, path: &str) -> Result<RequestBuilder, RestError> {
        Ok(self
            .http
            .get(self.url(path)?)
            .bearer_auth(self.credential.token()))
    }

    fn post(&self, path: &str) -> Result<RequestBuilder, RestError> {
        Ok(self
            .http
            .post(self.url(path)?)
            .bearer_auth(self.credential.token()))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, RestError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(RestError::Unauthorized);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| {
                ["error", "detail", "message"]
                    .iter()
                    .find_map(|key| value.get(key).and_then(|v| v.as_str()).map(str::to_string))
            })
            .unwrap_or(body);
        Err(RestError::Api(ApiException::new(
            ErrorCode::from_status(status.as_u16()),
            message,
        )))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RestError> {
        let body = self.send(request).await?.text().await?;
        serde_json::from_str(&body).map_err(|err| RestError::Decode(err.to_string()))
    }
}

#[async_trait]
impl ChatApi for RestClient {
    async fn fetch_history(
        &self,
        conversation_id: ConversationId,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, RestError> {
        let mut request = self.get(&format!("/api/chats/{}/messages/", conversation_id.0))?;
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        self.json(request).await
    }

    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Conversation, RestError> {
        self.json(self.get(&format!("/api/chats/{}/", conversation_id.0))?)
            .await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, RestError> {
        self.json(self.get("/api/chats/")?.query(&[("include_closed", "true")]))
            .await
    }

    async fn create_conversation(&self, partner: UserId) -> Result<Conversation, RestError> {
        let body = CreateConversationRequest {
            participants: vec![partner],
        };
        self.json(self.post("/api/chats/")?.json(&body)).await
    }

    async fn find_conversation_with(
        &self,
        partner: UserId,
    ) -> Result<Option<Conversation>, RestError> {
        let request = self.get(&format!("/api/chats/find-by-user/{}/", partner.0))?;
        match self.json(request).await {
            Ok(conversation) => Ok(Some(conversation)),
            Err(RestError::Api(api)) if api.code == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn can_start_swapanza(&self) -> Result<EligibilityResponse, RestError> {
        self.json(self.get("/api/can-start-swapanza/")?).await
    }

    async fn cancel_swapanza(&self, conversation_id: ConversationId) -> Result<(), RestError> {
        let body = CancelSwapanzaRequest {
            chat_id: conversation_id,
        };
        self.send(self.post("/api/swapanza/cancel/")?.json(&body))
            .await?;
        Ok(())
    }

    async fn active_swapanza(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ActiveSessionSnapshot, RestError> {
        let request = self
            .get("/api/active-swapanza/")?
            .query(&[("chat_id", conversation_id.0)]);
        self.json(request).await
    }

    async fn unread_counts(&self) -> Result<Vec<(ConversationId, i64)>, RestError> {
        let raw: UnreadCountsResponse = self.json(self.get("/api/unread-counts/")?).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(key, count)| match key.parse::<i64>() {
                Ok(id) => Some((ConversationId(id), count)),
                Err(_) => {
                    warn!(key = %key, "ignoring unread count with non-numeric conversation id");
                    None
                }
            })
            .collect())
    }

    async fn reset_notifications(&self) -> Result<(), RestError> {
        self.send(self.post("/api/reset-notifications/")?.json(&serde_json::json!({})))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
