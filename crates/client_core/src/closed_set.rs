use std::{collections::BTreeSet, sync::Arc};

use anyhow::{Context, Result};
use shared::domain::ConversationId;
use storage::{load_json, save_json, PersistentStore};
use tracing::warn;

pub const CLOSED_CONVERSATIONS_KEY: &str = "closed_conversations";

/// Conversations the user dismissed from the list. Local only; never sent to the
/// server.
pub struct ClosedSetStore {
    store: Arc<dyn PersistentStore>,
    ids: BTreeSet<ConversationId>,
}

impl ClosedSetStore {
    /// Reads the persisted set. A corrupt entry is logged and treated as empty.
    pub async fn load(store: Arc<dyn PersistentStore>) -> Result<Self> {
        let raw: Option<Vec<String>> =
            match load_json(store.as_ref(), CLOSED_CONVERSATIONS_KEY).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!("discarding unreadable closed conversation list: {err:#}");
                    None
                }
            };
        let ids = raw
            .unwrap_or_default()
            .iter()
            .filter_map(|id| id.parse::<i64>().ok().map(ConversationId))
            .collect();
        Ok(Self { store, ids })
    }

    pub fn is_closed(&self, id: ConversationId) -> bool {
        self.ids.contains(&id)
    }

    pub fn closed_ids(&self) -> impl Iterator<Item = ConversationId> + '_ {
        self.ids.iter().copied()
    }

    /// Returns whether the set changed.
    pub async fn close(&mut self, id: ConversationId) -> Result<bool> {
        if !self.ids.insert(id) {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    pub async fn close_all(&mut self, ids: impl IntoIterator<Item = ConversationId>) -> Result<usize> {
        let before = self.ids.len();
        self.ids.extend(ids);
        let added = self.ids.len() - before;
        if added > 0 {
            self.persist().await?;
        }
        Ok(added)
    }

    /// Returns whether the conversation was closed before.
    pub async fn reopen(&mut self, id: ConversationId) -> Result<bool> {
        if !self.ids.remove(&id) {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    async fn persist(&self) -> Result<()> {
        let raw: Vec<String> = self.ids.iter().map(|id| id.0.to_string()).collect();
        save_json(self.store.as_ref(), CLOSED_CONVERSATIONS_KEY, &raw)
            .await
            .context("failed to persist closed conversations")
    }
}

#[cfg(test)]
#[path = "tests/closed_set_tests.rs"]
mod tests;
