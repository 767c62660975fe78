use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientId, Message, UserId},
    protocol::MessagePayload,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// An entry with the same server id was updated in place.
    Replaced,
    /// A pending local entry was confirmed in place.
    Confirmed,
    Appended,
}

/// Ordered message log of one conversation, merging optimistic local sends with
/// authoritative server frames.
#[derive(Debug, Default)]
pub struct MessageReconciler {
    messages: Vec<Message>,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.pending).count()
    }

    pub fn append_optimistic(
        &mut self,
        sender: UserId,
        content: impl Into<String>,
        during_swapanza: bool,
        now: DateTime<Utc>,
    ) -> ClientId {
        let client_id = ClientId::generate();
        self.messages.push(Message {
            id: None,
            client_id: Some(client_id.clone()),
            sender,
            content: content.into(),
            created_at: now,
            during_swapanza,
            apparent_sender: None,
            pending: true,
        });
        client_id
    }

    /// Drops a pending entry whose frame never left the client.
    pub fn discard(&mut self, client_id: &ClientId) -> Option<Message> {
        let index = self
            .messages
            .iter()
            .position(|m| m.pending && m.client_id.as_ref() == Some(client_id))?;
        Some(self.messages.remove(index))
    }

    pub fn on_server_message(&mut self, payload: MessagePayload) -> ReconcileOutcome {
        let incoming = Message::from(payload);

        if let Some(id) = incoming.id {
            if self.messages.iter().any(|m| m.id == Some(id)) {
                // History may have delivered the row before its echo; the echo's
                // client id then names a pending twin that must go.
                let before = self.messages.len();
                if let Some(client_id) = incoming.client_id.as_ref() {
                    self.messages.retain(|m| {
                        !(m.pending && m.id != Some(id) && m.client_id.as_ref() == Some(client_id))
                    });
                }
                let absorbed_pending = self.messages.len() < before;

                if let Some(existing) = self.messages.iter_mut().find(|m| m.id == Some(id)) {
                    let client_id = incoming.client_id.clone().or_else(|| existing.client_id.take());
                    *existing = Message {
                        client_id,
                        ..incoming
                    };
                }
                return if absorbed_pending {
                    ReconcileOutcome::Confirmed
                } else {
                    ReconcileOutcome::Replaced
                };
            }
        }

        if let Some(client_id) = incoming.client_id.as_ref() {
            if let Some(existing) = self
                .messages
                .iter_mut()
                .find(|m| m.pending && m.client_id.as_ref() == Some(client_id))
            {
                *existing = incoming;
                return ReconcileOutcome::Confirmed;
            }
        }

        let mut incoming = incoming;
        if let Some(client_id) = incoming.client_id.as_ref() {
            if self
                .messages
                .iter()
                .any(|m| m.client_id.as_ref() == Some(client_id))
            {
                debug!(%client_id, "dropping duplicate client id from appended message");
                incoming.client_id = None;
            }
        }
        self.messages.push(incoming);
        ReconcileOutcome::Appended
    }

    /// Removes exactly one pending entry named by a rejection frame, preferring the
    /// client id and falling back to the newest pending entry with the same content.
    pub fn on_rejection(
        &mut self,
        client_id: Option<&ClientId>,
        content: Option<&str>,
    ) -> Option<Message> {
        let by_client_id = client_id.and_then(|client_id| {
            self.messages
                .iter()
                .position(|m| m.pending && m.client_id.as_ref() == Some(client_id))
        });
        let index = by_client_id.or_else(|| {
            let content = content?;
            self.messages
                .iter()
                .rposition(|m| m.pending && m.content == content)
        })?;
        Some(self.messages.remove(index))
    }

    /// Adds an older history page. Pages arrive newest first.
    pub fn prepend_history(&mut self, page: Vec<MessagePayload>) -> usize {
        let older: Vec<Message> = page
            .into_iter()
            .rev()
            .map(Message::from)
            .filter(|m| match m.id {
                Some(id) => !self.messages.iter().any(|known| known.id == Some(id)),
                None => true,
            })
            .collect();
        let added = older.len();
        self.messages.splice(0..0, older);
        added
    }

    pub fn confirmed_sent_during_session(&self, user: UserId) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.pending && m.during_swapanza && m.sender == user)
            .count()
    }

    pub fn clear_pending(&mut self) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| !m.pending);
        before - self.messages.len()
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
