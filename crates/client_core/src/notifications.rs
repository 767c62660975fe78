use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::ConversationId,
    protocol::{ClientFrame, NotificationFrame},
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    closed_set::ClosedSetStore,
    connection::{
        ConnectionManager, ConnectionOutcome, ConnectionSignal, ConnectionState, ReconnectPolicy,
        SocketKey,
    },
    credential::Credential,
    error::CredentialError,
    timer::TimerSlot,
    transport::{SocketConnector, CLOSE_KEEPALIVE_TIMEOUT},
};

/// Unread value marking a session invitation the user has not looked at yet.
pub const INVITE_SENTINEL: i64 = -1;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadIndex {
    counts: BTreeMap<ConversationId, i64>,
}

impl UnreadIndex {
    pub fn get(&self, id: ConversationId) -> i64 {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, id: ConversationId, count: i64) {
        if count > 0 || count == INVITE_SENTINEL {
            self.counts.insert(id, count);
        } else {
            self.counts.remove(&id);
        }
    }

    pub fn mark_invite(&mut self, id: ConversationId) {
        self.counts.insert(id, INVITE_SENTINEL);
    }

    pub fn has_invite(&self, id: ConversationId) -> bool {
        self.get(id) == INVITE_SENTINEL
    }

    pub fn clear_invite(&mut self, id: ConversationId) -> bool {
        if !self.has_invite(id) {
            return false;
        }
        self.counts.remove(&id);
        true
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    /// Sum of real unread counts; invitations do not count.
    pub fn total(&self) -> i64 {
        self.counts.values().filter(|count| **count > 0).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConversationId, i64)> + '_ {
        self.counts.iter().map(|(id, count)| (*id, *count))
    }

    /// Replaces counts with a polled snapshot. Pending invitations survive unless
    /// the snapshot reports real unread messages for that conversation.
    pub fn replace_all(
        &mut self,
        counts: impl IntoIterator<Item = (ConversationId, i64)>,
        closed: &ClosedSetStore,
    ) {
        let invites: Vec<ConversationId> = self
            .counts
            .iter()
            .filter(|(_, count)| **count == INVITE_SENTINEL)
            .map(|(id, _)| *id)
            .collect();
        self.counts = counts
            .into_iter()
            .filter(|(id, count)| *count > 0 && !closed.is_closed(*id))
            .collect();
        for id in invites {
            if !closed.is_closed(id) {
                self.counts.entry(id).or_insert(INVITE_SENTINEL);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeepalivePolicy {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveTimer {
    Ping,
    PongTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveFired {
    pub timer: KeepaliveTimer,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Nothing,
    Connected {
        reconnected: bool,
    },
    /// First failure of an outage when `notify` is set.
    ConnectionLost {
        notify: bool,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        count: i64,
    },
    InviteReceived {
        conversation_id: ConversationId,
        from: Option<String>,
    },
    InviteCleared {
        conversation_id: ConversationId,
    },
    /// Update for a dismissed conversation, dropped.
    Suppressed {
        conversation_id: ConversationId,
    },
    ServerError(String),
    Logout,
    CredentialFatal(CredentialError),
}

/// User-scoped socket carrying unread counts and session invitations.
pub struct NotificationChannel<E> {
    connection: ConnectionManager<E>,
    keepalive: KeepalivePolicy,
    ping: TimerSlot,
    pong: TimerSlot,
    unread: UnreadIndex,
    events: UnboundedSender<E>,
}

impl<E> NotificationChannel<E>
where
    E: From<ConnectionSignal> + From<KeepaliveFired> + Send + 'static,
{
    pub fn new(
        endpoint: Url,
        credential: Credential,
        connector: Arc<dyn SocketConnector>,
        reconnect: ReconnectPolicy,
        keepalive: KeepalivePolicy,
        events: UnboundedSender<E>,
    ) -> Self {
        Self {
            connection: ConnectionManager::new(
                SocketKey::Notifications,
                endpoint,
                credential,
                connector,
                reconnect,
                events.clone(),
            ),
            keepalive,
            ping: TimerSlot::new(),
            pong: TimerSlot::new(),
            unread: UnreadIndex::default(),
            events,
        }
    }

    pub fn open(&mut self, now: DateTime<Utc>) -> Result<(), CredentialError> {
        self.connection.open(now)
    }

    pub fn close(&mut self) {
        self.stop_keepalive();
        self.connection.close("signed out");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn unread(&self) -> &UnreadIndex {
        &self.unread
    }

    pub fn unread_mut(&mut self) -> &mut UnreadIndex {
        &mut self.unread
    }

    pub fn handle_signal(
        &mut self,
        signal: ConnectionSignal,
        now: DateTime<Utc>,
        closed: &ClosedSetStore,
    ) -> NotificationOutcome {
        match self.connection.handle_signal(signal, now) {
            ConnectionOutcome::Ignored | ConnectionOutcome::Reconnecting { .. } => {
                NotificationOutcome::Nothing
            }
            ConnectionOutcome::Connected { reconnected } => {
                self.start_keepalive();
                NotificationOutcome::Connected { reconnected }
            }
            ConnectionOutcome::Frame(text) => self.on_frame(&text, closed),
            ConnectionOutcome::Closed { first_failure, .. } => {
                self.stop_keepalive();
                NotificationOutcome::ConnectionLost {
                    notify: first_failure,
                }
            }
            ConnectionOutcome::ServerLogout => {
                self.stop_keepalive();
                NotificationOutcome::Logout
            }
            ConnectionOutcome::CredentialFatal(err) => {
                self.stop_keepalive();
                NotificationOutcome::CredentialFatal(err)
            }
        }
    }

    pub fn handle_keepalive(&mut self, fired: KeepaliveFired) {
        match fired.timer {
            KeepaliveTimer::Ping => {
                if !self.ping.accept(fired.generation) {
                    return;
                }
                if self.connection.send(&ClientFrame::Ping) {
                    self.arm_pong_timeout();
                }
            }
            KeepaliveTimer::PongTimeout => {
                if !self.pong.accept_once(fired.generation) {
                    return;
                }
                warn!(
                    timeout_secs = self.keepalive.pong_timeout.as_secs(),
                    "no pong received, forcing reconnect"
                );
                self.connection
                    .force_reconnect(CLOSE_KEEPALIVE_TIMEOUT, "No pong received");
            }
        }
    }

    fn on_frame(&mut self, text: &str, closed: &ClosedSetStore) -> NotificationOutcome {
        let frame = match serde_json::from_str::<NotificationFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("ignoring malformed notification frame: {err}");
                return NotificationOutcome::Nothing;
            }
        };
        if let Some(conversation_id) = frame.conversation_id() {
            if closed.is_closed(conversation_id) {
                debug!(conversation_id = conversation_id.0, "suppressing notification for closed conversation");
                return NotificationOutcome::Suppressed { conversation_id };
            }
        }

        match frame {
            NotificationFrame::Pong => {
                self.pong.cancel();
                NotificationOutcome::Nothing
            }
            NotificationFrame::Ping => {
                self.connection.send(&ClientFrame::Pong);
                NotificationOutcome::Nothing
            }
            NotificationFrame::UnreadCount { chat_id, count } => {
                self.unread.set(chat_id, count);
                NotificationOutcome::UnreadChanged {
                    conversation_id: chat_id,
                    count: self.unread.get(chat_id),
                }
            }
            NotificationFrame::SwapanzaInvite { chat_id, from } => {
                self.unread.mark_invite(chat_id);
                info!(conversation_id = chat_id.0, "swapanza invite received");
                NotificationOutcome::InviteReceived {
                    conversation_id: chat_id,
                    from,
                }
            }
            NotificationFrame::SwapanzaCancel { chat_id, .. } => {
                if self.unread.clear_invite(chat_id) {
                    NotificationOutcome::InviteCleared {
                        conversation_id: chat_id,
                    }
                } else {
                    NotificationOutcome::Nothing
                }
            }
            NotificationFrame::SwapanzaLogout { .. } => NotificationOutcome::Logout,
            NotificationFrame::Error { message } => NotificationOutcome::ServerError(
                message.unwrap_or_else(|| "Server error".to_string()),
            ),
        }
    }

    fn start_keepalive(&mut self) {
        self.pong.cancel();
        self.connection.send(&ClientFrame::Ping);
        self.ping
            .arm_interval(self.keepalive.ping_interval, &self.events, |generation| {
                E::from(KeepaliveFired {
                    timer: KeepaliveTimer::Ping,
                    generation,
                })
            });
    }

    fn arm_pong_timeout(&mut self) {
        self.pong
            .arm_once(self.keepalive.pong_timeout, &self.events, |generation| {
                E::from(KeepaliveFired {
                    timer: KeepaliveTimer::PongTimeout,
                    generation,
                })
            });
    }

    fn stop_keepalive(&mut self) {
        self.ping.cancel();
        self.pong.cancel();
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
