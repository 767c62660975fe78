//! One open conversation: its socket, message log, and Swapanza session.
//!
//! Like the state machine it wraps, a [`ConversationSession`] does no storage or
//! REST work itself. Whatever the engine still has to do is queued as a
//! [`ConversationUpdate`] and collected with [`ConversationSession::take_updates`].

use std::{mem, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientId, Conversation, ConversationId, Message, MessageId, UserId},
    protocol::{ActiveSessionSnapshot, ClientFrame, HistoryPage, ServerFrame},
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    connection::{
        ConnectionManager, ConnectionOutcome, ConnectionSignal, ConnectionState, ReconnectPolicy,
        SocketKey,
    },
    credential::Credential,
    error::{CredentialError, SendError, SessionCommandError},
    quota::QuotaRules,
    reconciler::{MessageReconciler, ReconcileOutcome},
    swapanza::{
        SessionEffect, SessionEvent, SessionPhase, SessionSnapshot, SessionState,
        SessionStateMachine, DEFAULT_EXPIRING_WINDOW_SECS,
    },
    timer::TimerSlot,
    transport::SocketConnector,
};

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub rules: QuotaRules,
    pub reconnect: ReconnectPolicy,
    pub invite_timeout: Duration,
    /// How often the server's view of the running session is polled.
    pub poll_interval: Duration,
    pub expiring_window_secs: i64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            rules: QuotaRules::default(),
            reconnect: ReconnectPolicy::default(),
            invite_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            expiring_window_secs: DEFAULT_EXPIRING_WINDOW_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTimer {
    Countdown,
    InviteTimeout,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimerFired {
    pub conversation_id: ConversationId,
    pub timer: SessionTimer,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationUpdate {
    Connected {
        reconnected: bool,
    },
    ConnectionLost {
        notify: bool,
    },
    Message {
        message: Message,
        outcome: ReconcileOutcome,
        from_partner: bool,
    },
    /// A pending send was refused by the server; `message` carries the content to
    /// restore into the input.
    Rejected {
        message: Option<Message>,
        reason: String,
    },
    MessagesRead {
        user_id: Option<UserId>,
    },
    Session(SessionEvent),
    PersistSnapshot(SessionSnapshot),
    ClearSnapshot,
    /// Time to ask the server for the active session.
    ResyncDue,
    ServerError(String),
    Logout,
    CredentialFatal(CredentialError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDisposition {
    /// The cancel frame went out on the socket.
    Sent,
    /// The socket refused it; the caller cancels over REST instead.
    NeedsRestFallback,
}

#[derive(Debug, Default)]
struct HistoryCursor {
    next: Option<String>,
    loaded_first_page: bool,
    loading: bool,
}

pub struct ConversationSession<E> {
    conversation: Conversation,
    local_user: UserId,
    policy: SessionPolicy,
    connection: ConnectionManager<E>,
    reconciler: MessageReconciler,
    session: SessionStateMachine,
    countdown: TimerSlot,
    invite_timeout: TimerSlot,
    poll: TimerSlot,
    history: HistoryCursor,
    updates: Vec<ConversationUpdate>,
    events: UnboundedSender<E>,
}

impl<E> ConversationSession<E>
where
    E: From<ConnectionSignal> + From<SessionTimerFired> + Send + 'static,
{
    pub fn new(
        conversation: Conversation,
        local_user: UserId,
        endpoint: Url,
        credential: Credential,
        connector: Arc<dyn SocketConnector>,
        policy: SessionPolicy,
        events: UnboundedSender<E>,
    ) -> Self {
        let mut session = SessionStateMachine::new(
            local_user,
            policy.rules,
            policy.expiring_window_secs,
            policy.invite_timeout.as_secs() as i64,
        );
        session.set_partner_hint(conversation.partner_of(local_user).cloned());
        Self {
            connection: ConnectionManager::new(
                SocketKey::Conversation(conversation.id),
                endpoint,
                credential,
                connector,
                policy.reconnect,
                events.clone(),
            ),
            conversation,
            local_user,
            policy,
            reconciler: MessageReconciler::new(),
            session,
            countdown: TimerSlot::new(),
            invite_timeout: TimerSlot::new(),
            poll: TimerSlot::new(),
            history: HistoryCursor::default(),
            updates: Vec::new(),
            events,
        }
    }

    pub fn id(&self) -> ConversationId {
        self.conversation.id
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        self.reconciler.messages()
    }

    pub fn session_state(&self) -> &SessionState {
        self.session.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn take_updates(&mut self) -> Vec<ConversationUpdate> {
        mem::take(&mut self.updates)
    }

    pub fn open(&mut self, now: DateTime<Utc>) -> Result<(), CredentialError> {
        self.connection.open(now)?;
        let conversation_id = self.id();
        self.poll
            .arm_interval(self.policy.poll_interval, &self.events, move |generation| {
                E::from(SessionTimerFired {
                    conversation_id,
                    timer: SessionTimer::Poll,
                    generation,
                })
            });
        Ok(())
    }

    /// Tears down the socket and every timer. Pending sends are dropped.
    pub fn close(&mut self, reason: &str) {
        self.connection.close(reason);
        self.countdown.cancel();
        self.invite_timeout.cancel();
        self.poll.cancel();
        let dropped = self.reconciler.clear_pending();
        if dropped > 0 {
            debug!(conversation_id = self.id().0, dropped, "dropped unconfirmed messages on close");
        }
    }

    pub fn send_message(
        &mut self,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientId, SendError> {
        self.policy
            .rules
            .check_send(content, self.session.session_remaining())?;
        if !self.connection.is_connected() {
            return Err(SendError::NotConnected);
        }

        let during_swapanza = self.session.phase().is_active();
        let client_id =
            self.reconciler
                .append_optimistic(self.local_user, content, during_swapanza, now);
        let frame = ClientFrame::ChatMessage {
            content: content.to_string(),
            client_id: client_id.clone(),
        };
        if !self.connection.send(&frame) {
            self.reconciler.discard(&client_id);
            return Err(SendError::NotConnected);
        }
        let effects = self.session.record_local_send();
        self.apply(effects);
        Ok(client_id)
    }

    pub fn can_request_swapanza(&self) -> Result<(), SessionCommandError> {
        self.session.can_request()?;
        if !self.connection.is_connected() {
            return Err(SessionCommandError::NotConnected);
        }
        Ok(())
    }

    pub fn request_swapanza(&mut self, duration: u32) -> Result<(), SessionCommandError> {
        self.can_request_swapanza()?;
        if !self
            .connection
            .send(&ClientFrame::SwapanzaRequest { duration })
        {
            return Err(SessionCommandError::NotConnected);
        }
        let effects = self.session.on_request(self.local_user, None, duration);
        self.apply(effects);
        Ok(())
    }

    pub fn confirm_swapanza(&mut self) -> Result<(), SessionCommandError> {
        if !self.session.phase().is_pending() {
            return Err(SessionCommandError::NoRequest);
        }
        if !self.connection.send(&ClientFrame::SwapanzaConfirm) {
            return Err(SessionCommandError::NotConnected);
        }
        Ok(())
    }

    pub fn cancel_swapanza(&mut self) -> Result<CancelDisposition, SessionCommandError> {
        if self.session.phase() == SessionPhase::Idle {
            return Err(SessionCommandError::NoRequest);
        }
        if !self.connection.send(&ClientFrame::SwapanzaCancel) {
            return Ok(CancelDisposition::NeedsRestFallback);
        }
        self.cancel_locally();
        Ok(CancelDisposition::Sent)
    }

    /// Local side of a cancel the server has accepted.
    pub fn cancel_locally(&mut self) {
        let effects = self.session.on_cancel();
        self.apply(effects);
    }

    pub fn handle_signal(&mut self, signal: ConnectionSignal, now: DateTime<Utc>) {
        match self.connection.handle_signal(signal, now) {
            ConnectionOutcome::Ignored | ConnectionOutcome::Reconnecting { .. } => {}
            ConnectionOutcome::Connected { reconnected } => {
                self.updates
                    .push(ConversationUpdate::Connected { reconnected });
                self.updates.push(ConversationUpdate::ResyncDue);
            }
            ConnectionOutcome::Frame(text) => self.on_frame(&text, now),
            ConnectionOutcome::Closed { first_failure, .. } => {
                self.updates.push(ConversationUpdate::ConnectionLost {
                    notify: first_failure,
                });
            }
            ConnectionOutcome::ServerLogout => self.logout(),
            ConnectionOutcome::CredentialFatal(err) => {
                self.updates.push(ConversationUpdate::CredentialFatal(err));
            }
        }
    }

    pub fn handle_timer(&mut self, fired: SessionTimerFired) {
        match fired.timer {
            SessionTimer::Countdown => {
                if self.countdown.accept(fired.generation) {
                    let effects = self.session.on_tick();
                    self.apply(effects);
                }
            }
            SessionTimer::InviteTimeout => {
                if self.invite_timeout.accept_once(fired.generation) {
                    let effects = self.session.on_invite_timeout();
                    self.apply(effects);
                }
            }
            SessionTimer::Poll => {
                if self.poll.accept(fired.generation) {
                    self.updates.push(ConversationUpdate::ResyncDue);
                }
            }
        }
    }

    pub fn apply_resync(&mut self, snapshot: &ActiveSessionSnapshot, now: DateTime<Utc>) {
        if snapshot.chat_id.is_some_and(|id| id != self.id()) {
            debug!(
                conversation_id = self.id().0,
                "ignoring active session snapshot for another conversation"
            );
            return;
        }
        let confirmed_sent = self
            .reconciler
            .confirmed_sent_during_session(self.local_user);
        let effects = self.session.resync(snapshot, now, confirmed_sent);
        self.apply(effects);
    }

    pub fn restore_snapshot(&mut self, snapshot: SessionSnapshot, now: DateTime<Utc>) {
        let effects = self.session.restore_snapshot(snapshot, now);
        self.apply(effects);
    }

    /// Re-creates an unanswered invitation from a freshly loaded conversation record.
    pub fn restore_invite(&mut self, conversation: Conversation) {
        let effects = self.session.restore_invite(&conversation);
        self.conversation = conversation;
        self.apply(effects);
    }

    /// Cursor for the next older page, or `None` when a load is already running or
    /// history is exhausted.
    pub fn begin_history_load(&mut self) -> Option<Option<String>> {
        if self.history.loading {
            return None;
        }
        if self.history.loaded_first_page && self.history.next.is_none() {
            return None;
        }
        self.history.loading = true;
        Some(self.history.next.clone())
    }

    pub fn finish_history_load(&mut self, page: Option<HistoryPage>) -> usize {
        self.history.loading = false;
        let Some(page) = page else {
            return 0;
        };
        self.history.loaded_first_page = true;
        self.history.next = page.next;
        self.reconciler.prepend_history(page.results)
    }

    pub fn has_more_history(&self) -> bool {
        !self.history.loaded_first_page || self.history.next.is_some()
    }

    pub fn logout(&mut self) {
        let effects = self.session.on_logout();
        self.apply(effects);
    }

    fn on_frame(&mut self, text: &str, now: DateTime<Utc>) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conversation_id = self.id().0, "ignoring malformed frame: {err}");
                return;
            }
        };

        match frame {
            ServerFrame::ChatMessage(payload) => {
                let from_partner = payload.sender != self.local_user;
                let server_remaining = payload.remaining_messages;
                let client_id = payload.client_id.clone();
                let id = payload.id;
                let outcome = self.reconciler.on_server_message(payload);
                if !from_partner {
                    if let Some(server_remaining) = server_remaining {
                        let confirmed_sent = self
                            .reconciler
                            .confirmed_sent_during_session(self.local_user);
                        let effects = self
                            .session
                            .reconcile_remaining(confirmed_sent, server_remaining);
                        self.apply(effects);
                    }
                }
                let message = self.merged_message(id, client_id.as_ref());
                if let Some(message) = message {
                    self.updates.push(ConversationUpdate::Message {
                        message,
                        outcome,
                        from_partner,
                    });
                }
            }
            ServerFrame::MessagesRead { user_id } => {
                self.updates.push(ConversationUpdate::MessagesRead { user_id });
            }
            ServerFrame::MessageError {
                message,
                content,
                client_id,
            } => {
                let removed = self
                    .reconciler
                    .on_rejection(client_id.as_ref(), content.as_deref());
                if removed.as_ref().is_some_and(|m| m.during_swapanza) {
                    let effects = self.session.refund_local_send();
                    self.apply(effects);
                }
                let reason = message.unwrap_or_else(|| "Failed to send message".to_string());
                warn!(conversation_id = self.id().0, %reason, "message rejected by server");
                self.updates.push(ConversationUpdate::Rejected {
                    message: removed,
                    reason,
                });
            }
            ServerFrame::SwapanzaRequest {
                duration,
                requested_by,
                requested_by_username,
            } => {
                let effects = self
                    .session
                    .on_request(requested_by, requested_by_username, duration);
                self.apply(effects);
            }
            ServerFrame::SwapanzaConfirm {
                user_id,
                all_confirmed,
                ..
            } => {
                let effects = self.session.on_confirm(user_id, all_confirmed, now);
                self.apply(effects);
            }
            ServerFrame::SwapanzaActivate(payload) => {
                let effects = self.session.on_activate(&payload, now);
                self.apply(effects);
            }
            ServerFrame::SwapanzaExpire { .. } => {
                let effects = self.session.on_expire();
                self.apply(effects);
            }
            ServerFrame::SwapanzaCancel { cancelled_by, .. } => {
                info!(
                    conversation_id = self.id().0,
                    cancelled_by = cancelled_by.map(|u| u.0),
                    "swapanza cancelled"
                );
                let effects = self.session.on_cancel();
                self.apply(effects);
            }
            ServerFrame::SwapanzaLogout { .. } => self.logout(),
            ServerFrame::Error { message } => {
                self.updates.push(ConversationUpdate::ServerError(
                    message.unwrap_or_else(|| "Server error".to_string()),
                ));
            }
        }
    }

    /// The entry a server frame was merged into.
    fn merged_message(&self, id: Option<MessageId>, client_id: Option<&ClientId>) -> Option<Message> {
        let messages = self.reconciler.messages();
        let found = match (id, client_id) {
            (Some(id), _) => messages.iter().rev().find(|m| m.id == Some(id)),
            (None, Some(client_id)) => messages
                .iter()
                .rev()
                .find(|m| m.client_id.as_ref() == Some(client_id)),
            (None, None) => None,
        };
        found.or_else(|| messages.last()).cloned()
    }

    fn apply(&mut self, effects: Vec<SessionEffect>) {
        let conversation_id = self.id();
        for effect in effects {
            match effect {
                SessionEffect::ArmInviteTimeout => {
                    self.invite_timeout.arm_once(
                        self.policy.invite_timeout,
                        &self.events,
                        move |generation| {
                            E::from(SessionTimerFired {
                                conversation_id,
                                timer: SessionTimer::InviteTimeout,
                                generation,
                            })
                        },
                    );
                }
                SessionEffect::CancelInviteTimeout => self.invite_timeout.cancel(),
                SessionEffect::StartCountdown { seconds } => {
                    debug!(conversation_id = conversation_id.0, seconds, "starting countdown");
                    self.countdown
                        .arm_interval(COUNTDOWN_TICK, &self.events, move |generation| {
                            E::from(SessionTimerFired {
                                conversation_id,
                                timer: SessionTimer::Countdown,
                                generation,
                            })
                        });
                }
                SessionEffect::StopCountdown => self.countdown.cancel(),
                SessionEffect::PersistSnapshot(snapshot) => {
                    self.updates
                        .push(ConversationUpdate::PersistSnapshot(snapshot));
                }
                SessionEffect::ClearSnapshot => self.updates.push(ConversationUpdate::ClearSnapshot),
                SessionEffect::Emit(event) => self.updates.push(ConversationUpdate::Session(event)),
                SessionEffect::Escalate => self.updates.push(ConversationUpdate::Logout),
            }
        }
    }
}

/// Store key of the persisted session snapshot for one conversation.
pub fn snapshot_key(conversation_id: ConversationId) -> String {
    format!("swapanza_active_{}", conversation_id.0)
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
