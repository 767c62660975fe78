//! The engine task: one owner for every socket, timer, and piece of client state.
//!
//! Socket drivers, timers, and REST calls run as helper tasks that only post
//! [`EngineEvent`]s back onto one queue. The engine drains that queue one event at
//! a time, so no component state is ever touched from two places at once.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use shared::{
    domain::{ClientId, Conversation, ConversationId, Message, UserId},
    protocol::{ActiveSessionSnapshot, EligibilityResponse, HistoryPage},
};
use storage::{load_json, save_json, PersistentStore};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    closed_set::ClosedSetStore,
    config::ClientSettings,
    connection::{
        conversation_endpoint, notifications_endpoint, websocket_base, ConnectionSignal,
        ConnectionState, ReconnectPolicy, SocketKey,
    },
    conversation::{
        snapshot_key, CancelDisposition, ConversationSession, ConversationUpdate, SessionPolicy,
        SessionTimerFired,
    },
    credential::{purge_credential, Credential},
    error::{CredentialError, EngineError, RestError, SendError, SessionCommandError},
    notifications::{KeepaliveFired, KeepalivePolicy, NotificationChannel, NotificationOutcome},
    reconciler::ReconcileOutcome,
    rest::ChatApi,
    swapanza::{SessionEvent, SessionSnapshot, SessionState},
    timer::TimerSlot,
    transport::SocketConnector,
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutReason {
    Credential(CredentialError),
    ServerLogout,
    Requested,
}

/// Everything a front end can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected {
        key: SocketKey,
        reconnected: bool,
    },
    /// One notice per outage.
    ConnectionLost {
        key: SocketKey,
    },
    ConversationOpened {
        conversation_id: ConversationId,
    },
    ConversationClosed {
        conversation_id: ConversationId,
    },
    ConversationReopened {
        conversation_id: ConversationId,
    },
    Message {
        conversation_id: ConversationId,
        message: Message,
        outcome: ReconcileOutcome,
    },
    MessageRejected {
        conversation_id: ConversationId,
        restored_content: Option<String>,
        reason: String,
    },
    MessagesRead {
        conversation_id: ConversationId,
        user_id: Option<UserId>,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
        added: usize,
        has_more: bool,
    },
    Session {
        conversation_id: ConversationId,
        event: SessionEvent,
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
    Error(String),
    SignedOut {
        reason: SignOutReason,
    },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub local_user: UserId,
    pub websocket_base: Url,
    pub session: SessionPolicy,
    pub reconnect: ReconnectPolicy,
    pub keepalive: KeepalivePolicy,
    pub unread_poll: Duration,
    pub credential_check: Duration,
}

impl EngineConfig {
    pub fn from_settings(settings: &ClientSettings, local_user: UserId) -> Result<Self> {
        Ok(Self {
            local_user,
            websocket_base: websocket_base(&settings.server_url)?,
            session: settings.session_policy(),
            reconnect: settings.reconnect_policy(),
            keepalive: settings.keepalive_policy(),
            unread_poll: settings.unread_poll_interval(),
            credential_check: settings.credential_check_interval(),
        })
    }
}

/// Collaborators injected into the engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub api: Arc<dyn ChatApi>,
    pub connector: Arc<dyn SocketConnector>,
    pub store: Arc<dyn PersistentStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineTimer {
    UnreadPoll,
    CredentialCheck,
}

#[derive(Debug, Clone, Copy)]
struct EngineTimerFired {
    timer: EngineTimer,
    generation: u64,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    OpenConversation {
        conversation_id: ConversationId,
        reply: Reply<Result<(), EngineError>>,
    },
    CloseConversation {
        conversation_id: ConversationId,
        reply: Reply<bool>,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        reply: Reply<Result<ClientId, SendError>>,
    },
    RequestSwapanza {
        conversation_id: ConversationId,
        duration: u32,
        reply: Reply<Result<(), SessionCommandError>>,
    },
    ConfirmSwapanza {
        conversation_id: ConversationId,
        reply: Reply<Result<(), SessionCommandError>>,
    },
    CancelSwapanza {
        conversation_id: ConversationId,
        reply: Reply<Result<(), SessionCommandError>>,
    },
    LoadOlder {
        conversation_id: ConversationId,
        reply: Reply<Result<usize, EngineError>>,
    },
    Dismiss {
        conversation_id: ConversationId,
        reply: Reply<Result<bool, EngineError>>,
    },
    DismissAll {
        conversation_ids: Vec<ConversationId>,
        reply: Reply<Result<usize, EngineError>>,
    },
    Reopen {
        conversation_id: ConversationId,
        reply: Reply<Result<bool, EngineError>>,
    },
    FindOrCreate {
        partner: UserId,
        reply: Reply<Result<Conversation, EngineError>>,
    },
    ListConversations {
        reply: Reply<Result<Vec<Conversation>, EngineError>>,
    },
    ResetNotifications {
        reply: Reply<Result<(), EngineError>>,
    },
    Messages {
        conversation_id: ConversationId,
        reply: Reply<Option<Vec<Message>>>,
    },
    SessionState {
        conversation_id: ConversationId,
        reply: Reply<Option<SessionState>>,
    },
    ConnectionState {
        key: SocketKey,
        reply: Reply<Option<ConnectionState>>,
    },
    UnreadCounts {
        reply: Reply<Vec<(ConversationId, i64)>>,
    },
    SignOut {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Results of spawned REST calls, handed back to the engine task.
enum RestCompletion {
    ConversationLoaded {
        conversation_id: ConversationId,
        result: Result<Conversation, RestError>,
        reply: Reply<Result<(), EngineError>>,
    },
    History {
        conversation_id: ConversationId,
        result: Result<HistoryPage, RestError>,
        reply: Option<Reply<Result<usize, EngineError>>>,
    },
    ActiveSession {
        conversation_id: ConversationId,
        result: Result<ActiveSessionSnapshot, RestError>,
    },
    Eligibility {
        conversation_id: ConversationId,
        duration: u32,
        result: Result<EligibilityResponse, RestError>,
        reply: Reply<Result<(), SessionCommandError>>,
    },
    CancelFallback {
        conversation_id: ConversationId,
        result: Result<(), RestError>,
        reply: Reply<Result<(), SessionCommandError>>,
    },
    UnreadCounts(Result<Vec<(ConversationId, i64)>, RestError>),
    Conversations {
        result: Result<Vec<Conversation>, RestError>,
        reply: Reply<Result<Vec<Conversation>, EngineError>>,
    },
    FindOrCreate {
        result: Result<Conversation, RestError>,
        reply: Reply<Result<Conversation, EngineError>>,
    },
    ResetNotifications {
        result: Result<(), RestError>,
        reply: Reply<Result<(), EngineError>>,
    },
}

enum EngineEvent {
    Command(Command),
    Connection(ConnectionSignal),
    Keepalive(KeepaliveFired),
    Session(SessionTimerFired),
    Timer(EngineTimerFired),
    Rest(RestCompletion),
}

impl From<ConnectionSignal> for EngineEvent {
    fn from(value: ConnectionSignal) -> Self {
        Self::Connection(value)
    }
}

impl From<KeepaliveFired> for EngineEvent {
    fn from(value: KeepaliveFired) -> Self {
        Self::Keepalive(value)
    }
}

impl From<SessionTimerFired> for EngineEvent {
    fn from(value: SessionTimerFired) -> Self {
        Self::Session(value)
    }
}

impl From<EngineTimerFired> for EngineEvent {
    fn from(value: EngineTimerFired) -> Self {
        Self::Timer(value)
    }
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineEvent>,
    events: broadcast::Sender<ClientEvent>,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineEvent::Command(make(reply)))
            .ok()?;
        rx.await.ok()
    }

    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<(), EngineError> {
        self.call(|reply| Command::OpenConversation {
            conversation_id,
            reply,
        })
        .await
        .unwrap_or(Err(EngineError::Stopped))
    }

    /// `false` when the conversation was not open.
    pub async fn close_conversation(&self, conversation_id: ConversationId) -> bool {
        self.call(|reply| Command::CloseConversation {
            conversation_id,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Result<ClientId, SendError> {
        let content = content.into();
        self.call(|reply| Command::SendMessage {
            conversation_id,
            content,
            reply,
        })
        .await
        .unwrap_or(Err(SendError::EngineStopped))
    }

    /// Asks the partner for a session of `duration` minutes.
    pub async fn request_swapanza(
        &self,
        conversation_id: ConversationId,
        duration: u32,
    ) -> Result<(), SessionCommandError> {
        self.call(|reply| Command::RequestSwapanza {
            conversation_id,
            duration,
            reply,
        })
        .await
        .unwrap_or(Err(SessionCommandError::EngineStopped))
    }

    pub async fn confirm_swapanza(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), SessionCommandError> {
        self.call(|reply| Command::ConfirmSwapanza {
            conversation_id,
            reply,
        })
        .await
        .unwrap_or(Err(SessionCommandError::EngineStopped))
    }

    pub async fn cancel_swapanza(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), SessionCommandError> {
        self.call(|reply| Command::CancelSwapanza {
            conversation_id,
            reply,
        })
        .await
        .unwrap_or(Err(SessionCommandError::EngineStopped))
    }

    /// Loads the next older history page; returns how many messages were added.
    pub async fn load_older(&self, conversation_id: ConversationId) -> Result<usize, EngineError> {
        self.call(|reply| Command::LoadOlder {
            conversation_id,
            reply,
        })
        .await
        .unwrap_or(Err(EngineError::Stopped))
    }

    pub async fn dismiss(&self, conversation_id: ConversationId) -> Result<bool, EngineError> {
        self.call(|reply| Command::Dismiss {
            conversation_id,
            reply,
        })
        .await
        .unwrap_or(Err(EngineError::Stopped))
    }

    pub async fn dismiss_all(
        &self,
        conversation_ids: Vec<ConversationId>,
    ) -> Result<usize, EngineError> {
        self.call(|reply| Command::DismissAll {
            conversation_ids,
            reply,
        })
        .await
        .unwrap_or(Err(EngineError::Stopped))
    }

    pub async fn reopen(&self, conversation_id: ConversationId) -> Result<bool, EngineError> {
        self.call(|reply| Command::Reopen {
            conversation_id,
            reply,
        })
        .await
        .unwrap_or(Err(EngineError::Stopped))
    }

    pub async fn find_or_create(&self, partner: UserId) -> Result<Conversation, EngineError> {
        self.call(|reply| Command::FindOrCreate { partner, reply })
            .await
            .unwrap_or(Err(EngineError::Stopped))
    }

    /// Conversations that have not been dismissed.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, EngineError> {
        self.call(|reply| Command::ListConversations { reply })
            .await
            .unwrap_or(Err(EngineError::Stopped))
    }

    pub async fn reset_notifications(&self) -> Result<(), EngineError> {
        self.call(|reply| Command::ResetNotifications { reply })
            .await
            .unwrap_or(Err(EngineError::Stopped))
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Option<Vec<Message>> {
        self.call(|reply| Command::Messages {
            conversation_id,
            reply,
        })
        .await
        .flatten()
    }

    pub async fn session_state(&self, conversation_id: ConversationId) -> Option<SessionState> {
        self.call(|reply| Command::SessionState {
            conversation_id,
            reply,
        })
        .await
        .flatten()
    }

    pub async fn connection_state(&self, key: SocketKey) -> Option<ConnectionState> {
        self.call(|reply| Command::ConnectionState { key, reply })
            .await
            .flatten()
    }

    pub async fn unread_counts(&self) -> Vec<(ConversationId, i64)> {
        self.call(|reply| Command::UnreadCounts { reply })
            .await
            .unwrap_or_default()
    }

    /// Signs out locally: closes everything and purges the stored credential.
    pub async fn sign_out(&self) {
        let _ = self.call(|reply| Command::SignOut { reply }).await;
    }

    /// Stops the engine without touching the stored credential.
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
    }
}

pub struct ChatEngine {
    config: EngineConfig,
    credential: Credential,
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn SocketConnector>,
    store: Arc<dyn PersistentStore>,
    closed: ClosedSetStore,
    notifications: NotificationChannel<EngineEvent>,
    conversations: HashMap<ConversationId, ConversationSession<EngineEvent>>,
    unread_poll: TimerSlot,
    credential_check: TimerSlot,
    tx: mpsc::UnboundedSender<EngineEvent>,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    events: broadcast::Sender<ClientEvent>,
    running: bool,
}

impl ChatEngine {
    /// Validates the credential, loads local state, and starts the engine task.
    /// Nothing touches the network when the credential is unusable.
    pub async fn spawn(
        config: EngineConfig,
        credential: Credential,
        deps: EngineDeps,
    ) -> Result<(EngineHandle, broadcast::Receiver<ClientEvent>, JoinHandle<()>)> {
        credential
            .ensure_valid(Utc::now())
            .context("cannot start with this credential")?;
        let closed = ClosedSetStore::load(Arc::clone(&deps.store)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, first_subscriber) = broadcast::channel(EVENT_CAPACITY);
        let notifications = NotificationChannel::new(
            notifications_endpoint(&config.websocket_base)?,
            credential.clone(),
            Arc::clone(&deps.connector),
            config.reconnect,
            config.keepalive,
            tx.clone(),
        );

        let handle = EngineHandle {
            commands: tx.clone(),
            events: events.clone(),
        };
        let engine = Self {
            config,
            credential,
            api: deps.api,
            connector: deps.connector,
            store: deps.store,
            closed,
            notifications,
            conversations: HashMap::new(),
            unread_poll: TimerSlot::new(),
            credential_check: TimerSlot::new(),
            tx,
            rx,
            events,
            running: true,
        };
        let task = tokio::spawn(engine.run());
        Ok((handle, first_subscriber, task))
    }

    async fn run(mut self) {
        self.start().await;
        while self.running {
            let Some(event) = self.rx.recv().await else {
                break;
            };
            match event {
                EngineEvent::Command(command) => self.on_command(command).await,
                EngineEvent::Connection(signal) => self.on_connection(signal).await,
                EngineEvent::Keepalive(fired) => self.notifications.handle_keepalive(fired),
                EngineEvent::Session(fired) => {
                    if let Some(session) = self.conversations.get_mut(&fired.conversation_id) {
                        session.handle_timer(fired);
                        self.flush(fired.conversation_id).await;
                    }
                }
                EngineEvent::Timer(fired) => self.on_timer(fired).await,
                EngineEvent::Rest(completion) => self.on_rest(completion).await,
            }
        }
        info!("engine stopped");
    }

    async fn start(&mut self) {
        let check = self.config.credential_check;
        self.credential_check
            .arm_interval(check, &self.tx, |generation| {
                EngineEvent::from(EngineTimerFired {
                    timer: EngineTimer::CredentialCheck,
                    generation,
                })
            });
        if let Err(err) = self.notifications.open(Utc::now()) {
            self.sign_out(SignOutReason::Credential(err)).await;
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn spawn_rest<F, T>(&self, call: F, complete: impl FnOnce(T) -> RestCompletion + Send + 'static)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let output = call.await;
            let _ = tx.send(EngineEvent::Rest(complete(output)));
        });
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::OpenConversation {
                conversation_id,
                reply,
            } => {
                if self.conversations.contains_key(&conversation_id) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let api = Arc::clone(&self.api);
                self.spawn_rest(
                    async move { api.fetch_conversation(conversation_id).await },
                    move |result| RestCompletion::ConversationLoaded {
                        conversation_id,
                        result,
                        reply,
                    },
                );
            }
            Command::CloseConversation {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.close_conversation(conversation_id));
            }
            Command::SendMessage {
                conversation_id,
                content,
                reply,
            } => {
                let Some(session) = self.conversations.get_mut(&conversation_id) else {
                    let _ = reply.send(Err(SendError::NotOpen));
                    return;
                };
                let result = session.send_message(&content, Utc::now());
                if let Err(err) = &result {
                    debug!(conversation_id = conversation_id.0, "send refused: {err}");
                }
                let _ = reply.send(result);
                self.flush(conversation_id).await;
            }
            Command::RequestSwapanza {
                conversation_id,
                duration,
                reply,
            } => {
                let Some(session) = self.conversations.get(&conversation_id) else {
                    let _ = reply.send(Err(SessionCommandError::NotOpen));
                    return;
                };
                if let Err(err) = session.can_request_swapanza() {
                    let _ = reply.send(Err(err));
                    return;
                }
                let api = Arc::clone(&self.api);
                self.spawn_rest(
                    async move { api.can_start_swapanza().await },
                    move |result| RestCompletion::Eligibility {
                        conversation_id,
                        duration,
                        result,
                        reply,
                    },
                );
            }
            Command::ConfirmSwapanza {
                conversation_id,
                reply,
            } => {
                let Some(session) = self.conversations.get_mut(&conversation_id) else {
                    let _ = reply.send(Err(SessionCommandError::NotOpen));
                    return;
                };
                let _ = reply.send(session.confirm_swapanza());
                self.flush(conversation_id).await;
            }
            Command::CancelSwapanza {
                conversation_id,
                reply,
            } => {
                let Some(session) = self.conversations.get_mut(&conversation_id) else {
                    let _ = reply.send(Err(SessionCommandError::NotOpen));
                    return;
                };
                match session.cancel_swapanza() {
                    Ok(CancelDisposition::Sent) => {
                        let _ = reply.send(Ok(()));
                        self.flush(conversation_id).await;
                    }
                    Ok(CancelDisposition::NeedsRestFallback) => {
                        info!(
                            conversation_id = conversation_id.0,
                            "socket unavailable, cancelling swapanza over REST"
                        );
                        let api = Arc::clone(&self.api);
                        self.spawn_rest(
                            async move { api.cancel_swapanza(conversation_id).await },
                            move |result| RestCompletion::CancelFallback {
                                conversation_id,
                                result,
                                reply,
                            },
                        );
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::LoadOlder {
                conversation_id,
                reply,
            } => {
                let Some(session) = self.conversations.get_mut(&conversation_id) else {
                    let _ = reply.send(Err(EngineError::NotOpen(conversation_id)));
                    return;
                };
                match session.begin_history_load() {
                    Some(cursor) => self.fetch_history(conversation_id, cursor, Some(reply)),
                    None => {
                        let _ = reply.send(Ok(0));
                    }
                }
            }
            Command::Dismiss {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.dismiss(conversation_id).await);
            }
            Command::DismissAll {
                conversation_ids,
                reply,
            } => {
                for conversation_id in &conversation_ids {
                    self.set_unread(*conversation_id, 0);
                }
                let result = self
                    .closed
                    .close_all(conversation_ids)
                    .await
                    .map_err(EngineError::Storage);
                let _ = reply.send(result);
            }
            Command::Reopen {
                conversation_id,
                reply,
            } => {
                let result = self.reopen(conversation_id).await;
                let _ = reply.send(result);
            }
            Command::FindOrCreate { partner, reply } => {
                let api = Arc::clone(&self.api);
                self.spawn_rest(
                    async move {
                        match api.find_conversation_with(partner).await {
                            Ok(Some(existing)) => Ok(existing),
                            Ok(None) => api.create_conversation(partner).await,
                            Err(err) => Err(err),
                        }
                    },
                    move |result| RestCompletion::FindOrCreate { result, reply },
                );
            }
            Command::ListConversations { reply } => {
                let api = Arc::clone(&self.api);
                self.spawn_rest(
                    async move { api.list_conversations().await },
                    move |result| RestCompletion::Conversations { result, reply },
                );
            }
            Command::ResetNotifications { reply } => {
                let api = Arc::clone(&self.api);
                self.spawn_rest(
                    async move { api.reset_notifications().await },
                    move |result| RestCompletion::ResetNotifications { result, reply },
                );
            }
            Command::Messages {
                conversation_id,
                reply,
            } => {
                let messages = self
                    .conversations
                    .get(&conversation_id)
                    .map(|session| session.messages().to_vec());
                let _ = reply.send(messages);
            }
            Command::SessionState {
                conversation_id,
                reply,
            } => {
                let state = self
                    .conversations
                    .get(&conversation_id)
                    .map(|session| session.session_state().clone());
                let _ = reply.send(state);
            }
            Command::ConnectionState { key, reply } => {
                let state = match key {
                    SocketKey::Notifications => Some(self.notifications.connection_state()),
                    SocketKey::Conversation(id) => self
                        .conversations
                        .get(&id)
                        .map(|session| session.connection_state()),
                };
                let _ = reply.send(state);
            }
            Command::UnreadCounts { reply } => {
                let _ = reply.send(self.notifications.unread().iter().collect());
            }
            Command::SignOut { reply } => {
                self.sign_out(SignOutReason::Requested).await;
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
            }
        }
    }

    async fn on_connection(&mut self, signal: ConnectionSignal) {
        let now = Utc::now();
        match signal.key {
            SocketKey::Notifications => {
                let outcome = self.notifications.handle_signal(signal, now, &self.closed);
                self.on_notification(outcome).await;
            }
            SocketKey::Conversation(conversation_id) => {
                let Some(session) = self.conversations.get_mut(&conversation_id) else {
                    return;
                };
                session.handle_signal(signal, now);
                self.flush(conversation_id).await;
            }
        }
    }

    async fn on_notification(&mut self, outcome: NotificationOutcome) {
        match outcome {
            NotificationOutcome::Nothing => {}
            NotificationOutcome::Connected { reconnected } => {
                self.unread_poll.cancel();
                self.emit(ClientEvent::Connected {
                    key: SocketKey::Notifications,
                    reconnected,
                });
                self.poll_unread();
            }
            NotificationOutcome::ConnectionLost { notify } => {
                if notify {
                    self.emit(ClientEvent::ConnectionLost {
                        key: SocketKey::Notifications,
                    });
                }
                if !self.unread_poll.is_armed() {
                    self.unread_poll
                        .arm_interval(self.config.unread_poll, &self.tx, |generation| {
                            EngineEvent::from(EngineTimerFired {
                                timer: EngineTimer::UnreadPoll,
                                generation,
                            })
                        });
                }
            }
            NotificationOutcome::UnreadChanged {
                conversation_id,
                count,
            } => self.emit(ClientEvent::UnreadChanged {
                conversation_id,
                count,
            }),
            NotificationOutcome::InviteReceived {
                conversation_id,
                from,
            } => self.emit(ClientEvent::InviteReceived {
                conversation_id,
                from,
            }),
            NotificationOutcome::InviteCleared { conversation_id } => {
                self.emit(ClientEvent::InviteCleared { conversation_id })
            }
            NotificationOutcome::Suppressed { conversation_id } => {
                debug!(conversation_id = conversation_id.0, "notification suppressed");
            }
            NotificationOutcome::ServerError(message) => self.emit(ClientEvent::Error(message)),
            NotificationOutcome::Logout => self.sign_out(SignOutReason::ServerLogout).await,
            NotificationOutcome::CredentialFatal(err) => {
                self.sign_out(SignOutReason::Credential(err)).await
            }
        }
    }

    async fn on_timer(&mut self, fired: EngineTimerFired) {
        match fired.timer {
            EngineTimer::UnreadPoll => {
                if self.unread_poll.accept(fired.generation) && !self.notifications.is_connected()
                {
                    self.poll_unread();
                }
            }
            EngineTimer::CredentialCheck => {
                if !self.credential_check.accept(fired.generation) {
                    return;
                }
                if let Err(err) = self.credential.ensure_valid(Utc::now()) {
                    warn!("credential no longer valid: {err}");
                    self.sign_out(SignOutReason::Credential(err)).await;
                }
            }
        }
    }

    async fn on_rest(&mut self, completion: RestCompletion) {
        match completion {
            RestCompletion::ConversationLoaded {
                conversation_id,
                result,
                reply,
            } => match result {
                Ok(conversation) => {
                    let result = self.open_loaded(conversation).await;
                    let _ = reply.send(result);
                }
                Err(err) => {
                    warn!(conversation_id = conversation_id.0, "failed to load conversation: {err}");
                    let fatal = err.is_unauthorized();
                    let _ = reply.send(Err(err.into()));
                    if fatal {
                        self.sign_out(SignOutReason::Credential(CredentialError::Revoked))
                            .await;
                    }
                }
            },
            RestCompletion::History {
                conversation_id,
                result,
                reply,
            } => {
                let Some(session) = self.conversations.get_mut(&conversation_id) else {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(EngineError::NotOpen(conversation_id)));
                    }
                    return;
                };
                match result {
                    Ok(page) => {
                        let added = session.finish_history_load(Some(page));
                        let has_more = session.has_more_history();
                        self.emit(ClientEvent::HistoryLoaded {
                            conversation_id,
                            added,
                            has_more,
                        });
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(added));
                        }
                    }
                    Err(err) => {
                        session.finish_history_load(None);
                        warn!(conversation_id = conversation_id.0, "history load failed: {err}");
                        let fatal = err.is_unauthorized();
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(err.into()));
                        }
                        if fatal {
                            self.sign_out(SignOutReason::Credential(CredentialError::Revoked))
                                .await;
                        }
                    }
                }
            }
            RestCompletion::ActiveSession {
                conversation_id,
                result,
            } => match result {
                Ok(snapshot) => {
                    if let Some(session) = self.conversations.get_mut(&conversation_id) {
                        session.apply_resync(&snapshot, Utc::now());
                        self.flush(conversation_id).await;
                    }
                }
                Err(err) => self.on_background_failure("active session poll", err).await,
            },
            RestCompletion::Eligibility {
                conversation_id,
                duration,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(eligibility) if eligibility.can_start => {
                        match self.conversations.get_mut(&conversation_id) {
                            Some(session) => session.request_swapanza(duration),
                            None => Err(SessionCommandError::NotOpen),
                        }
                    }
                    Ok(eligibility) => Err(SessionCommandError::NotEligible(
                        eligibility
                            .reason
                            .or(eligibility.error)
                            .unwrap_or_else(|| "not eligible".to_string()),
                    )),
                    Err(err) => Err(SessionCommandError::Rest(err.to_string())),
                };
                let _ = reply.send(outcome);
                self.flush(conversation_id).await;
            }
            RestCompletion::CancelFallback {
                conversation_id,
                result,
                reply,
            } => match result {
                Ok(()) => {
                    if let Some(session) = self.conversations.get_mut(&conversation_id) {
                        session.cancel_locally();
                    }
                    let _ = reply.send(Ok(()));
                    self.flush(conversation_id).await;
                }
                Err(err) => {
                    let _ = reply.send(Err(SessionCommandError::Rest(err.to_string())));
                }
            },
            RestCompletion::UnreadCounts(result) => match result {
                Ok(counts) => self.apply_polled_unread(counts),
                Err(err) => self.on_background_failure("unread poll", err).await,
            },
            RestCompletion::Conversations { result, reply } => {
                let result = result
                    .map(|all| {
                        all.into_iter()
                            .filter(|conversation| !self.closed.is_closed(conversation.id))
                            .collect()
                    })
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            RestCompletion::FindOrCreate { result, reply } => match result {
                Ok(conversation) => {
                    let reopened = self.reopen(conversation.id).await;
                    let _ = reply.send(reopened.map(|_| conversation));
                }
                Err(err) => {
                    let _ = reply.send(Err(err.into()));
                }
            },
            RestCompletion::ResetNotifications { result, reply } => {
                if result.is_ok() {
                    self.apply_polled_unread(Vec::new());
                }
                let _ = reply.send(result.map_err(EngineError::from));
            }
        }
    }

    async fn on_background_failure(&mut self, what: &str, err: RestError) {
        if err.is_unauthorized() {
            warn!("{what} rejected the credential");
            self.sign_out(SignOutReason::Credential(CredentialError::Revoked))
                .await;
        } else {
            debug!("{what} failed: {err}");
        }
    }

    async fn open_loaded(&mut self, conversation: Conversation) -> Result<(), EngineError> {
        let conversation_id = conversation.id;
        if self.conversations.contains_key(&conversation_id) {
            return Ok(());
        }
        self.reopen(conversation_id).await?;

        let endpoint = conversation_endpoint(&self.config.websocket_base, conversation_id)
            .map_err(EngineError::Endpoint)?;
        let mut session = ConversationSession::new(
            conversation.clone(),
            self.config.local_user,
            endpoint,
            self.credential.clone(),
            Arc::clone(&self.connector),
            self.config.session,
            self.tx.clone(),
        );

        let now = Utc::now();
        match load_json::<SessionSnapshot>(self.store.as_ref(), &snapshot_key(conversation_id))
            .await
        {
            Ok(Some(snapshot)) => session.restore_snapshot(snapshot, now),
            Ok(None) => {}
            Err(err) => warn!(conversation_id = conversation_id.0, "discarding stored session: {err:#}"),
        }
        let invited = self.notifications.unread().has_invite(conversation_id);
        if invited {
            session.restore_invite(conversation);
        }

        if let Err(err) = session.open(now) {
            self.sign_out(SignOutReason::Credential(err.clone())).await;
            return Err(err.into());
        }
        if let Some(cursor) = session.begin_history_load() {
            self.fetch_history(conversation_id, cursor, None);
        }
        self.conversations.insert(conversation_id, session);
        info!(conversation_id = conversation_id.0, "conversation opened");
        self.emit(ClientEvent::ConversationOpened { conversation_id });
        if invited && self.notifications.unread_mut().clear_invite(conversation_id) {
            self.emit(ClientEvent::InviteCleared { conversation_id });
        }
        self.flush(conversation_id).await;
        Ok(())
    }

    fn close_conversation(&mut self, conversation_id: ConversationId) -> bool {
        let Some(mut session) = self.conversations.remove(&conversation_id) else {
            return false;
        };
        session.close("conversation closed");
        self.emit(ClientEvent::ConversationClosed { conversation_id });
        true
    }

    /// Hides a conversation from the list and mutes its notifications. An open
    /// session keeps running; a partner message brings the conversation back.
    async fn dismiss(&mut self, conversation_id: ConversationId) -> Result<bool, EngineError> {
        self.set_unread(conversation_id, 0);
        self.closed
            .close(conversation_id)
            .await
            .map_err(EngineError::Storage)
    }

    async fn reopen(&mut self, conversation_id: ConversationId) -> Result<bool, EngineError> {
        let reopened = self
            .closed
            .reopen(conversation_id)
            .await
            .map_err(EngineError::Storage)?;
        if reopened {
            self.emit(ClientEvent::ConversationReopened { conversation_id });
        }
        Ok(reopened)
    }

    fn fetch_history(
        &self,
        conversation_id: ConversationId,
        cursor: Option<String>,
        reply: Option<Reply<Result<usize, EngineError>>>,
    ) {
        let api = Arc::clone(&self.api);
        self.spawn_rest(
            async move { api.fetch_history(conversation_id, cursor.as_deref()).await },
            move |result| RestCompletion::History {
                conversation_id,
                result,
                reply,
            },
        );
    }

    fn poll_unread(&self) {
        let api = Arc::clone(&self.api);
        self.spawn_rest(
            async move { api.unread_counts().await },
            RestCompletion::UnreadCounts,
        );
    }

    fn set_unread(&mut self, conversation_id: ConversationId, count: i64) {
        let before = self.notifications.unread().get(conversation_id);
        self.notifications.unread_mut().set(conversation_id, count);
        let after = self.notifications.unread().get(conversation_id);
        if before != after {
            self.emit(ClientEvent::UnreadChanged {
                conversation_id,
                count: after,
            });
        }
    }

    fn apply_polled_unread(&mut self, counts: Vec<(ConversationId, i64)>) {
        let before: HashMap<ConversationId, i64> = self.notifications.unread().iter().collect();
        self.notifications
            .unread_mut()
            .replace_all(counts, &self.closed);
        let after: HashMap<ConversationId, i64> = self.notifications.unread().iter().collect();

        let mut changed: Vec<(ConversationId, i64)> = after
            .iter()
            .filter(|(id, count)| before.get(id) != Some(count))
            .map(|(id, count)| (*id, *count))
            .collect();
        changed.extend(
            before
                .keys()
                .filter(|id| !after.contains_key(id))
                .map(|id| (*id, 0)),
        );
        changed.sort();
        for (conversation_id, count) in changed {
            self.emit(ClientEvent::UnreadChanged {
                conversation_id,
                count,
            });
        }
    }

    /// Carries out whatever a conversation queued while handling the last event.
    async fn flush(&mut self, conversation_id: ConversationId) {
        let Some(session) = self.conversations.get_mut(&conversation_id) else {
            return;
        };
        let updates = session.take_updates();
        let mut sign_out = None;

        for update in updates {
            match update {
                ConversationUpdate::Connected { reconnected } => {
                    self.emit(ClientEvent::Connected {
                        key: SocketKey::Conversation(conversation_id),
                        reconnected,
                    });
                    if !self.notifications.unread().has_invite(conversation_id) {
                        self.set_unread(conversation_id, 0);
                    }
                }
                ConversationUpdate::ConnectionLost { notify } => {
                    if notify {
                        self.emit(ClientEvent::ConnectionLost {
                            key: SocketKey::Conversation(conversation_id),
                        });
                    }
                }
                ConversationUpdate::Message {
                    message,
                    outcome,
                    from_partner,
                } => {
                    if from_partner && self.closed.is_closed(conversation_id) {
                        if let Err(err) = self.reopen(conversation_id).await {
                            warn!(conversation_id = conversation_id.0, "failed to reopen: {err}");
                        }
                    }
                    self.emit(ClientEvent::Message {
                        conversation_id,
                        message,
                        outcome,
                    });
                }
                ConversationUpdate::Rejected { message, reason } => {
                    self.emit(ClientEvent::MessageRejected {
                        conversation_id,
                        restored_content: message.map(|m| m.content),
                        reason,
                    });
                }
                ConversationUpdate::MessagesRead { user_id } => {
                    self.emit(ClientEvent::MessagesRead {
                        conversation_id,
                        user_id,
                    });
                }
                ConversationUpdate::Session(event) => {
                    self.emit(ClientEvent::Session {
                        conversation_id,
                        event,
                    });
                }
                ConversationUpdate::PersistSnapshot(snapshot) => {
                    if let Err(err) =
                        save_json(self.store.as_ref(), &snapshot_key(conversation_id), &snapshot)
                            .await
                    {
                        warn!(conversation_id = conversation_id.0, "failed to persist session: {err:#}");
                    }
                }
                ConversationUpdate::ClearSnapshot => {
                    if let Err(err) = self.store.remove(&snapshot_key(conversation_id)).await {
                        warn!(conversation_id = conversation_id.0, "failed to clear session: {err:#}");
                    }
                }
                ConversationUpdate::ResyncDue => {
                    let api = Arc::clone(&self.api);
                    self.spawn_rest(
                        async move { api.active_swapanza(conversation_id).await },
                        move |result| RestCompletion::ActiveSession {
                            conversation_id,
                            result,
                        },
                    );
                }
                ConversationUpdate::ServerError(message) => self.emit(ClientEvent::Error(message)),
                ConversationUpdate::Logout => {
                    sign_out.get_or_insert(SignOutReason::ServerLogout);
                }
                ConversationUpdate::CredentialFatal(err) => {
                    sign_out.get_or_insert(SignOutReason::Credential(err));
                }
            }
        }

        if let Some(reason) = sign_out {
            self.sign_out(reason).await;
        }
    }

    /// Closes every socket and timer. The engine loop exits afterwards.
    fn teardown(&mut self) {
        for (_, mut session) in self.conversations.drain() {
            session.close("client shutting down");
        }
        self.notifications.close();
        self.unread_poll.cancel();
        self.credential_check.cancel();
        self.running = false;
    }

    /// Credential-fatal path. Never retried.
    async fn sign_out(&mut self, reason: SignOutReason) {
        if !self.running {
            return;
        }
        error!(?reason, "signing out");
        self.teardown();
        self.notifications.unread_mut().clear();
        if let Err(err) = purge_credential(self.store.as_ref()).await {
            warn!("failed to purge stored credential: {err:#}");
        }
        self.emit(ClientEvent::SignedOut { reason });
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
