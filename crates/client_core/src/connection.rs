use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::domain::ConversationId;
use tokio::{
    sync::mpsc::{self, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    backoff::ReconnectBackoff,
    credential::Credential,
    error::CredentialError,
    timer::TimerSlot,
    transport::{
        drive_socket, redact, OutboundSender, SocketConnector, TransportEvent, WireMessage,
        CLOSE_ABNORMAL, CLOSE_KEEPALIVE_TIMEOUT, CLOSE_NORMAL, CLOSE_SERVER_LOGOUT,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKey {
    Conversation(ConversationId),
    Notifications,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    /// Disconnected after an abnormal closure, waiting for the next attempt.
    Erred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub retry_attempt: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            retry_attempt: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    Transport(TransportEvent),
    ReconnectDue,
}

/// Something happened to one logical connection. `generation` identifies the
/// socket (for transport events) or the reconnect timer that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSignal {
    pub key: SocketKey,
    pub generation: u64,
    pub kind: SignalKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Ignored,
    Connected {
        reconnected: bool,
    },
    Frame(String),
    Closed {
        code: u16,
        reconnect_in: Option<Duration>,
        /// First failure of an outage; the caller shows one notice for it.
        first_failure: bool,
    },
    /// The server ended the session with the logout close code.
    ServerLogout,
    Reconnecting {
        attempt: u32,
    },
    CredentialFatal(CredentialError),
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: crate::backoff::DEFAULT_BASE,
            cap: crate::backoff::DEFAULT_CAP,
        }
    }
}

/// Single logical websocket with capped exponential reconnects.
pub struct ConnectionManager<E> {
    key: SocketKey,
    endpoint: Url,
    credential: Credential,
    connector: Arc<dyn SocketConnector>,
    backoff: ReconnectBackoff,
    state: ConnectionState,
    generation: u64,
    outbound: Option<OutboundSender>,
    socket_task: Option<JoinHandle<()>>,
    reconnect: TimerSlot,
    manual_close: bool,
    outage_notified: bool,
    events: UnboundedSender<E>,
}

impl<E> ConnectionManager<E>
where
    E: From<ConnectionSignal> + Send + 'static,
{
    pub fn new(
        key: SocketKey,
        endpoint: Url,
        credential: Credential,
        connector: Arc<dyn SocketConnector>,
        policy: ReconnectPolicy,
        events: UnboundedSender<E>,
    ) -> Self {
        Self {
            key,
            endpoint,
            credential,
            connector,
            backoff: ReconnectBackoff::new(policy.base, policy.cap),
            state: ConnectionState::default(),
            generation: 0,
            outbound: None,
            socket_task: None,
            reconnect: TimerSlot::new(),
            manual_close: false,
            outage_notified: false,
            events,
        }
    }

    pub fn key(&self) -> SocketKey {
        self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.phase == ConnectionPhase::Connected
    }

    /// Starts connecting. An unusable credential aborts before any network attempt.
    pub fn open(&mut self, now: DateTime<Utc>) -> Result<(), CredentialError> {
        self.credential.ensure_valid(now)?;
        self.manual_close = false;
        if matches!(
            self.state.phase,
            ConnectionPhase::Connecting | ConnectionPhase::Connected
        ) {
            return Ok(());
        }
        self.reconnect.cancel();
        self.backoff.cancel();
        self.start_socket();
        Ok(())
    }

    /// Queues a frame. `false` means it was not handed to an open socket.
    pub fn send<T: Serialize>(&self, frame: &T) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(outbound) = self.outbound.as_ref() else {
            return false;
        };
        match serde_json::to_string(frame) {
            Ok(text) => outbound.send(WireMessage::Text(text)).is_ok(),
            Err(err) => {
                warn!(key = ?self.key, "failed to encode outbound frame: {err}");
                false
            }
        }
    }

    /// Local close with the normal status code. Never reconnects.
    pub fn close(&mut self, reason: &str) {
        self.manual_close = true;
        self.reconnect.cancel();
        self.backoff.cancel();
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(WireMessage::Close {
                code: CLOSE_NORMAL,
                reason: reason.to_string(),
            });
        }
        // The socket task finishes the close handshake on its own; its late
        // events carry a retired generation.
        self.socket_task.take();
        self.generation = self.generation.wrapping_add(1);
        self.state.phase = ConnectionPhase::Disconnected;
        debug!(key = ?self.key, reason, "connection closed locally");
    }

    /// Closes the live socket with `code` and lets the normal reconnect path run.
    pub fn force_reconnect(&mut self, code: u16, reason: &str) {
        match self.outbound.as_ref() {
            Some(outbound) => {
                let _ = outbound.send(WireMessage::Close {
                    code,
                    reason: reason.to_string(),
                });
            }
            None => debug!(key = ?self.key, code, "no live socket to force close"),
        }
    }

    pub fn handle_signal(
        &mut self,
        signal: ConnectionSignal,
        now: DateTime<Utc>,
    ) -> ConnectionOutcome {
        match signal.kind {
            SignalKind::ReconnectDue => self.on_reconnect_due(signal.generation, now),
            SignalKind::Transport(event) => {
                if signal.generation != self.generation || self.manual_close {
                    return ConnectionOutcome::Ignored;
                }
                match event {
                    TransportEvent::Opened => self.on_opened(),
                    TransportEvent::Text(text) => ConnectionOutcome::Frame(text),
                    TransportEvent::Closed { code, reason } => self.on_closed(code, &reason, now),
                }
            }
        }
    }

    fn on_opened(&mut self) -> ConnectionOutcome {
        let reconnected = self.outage_notified || self.backoff.attempt() > 0;
        self.backoff.reset();
        self.outage_notified = false;
        self.state = ConnectionState {
            phase: ConnectionPhase::Connected,
            retry_attempt: 0,
        };
        info!(key = ?self.key, reconnected, "websocket connected");
        ConnectionOutcome::Connected { reconnected }
    }

    fn on_closed(&mut self, code: u16, reason: &str, now: DateTime<Utc>) -> ConnectionOutcome {
        self.outbound = None;
        self.socket_task = None;

        if code == CLOSE_ABNORMAL {
            warn!(key = ?self.key, code, reason, "websocket closed abnormally");
            self.state.phase = ConnectionPhase::Erred;
        } else {
            info!(key = ?self.key, code, reason, "websocket closed");
            self.state.phase = ConnectionPhase::Disconnected;
        }

        if code == CLOSE_SERVER_LOGOUT {
            return ConnectionOutcome::ServerLogout;
        }
        if code == CLOSE_NORMAL {
            return ConnectionOutcome::Closed {
                code,
                reconnect_in: None,
                first_failure: false,
            };
        }
        if let Err(err) = self.credential.ensure_valid(now) {
            return ConnectionOutcome::CredentialFatal(err);
        }

        // A keepalive close counts as the outage without announcing it.
        let first_failure = !self.outage_notified && code != CLOSE_KEEPALIVE_TIMEOUT;
        self.outage_notified = true;
        let reconnect_in = self.schedule_reconnect();
        ConnectionOutcome::Closed {
            code,
            reconnect_in,
            first_failure,
        }
    }

    fn schedule_reconnect(&mut self) -> Option<Duration> {
        let delay = self.backoff.schedule()?;
        self.state.retry_attempt = self.backoff.attempt();
        let key = self.key;
        self.reconnect.arm_once(delay, &self.events, move |generation| {
            E::from(ConnectionSignal {
                key,
                generation,
                kind: SignalKind::ReconnectDue,
            })
        });
        info!(
            key = ?self.key,
            attempt = self.state.retry_attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        Some(delay)
    }

    fn on_reconnect_due(&mut self, generation: u64, now: DateTime<Utc>) -> ConnectionOutcome {
        if !self.reconnect.accept_once(generation) {
            return ConnectionOutcome::Ignored;
        }
        self.backoff.fired();
        if self.manual_close {
            return ConnectionOutcome::Ignored;
        }
        if let Err(err) = self.credential.ensure_valid(now) {
            return ConnectionOutcome::CredentialFatal(err);
        }
        self.start_socket();
        ConnectionOutcome::Reconnecting {
            attempt: self.state.retry_attempt,
        }
    }

    fn start_socket(&mut self) {
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let key = self.key;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound);
        self.state.phase = ConnectionPhase::Connecting;

        let url = self.socket_url();
        debug!(key = ?key, url = %redact(&url), generation, "opening websocket");
        let events = self.events.clone();
        self.socket_task = Some(tokio::spawn(drive_socket(
            Arc::clone(&self.connector),
            url,
            outbound_rx,
            move |event| {
                let _ = events.send(E::from(ConnectionSignal {
                    key,
                    generation,
                    kind: SignalKind::Transport(event),
                }));
            },
        )));
    }

    fn socket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("token", self.credential.token());
        url
    }
}

/// Maps an `http(s)://` server url onto its websocket scheme.
pub fn websocket_base(server_url: &str) -> Result<Url> {
    let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Url::parse(&ws_url).with_context(|| format!("invalid server url: {server_url}"))
}

pub fn conversation_endpoint(base: &Url, conversation_id: ConversationId) -> Result<Url> {
    base.join(&format!("/ws/chat/{}/", conversation_id.0))
        .context("failed to build conversation socket url")
}

pub fn notifications_endpoint(base: &Url) -> Result<Url> {
    base.join("/ws/notifications/")
        .context("failed to build notification socket url")
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
