//! Swapanza session lifecycle for one conversation.
//!
//! The machine never touches sockets, timers, or storage. Every transition
//! returns the [`SessionEffect`]s the engine has to carry out, which keeps the
//! timing rules testable without a runtime.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Conversation, Participant, UserId},
    protocol::{ActivatePayload, ActiveSessionSnapshot},
};
use tracing::{debug, info, warn};

use crate::{error::SessionCommandError, quota::QuotaRules};

pub const DEFAULT_EXPIRING_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Idle,
    Requested,
    Confirming,
    Active,
    /// Final stretch of an active session.
    Expiring,
}

impl SessionPhase {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::Expiring)
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Self::Requested | Self::Confirming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub requested_by: Option<UserId>,
    pub requested_by_username: Option<String>,
    /// Minutes.
    pub requested_duration: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<i64>,
    pub remaining_messages: i64,
    pub confirmed_by: BTreeSet<UserId>,
    /// When the first confirmation arrived.
    pub confirming_since: Option<DateTime<Utc>>,
    pub partner: Option<Participant>,
}

impl SessionState {
    fn idle(message_limit: i64) -> Self {
        Self {
            phase: SessionPhase::Idle,
            requested_by: None,
            requested_by_username: None,
            requested_duration: None,
            started_at: None,
            ends_at: None,
            remaining_seconds: None,
            remaining_messages: message_limit,
            confirmed_by: BTreeSet::new(),
            confirming_since: None,
            partner: None,
        }
    }
}

/// What survives a reload. `duration_seconds` is the countdown length at the
/// moment the activation was received locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub received_at_client: DateTime<Utc>,
    pub remaining_messages: i64,
    #[serde(default)]
    pub partner: Option<Participant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionEndReason {
    Expired,
    Cancelled,
    CountdownElapsed,
    InviteTimedOut,
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Requested {
        requested_by: UserId,
        requested_by_username: Option<String>,
        duration: u32,
        needs_confirmation: bool,
    },
    Confirmed {
        user_id: UserId,
        all_confirmed: bool,
    },
    Activated {
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        remaining_seconds: i64,
        remaining_messages: i64,
        partner: Option<Participant>,
    },
    Countdown {
        remaining_seconds: i64,
        phase: SessionPhase,
    },
    QuotaUpdated {
        remaining_messages: i64,
    },
    Ended {
        reason: SessionEndReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    ArmInviteTimeout,
    CancelInviteTimeout,
    StartCountdown { seconds: i64 },
    StopCountdown,
    PersistSnapshot(SessionSnapshot),
    ClearSnapshot,
    Emit(SessionEvent),
    /// Credential must be invalidated and the whole client signed out.
    Escalate,
}

pub struct SessionStateMachine {
    local_user: UserId,
    rules: QuotaRules,
    expiring_window: i64,
    invite_window: i64,
    state: SessionState,
    snapshot: Option<SessionSnapshot>,
    fallback_partner: Option<Participant>,
    last_ended_at: Option<DateTime<Utc>>,
}

impl SessionStateMachine {
    pub fn new(
        local_user: UserId,
        rules: QuotaRules,
        expiring_window_secs: i64,
        invite_window_secs: i64,
    ) -> Self {
        Self {
            local_user,
            rules,
            expiring_window: expiring_window_secs,
            invite_window: invite_window_secs,
            state: SessionState::idle(rules.message_limit),
            snapshot: None,
            fallback_partner: None,
            last_ended_at: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    /// Remaining budget while a session is running, `None` otherwise.
    pub fn session_remaining(&self) -> Option<i64> {
        self.state
            .phase
            .is_active()
            .then_some(self.state.remaining_messages)
    }

    pub fn countdown_running(&self) -> bool {
        self.state.phase.is_active() && self.state.remaining_seconds.is_some()
    }

    /// Partner shown when the activation frame does not name one.
    pub fn set_partner_hint(&mut self, partner: Option<Participant>) {
        self.fallback_partner = partner;
    }

    pub fn can_request(&self) -> Result<(), SessionCommandError> {
        match self.state.phase {
            SessionPhase::Idle => Ok(()),
            SessionPhase::Requested | SessionPhase::Confirming => {
                Err(SessionCommandError::AlreadyPending)
            }
            SessionPhase::Active | SessionPhase::Expiring => Err(SessionCommandError::AlreadyActive),
        }
    }

    pub fn on_request(
        &mut self,
        requested_by: UserId,
        requested_by_username: Option<String>,
        duration: u32,
    ) -> Vec<SessionEffect> {
        if self.state.phase.is_active() {
            debug!(requested_by = requested_by.0, "ignoring request during active session");
            return Vec::new();
        }
        if self.state.phase.is_pending()
            && self.state.requested_by == Some(requested_by)
            && self.state.requested_duration == Some(duration)
        {
            return Vec::new();
        }

        self.state.phase = SessionPhase::Requested;
        self.state.requested_by = Some(requested_by);
        self.state.requested_by_username = requested_by_username.clone();
        self.state.requested_duration = Some(duration);
        self.state.confirmed_by.clear();
        self.state.confirming_since = None;

        vec![
            SessionEffect::ArmInviteTimeout,
            SessionEffect::Emit(SessionEvent::Requested {
                requested_by,
                requested_by_username,
                duration,
                needs_confirmation: requested_by != self.local_user,
            }),
        ]
    }

    /// Re-creates a pending invite from the conversation record, used when the
    /// conversation is opened from an invite notification.
    pub fn restore_invite(&mut self, conversation: &Conversation) -> Vec<SessionEffect> {
        if self.state.phase != SessionPhase::Idle {
            return Vec::new();
        }
        let (Some(requested_by), Some(duration)) = (
            conversation.swapanza_requested_by,
            conversation.swapanza_duration,
        ) else {
            return Vec::new();
        };
        let username = conversation
            .participant(requested_by)
            .map(|p| p.username.clone());
        self.on_request(requested_by, username, duration)
    }

    pub fn on_confirm(
        &mut self,
        user_id: UserId,
        all_confirmed: bool,
        now: DateTime<Utc>,
    ) -> Vec<SessionEffect> {
        if !self.state.phase.is_pending() {
            debug!(user_id = user_id.0, phase = ?self.state.phase, "ignoring stale confirm");
            return Vec::new();
        }
        self.state.confirmed_by.insert(user_id);
        if all_confirmed {
            self.state.confirmed_by.insert(self.local_user);
            if let Some(requester) = self.state.requested_by {
                self.state.confirmed_by.insert(requester);
            }
        }
        self.state.phase = SessionPhase::Confirming;
        self.state.confirming_since.get_or_insert(now);
        vec![
            SessionEffect::CancelInviteTimeout,
            SessionEffect::Emit(SessionEvent::Confirmed {
                user_id,
                all_confirmed,
            }),
        ]
    }

    pub fn on_activate(
        &mut self,
        payload: &ActivatePayload,
        received_at: DateTime<Utc>,
    ) -> Vec<SessionEffect> {
        let duration = (payload.ends_at - payload.started_at).num_seconds();
        if duration <= 0 {
            warn!(
                started_at = %payload.started_at,
                ends_at = %payload.ends_at,
                "ignoring activation with non-positive duration"
            );
            return Vec::new();
        }
        if self
            .last_ended_at
            .is_some_and(|ended| payload.ends_at <= ended)
        {
            debug!(ends_at = %payload.ends_at, "ignoring activation for a session that already ended");
            return Vec::new();
        }
        if self.state.phase.is_active() && self.state.ends_at == Some(payload.ends_at) {
            return self.refresh_running(payload);
        }

        let elapsed = payload
            .server_time
            .map(|now| (now - payload.started_at).num_seconds().max(0))
            .unwrap_or(0);
        let remaining_seconds = (duration - elapsed).max(0);
        if remaining_seconds == 0 {
            debug!(ends_at = %payload.ends_at, "activation already elapsed on the server");
            return self.end_if_live(SessionEndReason::Expired);
        }

        let remaining_messages = payload
            .remaining_messages
            .map_or(self.rules.message_limit, |r| r.max(0));
        let partner = payload.partner().or_else(|| self.fallback_partner.clone());

        self.state = SessionState {
            phase: self.phase_for(remaining_seconds),
            requested_by: None,
            requested_by_username: None,
            requested_duration: self.state.requested_duration,
            started_at: Some(payload.started_at),
            ends_at: Some(payload.ends_at),
            remaining_seconds: Some(remaining_seconds),
            remaining_messages,
            confirmed_by: BTreeSet::new(),
            confirming_since: None,
            partner: partner.clone(),
        };
        let snapshot = SessionSnapshot {
            started_at: payload.started_at,
            ends_at: payload.ends_at,
            duration_seconds: remaining_seconds,
            received_at_client: received_at,
            remaining_messages,
            partner: partner.clone(),
        };
        self.snapshot = Some(snapshot.clone());
        info!(
            remaining_seconds,
            remaining_messages, "swapanza session activated"
        );

        vec![
            SessionEffect::CancelInviteTimeout,
            SessionEffect::StartCountdown {
                seconds: remaining_seconds,
            },
            SessionEffect::PersistSnapshot(snapshot),
            SessionEffect::Emit(SessionEvent::Activated {
                started_at: payload.started_at,
                ends_at: payload.ends_at,
                remaining_seconds,
                remaining_messages,
                partner,
            }),
        ]
    }

    fn refresh_running(&mut self, payload: &ActivatePayload) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if let Some(partner) = payload.partner() {
            self.state.partner = Some(partner);
        }
        if let Some(server) = payload.remaining_messages {
            let server = server.max(0);
            if server != self.state.remaining_messages {
                self.state.remaining_messages = server;
                effects.extend(self.quota_changed());
            }
        }
        effects
    }

    /// One countdown second elapsed.
    pub fn on_tick(&mut self) -> Vec<SessionEffect> {
        if !self.state.phase.is_active() {
            return Vec::new();
        }
        let Some(remaining) = self.state.remaining_seconds else {
            return Vec::new();
        };
        let remaining = (remaining - 1).max(0);
        if remaining == 0 {
            return self.reset(SessionEndReason::CountdownElapsed);
        }
        self.state.remaining_seconds = Some(remaining);
        self.state.phase = self.phase_for(remaining);
        vec![SessionEffect::Emit(SessionEvent::Countdown {
            remaining_seconds: remaining,
            phase: self.state.phase,
        })]
    }

    pub fn on_expire(&mut self) -> Vec<SessionEffect> {
        self.end_if_live(SessionEndReason::Expired)
    }

    pub fn on_cancel(&mut self) -> Vec<SessionEffect> {
        self.end_if_live(SessionEndReason::Cancelled)
    }

    pub fn on_invite_timeout(&mut self) -> Vec<SessionEffect> {
        if self.state.phase != SessionPhase::Requested || !self.state.confirmed_by.is_empty() {
            return Vec::new();
        }
        self.reset(SessionEndReason::InviteTimedOut)
    }

    pub fn on_logout(&mut self) -> Vec<SessionEffect> {
        let mut effects = self.reset(SessionEndReason::LoggedOut);
        effects.push(SessionEffect::Escalate);
        effects
    }

    /// Optimistic decrement after a send left the client.
    pub fn record_local_send(&mut self) -> Vec<SessionEffect> {
        if !self.state.phase.is_active() || self.state.remaining_messages <= 0 {
            return Vec::new();
        }
        self.state.remaining_messages -= 1;
        self.quota_changed()
    }

    /// Gives back the budget of a send the server rejected.
    pub fn refund_local_send(&mut self) -> Vec<SessionEffect> {
        if !self.state.phase.is_active() || self.state.remaining_messages >= self.rules.message_limit
        {
            return Vec::new();
        }
        self.state.remaining_messages += 1;
        self.quota_changed()
    }

    /// Applies a server-reported remainder for one of our own messages.
    pub fn reconcile_remaining(
        &mut self,
        confirmed_sent: usize,
        server_remaining: i64,
    ) -> Vec<SessionEffect> {
        if !self.state.phase.is_active() {
            return Vec::new();
        }
        let reconciled = self
            .rules
            .reconcile_remaining(confirmed_sent, server_remaining);
        if reconciled == self.state.remaining_messages {
            return Vec::new();
        }
        self.state.remaining_messages = reconciled;
        self.quota_changed()
    }

    /// Resumes a session persisted before a reload.
    pub fn restore_snapshot(
        &mut self,
        snapshot: SessionSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<SessionEffect> {
        if self.state.phase != SessionPhase::Idle {
            return Vec::new();
        }
        let elapsed = (now - snapshot.received_at_client).num_seconds().max(0);
        let remaining_seconds = snapshot.duration_seconds - elapsed;
        let stale = self
            .last_ended_at
            .is_some_and(|ended| snapshot.ends_at <= ended);
        if remaining_seconds <= 0 || stale {
            return vec![SessionEffect::ClearSnapshot];
        }

        self.state = SessionState {
            phase: self.phase_for(remaining_seconds),
            started_at: Some(snapshot.started_at),
            ends_at: Some(snapshot.ends_at),
            remaining_seconds: Some(remaining_seconds),
            remaining_messages: snapshot.remaining_messages,
            partner: snapshot
                .partner
                .clone()
                .or_else(|| self.fallback_partner.clone()),
            ..SessionState::idle(self.rules.message_limit)
        };
        let event = SessionEvent::Activated {
            started_at: snapshot.started_at,
            ends_at: snapshot.ends_at,
            remaining_seconds,
            remaining_messages: snapshot.remaining_messages,
            partner: self.state.partner.clone(),
        };
        self.snapshot = Some(snapshot);
        vec![
            SessionEffect::StartCountdown {
                seconds: remaining_seconds,
            },
            SessionEffect::Emit(event),
        ]
    }

    /// Aligns with the server's view of the active session. A running countdown is
    /// left alone; only the message budget is reconciled. A confirmed request the
    /// server no longer knows about is dropped once the invite window has passed.
    pub fn resync(
        &mut self,
        snapshot: &ActiveSessionSnapshot,
        now: DateTime<Utc>,
        confirmed_sent: usize,
    ) -> Vec<SessionEffect> {
        match snapshot.as_activation() {
            Some(activation) => {
                if self.countdown_running() && self.state.ends_at == Some(activation.ends_at) {
                    return match activation.remaining_messages {
                        Some(server) => self.reconcile_remaining(confirmed_sent, server),
                        None => Vec::new(),
                    };
                }
                self.on_activate(&activation, now)
            }
            None if self.state.phase.is_active() => {
                info!("server reports no active session, ending local countdown");
                self.reset(SessionEndReason::Expired)
            }
            None if self.confirmation_stalled(now) => {
                info!("confirmed request never activated, dropping it");
                self.reset(SessionEndReason::InviteTimedOut)
            }
            None => Vec::new(),
        }
    }

    fn confirmation_stalled(&self, now: DateTime<Utc>) -> bool {
        self.state.phase == SessionPhase::Confirming
            && self
                .state
                .confirming_since
                .is_some_and(|since| (now - since).num_seconds() >= self.invite_window)
    }

    fn end_if_live(&mut self, reason: SessionEndReason) -> Vec<SessionEffect> {
        if self.state.phase == SessionPhase::Idle {
            return Vec::new();
        }
        self.reset(reason)
    }

    /// Back to Idle. Safe to call repeatedly; the first caller wins the event.
    pub fn reset(&mut self, reason: SessionEndReason) -> Vec<SessionEffect> {
        let was_idle = self.state.phase == SessionPhase::Idle;
        if self.state.phase.is_active() {
            self.last_ended_at = self.state.ends_at.max(self.last_ended_at);
        }
        self.state = SessionState::idle(self.rules.message_limit);
        self.snapshot = None;

        let mut effects = vec![
            SessionEffect::StopCountdown,
            SessionEffect::CancelInviteTimeout,
            SessionEffect::ClearSnapshot,
        ];
        if !was_idle {
            info!(?reason, "swapanza session ended");
            effects.push(SessionEffect::Emit(SessionEvent::Ended { reason }));
        }
        effects
    }

    fn quota_changed(&mut self) -> Vec<SessionEffect> {
        let remaining_messages = self.state.remaining_messages;
        let mut effects = Vec::with_capacity(2);
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.remaining_messages = remaining_messages;
            effects.push(SessionEffect::PersistSnapshot(snapshot.clone()));
        }
        effects.push(SessionEffect::Emit(SessionEvent::QuotaUpdated {
            remaining_messages,
        }));
        effects
    }

    fn phase_for(&self, remaining_seconds: i64) -> SessionPhase {
        if remaining_seconds <= self.expiring_window {
            SessionPhase::Expiring
        } else {
            SessionPhase::Active
        }
    }
}

#[cfg(test)]
#[path = "tests/swapanza_tests.rs"]
mod tests;
