use super::*;
use chrono::TimeZone;
use shared::domain::ConversationId;

const ME: UserId = UserId(1);
const PARTNER: UserId = UserId(2);

fn machine() -> SessionStateMachine {
    SessionStateMachine::new(ME, QuotaRules::default(), DEFAULT_EXPIRING_WINDOW_SECS, 30)
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

fn activation(start: i64, end: i64) -> ActivatePayload {
    ActivatePayload {
        started_at: at(start),
        ends_at: at(end),
        remaining_messages: Some(2),
        partner_id: Some(PARTNER),
        partner_username: Some("bob".to_string()),
        partner_profile_image: None,
        server_time: None,
    }
}

fn emitted(effects: &[SessionEffect]) -> Vec<&SessionEvent> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            SessionEffect::Emit(event) => Some(event),
            _ => None,
        })
        .collect()
}

fn ended_with(effects: &[SessionEffect]) -> Option<SessionEndReason> {
    emitted(effects).into_iter().find_map(|event| match event {
        SessionEvent::Ended { reason } => Some(*reason),
        _ => None,
    })
}

#[test]
fn full_request_confirm_activate_countdown_scenario() {
    let mut session = machine();

    let effects = session.on_request(PARTNER, Some("bob".to_string()), 5);
    assert_eq!(session.phase(), SessionPhase::Requested);
    assert!(effects.contains(&SessionEffect::ArmInviteTimeout));
    assert!(matches!(
        emitted(&effects)[0],
        SessionEvent::Requested {
            needs_confirmation: true,
            duration: 5,
            ..
        }
    ));

    session.on_confirm(ME, false, at(0));
    assert_eq!(session.phase(), SessionPhase::Confirming);
    session.on_confirm(PARTNER, true, at(0));
    assert_eq!(session.phase(), SessionPhase::Confirming);
    assert_eq!(session.state().confirmed_by.len(), 2);

    let effects = session.on_activate(&activation(0, 300), at(0));
    assert_eq!(session.phase(), SessionPhase::Active);
    assert!(effects.contains(&SessionEffect::StartCountdown { seconds: 300 }));
    assert_eq!(session.state().remaining_seconds, Some(300));
    let started = session.state().started_at.unwrap();
    let ends = session.state().ends_at.unwrap();
    assert!(ends > started);

    for tick in 1..300 {
        session.on_tick();
        assert_eq!(session.state().remaining_seconds, Some(300 - tick));
    }
    assert_eq!(session.phase(), SessionPhase::Expiring);

    let effects = session.on_tick();
    assert_eq!(session.phase(), SessionPhase::Idle);
    assert_eq!(ended_with(&effects), Some(SessionEndReason::CountdownElapsed));
    assert!(effects.contains(&SessionEffect::StopCountdown));
    assert!(effects.contains(&SessionEffect::ClearSnapshot));
}

#[test]
fn own_request_does_not_prompt_and_echo_is_idempotent() {
    let mut session = machine();
    let effects = session.on_request(ME, None, 10);
    assert!(matches!(
        emitted(&effects)[0],
        SessionEvent::Requested {
            needs_confirmation: false,
            ..
        }
    ));
    assert!(session.on_request(ME, Some("alice".to_string()), 10).is_empty());
    assert_eq!(session.can_request(), Err(SessionCommandError::AlreadyPending));
}

#[test]
fn confirmation_alone_never_activates() {
    let mut session = machine();
    session.on_request(PARTNER, None, 5);
    session.on_confirm(ME, true, at(0));
    assert!(!session.phase().is_active());
    assert_eq!(session.session_remaining(), None);
}

#[test]
fn activation_with_non_positive_duration_is_ignored() {
    let mut session = machine();
    assert!(session.on_activate(&activation(10, 10), at(0)).is_empty());
    assert!(session.on_activate(&activation(10, 5), at(0)).is_empty());
    assert_eq!(session.phase(), SessionPhase::Idle);
}

#[test]
fn duration_comes_from_server_timestamps_not_local_clock() {
    let mut session = machine();
    session.on_activate(&activation(0, 120), at(10_000));
    assert_eq!(session.state().remaining_seconds, Some(120));
}

#[test]
fn server_time_shortens_the_countdown() {
    let mut session = machine();
    let mut payload = activation(0, 300);
    payload.server_time = Some(at(100));
    let effects = session.on_activate(&payload, at(100));
    assert!(effects.contains(&SessionEffect::StartCountdown { seconds: 200 }));
}

#[test]
fn expire_and_countdown_converge_to_one_reset() {
    let mut session = machine();
    session.on_activate(&activation(0, 2), at(0));
    session.on_tick();

    let first = session.on_expire();
    assert_eq!(ended_with(&first), Some(SessionEndReason::Expired));
    assert!(session.on_tick().is_empty());
    assert!(session.on_expire().is_empty());
    assert!(session.on_cancel().is_empty());
}

#[test]
fn stale_activate_and_confirm_after_reset_are_ignored() {
    let mut session = machine();
    session.on_activate(&activation(0, 60), at(0));
    session.on_cancel();

    assert!(session.on_activate(&activation(0, 60), at(1)).is_empty());
    assert!(session.on_confirm(PARTNER, true, at(0)).is_empty());
    assert_eq!(session.phase(), SessionPhase::Idle);

    session.on_activate(&activation(100, 160), at(100));
    assert!(session.phase().is_active());
}

#[test]
fn repeated_activation_does_not_restart_the_countdown() {
    let mut session = machine();
    session.on_activate(&activation(0, 60), at(0));
    session.on_tick();

    let mut again = activation(0, 60);
    again.remaining_messages = Some(1);
    let effects = session.on_activate(&again, at(1));
    assert!(!effects
        .iter()
        .any(|e| matches!(e, SessionEffect::StartCountdown { .. })));
    assert_eq!(session.state().remaining_seconds, Some(59));
    assert_eq!(session.state().remaining_messages, 1);
}

#[test]
fn invite_times_out_only_without_confirmation() {
    let mut session = machine();
    session.on_request(PARTNER, None, 5);
    let effects = session.on_invite_timeout();
    assert_eq!(ended_with(&effects), Some(SessionEndReason::InviteTimedOut));

    session.on_request(PARTNER, None, 5);
    session.on_confirm(ME, false, at(0));
    assert!(session.on_invite_timeout().is_empty());
    assert_eq!(session.phase(), SessionPhase::Confirming);
}

#[test]
fn cancel_from_requested_returns_to_idle() {
    let mut session = machine();
    session.on_request(ME, None, 5);
    let effects = session.on_cancel();
    assert_eq!(ended_with(&effects), Some(SessionEndReason::Cancelled));
    assert!(effects.contains(&SessionEffect::CancelInviteTimeout));
    assert_eq!(session.can_request(), Ok(()));
}

#[test]
fn logout_resets_and_escalates_from_any_phase() {
    let mut session = machine();
    assert_eq!(session.on_logout(), {
        let mut expected = session.reset(SessionEndReason::LoggedOut);
        expected.push(SessionEffect::Escalate);
        expected
    });

    session.on_activate(&activation(0, 60), at(0));
    let effects = session.on_logout();
    assert_eq!(effects.last(), Some(&SessionEffect::Escalate));
    assert_eq!(ended_with(&effects), Some(SessionEndReason::LoggedOut));
}

#[test]
fn local_sends_and_server_counts_drive_the_budget() {
    let mut session = machine();
    assert!(session.record_local_send().is_empty());

    session.on_activate(&activation(0, 60), at(0));
    assert_eq!(session.session_remaining(), Some(2));
    session.record_local_send();
    assert_eq!(session.session_remaining(), Some(1));

    // server says 0 but only one confirmed send is on record
    session.reconcile_remaining(1, 0);
    assert_eq!(session.session_remaining(), Some(1));

    session.reconcile_remaining(2, 0);
    assert_eq!(session.session_remaining(), Some(0));
    session.record_local_send();
    assert_eq!(session.session_remaining(), Some(0));
}

#[test]
fn rejected_send_refunds_budget_up_to_the_limit() {
    let mut session = machine();
    assert!(session.refund_local_send().is_empty());

    session.on_activate(&activation(0, 60), at(0));
    assert!(session.refund_local_send().is_empty());
    session.record_local_send();
    session.record_local_send();
    assert_eq!(session.session_remaining(), Some(0));

    let effects = session.refund_local_send();
    assert_eq!(session.session_remaining(), Some(1));
    assert!(emitted(&effects).contains(&&SessionEvent::QuotaUpdated {
        remaining_messages: 1
    }));
}

#[test]
fn budget_changes_are_persisted_with_the_snapshot() {
    let mut session = machine();
    session.on_activate(&activation(0, 60), at(0));
    let effects = session.record_local_send();
    let persisted = effects.iter().find_map(|e| match e {
        SessionEffect::PersistSnapshot(snapshot) => Some(snapshot),
        _ => None,
    });
    assert_eq!(persisted.map(|s| s.remaining_messages), Some(1));
}

#[test]
fn snapshot_restore_accounts_for_time_away() {
    let snapshot = SessionSnapshot {
        started_at: at(0),
        ends_at: at(300),
        duration_seconds: 300,
        received_at_client: at(0),
        remaining_messages: 1,
        partner: None,
    };

    let mut session = machine();
    let effects = session.restore_snapshot(snapshot.clone(), at(100));
    assert!(effects.contains(&SessionEffect::StartCountdown { seconds: 200 }));
    assert_eq!(session.session_remaining(), Some(1));

    let mut late = machine();
    let effects = late.restore_snapshot(snapshot, at(301));
    assert_eq!(effects, vec![SessionEffect::ClearSnapshot]);
    assert_eq!(late.phase(), SessionPhase::Idle);
}

#[test]
fn resync_starts_a_missing_countdown_but_not_a_running_one() {
    let server = ActiveSessionSnapshot {
        active: true,
        chat_id: Some(ConversationId(9)),
        started_at: Some(at(0)),
        ends_at: Some(at(300)),
        remaining_messages: Some(2),
        server_time: Some(at(60)),
        ..Default::default()
    };

    let mut session = machine();
    let effects = session.resync(&server, at(60), 0);
    assert!(effects.contains(&SessionEffect::StartCountdown { seconds: 240 }));

    session.on_tick();
    let effects = session.resync(&server, at(61), 0);
    assert!(!effects
        .iter()
        .any(|e| matches!(e, SessionEffect::StartCountdown { .. })));
    assert_eq!(session.state().remaining_seconds, Some(239));
}

#[test]
fn resync_without_server_time_uses_full_duration() {
    let server = ActiveSessionSnapshot {
        active: true,
        started_at: Some(at(0)),
        ends_at: Some(at(90)),
        ..Default::default()
    };
    let mut session = machine();
    let effects = session.resync(&server, at(30), 0);
    assert!(effects.contains(&SessionEffect::StartCountdown { seconds: 90 }));
}

#[test]
fn inactive_resync_ends_only_a_running_session() {
    let inactive = ActiveSessionSnapshot::default();

    let mut pending = machine();
    pending.on_request(PARTNER, None, 5);
    assert!(pending.resync(&inactive, at(0), 0).is_empty());
    assert_eq!(pending.phase(), SessionPhase::Requested);

    let mut running = machine();
    running.on_activate(&activation(0, 60), at(0));
    let effects = running.resync(&inactive, at(5), 0);
    assert_eq!(ended_with(&effects), Some(SessionEndReason::Expired));
}

#[test]
fn stalled_confirmation_is_dropped_by_inactive_resync() {
    let inactive = ActiveSessionSnapshot::default();
    let mut session = machine();
    session.on_request(PARTNER, None, 5);
    session.on_confirm(ME, false, at(0));
    session.on_confirm(PARTNER, true, at(10));
    assert_eq!(session.state().confirming_since, Some(at(0)));

    assert!(session.resync(&inactive, at(29), 0).is_empty());
    assert_eq!(session.phase(), SessionPhase::Confirming);

    let effects = session.resync(&inactive, at(30), 0);
    assert_eq!(ended_with(&effects), Some(SessionEndReason::InviteTimedOut));
    assert_eq!(session.phase(), SessionPhase::Idle);
    assert_eq!(session.state().confirming_since, None);
}

#[test]
fn partner_falls_back_to_the_other_participant() {
    let mut session = machine();
    session.set_partner_hint(Some(Participant {
        id: PARTNER,
        username: "bob".to_string(),
        profile_image: None,
    }));
    let mut payload = activation(0, 60);
    payload.partner_id = None;
    payload.partner_username = None;
    session.on_activate(&payload, at(0));
    assert_eq!(session.state().partner.as_ref().map(|p| p.id), Some(PARTNER));
}

#[test]
fn invite_is_restored_from_the_conversation_record() {
    let mut conversation = Conversation::new(
        ConversationId(4),
        vec![
            Participant {
                id: ME,
                username: "alice".to_string(),
                profile_image: None,
            },
            Participant {
                id: PARTNER,
                username: "bob".to_string(),
                profile_image: None,
            },
        ],
    )
    .unwrap();
    conversation.swapanza_requested_by = Some(PARTNER);
    conversation.swapanza_duration = Some(15);

    let mut session = machine();
    let effects = session.restore_invite(&conversation);
    assert_eq!(session.phase(), SessionPhase::Requested);
    assert_eq!(session.state().requested_by_username.as_deref(), Some("bob"));
    assert!(effects.contains(&SessionEffect::ArmInviteTimeout));
}
