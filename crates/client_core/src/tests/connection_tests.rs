use super::*;
use crate::transport::testing::{ChannelConnector, ServerSide};
use jsonwebtoken::{encode, EncodingKey, Header};
use shared::protocol::ClientFrame;
use tokio::sync::mpsc::UnboundedReceiver;

fn token(exp_offset_secs: i64) -> Credential {
    #[derive(serde::Serialize)]
    struct Claims {
        sub: String,
        exp: i64,
    }
    let claims = Claims {
        sub: "1".to_string(),
        exp: Utc::now().timestamp() + exp_offset_secs,
    };
    Credential::new(
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .expect("encode token"),
    )
}

struct Harness {
    manager: ConnectionManager<ConnectionSignal>,
    signals: UnboundedReceiver<ConnectionSignal>,
    connector: Arc<ChannelConnector>,
    accepted: UnboundedReceiver<ServerSide>,
}

impl Harness {
    fn new(credential: Credential) -> Self {
        let (connector, accepted) = ChannelConnector::new();
        let (tx, signals) = mpsc::unbounded_channel();
        let endpoint = Url::parse("ws://chat.test/ws/chat/7/").expect("url");
        let manager = ConnectionManager::new(
            SocketKey::Conversation(ConversationId(7)),
            endpoint,
            credential,
            connector.clone(),
            ReconnectPolicy::default(),
            tx,
        );
        Self {
            manager,
            signals,
            connector,
            accepted,
        }
    }

    async fn next(&mut self) -> ConnectionOutcome {
        let signal = self.signals.recv().await.expect("signal");
        self.manager.handle_signal(signal, Utc::now())
    }

    async fn connect(&mut self) -> ServerSide {
        self.manager.open(Utc::now()).expect("open");
        let server = self.accepted.recv().await.expect("accepted");
        assert_eq!(
            self.next().await,
            ConnectionOutcome::Connected { reconnected: false }
        );
        server
    }
}

#[tokio::test]
async fn connects_with_token_in_query() {
    let mut harness = Harness::new(token(3600));
    assert_eq!(harness.manager.state().phase, ConnectionPhase::Disconnected);

    let server = harness.connect().await;
    assert!(harness.manager.is_connected());
    assert_eq!(server.url.path(), "/ws/chat/7/");
    assert!(server
        .url
        .query_pairs()
        .any(|(key, value)| key == "token" && !value.is_empty()));
}

#[tokio::test]
async fn expired_credential_never_touches_the_network() {
    let mut harness = Harness::new(token(-10));
    assert_eq!(
        harness.manager.open(Utc::now()),
        Err(CredentialError::Expired)
    );
    tokio::task::yield_now().await;
    assert_eq!(harness.connector.attempt_count(), 0);
}

#[tokio::test]
async fn send_is_refused_until_connected() {
    let mut harness = Harness::new(token(3600));
    assert!(!harness.manager.send(&ClientFrame::Ping));

    let mut server = harness.connect().await;
    assert!(harness.manager.send(&ClientFrame::Ping));
    assert_eq!(
        server.next_from_client().await,
        Some(WireMessage::Text(r#"{"type":"ping"}"#.to_string()))
    );
}

#[tokio::test]
async fn text_frames_are_forwarded_in_order() {
    let mut harness = Harness::new(token(3600));
    let server = harness.connect().await;
    server.push_text("one");
    server.push_text("two");
    assert_eq!(harness.next().await, ConnectionOutcome::Frame("one".into()));
    assert_eq!(harness.next().await, ConnectionOutcome::Frame("two".into()));
}

#[tokio::test(start_paused = true)]
async fn abnormal_closures_back_off_and_notify_once() {
    let mut harness = Harness::new(token(3600));
    let server = harness.connect().await;

    server.fail();
    assert_eq!(
        harness.next().await,
        ConnectionOutcome::Closed {
            code: CLOSE_ABNORMAL,
            reconnect_in: Some(Duration::from_millis(1_000)),
            first_failure: true,
        }
    );
    assert_eq!(harness.manager.state().phase, ConnectionPhase::Erred);
    assert_eq!(harness.manager.state().retry_attempt, 1);

    harness.connector.set_refuse(true);
    assert_eq!(
        harness.next().await,
        ConnectionOutcome::Reconnecting { attempt: 1 }
    );
    assert_eq!(
        harness.next().await,
        ConnectionOutcome::Closed {
            code: CLOSE_ABNORMAL,
            reconnect_in: Some(Duration::from_millis(2_000)),
            first_failure: false,
        }
    );

    harness.connector.set_refuse(false);
    assert_eq!(
        harness.next().await,
        ConnectionOutcome::Reconnecting { attempt: 2 }
    );
    let _server = harness.accepted.recv().await.expect("accepted");
    assert_eq!(
        harness.next().await,
        ConnectionOutcome::Connected { reconnected: true }
    );
    assert_eq!(harness.manager.state().retry_attempt, 0);
    assert_eq!(harness.connector.attempt_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn local_close_uses_normal_code_and_never_reconnects() {
    let mut harness = Harness::new(token(3600));
    let mut server = harness.connect().await;

    harness.manager.close("conversation closed");
    assert_eq!(
        server.next_from_client().await,
        Some(WireMessage::Close {
            code: CLOSE_NORMAL,
            reason: "conversation closed".to_string(),
        })
    );
    assert_eq!(harness.next().await, ConnectionOutcome::Ignored);
    assert!(!harness.manager.send(&ClientFrame::Ping));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(harness.signals.try_recv().is_err());
    assert_eq!(harness.connector.attempt_count(), 1);
}

#[tokio::test]
async fn server_close_codes_are_classified() {
    let mut harness = Harness::new(token(3600));
    let server = harness.connect().await;
    server.push_close(CLOSE_NORMAL);
    assert_eq!(
        harness.next().await,
        ConnectionOutcome::Closed {
            code: CLOSE_NORMAL,
            reconnect_in: None,
            first_failure: false,
        }
    );

    let server = harness.connect().await;
    server.push_close(CLOSE_SERVER_LOGOUT);
    assert_eq!(harness.next().await, ConnectionOutcome::ServerLogout);
}

#[tokio::test]
async fn keepalive_close_reconnects_without_a_notice() {
    let mut harness = Harness::new(token(3600));
    let mut server = harness.connect().await;

    harness
        .manager
        .force_reconnect(CLOSE_KEEPALIVE_TIMEOUT, "pong timeout");
    assert!(matches!(
        server.next_from_client().await,
        Some(WireMessage::Close {
            code: CLOSE_KEEPALIVE_TIMEOUT,
            ..
        })
    ));
    assert_eq!(
        harness.next().await,
        ConnectionOutcome::Closed {
            code: CLOSE_KEEPALIVE_TIMEOUT,
            reconnect_in: Some(Duration::from_millis(1_000)),
            first_failure: false,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn failed_retry_after_keepalive_close_stays_silent() {
    let mut harness = Harness::new(token(3600));
    let _server = harness.connect().await;

    harness
        .manager
        .force_reconnect(CLOSE_KEEPALIVE_TIMEOUT, "pong timeout");
    assert!(matches!(
        harness.next().await,
        ConnectionOutcome::Closed {
            code: CLOSE_KEEPALIVE_TIMEOUT,
            first_failure: false,
            ..
        }
    ));

    harness.connector.set_refuse(true);
    assert_eq!(
        harness.next().await,
        ConnectionOutcome::Reconnecting { attempt: 1 }
    );
    assert_eq!(
        harness.next().await,
        ConnectionOutcome::Closed {
            code: CLOSE_ABNORMAL,
            reconnect_in: Some(Duration::from_millis(2_000)),
            first_failure: false,
        }
    );
}

#[tokio::test]
async fn reconnect_is_fatal_once_the_credential_expires() {
    let mut harness = Harness::new(token(3600));
    let server = harness.connect().await;
    server.fail();

    let signal = harness.signals.recv().await.expect("signal");
    let later = Utc::now() + chrono::Duration::hours(2);
    assert_eq!(
        harness.manager.handle_signal(signal, later),
        ConnectionOutcome::CredentialFatal(CredentialError::Expired)
    );
}

#[test]
fn endpoints_follow_the_server_scheme() {
    let base = websocket_base("https://chat.example.com").expect("base");
    assert_eq!(
        conversation_endpoint(&base, ConversationId(12))
            .expect("url")
            .as_str(),
        "wss://chat.example.com/ws/chat/12/"
    );
    let base = websocket_base("http://127.0.0.1:8000").expect("base");
    assert_eq!(
        notifications_endpoint(&base).expect("url").as_str(),
        "ws://127.0.0.1:8000/ws/notifications/"
    );
    assert!(websocket_base("ftp://nope").is_err());
}
