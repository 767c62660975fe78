use super::*;
use crate::transport::{
    testing::{ChannelConnector, ServerSide},
    WireMessage,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use storage::{MemoryStore, PersistentStore};
use tokio::sync::mpsc::{self, UnboundedReceiver};

#[derive(Debug)]
enum TestEvent {
    Signal(ConnectionSignal),
    Keepalive(KeepaliveFired),
}

impl From<ConnectionSignal> for TestEvent {
    fn from(value: ConnectionSignal) -> Self {
        Self::Signal(value)
    }
}

impl From<KeepaliveFired> for TestEvent {
    fn from(value: KeepaliveFired) -> Self {
        Self::Keepalive(value)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Outcome(NotificationOutcome),
    Keepalive(KeepaliveTimer),
}

fn credential() -> Credential {
    #[derive(serde::Serialize)]
    struct Claims {
        sub: String,
        exp: i64,
    }
    let claims = Claims {
        sub: "1".to_string(),
        exp: Utc::now().timestamp() + 3600,
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
    channel: NotificationChannel<TestEvent>,
    events: UnboundedReceiver<TestEvent>,
    accepted: UnboundedReceiver<ServerSide>,
    closed: ClosedSetStore,
}

impl Harness {
    async fn new() -> Self {
        let (connector, accepted) = ChannelConnector::new();
        let (tx, events) = mpsc::unbounded_channel();
        let channel = NotificationChannel::new(
            Url::parse("ws://chat.test/ws/notifications/").expect("url"),
            credential(),
            connector,
            ReconnectPolicy::default(),
            KeepalivePolicy::default(),
            tx,
        );
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let closed = ClosedSetStore::load(store).await.expect("closed set");
        Self {
            channel,
            events,
            accepted,
            closed,
        }
    }

    async fn step(&mut self) -> Step {
        match self.events.recv().await.expect("event") {
            TestEvent::Signal(signal) => {
                Step::Outcome(self.channel.handle_signal(signal, Utc::now(), &self.closed))
            }
            TestEvent::Keepalive(fired) => {
                self.channel.handle_keepalive(fired);
                Step::Keepalive(fired.timer)
            }
        }
    }

    async fn connect(&mut self) -> ServerSide {
        self.channel.open(Utc::now()).expect("open");
        let mut server = self.accepted.recv().await.expect("accepted");
        assert_eq!(
            self.step().await,
            Step::Outcome(NotificationOutcome::Connected { reconnected: false })
        );
        assert_eq!(server.next_from_client().await, Some(ping()));
        server
    }
}

fn ping() -> WireMessage {
    WireMessage::Text(r#"{"type":"ping"}"#.to_string())
}

#[tokio::test(start_paused = true)]
async fn missing_pong_forces_a_keepalive_reconnect() {
    let mut harness = Harness::new().await;
    let mut server = harness.connect().await;

    assert_eq!(harness.step().await, Step::Keepalive(KeepaliveTimer::Ping));
    assert_eq!(server.next_from_client().await, Some(ping()));

    assert_eq!(
        harness.step().await,
        Step::Keepalive(KeepaliveTimer::PongTimeout)
    );
    assert!(matches!(
        server.next_from_client().await,
        Some(WireMessage::Close {
            code: CLOSE_KEEPALIVE_TIMEOUT,
            ..
        })
    ));
    assert_eq!(
        harness.step().await,
        Step::Outcome(NotificationOutcome::ConnectionLost { notify: false })
    );
    assert!(!harness.channel.is_connected());
}

#[tokio::test(start_paused = true)]
async fn pong_cancels_the_timeout() {
    let mut harness = Harness::new().await;
    let mut server = harness.connect().await;

    assert_eq!(harness.step().await, Step::Keepalive(KeepaliveTimer::Ping));
    assert_eq!(server.next_from_client().await, Some(ping()));
    server.push_text(r#"{"type":"pong"}"#);
    assert_eq!(
        harness.step().await,
        Step::Outcome(NotificationOutcome::Nothing)
    );

    assert_eq!(harness.step().await, Step::Keepalive(KeepaliveTimer::Ping));
    assert!(harness.channel.is_connected());
}

#[tokio::test]
async fn frames_update_the_unread_index() {
    let mut harness = Harness::new().await;
    harness.closed.close(ConversationId(5)).await.expect("close");
    let mut server = harness.connect().await;

    server.push_text(r#"{"type":"unread_count","chat_id":4,"count":3}"#);
    assert_eq!(
        harness.step().await,
        Step::Outcome(NotificationOutcome::UnreadChanged {
            conversation_id: ConversationId(4),
            count: 3
        })
    );

    server.push_text(r#"{"type":"unread_count","chat_id":5,"count":9}"#);
    assert_eq!(
        harness.step().await,
        Step::Outcome(NotificationOutcome::Suppressed {
            conversation_id: ConversationId(5)
        })
    );
    assert_eq!(harness.channel.unread().get(ConversationId(5)), 0);

    server.push_text(r#"{"type":"swapanza_invite","chat_id":6,"from":"bob"}"#);
    assert_eq!(
        harness.step().await,
        Step::Outcome(NotificationOutcome::InviteReceived {
            conversation_id: ConversationId(6),
            from: Some("bob".to_string())
        })
    );
    assert_eq!(
        harness.channel.unread().get(ConversationId(6)),
        INVITE_SENTINEL
    );
    assert_eq!(harness.channel.unread().total(), 3);

    server.push_text(r#"{"type":"swapanza_cancel","chat_id":6,"from":"bob"}"#);
    assert_eq!(
        harness.step().await,
        Step::Outcome(NotificationOutcome::InviteCleared {
            conversation_id: ConversationId(6)
        })
    );

    server.push_text("not json");
    assert_eq!(
        harness.step().await,
        Step::Outcome(NotificationOutcome::Nothing)
    );
    server.push_text(r#"{"type":"mystery"}"#);
    assert_eq!(
        harness.step().await,
        Step::Outcome(NotificationOutcome::Nothing)
    );

    server.push_text(r#"{"type":"ping"}"#);
    assert_eq!(
        harness.step().await,
        Step::Outcome(NotificationOutcome::Nothing)
    );
    assert_eq!(
        server.next_from_client().await,
        Some(WireMessage::Text(r#"{"type":"pong"}"#.to_string()))
    );

    server.push_text(r#"{"type":"swapanza.logout","force_redirect":true}"#);
    assert_eq!(
        harness.step().await,
        Step::Outcome(NotificationOutcome::Logout)
    );
}

#[tokio::test]
async fn polled_counts_respect_closed_set_and_invites() {
    let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
    let mut closed = ClosedSetStore::load(store).await.expect("closed set");
    closed.close(ConversationId(2)).await.expect("close");

    let mut index = UnreadIndex::default();
    index.mark_invite(ConversationId(3));
    index.mark_invite(ConversationId(4));
    index.set(ConversationId(9), 4);

    index.replace_all(
        [
            (ConversationId(1), 2),
            (ConversationId(2), 5),
            (ConversationId(4), 1),
            (ConversationId(7), 0),
        ],
        &closed,
    );

    assert_eq!(index.get(ConversationId(1)), 2);
    assert_eq!(index.get(ConversationId(2)), 0);
    assert!(index.has_invite(ConversationId(3)));
    assert_eq!(index.get(ConversationId(4)), 1);
    assert_eq!(index.get(ConversationId(7)), 0);
    assert_eq!(index.get(ConversationId(9)), 0);
    assert_eq!(index.total(), 3);
}
