use std::time::Duration;

use super::*;
use crate::test_support::{message, next_connection, ConnectStep, FakeConnector};
use shared::{
    domain::MessageId,
    error::{ApiError, ErrorCode},
    protocol::MessageDeleted,
};

fn conversation(id: &str) -> ConversationId {
    ConversationId::from(id)
}

fn join(id: &str) -> ClientFrame {
    ClientFrame::Join {
        conversation_id: conversation(id),
    }
}

fn leave(id: &str) -> ClientFrame {
    ClientFrame::Leave {
        conversation_id: conversation(id),
    }
}

fn quick_settings(attempts: u32) -> SessionSettings {
    SessionSettings {
        reconnect_attempts: attempts,
        reconnect_delay: Duration::from_millis(1000),
        handshake_timeout: Duration::from_secs(10),
        event_buffer: 64,
    }
}

async fn wait_for_state(session: &SessionManager, wanted: ConnectionState) {
    let mut state = session.watch_state();
    tokio::time::timeout(Duration::from_secs(30), state.wait_for(|s| *s == wanted))
        .await
        .expect("state in time")
        .expect("session alive");
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

async fn next_event<S>(feed: &mut S, matches: impl Fn(&SessionEvent) -> bool) -> SessionEvent
where
    S: Stream<Item = SessionEvent> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = feed.next().await.expect("feed open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

async fn next_push<S>(feed: &mut S) -> PushEvent
where
    S: Stream<Item = SessionEvent> + Unpin,
{
    match next_event(feed, |event| matches!(event, SessionEvent::Push(_))).await {
        SessionEvent::Push(event) => event,
        other => unreachable!("filtered to pushes, got {other:?}"),
    }
}

#[tokio::test]
async fn first_subscribe_connects_and_joins() {
    let (connector, mut connections) = FakeConnector::new([]);
    let session = SessionManager::start(connector.clone(), "token-1", quick_settings(5));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(connector.attempts(), 0);

    let _subscription = session.subscribe(conversation("A")).expect("subscribe");
    let mut server = next_connection(&mut connections).await;

    assert_eq!(server.next_client_frame().await, join("A"));
    assert_eq!(connector.tokens(), vec!["token-1".to_string()]);
    wait_for_state(&session, ConnectionState::Connected).await;
    assert_eq!(
        session.subscriptions().await.get(&conversation("A")),
        Some(&JoinState::Joined)
    );
}

#[tokio::test]
async fn duplicate_subscribe_joins_once_and_leaves_on_last_drop() {
    let (connector, mut connections) = FakeConnector::new([]);
    let session = SessionManager::start(connector, "token", quick_settings(5));

    let first = session.subscribe(conversation("A")).expect("subscribe");
    let mut server = next_connection(&mut connections).await;
    assert_eq!(server.next_client_frame().await, join("A"));

    let second = session.subscribe(conversation("A")).expect("subscribe again");
    drop(first);
    assert_eq!(server.maybe_client_frame().await, None);

    drop(second);
    assert_eq!(server.next_client_frame().await, leave("A"));
    assert!(session.subscriptions().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn releasing_before_join_sends_no_leave() {
    let (connector, mut connections) = FakeConnector::new([ConnectStep::Fail("refused")]);
    let session = SessionManager::start(connector.clone(), "token", quick_settings(5));

    let early = session.subscribe(conversation("A")).expect("subscribe");
    drop(early);
    let _later = session.subscribe(conversation("B")).expect("subscribe");

    let mut server = next_connection(&mut connections).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(server.next_client_frame().await, join("B"));
    assert_eq!(server.maybe_client_frame().await, None);
}

#[tokio::test]
async fn transport_loss_rejoins_after_reconnect() {
    let (connector, mut connections) = FakeConnector::new([]);
    let session = SessionManager::start(connector, "token", quick_settings(5));
    let mut events = session.events();

    let _subscription = session.subscribe(conversation("A")).expect("subscribe");
    let mut first = next_connection(&mut connections).await;
    assert_eq!(first.next_client_frame().await, join("A"));
    drop(first);

    wait_for_event(&mut events, |event| {
        matches!(event, SessionEvent::StateChanged(ConnectionState::Reconnecting))
    })
    .await;
    let mut second = next_connection(&mut connections).await;
    assert_eq!(second.next_client_frame().await, join("A"));
    wait_for_state(&session, ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_give_up_until_asked_again() {
    let (connector, mut connections) = FakeConnector::new([
        ConnectStep::Fail("down"),
        ConnectStep::Fail("down"),
        ConnectStep::Fail("down"),
    ]);
    let session = SessionManager::start(connector.clone(), "token", quick_settings(3));
    let mut events = session.events();

    let _subscription = session.subscribe(conversation("A")).expect("subscribe");
    wait_for_event(&mut events, |event| matches!(event, SessionEvent::GaveUp)).await;

    assert_eq!(connector.attempts(), 3);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(
        session.subscriptions().await.get(&conversation("A")),
        Some(&JoinState::Pending)
    );

    session.reconnect().expect("reconnect");
    let mut server = next_connection(&mut connections).await;
    assert_eq!(server.next_client_frame().await, join("A"));
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_handshake_times_out_and_retries() {
    let (connector, mut connections) =
        FakeConnector::new([ConnectStep::AcceptSilently, ConnectStep::Accept]);
    let session = SessionManager::start(connector.clone(), "token", quick_settings(2));

    let _subscription = session.subscribe(conversation("A")).expect("subscribe");
    let _silent = next_connection(&mut connections).await;
    let mut server = next_connection(&mut connections).await;

    assert_eq!(server.next_client_frame().await, join("A"));
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test]
async fn rejected_handshake_tears_the_session_down() {
    let (connector, _connections) = FakeConnector::new([ConnectStep::Reject("token expired")]);
    let session = SessionManager::start(connector.clone(), "stale", quick_settings(5));
    let mut events = session.events();

    let _subscription = session.subscribe(conversation("A")).expect("subscribe");
    let rejected =
        wait_for_event(&mut events, |event| matches!(event, SessionEvent::AuthRejected(_))).await;
    assert!(matches!(rejected, SessionEvent::AuthRejected(reason) if reason.contains("token expired")));
    wait_for_event(&mut events, |event| matches!(event, SessionEvent::Closed)).await;

    assert_eq!(connector.attempts(), 1);
    session.shutdown().await;
    assert!(matches!(
        session.subscribe(conversation("B")),
        Err(SyncError::SessionClosed)
    ));
}

#[tokio::test]
async fn unauthorized_error_frame_before_ack_is_fatal() {
    let (connector, mut connections) = FakeConnector::new([ConnectStep::AcceptSilently]);
    let session = SessionManager::start(connector.clone(), "token", quick_settings(5));
    let mut events = session.events();

    session.connect().expect("connect");
    let server = next_connection(&mut connections).await;
    server.send(ServerFrame::Error(ApiError::new(
        ErrorCode::Unauthorized,
        "session revoked",
    )));

    wait_for_event(&mut events, |event| matches!(event, SessionEvent::AuthRejected(_))).await;
    wait_for_event(&mut events, |event| matches!(event, SessionEvent::Closed)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn event_stream_keeps_server_order_across_conversations() {
    let (connector, mut connections) = FakeConnector::new([]);
    let session = SessionManager::start(connector, "token", quick_settings(5));
    let mut feed = Box::pin(session.event_stream());

    let _a = session.subscribe(conversation("A")).expect("subscribe A");
    let _b = session.subscribe(conversation("B")).expect("subscribe B");
    let mut server = next_connection(&mut connections).await;
    server.next_client_frame().await;
    server.next_client_frame().await;

    server.push(PushEvent::MessageNew(message("b1", "B", "peer", 1)));
    server.push(PushEvent::MessageDelete(MessageDeleted {
        id: MessageId::from("a0"),
        conversation_id: conversation("A"),
    }));

    let first = next_push(&mut feed).await;
    assert_eq!(first.conversation_id(), &conversation("B"));
    let second = next_push(&mut feed).await;
    assert_eq!(second.conversation_id(), &conversation("A"));
    assert!(matches!(second, PushEvent::MessageDelete(_)));
}

#[tokio::test]
async fn undecodable_frame_is_skipped_without_reconnecting() {
    let (connector, mut connections) = FakeConnector::new([]);
    let session = SessionManager::start(connector.clone(), "token", quick_settings(5));
    let mut feed = Box::pin(session.event_stream());

    let _a = session.subscribe(conversation("A")).expect("subscribe");
    let mut server = next_connection(&mut connections).await;
    assert_eq!(server.next_client_frame().await, join("A"));

    server.send_undecodable(r#"{"type":"friend:request","data":{}}"#);
    server.push(PushEvent::MessageNew(message("a1", "A", "peer", 1)));

    let reported = next_event(&mut feed, |event| matches!(event, SessionEvent::ServerError(_))).await;
    assert!(matches!(reported, SessionEvent::ServerError(reason) if reason.contains("friend:request")));
    let delivered = next_push(&mut feed).await;
    assert!(matches!(delivered, PushEvent::MessageNew(m) if m.id == MessageId::from("a1")));

    assert_eq!(connector.attempts(), 1);
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(server.maybe_client_frame().await, None);
}

#[tokio::test]
async fn event_stream_never_skips_under_a_burst() {
    let (connector, mut connections) = FakeConnector::new([]);
    let mut settings = quick_settings(5);
    settings.event_buffer = 4;
    let session = SessionManager::start(connector, "token", settings);
    let mut lossy = session.events();
    let mut feed = Box::pin(session.event_stream());

    let _a = session.subscribe(conversation("A")).expect("subscribe");
    let mut server = next_connection(&mut connections).await;
    server.next_client_frame().await;
    for n in 0..40 {
        server.push(PushEvent::MessageNew(message(&format!("m{n}"), "A", "peer", n)));
    }

    for n in 0..40 {
        let received = next_push(&mut feed).await;
        assert!(
            matches!(&received, PushEvent::MessageNew(m) if m.id == MessageId::from(format!("m{n}").as_str())),
            "expected m{n}, got {received:?}"
        );
    }
    assert!(matches!(
        lossy.recv().await,
        Err(broadcast::error::RecvError::Lagged(_))
    ));
}

#[tokio::test]
async fn non_fatal_server_errors_are_reported_and_ignored() {
    let (connector, mut connections) = FakeConnector::new([]);
    let session = SessionManager::start(connector, "token", quick_settings(5));
    let mut events = session.events();

    let _a = session.subscribe(conversation("A")).expect("subscribe");
    let mut server = next_connection(&mut connections).await;
    server.next_client_frame().await;
    server.send(ServerFrame::Error(ApiError::new(
        ErrorCode::NotFound,
        "no such conversation",
    )));

    wait_for_event(&mut events, |event| matches!(event, SessionEvent::ServerError(_))).await;
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn shutdown_leaves_joined_conversations() {
    let (connector, mut connections) = FakeConnector::new([]);
    let session = SessionManager::start(connector, "token", quick_settings(5));

    let feed = session.event_stream();
    let _subscription = session.subscribe(conversation("A")).expect("subscribe");
    let mut server = next_connection(&mut connections).await;
    assert_eq!(server.next_client_frame().await, join("A"));

    session.shutdown().await;

    assert_eq!(server.next_client_frame().await, leave("A"));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    let remaining: Vec<SessionEvent> = tokio::time::timeout(Duration::from_secs(5), feed.collect())
        .await
        .expect("feed ends after teardown");
    assert!(matches!(remaining.last(), Some(SessionEvent::Closed)));
    assert!(matches!(session.connect(), Err(SyncError::SessionClosed)));
}
