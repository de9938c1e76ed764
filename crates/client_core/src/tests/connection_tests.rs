use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::get,
    Router,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::mpsc, time::timeout};

use super::*;
use crate::{
    credentials::{CredentialPair, MemoryCredentialStore},
    dispatcher::{EventKind, RealtimeEvent},
};

const ACCESS: &str = "token-abc";

#[test]
fn backoff_delay_is_linear_and_clamped() {
    let policy = ReconnectPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_millis(3000));
    assert_eq!(policy.delay_for(4), Duration::from_millis(12_000));
    assert_eq!(policy.delay_for(20), Duration::from_millis(30_000));
}

#[test]
fn normal_and_auth_closures_never_reconnect() {
    let policy = ReconnectPolicy::default();
    assert!(!policy.should_reconnect(CLOSE_NORMAL, 0));
    assert!(!policy.should_reconnect(CLOSE_AUTH_REJECTED, 0));
    assert!(policy.should_reconnect(1006, 0));
    assert!(policy.should_reconnect(1006, 4));
    assert!(!policy.should_reconnect(1006, 5));
}

fn wire_connection(
    endpoint: &str,
    policy: ReconnectPolicy,
) -> (
    Arc<RealtimeConnection>,
    mpsc::UnboundedReceiver<RealtimeEvent>,
    broadcast::Receiver<SessionNotice>,
) {
    let store: Arc<dyn CredentialStore> =
        Arc::new(MemoryCredentialStore::with_pair(CredentialPair {
            access: ACCESS.into(),
            refresh: "refresh-1".into(),
        }));
    let dispatcher = Arc::new(EventDispatcher::new());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    for kind in [
        EventKind::ChatMessage,
        EventKind::Connection,
        EventKind::Error,
    ] {
        let events_tx = events_tx.clone();
        dispatcher.subscribe(
            kind,
            Arc::new(move |event: &RealtimeEvent| {
                let _ = events_tx.send(event.clone());
            }),
        );
    }

    let (notices, notices_rx) = broadcast::channel(8);
    let connection = RealtimeConnection::with_policy(
        Url::parse(endpoint).expect("endpoint"),
        store,
        dispatcher,
        notices,
        policy,
    );
    (connection, events_rx, notices_rx)
}

#[derive(Clone, Copy)]
enum WsBehavior {
    SendChatMessage,
    CloseNormally,
    DropImmediately,
}

#[derive(Clone)]
struct WsState {
    connections: Arc<AtomicUsize>,
    tokens: Arc<StdMutex<Vec<String>>>,
    behavior: WsBehavior,
}

async fn ws_handler(
    State(state): State<WsState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    state.connections.fetch_add(1, Ordering::SeqCst);
    state
        .tokens
        .lock()
        .expect("lock")
        .push(params.get("token").cloned().unwrap_or_default());
    ws.on_upgrade(move |socket| serve_socket(socket, state.behavior))
}

async fn serve_socket(mut socket: WebSocket, behavior: WsBehavior) {
    match behavior {
        WsBehavior::SendChatMessage => {
            let frame = json!({
                "type": "chat_message",
                "message": {
                    "id": 5,
                    "sender_id": 7,
                    "sender_username": "alice",
                    "receiver_id": 9,
                    "content": "hi",
                    "timestamp": "2024-01-01T00:00:00Z",
                    "is_read": false
                },
                "sender_id": 7,
                "sender_username": "alice"
            });
            let _ = socket.send(AxumMessage::Text(frame.to_string())).await;
            while socket.recv().await.is_some() {}
        }
        WsBehavior::CloseNormally => {
            let _ = socket
                .send(AxumMessage::Close(Some(AxumCloseFrame {
                    code: 1000,
                    reason: "".into(),
                })))
                .await;
        }
        WsBehavior::DropImmediately => {}
    }
}

async fn spawn_ws_server(behavior: WsBehavior) -> (String, WsState) {
    let state = WsState {
        connections: Arc::new(AtomicUsize::new(0)),
        tokens: Arc::new(StdMutex::new(Vec::new())),
        behavior,
    };
    let app = Router::new()
        .route("/ws/chat/", get(ws_handler))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{addr}/ws/chat/"), state)
}

#[tokio::test]
async fn send_requires_an_open_connection() {
    let (connection, _events, _notices) =
        wire_connection("ws://127.0.0.1:9/ws/chat/", ReconnectPolicy::default());

    let err = connection
        .send_typing(shared::domain::UserId(7), true)
        .await
        .expect_err("must fail");
    assert!(
        matches!(
            err,
            ClientError::NotConnected {
                state: ConnectionState::Idle
            }
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn open_without_credentials_fails_fast() {
    let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
    let dispatcher = Arc::new(EventDispatcher::new());
    let (notices, _) = broadcast::channel(8);
    let connection = RealtimeConnection::new(
        Url::parse("ws://127.0.0.1:9/ws/chat/").expect("endpoint"),
        store,
        dispatcher,
        notices,
    );

    let err = connection.open().await.expect_err("must fail");
    assert!(matches!(err, ClientError::NoCredential), "got {err:?}");
    assert_eq!(connection.state().await, ConnectionState::Idle);
}

#[tokio::test]
async fn delivers_frames_and_carries_the_token() {
    let (endpoint, server) = spawn_ws_server(WsBehavior::SendChatMessage).await;
    let (connection, mut events, _notices) =
        wire_connection(&endpoint, ReconnectPolicy::default());

    connection.open().await.expect("open");
    assert_eq!(connection.state().await, ConnectionState::Open);

    let mut saw_connected = false;
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match event {
            RealtimeEvent::Frame(ServerFrame::Connection { status, .. }) => {
                saw_connected = status == ConnectionStatus::Connected;
            }
            RealtimeEvent::Frame(ServerFrame::ChatMessage { message, .. }) => {
                assert_eq!(message.id, MessageId(5));
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_connected);
    assert_eq!(
        *server.tokens.lock().expect("lock"),
        vec![ACCESS.to_string()]
    );

    connection.close().await;
    assert_eq!(connection.state().await, ConnectionState::Closed);
}

#[tokio::test]
async fn clean_close_is_never_retried() {
    let (endpoint, server) = spawn_ws_server(WsBehavior::CloseNormally).await;
    let policy = ReconnectPolicy {
        step: Duration::from_millis(10),
        ..ReconnectPolicy::default()
    };
    let (connection, _events, _notices) = wire_connection(&endpoint, policy);

    connection.open().await.expect("open");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert_eq!(connection.state().await, ConnectionState::Closed);
}

#[tokio::test]
async fn abnormal_close_schedules_a_reconnect() {
    let (endpoint, server) = spawn_ws_server(WsBehavior::DropImmediately).await;
    let policy = ReconnectPolicy {
        step: Duration::from_millis(10),
        ..ReconnectPolicy::default()
    };
    let (connection, _events, _notices) = wire_connection(&endpoint, policy);

    connection.open().await.expect("open");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.connections.load(Ordering::SeqCst) < 2 {
        assert!(tokio::time::Instant::now() < deadline, "no reconnect observed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    connection.close().await;
}

#[tokio::test]
async fn failing_handshakes_exhaust_the_retry_budget() {
    // bind a port and drop it so every connect attempt is refused
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let policy = ReconnectPolicy {
        max_attempts: 2,
        step: Duration::from_millis(5),
        ceiling: Duration::from_millis(5),
    };
    let (connection, _events, mut notices) =
        wire_connection(&format!("ws://{addr}/ws/chat/"), policy);

    let err = connection.open().await.expect_err("must fail");
    assert!(matches!(err, ClientError::Transport(_)), "got {err:?}");

    let notice = timeout(Duration::from_secs(2), notices.recv())
        .await
        .expect("notice in time")
        .expect("channel open");
    assert_eq!(notice, SessionNotice::ReconnectExhausted { attempts: 2 });
}

#[tokio::test]
async fn rejected_handshake_surfaces_auth_rejection() {
    let app = Router::new().route("/ws/chat/", get(|| async { StatusCode::UNAUTHORIZED }));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let (connection, _events, mut notices) = wire_connection(
        &format!("ws://{addr}/ws/chat/"),
        ReconnectPolicy::default(),
    );

    let err = connection.open().await.expect_err("must fail");
    assert!(matches!(err, ClientError::AuthRejected), "got {err:?}");
    assert_eq!(connection.state().await, ConnectionState::Closed);

    let notice = timeout(Duration::from_secs(2), notices.recv())
        .await
        .expect("notice in time")
        .expect("channel open");
    assert_eq!(notice, SessionNotice::AuthRejected);
}
