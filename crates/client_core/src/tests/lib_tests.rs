use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex as TokioMutex},
    time::timeout,
};

use super::*;
use crate::credentials::MemoryCredentialStore;

#[derive(Clone)]
struct ChatServerState {
    /// Frames the connected client sent, as raw JSON.
    inbound_tx: mpsc::UnboundedSender<Value>,
    /// Frames queued for pushing to the client. Taken by the first (only)
    /// realtime connection.
    push_rx: Arc<TokioMutex<Option<mpsc::UnboundedReceiver<String>>>>,
}

async fn login_handler() -> Response {
    Json(json!({
        "success": true,
        "message": "Login successful",
        "access_token": "access-good",
        "refresh_token": "refresh-1",
        "userDetails": {"id": "9", "username": "bob", "email": "bob@example.com"}
    }))
    .into_response()
}

async fn logout_handler() -> Response {
    Json(json!({"success": true, "message": "Logged out"})).into_response()
}

async fn conversation_handler(Path(peer): Path<i64>) -> Response {
    Json(json!({
        "chatroom_id": 1,
        "messages": [{
            "id": 1,
            "sender_id": peer,
            "sender_username": "alice",
            "receiver_id": 9,
            "content": "earlier message",
            "timestamp": "2024-01-01T00:00:00Z",
            "is_read": false
        }]
    }))
    .into_response()
}

async fn ws_handler(State(state): State<ChatServerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| chat_socket(socket, state))
}

async fn chat_socket(mut socket: WebSocket, state: ChatServerState) {
    let mut push_rx = state
        .push_rx
        .lock()
        .await
        .take()
        .expect("single realtime connection");
    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(AxumMessage::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = state.inbound_tx.send(value);
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            frame = push_rx.recv() => match frame {
                Some(text) => {
                    if socket.send(AxumMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

struct Backend {
    settings: Settings,
    inbound: mpsc::UnboundedReceiver<Value>,
    push: mpsc::UnboundedSender<String>,
}

async fn spawn_backend() -> Backend {
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (push, push_rx) = mpsc::unbounded_channel();
    let state = ChatServerState {
        inbound_tx,
        push_rx: Arc::new(TokioMutex::new(Some(push_rx))),
    };
    let app = Router::new()
        .route("/chat/login/", post(login_handler))
        .route("/chat/logout/", post(logout_handler))
        .route("/chat/conversation/:peer/", get(conversation_handler))
        .route("/ws/chat/", get(ws_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Backend {
        settings: Settings {
            api_base: format!("http://{addr}/chat/"),
            realtime_url: Some(format!("ws://{addr}/ws/chat/")),
            credentials_path: "unused".into(),
        },
        inbound,
        push,
    }
}

async fn next_inbound(backend: &mut Backend) -> Value {
    timeout(Duration::from_secs(2), backend.inbound.recv())
        .await
        .expect("frame in time")
        .expect("socket open")
}

fn test_session(settings: &Settings) -> Arc<ChatSession> {
    ChatSession::with_store(settings, Arc::new(MemoryCredentialStore::new())).expect("session")
}

#[tokio::test(flavor = "multi_thread")]
async fn session_reconciles_history_pushes_and_receipts() {
    let mut backend = spawn_backend().await;
    let session = test_session(&backend.settings);

    let user = session.login("bob@example.com", "secret").await.expect("login");
    assert_eq!(user.id, UserId(9));
    assert_eq!(session.current_user().map(|u| u.username), Some("bob".into()));

    session.connect().await.expect("connect");

    // history holds one unread message from the counterpart
    let timeline = session
        .select_conversation(UserId(7))
        .await
        .expect("select conversation");
    assert_eq!(timeline.len(), 1);

    let receipt = next_inbound(&mut backend).await;
    assert_eq!(receipt["type"], "read_receipt");
    assert_eq!(receipt["message_id"], 1);

    // a live push for the same conversation is acknowledged too
    backend
        .push
        .send(
            json!({
                "type": "chat_message",
                "message": {
                    "id": 5,
                    "sender_id": 7,
                    "sender_username": "alice",
                    "receiver_id": 9,
                    "content": "hi",
                    "timestamp": "2024-01-01T00:00:01Z",
                    "is_read": false
                },
                "sender_id": 7,
                "sender_username": "alice"
            })
            .to_string(),
        )
        .expect("push");

    let receipt = next_inbound(&mut backend).await;
    assert_eq!(receipt["type"], "read_receipt");
    assert_eq!(receipt["message_id"], 5);

    let ids: Vec<i64> = session.timeline().iter().map(|m| m.id.0).collect();
    assert_eq!(ids, vec![1, 5]);

    // both messages are still unread locally, so a visibility resume
    // re-acknowledges them
    session.visibility_resumed().await;
    let first = next_inbound(&mut backend).await;
    let second = next_inbound(&mut backend).await;
    assert_eq!(first["type"], "read_receipt");
    assert_eq!(second["type"], "read_receipt");
    let mut resent: Vec<i64> = vec![
        first["message_id"].as_i64().expect("id"),
        second["message_id"].as_i64().expect("id"),
    ];
    resent.sort_unstable();
    assert_eq!(resent, vec![1, 5]);

    session.logout().await.expect("logout");
    assert_eq!(session.connection_state().await, ConnectionState::Closed);
    assert!(session.current_user().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn outbound_message_carries_receiver_and_ends_composing() {
    let mut backend = spawn_backend().await;
    let session = test_session(&backend.settings);

    session.login("bob@example.com", "secret").await.expect("login");
    session.connect().await.expect("connect");
    session
        .select_conversation(UserId(7))
        .await
        .expect("select conversation");
    // drain the history receipt
    let receipt = next_inbound(&mut backend).await;
    assert_eq!(receipt["type"], "read_receipt");

    session.send_message("hello").await.expect("send");

    let message = next_inbound(&mut backend).await;
    assert_eq!(message["type"], "chat_message");
    assert_eq!(message["receiver_id"], 7);
    assert_eq!(message["content"], "hello");
    assert_eq!(message["message_type"], "text");

    let stop = next_inbound(&mut backend).await;
    assert_eq!(stop["type"], "typing");
    assert_eq!(stop["is_typing"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn composing_pause_emits_a_stop_typing_frame() {
    let mut backend = spawn_backend().await;
    let session = test_session(&backend.settings);

    session.login("bob@example.com", "secret").await.expect("login");
    session.connect().await.expect("connect");
    session
        .select_conversation(UserId(7))
        .await
        .expect("select conversation");
    let receipt = next_inbound(&mut backend).await;
    assert_eq!(receipt["type"], "read_receipt");

    session.notify_composing().await.expect("notify composing");
    let start = next_inbound(&mut backend).await;
    assert_eq!(start["type"], "typing");
    assert_eq!(start["is_typing"], true);

    // the stop signal fires only after the idle window elapses
    let stop = timeout(COMPOSE_IDLE_WINDOW + Duration::from_secs(1), async {
        backend.inbound.recv().await
    })
    .await
    .expect("stop-typing in time")
    .expect("socket open");
    assert_eq!(stop["type"], "typing");
    assert_eq!(stop["is_typing"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn counterpart_typing_is_visible_through_the_session() {
    let mut backend = spawn_backend().await;
    let session = test_session(&backend.settings);

    session.login("bob@example.com", "secret").await.expect("login");
    session.connect().await.expect("connect");
    session
        .select_conversation(UserId(7))
        .await
        .expect("select conversation");
    let receipt = next_inbound(&mut backend).await;
    assert_eq!(receipt["type"], "read_receipt");

    backend
        .push
        .send(
            json!({
                "type": "typing_indicator",
                "sender_id": 7,
                "sender_username": "alice",
                "is_typing": true
            })
            .to_string(),
        )
        .expect("push");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(state) = session.typing() {
            assert_eq!(state.user_id, UserId(7));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "typing never surfaced");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
