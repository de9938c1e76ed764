use std::{cmp, sync::Arc, time::Duration};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::{MessageId, MessageKind, UserId},
    protocol::{ClientFrame, ConnectionStatus, InboundFrame, ServerFrame},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};
use url::Url;

use crate::{
    credentials::CredentialStore,
    dispatcher::{EventDispatcher, RealtimeEvent},
    error::ClientError,
    SessionNotice,
};

pub const CLOSE_NORMAL: u16 = 1000;
/// The server closes with 1008 (policy violation) when it rejects the token.
pub const CLOSE_AUTH_REJECTED: u16 = 1008;
const CLOSE_ABNORMAL: u16 = 1006;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Reconnecting,
}

/// Linear-clamped backoff: the n-th retry waits `min(step × n, ceiling)`.
/// Close code 1000 and the auth-rejection code never retry.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub step: Duration,
    pub ceiling: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step: Duration::from_millis(3000),
            ceiling: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        cmp::min(self.step * attempt, self.ceiling)
    }

    pub fn should_reconnect(&self, close_code: u16, attempts_so_far: u32) -> bool {
        close_code != CLOSE_NORMAL
            && close_code != CLOSE_AUTH_REJECTED
            && attempts_so_far < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
}

impl ConnectionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

/// Owns the realtime socket for one session: drives the lifecycle state
/// machine, reconnects with backoff, and turns inbound frames into
/// dispatcher events. Outbound sends never queue; they fail immediately
/// unless the connection is Open.
pub struct RealtimeConnection {
    endpoint: Url,
    store: Arc<dyn CredentialStore>,
    dispatcher: Arc<EventDispatcher>,
    notices: broadcast::Sender<SessionNotice>,
    policy: ReconnectPolicy,
    inner: Mutex<Inner>,
}

struct Inner {
    state: ConnectionState,
    attempts: u32,
    writer: Option<WsSink>,
    reader_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

enum CloseDecision {
    Stay,
    AuthRejected,
    Retry { attempt: u32 },
    Exhausted { attempts: u32 },
}

impl RealtimeConnection {
    pub fn new(
        endpoint: Url,
        store: Arc<dyn CredentialStore>,
        dispatcher: Arc<EventDispatcher>,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Arc<Self> {
        Self::with_policy(endpoint, store, dispatcher, notices, ReconnectPolicy::default())
    }

    pub fn with_policy(
        endpoint: Url,
        store: Arc<dyn CredentialStore>,
        dispatcher: Arc<EventDispatcher>,
        notices: broadcast::Sender<SessionNotice>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            store,
            dispatcher,
            notices,
            policy,
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                attempts: 0,
                writer: None,
                reader_task: None,
                reconnect_timer: None,
            }),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.lock().await;
        ConnectionSnapshot {
            state: inner.state,
            reconnect_attempts: inner.attempts,
        }
    }

    /// Opens the transport using the stored access credential, carried as a
    /// query parameter on the endpoint. Idempotent while a connection is
    /// already up or in progress.
    pub async fn open(self: &Arc<Self>) -> Result<(), ClientError> {
        let access = self
            .store
            .load()
            .map(|pair| pair.access)
            .unwrap_or_default();
        if access.is_empty() {
            return Err(ClientError::NoCredential);
        }

        {
            let mut inner = self.inner.lock().await;
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Open
            ) {
                return Ok(());
            }
            inner.state = ConnectionState::Connecting;
        }

        let mut url = self.endpoint.clone();
        url.query_pairs_mut().clear().append_pair("token", &access);

        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                let (writer, reader) = stream.split();
                {
                    let mut inner = self.inner.lock().await;
                    inner.state = ConnectionState::Open;
                    inner.attempts = 0;
                    inner.writer = Some(writer);
                    if let Some(timer) = inner.reconnect_timer.take() {
                        timer.abort();
                    }
                    if let Some(stale) = inner.reader_task.take() {
                        stale.abort();
                    }
                    inner.reader_task = Some(self.spawn_reader(reader));
                }
                info!(endpoint = %self.endpoint, "ws: connected");
                self.dispatcher
                    .publish(&connection_event(ConnectionStatus::Connected));
                Ok(())
            }
            Err(err) => {
                if is_auth_rejection(&err) {
                    let mut inner = self.inner.lock().await;
                    inner.state = ConnectionState::Closed;
                    drop(inner);
                    warn!("ws: handshake rejected the access credential");
                    let _ = self.notices.send(SessionNotice::AuthRejected);
                    self.dispatcher
                        .publish(&connection_event(ConnectionStatus::Disconnected));
                    return Err(ClientError::AuthRejected);
                }

                self.dispatcher.publish(&RealtimeEvent::Frame(ServerFrame::Error {
                    error: format!("websocket connect failed: {err}"),
                }));
                self.handle_transport_close(CLOSE_ABNORMAL).await;
                Err(ClientError::Transport(err.to_string()))
            }
        }
    }

    /// Closes with a normal-closure code and cancels any pending reconnect.
    /// This is the one shutdown path that never triggers auto-reconnect.
    pub async fn close(&self) {
        let (was_open, writer, reader_task, timer) = {
            let mut inner = self.inner.lock().await;
            let was_open = inner.state == ConnectionState::Open;
            inner.state = ConnectionState::Closing;
            inner.attempts = 0;
            (
                was_open,
                inner.writer.take(),
                inner.reader_task.take(),
                inner.reconnect_timer.take(),
            )
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(task) = reader_task {
            task.abort();
        }
        if let Some(mut writer) = writer {
            let goodbye = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            if let Err(err) = writer.send(goodbye).await {
                warn!("ws: close frame not delivered: {err}");
            }
            let _ = writer.close().await;
        }

        self.inner.lock().await.state = ConnectionState::Closed;
        info!("ws: closed");
        if was_open {
            self.dispatcher
                .publish(&connection_event(ConnectionStatus::Disconnected));
        }
    }

    pub async fn send_chat_message(
        &self,
        receiver_id: UserId,
        content: &str,
        message_type: MessageKind,
    ) -> Result<(), ClientError> {
        self.send_frame(&ClientFrame::ChatMessage {
            receiver_id,
            content: content.to_string(),
            message_type,
        })
        .await
    }

    pub async fn send_typing(
        &self,
        receiver_id: UserId,
        is_typing: bool,
    ) -> Result<(), ClientError> {
        self.send_frame(&ClientFrame::Typing {
            receiver_id,
            is_typing,
        })
        .await
    }

    pub async fn send_read_receipt(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.send_frame(&ClientFrame::ReadReceipt { message_id }).await
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        let text = serde_json::to_string(frame)?;
        let result = {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Open {
                return Err(ClientError::NotConnected { state: inner.state });
            }
            match inner.writer.as_mut() {
                Some(writer) => writer
                    .send(Message::Text(text))
                    .await
                    .map_err(|err| ClientError::Transport(err.to_string())),
                None => Err(ClientError::NotConnected { state: inner.state }),
            }
        };

        if let Err(err) = &result {
            // Informational; the transport's own close event drives the
            // state transition.
            self.dispatcher.publish(&RealtimeEvent::Frame(ServerFrame::Error {
                error: format!("websocket send failed: {err}"),
            }));
        }
        result
    }

    fn spawn_reader(self: &Arc<Self>, mut reader: WsSource) -> JoinHandle<()> {
        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let close_code = loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => match InboundFrame::parse(&text) {
                        Ok(InboundFrame::Known(frame)) => {
                            connection.dispatcher.publish(&RealtimeEvent::Frame(frame));
                        }
                        Ok(InboundFrame::Unknown { kind, raw }) => {
                            info!(kind = %kind, "ws: frame with unrecognized type");
                            connection
                                .dispatcher
                                .publish(&RealtimeEvent::Unknown { kind, raw });
                        }
                        Err(err) => warn!("ws: dropping malformed frame: {err}"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|frame| u16::from(frame.code))
                            .unwrap_or(CLOSE_ABNORMAL);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        connection
                            .dispatcher
                            .publish(&RealtimeEvent::Frame(ServerFrame::Error {
                                error: format!("websocket receive failed: {err}"),
                            }));
                        break CLOSE_ABNORMAL;
                    }
                    None => break CLOSE_ABNORMAL,
                }
            };
            connection.handle_transport_close(close_code).await;
        })
    }

    // Returns a boxed future to break the `open` -> `handle_transport_close`
    // -> reconnect-task -> `open` async recursion, which otherwise prevents
    // the compiler from inferring `Send` for these futures.
    fn handle_transport_close(
        self: &Arc<Self>,
        close_code: u16,
    ) -> futures::future::BoxFuture<'_, ()> {
        Box::pin(self.handle_transport_close_inner(close_code))
    }

    async fn handle_transport_close_inner(self: &Arc<Self>, close_code: u16) {
        let decision = {
            let mut inner = self.inner.lock().await;
            if matches!(
                inner.state,
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                // Explicit disconnect already in progress; nothing to report.
                inner.state = ConnectionState::Closed;
                inner.writer = None;
                None
            } else {
                inner.writer = None;
                inner.state = ConnectionState::Closed;
                if close_code == CLOSE_AUTH_REJECTED {
                    Some(CloseDecision::AuthRejected)
                } else if close_code == CLOSE_NORMAL {
                    Some(CloseDecision::Stay)
                } else if self.policy.should_reconnect(close_code, inner.attempts) {
                    inner.attempts += 1;
                    inner.state = ConnectionState::Reconnecting;
                    Some(CloseDecision::Retry {
                        attempt: inner.attempts,
                    })
                } else {
                    Some(CloseDecision::Exhausted {
                        attempts: inner.attempts,
                    })
                }
            }
        };

        let Some(decision) = decision else { return };

        info!(close_code, "ws: disconnected");
        self.dispatcher
            .publish(&connection_event(ConnectionStatus::Disconnected));

        match decision {
            CloseDecision::Stay => {}
            CloseDecision::AuthRejected => {
                warn!("ws: server rejected the access credential; not reconnecting");
                let _ = self.notices.send(SessionNotice::AuthRejected);
                self.dispatcher.publish(&RealtimeEvent::Frame(ServerFrame::Error {
                    error: "authentication rejected; log in again".to_string(),
                }));
            }
            CloseDecision::Retry { attempt } => {
                let delay = self.policy.delay_for(attempt);
                info!(
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "ws: scheduling reconnect"
                );
                let connection = Arc::clone(self);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = connection.open().await {
                        warn!(attempt, "ws: reconnect attempt failed: {err}");
                    }
                });

                let mut inner = self.inner.lock().await;
                if inner.state == ConnectionState::Reconnecting {
                    if let Some(stale) = inner.reconnect_timer.replace(timer) {
                        stale.abort();
                    }
                } else {
                    // close() won the race while the timer was being set up
                    timer.abort();
                }
            }
            CloseDecision::Exhausted { attempts } => {
                warn!(attempts, "ws: reconnect budget exhausted");
                let _ = self
                    .notices
                    .send(SessionNotice::ReconnectExhausted { attempts });
                self.dispatcher.publish(&RealtimeEvent::Frame(ServerFrame::Error {
                    error: "connection lost; reconnect attempts exhausted".to_string(),
                }));
            }
        }
    }
}

fn connection_event(status: ConnectionStatus) -> RealtimeEvent {
    RealtimeEvent::Frame(ServerFrame::Connection {
        status,
        user_id: None,
    })
}

fn is_auth_rejection(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            status == 401 || status == 403
        }
        _ => false,
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
