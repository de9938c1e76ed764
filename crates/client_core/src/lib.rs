use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Instant,
};

use anyhow::{anyhow, Context, Result};
use shared::{
    domain::{MessageId, MessageKind, UserId},
    protocol::{
        MessagePayload, RegisterRequest, RegisterResponse, ServerFrame, UserDetails, UserSummary,
    },
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod reconciler;

use config::Settings;
use connection::{ConnectionState, RealtimeConnection};
use credentials::{CredentialStore, FileCredentialStore};
use dispatcher::{EventDispatcher, EventKind, Handler, RealtimeEvent};
use gateway::{CredentialRenewer, RequestGateway};
use reconciler::{ConversationReconciler, TypingState, COMPOSE_IDLE_WINDOW};

/// Out-of-band conditions the presentation layer must react to with a
/// navigation or a prompt, as opposed to events it merely renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotice {
    /// Credential renewal failed and the stored pair was cleared; the user
    /// must log in again.
    SessionTerminated,
    /// The realtime server rejected the access credential; no reconnect.
    AuthRejected,
    /// The reconnect budget is spent; a manual retry is required.
    ReconnectExhausted { attempts: u32 },
}

/// One authenticated chat session: owns the credential store, the REST
/// gateway, the realtime connection, the dispatcher, and the per-conversation
/// reconciler, and wires them together. Constructed explicitly and passed by
/// handle; nothing here is process-global.
pub struct ChatSession {
    gateway: RequestGateway,
    dispatcher: Arc<EventDispatcher>,
    connection: Arc<RealtimeConnection>,
    notices: broadcast::Sender<SessionNotice>,
    reconciler: Arc<StdMutex<ConversationReconciler>>,
    user: StdMutex<Option<UserDetails>>,
    compose_timer: StdMutex<Option<JoinHandle<()>>>,
    event_pump: JoinHandle<()>,
}

impl ChatSession {
    pub fn new(settings: &Settings) -> Result<Arc<Self>> {
        let store: Arc<dyn CredentialStore> =
            Arc::new(FileCredentialStore::open(&settings.credentials_path));
        Self::with_store(settings, store)
    }

    /// Same wiring with a caller-supplied credential store.
    pub fn with_store(settings: &Settings, store: Arc<dyn CredentialStore>) -> Result<Arc<Self>> {
        let api_base = settings.api_base_url().context("reading api_base")?;
        let endpoint = settings
            .realtime_endpoint()
            .context("deriving realtime endpoint")?;

        let (notices, _) = broadcast::channel(16);
        let refresh_url = api_base.join("refresh/").context("building refresh url")?;
        let renewer = Arc::new(CredentialRenewer::new(
            refresh_url,
            Arc::clone(&store),
            notices.clone(),
        ));
        let gateway = RequestGateway::new(api_base, Arc::clone(&store), renewer);

        let dispatcher = Arc::new(EventDispatcher::new());
        let connection =
            RealtimeConnection::new(endpoint, store, Arc::clone(&dispatcher), notices.clone());

        let reconciler = Arc::new(StdMutex::new(ConversationReconciler::new()));
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        // Chat traffic funnels from the dispatcher into the pump task, which
        // applies it to the reconciler and performs the resulting sends.
        let forward: Handler = Arc::new(move |event: &RealtimeEvent| {
            if let RealtimeEvent::Frame(frame) = event {
                let _ = frames_tx.send(frame.clone());
            }
        });
        for kind in [
            EventKind::ChatMessage,
            EventKind::MessageSent,
            EventKind::TypingIndicator,
            EventKind::ReadReceipt,
        ] {
            dispatcher.subscribe(kind, Arc::clone(&forward));
        }

        let event_pump = spawn_event_pump(
            Arc::clone(&connection),
            Arc::clone(&reconciler),
            frames_rx,
        );

        Ok(Arc::new(Self {
            gateway,
            dispatcher,
            connection,
            notices,
            reconciler,
            user: StdMutex::new(None),
            compose_timer: StdMutex::new(None),
            event_pump,
        }))
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn current_user(&self) -> Option<UserDetails> {
        lock(&self.user).clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserDetails> {
        let response = self
            .gateway
            .login(email, password)
            .await
            .context("logging in")?;
        *lock(&self.user) = Some(response.user_details.clone());
        Ok(response.user_details)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        self.gateway.register(request).await.context("registering")
    }

    /// Opens the realtime connection using the stored credentials.
    pub async fn connect(&self) -> Result<()> {
        self.connection
            .open()
            .await
            .context("opening realtime connection")
    }

    pub async fn disconnect(&self) {
        self.cancel_compose_timer();
        self.connection.close().await;
    }

    /// Disconnects, revokes the refresh token server-side, and clears the
    /// stored pair.
    pub async fn logout(&self) -> Result<()> {
        self.disconnect().await;
        *lock(&self.user) = None;
        self.gateway.logout().await.context("logging out")
    }

    pub async fn list_users(&self) -> Result<Vec<UserSummary>> {
        let directory = self
            .gateway
            .list_users()
            .await
            .context("fetching user directory")?;
        Ok(directory.data)
    }

    /// Switches the active conversation: fetches history, rebuilds the
    /// timeline, and acknowledges any unread counterpart messages.
    pub async fn select_conversation(&self, peer: UserId) -> Result<Vec<MessagePayload>> {
        self.cancel_compose_timer();
        let history = self
            .gateway
            .conversation_history(peer)
            .await
            .context("fetching conversation history")?;

        let (receipts, timeline) = {
            let mut reconciler = lock(&self.reconciler);
            reconciler.select_peer(peer);
            let receipts = reconciler.apply_history(&history.messages);
            (receipts, reconciler.timeline().to_vec())
        };
        info!(
            peer_id = peer.0,
            messages = timeline.len(),
            "conversation selected"
        );
        self.send_receipts(&receipts).await;
        Ok(timeline)
    }

    pub async fn send_message(&self, content: &str) -> Result<()> {
        let peer = self.active_peer()?;
        self.connection
            .send_chat_message(peer, content, MessageKind::Text)
            .await
            .context("sending message")?;
        // Sending ends the composing pause.
        self.cancel_compose_timer();
        if let Err(err) = self.connection.send_typing(peer, false).await {
            debug!("stop-typing after send not delivered: {err}");
        }
        Ok(())
    }

    /// Reports that the user is composing. Arms (or re-arms) the idle timer
    /// that emits the stop-typing signal once the user pauses.
    pub async fn notify_composing(self: &Arc<Self>) -> Result<()> {
        let peer = self.active_peer()?;
        self.connection
            .send_typing(peer, true)
            .await
            .context("sending typing indicator")?;

        let session = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(COMPOSE_IDLE_WINDOW).await;
            if let Err(err) = session.connection.send_typing(peer, false).await {
                debug!("stop-typing not delivered: {err}");
            }
        });
        if let Some(stale) = lock(&self.compose_timer).replace(timer) {
            stale.abort();
        }
        Ok(())
    }

    /// The conversation view became visible again; re-acknowledge anything
    /// still unread. Duplicate receipts are tolerated server-side.
    pub async fn visibility_resumed(&self) {
        let receipts = lock(&self.reconciler).visibility_resumed();
        self.send_receipts(&receipts).await;
    }

    pub fn timeline(&self) -> Vec<MessagePayload> {
        lock(&self.reconciler).timeline().to_vec()
    }

    pub fn typing(&self) -> Option<TypingState> {
        lock(&self.reconciler).typing().cloned()
    }

    fn active_peer(&self) -> Result<UserId> {
        lock(&self.reconciler)
            .peer()
            .ok_or_else(|| anyhow!("no conversation selected"))
    }

    async fn send_receipts(&self, receipts: &[MessageId]) {
        for id in receipts {
            if let Err(err) = self.connection.send_read_receipt(*id).await {
                warn!(message_id = id.0, "read receipt not sent: {err}");
            }
        }
    }

    fn cancel_compose_timer(&self) {
        if let Some(timer) = lock(&self.compose_timer).take() {
            timer.abort();
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.event_pump.abort();
        if let Some(timer) = lock(&self.compose_timer).take() {
            timer.abort();
        }
    }
}

/// Applies inbound chat traffic to the reconciler and performs the resulting
/// read-receipt sends; also drives the typing quiet-window expiry.
fn spawn_event_pump(
    connection: Arc<RealtimeConnection>,
    reconciler: Arc<StdMutex<ConversationReconciler>>,
    mut frames: mpsc::UnboundedReceiver<ServerFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let deadline = lock(&reconciler).typing_deadline();
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    let receipts = lock(&reconciler).apply_frame(&frame, Instant::now());
                    for id in receipts {
                        if let Err(err) = connection.send_read_receipt(id).await {
                            warn!(message_id = id.0, "read receipt not sent: {err}");
                        }
                    }
                }
                _ = typing_expiry(deadline) => {
                    if lock(&reconciler).expire_typing(Instant::now()) {
                        debug!("typing indicator expired");
                    }
                }
            }
        }
    })
}

async fn typing_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
