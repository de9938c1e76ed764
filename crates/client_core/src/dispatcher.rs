use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
};

use shared::protocol::ServerFrame;
use tracing::error;

/// Event names the registry keys handlers by; one per inbound frame type
/// plus the unrecognized-frame passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChatMessage,
    MessageSent,
    TypingIndicator,
    ReadReceipt,
    Connection,
    Error,
    UnknownMessage,
}

/// Payload delivered to handlers: a parsed server frame, or the raw value of
/// a frame whose `type` the client does not recognize.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Frame(ServerFrame),
    Unknown {
        kind: String,
        raw: serde_json::Value,
    },
}

impl RealtimeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Frame(ServerFrame::ChatMessage { .. }) => EventKind::ChatMessage,
            Self::Frame(ServerFrame::MessageSent { .. }) => EventKind::MessageSent,
            Self::Frame(ServerFrame::TypingIndicator { .. }) => EventKind::TypingIndicator,
            Self::Frame(ServerFrame::ReadReceipt { .. }) => EventKind::ReadReceipt,
            Self::Frame(ServerFrame::Connection { .. }) => EventKind::Connection,
            Self::Frame(ServerFrame::Error { .. }) => EventKind::Error,
            Self::Unknown { .. } => EventKind::UnknownMessage,
        }
    }
}

pub type Handler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

/// Publish/subscribe registry decoupling the realtime connection from its
/// consumers. Handlers run synchronously in registration order; a handler
/// registered twice fires once; a panicking handler is contained.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Mutex<HashMap<EventKind, Vec<Handler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: Handler) {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = handlers.entry(kind).or_default();
        if entry.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            return;
        }
        entry.push(handler);
    }

    pub fn unsubscribe(&self, kind: EventKind, handler: &Handler) {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = handlers.get_mut(&kind) {
            entry.retain(|existing| !Arc::ptr_eq(existing, handler));
        }
    }

    /// Fire-and-forget delivery to every handler currently registered for
    /// the event's kind. The handler list is snapshotted first, so handlers
    /// may re-enter subscribe/unsubscribe without deadlocking.
    pub fn publish(&self, event: &RealtimeEvent) {
        let snapshot: Vec<Handler> = {
            let handlers = self
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            handlers.get(&event.kind()).cloned().unwrap_or_default()
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(kind = ?event.kind(), "event handler panicked; continuing with remaining handlers");
            }
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
