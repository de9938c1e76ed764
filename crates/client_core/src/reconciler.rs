use std::time::{Duration, Instant};

use shared::{
    domain::{MessageId, UserId},
    protocol::{MessagePayload, ServerFrame},
};
use tracing::debug;

/// A typing indicator with no refresh for this long is cleared.
pub const TYPING_QUIET_WINDOW: Duration = Duration::from_millis(4000);
/// Local composing pauses this long before a stop-typing frame goes out.
pub const COMPOSE_IDLE_WINDOW: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingState {
    pub user_id: UserId,
    pub username: String,
    pub expires_at: Instant,
}

/// Merges the three message sources for the selected counterpart (history
/// fetch, counterpart pushes, local-send echoes) into one timeline, unique
/// by message id, first arrival wins. Pure and synchronous: methods return
/// the read-receipt sends that fell due, and timers are the caller's job
/// (the typing deadline is exposed as an `Instant`).
#[derive(Default)]
pub struct ConversationReconciler {
    peer: Option<UserId>,
    timeline: Vec<MessagePayload>,
    typing: Option<TypingState>,
}

impl ConversationReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer(&self) -> Option<UserId> {
        self.peer
    }

    pub fn timeline(&self) -> &[MessagePayload] {
        &self.timeline
    }

    pub fn typing(&self) -> Option<&TypingState> {
        self.typing.as_ref()
    }

    pub fn typing_deadline(&self) -> Option<Instant> {
        self.typing.as_ref().map(|state| state.expires_at)
    }

    /// Switches the active counterpart. The previous timeline is discarded;
    /// there is no cross-conversation cache.
    pub fn select_peer(&mut self, peer: UserId) {
        if self.peer != Some(peer) {
            debug!(peer_id = peer.0, "reconciler: switching conversation");
        }
        self.peer = Some(peer);
        self.timeline.clear();
        self.typing = None;
    }

    /// Merges a history fetch into the timeline. Returns the ids that now
    /// owe a read receipt: newly inserted, counterpart-authored, unread.
    pub fn apply_history(&mut self, messages: &[MessagePayload]) -> Vec<MessageId> {
        let mut receipts = Vec::new();
        for message in messages {
            if !self.involves_peer(message) {
                continue;
            }
            if self.insert(message) && self.receipt_due(message) {
                receipts.push(message.id);
            }
        }
        receipts
    }

    /// Applies one inbound frame. `now` anchors the typing quiet window.
    /// Returns read-receipt sends that fell due.
    pub fn apply_frame(&mut self, frame: &ServerFrame, now: Instant) -> Vec<MessageId> {
        match frame {
            ServerFrame::ChatMessage { message, .. } | ServerFrame::MessageSent { message } => {
                if !self.involves_peer(message) {
                    return Vec::new();
                }
                if self.insert(message) && self.receipt_due(message) {
                    return vec![message.id];
                }
                Vec::new()
            }
            ServerFrame::TypingIndicator {
                sender_id,
                sender_username,
                is_typing,
            } => {
                if self.peer == Some(*sender_id) {
                    self.typing = is_typing.then(|| TypingState {
                        user_id: *sender_id,
                        username: sender_username.clone(),
                        expires_at: now + TYPING_QUIET_WINDOW,
                    });
                }
                Vec::new()
            }
            ServerFrame::ReadReceipt { message_id, .. } => {
                self.mark_read(*message_id);
                Vec::new()
            }
            ServerFrame::Connection { .. } | ServerFrame::Error { .. } => Vec::new(),
        }
    }

    /// Flips `is_read` on a known id; unknown ids are a no-op and the
    /// transition never reverts.
    pub fn mark_read(&mut self, id: MessageId) {
        match self.timeline.iter_mut().find(|message| message.id == id) {
            Some(message) => message.is_read = true,
            None => debug!(message_id = id.0, "reconciler: receipt for unknown message"),
        }
    }

    /// The view became visible again: every still-unread counterpart
    /// message owes a (possibly duplicate) read receipt.
    pub fn visibility_resumed(&self) -> Vec<MessageId> {
        self.timeline
            .iter()
            .filter(|message| self.receipt_due(message))
            .map(|message| message.id)
            .collect()
    }

    /// Clears the typing indicator if its quiet window has elapsed.
    /// Returns true when the indicator was cleared.
    pub fn expire_typing(&mut self, now: Instant) -> bool {
        match &self.typing {
            Some(state) if state.expires_at <= now => {
                self.typing = None;
                true
            }
            _ => false,
        }
    }

    fn involves_peer(&self, message: &MessagePayload) -> bool {
        match self.peer {
            Some(peer) => message.sender_id == peer || message.receiver_id == peer,
            None => false,
        }
    }

    fn insert(&mut self, message: &MessagePayload) -> bool {
        if self.timeline.iter().any(|existing| existing.id == message.id) {
            return false;
        }
        self.timeline.push(message.clone());
        true
    }

    fn receipt_due(&self, message: &MessagePayload) -> bool {
        self.peer == Some(message.sender_id) && !message.is_read
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
