//! The seam between the core and whatever renders it.

use async_trait::async_trait;
use shared::{
    domain::{StoredMessage, UserId, UserStatus, UserSummary},
    protocol::ChatMessage,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use tokio::sync::{broadcast, oneshot};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDecision {
    Accept,
    Reject,
}

#[async_trait]
pub trait Presentation: Send + Sync {
    fn render_message(&self, message: &ChatMessage);
    fn render_history(&self, peer: UserId, messages: &[StoredMessage]);
    fn render_user_list(&self, users: &[UserSummary]);
    fn render_user_status(&self, user_id: UserId, status: UserStatus);
    fn show_error(&self, text: &str);
    /// Resolves once the user picks accept or reject for a ringing call.
    async fn show_incoming_call(&self, peer: UserId) -> CallDecision;
    fn update_call_status(&self, text: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    MessageReceived(ChatMessage),
    HistoryLoaded {
        peer: UserId,
        messages: Vec<StoredMessage>,
    },
    UserListUpdated(Vec<UserSummary>),
    UserStatusChanged {
        user_id: UserId,
        status: UserStatus,
    },
    IncomingCall {
        peer: UserId,
    },
    CallStatus(String),
    Error(String),
}

/// Fans presentation calls out as [`ClientEvent`]s. Incoming-call prompts
/// stay pending until [`BroadcastPresentation::decide_incoming_call`], or
/// until the call they belong to ends and the prompt is dropped.
pub struct BroadcastPresentation {
    events: broadcast::Sender<ClientEvent>,
    pending_decision: Mutex<Option<PendingPrompt>>,
    next_prompt: AtomicU64,
}

struct PendingPrompt {
    id: u64,
    tx: oneshot::Sender<CallDecision>,
}

/// Forgets prompt `id` when its `show_incoming_call` future goes away,
/// whether it was answered or aborted.
struct PromptGuard<'a> {
    pending: &'a Mutex<Option<PendingPrompt>>,
    id: u64,
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            if pending.as_ref().is_some_and(|p| p.id == self.id) {
                pending.take();
                debug!(prompt = self.id, "presentation: incoming-call prompt withdrawn");
            }
        }
    }
}

impl BroadcastPresentation {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            pending_decision: Mutex::new(None),
            next_prompt: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Returns false when no prompt is waiting.
    pub async fn decide_incoming_call(&self, decision: CallDecision) -> bool {
        let pending = self.take_pending();
        match pending {
            Some(prompt) => prompt.tx.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn has_pending_prompt(&self) -> bool {
        self.pending_decision
            .lock()
            .is_ok_and(|pending| pending.is_some())
    }

    fn take_pending(&self) -> Option<PendingPrompt> {
        self.pending_decision
            .lock()
            .ok()
            .and_then(|mut pending| pending.take())
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Presentation for BroadcastPresentation {
    fn render_message(&self, message: &ChatMessage) {
        self.emit(ClientEvent::MessageReceived(message.clone()));
    }

    fn render_history(&self, peer: UserId, messages: &[StoredMessage]) {
        self.emit(ClientEvent::HistoryLoaded {
            peer,
            messages: messages.to_vec(),
        });
    }

    fn render_user_list(&self, users: &[UserSummary]) {
        self.emit(ClientEvent::UserListUpdated(users.to_vec()));
    }

    fn render_user_status(&self, user_id: UserId, status: UserStatus) {
        self.emit(ClientEvent::UserStatusChanged { user_id, status });
    }

    fn show_error(&self, text: &str) {
        self.emit(ClientEvent::Error(text.to_string()));
    }

    async fn show_incoming_call(&self, peer: UserId) -> CallDecision {
        let (tx, rx) = oneshot::channel();
        let id = self.next_prompt.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = match self.pending_decision.lock() {
            Ok(mut pending) => pending.replace(PendingPrompt { id, tx }).is_some(),
            Err(_) => return CallDecision::Reject,
        };
        if replaced {
            debug!(peer = peer.0, "presentation: replaced stale incoming-call prompt");
        }
        let _guard = PromptGuard {
            pending: &self.pending_decision,
            id,
        };
        self.emit(ClientEvent::IncomingCall { peer });
        rx.await.unwrap_or(CallDecision::Reject)
    }

    fn update_call_status(&self, text: &str) {
        self.emit(ClientEvent::CallStatus(text.to_string()));
    }
}
