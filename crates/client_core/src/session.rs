//! Per-login state shared by the connection, router and signaling layers.
//!
//! A [`SessionContext`] is created when the user authenticates and torn
//! down with [`SessionContext::teardown`] on logout; nothing in it outlives
//! the session.

use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{UserId, UserSummary},
    protocol::ChatMessage,
};
use tokio::sync::{Mutex, RwLock};

use crate::signaling::CallSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub token: String,
}

impl Identity {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}

/// The peer shown in the chat view. Holds only the id; the name is looked
/// up in the directory on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPeer {
    pub id: UserId,
    pub username: Option<String>,
}

pub struct SessionContext {
    identity: Identity,
    selected_peer: RwLock<Option<UserId>>,
    directory: RwLock<HashMap<UserId, UserSummary>>,
    unread: Mutex<HashMap<UserId, u32>>,
    active_call: RwLock<Option<CallSnapshot>>,
}

impl SessionContext {
    pub fn new(identity: Identity) -> Arc<Self> {
        Arc::new(Self {
            identity,
            selected_peer: RwLock::new(None),
            directory: RwLock::new(HashMap::new()),
            unread: Mutex::new(HashMap::new()),
            active_call: RwLock::new(None),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    pub async fn select_peer(&self, peer: UserId) -> SelectedPeer {
        *self.selected_peer.write().await = Some(peer);
        self.unread.lock().await.remove(&peer);
        SelectedPeer {
            id: peer,
            username: self.username(peer).await,
        }
    }

    pub async fn selected_peer(&self) -> Option<SelectedPeer> {
        let id = (*self.selected_peer.read().await)?;
        Some(SelectedPeer {
            id,
            username: self.username(id).await,
        })
    }

    pub async fn selected_peer_id(&self) -> Option<UserId> {
        *self.selected_peer.read().await
    }

    /// Stores the directory listing, minus the current user, and returns
    /// what was kept.
    pub async fn replace_directory(&self, users: Vec<UserSummary>) -> Vec<UserSummary> {
        let own_id = self.user_id();
        let visible: Vec<UserSummary> = users.into_iter().filter(|u| u.id != own_id).collect();
        let mut directory = self.directory.write().await;
        directory.clear();
        directory.extend(visible.iter().cloned().map(|u| (u.id, u)));
        visible
    }

    pub async fn username(&self, user_id: UserId) -> Option<String> {
        self.directory
            .read()
            .await
            .get(&user_id)
            .map(|u| u.username.clone())
    }

    /// Display name for logs and status lines.
    pub async fn display_name(&self, user_id: UserId) -> String {
        self.username(user_id)
            .await
            .unwrap_or_else(|| format!("user {user_id}"))
    }

    /// True when the message belongs in the open conversation.
    pub async fn is_in_view(&self, message: &ChatMessage) -> bool {
        match *self.selected_peer.read().await {
            Some(peer) => message.involves(peer),
            None => false,
        }
    }

    pub async fn note_unread(&self, message: &ChatMessage) {
        if message.from_user == self.user_id() {
            return;
        }
        *self
            .unread
            .lock()
            .await
            .entry(message.from_user)
            .or_insert(0) += 1;
    }

    pub async fn unread_count(&self, peer: UserId) -> u32 {
        self.unread.lock().await.get(&peer).copied().unwrap_or(0)
    }

    pub async fn set_active_call(&self, snapshot: Option<CallSnapshot>) {
        *self.active_call.write().await = snapshot;
    }

    pub async fn active_call(&self) -> Option<CallSnapshot> {
        self.active_call.read().await.clone()
    }

    pub async fn teardown(&self) {
        *self.selected_peer.write().await = None;
        self.directory.write().await.clear();
        self.unread.lock().await.clear();
        *self.active_call.write().await = None;
    }
}
