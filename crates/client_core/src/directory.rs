//! User directory and message history, served over plain HTTP next to the
//! realtime relay.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::Serialize;
use shared::domain::{MessageType, StoredMessage, UserId, UserSummary};
use tracing::debug;

/// A recorded voice or video clip to deliver through the history service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    pub receiver_id: UserId,
    pub message_type: MessageType,
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl MediaUpload {
    pub fn video(receiver_id: UserId, bytes: Vec<u8>) -> Self {
        Self {
            receiver_id,
            message_type: MessageType::Video,
            filename: "recording.webm".to_string(),
            mime_type: "video/webm".to_string(),
            bytes,
        }
    }

    pub fn voice(receiver_id: UserId, bytes: Vec<u8>) -> Self {
        Self {
            receiver_id,
            message_type: MessageType::Voice,
            filename: "recording.webm".to_string(),
            mime_type: "audio/webm".to_string(),
            bytes,
        }
    }
}

#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn list_users(&self) -> Result<Vec<UserSummary>>;
    async fn fetch_history(&self, peer: UserId) -> Result<Vec<StoredMessage>>;
    async fn upload_media(&self, upload: MediaUpload) -> Result<StoredMessage>;
}

pub struct MissingDirectoryService;

#[async_trait]
impl DirectoryService for MissingDirectoryService {
    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        Err(anyhow!("directory service is unavailable"))
    }

    async fn fetch_history(&self, _peer: UserId) -> Result<Vec<StoredMessage>> {
        Err(anyhow!("history service is unavailable"))
    }

    async fn upload_media(&self, _upload: MediaUpload) -> Result<StoredMessage> {
        Err(anyhow!("media upload is unavailable"))
    }
}

#[derive(Serialize)]
struct HistoryQuery {
    receiver_id: i64,
}

pub struct HttpDirectory {
    http: Client,
    server_url: String,
    token: String,
}

impl HttpDirectory {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl DirectoryService for HttpDirectory {
    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        let users: Vec<UserSummary> = self
            .http
            .get(format!("{}/users/", self.server_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("failed to request user list")?
            .error_for_status()?
            .json()
            .await
            .context("invalid user list payload")?;
        debug!(count = users.len(), "directory: users loaded");
        Ok(users)
    }

    async fn fetch_history(&self, peer: UserId) -> Result<Vec<StoredMessage>> {
        let messages: Vec<StoredMessage> = self
            .http
            .get(format!("{}/messages/", self.server_url))
            .query(&HistoryQuery {
                receiver_id: peer.0,
            })
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("failed to request history with user {peer}"))?
            .error_for_status()?
            .json()
            .await
            .context("invalid history payload")?;
        debug!(peer = peer.0, count = messages.len(), "directory: history loaded");
        Ok(messages)
    }

    async fn upload_media(&self, upload: MediaUpload) -> Result<StoredMessage> {
        let file = multipart::Part::bytes(upload.bytes)
            .file_name(upload.filename)
            .mime_str(&upload.mime_type)
            .context("invalid media mime type")?;
        let form = multipart::Form::new()
            .part("file", file)
            .text("receiver_id", upload.receiver_id.to_string())
            .text("message_type", upload.message_type.as_str());
        let stored: StoredMessage = self
            .http
            .post(format!("{}/messages/", self.server_url))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .context("failed to upload media message")?
            .error_for_status()?
            .json()
            .await
            .context("invalid media upload response")?;
        Ok(stored)
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
