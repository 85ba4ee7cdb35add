use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use shared::protocol::{IceCandidate, SessionDescription};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Camera/microphone tracks captured for one call. `stop` releases the
/// devices; implementations must tolerate repeated calls.
pub trait LocalMediaStream: Send + Sync {
    fn kinds(&self) -> Vec<MediaKind>;
    fn stop(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> anyhow::Result<Arc<dyn LocalMediaStream>>;
}

pub struct UnavailableMediaDevices;

#[async_trait]
impl MediaDevices for UnavailableMediaDevices {
    async fn acquire(
        &self,
        _constraints: MediaConstraints,
    ) -> anyhow::Result<Arc<dyn LocalMediaStream>> {
        Err(anyhow!("no media capture backend is available"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerConnectionEvent {
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteTrack { kind: MediaKind },
}

#[derive(Clone)]
pub struct PeerConnectionOptions {
    pub ice_servers: Vec<String>,
    pub local_media: Arc<dyn LocalMediaStream>,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, description: SessionDescription)
        -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<PeerConnectionEvent>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        options: PeerConnectionOptions,
    ) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

pub struct UnavailablePeerConnectionFactory;

#[async_trait]
impl PeerConnectionFactory for UnavailablePeerConnectionFactory {
    async fn create(
        &self,
        _options: PeerConnectionOptions,
    ) -> anyhow::Result<Arc<dyn PeerConnection>> {
        Err(anyhow!("no peer connection backend is available"))
    }
}
