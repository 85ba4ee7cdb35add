//! Hand-written collaborators shared by the client_core test modules.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rtc_integration::{
    LocalMediaStream, MediaConstraints, MediaDevices, MediaKind, PeerConnection,
    PeerConnectionEvent, PeerConnectionFactory, PeerConnectionOptions,
};
use shared::{
    domain::{MessageId, MessageType, StoredMessage, UserId, UserStatus, UserSummary},
    protocol::{ChatMessage, IceCandidate, SessionDescription, SignalPayload},
};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::{
    directory::{DirectoryService, MediaUpload},
    error::SendError,
    presentation::{CallDecision, Presentation},
    signaling::SignalSink,
};

/// Polls `check` between scheduler yields until it holds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never held: {what}");
}

pub struct FakeStream {
    stops: Arc<AtomicUsize>,
}

impl LocalMediaStream for FakeStream {
    fn kinds(&self) -> Vec<MediaKind> {
        vec![MediaKind::Audio, MediaKind::Video]
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeMedia {
    acquisitions: AtomicUsize,
    stops: Arc<AtomicUsize>,
    fail: bool,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeMedia {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Acquisition blocks until the returned sender fires.
    pub fn gated() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let media = Self {
            gate: Mutex::new(Some(rx)),
            ..Self::default()
        };
        (media, tx)
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeMedia {
    async fn acquire(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<Arc<dyn LocalMediaStream>> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail {
            return Err(anyhow!("permission denied"));
        }
        Ok(Arc::new(FakeStream {
            stops: Arc::clone(&self.stops),
        }))
    }
}

pub struct FakePeerConnection {
    calls: Arc<Mutex<Vec<String>>>,
    events: broadcast::Sender<PeerConnectionEvent>,
    fail_remote_description: bool,
    gathered_on_local_description: Vec<String>,
}

impl FakePeerConnection {
    pub fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.calls.lock().await.push("create_offer".to_string());
        Ok(SessionDescription::offer("local-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.calls.lock().await.push("create_answer".to_string());
        Ok(SessionDescription::answer("local-answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(format!("set_local:{}", description.sdp));
        // Gathering starts as soon as the local description is in place.
        for candidate in &self.gathered_on_local_description {
            self.emit(PeerConnectionEvent::LocalCandidate(IceCandidate::new(
                candidate.as_str(),
            )));
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(format!("set_remote:{}", description.sdp));
        if self.fail_remote_description {
            return Err(anyhow!("malformed remote description"));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.calls.lock().await.push("close".to_string());
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerConnectionEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct FakePeers {
    calls: Arc<Mutex<Vec<String>>>,
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    fail_remote_description: bool,
    gathered_on_local_description: Vec<String>,
}

impl FakePeers {
    pub fn rejecting_remote_descriptions() -> Self {
        Self {
            fail_remote_description: true,
            ..Self::default()
        }
    }

    /// Each connection emits `candidates` while its local description is
    /// being applied.
    pub fn gathering(candidates: &[&str]) -> Self {
        Self {
            gathered_on_local_description: candidates.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    pub async fn created(&self) -> usize {
        self.created.lock().await.len()
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn latest(&self) -> Arc<FakePeerConnection> {
        self.created
            .lock()
            .await
            .last()
            .cloned()
            .expect("a peer connection was created")
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeers {
    async fn create(&self, _options: PeerConnectionOptions) -> Result<Arc<dyn PeerConnection>> {
        let (events, _) = broadcast::channel(16);
        let pc = Arc::new(FakePeerConnection {
            calls: Arc::clone(&self.calls),
            events,
            fail_remote_description: self.fail_remote_description,
            gathered_on_local_description: self.gathered_on_local_description.clone(),
        });
        self.created.lock().await.push(Arc::clone(&pc));
        Ok(pc)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(UserId, SignalPayload)>>,
}

impl RecordingSink {
    pub async fn sent(&self) -> Vec<(UserId, SignalPayload)> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, peer: UserId) -> Vec<SignalPayload> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(to, _)| *to == peer)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl SignalSink for RecordingSink {
    async fn send_signal(&self, to: UserId, payload: SignalPayload) -> Result<(), SendError> {
        self.sent.lock().await.push((to, payload));
        Ok(())
    }
}

/// Records every presentation call as a short line. Incoming-call prompts
/// resolve with `decision`, or never when it is `None`.
#[derive(Default)]
pub struct RecordingPresentation {
    lines: std::sync::Mutex<Vec<String>>,
    decision: Option<CallDecision>,
}

impl RecordingPresentation {
    pub fn deciding(decision: CallDecision) -> Self {
        Self {
            decision: Some(decision),
            ..Self::default()
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("presentation lock").clone()
    }

    fn record(&self, line: String) {
        self.lines.lock().expect("presentation lock").push(line);
    }
}

#[async_trait]
impl Presentation for RecordingPresentation {
    fn render_message(&self, message: &ChatMessage) {
        self.record(format!(
            "message:{}->{}:{}",
            message.from_user, message.to_user, message.content
        ));
    }

    fn render_history(&self, peer: UserId, messages: &[StoredMessage]) {
        self.record(format!("history:{peer}:{}", messages.len()));
    }

    fn render_user_list(&self, users: &[UserSummary]) {
        let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
        self.record(format!("users:{}", names.join(",")));
    }

    fn render_user_status(&self, user_id: UserId, status: UserStatus) {
        self.record(format!("status:{user_id}:{status:?}"));
    }

    fn show_error(&self, text: &str) {
        self.record(format!("error:{text}"));
    }

    async fn show_incoming_call(&self, peer: UserId) -> CallDecision {
        self.record(format!("incoming:{peer}"));
        match self.decision {
            Some(decision) => decision,
            None => std::future::pending().await,
        }
    }

    fn update_call_status(&self, text: &str) {
        self.record(format!("call:{text}"));
    }
}

pub fn user(id: i64, username: &str) -> UserSummary {
    UserSummary {
        id: UserId(id),
        username: username.to_string(),
        email: None,
    }
}

pub fn stored(id: i64, from: i64, to: i64, content: &str) -> StoredMessage {
    StoredMessage {
        id: MessageId(id),
        sender_id: UserId(from),
        receiver_id: UserId(to),
        message_type: MessageType::Text,
        content: Some(content.to_string()),
        media_file: None,
        created_at: None,
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    pub users: Vec<UserSummary>,
    pub history: Vec<StoredMessage>,
    pub history_requests: Mutex<Vec<UserId>>,
    pub uploads: Mutex<Vec<MediaUpload>>,
    /// When set, `list_users` waits until the paired sender fires.
    pub users_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl DirectoryService for FakeDirectory {
    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        let gate = self.users_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self.users.clone())
    }

    async fn fetch_history(&self, peer: UserId) -> Result<Vec<StoredMessage>> {
        self.history_requests.lock().await.push(peer);
        Ok(self
            .history
            .iter()
            .filter(|m| m.sender_id == peer || m.receiver_id == peer)
            .cloned()
            .collect())
    }

    async fn upload_media(&self, upload: MediaUpload) -> Result<StoredMessage> {
        let stored = StoredMessage {
            id: MessageId(900),
            sender_id: UserId(1),
            receiver_id: upload.receiver_id,
            message_type: upload.message_type,
            content: None,
            media_file: Some(format!("uploads/{}", upload.filename)),
            created_at: None,
        };
        self.uploads.lock().await.push(upload);
        Ok(stored)
    }
}
