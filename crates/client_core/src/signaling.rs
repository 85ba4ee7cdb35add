//! Offer/answer/candidate negotiation for a single one-to-one call.
//!
//! The machine owns at most one call session. Every step that suspends
//! (media capture, offer/answer creation, description application) re-enters
//! the session through its [`CallId`] afterwards and gives up if the call was
//! ended or replaced in the meantime, so hangup and reject never wait for an
//! in-flight accept.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use rtc_integration::{
    LocalMediaStream, MediaConstraints, MediaDevices, PeerConnection, PeerConnectionEvent,
    PeerConnectionFactory, PeerConnectionOptions, PeerConnectionState,
};
use shared::{
    domain::UserId,
    protocol::{IceCandidate, SessionDescription, SignalPayload},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    candidate_buffer::CandidateBuffer,
    error::{CallError, SendError},
    presentation::{CallDecision, Presentation},
    session::SessionContext,
};

pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Where outbound signaling frames go.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_signal(&self, to: UserId, payload: SignalPayload) -> Result<(), SendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Inviting,
    Accepted,
    Negotiating,
    Active,
    Rejected,
    Cancelled,
    Terminated,
}

impl CallPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Cancelled | Self::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub id: CallId,
    pub peer: UserId,
    pub direction: CallDirection,
    pub phase: CallPhase,
    pub remote_description_set: bool,
    pub buffered_candidates: usize,
}

#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub constraints: MediaConstraints,
    pub ice_servers: Vec<String>,
    /// Calls that are not active after this long are ended. `None` disables.
    pub negotiation_timeout: Option<Duration>,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::default(),
            ice_servers: Vec::new(),
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Hangup,
    Declined,
    RemoteRejected,
    MediaUnavailable,
    Failed,
    ConnectionLost,
    TimedOut,
}

impl Ending {
    fn applies_to(self, call: &CallSession) -> bool {
        match self {
            Self::TimedOut => call.phase != CallPhase::Active,
            _ => true,
        }
    }

    /// Terminal phase to enter and whether the peer should be told.
    fn outcome(self, call: &CallSession) -> (CallPhase, bool) {
        let unanswered_outbound = call.direction == CallDirection::Outbound
            && matches!(call.phase, CallPhase::Idle | CallPhase::Inviting);
        // An outbound call still in Idle has not sent its offer yet.
        let peer_aware =
            !(call.direction == CallDirection::Outbound && call.phase == CallPhase::Idle);
        match self {
            Self::Hangup | Self::TimedOut if unanswered_outbound => {
                (CallPhase::Cancelled, peer_aware)
            }
            Self::Hangup | Self::TimedOut | Self::Declined | Self::Failed => {
                (CallPhase::Terminated, peer_aware)
            }
            Self::MediaUnavailable => (CallPhase::Rejected, peer_aware),
            Self::RemoteRejected | Self::ConnectionLost => (CallPhase::Terminated, false),
        }
    }

    fn status_line(self) -> &'static str {
        match self {
            Self::Hangup => "Call ended",
            Self::Declined => "Call declined",
            Self::RemoteRejected => "Call was declined or ended by the other side",
            Self::MediaUnavailable => "Call declined: camera/microphone unavailable",
            Self::Failed => "Call failed",
            Self::ConnectionLost => "Call ended: connection lost",
            Self::TimedOut => "Call timed out",
        }
    }
}

struct CallSession {
    id: CallId,
    peer: UserId,
    direction: CallDirection,
    phase: CallPhase,
    held_offer: Option<SessionDescription>,
    candidates: CandidateBuffer,
    remote_description_set: bool,
    /// Local candidates gathered before the peer has our description.
    local_candidates: CandidateBuffer,
    local_description_sent: bool,
    local_media: Option<Arc<dyn LocalMediaStream>>,
    peer_connection: Option<Arc<dyn PeerConnection>>,
    ring_task: Option<JoinHandle<()>>,
    negotiation_timer: Option<JoinHandle<()>>,
    peer_events_task: Option<JoinHandle<()>>,
}

impl CallSession {
    fn new(id: CallId, peer: UserId, direction: CallDirection, phase: CallPhase) -> Self {
        Self {
            id,
            peer,
            direction,
            phase,
            held_offer: None,
            candidates: CandidateBuffer::new(),
            remote_description_set: false,
            local_candidates: CandidateBuffer::new(),
            // The caller already has a session before our answer goes out.
            local_description_sent: direction == CallDirection::Inbound,
            local_media: None,
            peer_connection: None,
            ring_task: None,
            negotiation_timer: None,
            peer_events_task: None,
        }
    }

    fn is_live(&self) -> bool {
        !self.phase.is_terminal()
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            id: self.id,
            peer: self.peer,
            direction: self.direction,
            phase: self.phase,
            remote_description_set: self.remote_description_set,
            buffered_candidates: self.candidates.len(),
        }
    }

    /// Enters `phase` and hands back every owned resource. A second call
    /// finds nothing left to release.
    fn end(&mut self, phase: CallPhase) -> Released {
        self.phase = phase;
        self.held_offer = None;
        self.remote_description_set = false;
        let dropped = self.candidates.clear();
        let held = self.local_candidates.clear();
        if dropped > 0 || held > 0 {
            debug!(
                call = self.id.0,
                dropped,
                held,
                "signaling: discarded buffered candidates"
            );
        }
        for task in [
            self.ring_task.take(),
            self.negotiation_timer.take(),
            self.peer_events_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        Released {
            media: self.local_media.take(),
            peer_connection: self.peer_connection.take(),
        }
    }
}

struct Released {
    media: Option<Arc<dyn LocalMediaStream>>,
    peer_connection: Option<Arc<dyn PeerConnection>>,
}

impl Released {
    async fn release(self) {
        if let Some(media) = self.media {
            media.stop();
        }
        if let Some(peer_connection) = self.peer_connection {
            if let Err(err) = peer_connection.close().await {
                warn!(error = %format!("{err:#}"), "signaling: closing peer connection failed");
            }
        }
    }
}

fn live_call(slot: &mut Option<CallSession>, id: CallId) -> Option<&mut CallSession> {
    slot.as_mut().filter(|call| call.id == id && call.is_live())
}

pub struct SignalingMachine {
    session: Arc<SessionContext>,
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    sink: Arc<dyn SignalSink>,
    presentation: Arc<dyn Presentation>,
    options: SignalingOptions,
    slot: Mutex<Option<CallSession>>,
    next_call_id: AtomicU64,
}

impl SignalingMachine {
    pub fn new(
        session: Arc<SessionContext>,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        sink: Arc<dyn SignalSink>,
        presentation: Arc<dyn Presentation>,
        options: SignalingOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            media,
            peers,
            sink,
            presentation,
            options,
            slot: Mutex::new(None),
            next_call_id: AtomicU64::new(0),
        })
    }

    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        self.slot.lock().await.as_ref().map(CallSession::snapshot)
    }

    /// Places a call to `peer`: captures media, creates the peer connection
    /// and sends the offer.
    pub async fn start_call(self: &Arc<Self>, peer: UserId) -> Result<CallId, CallError> {
        let id = {
            let mut slot = self.slot.lock().await;
            let busy_with = slot.as_ref().filter(|c| c.is_live()).map(|c| c.peer);
            if let Some(busy_with) = busy_with {
                return Err(CallError::Busy { peer: busy_with });
            }
            let call = CallSession::new(
                self.new_call_id(),
                peer,
                CallDirection::Outbound,
                CallPhase::Idle,
            );
            let id = call.id;
            self.session.set_active_call(Some(call.snapshot())).await;
            *slot = Some(call);
            id
        };
        info!(call = id.0, peer = peer.0, "signaling: placing call");
        let name = self.session.display_name(peer).await;
        self.presentation
            .update_call_status(&format!("Calling {name}..."));

        let media = match self.media.acquire(self.options.constraints).await {
            Ok(media) => media,
            Err(err) => {
                {
                    let mut slot = self.slot.lock().await;
                    let still_idle = slot
                        .as_ref()
                        .is_some_and(|c| c.id == id && c.phase == CallPhase::Idle);
                    if still_idle {
                        *slot = None;
                        self.session.set_active_call(None).await;
                    }
                }
                let error = CallError::Media(format!("{err:#}"));
                warn!(call = id.0, %error, "signaling: outbound call aborted");
                self.presentation.show_error(&error.to_string());
                return Err(error);
            }
        };

        let pc = self.attach_media_and_connect(id, media).await?;
        let offer = self.step(id, pc.create_offer()).await?;
        self.step(id, pc.set_local_description(offer.clone())).await?;
        self.update_phase(id, CallPhase::Inviting).await?;

        if let Err(err) = self
            .sink
            .send_signal(peer, SignalPayload::SessionOffer(offer))
            .await
        {
            warn!(call = id.0, %err, "signaling: could not send offer");
            self.end_call(id, Ending::Failed).await;
            return Err(err.into());
        }
        self.release_local_candidates(id, peer).await?;
        self.arm_negotiation_timeout(id).await;
        Ok(id)
    }

    /// Accepts the call that is currently ringing.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let id = self.ringing_call().await?;
        self.accept_call_id(id).await
    }

    /// Declines the call that is currently ringing. No media is captured.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let id = self.ringing_call().await?;
        self.reject_call_id(id).await
    }

    /// Ends the live call, if any. Calling it again is a no-op.
    pub async fn hangup(&self) {
        match self.live_call_id().await {
            Some(id) => {
                self.end_call(id, Ending::Hangup).await;
            }
            None => debug!("signaling: hangup with no live call"),
        }
    }

    /// The transport went away; a live call cannot continue negotiating.
    pub async fn on_connection_closed(&self) {
        if let Some(id) = self.live_call_id().await {
            self.end_call(id, Ending::ConnectionLost).await;
        }
    }

    pub async fn handle_signal(self: &Arc<Self>, from: UserId, payload: SignalPayload) {
        debug!(from = from.0, kind = payload.label(), "signaling: inbound signal");
        match payload {
            SignalPayload::SessionOffer(offer) => self.on_offer(from, offer).await,
            SignalPayload::SessionAnswer(answer) => self.on_answer(from, answer).await,
            SignalPayload::IceCandidate(candidate) => self.on_candidate(from, candidate).await,
            SignalPayload::Rejected => self.on_rejected(from).await,
        }
    }

    async fn on_offer(self: &Arc<Self>, from: UserId, offer: SessionDescription) {
        let (busy_with, rung) = {
            let mut slot = self.slot.lock().await;
            let busy_with = slot.as_ref().filter(|c| c.is_live()).map(|c| c.peer);
            if busy_with.is_some() {
                (busy_with, None)
            } else {
                let mut call = CallSession::new(
                    self.new_call_id(),
                    from,
                    CallDirection::Inbound,
                    CallPhase::Inviting,
                );
                call.held_offer = Some(offer);
                let id = call.id;
                self.session.set_active_call(Some(call.snapshot())).await;
                *slot = Some(call);
                (None, Some(id))
            }
        };

        match (busy_with, rung) {
            (Some(current), _) if current == from => {
                warn!(from = from.0, "signaling: repeated offer from current peer dropped");
            }
            (Some(current), _) => {
                info!(
                    from = from.0,
                    current = current.0,
                    "signaling: busy, rejecting incoming offer"
                );
                if let Err(err) = self.sink.send_signal(from, SignalPayload::Rejected).await {
                    debug!(%err, "signaling: could not send busy rejection");
                }
            }
            (None, Some(id)) => {
                info!(call = id.0, from = from.0, "signaling: incoming call");
                let name = self.session.display_name(from).await;
                self.presentation
                    .update_call_status(&format!("Incoming call from {name}"));
                self.start_ringing(id, from).await;
                self.arm_negotiation_timeout(id).await;
            }
            (None, None) => {}
        }
    }

    async fn on_answer(self: &Arc<Self>, from: UserId, answer: SessionDescription) {
        let target = {
            let slot = self.slot.lock().await;
            match slot.as_ref().filter(|c| c.is_live() && c.peer == from) {
                Some(call)
                    if call.direction == CallDirection::Outbound
                        && call.phase == CallPhase::Inviting =>
                {
                    call.peer_connection.clone().map(|pc| (call.id, pc))
                }
                Some(call) => {
                    warn!(
                        call = call.id.0,
                        phase = ?call.phase,
                        "signaling: unexpected answer dropped"
                    );
                    None
                }
                None => {
                    debug!(from = from.0, "signaling: answer without a matching call dropped");
                    None
                }
            }
        };
        let Some((id, pc)) = target else {
            return;
        };
        if self.update_phase(id, CallPhase::Negotiating).await.is_err() {
            return;
        }
        if self.step(id, pc.set_remote_description(answer)).await.is_err() {
            return;
        }
        if self.flush_candidates(id, &pc).await.is_err() {
            return;
        }
        let _ = self.mark_active(id).await;
    }

    async fn on_candidate(&self, from: UserId, candidate: IceCandidate) {
        let apply_now = {
            let mut slot = self.slot.lock().await;
            let Some(call) = slot.as_mut().filter(|c| c.is_live() && c.peer == from) else {
                debug!(from = from.0, "signaling: candidate without a matching call dropped");
                return;
            };
            if !call.remote_description_set {
                call.candidates.push(candidate);
                debug!(
                    call = call.id.0,
                    buffered = call.candidates.len(),
                    "signaling: buffered remote candidate"
                );
                return;
            }
            call.peer_connection.clone().map(|pc| (pc, candidate))
        };
        if let Some((pc, candidate)) = apply_now {
            if let Err(err) = pc.add_ice_candidate(candidate).await {
                warn!(error = %format!("{err:#}"), "signaling: remote candidate rejected");
            }
        }
    }

    async fn on_rejected(&self, from: UserId) {
        let id = {
            let slot = self.slot.lock().await;
            slot.as_ref()
                .filter(|c| c.is_live() && c.peer == from)
                .map(|c| c.id)
        };
        match id {
            Some(id) => {
                self.end_call(id, Ending::RemoteRejected).await;
            }
            None => debug!(from = from.0, "signaling: rejection without a matching call dropped"),
        }
    }

    async fn accept_call_id(self: &Arc<Self>, id: CallId) -> Result<(), CallError> {
        let peer = {
            let mut slot = self.slot.lock().await;
            let Some(call) = live_call(&mut slot, id) else {
                return Err(CallError::NoPendingCall);
            };
            if call.direction != CallDirection::Inbound || call.phase != CallPhase::Inviting {
                return Err(CallError::InvalidPhase { phase: call.phase });
            }
            call.phase = CallPhase::Accepted;
            if let Some(task) = call.ring_task.take() {
                task.abort();
            }
            let snapshot = call.snapshot();
            let peer = call.peer;
            self.session.set_active_call(Some(snapshot)).await;
            peer
        };
        info!(call = id.0, peer = peer.0, "signaling: accepting call");
        self.presentation.update_call_status("Connecting...");

        let media = match self.media.acquire(self.options.constraints).await {
            Ok(media) => media,
            Err(err) => {
                let error = CallError::Media(format!("{err:#}"));
                warn!(call = id.0, %error, "signaling: media unavailable, declining");
                if self.end_call(id, Ending::MediaUnavailable).await {
                    self.presentation.show_error(&error.to_string());
                }
                return Err(error);
            }
        };

        let pc = self.attach_media_and_connect(id, media).await?;
        let offer = {
            let mut slot = self.slot.lock().await;
            let Some(call) = live_call(&mut slot, id) else {
                return Err(CallError::Superseded);
            };
            call.phase = CallPhase::Negotiating;
            let offer = call.held_offer.take();
            let snapshot = call.snapshot();
            self.session.set_active_call(Some(snapshot)).await;
            offer
        };
        let Some(offer) = offer else {
            self.end_call(id, Ending::Failed).await;
            return Err(CallError::PeerConnection(
                "no offer held for this call".to_string(),
            ));
        };

        self.step(id, pc.set_remote_description(offer)).await?;
        self.flush_candidates(id, &pc).await?;
        let answer = self.step(id, pc.create_answer()).await?;
        self.step(id, pc.set_local_description(answer.clone())).await?;

        if let Err(err) = self
            .sink
            .send_signal(peer, SignalPayload::SessionAnswer(answer))
            .await
        {
            warn!(call = id.0, %err, "signaling: could not send answer");
            self.end_call(id, Ending::Failed).await;
            return Err(err.into());
        }
        self.mark_active(id).await
    }

    async fn reject_call_id(&self, id: CallId) -> Result<(), CallError> {
        {
            let mut slot = self.slot.lock().await;
            let Some(call) = live_call(&mut slot, id) else {
                return Err(CallError::NoPendingCall);
            };
            if call.direction != CallDirection::Inbound || call.phase != CallPhase::Inviting {
                return Err(CallError::InvalidPhase { phase: call.phase });
            }
        }
        info!(call = id.0, "signaling: declining call");
        self.end_call(id, Ending::Declined).await;
        Ok(())
    }

    /// Spawns the incoming-call prompt. The decision runs in its own task
    /// because accepting aborts the prompt task.
    async fn start_ringing(self: &Arc<Self>, id: CallId, peer: UserId) {
        let machine = Arc::clone(self);
        let task = tokio::spawn(async move {
            let decision = machine.presentation.show_incoming_call(peer).await;
            tokio::spawn(async move {
                let result = match decision {
                    CallDecision::Accept => machine.accept_call_id(id).await,
                    CallDecision::Reject => machine.reject_call_id(id).await,
                };
                if let Err(err) = result {
                    debug!(call = id.0, %err, "signaling: incoming-call decision not applied");
                }
            });
        });
        let mut slot = self.slot.lock().await;
        match live_call(&mut slot, id) {
            Some(call) => call.ring_task = Some(task),
            None => task.abort(),
        }
    }

    async fn arm_negotiation_timeout(self: &Arc<Self>, id: CallId) {
        let Some(timeout) = self.options.negotiation_timeout else {
            return;
        };
        let machine = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Ending the call aborts this timer.
            tokio::spawn(async move {
                if machine.end_call(id, Ending::TimedOut).await {
                    warn!(call = id.0, ?timeout, "signaling: negotiation timed out");
                }
            });
        });
        let mut slot = self.slot.lock().await;
        match live_call(&mut slot, id) {
            Some(call) => {
                if let Some(previous) = call.negotiation_timer.replace(timer) {
                    previous.abort();
                }
            }
            None => timer.abort(),
        }
    }

    async fn attach_media_and_connect(
        self: &Arc<Self>,
        id: CallId,
        media: Arc<dyn LocalMediaStream>,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let attached = {
            let mut slot = self.slot.lock().await;
            match live_call(&mut slot, id) {
                Some(call) => {
                    call.local_media = Some(Arc::clone(&media));
                    true
                }
                None => false,
            }
        };
        if !attached {
            debug!(call = id.0, "signaling: call ended while capturing media");
            media.stop();
            return Err(CallError::Superseded);
        }

        let created = self
            .peers
            .create(PeerConnectionOptions {
                ice_servers: self.options.ice_servers.clone(),
                local_media: media,
            })
            .await;
        let pc = match created {
            Ok(pc) => pc,
            Err(err) => {
                let error = CallError::PeerConnection(format!("{err:#}"));
                if self.end_call(id, Ending::Failed).await {
                    self.presentation.show_error(&error.to_string());
                    return Err(error);
                }
                return Err(CallError::Superseded);
            }
        };

        let events = pc.subscribe_events();
        let adopted = {
            let mut slot = self.slot.lock().await;
            match live_call(&mut slot, id) {
                Some(call) => {
                    let pump =
                        tokio::spawn(Arc::clone(self).pump_peer_events(id, call.peer, events));
                    call.peer_events_task = Some(pump);
                    call.peer_connection = Some(Arc::clone(&pc));
                    true
                }
                None => false,
            }
        };
        if !adopted {
            debug!(call = id.0, "signaling: call ended while creating peer connection");
            Released {
                media: None,
                peer_connection: Some(pc),
            }
            .release()
            .await;
            return Err(CallError::Superseded);
        }
        Ok(pc)
    }

    async fn pump_peer_events(
        self: Arc<Self>,
        id: CallId,
        peer: UserId,
        mut events: broadcast::Receiver<PeerConnectionEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(PeerConnectionEvent::LocalCandidate(candidate)) => {
                    let ready = {
                        let mut slot = self.slot.lock().await;
                        let Some(call) = live_call(&mut slot, id) else {
                            return;
                        };
                        if call.local_description_sent {
                            Some(candidate)
                        } else {
                            call.local_candidates.push(candidate);
                            debug!(
                                call = id.0,
                                held = call.local_candidates.len(),
                                "signaling: holding local candidate until offer is sent"
                            );
                            None
                        }
                    };
                    if let Some(candidate) = ready {
                        self.send_local_candidate(id, peer, candidate).await;
                    }
                }
                Ok(PeerConnectionEvent::StateChanged(state)) => {
                    debug!(call = id.0, ?state, "signaling: peer connection state");
                    if state == PeerConnectionState::Connected {
                        self.presentation.update_call_status("Connected");
                    }
                    if state.is_fatal() {
                        warn!(call = id.0, ?state, "signaling: peer connection lost");
                        // Ending the call aborts this pump.
                        let machine = Arc::clone(&self);
                        tokio::spawn(async move {
                            machine.end_call(id, Ending::Failed).await;
                        });
                        return;
                    }
                }
                Ok(PeerConnectionEvent::RemoteTrack { kind }) => {
                    info!(call = id.0, ?kind, "signaling: remote track attached");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(call = id.0, skipped, "signaling: peer events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Sends held local candidates front to back once the offer is out. As
    /// with remote candidates, the flag flips only when the queue is empty.
    async fn release_local_candidates(&self, id: CallId, peer: UserId) -> Result<(), CallError> {
        loop {
            let next = {
                let mut slot = self.slot.lock().await;
                let Some(call) = live_call(&mut slot, id) else {
                    return Err(CallError::Superseded);
                };
                match call.local_candidates.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        call.local_description_sent = true;
                        return Ok(());
                    }
                }
            };
            self.send_local_candidate(id, peer, next).await;
        }
    }

    async fn send_local_candidate(&self, id: CallId, peer: UserId, candidate: IceCandidate) {
        if let Err(err) = self
            .sink
            .send_signal(peer, SignalPayload::IceCandidate(candidate))
            .await
        {
            debug!(call = id.0, %err, "signaling: local candidate not sent");
        }
    }

    /// Applies buffered candidates front to back. The flag flips only once
    /// the buffer is observed empty, so candidates arriving mid-flush queue
    /// behind the ones already waiting.
    async fn flush_candidates(
        &self,
        id: CallId,
        pc: &Arc<dyn PeerConnection>,
    ) -> Result<usize, CallError> {
        let mut applied = 0;
        loop {
            let next = {
                let mut slot = self.slot.lock().await;
                let Some(call) = live_call(&mut slot, id) else {
                    return Err(CallError::Superseded);
                };
                match call.candidates.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        call.remote_description_set = true;
                        break;
                    }
                }
            };
            if let Err(err) = pc.add_ice_candidate(next).await {
                warn!(
                    call = id.0,
                    error = %format!("{err:#}"),
                    "signaling: buffered candidate rejected"
                );
            }
            applied += 1;
        }
        debug!(call = id.0, applied, "signaling: remote description applied");
        Ok(applied)
    }

    async fn mark_active(&self, id: CallId) -> Result<(), CallError> {
        let peer = {
            let mut slot = self.slot.lock().await;
            let Some(call) = live_call(&mut slot, id) else {
                return Err(CallError::Superseded);
            };
            call.phase = CallPhase::Active;
            if let Some(timer) = call.negotiation_timer.take() {
                timer.abort();
            }
            let snapshot = call.snapshot();
            let peer = call.peer;
            self.session.set_active_call(Some(snapshot)).await;
            peer
        };
        info!(call = id.0, peer = peer.0, "signaling: call active");
        let name = self.session.display_name(peer).await;
        self.presentation
            .update_call_status(&format!("In call with {name}"));
        Ok(())
    }

    async fn update_phase(&self, id: CallId, phase: CallPhase) -> Result<(), CallError> {
        let mut slot = self.slot.lock().await;
        let Some(call) = live_call(&mut slot, id) else {
            return Err(CallError::Superseded);
        };
        call.phase = phase;
        let snapshot = call.snapshot();
        self.session.set_active_call(Some(snapshot)).await;
        Ok(())
    }

    /// Ends call `id` if it is still live. Returns false when something else
    /// ended it first.
    async fn end_call(&self, id: CallId, ending: Ending) -> bool {
        let (peer, notify, released) = {
            let mut slot = self.slot.lock().await;
            let Some(call) = live_call(&mut slot, id) else {
                return false;
            };
            if !ending.applies_to(call) {
                return false;
            }
            let (phase, notify) = ending.outcome(call);
            info!(call = id.0, peer = call.peer.0, ?phase, ?ending, "signaling: call ended");
            let released = call.end(phase);
            let snapshot = call.snapshot();
            let peer = call.peer;
            self.session.set_active_call(Some(snapshot)).await;
            (peer, notify, released)
        };
        released.release().await;
        if notify {
            if let Err(err) = self.sink.send_signal(peer, SignalPayload::Rejected).await {
                debug!(call = id.0, %err, "signaling: peer not told about call end");
            }
        }
        self.presentation.update_call_status(ending.status_line());
        true
    }

    fn new_call_id(&self) -> CallId {
        CallId(self.next_call_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn live_call_id(&self) -> Option<CallId> {
        self.slot
            .lock()
            .await
            .as_ref()
            .filter(|c| c.is_live())
            .map(|c| c.id)
    }

    async fn ringing_call(&self) -> Result<CallId, CallError> {
        let slot = self.slot.lock().await;
        match slot.as_ref().filter(|c| c.is_live()) {
            Some(call)
                if call.direction == CallDirection::Inbound
                    && call.phase == CallPhase::Inviting =>
            {
                Ok(call.id)
            }
            Some(call) => Err(CallError::InvalidPhase { phase: call.phase }),
            None => Err(CallError::NoPendingCall),
        }
    }

    async fn is_live(&self, id: CallId) -> bool {
        let mut slot = self.slot.lock().await;
        live_call(&mut slot, id).is_some()
    }

    /// Awaits one peer-connection operation, then checks the call is still
    /// the live one. A failed operation ends the call.
    async fn step<T, F>(&self, id: CallId, op: F) -> Result<T, CallError>
    where
        F: Future<Output = anyhow::Result<T>> + Send,
        T: Send,
    {
        let result = op.await;
        if !self.is_live(id).await {
            debug!(call = id.0, "signaling: call ended during a suspended step");
            return Err(CallError::Superseded);
        }
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let error = CallError::PeerConnection(format!("{err:#}"));
                warn!(call = id.0, %error, "signaling: peer connection step failed");
                if self.end_call(id, Ending::Failed).await {
                    self.presentation.show_error(&error.to_string());
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/signaling_tests.rs"]
mod tests;
