use super::*;
use crate::{
    connection::{TransportCommand, TransportEvent, TransportLink},
    test_support::{eventually, stored, user, FakeDirectory, FakeMedia, FakePeers},
};
use anyhow::anyhow;
use shared::{
    domain::MessageType,
    protocol::{InboundFrame, SignalPayload},
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use url::Url;

const ME: UserId = UserId(1);
const ALICE: UserId = UserId(2);

struct RemoteEnd {
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
}

/// Hands out in-memory transports, or refuses every attempt.
#[derive(Default)]
struct LoopbackConnector {
    refuse: bool,
    attempts: Mutex<Vec<Url>>,
    remotes: Mutex<Vec<RemoteEnd>>,
}

impl LoopbackConnector {
    fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    async fn attempts(&self) -> usize {
        self.attempts.lock().await.len()
    }

    async fn push(&self, text: &str) {
        let remotes = self.remotes.lock().await;
        let remote = remotes.last().expect("an opened transport");
        remote
            .events
            .send(TransportEvent::Text(text.to_string()))
            .expect("pump alive");
    }

    async fn sent_frames(&self) -> Vec<ClientFrame> {
        self.drain()
            .await
            .into_iter()
            .filter_map(|command| match command {
                TransportCommand::Text(text) => {
                    Some(serde_json::from_str(&text).expect("client frame json"))
                }
                TransportCommand::Close { .. } => None,
            })
            .collect()
    }

    async fn drain(&self) -> Vec<TransportCommand> {
        let mut remotes = self.remotes.lock().await;
        let mut seen = Vec::new();
        for remote in remotes.iter_mut() {
            while let Ok(command) = remote.commands.try_recv() {
                seen.push(command);
            }
        }
        seen
    }
}

#[async_trait]
impl TransportConnector for LoopbackConnector {
    async fn open(&self, url: &Url) -> anyhow::Result<TransportLink> {
        self.attempts.lock().await.push(url.clone());
        if self.refuse {
            return Err(anyhow!("connection refused"));
        }
        let (outbound, commands) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        self.remotes.lock().await.push(RemoteEnd { events, commands });
        Ok(TransportLink { outbound, inbound })
    }
}

struct Harness {
    client: Arc<RealtimeClient>,
    connector: Arc<LoopbackConnector>,
    directory: Arc<FakeDirectory>,
    events: broadcast::Receiver<ClientEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with(LoopbackConnector::default())
    }

    fn with(connector: LoopbackConnector) -> Self {
        Self::with_directory(connector, Self::directory())
    }

    fn directory() -> FakeDirectory {
        FakeDirectory {
            users: vec![user(1, "me"), user(2, "alice"), user(3, "bob")],
            history: vec![
                stored(10, 1, 2, "hi alice"),
                stored(11, 2, 1, "hi back"),
                stored(12, 3, 1, "from bob"),
            ],
            ..FakeDirectory::default()
        }
    }

    fn with_directory(connector: LoopbackConnector, directory: FakeDirectory) -> Self {
        let settings = ClientSettings {
            negotiation_timeout_secs: 0,
            ..ClientSettings::default()
        };
        let connector = Arc::new(connector);
        let directory = Arc::new(directory);
        let presentation = Arc::new(BroadcastPresentation::new(settings.event_buffer));
        let events = presentation.subscribe();
        let client = RealtimeClient::new(
            &settings,
            Identity::new(ME, "secret"),
            ClientDependencies {
                connector: connector.clone(),
                directory: directory.clone(),
                media: Arc::new(FakeMedia::default()),
                peers: Arc::new(FakePeers::default()),
                presentation,
            },
        )
        .expect("client");
        Self {
            client,
            connector,
            directory,
            events,
        }
    }

    async fn started(self) -> Self {
        self.client.start().await;
        let client = Arc::clone(&self.client);
        eventually("directory loaded", || {
            let client = Arc::clone(&client);
            async move { client.session.username(ALICE).await.is_some() }
        })
        .await;
        self
    }

    fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}

#[tokio::test]
async fn connecting_loads_the_directory_without_the_current_user() {
    let mut h = Harness::new().started().await;

    assert_eq!(h.client.connection_state().await, ConnectionState::Open);
    assert_eq!(
        h.connector.attempts.lock().await[0].as_str(),
        "ws://127.0.0.1:8000/ws/1?token=secret"
    );
    assert_eq!(
        h.drain_events(),
        [ClientEvent::UserListUpdated(vec![
            user(2, "alice"),
            user(3, "bob")
        ])]
    );
}

#[tokio::test]
async fn selecting_a_peer_loads_its_history() {
    let mut h = Harness::new().started().await;
    h.drain_events();

    let selected = h.client.select_peer(ALICE).await.expect("select");

    assert_eq!(selected.id, ALICE);
    assert_eq!(selected.username.as_deref(), Some("alice"));
    assert_eq!(*h.directory.history_requests.lock().await, [ALICE]);
    assert_eq!(
        h.drain_events(),
        [ClientEvent::HistoryLoaded {
            peer: ALICE,
            messages: vec![stored(10, 1, 2, "hi alice"), stored(11, 2, 1, "hi back")],
        }]
    );
}

#[tokio::test]
async fn send_chat_validates_input_before_touching_the_wire() {
    let h = Harness::new().started().await;

    assert!(matches!(
        h.client.send_chat("   ").await,
        Err(ClientError::EmptyMessage)
    ));
    assert!(matches!(
        h.client.send_chat("hello").await,
        Err(ClientError::NoPeerSelected)
    ));
    assert!(h.connector.sent_frames().await.is_empty());
}

#[tokio::test]
async fn send_chat_writes_a_trimmed_message_frame() {
    let h = Harness::new().started().await;
    h.client.select_peer(ALICE).await.expect("select");

    h.client.send_chat("  hello there \n").await.expect("send");

    assert_eq!(
        h.connector.sent_frames().await,
        [ClientFrame::text(ALICE, "hello there")]
    );
}

#[tokio::test]
async fn send_chat_while_disconnected_fails_and_starts_a_connect() {
    let h = Harness::new();
    h.client.session.select_peer(ALICE).await;

    let result = h.client.send_chat("queued?").await;

    assert!(matches!(
        result,
        Err(ClientError::Send(SendError::NotConnected))
    ));
    let connector = Arc::clone(&h.connector);
    eventually("connect attempted", || {
        let connector = Arc::clone(&connector);
        async move { connector.attempts().await == 1 }
    })
    .await;
    // Nothing was queued for delivery once the link came up.
    assert!(h.connector.sent_frames().await.is_empty());
}

#[tokio::test]
async fn slow_directory_does_not_hold_up_inbound_frames() {
    let (release, gate) = oneshot::channel();
    let h = Harness::with_directory(
        LoopbackConnector::default(),
        FakeDirectory {
            users_gate: Mutex::new(Some(gate)),
            ..Harness::directory()
        },
    );
    h.client.start().await;
    let client = Arc::clone(&h.client);
    eventually("connection open", || {
        let client = Arc::clone(&client);
        async move { client.connection_state().await == ConnectionState::Open }
    })
    .await;

    h.connector
        .push(r#"{"type":"message","from_user":3,"to_user":1,"content":"early","message_type":"TEXT"}"#)
        .await;

    let client = Arc::clone(&h.client);
    eventually("frame routed", || {
        let client = Arc::clone(&client);
        async move { client.unread_count(UserId(3)).await == 1 }
    })
    .await;
    assert_eq!(h.client.session.username(ALICE).await, None);

    release.send(()).expect("directory still waiting");
    let client = Arc::clone(&h.client);
    eventually("directory loaded", || {
        let client = Arc::clone(&client);
        async move { client.session.username(ALICE).await.is_some() }
    })
    .await;
}

#[tokio::test]
async fn inbound_chat_for_the_open_conversation_is_emitted() {
    let mut h = Harness::new().started().await;
    h.client.select_peer(ALICE).await.expect("select");
    h.drain_events();

    h.connector
        .push(r#"{"type":"message","from_user":2,"to_user":1,"content":"ping","message_type":"TEXT"}"#)
        .await;
    h.connector
        .push(r#"{"type":"message","from_user":3,"to_user":1,"content":"psst","message_type":"TEXT"}"#)
        .await;

    let client = Arc::clone(&h.client);
    eventually("unread counted", || {
        let client = Arc::clone(&client);
        async move { client.unread_count(UserId(3)).await == 1 }
    })
    .await;
    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        ClientEvent::MessageReceived(message) if message.content == "ping"
    ));
}

#[tokio::test]
async fn uploaded_media_is_shown_in_the_open_conversation() {
    let mut h = Harness::new().started().await;
    h.client.select_peer(ALICE).await.expect("select");
    h.drain_events();

    let stored = h
        .client
        .send_media(MediaUpload::video(ALICE, vec![1, 2, 3]))
        .await
        .expect("upload");

    assert_eq!(stored.media_file.as_deref(), Some("uploads/recording.webm"));
    {
        let uploads = h.directory.uploads.lock().await;
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].message_type, MessageType::Video);
    }
    let events = h.drain_events();
    match events.as_slice() {
        [ClientEvent::MessageReceived(message)] => {
            assert_eq!(message.to_user, ALICE);
            assert_eq!(message.media_type.as_deref(), Some("video/webm"));
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

#[tokio::test]
async fn incoming_call_waits_for_a_decision_and_rejection_is_signalled() {
    let mut h = Harness::new().started().await;
    h.drain_events();

    h.connector
        .push(r#"{"type":"webrtc-signal","from_user":2,"signal":{"sdp":{"type":"offer","sdp":"v=0"}}}"#)
        .await;

    let client = Arc::clone(&h.client);
    eventually("call ringing", || {
        let client = Arc::clone(&client);
        async move { client.active_call().await.is_some() }
    })
    .await;
    // The prompt is registered by the spawned ring task.
    let client = Arc::clone(&h.client);
    eventually("prompt answered", || {
        let client = Arc::clone(&client);
        async move { client.decide_incoming_call(CallDecision::Reject).await }
    })
    .await;
    let client = Arc::clone(&h.client);
    eventually("call declined", || {
        let client = Arc::clone(&client);
        async move { client.active_call().await.map(|c| c.phase) == Some(CallPhase::Terminated) }
    })
    .await;

    assert!(h
        .drain_events()
        .contains(&ClientEvent::IncomingCall { peer: ALICE }));
    assert_eq!(
        h.connector.sent_frames().await,
        [ClientFrame::signal(ALICE, SignalPayload::Rejected)]
    );
}

#[tokio::test]
async fn standard_dependencies_cannot_place_calls() {
    let settings = ClientSettings::default();
    let identity = Identity::new(ME, "secret");
    let deps = ClientDependencies::standard(&settings, &identity);
    let client = RealtimeClient::new(&settings, identity, deps).expect("client");
    let mut events = client.subscribe_events();

    assert!(matches!(
        client.start_call(ALICE).await,
        Err(ClientError::Call(CallError::Media(_)))
    ));
    assert_eq!(client.active_call().await, None);
    let mut errors = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Error(text) = event {
            errors.push(text);
        }
    }
    assert_eq!(errors.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_surface_a_connection_lost_error() {
    let mut h = Harness::with(LoopbackConnector::refusing());

    h.client.start().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.connector.attempts().await, 5);
    assert!(h.drain_events().contains(&ClientEvent::Error(
        "Connection lost after 5 attempts. Use /reconnect to try again.".to_string()
    )));

    h.client.reconnect().await;
    assert_eq!(h.connector.attempts().await, 6);
}

#[tokio::test(start_paused = true)]
async fn chat_after_exhaustion_waits_for_a_manual_reconnect() {
    let h = Harness::with(LoopbackConnector::refusing());
    h.client.session.select_peer(ALICE).await;
    h.client.start().await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.attempts().await, 5);

    assert!(matches!(
        h.client.send_chat("still there?").await,
        Err(ClientError::Send(SendError::NotConnected))
    ));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.attempts().await, 5);

    h.client.reconnect().await;
    assert_eq!(h.connector.attempts().await, 6);
}

#[tokio::test]
async fn ending_a_ringing_call_withdraws_its_prompt() {
    let mut h = Harness::new().started().await;
    h.drain_events();

    h.connector
        .push(r#"{"type":"webrtc-signal","from_user":2,"signal":{"sdp":{"type":"offer","sdp":"v=0"}}}"#)
        .await;
    let presentation = Arc::clone(&h.client.presentation);
    eventually("prompt shown", || {
        let presentation = Arc::clone(&presentation);
        async move { presentation.has_pending_prompt() }
    })
    .await;

    h.connector
        .push(r#"{"type":"webrtc-signal","from_user":2,"signal":{"rejected":true}}"#)
        .await;

    let presentation = Arc::clone(&h.client.presentation);
    eventually("prompt withdrawn", || {
        let presentation = Arc::clone(&presentation);
        async move { !presentation.has_pending_prompt() }
    })
    .await;
    assert!(!h.client.decide_incoming_call(CallDecision::Accept).await);
    assert_eq!(
        h.client.active_call().await.map(|c| c.phase),
        Some(CallPhase::Terminated)
    );
    assert!(h.connector.sent_frames().await.is_empty());
}

#[tokio::test]
async fn shutdown_closes_the_transport_and_forgets_the_session() {
    let h = Harness::new().started().await;
    h.client.select_peer(ALICE).await.expect("select");

    h.client.shutdown().await;

    assert_eq!(h.client.connection_state().await, ConnectionState::Closed);
    assert!(h.connector.drain().await.contains(&TransportCommand::Close {
        code: 1000,
        reason: "client disconnect".to_string(),
    }));
    assert_eq!(h.client.selected_peer().await, None);
    assert_eq!(h.client.session.username(ALICE).await, None);
}

#[test]
fn inbound_status_frame_parses() {
    let frame = InboundFrame::parse(r#"{"type":"status","user_id":2,"status":"online"}"#)
        .expect("status frame");
    assert_eq!(frame.kind(), "status");
}
