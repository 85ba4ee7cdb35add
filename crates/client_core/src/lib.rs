use std::sync::Arc;

use async_trait::async_trait;
use rtc_integration::{
    MediaDevices, PeerConnectionFactory, UnavailableMediaDevices,
    UnavailablePeerConnectionFactory,
};
use shared::{
    domain::{StoredMessage, UserId, UserSummary},
    protocol::{ChatMessage, ClientFrame},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub mod backoff;
pub mod candidate_buffer;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod presentation;
pub mod router;
pub mod session;
pub mod signaling;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

pub use config::ClientSettings;
pub use connection::{ConnectionState, Endpoint};
pub use directory::MediaUpload;
pub use error::{CallError, ClientError, SendError};
pub use presentation::{BroadcastPresentation, CallDecision, ClientEvent, Presentation};
pub use session::{Identity, SelectedPeer};
pub use signaling::{CallDirection, CallId, CallPhase, CallSnapshot};

use connection::{
    CloseInfo, ConnectionHandler, ConnectionManager, TransportConnector, WebSocketConnector,
};
use directory::{DirectoryService, HttpDirectory};
use router::MessageRouter;
use session::SessionContext;
use signaling::SignalingMachine;

/// Collaborators the client cannot build by itself.
pub struct ClientDependencies {
    pub connector: Arc<dyn TransportConnector>,
    pub directory: Arc<dyn DirectoryService>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub presentation: Arc<BroadcastPresentation>,
}

impl ClientDependencies {
    /// Websocket transport and HTTP directory; calls fail until a media
    /// backend is supplied.
    pub fn standard(settings: &ClientSettings, identity: &Identity) -> Self {
        Self {
            connector: Arc::new(WebSocketConnector),
            directory: Arc::new(HttpDirectory::new(
                settings.server_url.clone(),
                identity.token.clone(),
            )),
            media: Arc::new(UnavailableMediaDevices),
            peers: Arc::new(UnavailablePeerConnectionFactory),
            presentation: Arc::new(BroadcastPresentation::new(settings.event_buffer)),
        }
    }
}

pub struct RealtimeClient {
    endpoint: Endpoint,
    session: Arc<SessionContext>,
    connection: Arc<ConnectionManager>,
    signaling: Arc<SignalingMachine>,
    router: Arc<MessageRouter>,
    directory: Arc<dyn DirectoryService>,
    presentation: Arc<BroadcastPresentation>,
}

impl RealtimeClient {
    pub fn new(
        settings: &ClientSettings,
        identity: Identity,
        deps: ClientDependencies,
    ) -> Result<Arc<Self>, ClientError> {
        let endpoint = Endpoint::new(
            &settings.websocket_base(),
            identity.user_id,
            &identity.token,
        )?;
        let session = SessionContext::new(identity);
        let presentation: Arc<dyn Presentation> = deps.presentation.clone();
        let connection = ConnectionManager::new(deps.connector, settings.backoff());
        let signaling = SignalingMachine::new(
            Arc::clone(&session),
            deps.media,
            deps.peers,
            connection.clone(),
            Arc::clone(&presentation),
            settings.signaling_options(),
        );
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&session),
            Arc::clone(&signaling),
            presentation,
        ));
        Ok(Arc::new(Self {
            endpoint,
            session,
            connection,
            signaling,
            router,
            directory: deps.directory,
            presentation: deps.presentation,
        }))
    }

    /// Registers the connection handler and opens the realtime connection.
    pub async fn start(self: &Arc<Self>) {
        info!(
            user = self.session.user_id().0,
            endpoint = %self.endpoint.redacted(),
            "client: starting"
        );
        self.connection
            .set_handler(Arc::new(ClientConnectionHandler {
                client: Arc::downgrade(self),
            }))
            .await;
        self.connection.connect(self.endpoint.clone()).await;
    }

    /// Ends any call, closes the connection and forgets the session state.
    pub async fn shutdown(&self) {
        self.signaling.hangup().await;
        self.connection.disconnect().await;
        self.connection.clear_handler().await;
        self.session.teardown().await;
        info!("client: shut down");
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.presentation.subscribe()
    }

    /// Resolves a pending incoming-call prompt. Returns false when none is
    /// waiting.
    pub async fn decide_incoming_call(&self, decision: CallDecision) -> bool {
        self.presentation.decide_incoming_call(decision).await
    }

    pub fn identity(&self) -> &Identity {
        self.session.identity()
    }

    pub async fn refresh_users(&self) -> Result<Vec<UserSummary>, ClientError> {
        let users = self.directory.list_users().await?;
        let visible = self.session.replace_directory(users).await;
        self.presentation.render_user_list(&visible);
        Ok(visible)
    }

    /// Opens the conversation with `peer` and loads its history.
    pub async fn select_peer(&self, peer: UserId) -> Result<SelectedPeer, ClientError> {
        let selected = self.session.select_peer(peer).await;
        self.load_history(peer).await?;
        Ok(selected)
    }

    pub async fn selected_peer(&self) -> Option<SelectedPeer> {
        self.session.selected_peer().await
    }

    pub async fn unread_count(&self, peer: UserId) -> u32 {
        self.session.unread_count(peer).await
    }

    /// Sends a text message to the selected peer. While disconnected the
    /// message is not queued; a connect attempt is started instead, unless
    /// reconnect attempts have run out.
    pub async fn send_chat(self: &Arc<Self>, text: &str) -> Result<(), ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let peer = self
            .session
            .selected_peer_id()
            .await
            .ok_or(ClientError::NoPeerSelected)?;
        match self.connection.send(&ClientFrame::text(peer, text)).await {
            Ok(()) => Ok(()),
            Err(SendError::NotConnected) => {
                if self.connection.is_exhausted().await {
                    warn!(peer = peer.0, "client: not connected; reconnect required");
                    return Err(SendError::NotConnected.into());
                }
                warn!(peer = peer.0, "client: not connected; trying to reconnect");
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    client
                        .connection
                        .connect_if_recoverable(client.endpoint.clone())
                        .await;
                });
                Err(SendError::NotConnected.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Uploads a recorded clip and shows it in the open conversation.
    pub async fn send_media(&self, upload: MediaUpload) -> Result<StoredMessage, ClientError> {
        let stored = self.directory.upload_media(upload).await?;
        let message = ChatMessage::from(stored.clone());
        if self.session.is_in_view(&message).await {
            self.presentation.render_message(&message);
        }
        Ok(stored)
    }

    pub async fn start_call(&self, peer: UserId) -> Result<CallId, ClientError> {
        Ok(self.signaling.start_call(peer).await?)
    }

    pub async fn accept_call(&self) -> Result<(), ClientError> {
        Ok(self.signaling.accept_call().await?)
    }

    pub async fn reject_call(&self) -> Result<(), ClientError> {
        Ok(self.signaling.reject_call().await?)
    }

    pub async fn hangup(&self) {
        self.signaling.hangup().await;
    }

    /// Manual reconnect; also recovers after reconnect attempts ran out.
    pub async fn reconnect(&self) {
        self.connection.reconnect().await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn active_call(&self) -> Option<CallSnapshot> {
        self.session.active_call().await
    }

    async fn reload_after_open(&self) {
        if let Err(err) = self.refresh_users().await {
            warn!(%err, "client: could not load users after connect");
            self.presentation.show_error(&err.to_string());
        }
        if let Some(peer) = self.session.selected_peer_id().await {
            if let Err(err) = self.load_history(peer).await {
                warn!(%err, peer = peer.0, "client: could not reload history");
            }
        }
    }

    async fn load_history(&self, peer: UserId) -> Result<(), ClientError> {
        let messages = self.directory.fetch_history(peer).await?;
        // The selection may have moved on while the request was in flight.
        if self.session.selected_peer_id().await == Some(peer) {
            self.presentation.render_history(peer, &messages);
        }
        Ok(())
    }
}

/// Bridges connection callbacks into the client. Holds a weak reference so
/// the manager does not keep a dropped client alive.
struct ClientConnectionHandler {
    client: std::sync::Weak<RealtimeClient>,
}

#[async_trait]
impl ConnectionHandler for ClientConnectionHandler {
    async fn on_open(&self) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        // Runs beside the pump so a slow directory never delays signaling.
        tokio::spawn(async move { client.reload_after_open().await });
    }

    async fn on_frame(&self, text: String) {
        if let Some(client) = self.client.upgrade() {
            client.router.route_text(&text).await;
        }
    }

    async fn on_close(&self, close: &CloseInfo) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        debug!(code = close.code, "client: connection closed");
        client.signaling.on_connection_closed().await;
    }

    async fn on_connection_lost(&self, attempts: u32) {
        if let Some(client) = self.client.upgrade() {
            client.presentation.show_error(&format!(
                "Connection lost after {attempts} attempts. Use /reconnect to try again."
            ));
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
