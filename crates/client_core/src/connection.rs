use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientFrame, SignalPayload},
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{backoff::BackoffPolicy, error::SendError, signaling::SignalSink};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const NO_STATUS_CLOSURE: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: reason.into(),
            was_clean: true,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: reason.into(),
            was_clean: false,
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// `<base>/<user_id>?token=<credential>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    pub fn new(base: &str, user_id: UserId, token: &str) -> Result<Self, url::ParseError> {
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        let mut url = Url::parse(&format!("{}/{}", base.trim_end_matches('/'), user_id.0))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn redacted(&self) -> String {
        redact(&self.url)
    }
}

fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.query().is_some() {
        shown.set_query(Some("token=***"));
    }
    shown.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed(CloseInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Text(String),
    Close { code: u16, reason: String },
}

/// One live duplex connection. Dropping `outbound` ends the writer side;
/// `inbound` yields a final `Closed` event when the peer goes away.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<TransportCommand>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<TransportLink>;
}

pub struct WebSocketConnector;

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<TransportLink> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", redact(url)))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                match command {
                    TransportCommand::Text(text) => {
                        if let Err(err) = ws_writer.send(Message::Text(text)).await {
                            warn!(%err, "transport: websocket write failed");
                            break;
                        }
                    }
                    TransportCommand::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = ws_writer.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let close = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(TransportEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => CloseInfo {
                                code: u16::from(frame.code),
                                reason: frame.reason.into_owned(),
                                was_clean: true,
                            },
                            None => CloseInfo {
                                code: NO_STATUS_CLOSURE,
                                reason: String::new(),
                                was_clean: true,
                            },
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break CloseInfo::abnormal(err.to_string()),
                    None => break CloseInfo::abnormal("websocket stream ended"),
                }
            };
            let _ = inbound_tx.send(TransportEvent::Closed(close));
        });

        Ok(TransportLink { outbound, inbound })
    }
}

/// Receives connection lifecycle callbacks. Handlers for one connection run
/// one at a time: `on_open`, then each `on_frame` in arrival order, then
/// `on_close`.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn on_open(&self);
    async fn on_frame(&self, text: String);
    async fn on_close(&self, close: &CloseInfo);
    /// Reconnect attempts are exhausted; only a manual reconnect recovers.
    async fn on_connection_lost(&self, attempts: u32);
}

struct ActiveTransport {
    outbound: mpsc::UnboundedSender<TransportCommand>,
}

struct PendingRetry {
    id: u64,
    task: JoinHandle<()>,
}

struct ConnectionInner {
    state: ConnectionState,
    endpoint: Option<Endpoint>,
    reconnect_attempts: u32,
    exhausted: bool,
    generation: u64,
    transport: Option<ActiveTransport>,
    retry: Option<PendingRetry>,
    next_retry_id: u64,
}

enum AfterClose {
    Stop,
    Retry { delay: Duration, attempt: u32 },
    GiveUp { attempts: u32 },
}

pub struct ConnectionManager {
    connector: Arc<dyn TransportConnector>,
    backoff: BackoffPolicy,
    handler: RwLock<Option<Arc<dyn ConnectionHandler>>>,
    inner: Mutex<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn TransportConnector>, backoff: BackoffPolicy) -> Arc<Self> {
        Arc::new(Self {
            connector,
            backoff,
            handler: RwLock::new(None),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Idle,
                endpoint: None,
                reconnect_attempts: 0,
                exhausted: false,
                generation: 0,
                transport: None,
                retry: None,
                next_retry_id: 0,
            }),
        })
    }

    /// Installs `handler`, dropping whichever handler was registered before.
    pub async fn set_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        if self.handler.write().await.replace(handler).is_some() {
            debug!("connection: replaced previously registered handler");
        }
    }

    pub async fn clear_handler(&self) {
        self.handler.write().await.take();
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().await.reconnect_attempts
    }

    pub async fn has_pending_retry(&self) -> bool {
        self.inner.lock().await.retry.is_some()
    }

    /// True once reconnect attempts ran out and no manual connect followed.
    pub async fn is_exhausted(&self) -> bool {
        self.inner.lock().await.exhausted
    }

    /// Starts a connection to `endpoint`. A no-op while a connection is
    /// being established or is already open. Also recovers from exhaustion.
    pub async fn connect(self: &Arc<Self>, endpoint: Endpoint) {
        self.start_connect(endpoint, true).await;
    }

    /// Like [`connect`](Self::connect), but leaves an exhausted manager
    /// alone. Returns false in that case.
    pub async fn connect_if_recoverable(self: &Arc<Self>, endpoint: Endpoint) -> bool {
        self.start_connect(endpoint, false).await
    }

    async fn start_connect(self: &Arc<Self>, endpoint: Endpoint, recover: bool) -> bool {
        let attempt = {
            let mut inner = self.inner.lock().await;
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Open
            ) {
                debug!(state = ?inner.state, "connection: connect ignored; already active");
                return true;
            }
            if inner.exhausted {
                if !recover {
                    debug!("connection: attempts exhausted; waiting for a manual reconnect");
                    return false;
                }
                inner.exhausted = false;
                inner.reconnect_attempts = 0;
            }
            if let Some(retry) = inner.retry.take() {
                retry.task.abort();
            }
            inner.endpoint = Some(endpoint);
            Self::begin_attempt(&mut inner)
        };
        if let Some((generation, url)) = attempt {
            self.open_transport(generation, url).await;
        }
        true
    }

    /// Connects again to the last endpoint, e.g. after attempts ran out.
    pub async fn reconnect(self: &Arc<Self>) {
        let endpoint = self.inner.lock().await.endpoint.clone();
        match endpoint {
            Some(endpoint) => self.connect(endpoint).await,
            None => warn!("connection: reconnect requested before any connect"),
        }
    }

    /// Closes the connection with a normal-closure code. No reconnect follows.
    pub async fn disconnect(&self) {
        let (prior, generation) = {
            let mut inner = self.inner.lock().await;
            if let Some(retry) = inner.retry.take() {
                retry.task.abort();
            }
            if matches!(inner.state, ConnectionState::Idle | ConnectionState::Closed) {
                return;
            }
            inner.state = ConnectionState::Closing;
            inner.generation += 1;
            (inner.transport.take(), inner.generation)
        };

        if let Some(transport) = prior {
            let _ = transport.outbound.send(TransportCommand::Close {
                code: NORMAL_CLOSURE,
                reason: "client disconnect".to_string(),
            });
        }
        info!("connection: closed by client");

        if let Some(handler) = self.current_handler().await {
            handler.on_close(&CloseInfo::normal("client disconnect")).await;
        }

        let mut inner = self.inner.lock().await;
        if inner.generation == generation && inner.state == ConnectionState::Closing {
            inner.state = ConnectionState::Closed;
        }
    }

    pub async fn send(&self, frame: &ClientFrame) -> Result<(), SendError> {
        let text = frame
            .to_json()
            .map_err(|err| SendError::Encode(err.to_string()))?;
        let inner = self.inner.lock().await;
        if inner.state != ConnectionState::Open {
            return Err(SendError::NotConnected);
        }
        let transport = inner.transport.as_ref().ok_or(SendError::NotConnected)?;
        transport
            .outbound
            .send(TransportCommand::Text(text))
            .map_err(|_| SendError::NotConnected)
    }

    async fn current_handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.handler.read().await.clone()
    }

    async fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.lock().await;
        inner.generation == generation && inner.state == ConnectionState::Open
    }

    fn begin_attempt(inner: &mut ConnectionInner) -> Option<(u64, Url)> {
        let url = inner.endpoint.as_ref()?.url().clone();
        if let Some(prior) = inner.transport.take() {
            let _ = prior.outbound.send(TransportCommand::Close {
                code: NORMAL_CLOSURE,
                reason: "replaced".to_string(),
            });
        }
        inner.generation += 1;
        inner.state = ConnectionState::Connecting;
        Some((inner.generation, url))
    }

    async fn open_transport(self: &Arc<Self>, generation: u64, url: Url) {
        info!(url = %redact(&url), generation, "connection: opening transport");
        let link = match self.connector.open(&url).await {
            Ok(link) => link,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "connection: transport open failed");
                self.handle_close(generation, CloseInfo::abnormal(err.to_string()))
                    .await;
                return;
            }
        };

        let TransportLink { outbound, inbound } = link;
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                debug!(generation, "connection: discarding superseded transport");
                let _ = outbound.send(TransportCommand::Close {
                    code: NORMAL_CLOSURE,
                    reason: "superseded".to_string(),
                });
                return;
            }
            inner.state = ConnectionState::Open;
            inner.reconnect_attempts = 0;
            inner.exhausted = false;
            inner.transport = Some(ActiveTransport { outbound });
        }
        info!(generation, "connection: open");
        tokio::spawn(Arc::clone(self).pump(generation, inbound));
    }

    async fn pump(
        self: Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        if let Some(handler) = self.current_handler().await {
            handler.on_open().await;
        }

        let close = loop {
            match inbound.recv().await {
                Some(TransportEvent::Text(text)) => {
                    if !self.is_current(generation).await {
                        return;
                    }
                    if let Some(handler) = self.current_handler().await {
                        handler.on_frame(text).await;
                    }
                }
                Some(TransportEvent::Closed(close)) => break close,
                None => break CloseInfo::abnormal("transport ended without a close frame"),
            }
        };
        self.handle_close(generation, close).await;
    }

    async fn handle_close(self: &Arc<Self>, generation: u64, close: CloseInfo) {
        let next = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation
                || !matches!(
                    inner.state,
                    ConnectionState::Connecting | ConnectionState::Open
                )
            {
                debug!(generation, code = close.code, "connection: ignoring stale close");
                return;
            }
            inner.transport = None;
            inner.state = ConnectionState::Closed;

            if close.is_normal() {
                AfterClose::Stop
            } else {
                inner.reconnect_attempts += 1;
                let attempt = inner.reconnect_attempts;
                match self.backoff.next_delay(attempt) {
                    Some(delay) => {
                        self.schedule_retry(&mut inner, delay);
                        AfterClose::Retry { delay, attempt }
                    }
                    None => {
                        inner.exhausted = true;
                        AfterClose::GiveUp { attempts: attempt }
                    }
                }
            }
        };

        info!(
            code = close.code,
            reason = %close.reason,
            was_clean = close.was_clean,
            "connection: closed"
        );
        let handler = self.current_handler().await;
        if let Some(handler) = &handler {
            handler.on_close(&close).await;
        }

        match next {
            AfterClose::Stop => info!("connection: normal closure; not reconnecting"),
            AfterClose::Retry { delay, attempt } => info!(
                attempt,
                max_attempts = self.backoff.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "connection: reconnect scheduled"
            ),
            AfterClose::GiveUp { attempts } => {
                error!(attempts, "connection: reconnect attempts exhausted");
                if let Some(handler) = handler {
                    handler.on_connection_lost(attempts).await;
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, inner: &mut ConnectionInner, delay: Duration) {
        if let Some(prior) = inner.retry.take() {
            prior.task.abort();
        }
        inner.next_retry_id += 1;
        let id = inner.next_retry_id;
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.fire_retry(id).await;
        });
        inner.retry = Some(PendingRetry { id, task });
    }

    async fn fire_retry(self: &Arc<Self>, retry_id: u64) {
        let attempt = {
            let mut inner = self.inner.lock().await;
            match &inner.retry {
                Some(retry) if retry.id == retry_id => {}
                _ => return,
            }
            // Detach rather than abort: this code runs inside that task.
            inner.retry = None;
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Open
            ) {
                return;
            }
            Self::begin_attempt(&mut inner)
        };
        if let Some((generation, url)) = attempt {
            self.open_transport(generation, url).await;
        }
    }
}

#[async_trait]
impl SignalSink for ConnectionManager {
    async fn send_signal(&self, to: UserId, payload: SignalPayload) -> Result<(), SendError> {
        self.send(&ClientFrame::signal(to, payload)).await
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
