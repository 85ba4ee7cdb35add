use std::{net::SocketAddr, sync::Arc};

use anyhow::anyhow;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use shared::domain::UserId;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod relay;

use auth::TokenVerifier;
use config::load_settings;
use relay::{Outbound, Registration, Relay};

const INVALID_TOKEN_CLOSE: u16 = 4001;

struct AppState {
    relay: Relay,
    verifier: TokenVerifier,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let verifier = TokenVerifier::new(&settings.jwt_secret, &settings.jwt_algorithm)?;
    let app = build_router(Arc::new(AppState {
        relay: Relay::default(),
        verifier,
    }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/:user_id", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let user_id = UserId(user_id);
    let verified = match q.token.as_deref() {
        Some(token) => state.verifier.verify(token, user_id),
        None => Err(anyhow!("token query parameter is missing")),
    };
    ws.on_upgrade(move |socket| async move {
        match verified {
            Ok(()) => ws_connection(state, socket, user_id).await,
            Err(err) => reject_connection(socket, user_id, err).await,
        }
    })
}

async fn reject_connection(mut socket: WebSocket, user_id: UserId, err: anyhow::Error) {
    warn!(user = user_id.0, error = %format!("{err:#}"), "ws: rejecting connection");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: INVALID_TOKEN_CLOSE,
            reason: "Invalid token".into(),
        })))
        .await;
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let Registration {
        connection,
        mut outbound,
    } = state.relay.register(user_id).await;
    let online = state.relay.online().await.len();
    info!(
        user = user_id.0,
        online = online,
        "ws: session started"
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Text(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => state.relay.handle_text(user_id, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(user = user_id.0, %err, "ws: receive failed");
                    break;
                }
            },
            _ = &mut send_task => break,
        }
    }

    send_task.abort();
    state.relay.unregister(user_id, connection).await;
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
