use super::*;
use auth::Claims;
use axum::{body, body::Body, http::Request, http::StatusCode};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const SECRET: &str = "test-secret";

fn test_app() -> Router {
    build_router(Arc::new(AppState {
        relay: Relay::default(),
        verifier: TokenVerifier::new(SECRET, "HS256").expect("verifier"),
    }))
}

fn token_for(user_id: i64) -> String {
    encode(
        &Header::default(),
        &Claims {
            sub: user_id.to_string(),
            exp: None,
        },
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("token")
}

async fn spawn_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = test_app();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn connect(addr: SocketAddr, user_id: i64, token: &str) -> Client {
    let (socket, _) = connect_async(format!("ws://{addr}/ws/{user_id}?token={token}"))
        .await
        .expect("websocket handshake");
    socket
}

async fn next_json(client: &mut Client) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("frame in time")
        .expect("stream open")
        .expect("frame");
    match message {
        WsMessage::Text(text) => serde_json::from_str(&text).expect("json"),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn next_close(client: &mut Client) -> (u16, String) {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame");
        if let WsMessage::Close(frame) = message {
            let frame = frame.expect("close frame");
            return (u16::from(frame.code), frame.reason.to_string());
        }
    }
}

#[tokio::test]
async fn healthz_reports_ok() {
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = test_app().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn plain_http_request_to_ws_route_is_not_upgraded() {
    let request = Request::get("/ws/1?token=x")
        .body(Body::empty())
        .expect("request");
    let response = test_app().oneshot(request).await.expect("response");
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn token_for_another_user_is_closed_with_4001() {
    let addr = spawn_server().await;
    let mut client = connect(addr, 1, &token_for(2)).await;

    let (code, reason) = next_close(&mut client).await;
    assert_eq!(code, 4001);
    assert_eq!(reason, "Invalid token");
}

#[tokio::test]
async fn two_users_chat_and_signal_through_the_relay() {
    let addr = spawn_server().await;
    let mut alice = connect(addr, 1, &token_for(1)).await;
    assert_eq!(next_json(&mut alice).await["status"], "online");
    let mut bob = connect(addr, 2, &token_for(2)).await;
    assert_eq!(next_json(&mut bob).await["user_id"], 2);
    let bob_online = next_json(&mut alice).await;
    assert_eq!(bob_online["user_id"], 2);
    assert_eq!(bob_online["status"], "online");

    alice
        .send(WsMessage::Text(
            json!({"type": "message", "target_id": 2, "content": "hello bob"}).to_string(),
        ))
        .await
        .expect("send chat");
    let delivered = next_json(&mut bob).await;
    let echoed = next_json(&mut alice).await;
    assert_eq!(delivered, echoed);
    assert_eq!(delivered["from_user"], 1);
    assert_eq!(delivered["content"], "hello bob");

    bob.send(WsMessage::Text(
        json!({"type": "webrtc-signal", "target_id": 1, "signal": {"candidate": {"candidate": "c1"}}})
            .to_string(),
    ))
    .await
    .expect("send signal");
    assert_eq!(
        next_json(&mut alice).await,
        json!({"type": "webrtc-signal", "from_user": 2, "signal": {"candidate": {"candidate": "c1"}}})
    );

    bob.close(None).await.expect("close");
    let offline = next_json(&mut alice).await;
    assert_eq!(offline["user_id"], 2);
    assert_eq!(offline["status"], "offline");
}

#[tokio::test]
async fn second_login_closes_the_first_with_normal_closure() {
    let addr = spawn_server().await;
    let mut first = connect(addr, 5, &token_for(5)).await;
    assert_eq!(next_json(&mut first).await["status"], "online");

    let mut second = connect(addr, 5, &token_for(5)).await;

    let (code, _) = next_close(&mut first).await;
    assert_eq!(code, 1000);
    assert_eq!(next_json(&mut second).await["status"], "online");
}
