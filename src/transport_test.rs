use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tripsync_protocol::{ClientMessage, EVENT_ROOM_JOINED, EntityUpdate, decode_client_message};

use super::*;
use crate::client::RealtimeSyncClient;
use crate::test_helpers::{fast_policy, wait_until};

const TOKEN: &str = "secret-token";

async fn ws_handler(ws: WebSocketUpgrade, headers: HeaderMap, State(seen): State<mpsc::UnboundedSender<String>>) -> Response {
    let authorized = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some("Bearer secret-token");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_rooms(socket, seen))
}

/// Acks every join and immediately confirms the trip.
async fn serve_rooms(mut socket: WebSocket, seen: mpsc::UnboundedSender<String>) {
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else { continue };
        let _ = seen.send(text.as_str().to_owned());
        let Ok(ClientMessage::JoinRoom { entity_id }) = decode_client_message(text.as_str()) else {
            continue;
        };
        let ack = json!({ "type": EVENT_ROOM_JOINED, "entityId": entity_id }).to_string();
        let update = EntityUpdate::status(entity_id, "confirmed").to_event_json().expect("encode update");
        for reply in [ack, update] {
            if socket.send(WsMessage::Text(reply.into())).await.is_err() {
                return;
            }
        }
    }
}

async fn serve() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route("/ws", get(ws_handler)).with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, rx)
}

#[test]
fn credential_debug_is_redacted() {
    let credential = Credential::bearer(TOKEN);
    assert_eq!(format!("{credential:?}"), "Credential(<redacted>)");
    assert_eq!(credential.token(), TOKEN);
    assert_eq!(credential.authorization_value(), "Bearer secret-token");
}

#[tokio::test]
async fn invalid_url_is_reported() {
    let Err(error) = WsConnector::new("not a url").connect(&Credential::bearer(TOKEN)).await else {
        panic!("connect should fail");
    };
    assert!(matches!(error, TransportError::InvalidUrl(ref url) if url == "not a url"));
}

#[tokio::test]
async fn bad_credential_maps_to_rejected() {
    let (addr, _seen) = serve().await;
    let connector = WsConnector::new(format!("ws://{addr}/ws"));
    let Err(error) = connector.connect(&Credential::bearer("wrong")).await else {
        panic!("handshake should be rejected");
    };
    assert!(matches!(error, TransportError::Rejected { status: 401 }));
}

#[tokio::test]
async fn transport_moves_text_both_ways() {
    let (addr, mut seen) = serve().await;
    let connector = WsConnector::new(format!("ws://{addr}/ws"));
    assert_eq!(connector.url(), format!("ws://{addr}/ws"));
    let Ok(mut transport) = connector.connect(&Credential::bearer(TOKEN)).await else {
        panic!("handshake should succeed");
    };

    transport.send(r#"{"type":"join_room","entityId":"trip-3"}"#.to_owned()).await.expect("send");
    let received = timeout(Duration::from_secs(2), seen.recv()).await.expect("server timed out");
    assert_eq!(received.as_deref(), Some(r#"{"type":"join_room","entityId":"trip-3"}"#));

    let ack = transport.recv().await.expect("ack").expect("ack text");
    assert!(ack.contains(EVENT_ROOM_JOINED));
    let update = transport.recv().await.expect("update").expect("update text");
    assert!(update.contains("confirmed"));

    transport.close().await;
}

#[tokio::test]
async fn sync_client_over_websocket_delivers_room_updates() {
    let (addr, mut seen) = serve().await;
    let sync = RealtimeSyncClient::websocket(format!("ws://{addr}/ws"), fast_policy(3));

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    sync.on_entity_update("trip-7", move |update| {
        assert_eq!(update.status.as_deref(), Some("confirmed"));
        counter.fetch_add(1, Ordering::SeqCst);
    });
    sync.subscribe("trip-7");
    sync.connect(Credential::bearer(TOKEN));

    let join = timeout(Duration::from_secs(2), seen.recv()).await.expect("join timed out");
    assert_eq!(join.map(|text| decode_client_message(&text).expect("decode")), Some(ClientMessage::join("trip-7".into())));
    wait_until("update delivered", || hits.load(Ordering::SeqCst) == 1).await;
    assert!(sync.is_connected());

    sync.disconnect();
    assert!(!sync.is_connected());
}
