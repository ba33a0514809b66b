//! Optional WebSocket surface mirroring the SSE `update` events. No
//! snapshot-on-connect here; a client that wants the current cache state
//! calls `GET /api/latest` first.

use crate::cache::LatestCache;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use std::sync::Arc;

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(cache): State<Arc<LatestCache>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle(socket, cache))
}

async fn handle(mut socket: WebSocket, cache: Arc<LatestCache>) {
    let mut rx = cache.subscribe();
    loop {
        tokio::select! {
            update = rx.recv() => {
                let entry = match update {
                    Ok(entry) => entry,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Ok(json) = serde_json::to_string(&entry) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
