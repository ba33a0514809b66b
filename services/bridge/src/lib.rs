//! Latest-sample cache and HTTP/SSE/WebSocket fan-out for one bridge
//! instance.

pub mod api;
pub mod cache;
pub mod config;
pub mod sse;
pub mod tls;
pub mod ws;

use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use crate::cache::LatestCache;

pub fn build_router(cache: Arc<LatestCache>) -> Router {
    Router::new()
        .route("/api/latest", get(api::get_latest))
        .route("/api/latest/{dn}", get(api::get_latest_dn))
        .route("/stream", get(sse::stream))
        .route("/ws", get(ws::upgrade))
        .with_state(cache)
}
