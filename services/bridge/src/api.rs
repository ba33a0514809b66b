//! REST surface over the latest-sample cache.

use crate::cache::LatestCache;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

pub async fn get_latest(State(cache): State<Arc<LatestCache>>) -> impl IntoResponse {
    Json(json!({ "data": cache.snapshot() }))
}

pub async fn get_latest_dn(
    State(cache): State<Arc<LatestCache>>,
    Path(dn): Path<String>,
) -> impl IntoResponse {
    match cache.get(&dn.to_ascii_uppercase()) {
        Some(entry) => (StatusCode::OK, Json(serde_json::to_value(entry).unwrap())).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" }))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn router(cache: Arc<LatestCache>) -> Router {
        Router::new()
            .route("/api/latest", get(get_latest))
            .route("/api/latest/{dn}", get(get_latest_dn))
            .with_state(cache)
    }

    #[tokio::test]
    async fn latest_dn_returns_404_when_absent() {
        let cache = Arc::new(LatestCache::new());
        let response = router(cache)
            .oneshot(Request::builder().uri("/api/latest/010203040506").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn latest_dn_returns_entry_when_present() {
        let cache = Arc::new(LatestCache::new());
        cache.update("etx/v1/parsed/010203040506", serde_json::json!({"sn": 3}), Utc::now());
        let response = router(cache)
            .oneshot(Request::builder().uri("/api/latest/010203040506").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["payload"]["sn"], 3);
    }

    #[tokio::test]
    async fn latest_lists_all_entries() {
        let cache = Arc::new(LatestCache::new());
        cache.update("etx/v1/parsed/010000000000", serde_json::json!({}), Utc::now());
        cache.update("etx/v1/parsed/020000000000", serde_json::json!({}), Utc::now());
        let response = router(cache)
            .oneshot(Request::builder().uri("/api/latest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["data"].as_array().unwrap().len(), 2);
    }
}
