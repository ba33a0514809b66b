//! Server-Sent Events endpoint: first event is a `snapshot` of the whole
//! cache, then one `update` event per subsequent sample. A lagged receiver
//! (slow client) resyncs by resubscribing rather than replaying missed
//! events, since `tokio::sync::broadcast` already drops the oldest entries
//! for it on overflow.

use crate::cache::LatestCache;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

pub async fn stream(
    State(cache): State<Arc<LatestCache>>,
) -> Sse<impl futures_util::stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = cache.subscribe();
    let snapshot = serde_json::json!({ "data": cache.snapshot() });
    let initial = tokio_stream::once(Ok(Event::default().event("snapshot").data(snapshot.to_string())));

    let updates = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(entry) => match serde_json::to_string(&entry) {
            Ok(json) => Some(Ok(Event::default().event("update").data(json))),
            Err(_) => None,
        },
        Err(_) => Some(Ok(Event::default().event("resync").data("{}"))),
    });

    let stream = initial.chain(updates);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
