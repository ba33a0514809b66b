//! Latest-sample-per-DN cache plus a broadcast fan-out for live updates.
//!
//! A single topic-keyed table plus one shared `broadcast::Sender`, since the
//! bridge has one logical stream, not one per reader connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAP: usize = 256;

/// One cached entry, keyed by topic. `dn` is the last path segment of
/// `topic` (the parsed-data topic is `<prefix>/<dn_hex>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub dn: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LatestCache {
    table: Arc<RwLock<HashMap<String, Entry>>>,
    updates: broadcast::Sender<Entry>,
}

impl LatestCache {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAP);
        LatestCache {
            table: Arc::new(RwLock::new(HashMap::new())),
            updates,
        }
    }

    /// Record a new sample for a DN and notify subscribers. Topics that
    /// don't carry a recognisable DN suffix are stored under the topic
    /// itself so nothing is silently dropped.
    pub fn update(&self, topic: &str, payload: serde_json::Value, received_at: DateTime<Utc>) {
        let dn = topic.rsplit('/').next().unwrap_or(topic).to_owned();
        let entry = Entry {
            dn: dn.clone(),
            topic: topic.to_owned(),
            payload,
            received_at,
        };
        self.table
            .write()
            .expect("latest cache mutex poisoned")
            .insert(dn, entry.clone());
        let _ = self.updates.send(entry);
    }

    pub fn get(&self, dn: &str) -> Option<Entry> {
        self.table.read().expect("latest cache mutex poisoned").get(dn).cloned()
    }

    pub fn snapshot(&self) -> Vec<Entry> {
        let table = self.table.read().expect("latest cache mutex poisoned");
        let mut entries: Vec<Entry> = table.values().cloned().collect();
        entries.sort_by(|a, b| a.dn.cmp(&b.dn));
        entries
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Entry> {
        self.updates.subscribe()
    }
}

impl Default for LatestCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn update_then_get_round_trips() {
        let cache = LatestCache::new();
        cache.update("etx/v1/parsed/010203040506", json!({"sn": 1}), now());
        let entry = cache.get("010203040506").unwrap();
        assert_eq!(entry.dn, "010203040506");
        assert_eq!(entry.payload["sn"], 1);
    }

    #[test]
    fn snapshot_is_sorted_by_dn() {
        let cache = LatestCache::new();
        cache.update("etx/v1/parsed/020000000000", json!({}), now());
        cache.update("etx/v1/parsed/010000000000", json!({}), now());
        let snap = cache.snapshot();
        assert_eq!(snap[0].dn, "010000000000");
        assert_eq!(snap[1].dn, "020000000000");
    }

    #[test]
    fn unknown_dn_returns_none() {
        let cache = LatestCache::new();
        assert!(cache.get("nope").is_none());
    }

    #[test]
    fn subscriber_receives_update() {
        let cache = LatestCache::new();
        let mut rx = cache.subscribe();
        cache.update("etx/v1/parsed/010203040506", json!({"sn": 2}), now());
        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.dn, "010203040506");
    }
}
