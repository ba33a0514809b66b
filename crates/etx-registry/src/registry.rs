//! Thread-safe `DN -> (ip, last_seen)` device registry with TTL-based lazy
//! eviction. The sole authority the dispatcher consults to turn a DN into an
//! IP when the operator did not supply one.

use chrono::{DateTime, SecondsFormat, Utc};
use etx_protocol::Dn;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry {
    ip: String,
    last_seen: Instant,
    last_seen_wall: DateTime<Utc>,
}

/// `DN -> (ip, last_seen)`, guarded by its own mutex.
pub struct DeviceRegistry {
    ttl: Duration,
    entries: Mutex<HashMap<Dn, Entry>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySnapshotEntry {
    pub dn: Dn,
    pub ip: String,
    pub last_seen_iso: String,
}

impl DeviceRegistry {
    pub fn new(ttl: Duration) -> Self {
        DeviceRegistry {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_TTL)
    }

    /// Upsert a DN with a monotonic "now". A DN that fails [`Dn::normalize`]
    /// at the call site should never reach here; this is the last line of
    /// defence against an empty IP string.
    pub fn update(&self, dn: Dn, ip: impl Into<String>) {
        let ip = ip.into();
        if ip.is_empty() {
            return;
        }
        let mut guard = self.entries.lock().expect("registry mutex poisoned");
        guard.insert(
            dn,
            Entry {
                ip,
                last_seen: Instant::now(),
                last_seen_wall: Utc::now(),
            },
        );
    }

    /// Resolve `dn` to its last-known IP, evicting it first if stale.
    pub fn resolve(&self, dn: &Dn) -> Option<String> {
        let mut guard = self.entries.lock().expect("registry mutex poisoned");
        self.evict_if_stale(&mut guard, dn);
        guard.get(dn).map(|e| e.ip.clone())
    }

    /// Evict every stale entry, then return a snapshot ordered by DN hex.
    pub fn snapshot(&self) -> Vec<RegistrySnapshotEntry> {
        let mut guard = self.entries.lock().expect("registry mutex poisoned");
        let now = Instant::now();
        guard.retain(|_, e| now.duration_since(e.last_seen) <= self.ttl);
        let mut out: Vec<RegistrySnapshotEntry> = guard
            .iter()
            .map(|(dn, e)| RegistrySnapshotEntry {
                dn: *dn,
                ip: e.ip.clone(),
                last_seen_iso: e.last_seen_wall.to_rfc3339_opts(SecondsFormat::Secs, true),
            })
            .collect();
        out.sort_by(|a, b| a.dn.hex().cmp(&b.dn.hex()));
        out
    }

    fn evict_if_stale(&self, guard: &mut HashMap<Dn, Entry>, dn: &Dn) {
        let stale = guard
            .get(dn)
            .is_some_and(|e| Instant::now().duration_since(e.last_seen) > self.ttl);
        if stale {
            guard.remove(dn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(hex: &str) -> Dn {
        Dn::normalize(hex).unwrap()
    }

    #[test]
    fn update_then_resolve_round_trips() {
        let reg = DeviceRegistry::with_default_ttl();
        reg.update(dn("010203040506"), "10.0.0.1");
        assert_eq!(reg.resolve(&dn("010203040506")), Some("10.0.0.1".into()));
    }

    #[test]
    fn resolve_returns_none_for_unknown_dn() {
        let reg = DeviceRegistry::with_default_ttl();
        assert_eq!(reg.resolve(&dn("010203040506")), None);
    }

    #[test]
    fn ttl_expiry_evicts_on_read_and_from_snapshot() {
        let reg = DeviceRegistry::new(Duration::from_millis(10));
        reg.update(dn("010203040506"), "10.0.0.1");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(reg.resolve(&dn("010203040506")), None);
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn snapshot_is_ordered_by_dn_hex() {
        let reg = DeviceRegistry::with_default_ttl();
        reg.update(dn("020000000000"), "10.0.0.2");
        reg.update(dn("010000000000"), "10.0.0.1");
        let snap = reg.snapshot();
        assert_eq!(snap[0].dn.hex(), "010000000000");
        assert_eq!(snap[1].dn.hex(), "020000000000");
    }

    #[test]
    fn empty_ip_is_ignored() {
        let reg = DeviceRegistry::with_default_ttl();
        reg.update(dn("010203040506"), "");
        assert_eq!(reg.resolve(&dn("010203040506")), None);
    }
}
