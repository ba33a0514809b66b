//! GCU handshake: a per-remote-address state machine that moves devices from
//! noisy broadcast mode into unicast by periodically offering a `SUBSCRIBE`
//! token and watching for an `ACK`.
//!
//! States: `UNKNOWN -> PROBING -> SUBSCRIBED <-> STALE -> EVICTED`. A session
//! absent from the table is `UNKNOWN`; a removed session is `EVICTED`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct GcuConfig {
    pub subscribe_token: String,
    pub ack_token: String,
    pub broadcast_token: String,
    pub heartbeat_sec: Duration,
    pub fallback_sec: Duration,
    pub broadcast_on_exit: bool,
}

impl Default for GcuConfig {
    fn default() -> Self {
        GcuConfig {
            subscribe_token: "SUBSCRIBE".to_owned(),
            ack_token: "ACK".to_owned(),
            broadcast_token: "BROADCAST".to_owned(),
            heartbeat_sec: Duration::from_secs(2),
            fallback_sec: Duration::from_secs(10),
            broadcast_on_exit: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcuState {
    Probing,
    Subscribed,
    Stale,
}

struct RemoteSession {
    state: GcuState,
    last_seen: Instant,
    last_subscribe_sent: Option<Instant>,
    ack_received: bool,
}

/// What happened to an inbound datagram offered to the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// The packet was a recognised control token; it must not be enqueued
    /// as ingress data.
    ConsumedControl,
    /// Not a control token; the caller should treat it as sensor data.
    Data,
}

const MAX_TOKEN_LEN: usize = 64;

fn classify_token(cfg: &GcuConfig, data: &[u8]) -> Option<&'static str> {
    if data.len() > MAX_TOKEN_LEN || !data.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return None;
    }
    let text = std::str::from_utf8(data).ok()?;
    if text == cfg.subscribe_token {
        Some("subscribe")
    } else if text == cfg.ack_token {
        Some("ack")
    } else if text == cfg.broadcast_token {
        Some("broadcast")
    } else {
        None
    }
}

pub struct GcuHandshake {
    config: GcuConfig,
    sessions: Mutex<HashMap<SocketAddr, RemoteSession>>,
}

impl GcuHandshake {
    pub fn new(config: GcuConfig) -> Self {
        GcuHandshake {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Offer one inbound datagram from `addr` to the handshake.
    pub fn on_packet(&self, addr: SocketAddr, data: &[u8]) -> PacketOutcome {
        let mut guard = self.sessions.lock().expect("gcu mutex poisoned");
        let now = Instant::now();

        match classify_token(&self.config, data) {
            Some("ack") => {
                let session = guard.entry(addr).or_insert_with(|| RemoteSession {
                    state: GcuState::Probing,
                    last_seen: now,
                    last_subscribe_sent: None,
                    ack_received: false,
                });
                session.last_seen = now;
                session.ack_received = true;
                session.state = GcuState::Subscribed;
                PacketOutcome::ConsumedControl
            }
            Some("broadcast") => {
                guard.remove(&addr);
                PacketOutcome::ConsumedControl
            }
            Some("subscribe") => {
                // The collector is the only party that should send this
                // token; receiving one back is not a protocol violation
                // worth failing over, just ignore it as control.
                PacketOutcome::ConsumedControl
            }
            None => {
                let session = guard.entry(addr).or_insert_with(|| RemoteSession {
                    state: GcuState::Probing,
                    last_seen: now,
                    last_subscribe_sent: None,
                    ack_received: false,
                });
                session.last_seen = now;
                PacketOutcome::Data
            }
        }
    }

    /// Called every `heartbeat_sec`. Returns `(addrs_to_subscribe, evicted)`.
    pub fn heartbeat_tick(&self) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
        let mut guard = self.sessions.lock().expect("gcu mutex poisoned");
        let now = Instant::now();
        let mut to_subscribe = Vec::new();
        let mut evicted = Vec::new();

        guard.retain(|addr, session| {
            if now.duration_since(session.last_seen) > self.config.fallback_sec {
                evicted.push(*addr);
                return false;
            }
            session.state = if session.ack_received
                && now.duration_since(session.last_seen) <= self.config.heartbeat_sec
            {
                GcuState::Subscribed
            } else if session.ack_received {
                GcuState::Stale
            } else {
                GcuState::Probing
            };
            let due = session
                .last_subscribe_sent
                .map_or(true, |t| now.duration_since(t) >= self.config.heartbeat_sec);
            if due {
                session.last_subscribe_sent = Some(now);
                to_subscribe.push(*addr);
            }
            true
        });

        (to_subscribe, evicted)
    }

    /// Called on shutdown. If `broadcast_on_exit`, returns every live
    /// address (which should each receive exactly one `BROADCAST` token)
    /// and clears the table.
    pub fn shutdown(&self) -> Vec<SocketAddr> {
        let mut guard = self.sessions.lock().expect("gcu mutex poisoned");
        if !self.config.broadcast_on_exit {
            guard.clear();
            return Vec::new();
        }
        guard.drain().map(|(addr, _)| addr).collect()
    }

    pub fn subscribe_token(&self) -> &str {
        &self.config.subscribe_token
    }

    pub fn broadcast_token(&self) -> &str {
        &self.config.broadcast_token
    }

    #[cfg(test)]
    fn state_of(&self, addr: SocketAddr) -> Option<GcuState> {
        self.sessions
            .lock()
            .unwrap()
            .get(&addr)
            .map(|s| s.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn ack_token_marks_subscribed_and_is_consumed() {
        let gcu = GcuHandshake::new(GcuConfig::default());
        let outcome = gcu.on_packet(addr(1), b"ACK");
        assert_eq!(outcome, PacketOutcome::ConsumedControl);
        assert_eq!(gcu.state_of(addr(1)), Some(GcuState::Subscribed));
    }

    #[test]
    fn broadcast_token_evicts_the_session() {
        let gcu = GcuHandshake::new(GcuConfig::default());
        gcu.on_packet(addr(1), b"ACK");
        let outcome = gcu.on_packet(addr(1), b"BROADCAST");
        assert_eq!(outcome, PacketOutcome::ConsumedControl);
        assert_eq!(gcu.state_of(addr(1)), None);
    }

    #[test]
    fn data_packets_are_not_consumed_and_start_probing() {
        let gcu = GcuHandshake::new(GcuConfig::default());
        let outcome = gcu.on_packet(addr(1), &[0x5A, 0x5A, 1, 2, 3]);
        assert_eq!(outcome, PacketOutcome::Data);
        assert_eq!(gcu.state_of(addr(1)), Some(GcuState::Probing));
    }

    #[test]
    fn heartbeat_sends_subscribe_to_every_live_session() {
        let cfg = GcuConfig {
            heartbeat_sec: Duration::from_millis(0),
            ..GcuConfig::default()
        };
        let gcu = GcuHandshake::new(cfg);
        gcu.on_packet(addr(1), b"junk-data");
        let (to_subscribe, evicted) = gcu.heartbeat_tick();
        assert_eq!(to_subscribe, vec![addr(1)]);
        assert!(evicted.is_empty());
    }

    #[test]
    fn silence_past_fallback_evicts_on_heartbeat() {
        let cfg = GcuConfig {
            fallback_sec: Duration::from_millis(5),
            ..GcuConfig::default()
        };
        let gcu = GcuHandshake::new(cfg);
        gcu.on_packet(addr(1), b"ACK");
        std::thread::sleep(Duration::from_millis(20));
        let (_, evicted) = gcu.heartbeat_tick();
        assert_eq!(evicted, vec![addr(1)]);
        assert_eq!(gcu.state_of(addr(1)), None);
    }

    #[test]
    fn shutdown_returns_every_live_address_when_enabled() {
        let gcu = GcuHandshake::new(GcuConfig::default());
        gcu.on_packet(addr(1), b"ACK");
        gcu.on_packet(addr(2), b"ACK");
        let mut addrs = gcu.shutdown();
        addrs.sort();
        assert_eq!(addrs, vec![addr(1), addr(2)]);
        assert_eq!(gcu.state_of(addr(1)), None);
    }

    #[test]
    fn shutdown_returns_nothing_when_broadcast_on_exit_disabled() {
        let cfg = GcuConfig {
            broadcast_on_exit: false,
            ..GcuConfig::default()
        };
        let gcu = GcuHandshake::new(cfg);
        gcu.on_packet(addr(1), b"ACK");
        assert!(gcu.shutdown().is_empty());
    }

    #[test]
    fn control_token_must_be_short_and_printable() {
        let long = vec![b'A'; 100];
        assert_eq!(classify_token(&GcuConfig::default(), &long), None);
        assert_eq!(classify_token(&GcuConfig::default(), b"\x01\x02"), None);
    }
}
