//! Pure logic shared by the discovery probe: broadcast-address expansion and
//! reply deduplication. The UDP socket round trip itself lives in
//! `services/dispatcher::discovery`, which calls into this module.
//!
//! Broadcast address parsing accepts explicit dotted-quad addresses only;
//! CIDR and wildcard syntax are rejected rather than silently expanded.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

pub const DEFAULT_DISCOVER_PORT: u16 = 22346;
pub const DEFAULT_DISCOVER_MAGIC: &str = "GCU_DISCOVER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryAddrError {
    CidrNotAllowed(String),
    WildcardNotAllowed(String),
    InvalidOctet(String),
}

impl fmt::Display for DiscoveryAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryAddrError::CidrNotAllowed(s) => {
                write!(f, "CIDR notation is not allowed in a broadcast address: '{s}'")
            }
            DiscoveryAddrError::WildcardNotAllowed(s) => {
                write!(f, "wildcard notation is not allowed in a broadcast address: '{s}'")
            }
            DiscoveryAddrError::InvalidOctet(s) => write!(f, "invalid IPv4 address: '{s}'"),
        }
    }
}

impl std::error::Error for DiscoveryAddrError {}

/// Parse one explicit broadcast address, rejecting CIDR (`/`) and wildcard
/// (`*`) syntax outright rather than trying to expand them.
pub fn parse_broadcast_addr(s: &str) -> Result<Ipv4Addr, DiscoveryAddrError> {
    if s.contains('/') {
        return Err(DiscoveryAddrError::CidrNotAllowed(s.to_owned()));
    }
    if s.contains('*') {
        return Err(DiscoveryAddrError::WildcardNotAllowed(s.to_owned()));
    }
    s.parse::<Ipv4Addr>()
        .map_err(|_| DiscoveryAddrError::InvalidOctet(s.to_owned()))
}

/// Expand the configured broadcast address list, always including the
/// limited broadcast address `255.255.255.255`.
pub fn expand_broadcast_list(
    configured: &[String],
) -> Result<Vec<Ipv4Addr>, DiscoveryAddrError> {
    let mut out = Vec::with_capacity(configured.len() + 1);
    for s in configured {
        out.push(parse_broadcast_addr(s)?);
    }
    let limited = Ipv4Addr::new(255, 255, 255, 255);
    if !out.contains(&limited) {
        out.push(limited);
    }
    Ok(out)
}

/// A device's JSON reply to a discovery probe, augmented with the sender IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReply {
    pub ip: String,
    pub mac: String,
    pub model: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// Deduplicate replies by `(ip, mac, model, port)`, keeping first-seen order.
pub fn dedup_replies(replies: Vec<DiscoveryReply>) -> Vec<DiscoveryReply> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(replies.len());
    for reply in replies {
        let key = (
            reply.ip.clone(),
            reply.mac.clone(),
            reply.model.clone(),
            reply.port,
        );
        if seen.insert(key) {
            out.push(reply);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_cidr_and_wildcard() {
        assert_eq!(
            parse_broadcast_addr("10.0.0.0/24"),
            Err(DiscoveryAddrError::CidrNotAllowed("10.0.0.0/24".into()))
        );
        assert_eq!(
            parse_broadcast_addr("10.0.0.*"),
            Err(DiscoveryAddrError::WildcardNotAllowed("10.0.0.*".into()))
        );
    }

    #[test]
    fn expand_always_includes_limited_broadcast() {
        let list = expand_broadcast_list(&["10.0.0.255".to_owned()]).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&Ipv4Addr::new(255, 255, 255, 255)));
    }

    #[test]
    fn expand_does_not_duplicate_limited_broadcast() {
        let list = expand_broadcast_list(&["255.255.255.255".to_owned()]).unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn dedup_keeps_first_seen_order() {
        let a = DiscoveryReply {
            ip: "10.0.0.1".into(),
            mac: "AA".into(),
            model: "x".into(),
            port: 22345,
            from: None,
        };
        let replies = vec![a.clone(), a.clone()];
        assert_eq!(dedup_replies(replies), vec![a]);
    }
}
