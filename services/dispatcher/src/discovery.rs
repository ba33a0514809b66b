//! Socket I/O for the discovery probe. The matching/parsing logic lives in
//! `etx_protocol::discovery`; this module owns the UDP broadcast round trip.

use crate::config::DispatcherConfig;
use etx_protocol::discovery::{dedup_replies, expand_broadcast_list, DiscoveryReply};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::time::Instant;
use tokio::net::UdpSocket;

pub async fn run_discovery(cfg: &DispatcherConfig) -> std::io::Result<Vec<DiscoveryReply>> {
    let broadcasts = expand_broadcast_list(&cfg.discover_broadcasts).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "invalid discover_broadcasts entry, falling back to limited broadcast");
        vec![Ipv4Addr::new(255, 255, 255, 255)]
    });

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.set_broadcast(true)?;

    for round in 0..cfg.discover_attempts {
        for addr in &broadcasts {
            let dest = (std::net::IpAddr::V4(*addr), cfg.discover_port);
            if let Err(err) = socket.send_to(cfg.discover_magic.as_bytes(), dest).await {
                tracing::warn!(error = %err, %addr, "discovery probe send failed");
            }
        }
        if round + 1 < cfg.discover_attempts {
            tokio::time::sleep(cfg.discover_gap()).await;
        }
    }

    let mut replies = Vec::new();
    let deadline = Instant::now() + cfg.discover_timeout();
    let mut buf = vec![0u8; 4096];
    loop {
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(d) if !d.is_zero() => d,
            _ => break,
        };
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, src))) => {
                if let Ok(value) = serde_json::from_slice::<Value>(&buf[..n]) {
                    if let Some(reply) = parse_reply(&value, &src.ip().to_string()) {
                        replies.push(reply);
                    }
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "discovery recv error");
                break;
            }
            Err(_) => break,
        }
    }

    Ok(dedup_replies(replies))
}

fn parse_reply(value: &Value, from: &str) -> Option<DiscoveryReply> {
    let ip = value.get("ip")?.as_str()?.to_owned();
    let mac = value.get("mac")?.as_str()?.to_owned();
    let model = value.get("model")?.as_str()?.to_owned();
    let port = value.get("port").and_then(Value::as_u64).unwrap_or(0) as u16;
    Some(DiscoveryReply {
        ip,
        mac,
        model,
        port,
        from: Some(from.to_owned()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reply_requires_ip_mac_model() {
        let v: Value = serde_json::json!({"ip": "10.0.0.5", "mac": "AA:BB", "model": "x1", "port": 22345});
        let reply = parse_reply(&v, "10.0.0.5").unwrap();
        assert_eq!(reply.port, 22345);
        assert_eq!(reply.from.as_deref(), Some("10.0.0.5"));

        let missing: Value = serde_json::json!({"ip": "10.0.0.5"});
        assert!(parse_reply(&missing, "10.0.0.5").is_none());
    }
}
