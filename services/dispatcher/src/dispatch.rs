//! Command resolution and execution: turns one inbound command-topic message
//! into exactly one result envelope, never panicking and never blocking the
//! worker loop on anything but the TCP round trip or a discovery timeout.
//!
//! Pin validation lives in `etx_protocol::command`; the resolution pipeline
//! here only classifies, resolves an IP, and dispatches.

use async_trait::async_trait;
use chrono::Utc;
use etx_protocol::command::{
    classify, CommandKind, CommandResult, ControlRecord, DeviceConfigPayload, RawCommand,
    ResultStatus,
};
use etx_protocol::device_client::{self, DeviceClientError};
use etx_protocol::discovery::DiscoveryReply;
use etx_protocol::{Dn, Target};
use etx_registry::DeviceRegistry;
use serde_json::{json, Value};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

use crate::config::DispatcherConfig;

#[derive(Debug)]
pub enum DispatchError {
    MalformedCommand(String),
    MissingTarget,
    IpUnresolved,
    ValidationFailed(String),
    Device(DeviceClientError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::MalformedCommand(s) => write!(f, "malformed command: {s}"),
            DispatchError::MissingTarget => write!(f, "command has no target_dn"),
            DispatchError::IpUnresolved => write!(f, "ip_unresolved"),
            DispatchError::ValidationFailed(s) => write!(f, "validation_failed: {s}"),
            DispatchError::Device(e) => write!(f, "device error: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Abstracts the TCP device round trip so the resolution pipeline is
/// unit-testable without a live device.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn request(
        &self,
        addr: SocketAddr,
        request: &Value,
        connect_timeout: Duration,
        round_trip_timeout: Duration,
    ) -> Result<Value, DeviceClientError>;
}

pub struct TcpDeviceTransport;

#[async_trait]
impl DeviceTransport for TcpDeviceTransport {
    async fn request(
        &self,
        addr: SocketAddr,
        request: &Value,
        connect_timeout: Duration,
        round_trip_timeout: Duration,
    ) -> Result<Value, DeviceClientError> {
        device_client::request(addr, request, connect_timeout, round_trip_timeout).await
    }
}

/// Abstracts the discovery round trip the same way.
#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn discover(&self) -> Vec<DiscoveryReply>;
}

/// A reply's `mac` field doubles as its DN in this deployment family; a
/// discovery reply is only usable for registry update/target-match purposes
/// once its `mac` parses as a canonical DN.
fn reply_dn(reply: &DiscoveryReply) -> Option<Dn> {
    Dn::normalize(reply.mac.as_str()).ok()
}

pub struct DiscoverOutcome {
    pub count: usize,
    pub items: Vec<Value>,
}

fn replies_to_items(replies: &[DiscoveryReply]) -> Vec<Value> {
    replies
        .iter()
        .map(|r| {
            json!({
                "ip": r.ip, "mac": r.mac, "model": r.model, "port": r.port, "from": r.from,
            })
        })
        .collect()
}

/// Run discovery, update the registry with every well-formed DN seen, and
/// return the raw reply list for the result envelope's `discoveries` field.
pub async fn run_discover(
    discoverer: &dyn Discoverer,
    registry: &DeviceRegistry,
) -> DiscoverOutcome {
    let replies = discoverer.discover().await;
    for reply in &replies {
        if let Some(dn) = reply_dn(reply) {
            registry.update(dn, reply.ip.clone());
        }
    }
    let items = replies_to_items(&replies);
    DiscoverOutcome {
        count: items.len(),
        items,
    }
}

fn parse_target(raw: &RawCommand) -> Result<Target, DispatchError> {
    let text = raw
        .target_dn
        .as_deref()
        .ok_or(DispatchError::MissingTarget)?;
    Target::parse(text).map_err(|e| DispatchError::MalformedCommand(e.to_string()))
}

/// Resolve a device's IP, falling back to a live discovery probe when the
/// registry has nothing. On `IpUnresolved`, the probe's raw replies (possibly
/// empty) are returned alongside the error so the caller can attach them to
/// the result envelope as a discovery trace.
async fn resolve_ip(
    cfg: &DispatcherConfig,
    raw: &RawCommand,
    dn: &Dn,
    registry: &DeviceRegistry,
    discoverer: &dyn Discoverer,
) -> Result<(String, u16), (DispatchError, Vec<Value>)> {
    let port = raw.port.unwrap_or(cfg.device_tcp_port);

    if let Some(ip) = &raw.ip {
        return Ok((ip.clone(), port));
    }
    if let Some(ip) = registry.resolve(dn) {
        return Ok((ip, port));
    }

    let replies = discoverer.discover().await;
    if let Some(reply) = replies.iter().find(|r| reply_dn(r).as_ref() == Some(dn)) {
        return Ok((reply.ip.clone(), if reply.port != 0 { reply.port } else { port }));
    }
    if replies.len() == 1 {
        let reply = &replies[0];
        return Ok((reply.ip.clone(), if reply.port != 0 { reply.port } else { port }));
    }

    Err((DispatchError::IpUnresolved, replies_to_items(&replies)))
}

fn build_payload(kind: &CommandKind, raw: &RawCommand) -> Result<Value, DispatchError> {
    match kind {
        CommandKind::License => {
            let token = raw
                .payload
                .as_ref()
                .and_then(|p| p.get("license"))
                .and_then(Value::as_str)
                .ok_or_else(|| DispatchError::ValidationFailed("missing license token".into()))?;
            Ok(json!({ "license": token }))
        }
        CommandKind::LicenseQuery => Ok(json!({ "license": "?" })),
        CommandKind::Raw => raw
            .payload
            .clone()
            .ok_or_else(|| DispatchError::ValidationFailed("missing payload".into())),
        CommandKind::Config => {
            let payload = raw
                .payload
                .clone()
                .ok_or_else(|| DispatchError::ValidationFailed("missing payload".into()))?;
            let config: DeviceConfigPayload = serde_json::from_value(payload)
                .map_err(|e| DispatchError::ValidationFailed(e.to_string()))?;
            config
                .validate()
                .map_err(|e| DispatchError::ValidationFailed(e.to_string()))?;
            serde_json::to_value(&config).map_err(|e| DispatchError::ValidationFailed(e.to_string()))
        }
        CommandKind::Discover | CommandKind::DiscoverOnly => {
            unreachable!("discover kinds are handled before payload building")
        }
    }
}

/// Execute one inbound command end to end, returning the result envelope
/// that should be published to `<result_topic>/<agent_id>/<command_id>`.
/// Never returns an `Err` — every failure is folded into an error
/// [`CommandResult`] so the worker loop can publish unconditionally.
pub async fn handle_command(
    raw_bytes: &[u8],
    cfg: &DispatcherConfig,
    registry: &DeviceRegistry,
    transport: &dyn DeviceTransport,
    discoverer: &dyn Discoverer,
) -> CommandResult {
    let envelope = |command_id: String,
                    dn: String,
                    ip: Option<String>,
                    status: ResultStatus,
                    payload: Option<Value>,
                    reply: Option<Value>,
                    error: Option<String>,
                    requested_by: Option<String>,
                    discoveries: Option<Vec<Value>>| CommandResult {
        agent_id: cfg.config_agent_id.clone(),
        timestamp: Utc::now().to_rfc3339(),
        command_id,
        dn,
        ip,
        status,
        payload,
        reply,
        error,
        requested_by,
        source_topic: Some(cfg.config_cmd_topic.clone()),
        discoveries,
        broadcast: None,
    };

    let raw: RawCommand = match serde_json::from_slice(raw_bytes) {
        Ok(r) => r,
        Err(e) => {
            return envelope(
                Uuid::new_v4().to_string(),
                String::new(),
                None,
                ResultStatus::Error,
                None,
                None,
                Some(format!("malformed_command: {e}")),
                None,
                None,
            );
        }
    };

    let command_id = raw.command_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let requested_by = raw.requested_by.clone();

    let target = match parse_target(&raw) {
        Ok(t) => t,
        Err(e) => {
            return envelope(
                command_id,
                String::new(),
                None,
                ResultStatus::Error,
                None,
                None,
                Some(e.to_string()),
                requested_by,
                None,
            );
        }
    };
    let dn_text = match &target {
        Target::Device(dn) => dn.hex(),
        Target::All => "ALL".to_owned(),
    };

    let kind = classify(raw.kind.as_deref(), raw.payload.as_ref());

    if matches!(kind, CommandKind::Discover | CommandKind::DiscoverOnly) {
        let outcome = run_discover(discoverer, registry).await;
        return envelope(
            command_id,
            dn_text,
            None,
            ResultStatus::Ok,
            None,
            None,
            None,
            requested_by,
            Some(outcome.items),
        );
    }

    let dn = match &target {
        Target::Device(dn) => *dn,
        Target::All => {
            return envelope(
                command_id,
                dn_text,
                None,
                ResultStatus::Error,
                None,
                None,
                Some("ALL target is only valid for discover commands".into()),
                requested_by,
                None,
            );
        }
    };

    let (ip, port) = match resolve_ip(cfg, &raw, &dn, registry, discoverer).await {
        Ok(v) => v,
        Err((e, discoveries)) => {
            return envelope(
                command_id,
                dn_text,
                None,
                ResultStatus::Error,
                None,
                None,
                Some(e.to_string()),
                requested_by,
                Some(discoveries),
            );
        }
    };

    let payload = match build_payload(&kind, &raw) {
        Ok(p) => p,
        Err(e) => {
            return envelope(
                command_id,
                dn_text,
                Some(ip),
                ResultStatus::Error,
                None,
                None,
                Some(e.to_string()),
                requested_by,
                None,
            );
        }
    };

    let addr: SocketAddr = match format!("{ip}:{port}").parse() {
        Ok(a) => a,
        Err(_) => {
            return envelope(
                command_id,
                dn_text,
                Some(ip),
                ResultStatus::Error,
                Some(payload),
                None,
                Some("invalid device address".into()),
                requested_by,
                None,
            );
        }
    };

    match transport
        .request(addr, &payload, cfg.device_connect_timeout(), cfg.device_round_trip_timeout())
        .await
    {
        Ok(reply) => envelope(
            command_id,
            dn_text,
            Some(ip),
            ResultStatus::Ok,
            Some(payload),
            Some(reply),
            None,
            requested_by,
            None,
        ),
        Err(e) => envelope(
            command_id,
            dn_text,
            Some(ip),
            ResultStatus::Error,
            Some(payload),
            None,
            Some(e.to_string()),
            requested_by,
            None,
        ),
    }
}

/// Apply the recording-selector control-record toggle: `{dn, record}` on the
/// control topic. Returns the parsed record on success so the caller can
/// forward it to the sink.
pub fn parse_control_record(bytes: &[u8]) -> Result<ControlRecord, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTransport {
        reply: Value,
    }

    #[async_trait]
    impl DeviceTransport for MockTransport {
        async fn request(
            &self,
            _addr: SocketAddr,
            _request: &Value,
            _connect_timeout: Duration,
            _round_trip_timeout: Duration,
        ) -> Result<Value, DeviceClientError> {
            Ok(self.reply.clone())
        }
    }

    struct MockDiscoverer {
        replies: Vec<DiscoveryReply>,
    }

    #[async_trait]
    impl Discoverer for MockDiscoverer {
        async fn discover(&self) -> Vec<DiscoveryReply> {
            self.replies.clone()
        }
    }

    fn cfg() -> DispatcherConfig {
        DispatcherConfig::default()
    }

    #[tokio::test]
    async fn resolves_via_explicit_ip_and_sends_license_query() {
        let registry = DeviceRegistry::with_default_ttl();
        let transport = MockTransport {
            reply: json!({"device_mac": "AA", "licenses": []}),
        };
        let discoverer = MockDiscoverer { replies: vec![] };
        let cmd = json!({
            "command_id": "c1",
            "dn": "010203040506",
            "ip": "10.0.0.5",
            "type": "license_query",
        });
        let result = handle_command(
            cmd.to_string().as_bytes(),
            &cfg(),
            &registry,
            &transport,
            &discoverer,
        )
        .await;
        assert_eq!(result.status, ResultStatus::Ok);
        assert_eq!(result.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(result.payload.unwrap()["license"], "?");
    }

    #[tokio::test]
    async fn falls_back_to_registry_when_ip_absent() {
        let registry = DeviceRegistry::with_default_ttl();
        registry.update(Dn::normalize("010203040506").unwrap(), "10.0.0.9");
        let transport = MockTransport { reply: json!({"ok": true}) };
        let discoverer = MockDiscoverer { replies: vec![] };
        let cmd = json!({"dn": "010203040506", "type": "license_query"});
        let result = handle_command(
            cmd.to_string().as_bytes(),
            &cfg(),
            &registry,
            &transport,
            &discoverer,
        )
        .await;
        assert_eq!(result.ip.as_deref(), Some("10.0.0.9"));
    }

    #[tokio::test]
    async fn ip_unresolved_when_nothing_matches() {
        let registry = DeviceRegistry::with_default_ttl();
        let transport = MockTransport { reply: json!({}) };
        let discoverer = MockDiscoverer { replies: vec![] };
        let cmd = json!({"dn": "010203040506", "type": "license_query"});
        let result = handle_command(
            cmd.to_string().as_bytes(),
            &cfg(),
            &registry,
            &transport,
            &discoverer,
        )
        .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.error.as_deref(), Some("ip_unresolved"));
        assert_eq!(result.discoveries, Some(vec![]));
    }

    #[tokio::test]
    async fn single_discovery_result_is_used_as_fallback() {
        let registry = DeviceRegistry::with_default_ttl();
        let transport = MockTransport { reply: json!({}) };
        let discoverer = MockDiscoverer {
            replies: vec![DiscoveryReply {
                ip: "10.0.0.42".into(),
                mac: "FFFFFFFFFFFF".into(),
                model: "x1".into(),
                port: 22345,
                from: None,
            }],
        };
        let cmd = json!({"dn": "010203040506", "type": "license_query"});
        let result = handle_command(
            cmd.to_string().as_bytes(),
            &cfg(),
            &registry,
            &transport,
            &discoverer,
        )
        .await;
        assert_eq!(result.ip.as_deref(), Some("10.0.0.42"));
    }

    #[tokio::test]
    async fn config_command_fails_validation_with_duplicate_pins() {
        let registry = DeviceRegistry::with_default_ttl();
        let transport = MockTransport { reply: json!({}) };
        let discoverer = MockDiscoverer { replies: vec![] };
        let cmd = json!({
            "dn": "010203040506",
            "ip": "10.0.0.5",
            "payload": {"analog": [1, 1], "select": [2]},
        });
        let result = handle_command(
            cmd.to_string().as_bytes(),
            &cfg(),
            &registry,
            &transport,
            &discoverer,
        )
        .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert!(result.error.unwrap().contains("validation_failed"));
    }

    #[tokio::test]
    async fn discover_command_updates_registry_and_reports_count() {
        let registry = DeviceRegistry::with_default_ttl();
        let transport = MockTransport { reply: json!({}) };
        let discoverer = MockDiscoverer {
            replies: vec![DiscoveryReply {
                ip: "10.0.0.7".into(),
                mac: "010203040506".into(),
                model: "x1".into(),
                port: 22345,
                from: None,
            }],
        };
        let cmd = json!({"dn": "ALL", "type": "discover"});
        let result = handle_command(
            cmd.to_string().as_bytes(),
            &cfg(),
            &registry,
            &transport,
            &discoverer,
        )
        .await;
        assert_eq!(result.status, ResultStatus::Ok);
        assert_eq!(result.discoveries.unwrap().len(), 1);
        assert_eq!(
            registry.resolve(&Dn::normalize("010203040506").unwrap()),
            Some("10.0.0.7".into())
        );
    }

    #[test]
    fn control_record_parses() {
        let rec = parse_control_record(br#"{"dn": "010203040506", "record": true}"#).unwrap();
        assert!(rec.record);
    }

    #[test]
    fn build_raw_payload_forwards_verbatim() {
        let raw: RawCommand = serde_json::from_str(
            r#"{"dn": "010203040506", "payload": {"standby": {"command": "enter"}}}"#,
        )
        .unwrap();
        let kind = classify(raw.kind.as_deref(), raw.payload.as_ref());
        assert_eq!(kind, CommandKind::Raw);
        let payload = build_payload(&kind, &raw).unwrap();
        assert_eq!(payload["standby"]["command"], "enter");
    }
}
