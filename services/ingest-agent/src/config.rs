//! Layered configuration: built-in defaults, overlaid by a TOML file,
//! overlaid by environment variables, matching the original's
//! `configparser` + `os.getenv` layering.

use etx_protocol::topics::BatchSeparator;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub udp_listen_port: u16,
    pub udp_buf_bytes: usize,
    pub so_rcvbuf_bytes: Option<usize>,

    pub queue_size: usize,
    pub drop_policy: DropPolicy,
    pub batch_max_items: usize,
    pub batch_max_ms: u64,
    pub batch_separator: BatchSeparator,

    pub mqtt_broker_host: String,
    pub mqtt_broker_port: u16,
    pub tls_enabled: bool,
    pub tls_insecure: bool,
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,

    pub topic_raw: String,
    pub topic_parsed_prefix: String,
    pub publish_raw: bool,
    pub publish_parsed: bool,
    pub mqtt_qos: u8,

    pub config_agent_topic: String,
    pub config_agent_id: String,
    pub registry_ttl_sec: u64,
    pub registry_publish_sec: u64,

    pub gcu_enabled: bool,
    pub gcu_subscribe_token: String,
    pub gcu_ack_token: String,
    pub gcu_broadcast_token: String,
    pub gcu_heartbeat_sec: u64,
    pub gcu_fallback_sec: u64,
    pub gcu_broadcast_on_exit: bool,

    pub print_every_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    DropOldest,
    DropNew,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            udp_listen_port: 13250,
            udp_buf_bytes: 65536,
            so_rcvbuf_bytes: None,

            queue_size: 2000,
            drop_policy: DropPolicy::DropOldest,
            batch_max_items: 50,
            batch_max_ms: 200,
            batch_separator: BatchSeparator::None,

            mqtt_broker_host: "127.0.0.1".into(),
            mqtt_broker_port: 1883,
            tls_enabled: false,
            tls_insecure: false,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            mqtt_username: None,
            mqtt_password: None,

            topic_raw: etx_protocol::topics::DEFAULT_TOPIC_RAW.into(),
            topic_parsed_prefix: etx_protocol::topics::DEFAULT_TOPIC_PARSED_PREFIX.into(),
            publish_raw: false,
            publish_parsed: true,
            mqtt_qos: 1,

            config_agent_topic: etx_protocol::topics::DEFAULT_CONFIG_AGENT_TOPIC.into(),
            config_agent_id: "agent-1".into(),
            registry_ttl_sec: 300,
            registry_publish_sec: 5,

            gcu_enabled: false,
            gcu_subscribe_token: "SUBSCRIBE".into(),
            gcu_ack_token: "ACK".into(),
            gcu_broadcast_token: "BROADCAST".into(),
            gcu_heartbeat_sec: 2,
            gcu_fallback_sec: 10,
            gcu_broadcast_on_exit: true,

            print_every_ms: 2000,
        }
    }
}

impl AgentConfig {
    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_sec)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    udp_listen_port: Option<u16>,
    udp_buf_bytes: Option<usize>,
    so_rcvbuf_bytes: Option<usize>,
    queue_size: Option<usize>,
    drop_policy: Option<String>,
    batch_max_items: Option<usize>,
    batch_max_ms: Option<u64>,
    batch_separator: Option<String>,
    mqtt_broker_host: Option<String>,
    mqtt_broker_port: Option<u16>,
    tls_enabled: Option<bool>,
    tls_insecure: Option<bool>,
    ca_cert_path: Option<String>,
    client_cert_path: Option<String>,
    client_key_path: Option<String>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    topic_raw: Option<String>,
    topic_parsed_prefix: Option<String>,
    publish_raw: Option<bool>,
    publish_parsed: Option<bool>,
    mqtt_qos: Option<u8>,
    config_agent_topic: Option<String>,
    config_agent_id: Option<String>,
    registry_ttl: Option<u64>,
    registry_publish_sec: Option<u64>,
    gcu_enabled: Option<bool>,
    gcu_subscribe_token: Option<String>,
    gcu_ack_token: Option<String>,
    gcu_broadcast_token: Option<String>,
    gcu_heartbeat_sec: Option<u64>,
    gcu_fallback_sec: Option<u64>,
    gcu_broadcast_on_exit: Option<bool>,
    print_every_ms: Option<u64>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    InvalidValue { field: &'static str, value: String },
    TlsRequired,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config file: {e}"),
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {e}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "invalid value for {field}: '{value}'")
            }
            ConfigError::TlsRequired => {
                write!(f, "MQTT_BROKER_PORT=8883 requires TLS_ENABLED=true")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn load(path: Option<&Path>) -> Result<AgentConfig, ConfigError> {
    let raw = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).map_err(ConfigError::Io)?;
            load_from_str(&text)?
        }
        None => RawConfig::default(),
    };
    let mut cfg = apply_raw(AgentConfig::default(), raw);
    apply_env(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn load_from_str(text: &str) -> Result<RawConfig, ConfigError> {
    toml::from_str(text).map_err(ConfigError::Parse)
}

fn apply_raw(mut cfg: AgentConfig, raw: RawConfig) -> AgentConfig {
    macro_rules! over {
        ($field:ident) => {
            if let Some(v) = raw.$field {
                cfg.$field = v;
            }
        };
    }
    over!(udp_listen_port);
    over!(udp_buf_bytes);
    over!(queue_size);
    over!(batch_max_items);
    over!(batch_max_ms);
    over!(mqtt_broker_host);
    over!(mqtt_broker_port);
    over!(tls_enabled);
    over!(tls_insecure);
    over!(topic_raw);
    over!(topic_parsed_prefix);
    over!(publish_raw);
    over!(publish_parsed);
    over!(mqtt_qos);
    over!(config_agent_topic);
    over!(config_agent_id);
    over!(registry_publish_sec);
    over!(gcu_enabled);
    over!(gcu_subscribe_token);
    over!(gcu_ack_token);
    over!(gcu_broadcast_token);
    over!(gcu_heartbeat_sec);
    over!(gcu_fallback_sec);
    over!(gcu_broadcast_on_exit);
    over!(print_every_ms);
    if let Some(v) = raw.so_rcvbuf_bytes {
        cfg.so_rcvbuf_bytes = Some(v);
    }
    if let Some(v) = raw.ca_cert_path {
        cfg.ca_cert_path = Some(v);
    }
    if let Some(v) = raw.client_cert_path {
        cfg.client_cert_path = Some(v);
    }
    if let Some(v) = raw.client_key_path {
        cfg.client_key_path = Some(v);
    }
    if let Some(v) = raw.mqtt_username {
        cfg.mqtt_username = Some(v);
    }
    if let Some(v) = raw.mqtt_password {
        cfg.mqtt_password = Some(v);
    }
    if let Some(v) = raw.registry_ttl {
        cfg.registry_ttl_sec = v;
    }
    if let Some(s) = raw.drop_policy {
        if let Some(p) = parse_drop_policy(&s) {
            cfg.drop_policy = p;
        }
    }
    if let Some(s) = raw.batch_separator {
        if let Some(sep) = parse_separator(&s) {
            cfg.batch_separator = sep;
        }
    }
    cfg
}

fn parse_drop_policy(s: &str) -> Option<DropPolicy> {
    match s.to_ascii_lowercase().as_str() {
        "drop_oldest" => Some(DropPolicy::DropOldest),
        "drop_new" => Some(DropPolicy::DropNew),
        _ => None,
    }
}

fn parse_separator(s: &str) -> Option<BatchSeparator> {
    match s.to_ascii_uppercase().as_str() {
        "NONE" => Some(BatchSeparator::None),
        "NL" => Some(BatchSeparator::Nl),
        _ => None,
    }
}

fn apply_env(cfg: &mut AgentConfig) -> Result<(), ConfigError> {
    macro_rules! env_num {
        ($key:literal, $field:ident) => {
            if let Ok(v) = std::env::var($key) {
                cfg.$field = v
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue { field: $key, value: v })?;
            }
        };
    }
    macro_rules! env_str {
        ($key:literal, $field:ident) => {
            if let Ok(v) = std::env::var($key) {
                cfg.$field = v;
            }
        };
    }
    macro_rules! env_bool {
        ($key:literal, $field:ident) => {
            if let Ok(v) = std::env::var($key) {
                cfg.$field = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
            }
        };
    }

    env_num!("UDP_LISTEN_PORT", udp_listen_port);
    env_num!("UDP_BUF_BYTES", udp_buf_bytes);
    env_num!("BRIDGE_QUEUE_SIZE", queue_size);
    env_num!("BATCH_MAX_ITEMS", batch_max_items);
    env_num!("BATCH_MAX_MS", batch_max_ms);
    env_str!("MQTT_BROKER_HOST", mqtt_broker_host);
    env_num!("MQTT_BROKER_PORT", mqtt_broker_port);
    env_bool!("TLS_ENABLED", tls_enabled);
    env_bool!("TLS_INSECURE", tls_insecure);
    env_str!("TOPIC_RAW", topic_raw);
    env_str!("TOPIC_PARSED_PREFIX", topic_parsed_prefix);
    env_bool!("PUBLISH_RAW", publish_raw);
    env_bool!("PUBLISH_PARSED", publish_parsed);
    env_num!("MQTT_QOS", mqtt_qos);
    env_str!("CONFIG_AGENT_TOPIC", config_agent_topic);
    env_str!("CONFIG_AGENT_ID", config_agent_id);
    env_num!("REGISTRY_TTL", registry_ttl_sec);
    env_num!("REGISTRY_PUBLISH_SEC", registry_publish_sec);
    env_bool!("GCU_ENABLED", gcu_enabled);
    env_str!("GCU_SUBSCRIBE_TOKEN", gcu_subscribe_token);
    env_str!("GCU_ACK_TOKEN", gcu_ack_token);
    env_str!("GCU_BROADCAST_TOKEN", gcu_broadcast_token);
    env_num!("GCU_HEARTBEAT_SEC", gcu_heartbeat_sec);
    env_num!("GCU_FALLBACK_SEC", gcu_fallback_sec);
    env_bool!("GCU_BROADCAST_ON_EXIT", gcu_broadcast_on_exit);
    env_num!("PRINT_EVERY_MS", print_every_ms);

    if let Ok(v) = std::env::var("SO_RCVBUF_BYTES") {
        cfg.so_rcvbuf_bytes = Some(
            v.parse()
                .map_err(|_| ConfigError::InvalidValue { field: "SO_RCVBUF_BYTES", value: v })?,
        );
    }
    if let Ok(v) = std::env::var("CA_CERT") {
        cfg.ca_cert_path = Some(v);
    }
    if let Ok(v) = std::env::var("CLIENT_CERT") {
        cfg.client_cert_path = Some(v);
    }
    if let Ok(v) = std::env::var("CLIENT_KEY") {
        cfg.client_key_path = Some(v);
    }
    if let Ok(v) = std::env::var("USERNAME") {
        cfg.mqtt_username = Some(v);
    }
    if let Ok(v) = std::env::var("PASSWORD") {
        cfg.mqtt_password = Some(v);
    }
    if let Ok(v) = std::env::var("DROP_POLICY") {
        cfg.drop_policy = parse_drop_policy(&v)
            .ok_or_else(|| ConfigError::InvalidValue { field: "DROP_POLICY", value: v })?;
    }
    if let Ok(v) = std::env::var("BATCH_SEPARATOR") {
        cfg.batch_separator = parse_separator(&v)
            .ok_or_else(|| ConfigError::InvalidValue { field: "BATCH_SEPARATOR", value: v })?;
    }
    Ok(())
}

fn validate(cfg: &AgentConfig) -> Result<(), ConfigError> {
    if cfg.mqtt_broker_port == 8883 && !cfg.tls_enabled {
        return Err(ConfigError::TlsRequired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(validate(&AgentConfig::default()).is_ok());
    }

    #[test]
    fn toml_overrides_defaults() {
        let raw = load_from_str("udp_listen_port = 9999\ndrop_policy = \"drop_new\"\n").unwrap();
        let cfg = apply_raw(AgentConfig::default(), raw);
        assert_eq!(cfg.udp_listen_port, 9999);
        assert_eq!(cfg.drop_policy, DropPolicy::DropNew);
    }

    #[test]
    fn toml_overrides_so_rcvbuf_bytes() {
        let raw = load_from_str("so_rcvbuf_bytes = 4194304\n").unwrap();
        let cfg = apply_raw(AgentConfig::default(), raw);
        assert_eq!(cfg.so_rcvbuf_bytes, Some(4194304));
    }

    #[test]
    fn port_8883_without_tls_is_fatal() {
        let mut cfg = AgentConfig::default();
        cfg.mqtt_broker_port = 8883;
        cfg.tls_enabled = false;
        assert!(matches!(validate(&cfg), Err(ConfigError::TlsRequired)));
    }

    #[test]
    fn port_8883_with_tls_is_accepted() {
        let mut cfg = AgentConfig::default();
        cfg.mqtt_broker_port = 8883;
        cfg.tls_enabled = true;
        assert!(validate(&cfg).is_ok());
    }
}
