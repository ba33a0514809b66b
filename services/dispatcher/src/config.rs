//! Layered configuration for the dispatcher binary: defaults, overlaid by a
//! TOML file, overlaid by environment variables. Same layering as
//! `ingest-agent::config`; duplicated rather than shared because the two
//! binaries' option sets only partially overlap.

use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub mqtt_broker_host: String,
    pub mqtt_broker_port: u16,
    pub tls_enabled: bool,
    pub tls_insecure: bool,
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,

    pub config_cmd_topic: String,
    pub config_result_topic: String,
    pub config_agent_topic_prefix: String,
    pub config_agent_id: String,
    pub control_record_topic: String,
    pub topic_parsed_prefix: String,

    pub registry_ttl_sec: u64,

    pub device_tcp_port: u16,
    pub device_tcp_connect_timeout_ms: u64,
    pub device_tcp_timeout_ms: u64,

    pub discover_port: u16,
    pub discover_magic: String,
    pub discover_attempts: u32,
    pub discover_gap_ms: u64,
    pub discover_timeout_ms: u64,
    pub discover_broadcasts: Vec<String>,

    pub worker_queue_size: usize,

    pub session_root: String,
    pub flush_every_rows: u64,
    pub idle_timeout_sec: u64,
}

impl DispatcherConfig {
    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_sec)
    }
    pub fn device_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.device_tcp_connect_timeout_ms)
    }
    pub fn device_round_trip_timeout(&self) -> Duration {
        Duration::from_millis(self.device_tcp_timeout_ms)
    }
    pub fn discover_gap(&self) -> Duration {
        Duration::from_millis(self.discover_gap_ms)
    }
    pub fn discover_timeout(&self) -> Duration {
        Duration::from_millis(self.discover_timeout_ms)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_sec)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            mqtt_broker_host: "127.0.0.1".into(),
            mqtt_broker_port: 1883,
            tls_enabled: false,
            tls_insecure: false,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            mqtt_username: None,
            mqtt_password: None,

            config_cmd_topic: etx_protocol::topics::DEFAULT_CONFIG_CMD_TOPIC.into(),
            config_result_topic: etx_protocol::topics::DEFAULT_CONFIG_RESULT_TOPIC.into(),
            config_agent_topic_prefix: etx_protocol::topics::DEFAULT_CONFIG_AGENT_TOPIC.into(),
            config_agent_id: "agent-1".into(),
            control_record_topic: etx_protocol::topics::DEFAULT_CONTROL_RECORD_TOPIC.into(),
            topic_parsed_prefix: etx_protocol::topics::DEFAULT_TOPIC_PARSED_PREFIX.into(),

            registry_ttl_sec: 300,

            device_tcp_port: 22345,
            device_tcp_connect_timeout_ms: 2000,
            device_tcp_timeout_ms: 3000,

            discover_port: etx_protocol::discovery::DEFAULT_DISCOVER_PORT,
            discover_magic: etx_protocol::discovery::DEFAULT_DISCOVER_MAGIC.into(),
            discover_attempts: 3,
            discover_gap_ms: 200,
            discover_timeout_ms: 1500,
            discover_broadcasts: Vec::new(),

            worker_queue_size: 256,

            session_root: "/var/lib/etx-ingest/sessions".into(),
            flush_every_rows: 200,
            idle_timeout_sec: 60,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    mqtt_broker_host: Option<String>,
    mqtt_broker_port: Option<u16>,
    tls_enabled: Option<bool>,
    tls_insecure: Option<bool>,
    ca_cert_path: Option<String>,
    client_cert_path: Option<String>,
    client_key_path: Option<String>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    config_cmd_topic: Option<String>,
    config_result_topic: Option<String>,
    config_agent_topic_prefix: Option<String>,
    config_agent_id: Option<String>,
    control_record_topic: Option<String>,
    topic_parsed_prefix: Option<String>,
    registry_ttl: Option<u64>,
    device_tcp_port: Option<u16>,
    device_tcp_connect_timeout_ms: Option<u64>,
    device_tcp_timeout_ms: Option<u64>,
    discover_port: Option<u16>,
    discover_magic: Option<String>,
    discover_attempts: Option<u32>,
    discover_gap_ms: Option<u64>,
    discover_timeout_ms: Option<u64>,
    discover_broadcasts: Option<Vec<String>>,
    worker_queue_size: Option<usize>,
    session_root: Option<String>,
    flush_every_rows: Option<u64>,
    idle_timeout_sec: Option<u64>,
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

pub fn load(path: Option<&Path>) -> Result<DispatcherConfig, ConfigError> {
    let raw = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).map_err(ConfigError::Io)?;
            toml::from_str(&text).map_err(ConfigError::Parse)?
        }
        None => RawConfig::default(),
    };
    let mut cfg = apply_raw(DispatcherConfig::default(), raw);
    apply_env(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn apply_raw(mut cfg: DispatcherConfig, raw: RawConfig) -> DispatcherConfig {
    macro_rules! over {
        ($field:ident) => {
            if let Some(v) = raw.$field {
                cfg.$field = v;
            }
        };
    }
    over!(mqtt_broker_host);
    over!(mqtt_broker_port);
    over!(tls_enabled);
    over!(tls_insecure);
    over!(config_cmd_topic);
    over!(config_result_topic);
    over!(config_agent_topic_prefix);
    over!(config_agent_id);
    over!(control_record_topic);
    over!(topic_parsed_prefix);
    over!(device_tcp_port);
    over!(device_tcp_connect_timeout_ms);
    over!(device_tcp_timeout_ms);
    over!(discover_port);
    over!(discover_magic);
    over!(discover_attempts);
    over!(discover_gap_ms);
    over!(discover_timeout_ms);
    over!(discover_broadcasts);
    over!(worker_queue_size);
    over!(session_root);
    over!(flush_every_rows);
    over!(idle_timeout_sec);
    if let Some(v) = raw.registry_ttl {
        cfg.registry_ttl_sec = v;
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
    cfg
}

fn apply_env(cfg: &mut DispatcherConfig) -> Result<(), ConfigError> {
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

    env_str!("MQTT_BROKER_HOST", mqtt_broker_host);
    env_num!("MQTT_BROKER_PORT", mqtt_broker_port);
    env_bool!("TLS_ENABLED", tls_enabled);
    env_bool!("TLS_INSECURE", tls_insecure);
    env_str!("CONFIG_CMD_TOPIC", config_cmd_topic);
    env_str!("CONFIG_RESULT_TOPIC", config_result_topic);
    env_str!("CONFIG_AGENT_TOPIC", config_agent_topic_prefix);
    env_str!("CONFIG_AGENT_ID", config_agent_id);
    env_num!("REGISTRY_TTL", registry_ttl_sec);
    env_num!("DEVICE_TCP_PORT", device_tcp_port);
    env_num!("DEVICE_TCP_TIMEOUT", device_tcp_timeout_ms);
    env_num!("DISCOVER_PORT", discover_port);
    env_str!("DISCOVER_MAGIC", discover_magic);
    env_num!("DISCOVER_ATTEMPTS", discover_attempts);
    env_num!("DISCOVER_GAP", discover_gap_ms);
    env_num!("DISCOVER_TIMEOUT", discover_timeout_ms);

    if let Ok(v) = std::env::var("DISCOVER_BROADCASTS") {
        cfg.discover_broadcasts = v.split(',').map(|s| s.trim().to_owned()).collect();
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

    Ok(())
}

fn validate(cfg: &DispatcherConfig) -> Result<(), ConfigError> {
    if cfg.mqtt_broker_port == 8883 && !cfg.tls_enabled {
        return Err(ConfigError::TlsRequired);
    }
    Ok(())
}
