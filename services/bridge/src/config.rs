//! Layered configuration for the bridge binary: defaults, overlaid by a TOML
//! file, overlaid by environment variables. Same layering as
//! `ingest_agent::config`/`dispatcher::config`.

use serde::Deserialize;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub mqtt_broker_host: String,
    pub mqtt_broker_port: u16,
    pub tls_enabled: bool,
    pub tls_insecure: bool,
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub topic_parsed_prefix: String,
    pub bridge_agent_id: String,
    pub http_listen_addr: String,
    pub sse_queue_len: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            mqtt_broker_host: "127.0.0.1".into(),
            mqtt_broker_port: 1883,
            tls_enabled: false,
            tls_insecure: false,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            mqtt_username: None,
            mqtt_password: None,
            topic_parsed_prefix: etx_protocol::topics::DEFAULT_TOPIC_PARSED_PREFIX.into(),
            bridge_agent_id: "bridge-1".into(),
            http_listen_addr: "0.0.0.0:8090".into(),
            sse_queue_len: 256,
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
    topic_parsed_prefix: Option<String>,
    bridge_agent_id: Option<String>,
    http_listen_addr: Option<String>,
    sse_queue_len: Option<usize>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    TlsRequired,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config file: {e}"),
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {e}"),
            ConfigError::TlsRequired => {
                write!(f, "MQTT_BROKER_PORT=8883 requires TLS_ENABLED=true")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn load(path: Option<&Path>) -> Result<BridgeConfig, ConfigError> {
    let raw = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).map_err(ConfigError::Io)?;
            toml::from_str(&text).map_err(ConfigError::Parse)?
        }
        None => RawConfig::default(),
    };
    let mut cfg = apply_raw(BridgeConfig::default(), raw);
    apply_env(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

fn apply_raw(mut cfg: BridgeConfig, raw: RawConfig) -> BridgeConfig {
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
    over!(topic_parsed_prefix);
    over!(bridge_agent_id);
    over!(http_listen_addr);
    over!(sse_queue_len);
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

fn apply_env(cfg: &mut BridgeConfig) {
    if let Ok(v) = std::env::var("MQTT_BROKER_HOST") {
        cfg.mqtt_broker_host = v;
    }
    if let Ok(v) = std::env::var("MQTT_BROKER_PORT") {
        if let Ok(port) = v.parse() {
            cfg.mqtt_broker_port = port;
        }
    }
    if let Ok(v) = std::env::var("TLS_ENABLED") {
        cfg.tls_enabled = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
    if let Ok(v) = std::env::var("TLS_INSECURE") {
        cfg.tls_insecure = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
    if let Ok(v) = std::env::var("HTTP_LISTEN_ADDR") {
        cfg.http_listen_addr = v;
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
}

fn validate(cfg: &BridgeConfig) -> Result<(), ConfigError> {
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
        assert!(validate(&BridgeConfig::default()).is_ok());
    }

    #[test]
    fn port_8883_without_tls_is_fatal() {
        let mut cfg = BridgeConfig::default();
        cfg.mqtt_broker_port = 8883;
        assert!(matches!(validate(&cfg), Err(ConfigError::TlsRequired)));
    }

    #[test]
    fn toml_overrides_http_listen_addr() {
        let raw: RawConfig = toml::from_str("http_listen_addr = \"127.0.0.1:9000\"\n").unwrap();
        let cfg = apply_raw(BridgeConfig::default(), raw);
        assert_eq!(cfg.http_listen_addr, "127.0.0.1:9000");
    }

    #[test]
    fn toml_overrides_tls_material_paths() {
        let raw: RawConfig = toml::from_str("client_cert_path = \"/etc/etx/client.pem\"\n").unwrap();
        let cfg = apply_raw(BridgeConfig::default(), raw);
        assert_eq!(cfg.client_cert_path.as_deref(), Some("/etc/etx/client.pem"));
    }
}
