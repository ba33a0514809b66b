//! Control-plane message envelopes: inbound commands, outbound results, the
//! retained registry snapshot, and the recording-selector toggle.
//!
//! One `#[derive(Serialize, Deserialize)]` struct per wire message;
//! validation constants for the device config payload are lifted from
//! `webapp/config_backend.py`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// An inbound command as received on the command topic. Fields accept either
/// of the two spellings the original deployments use (`target_dn`/`dn`,
/// `ip`/`target_ip`).
#[derive(Debug, Clone, Deserialize)]
pub struct RawCommand {
    pub command_id: Option<String>,
    #[serde(alias = "dn")]
    pub target_dn: Option<String>,
    #[serde(alias = "target_ip")]
    pub ip: Option<String>,
    pub port: Option<u16>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub payload: Option<Value>,
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Discover,
    DiscoverOnly,
    License,
    LicenseQuery,
    Raw,
    Control,
    Config,
}

/// Classify a command by its declared `type`, falling back to payload-key
/// sniffing for the untyped legacy shapes (`raw`/`custom`/`control` or any
/// payload containing `standby|filter|calibration|spiffs|log`).
pub fn classify(kind: Option<&str>, payload: Option<&Value>) -> CommandKind {
    match kind {
        Some("discover") => return CommandKind::Discover,
        Some("discover_only") => return CommandKind::DiscoverOnly,
        Some("license") | Some("license_apply") => return CommandKind::License,
        Some("license_query") => return CommandKind::LicenseQuery,
        Some("raw") | Some("custom") | Some("control") => return CommandKind::Raw,
        _ => {}
    }
    if let Some(Value::Object(map)) = payload {
        const CONTROL_KEYS: [&str; 5] = ["standby", "filter", "calibration", "spiffs", "log"];
        if CONTROL_KEYS.iter().any(|k| map.contains_key(*k)) {
            return CommandKind::Raw;
        }
    }
    CommandKind::Config
}

/// Device configuration payload constants, lifted from
/// `webapp/config_backend.py::_validate_pins`/`build_payload`.
pub const MAX_ANALOG: usize = 11;
pub const MAX_SELECT: usize = 13;
pub const MAX_SENSORS: usize = 143;
pub const PIN_MIN: u16 = 0;
pub const PIN_MAX: u16 = 255;
pub const PAYLOAD_MAX_BYTES: usize = 512;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfigPayload {
    pub analog: Vec<u16>,
    pub select: Vec<u16>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigValidationError {
    Empty(&'static str),
    TooMany { field: &'static str, max: usize },
    TooManySensors { count: usize },
    DuplicatePin(&'static str),
    PinOutOfRange { field: &'static str, pin: u16 },
    PayloadTooLarge { bytes: usize },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValidationError::Empty(field) => write!(f, "{field} must not be empty"),
            ConfigValidationError::TooMany { field, max } => {
                write!(f, "{field} may have at most {max} entries")
            }
            ConfigValidationError::TooManySensors { count } => write!(
                f,
                "analog*select = {count} exceeds the {MAX_SENSORS} sensor limit"
            ),
            ConfigValidationError::DuplicatePin(field) => {
                write!(f, "{field} contains a duplicate pin")
            }
            ConfigValidationError::PinOutOfRange { field, pin } => {
                write!(f, "{field} pin {pin} is outside [{PIN_MIN}, {PIN_MAX}]")
            }
            ConfigValidationError::PayloadTooLarge { bytes } => write!(
                f,
                "encoded payload is {bytes} bytes, exceeding the {PAYLOAD_MAX_BYTES} byte limit"
            ),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

fn validate_pins(field: &'static str, pins: &[u16], max_len: usize) -> Result<(), ConfigValidationError> {
    if pins.is_empty() {
        return Err(ConfigValidationError::Empty(field));
    }
    if pins.len() > max_len {
        return Err(ConfigValidationError::TooMany { field, max: max_len });
    }
    let mut seen = HashSet::with_capacity(pins.len());
    for &pin in pins {
        if !(PIN_MIN..=PIN_MAX).contains(&pin) {
            return Err(ConfigValidationError::PinOutOfRange { field, pin });
        }
        if !seen.insert(pin) {
            return Err(ConfigValidationError::DuplicatePin(field));
        }
    }
    Ok(())
}

impl DeviceConfigPayload {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        validate_pins("analog", &self.analog, MAX_ANALOG)?;
        validate_pins("select", &self.select, MAX_SELECT)?;
        let sensors = self.analog.len() * self.select.len();
        if sensors > MAX_SENSORS {
            return Err(ConfigValidationError::TooManySensors { count: sensors });
        }
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        // +1 for the trailing newline the TCP client appends on the wire.
        if encoded.len() + 1 > PAYLOAD_MAX_BYTES {
            return Err(ConfigValidationError::PayloadTooLarge {
                bytes: encoded.len() + 1,
            });
        }
        Ok(())
    }
}

/// Outbound result envelope published to
/// `<result_topic>/<agent_id>/<command_id>`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub agent_id: String,
    pub timestamp: String,
    pub command_id: String,
    pub dn: String,
    pub ip: Option<String>,
    pub status: ResultStatus,
    pub payload: Option<Value>,
    pub reply: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discoveries: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ok,
    Error,
}

/// Retained registry snapshot published to `<agent_topic>/<agent_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub agent_id: String,
    pub device_count: usize,
    pub devices: Vec<RegistryDeviceEntry>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDeviceEntry {
    pub dn: String,
    pub ip: String,
    pub last_seen_iso: String,
}

/// The recording-selector toggle received on the control topic.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRecord {
    pub dn: String,
    pub record: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_prefers_explicit_type() {
        assert_eq!(classify(Some("discover"), None), CommandKind::Discover);
        assert_eq!(
            classify(Some("license_apply"), None),
            CommandKind::License
        );
    }

    #[test]
    fn classify_sniffs_control_payload_keys() {
        let payload = json!({"standby": {"command": "enter"}});
        assert_eq!(classify(None, Some(&payload)), CommandKind::Raw);
    }

    #[test]
    fn classify_defaults_to_config() {
        let payload = json!({"analog": [1], "select": [2]});
        assert_eq!(classify(None, Some(&payload)), CommandKind::Config);
    }

    #[test]
    fn valid_config_passes() {
        let cfg = DeviceConfigPayload {
            analog: vec![1, 2],
            select: vec![3, 4, 5],
            model: Some("x".into()),
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_pins() {
        let cfg = DeviceConfigPayload {
            analog: vec![1, 1],
            select: vec![2],
            model: None,
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigValidationError::DuplicatePin("analog"))
        );
    }

    #[test]
    fn accepts_sensor_count_at_the_exact_limit() {
        // MAX_ANALOG * MAX_SELECT == MAX_SENSORS, so the per-list caps already
        // make this the ceiling; the product check exists as a standalone
        // invariant in case the two caps are ever loosened independently.
        let cfg = DeviceConfigPayload {
            analog: (0..MAX_ANALOG as u16).collect(),
            select: (20..20 + MAX_SELECT as u16).collect(),
            model: None,
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_empty_lists() {
        let cfg = DeviceConfigPayload {
            analog: vec![],
            select: vec![1],
            model: None,
        };
        assert_eq!(cfg.validate(), Err(ConfigValidationError::Empty("analog")));
    }

    #[test]
    fn raw_command_accepts_dn_alias() {
        let raw: RawCommand = serde_json::from_str(r#"{"dn": "ABC", "ip": "10.0.0.1"}"#).unwrap();
        assert_eq!(raw.target_dn.as_deref(), Some("ABC"));
    }
}
