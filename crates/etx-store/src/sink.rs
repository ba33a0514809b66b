//! Broker-to-store wiring: the recording selector, JSON (and legacy binary)
//! sample projection, and the control-topic record/stop toggle.

use chrono::{DateTime, Utc};
use etx_protocol::{Dn, Sample};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

/// The in-memory set of DNs currently authorised to persist to disk.
/// Mutated only by control messages.
#[derive(Default)]
pub struct RecordingSelector {
    dns: Mutex<HashSet<Dn>>,
}

impl RecordingSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, dn: Dn) {
        self.dns.lock().expect("selector mutex poisoned").insert(dn);
    }

    pub fn remove(&self, dn: &Dn) {
        self.dns.lock().expect("selector mutex poisoned").remove(dn);
    }

    pub fn contains(&self, dn: &Dn) -> bool {
        self.dns.lock().expect("selector mutex poisoned").contains(dn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsUnit {
    Seconds,
    Millis,
}

/// Configurable inbound JSON field names, resolved once at startup — the
/// parser walks this struct, never by reflection.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    pub dn: String,
    pub sn: String,
    pub ts: String,
    pub timems: String,
    pub press: String,
    pub mag: String,
    pub gyro: String,
    pub acc: String,
    pub ts_unit: TsUnit,
}

impl Default for FieldMapping {
    fn default() -> Self {
        FieldMapping {
            dn: "dn".into(),
            sn: "sn".into(),
            ts: "ts".into(),
            timems: "timems".into(),
            press: "p".into(),
            mag: "mag".into(),
            gyro: "gyro".into(),
            acc: "acc".into(),
            ts_unit: TsUnit::Seconds,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("payload is not a JSON object or array")]
    NotJsonObjectOrArray,
    #[error("field '{0}' is missing or has the wrong type")]
    MissingOrInvalidField(String),
    #[error("TS_UNIT=ms combined with a non-zero timems field is ambiguous")]
    AmbiguousTimestamp,
    #[error("dn '{0}' does not canonicalise to a valid device number")]
    InvalidDn(String),
}

fn get_f32_array(obj: &serde_json::Map<String, Value>, key: &str) -> Option<[f32; 3]> {
    let arr = obj.get(key)?.as_array()?;
    if arr.len() != 3 {
        return None;
    }
    let mut out = [0f32; 3];
    for (i, v) in arr.iter().enumerate() {
        out[i] = v.as_f64()? as f32;
    }
    Some(out)
}

/// Parse one JSON object into a [`Sample`] per `mapping`.
pub fn parse_json_sample(value: &Value, mapping: &FieldMapping) -> Result<Sample, SinkError> {
    let obj = value.as_object().ok_or(SinkError::NotJsonObjectOrArray)?;

    let dn_raw = obj
        .get(&mapping.dn)
        .and_then(|v| v.as_str())
        .ok_or_else(|| SinkError::MissingOrInvalidField(mapping.dn.clone()))?;
    let dn = Dn::normalize(dn_raw).map_err(|_| SinkError::InvalidDn(dn_raw.to_owned()))?;

    let sn = obj
        .get(&mapping.sn)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| SinkError::MissingOrInvalidField(mapping.sn.clone()))? as u8;

    let ts_raw = obj
        .get(&mapping.ts)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| SinkError::MissingOrInvalidField(mapping.ts.clone()))?;

    let timems = obj.get(&mapping.timems).and_then(|v| v.as_f64());

    let ts = match (mapping.ts_unit, timems) {
        (TsUnit::Millis, Some(ms)) if ms != 0.0 => return Err(SinkError::AmbiguousTimestamp),
        (TsUnit::Millis, _) => ts_raw / 1000.0,
        (TsUnit::Seconds, Some(ms)) => ts_raw + ms / 1000.0,
        (TsUnit::Seconds, None) => ts_raw,
    };

    let pressures: Vec<i32> = obj
        .get(&mapping.press)
        .and_then(|v| v.as_array())
        .ok_or_else(|| SinkError::MissingOrInvalidField(mapping.press.clone()))?
        .iter()
        .map(|v| v.as_i64().map(|n| n as i32))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| SinkError::MissingOrInvalidField(mapping.press.clone()))?;

    let mag = get_f32_array(obj, &mapping.mag).unwrap_or([0.0; 3]);
    let gyro = get_f32_array(obj, &mapping.gyro).unwrap_or([0.0; 3]);
    let acc = get_f32_array(obj, &mapping.acc).unwrap_or([0.0; 3]);

    Ok(Sample {
        dn,
        sn,
        ts,
        pressures,
        mag,
        gyro,
        acc,
    })
}

/// Parse a data-topic payload that may carry a single object or an array of
/// objects, per `mapping`. Malformed entries are dropped individually and do
/// not fail the whole batch; the caller counts failures.
pub fn parse_json_batch(value: &Value, mapping: &FieldMapping) -> Vec<Result<Sample, SinkError>> {
    match value {
        Value::Array(items) => items.iter().map(|v| parse_json_sample(v, mapping)).collect(),
        obj @ Value::Object(_) => vec![parse_json_sample(obj, mapping)],
        _ => vec![Err(SinkError::NotJsonObjectOrArray)],
    }
}

/// Decode one data-topic payload by sniffing `{`/`[` for JSON, falling back
/// to legacy binary frame extraction otherwise.
pub fn decode_data_payload(payload: &[u8], mapping: &FieldMapping) -> Vec<Result<Sample, SinkError>> {
    let trimmed = payload
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &payload[i..])
        .unwrap_or(payload);
    match trimmed.first() {
        Some(b'{') | Some(b'[') => match serde_json::from_slice::<Value>(trimmed) {
            Ok(value) => parse_json_batch(&value, mapping),
            Err(_) => vec![Err(SinkError::NotJsonObjectOrArray)],
        },
        _ => etx_protocol::extract_frames(trimmed)
            .into_iter()
            .map(Ok)
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    DroppedNotSelected,
}

impl fmt::Display for RecordOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordOutcome::Recorded => write!(f, "recorded"),
            RecordOutcome::DroppedNotSelected => write!(f, "dropped (not selected)"),
        }
    }
}

/// Route one decoded sample to the store, honouring the recording selector.
/// Persisted only if `sample.dn` is in `selector`; otherwise discarded
/// silently.
pub fn dispatch_to_store(
    sample: &Sample,
    selector: &RecordingSelector,
    store: &crate::store::SessionStore,
    ingest_time: Instant,
    ingest_wall: DateTime<Utc>,
) -> Result<RecordOutcome, crate::store::StoreError> {
    if !selector.contains(&sample.dn) {
        return Ok(RecordOutcome::DroppedNotSelected);
    }
    store.accept(sample, ingest_time, ingest_wall)?;
    Ok(RecordOutcome::Recorded)
}

/// Apply a control-topic record/stop toggle. Retained messages on this
/// topic are ignored by the caller before reaching here.
pub fn apply_control_record(
    control: &etx_protocol::command::ControlRecord,
    selector: &RecordingSelector,
    store: &crate::store::SessionStore,
) -> Result<(), crate::store::StoreError> {
    let Ok(dn) = Dn::normalize(control.dn.as_str()) else {
        tracing::debug!(dn = %control.dn, "control record toggle for invalid dn, dropping");
        return Ok(());
    };
    if control.record {
        selector.add(dn);
    } else {
        selector.remove(&dn);
        store.close_session(&dn)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dn() -> Dn {
        Dn::normalize("010203040506").unwrap()
    }

    #[test]
    fn selector_gates_unknown_dns() {
        let sel = RecordingSelector::new();
        assert!(!sel.contains(&dn()));
        sel.add(dn());
        assert!(sel.contains(&dn()));
        sel.remove(&dn());
        assert!(!sel.contains(&dn()));
    }

    #[test]
    fn parses_minimal_json_sample() {
        let mapping = FieldMapping::default();
        let value = json!({"dn": "010203040506", "sn": 1, "ts": 101.0, "p": [42]});
        let sample = parse_json_sample(&value, &mapping).unwrap();
        assert_eq!(sample.dn, dn());
        assert_eq!(sample.pressures, vec![42]);
        assert_eq!(sample.mag, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn ts_unit_ms_with_nonzero_timems_is_rejected() {
        let mapping = FieldMapping {
            ts_unit: TsUnit::Millis,
            ..FieldMapping::default()
        };
        let value = json!({"dn": "010203040506", "sn": 1, "ts": 101000.0, "timems": 500.0, "p": [1]});
        assert_eq!(
            parse_json_sample(&value, &mapping),
            Err(SinkError::AmbiguousTimestamp)
        );
    }

    #[test]
    fn ts_unit_seconds_combines_ts_and_timems() {
        let mapping = FieldMapping::default();
        let value = json!({"dn": "010203040506", "sn": 1, "ts": 100.0, "timems": 500.0, "p": [1]});
        let sample = parse_json_sample(&value, &mapping).unwrap();
        assert_eq!(sample.ts, 100.5);
    }

    #[test]
    fn batch_array_parses_each_entry_independently() {
        let mapping = FieldMapping::default();
        let value = json!([
            {"dn": "010203040506", "sn": 1, "ts": 1.0, "p": [1]},
            {"dn": "bad", "sn": 1, "ts": 1.0, "p": [1]},
        ]);
        let results = parse_json_batch(&value, &mapping);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn decode_data_payload_falls_back_to_binary_frames() {
        let mut frame = vec![0x5A, 0x5A];
        frame.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        frame.push(1);
        frame.extend_from_slice(&100u32.to_le_bytes());
        frame.extend_from_slice(&0u16.to_le_bytes());
        frame.extend_from_slice(&1i32.to_le_bytes());
        for _ in 0..9 {
            frame.extend_from_slice(&0f32.to_le_bytes());
        }
        frame.extend_from_slice(&[0xA5, 0xA5]);

        let mapping = FieldMapping::default();
        let results = decode_data_payload(&frame, &mapping);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }
}
