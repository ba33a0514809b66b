//! The decoded telemetry record produced by [`crate::frame::parse`].

use crate::dn::Dn;
use serde::{Deserialize, Serialize};

/// One decoded sample: a frame's-worth of pressures plus the IMU triples.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub dn: Dn,
    pub sn: u8,
    /// Event time in seconds since the UNIX epoch (`ts_sec + ts_ms/1000`).
    pub ts: f64,
    pub pressures: Vec<i32>,
    pub mag: [f32; 3],
    pub gyro: [f32; 3],
    pub acc: [f32; 3],
}

impl Sample {
    /// `sn >= 1` and `pressures.len() == sn` hold for every value produced
    /// by [`crate::frame::parse`]; this re-checks it for values built by hand
    /// (e.g. in the sink, from JSON).
    pub fn is_well_formed(&self) -> bool {
        self.sn >= 1 && self.pressures.len() == self.sn as usize
    }
}

/// Canonical JSON wire shape for a parsed sample, keys `{ts, dn, sn, p, mag, gyro, acc}`.
///
/// Integer pressures stay integers on the wire; vector triples become floats.
/// This is what [`crate::frame::encode_parsed`] produces and what
/// `etx-store::sink` parses back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleJson {
    pub ts: f64,
    pub dn: String,
    pub sn: u8,
    pub p: Vec<i32>,
    pub mag: [f32; 3],
    pub gyro: [f32; 3],
    pub acc: [f32; 3],
}

impl From<&Sample> for SampleJson {
    fn from(s: &Sample) -> Self {
        SampleJson {
            ts: s.ts,
            dn: s.dn.hex(),
            sn: s.sn,
            p: s.pressures.clone(),
            mag: s.mag,
            gyro: s.gyro,
            acc: s.acc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_requires_matching_pressure_len() {
        let dn = Dn::normalize("010203040506").unwrap();
        let good = Sample {
            dn,
            sn: 2,
            ts: 1.0,
            pressures: vec![1, 2],
            mag: [0.0; 3],
            gyro: [0.0; 3],
            acc: [0.0; 3],
        };
        assert!(good.is_well_formed());

        let mut bad = good.clone();
        bad.pressures.push(3);
        assert!(!bad.is_well_formed());
    }

    #[test]
    fn json_roundtrip_keeps_integer_pressures() {
        let dn = Dn::normalize("010203040506").unwrap();
        let sample = Sample {
            dn,
            sn: 1,
            ts: 101.0,
            pressures: vec![42],
            mag: [1.0, 0.0, 0.0],
            gyro: [1.0, 0.0, 0.0],
            acc: [1.0, 0.0, 0.0],
        };
        let json = SampleJson::from(&sample);
        let text = serde_json::to_string(&json).unwrap();
        assert!(text.contains("\"p\":[42]"));
        let back: SampleJson = serde_json::from_str(&text).unwrap();
        assert_eq!(back, json);
    }
}
