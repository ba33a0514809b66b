//! Binary sensor frame codec.
//!
//! Wire layout: `0x5A5A | DN[6] | SN[1] | ts_sec[4 LE] | ts_ms[2 LE] |
//! P[SN*4 LE int32] | Mag[3*f32 LE] | Gyro[3*f32 LE] | Acc[3*f32 LE] | 0xA5A5`.
//!
//! Mirrors `original_source/sensor2.py::parse_sensor_data`'s field offsets;
//! validates markers and length before touching the payload, returning a
//! typed error rather than panicking on a short or malformed buffer.

use crate::dn::Dn;
use crate::sample::{Sample, SampleJson};
use std::fmt;

pub const START_MARKER: [u8; 2] = [0x5A, 0x5A];
pub const END_MARKER: [u8; 2] = [0xA5, 0xA5];

/// Fixed bytes surrounding the per-channel pressure array and the three
/// 12-byte vector triples: `start(2) + dn(6) + sn(1) + ts_sec(4) + ts_ms(2)
/// + end(2)`.
const FIXED_OVERHEAD: usize = 17;
const VECTOR_BYTES: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    TooShort { need: usize, have: usize },
    BadStartMarker,
    BadEndMarker,
    ZeroChannels,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooShort { need, have } => {
                write!(f, "frame too short: need {need} bytes, have {have}")
            }
            FrameError::BadStartMarker => write!(f, "missing start marker 0x5A5A"),
            FrameError::BadEndMarker => write!(f, "missing or mismatched end marker 0xA5A5"),
            FrameError::ZeroChannels => write!(f, "frame declares sn=0, which is invalid"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Total on-wire length of a frame carrying `sn` pressure channels.
pub fn frame_len(sn: u8) -> usize {
    FIXED_OVERHEAD + 4 * sn as usize + VECTOR_BYTES
}

/// Parse exactly one frame from `bytes`, which must contain no trailing data
/// beyond the frame itself.
pub fn parse(bytes: &[u8]) -> Result<Sample, FrameError> {
    if bytes.len() < FIXED_OVERHEAD {
        return Err(FrameError::TooShort {
            need: FIXED_OVERHEAD,
            have: bytes.len(),
        });
    }
    if bytes[0..2] != START_MARKER {
        return Err(FrameError::BadStartMarker);
    }
    let dn_bytes: [u8; 6] = bytes[2..8].try_into().unwrap();
    let sn = bytes[8];
    if sn == 0 {
        return Err(FrameError::ZeroChannels);
    }
    let need = frame_len(sn);
    if bytes.len() < need {
        return Err(FrameError::TooShort {
            need,
            have: bytes.len(),
        });
    }
    let ts_sec = u32::from_le_bytes(bytes[9..13].try_into().unwrap());
    let ts_ms = u16::from_le_bytes(bytes[13..15].try_into().unwrap());

    let p_start = 15;
    let p_end = p_start + 4 * sn as usize;
    let mut pressures = Vec::with_capacity(sn as usize);
    for chunk in bytes[p_start..p_end].chunks_exact(4) {
        pressures.push(i32::from_le_bytes(chunk.try_into().unwrap()));
    }

    let mag = read_vec3(&bytes[p_end..p_end + 12]);
    let gyro = read_vec3(&bytes[p_end + 12..p_end + 24]);
    let acc = read_vec3(&bytes[p_end + 24..p_end + 36]);

    let end_at = p_end + 36;
    if bytes[end_at..end_at + 2] != END_MARKER {
        return Err(FrameError::BadEndMarker);
    }

    // Dn::normalize on the Bytes variant never errors.
    let dn = Dn::normalize(dn_bytes).expect("6-byte DN normalisation is infallible");

    Ok(Sample {
        dn,
        sn,
        ts: ts_sec as f64 + (ts_ms as f64 / 1000.0),
        pressures,
        mag,
        gyro,
        acc,
    })
}

fn read_vec3(b: &[u8]) -> [f32; 3] {
    [
        f32::from_le_bytes(b[0..4].try_into().unwrap()),
        f32::from_le_bytes(b[4..8].try_into().unwrap()),
        f32::from_le_bytes(b[8..12].try_into().unwrap()),
    ]
}

/// Scan `blob` for 0..N concatenated frames, skipping garbage runs between
/// them. Stops and returns what it has on any short trailing fragment
/// without consuming it — callers re-buffer and retry on the next datagram.
pub fn extract_frames(blob: &[u8]) -> Vec<Sample> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + FIXED_OVERHEAD <= blob.len() {
        if blob[i..i + 2] != START_MARKER {
            i += 1;
            continue;
        }
        let sn = blob[i + 8];
        if sn == 0 {
            i += 1;
            continue;
        }
        let need = frame_len(sn);
        if i + need > blob.len() {
            break;
        }
        match parse(&blob[i..i + need]) {
            Ok(sample) => {
                out.push(sample);
                i += need;
            }
            Err(_) => {
                i += 1;
            }
        }
    }
    out
}

/// Cheap DN extraction used when full parsing is disabled: checks the start
/// marker and a minimum length, then reads the DN field directly.
pub fn quick_dn(payload: &[u8]) -> Option<Dn> {
    if payload.len() < 8 || payload[0..2] != START_MARKER {
        return None;
    }
    let dn_bytes: [u8; 6] = payload[2..8].try_into().ok()?;
    Dn::normalize(dn_bytes).ok()
}

/// Encode a parsed [`Sample`] as its canonical `(dn_hex, json)` pair.
pub fn encode_parsed(sample: &Sample) -> (String, SampleJson) {
    let json = SampleJson::from(sample);
    (sample.dn.hex(), json)
}

/// Re-encode a [`Sample`] back to its on-wire binary form, used by the
/// framing round-trip property test.
pub fn encode_binary(sample: &Sample) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame_len(sample.sn));
    buf.extend_from_slice(&START_MARKER);
    buf.extend_from_slice(sample.dn.as_bytes());
    buf.push(sample.sn);
    let ts_sec = sample.ts.trunc() as u32;
    let ts_ms = ((sample.ts.fract()) * 1000.0).round() as u16;
    buf.extend_from_slice(&ts_sec.to_le_bytes());
    buf.extend_from_slice(&ts_ms.to_le_bytes());
    for p in &sample.pressures {
        buf.extend_from_slice(&p.to_le_bytes());
    }
    for v in [&sample.mag, &sample.gyro, &sample.acc] {
        for f in v {
            buf.extend_from_slice(&f.to_le_bytes());
        }
    }
    buf.extend_from_slice(&END_MARKER);
    buf
}
