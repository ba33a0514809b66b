//! Wire formats for the ETX ingest pipeline: DN identity, the binary sensor
//! frame codec, the decoded sample, MQTT/TCP control-plane envelopes, and the
//! license token format. Pure logic only — no sockets, no disk.

pub mod command;
pub mod device_client;
pub mod discovery;
pub mod dn;
pub mod frame;
pub mod license;
pub mod sample;
pub mod topics;

pub use dn::{Dn, DnError, DnInput, Target};
pub use frame::{encode_binary, encode_parsed, extract_frames, parse, quick_dn, FrameError};
pub use sample::{Sample, SampleJson};
