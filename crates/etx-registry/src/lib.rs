//! The device registry and GCU broadcast/unicast handshake: the two pieces
//! of per-remote, in-memory state the ingress path maintains alongside the
//! data plane.

pub mod gcu;
pub mod registry;

pub use gcu::{GcuConfig, GcuHandshake, GcuState, PacketOutcome};
pub use registry::{DeviceRegistry, RegistrySnapshotEntry};
