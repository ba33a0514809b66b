//! MQTT topic layout and defaults shared by every binary.
//!
//! The raw-batch separator is an out-of-band contract with consumers: the
//! publisher never infers one from the payload, and this crate does not try
//! to resegment a `NONE`-separated batch on read.

use serde::{Deserialize, Serialize};

pub const DEFAULT_TOPIC_RAW: &str = "etx/v1/raw";
pub const DEFAULT_TOPIC_PARSED_PREFIX: &str = "etx/v1/parsed";
pub const DEFAULT_CONFIG_AGENT_TOPIC: &str = "etx/v1/config/agents";
pub const DEFAULT_CONFIG_CMD_TOPIC: &str = "etx/v1/config/cmd";
pub const DEFAULT_CONFIG_RESULT_TOPIC: &str = "etx/v1/config/result";
pub const DEFAULT_CONTROL_RECORD_TOPIC: &str = "etx/v1/control/record";

/// How multiple raw frames in one publish are laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchSeparator {
    /// Frames are simply concatenated; consumers must know frame boundaries
    /// out-of-band (their own framing) to resegment.
    None,
    /// Frames are joined with a single `\n`.
    Nl,
}

impl Default for BatchSeparator {
    fn default() -> Self {
        BatchSeparator::None
    }
}

pub fn parsed_topic(prefix: &str, dn_hex: &str) -> String {
    format!("{prefix}/{dn_hex}")
}

pub fn agent_topic(prefix: &str, agent_id: &str) -> String {
    format!("{prefix}/{agent_id}")
}

pub fn result_topic(prefix: &str, agent_id: &str, command_id: &str) -> String {
    format!("{prefix}/{agent_id}/{command_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_expected_topic_strings() {
        assert_eq!(
            parsed_topic(DEFAULT_TOPIC_PARSED_PREFIX, "010203040506"),
            "etx/v1/parsed/010203040506"
        );
        assert_eq!(
            result_topic(DEFAULT_CONFIG_RESULT_TOPIC, "agent-1", "cmd-7"),
            "etx/v1/config/result/agent-1/cmd-7"
        );
    }

    #[test]
    fn default_separator_is_none() {
        assert_eq!(BatchSeparator::default(), BatchSeparator::None);
    }
}
