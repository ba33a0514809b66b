//! MQTT-facing glue for the sink subscriber: decodes a data-topic payload and
//! routes each sample to the session store, and applies the control-topic
//! record/stop toggle. The actual parsing/routing logic is pure and lives in
//! `etx_store::sink`; this module only knows about MQTT message shape
//! (retained vs. live).

use crate::dispatch::parse_control_record;
use chrono::Utc;
use etx_store::sink::{apply_control_record, decode_data_payload, dispatch_to_store, FieldMapping, RecordingSelector};
use etx_store::store::SessionStore;
use std::time::Instant;

pub struct DataOutcome {
    pub recorded: usize,
    pub dropped_not_selected: usize,
    pub errors: usize,
}

/// Handle one message on the data topic. Ingest time is "now" at the moment
/// the message is processed.
pub fn handle_data_message(
    payload: &[u8],
    mapping: &FieldMapping,
    selector: &RecordingSelector,
    store: &SessionStore,
) -> DataOutcome {
    let ingest_time = Instant::now();
    let ingest_wall = Utc::now();

    let mut outcome = DataOutcome {
        recorded: 0,
        dropped_not_selected: 0,
        errors: 0,
    };

    for result in decode_data_payload(payload, mapping) {
        match result {
            Ok(sample) => match dispatch_to_store(&sample, selector, store, ingest_time, ingest_wall) {
                Ok(etx_store::sink::RecordOutcome::Recorded) => outcome.recorded += 1,
                Ok(etx_store::sink::RecordOutcome::DroppedNotSelected) => {
                    outcome.dropped_not_selected += 1
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to persist sample");
                    outcome.errors += 1;
                }
            },
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed sample");
                outcome.errors += 1;
            }
        }
    }

    outcome
}

/// Handle one message on the control-record topic. Retained messages must be
/// ignored by the caller before this is invoked.
pub fn handle_control_message(payload: &[u8], selector: &RecordingSelector, store: &SessionStore) {
    match parse_control_record(payload) {
        Ok(record) => {
            if let Err(err) = apply_control_record(&record, selector, store) {
                tracing::warn!(error = %err, "failed to apply control record toggle");
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, "malformed control record message");
        }
    }
}
