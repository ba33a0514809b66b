//! The CSV session store: per-DN file rotation, the recording selector, and
//! the JSON/legacy-binary sink that projects broker messages into samples.

pub mod session;
pub mod sink;
pub mod store;

pub use session::{resolve_event_time, CsvSession, EventTime, SessionError};
pub use sink::{
    apply_control_record, decode_data_payload, dispatch_to_store, parse_json_batch,
    parse_json_sample, FieldMapping, RecordOutcome, RecordingSelector, SinkError, TsUnit,
};
pub use store::{SessionStore, StoreError};
