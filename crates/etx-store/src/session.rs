//! A single open CSV file for one DN: the rotation unit of the store.
//!
//! File layout: `<root>/<DN_HEX>/<YYYYMMDD>/<HHMMSS>.csv`, a comment line
//! `// DN: <hex>, SN: <n>`, a CSV header, then one row per sample.

use chrono::{DateTime, Utc};
use etx_protocol::{Dn, Sample};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to create session directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open session file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write session row: {0}")]
    Write(#[source] io::Error),
}

/// An event time resolved for rotation/file-naming purposes. Carries both
/// the wall-clock value used to build the path and whether it came from the
/// sample itself or from an ingest-time fallback.
#[derive(Debug, Clone, Copy)]
pub struct EventTime {
    pub wall: DateTime<Utc>,
    pub from_fallback: bool,
}

/// Resolve the sample's timestamp for rotation/naming, falling back to
/// `ingest_wall` when the sample's `ts` is non-positive, NaN, or infinite.
pub fn resolve_event_time(sample_ts: f64, ingest_wall: DateTime<Utc>) -> EventTime {
    if sample_ts.is_finite() && sample_ts > 0.0 {
        let secs = sample_ts.trunc() as i64;
        let nanos = ((sample_ts.fract()) * 1_000_000_000.0).round() as u32;
        if let Some(dt) = DateTime::from_timestamp(secs, nanos) {
            return EventTime {
                wall: dt,
                from_fallback: false,
            };
        }
    }
    EventTime {
        wall: ingest_wall,
        from_fallback: true,
    }
}

pub struct CsvSession {
    pub dn: Dn,
    pub day: String,
    pub sn: u8,
    pub file_path: PathBuf,
    pub last_event_time: f64,
    pub last_ingest_time: Instant,
    writer: File,
    rows_since_flush: usize,
    flush_every_rows: usize,
}

impl CsvSession {
    pub fn create(
        root: &std::path::Path,
        dn: Dn,
        sn: u8,
        event_time: EventTime,
        sample_ts: f64,
        ingest_time: Instant,
        flush_every_rows: usize,
    ) -> Result<Self, SessionError> {
        let day = event_time.wall.format("%Y%m%d").to_string();
        let hhmmss = event_time.wall.format("%H%M%S").to_string();
        let dir = root.join(dn.hex()).join(&day);
        fs::create_dir_all(&dir).map_err(|source| SessionError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        let file_path = dir.join(format!("{hhmmss}.csv"));
        let mut writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .map_err(|source| SessionError::OpenFile {
                path: file_path.clone(),
                source,
            })?;

        writeln!(writer, "// DN: {}, SN: {}", dn.hex(), sn).map_err(SessionError::Write)?;
        let mut header = String::from("Timestamp");
        for i in 1..=sn {
            header.push_str(&format!(",P{i}"));
        }
        header.push_str(",Mag_x,Mag_y,Mag_z,Gyro_x,Gyro_y,Gyro_z,Acc_x,Acc_y,Acc_z");
        writeln!(writer, "{header}").map_err(SessionError::Write)?;

        Ok(CsvSession {
            dn,
            day,
            sn,
            file_path,
            last_event_time: sample_ts,
            last_ingest_time: ingest_time,
            writer,
            rows_since_flush: 0,
            flush_every_rows,
        })
    }

    /// Write one row, padding/truncating pressures to exactly `self.sn` and
    /// defaulting missing vectors to `[0,0,0]`.
    pub fn write_row(
        &mut self,
        sample: &Sample,
        ingest_time: Instant,
    ) -> Result<(), SessionError> {
        let mut pressures = sample.pressures.clone();
        pressures.resize(self.sn as usize, 0);

        let mut line = format!("{}", sample.ts);
        for p in &pressures {
            line.push_str(&format!(",{p}"));
        }
        for v in [&sample.mag, &sample.gyro, &sample.acc] {
            for f in v {
                line.push_str(&format!(",{f}"));
            }
        }
        writeln!(self.writer, "{line}").map_err(SessionError::Write)?;

        self.last_event_time = sample.ts;
        self.last_ingest_time = ingest_time;
        self.rows_since_flush += 1;
        if self.rows_since_flush >= self.flush_every_rows {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SessionError> {
        self.writer.sync_data().map_err(SessionError::Write)?;
        self.rows_since_flush = 0;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), SessionError> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn() -> Dn {
        Dn::normalize("ABCDEF012345").unwrap()
    }

    fn sample(ts: f64, sn: u8, pressures: Vec<i32>) -> Sample {
        Sample {
            dn: dn(),
            sn,
            ts,
            pressures,
            mag: [0.0; 3],
            gyro: [0.0; 3],
            acc: [0.0; 3],
        }
    }

    #[test]
    fn resolve_event_time_uses_sample_ts_when_valid() {
        let fallback = Utc::now();
        let et = resolve_event_time(1_700_000_000.0, fallback);
        assert!(!et.from_fallback);
    }

    #[test]
    fn resolve_event_time_falls_back_on_invalid_ts() {
        let fallback = Utc::now();
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let et = resolve_event_time(bad, fallback);
            assert!(et.from_fallback, "{bad} should fall back");
        }
    }

    #[test]
    fn create_writes_header_prefix_and_csv_header() {
        let dir = tempfile::tempdir().unwrap();
        let et = resolve_event_time(1_700_000_000.0, Utc::now());
        let session = CsvSession::create(
            dir.path(),
            dn(),
            2,
            et,
            1_700_000_000.0,
            Instant::now(),
            200,
        )
        .unwrap();
        let contents = fs::read_to_string(&session.file_path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap(), "// DN: ABCDEF012345, SN: 2");
        assert_eq!(
            lines.next().unwrap(),
            "Timestamp,P1,P2,Mag_x,Mag_y,Mag_z,Gyro_x,Gyro_y,Gyro_z,Acc_x,Acc_y,Acc_z"
        );
    }

    #[test]
    fn write_row_pads_short_pressure_vector() {
        let dir = tempfile::tempdir().unwrap();
        let et = resolve_event_time(1_700_000_000.0, Utc::now());
        let mut session =
            CsvSession::create(dir.path(), dn(), 3, et, 1_700_000_000.0, Instant::now(), 200)
                .unwrap();
        session.write_row(&sample(1_700_000_000.5, 1, vec![42]), Instant::now()).unwrap();
        session.flush().unwrap();

        let contents = fs::read_to_string(&session.file_path).unwrap();
        let last_line = contents.lines().last().unwrap();
        let fields: Vec<&str> = last_line.split(',').collect();
        // Timestamp + 3 pressures + 9 vector components = 13 fields.
        assert_eq!(fields.len(), 13);
        assert_eq!(fields[1], "42");
        assert_eq!(fields[2], "0");
        assert_eq!(fields[3], "0");
    }
}
