//! Maps `(DN, time)` to a [`CsvSession`], owning the single mutex that
//! serialises the per-DN session table. The mutex is released across disk
//! I/O: a handle is taken out of the map while holding the lock, the write
//! happens outside the lock, then the handle goes back in.

use crate::session::{resolve_event_time, CsvSession, SessionError};
use chrono::{DateTime, Utc};
use etx_protocol::{Dn, Sample};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct SessionStore {
    root: PathBuf,
    flush_every_rows: usize,
    idle_timeout: Duration,
    table: Mutex<HashMap<Dn, CsvSession>>,
}

impl SessionStore {
    pub fn new(root: PathBuf, flush_every_rows: usize, idle_timeout: Duration) -> Self {
        SessionStore {
            root,
            flush_every_rows,
            idle_timeout,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Write one sample, rotating the session first if the calendar day,
    /// idle gap, or `sn` require it.
    pub fn accept(
        &self,
        sample: &Sample,
        ingest_time: Instant,
        ingest_wall: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let event_time = resolve_event_time(sample.ts, ingest_wall);
        let new_day = event_time.wall.format("%Y%m%d").to_string();

        let mut existing = {
            let mut table = self.table.lock().expect("session table mutex poisoned");
            table.remove(&sample.dn)
        };

        let needs_rotation = existing.as_ref().is_some_and(|s| {
            s.day != new_day
                || ingest_time.duration_since(s.last_ingest_time) >= self.idle_timeout
                || s.sn != sample.sn
        });
        if needs_rotation {
            if let Some(session) = existing.take() {
                session.close()?;
            }
        }

        let mut session = match existing {
            Some(s) => s,
            None => CsvSession::create(
                &self.root,
                sample.dn,
                sample.sn,
                event_time,
                sample.ts,
                ingest_time,
                self.flush_every_rows,
            )?,
        };
        session.write_row(sample, ingest_time)?;

        self.table
            .lock()
            .expect("session table mutex poisoned")
            .insert(sample.dn, session);
        Ok(())
    }

    /// Close a DN's session if one is open. A no-op if it is already closed.
    pub fn close_session(&self, dn: &Dn) -> Result<(), StoreError> {
        let session = {
            self.table
                .lock()
                .expect("session table mutex poisoned")
                .remove(dn)
        };
        if let Some(session) = session {
            session.close()?;
        }
        Ok(())
    }

    /// Close every open session, used at shutdown.
    pub fn close_all(&self) -> Result<(), StoreError> {
        let sessions: Vec<CsvSession> = self
            .table
            .lock()
            .expect("session table mutex poisoned")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in sessions {
            session.close()?;
        }
        Ok(())
    }

    /// Close sessions idle beyond `idle_timeout`, measured by **ingest**
    /// time so the sweep is robust to device clock skew.
    pub fn sweep_idle(&self, now: Instant) {
        let stale: Vec<Dn> = {
            let table = self.table.lock().expect("session table mutex poisoned");
            table
                .iter()
                .filter(|(_, s)| now.duration_since(s.last_ingest_time) >= self.idle_timeout)
                .map(|(dn, _)| *dn)
                .collect()
        };
        for dn in stale {
            let session = {
                self.table
                    .lock()
                    .expect("session table mutex poisoned")
                    .remove(&dn)
            };
            if let Some(session) = session {
                if let Err(err) = session.close() {
                    tracing::warn!(dn = %dn, error = %err, "failed to close idle session");
                }
            }
        }
    }

    pub fn open_session_count(&self) -> usize {
        self.table.lock().expect("session table mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(hex: &str) -> Dn {
        Dn::normalize(hex).unwrap()
    }

    fn sample(dn: Dn, ts: f64, sn: u8) -> Sample {
        Sample {
            dn,
            sn,
            ts,
            pressures: vec![1; sn as usize],
            mag: [0.0; 3],
            gyro: [0.0; 3],
            acc: [0.0; 3],
        }
    }

    #[test]
    fn same_day_same_sn_reuses_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf(), 200, Duration::from_secs(20));
        let d = dn("010203040506");
        let now = Instant::now();
        let wall = Utc::now();
        store.accept(&sample(d, 1_700_000_000.0, 1), now, wall).unwrap();
        store.accept(&sample(d, 1_700_000_001.0, 1), now, wall).unwrap();
        assert_eq!(store.open_session_count(), 1);
    }

    #[test]
    fn sn_change_rotates_to_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf(), 200, Duration::from_secs(20));
        let d = dn("ABCDEF012345");
        let now = Instant::now();
        let wall = Utc::now();
        store.accept(&sample(d, 1_700_000_000.0, 2), now, wall).unwrap();
        store.accept(&sample(d, 1_700_000_000.5, 3), now, wall).unwrap();

        let day_dir = dir.path().join(d.hex()).join(wall.format("%Y%m%d").to_string());
        let mut files: Vec<_> = std::fs::read_dir(&day_dir).unwrap().collect();
        assert_eq!(files.len(), 2);
        files.sort_by_key(|e| e.as_ref().unwrap().file_name());
    }

    #[test]
    fn day_change_rotates_to_a_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf(), 200, Duration::from_secs(20));
        let d = dn("010203040506");
        let now = Instant::now();
        let wall = Utc::now();
        store.accept(&sample(d, 1_700_000_000.0, 1), now, wall).unwrap(); // 2023-11-14
        store.accept(&sample(d, 1_700_200_000.0, 1), now, wall).unwrap(); // 2023-11-17

        let dn_dir = dir.path().join(d.hex());
        let days: Vec<_> = std::fs::read_dir(&dn_dir).unwrap().collect();
        assert_eq!(days.len(), 2);
    }

    #[test]
    fn idle_timeout_rotates_on_next_accept() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf(), 200, Duration::from_millis(10));
        let d = dn("010203040506");
        let wall = Utc::now();
        store.accept(&sample(d, 1_700_000_000.0, 1), Instant::now(), wall).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        store.accept(&sample(d, 1_700_000_000.5, 1), Instant::now(), wall).unwrap();

        let day_dir = dir.path().join(d.hex()).join(wall.format("%Y%m%d").to_string());
        let files: Vec<_> = std::fs::read_dir(&day_dir).unwrap().collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn invalid_timestamp_still_persists_using_ingest_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf(), 200, Duration::from_secs(20));
        let d = dn("010203040506");
        store
            .accept(&sample(d, f64::NAN, 1), Instant::now(), Utc::now())
            .unwrap();
        assert_eq!(store.open_session_count(), 1);
    }

    #[test]
    fn close_session_on_already_closed_dn_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf(), 200, Duration::from_secs(20));
        let d = dn("010203040506");
        assert!(store.close_session(&d).is_ok());
        assert_eq!(store.open_session_count(), 0);
    }

    #[test]
    fn sweep_idle_closes_sessions_past_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf(), 200, Duration::from_millis(5));
        let d = dn("010203040506");
        store.accept(&sample(d, 1_700_000_000.0, 1), Instant::now(), Utc::now()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        store.sweep_idle(Instant::now());
        assert_eq!(store.open_session_count(), 0);
    }
}
