// src/recovery.rs
//
// Last-known occupancy on local disk. Read once at startup, rewritten after
// every committed event and at bootstrap handover. Writes go to a sibling
// temp file that is fsynced and renamed over the target, so a crash leaves
// either the previous record or the new one.

use crate::error::RecoveryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub ts: DateTime<Utc>,
    pub occupancy: u32,
}

pub struct RecoveryState {
    path: PathBuf,
}

impl RecoveryState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no record exists. An unreadable or corrupt record is
    /// logged and also treated as absent.
    pub fn load(&self) -> Option<RecoveryRecord> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("⚠️  Cannot read recovery record {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str::<RecoveryRecord>(&contents) {
            Ok(record) => {
                info!(
                    "♻️  Recovery record found: occupancy {} at {}",
                    record.occupancy,
                    record.ts.to_rfc3339()
                );
                Some(record)
            }
            Err(e) => {
                warn!("⚠️  Ignoring corrupt recovery record {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Durably replace the record. Returns once the data is on disk.
    pub fn persist(&self, occupancy: u32) -> Result<RecoveryRecord, RecoveryError> {
        let record = RecoveryRecord {
            ts: Utc::now(),
            occupancy,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            serde_json::to_writer(&mut file, &record)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let state = RecoveryState::new(dir.path().join("last.json"));
        assert!(state.load().is_none());
    }

    #[test]
    fn test_persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let state = RecoveryState::new(dir.path().join("state").join("last.json"));
        state.persist(12).unwrap();
        state.persist(13).unwrap();
        let record = state.load().unwrap();
        assert_eq!(record.occupancy, 13);
        assert!(!dir.path().join("state").join("last.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last.json");
        fs::write(&path, "{not json").unwrap();
        assert!(RecoveryState::new(path).load().is_none());
    }

    #[test]
    fn test_record_format_is_plain_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last.json");
        RecoveryState::new(&path).persist(7).unwrap();
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["occupancy"], 7);
        assert!(value["ts"].is_string());
    }
}
