//! Slot metadata and its on-disk record.
//!
//! Each slot directory carries `slot.json`; the record is versioned so the
//! format stays readable outside this crate.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::path::Path;

use crate::fs::metadata::write_atomic;
use crate::fs::FileSnapshot;
use crate::utils::errors::{BackupError, Result};

/// Metadata file name inside every slot directory
pub const INFO_FILE: &str = "slot.json";

/// Current `slot.json` schema version
pub const SCHEMA_VERSION: u32 = 1;

/// What one slot holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    /// Unix timestamp of the backup, `-inf` for an empty slot
    #[serde(rename = "timestamp", with = "sentinel_timestamp")]
    pub created_at: f64,

    /// Local wall-clock time shown to operators
    #[serde(rename = "created_at")]
    pub display_time: String,

    pub backup_size_bytes: u64,

    /// Paths physically stored in this slot
    pub included_files: BTreeSet<String>,

    /// Full world snapshot at backup time
    pub file_snapshot: FileSnapshot,
}

impl SlotInfo {
    pub fn empty() -> Self {
        Self {
            created_at: f64::NEG_INFINITY,
            display_time: "Unknown".to_string(),
            backup_size_bytes: 0,
            included_files: BTreeSet::new(),
            file_snapshot: FileSnapshot::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created_at == f64::NEG_INFINITY
    }

    /// Read `slot.json` from `dir`; `Ok(None)` when the slot has never been written
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(INFO_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let record: SlotRecord = serde_json::from_slice(&bytes)?;
        if record.schema_version != SCHEMA_VERSION {
            return Err(BackupError::UnsupportedSchema(record.schema_version));
        }
        Ok(Some(record.info))
    }

    /// Write `slot.json` into `dir` (temp file + rename)
    pub fn save(&self, dir: &Path) -> Result<()> {
        let json = self.to_json()?;
        write_atomic(&dir.join(INFO_FILE), json.as_bytes())?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        let record = SlotRecordRef {
            schema_version: SCHEMA_VERSION,
            info: self,
        };
        Ok(serde_json::to_string_pretty(&record)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let record: SlotRecord = serde_json::from_str(json)?;
        if record.schema_version != SCHEMA_VERSION {
            return Err(BackupError::UnsupportedSchema(record.schema_version));
        }
        Ok(record.info)
    }
}

impl Default for SlotInfo {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Deserialize)]
struct SlotRecord {
    schema_version: u32,
    #[serde(flatten)]
    info: SlotInfo,
}

#[derive(Serialize)]
struct SlotRecordRef<'a> {
    schema_version: u32,
    #[serde(flatten)]
    info: &'a SlotInfo,
}

/// JSON has no infinities: the empty sentinel is written as `null`
mod sentinel_timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
    }
}
