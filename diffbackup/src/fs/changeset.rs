//! Modification-time snapshots of the world tree and their differences.
//!
//! A snapshot maps every relative path to its mtime. A path is changed when
//! its (path, mtime) pair is absent from the previous snapshot; contents are
//! never hashed, so a rewrite that keeps the mtime goes unnoticed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::metadata::mtime_secs;
use super::walker::{walk_directory_with_callback, WalkOptions};

/// Paths whose (path, mtime) pair is new relative to a previous snapshot
pub type ChangedSet = BTreeMap<String, f64>;

/// Relative path → mtime (seconds since the Unix epoch)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(String, f64)>", into = "Vec<(String, f64)>")]
pub struct FileSnapshot {
    entries: BTreeMap<String, f64>,
}

impl FileSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, mtime: f64) {
        self.entries.insert(path.into(), mtime);
    }

    pub fn get(&self, path: &str) -> Option<f64> {
        self.entries.get(path).copied()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// True when `path` is recorded with exactly `mtime`
    pub fn matches(&self, path: &str, mtime: f64) -> bool {
        self.get(path) == Some(mtime)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(p, t)| (p.as_str(), *t))
    }

    pub fn paths(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }
}

impl From<Vec<(String, f64)>> for FileSnapshot {
    fn from(pairs: Vec<(String, f64)>) -> Self {
        Self {
            entries: pairs.into_iter().collect(),
        }
    }
}

impl From<FileSnapshot> for Vec<(String, f64)> {
    fn from(snapshot: FileSnapshot) -> Self {
        snapshot.entries.into_iter().collect()
    }
}

impl FromIterator<(String, f64)> for FileSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Walk `root` and record the mtime of every file not named in `excluded`
pub fn snapshot(root: &Path, excluded: &[String]) -> std::io::Result<FileSnapshot> {
    let mut snapshot = FileSnapshot::new();
    walk_directory_with_callback(root, &WalkOptions::excluding(excluded), |file| {
        snapshot.insert(file.relative_path, mtime_secs(file.modified));
    })?;
    Ok(snapshot)
}

/// Like [`snapshot`], but a root that does not exist yet is an empty tree
pub fn snapshot_or_empty(root: &Path, excluded: &[String]) -> std::io::Result<FileSnapshot> {
    if !root.exists() {
        return Ok(FileSnapshot::new());
    }
    snapshot(root, excluded)
}

/// `current − previous` on (path, mtime) pairs
pub fn diff(previous: &FileSnapshot, current: &FileSnapshot) -> ChangedSet {
    current
        .iter()
        .filter(|(path, mtime)| !previous.matches(path, *mtime))
        .map(|(path, mtime)| (path.to_string(), mtime))
        .collect()
}
