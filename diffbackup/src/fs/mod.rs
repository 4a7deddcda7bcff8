//! Filesystem access: walking, mtime snapshots and file copies.

pub mod changeset;
pub mod metadata;
pub mod walker;

pub use changeset::{diff, snapshot, ChangedSet, FileSnapshot};
