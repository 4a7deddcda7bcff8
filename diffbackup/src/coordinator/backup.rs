//! Creating a differential backup.
//!
//! The world is snapshotted after the server reports a finished save; only
//! files whose (path, mtime) pair is new relative to the latest populated
//! slot are copied into the freed tier-0 slot.

use chrono::Local;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::merge::{evict, MergeReport};
use super::state::{Mode, OpGuard, Operation};
use super::{join_error, BackupCoordinator};
use crate::collab::CommandSource;
use crate::config::EngineConfig;
use crate::events::EngineEvent;
use crate::fs::changeset::{self, diff, ChangedSet, FileSnapshot};
use crate::fs::metadata::{copy_preserving_mtime, mtime_secs, reset_dir};
use crate::slots::{Slot, SlotInfo};
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::{display_time, format_bytes, format_duration};

/// Backup execution result
#[derive(Debug, Clone, PartialEq)]
pub struct BackupReport {
    pub changed_files: usize,
    pub backup_size_bytes: u64,
    pub duration_secs: f64,
    /// Auto-merge promotion run after the slot was added
    pub promotion: Option<MergeReport>,
}

/// Snapshot, change set and bytes copied by one capture
#[derive(Debug)]
pub(crate) struct Captured {
    pub snapshot: FileSnapshot,
    pub changed: ChangedSet,
    pub bytes: u64,
}

/// Walk `world`, diff it against `base` and copy every changed file into
/// `data_dir`. Files that vanish between the walk and the copy are dropped
/// from both the snapshot and the change set.
pub(crate) fn capture(
    world: &Path,
    excluded: &[String],
    base: &FileSnapshot,
    data_dir: &Path,
    unloaded: &CancellationToken,
) -> Result<Captured> {
    let mut snapshot = changeset::snapshot(world, excluded)?;
    let mut changed = diff(base, &snapshot);
    let mut vanished = Vec::new();
    let mut bytes = 0;

    for path in changed.keys() {
        if unloaded.is_cancelled() {
            return Err(BackupError::Aborted("engine unloaded during backup".into()));
        }
        match copy_preserving_mtime(&world.join(path), &data_dir.join(path)) {
            Ok(copied) => bytes += copied,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("File vanished during backup: {}", path);
                vanished.push(path.clone());
            }
            Err(e) => return Err(e.into()),
        }
    }

    if !vanished.is_empty() {
        changed.retain(|path, _| !vanished.contains(path));
        snapshot = snapshot
            .iter()
            .filter(|(path, _)| !vanished.iter().any(|v| v == path))
            .map(|(path, mtime)| (path.to_string(), mtime))
            .collect();
    }

    Ok(Captured {
        snapshot,
        changed,
        bytes,
    })
}

impl BackupCoordinator {
    /// Create a backup of the live world.
    ///
    /// `Mode::Reject` refuses while another operation runs; `Mode::Wait`
    /// queues behind it.
    pub async fn make_backup(&self, source: &CommandSource, mode: Mode) -> Result<BackupReport> {
        let guard = match self.enter(Operation::BackingUp, mode).await {
            Ok(guard) => guard,
            Err(e) => {
                self.report(source, "Backup", &e);
                return Err(e);
            }
        };

        let start_time = Instant::now();
        let config = self.config();
        info!(source = %source, "Starting backup");
        self.inner.events.emit(EngineEvent::BackupStarted {
            source: source.to_string(),
        });
        self.inner.notifier.broadcast("Making backup...");

        let result = self.run_backup(&guard, &config, start_time).await;

        if config.turn_off_auto_save {
            if let Err(e) = self.inner.process.execute("save-on").await {
                warn!("Failed to re-enable auto-save: {}", e);
            }
        }
        drop(guard);

        match result {
            Ok(report) => {
                info!(
                    "Backup completed: {} changed file(s), {} in {}",
                    report.changed_files,
                    format_bytes(report.backup_size_bytes),
                    format_duration(report.duration_secs)
                );
                self.inner.events.emit(EngineEvent::BackupCompleted {
                    changed_files: report.changed_files,
                    backup_size_bytes: report.backup_size_bytes,
                    duration_secs: report.duration_secs,
                });
                self.inner.notifier.broadcast(&format!(
                    "Backup completed in {}: {} file(s), {}",
                    format_duration(report.duration_secs),
                    report.changed_files,
                    format_bytes(report.backup_size_bytes)
                ));
                Ok(report)
            }
            Err(e) => {
                self.inner.events.emit(EngineEvent::BackupFailed {
                    error: e.to_string(),
                });
                self.report(source, "Backup", &e);
                Err(e)
            }
        }
    }

    async fn run_backup(&self, guard: &OpGuard, config: &EngineConfig, start_time: Instant) -> Result<BackupReport> {
        let process = &self.inner.process;
        if config.turn_off_auto_save {
            process.execute("save-off").await?;
        }
        self.inner.state.begin_save_wait();
        process.execute("save-all flush").await?;
        self.wait_for_save(guard, config.saving_timeout()).await?;

        // the capture itself runs without the store lock
        let (slot_path, data_dir, base) = {
            let mut store = self.inner.store.write().await;
            let oldest_id = store
                .tier(0)
                .map(|tier| tier.end())
                .ok_or_else(|| BackupError::InvalidSlot("no slot tiers configured".into()))?;
            evict(&mut store, oldest_id).await?;

            let base = store
                .latest_used()
                .map(|(_, slot)| slot.info.file_snapshot.clone())
                .unwrap_or_default();
            let slot_path = store
                .oldest(0)
                .map(|slot| slot.path.clone())
                .ok_or_else(|| BackupError::InvalidSlot("no slot tiers configured".into()))?;
            let data_dir = store.data_dir(&slot_path);
            (slot_path, data_dir, base)
        };
        debug!(slot = %slot_path.display(), base_files = base.len(), "Capturing world");

        let world = config.world_dir();
        let excluded = config.ignored_files.clone();
        let unloaded = self.inner.unloaded.clone();
        let path = slot_path.clone();
        let info = tokio::task::spawn_blocking(move || -> Result<SlotInfo> {
            let outcome = capture(&world, &excluded, &base, &data_dir, &unloaded).and_then(|captured| {
                let info = SlotInfo {
                    created_at: mtime_secs(SystemTime::now()),
                    display_time: display_time(Local::now()),
                    backup_size_bytes: captured.bytes,
                    included_files: captured.changed.into_keys().collect(),
                    file_snapshot: captured.snapshot,
                };
                // metadata last: a slot without slot.json loads as empty
                info.save(&path)?;
                Ok(info)
            });
            if outcome.is_err() {
                let _ = reset_dir(&path);
            }
            outcome
        })
        .await
        .map_err(join_error)??;

        let changed_files = info.included_files.len();
        let backup_size_bytes = info.backup_size_bytes;
        let mut store = self.inner.store.write().await;
        let outcome = store.add(0, Slot::new(slot_path, info))?;

        let promotion = match outcome.promotion {
            Some(request) => match self.run_merge(&mut store, request).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("Automatic merge of slots {}..{} failed: {}", request.start, request.end, e);
                    None
                }
            },
            None => None,
        };

        Ok(BackupReport {
            changed_files,
            backup_size_bytes,
            duration_secs: start_time.elapsed().as_secs_f64(),
            promotion,
        })
    }

    /// Wait for the save-completed event, recovering a stuck save on timeout
    async fn wait_for_save(&self, guard: &OpGuard, timeout: Duration) -> Result<()> {
        let state = &self.inner.state;
        let abort = guard.abort_token();
        let unloaded = &self.inner.unloaded;

        tokio::select! {
            _ = state.wait_saved() => return Ok(()),
            _ = tokio::time::sleep(timeout) => {}
            _ = abort.cancelled() => {
                return Err(BackupError::Aborted("backup aborted while waiting for the world save".into()))
            }
            _ = unloaded.cancelled() => return Err(BackupError::Aborted("engine unloaded".into())),
        }

        // another caller may already be restarting the server
        if !self.recover_stuck_save().await? {
            tokio::select! {
                _ = state.wait_saved() => {}
                _ = abort.cancelled() => {
                    return Err(BackupError::Aborted("backup aborted while waiting for the world save".into()))
                }
                _ = unloaded.cancelled() => return Err(BackupError::Aborted("engine unloaded".into())),
            }
        }
        Ok(())
    }
}
