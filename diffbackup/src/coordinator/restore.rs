//! Restoring the live world to a slot.
//!
//! A restore is requested, then confirmed, then counted down before the
//! server is stopped. The live tree is compared with the target snapshot:
//! files the target does not know are deleted, files whose mtime differs
//! are copied back from the closest slot at or before the target that
//! stores them. Everything the restore overwrites or deletes is copied into
//! the overwrite slot first, so restoring slot 0 undoes it.

use chrono::Local;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::state::{OpGuard, Operation, PendingRestore};
use super::{join_error, BackupCoordinator};
use crate::collab::CommandSource;
use crate::events::EngineEvent;
use crate::fs::changeset::{snapshot_or_empty, FileSnapshot};
use crate::fs::metadata::{copy_preserving_mtime, mtime_secs, reset_dir};
use crate::slots::{Slot, SlotInfo, SlotStore, OVERWRITE_SLOT_ID};
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::display_time;

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub slot: u32,
    pub restored_files: usize,
    pub deleted_files: usize,
}

/// A slot files can be restored from
#[derive(Debug, Clone)]
pub struct SourceSlot {
    pub id: u32,
    pub data_dir: PathBuf,
    pub included: BTreeSet<String>,
}

/// What a restore will do to the live tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestorePlan {
    /// Live paths the target snapshot does not contain
    pub delete: Vec<String>,
    /// Relative path → stored copy to restore it from
    pub restore: BTreeMap<String, PathBuf>,
}

impl RestorePlan {
    /// Live paths whose current content the plan replaces or removes
    pub fn touched<'a>(&'a self, live: &'a FileSnapshot) -> impl Iterator<Item = &'a String> + 'a {
        self.delete
            .iter()
            .chain(self.restore.keys().filter(|path| live.contains(path)))
    }
}

/// Compare `live` with `target` and pick a source for every file to restore.
///
/// `chain` lists candidate slots starting at the target and moving to older
/// ones; the first slot storing a path wins. With `strict`, a path no slot
/// stores fails the plan; otherwise it is left as it is.
pub fn plan_restore(
    live: &FileSnapshot,
    target: &FileSnapshot,
    chain: &[SourceSlot],
    strict: bool,
) -> Result<RestorePlan> {
    let delete = live
        .iter()
        .filter(|(path, _)| !target.contains(path))
        .map(|(path, _)| path.to_string())
        .collect();

    let mut restore = BTreeMap::new();
    for (path, mtime) in target.iter() {
        if live.matches(path, mtime) {
            continue;
        }
        match chain.iter().find(|slot| slot.included.contains(path)) {
            Some(slot) => {
                restore.insert(path.to_string(), slot.data_dir.join(path));
            }
            None if strict => return Err(BackupError::MissingSource(path.to_string())),
            None => debug!("No stored copy of {}, keeping the live file", path),
        }
    }

    Ok(RestorePlan { delete, restore })
}

/// Copy every live file the plan touches into the overwrite slot
fn save_overwrite(
    world: &Path,
    live: &FileSnapshot,
    plan: &RestorePlan,
    overwrite_path: &Path,
    overwrite_data: &Path,
) -> Result<SlotInfo> {
    reset_dir(overwrite_path)?;

    let mut included = BTreeSet::new();
    let mut size = 0;
    for path in plan.touched(live) {
        size += copy_preserving_mtime(&world.join(path), &overwrite_data.join(path))?;
        included.insert(path.clone());
    }

    let info = SlotInfo {
        created_at: mtime_secs(SystemTime::now()),
        display_time: display_time(Local::now()),
        backup_size_bytes: size,
        included_files: included,
        file_snapshot: live.clone(),
    };
    info.save(overwrite_path)?;
    Ok(info)
}

/// What a restore did to the overwrite slot on disk
enum OverwriteUpdate {
    Unchanged,
    Replaced(SlotInfo),
    /// Reset but never completed
    Lost,
}

/// Apply `plan` to the live tree
fn apply_plan(world: &Path, plan: &RestorePlan) -> Result<()> {
    for path in &plan.delete {
        match std::fs::remove_file(world.join(path)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    for (path, src) in &plan.restore {
        copy_preserving_mtime(src, &world.join(path))?;
    }
    Ok(())
}

/// Find the requested slot again; its displayed ID may have shifted since
/// the request was made
fn locate_target(store: &SlotStore, pending: &PendingRestore) -> Result<(Slot, Vec<SourceSlot>)> {
    if pending.slot == OVERWRITE_SLOT_ID {
        let slot = store.resolve(OVERWRITE_SLOT_ID)?;
        let chain = vec![SourceSlot {
            id: OVERWRITE_SLOT_ID,
            data_dir: store.data_dir(&slot.path),
            included: slot.info.included_files.clone(),
        }];
        return Ok((slot, chain));
    }

    let slots = store.slots();
    let Some(&(target_id, target)) = slots
        .iter()
        .find(|(_, slot)| slot.info.created_at == pending.info.created_at)
    else {
        return Err(BackupError::InvalidSlot(format!(
            "slot {} ({}) no longer exists",
            pending.slot, pending.info.display_time
        )));
    };

    let chain = slots
        .iter()
        .filter(|(id, _)| *id >= target_id)
        .map(|(id, slot)| SourceSlot {
            id: *id,
            data_dir: store.data_dir(&slot.path),
            included: slot.info.included_files.clone(),
        })
        .collect();
    Ok((target.clone(), chain))
}

impl BackupCoordinator {
    /// Request a restore to slot `id`; nothing is touched until confirmed
    pub async fn restore_backup(&self, source: &CommandSource, id: u32) -> Result<()> {
        // a running operation may hold the store; answer without waiting for it
        let resolved = match self.inner.state.active() {
            Some(active) => Err(BackupError::OperationConflict(active)),
            None => self.inner.store.read().await.resolve(id),
        };
        let result = resolved.and_then(|slot| {
            let display = slot.info.display_time.clone();
            self.inner
                .state
                .set_pending(PendingRestore { slot: id, info: slot.info })
                .map(|_| display)
        });

        match result {
            Ok(display) => {
                info!(source = %source, slot = id, "Restore requested");
                self.inner.notifier.tell(
                    source,
                    &format!(
                        "Ready to restore slot {} ({}). Confirm to proceed or abort to cancel",
                        id, display
                    ),
                );
                Ok(())
            }
            Err(e) => {
                self.report(source, "Restore", &e);
                Err(e)
            }
        }
    }

    /// Run the pending restore after a countdown
    pub async fn confirm_restore(&self, source: &CommandSource) -> Result<RestoreReport> {
        let (pending, guard) = match self.inner.state.confirm_pending(Operation::Restoring) {
            Ok(confirmed) if !self.is_unloaded() => confirmed,
            Ok(_) => {
                let e = BackupError::Aborted("engine unloaded".into());
                self.report(source, "Restore", &e);
                return Err(e);
            }
            Err(e) => {
                self.report(source, "Restore", &e);
                return Err(e);
            }
        };

        let result = self.run_restore(&guard, &pending).await;
        drop(guard);

        match result {
            Ok(report) => {
                info!(
                    "Restored slot {}: {} file(s) restored, {} deleted",
                    report.slot, report.restored_files, report.deleted_files
                );
                self.inner.events.emit(EngineEvent::RestoreCompleted {
                    slot: report.slot,
                    restored_files: report.restored_files,
                    deleted_files: report.deleted_files,
                });
                self.inner
                    .notifier
                    .broadcast(&format!("Restored slot {}", report.slot));
                Ok(report)
            }
            Err(e) => {
                if !matches!(e, BackupError::Aborted(_)) {
                    self.inner.events.emit(EngineEvent::RestoreFailed {
                        slot: pending.slot,
                        error: e.to_string(),
                    });
                }
                self.report(source, "Restore", &e);
                Err(e)
            }
        }
    }

    async fn run_restore(&self, guard: &OpGuard, pending: &PendingRestore) -> Result<RestoreReport> {
        let countdown = self.config().restore_countdown_secs;
        self.countdown(guard, pending.slot, countdown).await?;
        if guard.abort_token().is_cancelled() {
            return Err(BackupError::Aborted(format!("restore to slot {} cancelled", pending.slot)));
        }

        let process = &self.inner.process;
        let applied = async {
            if process.is_running() {
                process.stop().await?;
                process.wait_until_stopped().await?;
            }
            self.apply_restore(pending).await
        }
        .await;

        let restarted = if process.is_running() {
            Ok(())
        } else {
            process.start().await
        };
        if let Err(e) = &restarted {
            warn!("Failed to start the server after restore: {}", e);
        }

        let report = applied?;
        restarted?;
        Ok(report)
    }

    async fn countdown(&self, guard: &OpGuard, slot: u32, secs: u64) -> Result<()> {
        for remaining in (1..=secs).rev() {
            self.inner.notifier.broadcast(&format!(
                "Restoring slot {} in {} second(s), abort to cancel",
                slot, remaining
            ));
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = guard.abort_token().cancelled() => {
                    return Err(BackupError::Aborted(format!("restore to slot {} cancelled", slot)))
                }
                _ = self.inner.unloaded.cancelled() => {
                    return Err(BackupError::Aborted("engine unloaded".into()))
                }
            }
        }
        Ok(())
    }

    async fn apply_restore(&self, pending: &PendingRestore) -> Result<RestoreReport> {
        let config = self.config();
        let (target, chain, overwrite_path, overwrite_data) = {
            let store = self.inner.store.read().await;
            let (target, chain) = locate_target(&store, pending)?;
            let overwrite_path = store.overwrite_path().to_path_buf();
            let overwrite_data = store.data_dir(&overwrite_path);
            (target, chain, overwrite_path, overwrite_data)
        };
        let slot = pending.slot;
        let strict = slot != OVERWRITE_SLOT_ID;

        let world = config.world_dir();
        let excluded = config.ignored_files.clone();

        let (update, applied) = tokio::task::spawn_blocking(move || {
            let planned = snapshot_or_empty(&world, &excluded).map_err(BackupError::from).and_then(|live| {
                let plan = plan_restore(&live, &target.info.file_snapshot, &chain, strict)?;
                Ok((live, plan))
            });
            let (live, plan) = match planned {
                Ok(planned) => planned,
                Err(e) => return (OverwriteUpdate::Unchanged, Err(e)),
            };
            debug!(
                slot,
                restore = plan.restore.len(),
                delete = plan.delete.len(),
                "Restore planned"
            );

            let update = if strict {
                match save_overwrite(&world, &live, &plan, &overwrite_path, &overwrite_data) {
                    Ok(info) => OverwriteUpdate::Replaced(info),
                    Err(e) => return (OverwriteUpdate::Lost, Err(e)),
                }
            } else {
                OverwriteUpdate::Unchanged
            };

            let applied = apply_plan(&world, &plan).map(|_| RestoreReport {
                slot,
                restored_files: plan.restore.len(),
                deleted_files: plan.delete.len(),
            });
            (update, applied)
        })
        .await
        .map_err(join_error)?;

        // the overwrite slot on disk changed even if applying the plan failed
        match update {
            OverwriteUpdate::Replaced(info) => self.inner.store.write().await.set_overwrite(info),
            OverwriteUpdate::Lost => {
                if let Err(e) = self.inner.store.write().await.delete_overwrite() {
                    warn!("Failed to remove the incomplete overwrite slot: {}", e);
                }
            }
            OverwriteUpdate::Unchanged => {}
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, f64)]) -> FileSnapshot {
        pairs.iter().map(|(p, t)| (p.to_string(), *t)).collect()
    }

    fn source(id: u32, included: &[&str]) -> SourceSlot {
        SourceSlot {
            id,
            data_dir: PathBuf::from(format!("slot{}/world", id)),
            included: included.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_plan_deletes_unknown_and_restores_changed() -> Result<()> {
        let live = snapshot(&[("a", 1.0), ("b", 5.0), ("new", 6.0)]);
        let target = snapshot(&[("a", 1.0), ("b", 2.0), ("gone", 2.0)]);
        let chain = [source(3, &["b"]), source(4, &["a", "b", "gone"])];

        let plan = plan_restore(&live, &target, &chain, true)?;

        assert_eq!(plan.delete, vec!["new".to_string()]);
        assert_eq!(plan.restore.len(), 2);
        // closest slot to the target wins
        assert_eq!(plan.restore["b"], PathBuf::from("slot3/world/b"));
        assert_eq!(plan.restore["gone"], PathBuf::from("slot4/world/gone"));
        assert!(!plan.restore.contains_key("a"));
        Ok(())
    }

    #[test]
    fn test_plan_without_source_fails_when_strict() {
        let live = snapshot(&[]);
        let target = snapshot(&[("a", 1.0)]);
        let chain = [source(1, &[])];

        assert!(matches!(
            plan_restore(&live, &target, &chain, true),
            Err(BackupError::MissingSource(path)) if path == "a"
        ));
        assert!(plan_restore(&live, &target, &chain, false).unwrap().restore.is_empty());
    }

    #[test]
    fn test_touched_lists_overwritten_and_deleted() -> Result<()> {
        let live = snapshot(&[("a", 9.0), ("extra", 1.0)]);
        let target = snapshot(&[("a", 1.0), ("b", 1.0)]);
        let chain = [source(1, &["a", "b"])];

        let plan = plan_restore(&live, &target, &chain, true)?;
        let touched: Vec<&String> = plan.touched(&live).collect();
        assert_eq!(touched, vec!["extra", "a"]);
        Ok(())
    }

    struct Quiet;

    #[async_trait::async_trait]
    impl crate::collab::ProcessControl for Quiet {
        async fn execute(&self, _command: &str) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn kill(&self) -> Result<()> {
            Ok(())
        }
        async fn wait_until_stopped(&self) -> Result<()> {
            Ok(())
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            true
        }
    }

    impl crate::collab::Notifier for Quiet {
        fn tell(&self, _source: &CommandSource, _message: &str) {}
    }

    #[tokio::test]
    async fn test_restore_request_is_refused_while_the_store_is_busy() -> Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let config = crate::config::EngineConfig {
            backup_path: temp_dir.path().join("backups"),
            server_path: temp_dir.path().join("server"),
            ..crate::config::EngineConfig::default()
        };
        let quiet = std::sync::Arc::new(Quiet);
        let coordinator = BackupCoordinator::new(config, quiet.clone(), quiet, crate::events::EventBus::new())?;

        // a backup in its capture phase
        let _guard = coordinator.inner.state.try_acquire(Operation::BackingUp)?;
        let _store = coordinator.inner.store.write().await;

        let requested = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.restore_backup(&CommandSource::Console, 1),
        )
        .await;
        assert!(matches!(
            requested,
            Ok(Err(BackupError::OperationConflict(Operation::BackingUp)))
        ));
        assert!(coordinator.pending_restore().is_none());
        Ok(())
    }
}
