//! Slot merging, deletion and eviction folding.
//!
//! A slot only stores the files that changed since the slot before it, so
//! removing a slot from the middle of the chain would leave its newer
//! neighbour without a base. Before a slot is cleared, every file it stores
//! that its successor still references unchanged is moved into the
//! successor ("folding").

use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

use super::state::{Mode, Operation};
use super::{join_error, BackupCoordinator};
use crate::collab::CommandSource;
use crate::events::EngineEvent;
use crate::fs::metadata::{copy_preserving_mtime, reset_dir};
use crate::slots::{MergeRequest, Slot, SlotInfo, SlotStore, OVERWRITE_SLOT_ID};
use crate::utils::errors::{BackupError, Result};

/// Outcome of one merge, including promotions it cascaded into
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub start: u32,
    pub end: u32,
    pub target_tier: usize,
    pub merged_files: usize,
    pub cascaded: usize,
}

/// Files `evicted` stores that `successor` still lists with the same mtime
/// but does not store itself
pub(crate) fn plan_fold(evicted: &SlotInfo, successor: &SlotInfo) -> Vec<String> {
    evicted
        .included_files
        .iter()
        .filter(|path| !successor.included_files.contains(*path))
        .filter(|path| {
            evicted
                .file_snapshot
                .get(path)
                .is_some_and(|mtime| successor.file_snapshot.matches(path, mtime))
        })
        .cloned()
        .collect()
}

/// Fold slot `id` into its successor, then clear it and delete its files.
/// A failed fold leaves both slots as they were on disk.
/// Returns the number of files handed over.
pub(crate) async fn evict(store: &mut SlotStore, id: u32) -> Result<usize> {
    let Some(evicted) = store.get(id).cloned() else {
        return Err(BackupError::InvalidSlot(format!("slot {} does not exist", id)));
    };

    let mut folded = 0;
    if !evicted.is_empty() {
        if let Some((successor_id, successor)) = store.successor(id).map(|(s, slot)| (s, slot.clone())) {
            let files = plan_fold(&evicted.info, &successor.info);
            if !files.is_empty() {
                let from = store.data_dir(&evicted.path);
                let to = store.data_dir(&successor.path);
                let successor_path = successor.path.clone();
                let mut info = successor.info.clone();
                let moved = files.len();

                let info = tokio::task::spawn_blocking(move || -> Result<SlotInfo> {
                    // the evicted slot stays intact until the successor owns its copies
                    for path in &files {
                        info.backup_size_bytes += copy_preserving_mtime(&from.join(path), &to.join(path))?;
                    }
                    info.included_files.extend(files);
                    info.save(&successor_path)?;
                    Ok(info)
                })
                .await
                .map_err(join_error)??;

                store.update(successor_id, info)?;
                folded = moved;
                debug!(slot = id, successor = successor_id, files = moved, "Folded evicted slot");
            }
        }
    }

    let path = evicted.path.clone();
    tokio::task::spawn_blocking(move || reset_dir(&path))
        .await
        .map_err(join_error)??;
    store.clear(id, false)?;
    Ok(folded)
}

/// Range checks for a merge of `start..=end` into `target_tier`
pub(crate) fn validate_merge(store: &SlotStore, request: &MergeRequest) -> Result<()> {
    let Some(target) = store.tier(request.target_tier) else {
        return Err(BackupError::InvalidSlot(format!("tier {} does not exist", request.target_tier)));
    };
    if request.start == 0 || request.start > request.end {
        return Err(BackupError::InvalidSlot(format!(
            "invalid range {}..{}",
            request.start, request.end
        )));
    }
    if request.end >= target.start() {
        return Err(BackupError::InvalidSlot(format!(
            "range {}..{} must lie below tier {} (slots {}..{})",
            request.start,
            request.end,
            request.target_tier,
            target.start(),
            target.end()
        )));
    }
    let is_used = |id: u32| store.get(id).is_some_and(|slot| !slot.is_empty());
    if let Some(between) = (request.end + 1..target.start()).find(|&id| is_used(id)) {
        return Err(BackupError::InvalidSlot(format!(
            "slot {} lies between the range and tier {}",
            between, request.target_tier
        )));
    }
    if !(request.start..=request.end).any(is_used) {
        return Err(BackupError::InvalidSlot(format!(
            "slots {}..{} are all empty",
            request.start, request.end
        )));
    }
    Ok(())
}

/// One merge step; returns the promotion the target tier asked for, if any
async fn merge_once(store: &mut SlotStore, request: MergeRequest) -> Result<(usize, Option<MergeRequest>)> {
    validate_merge(store, &request)?;

    let target_oldest = store
        .tier(request.target_tier)
        .map(|tier| tier.end())
        .ok_or_else(|| BackupError::InvalidSlot(format!("tier {} does not exist", request.target_tier)))?;
    evict(store, target_oldest).await?;

    // newest slot first, so the first copy of a path seen wins
    let mut sources: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut newest: Option<SlotInfo> = None;
    for id in request.start..=request.end {
        let Some(slot) = store.get(id).filter(|slot| !slot.is_empty()) else {
            continue;
        };
        if newest.is_none() {
            newest = Some(slot.info.clone());
        }
        let dir = store.data_dir(&slot.path);
        for path in &slot.info.included_files {
            sources.entry(path.clone()).or_insert_with(|| dir.join(path));
        }
    }
    let newest = newest.ok_or_else(|| BackupError::InvalidSlot("nothing to merge".into()))?;

    let target_path = store
        .oldest(request.target_tier)
        .map(|slot| slot.path.clone())
        .ok_or_else(|| BackupError::InvalidSlot(format!("tier {} does not exist", request.target_tier)))?;
    let target_dir = store.data_dir(&target_path);

    let (target_path, info) = tokio::task::spawn_blocking(move || -> Result<(PathBuf, SlotInfo)> {
        reset_dir(&target_path)?;
        let mut size = 0;
        for (path, src) in &sources {
            size += copy_preserving_mtime(src, &target_dir.join(path))?;
        }
        let info = SlotInfo {
            created_at: newest.created_at,
            display_time: newest.display_time,
            backup_size_bytes: size,
            included_files: sources.into_keys().collect(),
            file_snapshot: newest.file_snapshot,
        };
        info.save(&target_path)?;
        Ok((target_path, info))
    })
    .await
    .map_err(join_error)??;

    let merged = info.included_files.len();
    store.clear_range(request.start, request.end, true)?;
    let outcome = store.add(request.target_tier, Slot::new(target_path, info))?;

    info!(
        "Merged slots {}..{} into tier {} ({} files)",
        request.start, request.end, request.target_tier, merged
    );
    Ok((merged, outcome.promotion))
}

async fn delete_slot(store: &mut SlotStore, id: u32) -> Result<usize> {
    store.resolve(id)?;
    if id == OVERWRITE_SLOT_ID {
        store.delete_overwrite()?;
        return Ok(0);
    }
    evict(store, id).await
}

impl BackupCoordinator {
    /// Merge `start..=end` into the newest slot of `target_tier`
    pub async fn merge_slots(
        &self,
        source: &CommandSource,
        start: u32,
        end: u32,
        target_tier: usize,
        mode: Mode,
    ) -> Result<MergeReport> {
        let guard = match self.enter(Operation::Merging, mode).await {
            Ok(guard) => guard,
            Err(e) => {
                self.report(source, "Merge", &e);
                return Err(e);
            }
        };

        self.inner
            .notifier
            .tell(source, &format!("Merging slots {}..{} into tier {}", start, end, target_tier));
        let result = {
            let mut store = self.inner.store.write().await;
            self.run_merge(&mut store, MergeRequest { start, end, target_tier })
                .await
        };
        drop(guard);

        match result {
            Ok(report) => {
                self.inner.notifier.tell(
                    source,
                    &format!(
                        "Merged slots {}..{} into tier {} ({} files)",
                        start, end, target_tier, report.merged_files
                    ),
                );
                Ok(report)
            }
            Err(e) => {
                self.report(source, "Merge", &e);
                Err(e)
            }
        }
    }

    /// Run a merge and every promotion it cascades into.
    /// The caller holds the exclusivity state and the store lock.
    pub(super) async fn run_merge(&self, store: &mut SlotStore, request: MergeRequest) -> Result<MergeReport> {
        let mut next = Some(request);
        let mut report: Option<MergeReport> = None;

        while let Some(step) = next.take() {
            let (merged_files, promotion) = merge_once(store, step).await?;
            self.inner.events.emit(EngineEvent::MergeCompleted {
                start: step.start,
                end: step.end,
                target_tier: step.target_tier,
                merged_files,
            });
            match report.as_mut() {
                None => {
                    report = Some(MergeReport {
                        start: step.start,
                        end: step.end,
                        target_tier: step.target_tier,
                        merged_files,
                        cascaded: 0,
                    })
                }
                Some(report) => report.cascaded += 1,
            }
            next = promotion;
        }

        report.ok_or_else(|| BackupError::InvalidSlot("nothing to merge".into()))
    }

    /// Delete one backup. Slot 0 removes the overwrite slot; any other slot
    /// is folded into its successor first so no newer slot loses its base.
    pub async fn delete_backup(&self, source: &CommandSource, id: u32) -> Result<()> {
        let guard = match self.enter(Operation::Merging, Mode::Reject).await {
            Ok(guard) => guard,
            Err(e) => {
                self.report(source, "Delete", &e);
                return Err(e);
            }
        };

        let result = {
            let mut store = self.inner.store.write().await;
            delete_slot(&mut store, id).await
        };
        drop(guard);

        match result {
            Ok(folded) => {
                info!(slot = id, folded, "Backup deleted");
                self.inner
                    .notifier
                    .tell(source, &format!("Slot {} deleted", id));
                Ok(())
            }
            Err(e) => {
                self.report(source, "Delete", &e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::fs::FileSnapshot;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn info(created_at: f64, included: &[&str], snapshot: &[(&str, f64)]) -> SlotInfo {
        SlotInfo {
            created_at,
            display_time: format!("t{}", created_at),
            backup_size_bytes: 0,
            included_files: included.iter().map(|p| p.to_string()).collect(),
            file_snapshot: snapshot
                .iter()
                .map(|(p, t)| (p.to_string(), *t))
                .collect::<FileSnapshot>(),
        }
    }

    fn store(root: &Path, tiers: Vec<usize>) -> SlotStore {
        SlotStore::load(&EngineConfig {
            backup_path: root.join("backups"),
            server_path: root.join("server"),
            slot_tiers: tiers,
            ..EngineConfig::default()
        })
        .unwrap()
    }

    /// Add a tier-0 slot whose included files hold their own name as content
    fn push(store: &mut SlotStore, info: SlotInfo) {
        let path = store.oldest(0).unwrap().path.clone();
        let dir = store.data_dir(&path);
        for file in &info.included_files {
            let target = dir.join(file);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(target, file.as_bytes()).unwrap();
        }
        info.save(&path).unwrap();
        store.add(0, Slot::new(path, info)).unwrap();
    }

    #[test]
    fn test_plan_fold_hands_over_unchanged_files() {
        let evicted = info(1.0, &["a", "b", "c"], &[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        // b changed since, c was deleted, a is untouched
        let successor = info(2.0, &["b"], &[("a", 1.0), ("b", 2.0)]);
        assert_eq!(plan_fold(&evicted, &successor), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_evict_folds_into_successor() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = store(temp_dir.path(), vec![3]);
        push(&mut store, info(1.0, &["a", "b"], &[("a", 1.0), ("b", 1.0)]));
        push(&mut store, info(2.0, &["b"], &[("a", 1.0), ("b", 2.0)]));

        let folded = evict(&mut store, 2).await?;
        assert_eq!(folded, 1);
        assert_eq!(store.used_slots_count(), 1);

        let survivor = store.resolve(1)?;
        assert!(survivor.info.included_files.contains("a"));
        assert_eq!(fs::read(store.data_dir(&survivor.path).join("a"))?, b"a");
        assert_eq!(SlotInfo::load(&survivor.path)?, Some(survivor.info.clone()));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_fold_leaves_both_slots_intact() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = store(temp_dir.path(), vec![3]);
        push(&mut store, info(1.0, &["a", "b"], &[("a", 1.0), ("b", 1.0)]));
        push(&mut store, info(2.0, &["c"], &[("a", 1.0), ("b", 1.0), ("c", 2.0)]));
        let evicted = store.resolve(2)?;
        let successor = store.resolve(1)?;
        fs::remove_file(store.data_dir(&evicted.path).join("b"))?;

        assert!(evict(&mut store, 2).await.is_err());

        assert_eq!(store.resolve(2)?.info, evicted.info);
        assert_eq!(fs::read(store.data_dir(&evicted.path).join("a"))?, b"a");
        assert_eq!(SlotInfo::load(&successor.path)?, Some(successor.info.clone()));
        assert_eq!(store.resolve(1)?.info, successor.info);
        Ok(())
    }

    #[tokio::test]
    async fn test_validate_merge_ranges() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = store(temp_dir.path(), vec![3, 2]);
        for t in [1.0, 2.0, 3.0] {
            push(&mut store, info(t, &["f"], &[("f", t)]));
        }

        let request = |start, end, target_tier| MergeRequest { start, end, target_tier };
        assert!(validate_merge(&store, &request(2, 3, 1)).is_ok());
        assert!(validate_merge(&store, &request(1, 3, 1)).is_ok());
        assert!(validate_merge(&store, &request(0, 2, 1)).is_err());
        assert!(validate_merge(&store, &request(3, 2, 1)).is_err());
        // slot 3 sits between the range and tier 1
        assert!(validate_merge(&store, &request(1, 2, 1)).is_err());
        assert!(validate_merge(&store, &request(1, 3, 0)).is_err());
        assert!(validate_merge(&store, &request(1, 3, 5)).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_once_unions_newest_first() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = store(temp_dir.path(), vec![3, 2]);
        push(&mut store, info(1.0, &["a", "b"], &[("a", 1.0), ("b", 1.0)]));
        push(&mut store, info(2.0, &["b"], &[("a", 1.0), ("b", 2.0)]));
        push(&mut store, info(3.0, &["c"], &[("a", 1.0), ("b", 2.0), ("c", 3.0)]));
        // overwrite b in slot 2 (t=2.0) with distinguishable content
        let slot2 = store.resolve(2)?;
        fs::write(store.data_dir(&slot2.path).join("b"), b"newer b")?;

        let (merged, promotion) = merge_once(&mut store, MergeRequest { start: 2, end: 3, target_tier: 1 }).await?;
        assert_eq!(merged, 2);
        assert_eq!(promotion, None);

        let target = store.resolve(4)?;
        assert_eq!(target.info.created_at, 2.0);
        assert_eq!(target.info.included_files.len(), 2);
        assert_eq!(fs::read(store.data_dir(&target.path).join("b"))?, b"newer b");
        assert_eq!(store.used_slots_count(), 2);
        assert!(store.resolve(2).is_err());
        Ok(())
    }
}
