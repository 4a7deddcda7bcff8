//! All slot tiers plus the overwrite slot.
//!
//! Displayed IDs are handed out tier by tier: tier 0 holds `1..=c0`, tier 1
//! the next `c1` IDs and so on. ID 0 is the overwrite slot, written right
//! before a restore so the restore can be undone.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::group::{Slot, SlotGroup};
use super::info::SlotInfo;
use crate::config::EngineConfig;
use crate::fs::metadata::reset_dir;
use crate::utils::errors::{BackupError, Result};

/// Displayed ID of the overwrite slot
pub const OVERWRITE_SLOT_ID: u32 = 0;

/// A merge the store wants run after a tier filled up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeRequest {
    pub start: u32,
    pub end: u32,
    pub target_tier: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddOutcome {
    pub evicted: Slot,
    pub promotion: Option<MergeRequest>,
}

#[derive(Debug)]
pub struct SlotStore {
    world_name: String,
    auto_merge: bool,
    groups: Vec<SlotGroup>,
    overwrite_path: PathBuf,
    overwrite: Option<SlotInfo>,
}

impl SlotStore {
    /// Build every tier from the slot directories under `backup_path`.
    ///
    /// A missing or unreadable `slot.json` leaves that slot empty; only a
    /// directory that cannot be created is an error.
    pub fn load(config: &EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.backup_path)?;

        let mut groups = Vec::with_capacity(config.slot_tiers.len());
        let mut start = 1u32;
        for &capacity in &config.slot_tiers {
            let end = u32::try_from(capacity)
                .ok()
                .and_then(|c| start.checked_add(c))
                .and_then(|next| next.checked_sub(1))
                .ok_or_else(|| BackupError::Config(format!("tier of {} slots does not fit slot IDs", capacity)))?;
            let mut slots = Vec::with_capacity(capacity);
            for id in start..=end {
                let path = config.backup_path.join(format!("slot{}", id));
                std::fs::create_dir_all(&path)?;
                slots.push(Slot::new(path.clone(), read_info(&path)));
            }
            groups.push(SlotGroup::new(start, end, slots));
            start = end
                .checked_add(1)
                .ok_or_else(|| BackupError::Config("too many slots to number".into()))?;
        }

        let overwrite_path = config.overwrite_dir();
        let overwrite = if overwrite_path.is_dir() {
            Some(read_info(&overwrite_path)).filter(|info| !info.is_empty())
        } else {
            None
        };

        let store = Self {
            world_name: config.world_name.clone(),
            auto_merge: config.auto_merge,
            groups,
            overwrite_path,
            overwrite,
        };
        debug!(
            tiers = store.groups.len(),
            used = store.used_slots_count(),
            "Slot store loaded"
        );
        Ok(store)
    }

    pub fn tiers(&self) -> &[SlotGroup] {
        &self.groups
    }

    pub fn tier(&self, tier: usize) -> Option<&SlotGroup> {
        self.groups.get(tier)
    }

    /// Highest displayed ID in the rotation
    pub fn max_displayed_id(&self) -> u32 {
        self.groups.last().map(|g| g.end()).unwrap_or(0)
    }

    /// Tier index and arena position of a displayed ID
    pub fn locate(&self, displayed_id: u32) -> Option<(usize, usize)> {
        self.groups
            .iter()
            .enumerate()
            .find_map(|(t, g)| g.position(displayed_id).map(|p| (t, p)))
    }

    /// Mirror directory of the world inside a slot directory
    pub fn data_dir(&self, slot_path: &Path) -> PathBuf {
        slot_path.join(&self.world_name)
    }

    /// Slot at `displayed_id`, populated or not (never the overwrite slot)
    pub fn get(&self, displayed_id: u32) -> Option<&Slot> {
        self.groups.iter().find_map(|g| g.get(displayed_id))
    }

    pub fn oldest(&self, tier: usize) -> Option<&Slot> {
        self.groups.get(tier).map(|g| g.oldest())
    }

    pub fn latest(&self, tier: usize) -> Option<&Slot> {
        self.groups.get(tier).map(|g| g.latest())
    }

    /// Newest populated slot across all tiers
    pub fn latest_used(&self) -> Option<(u32, &Slot)> {
        self.groups
            .iter()
            .map(|g| (g.start(), g.latest()))
            .find(|(_, slot)| !slot.is_empty())
    }

    /// Populated slot at `displayed_id`; ID 0 resolves to the overwrite slot
    pub fn resolve(&self, displayed_id: u32) -> Result<Slot> {
        if displayed_id == OVERWRITE_SLOT_ID {
            return self
                .overwrite_slot()
                .ok_or_else(|| BackupError::InvalidSlot("no overwrite backup exists".into()));
        }
        match self.get(displayed_id) {
            Some(slot) if !slot.is_empty() => Ok(slot.clone()),
            Some(_) => Err(BackupError::InvalidSlot(format!("slot {} is empty", displayed_id))),
            None => Err(BackupError::InvalidSlot(format!(
                "slot {} does not exist (1..={})",
                displayed_id,
                self.max_displayed_id()
            ))),
        }
    }

    /// Nearest populated slot newer than `displayed_id`
    pub fn successor(&self, displayed_id: u32) -> Option<(u32, &Slot)> {
        (1..displayed_id)
            .rev()
            .filter_map(|id| self.get(id).map(|s| (id, s)))
            .find(|(_, s)| !s.is_empty())
    }

    /// Populated slots, newest first
    pub fn slots(&self) -> Vec<(u32, &Slot)> {
        self.groups
            .iter()
            .flat_map(|g| g.iter_newest_first())
            .filter(|(_, s)| !s.is_empty())
            .collect()
    }

    pub fn used_slots_count(&self) -> usize {
        self.groups.iter().map(|g| g.used_count()).sum()
    }

    /// Bytes held by every populated slot including the overwrite slot
    pub fn total_size(&self) -> u64 {
        let rotating: u64 = self
            .slots()
            .iter()
            .map(|(_, s)| s.info.backup_size_bytes)
            .sum();
        rotating + self.overwrite.as_ref().map(|i| i.backup_size_bytes).unwrap_or(0)
    }

    /// Ring-buffer insert into `tier`.
    ///
    /// With auto-merge on, a tier that filled up since its last promotion
    /// asks for its whole range to be merged into the next tier.
    pub fn add(&mut self, tier: usize, slot: Slot) -> Result<AddOutcome> {
        let has_next = tier + 1 < self.groups.len();
        let auto_merge = self.auto_merge;
        let group = self
            .groups
            .get_mut(tier)
            .ok_or_else(|| BackupError::InvalidSlot(format!("tier {} does not exist", tier)))?;

        let added = group.add(slot);
        let promotion = if auto_merge && added.full && has_next {
            group.reset_added();
            Some(MergeRequest {
                start: group.start(),
                end: group.end(),
                target_tier: tier + 1,
            })
        } else {
            None
        };

        Ok(AddOutcome {
            evicted: added.evicted,
            promotion,
        })
    }

    /// Reset one slot to empty, optionally wiping its directory
    pub fn clear(&mut self, displayed_id: u32, delete_files: bool) -> Result<Option<Slot>> {
        let Some((tier, _)) = self.locate(displayed_id) else {
            return Err(BackupError::InvalidSlot(format!("slot {} does not exist", displayed_id)));
        };
        if delete_files {
            if let Some(slot) = self.get(displayed_id) {
                reset_dir(&slot.path)?;
            }
        }
        Ok(self.groups[tier].clear(displayed_id))
    }

    /// Clear `start..=end`; positions are resolved before anything moves
    pub fn clear_range(&mut self, start: u32, end: u32, delete_files: bool) -> Result<Vec<Slot>> {
        let paths: Vec<PathBuf> = (start..=end)
            .filter_map(|id| self.get(id).map(|s| s.path.clone()))
            .collect();

        let mut cleared = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(id) = self.id_of_path(&path) else { continue };
            if let Some(slot) = self.clear(id, delete_files)? {
                cleared.push(slot);
            }
        }
        Ok(cleared)
    }

    /// Replace the metadata of the slot at `displayed_id`
    pub fn update(&mut self, displayed_id: u32, info: SlotInfo) -> Result<()> {
        let Some((tier, _)) = self.locate(displayed_id) else {
            return Err(BackupError::InvalidSlot(format!("slot {} does not exist", displayed_id)));
        };
        self.groups[tier].update(displayed_id, info);
        Ok(())
    }

    /// Current displayed ID of the slot stored at `path`
    pub fn id_of_path(&self, path: &Path) -> Option<u32> {
        self.groups
            .iter()
            .flat_map(|g| g.iter_newest_first())
            .find(|(_, s)| s.path == path)
            .map(|(id, _)| id)
    }

    pub fn overwrite_path(&self) -> &Path {
        &self.overwrite_path
    }

    pub fn overwrite_slot(&self) -> Option<Slot> {
        self.overwrite
            .as_ref()
            .map(|info| Slot::new(self.overwrite_path.clone(), info.clone()))
    }

    pub fn set_overwrite(&mut self, info: SlotInfo) {
        self.overwrite = Some(info);
    }

    /// Delete the overwrite slot and its files
    pub fn delete_overwrite(&mut self) -> Result<()> {
        if self.overwrite_path.exists() {
            std::fs::remove_dir_all(&self.overwrite_path)?;
        }
        self.overwrite = None;
        Ok(())
    }
}

fn read_info(path: &Path) -> SlotInfo {
    match SlotInfo::load(path) {
        Ok(Some(info)) => info,
        Ok(None) => SlotInfo::empty(),
        Err(e) => {
            warn!(slot = %path.display(), error = %e, "Unreadable slot metadata, treating slot as empty");
            SlotInfo::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(root: &Path, tiers: Vec<usize>, auto_merge: bool) -> EngineConfig {
        EngineConfig {
            backup_path: root.join("backups"),
            server_path: root.join("server"),
            slot_tiers: tiers,
            auto_merge,
            ..EngineConfig::default()
        }
    }

    fn info(created_at: f64) -> SlotInfo {
        SlotInfo {
            created_at,
            display_time: format!("t{}", created_at),
            backup_size_bytes: 10,
            ..SlotInfo::empty()
        }
    }

    fn push(store: &mut SlotStore, created_at: f64) -> AddOutcome {
        let path = store.oldest(0).unwrap().path.clone();
        info(created_at).save(&path).unwrap();
        store.add(0, Slot::new(path, info(created_at))).unwrap()
    }

    #[test]
    fn test_load_creates_directories() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = config(temp_dir.path(), vec![3, 2], false);
        let store = SlotStore::load(&config)?;

        for id in 1..=5 {
            assert!(config.backup_path.join(format!("slot{}", id)).is_dir());
        }
        assert_eq!(store.max_displayed_id(), 5);
        assert_eq!(store.used_slots_count(), 0);
        assert!(store.latest_used().is_none());
        Ok(())
    }

    #[test]
    fn test_locate_maps_ids_to_tiers() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SlotStore::load(&config(temp_dir.path(), vec![3, 2], false))?;

        assert_eq!(store.locate(1), Some((0, 2)));
        assert_eq!(store.locate(3), Some((0, 0)));
        assert_eq!(store.locate(4), Some((1, 1)));
        assert_eq!(store.locate(5), Some((1, 0)));
        assert_eq!(store.locate(6), None);
        assert_eq!(store.locate(0), None);
        Ok(())
    }

    #[test]
    fn test_load_reads_persisted_slots_and_skips_corrupt() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = config(temp_dir.path(), vec![3], false);
        SlotStore::load(&config)?;

        info(100.0).save(&config.backup_path.join("slot2"))?;
        info(200.0).save(&config.backup_path.join("slot3"))?;
        std::fs::write(config.backup_path.join("slot1").join("slot.json"), b"not json")?;

        let store = SlotStore::load(&config)?;
        assert_eq!(store.used_slots_count(), 2);
        assert_eq!(store.resolve(1)?.info.created_at, 200.0);
        assert_eq!(store.resolve(2)?.info.created_at, 100.0);
        assert!(matches!(store.resolve(3), Err(BackupError::InvalidSlot(_))));
        Ok(())
    }

    #[test]
    fn test_six_backups_into_capacity_five() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = SlotStore::load(&config(temp_dir.path(), vec![5], false))?;

        let mut evicted = Vec::new();
        for minute in [0.0, 10.0, 20.0, 30.0, 40.0, 50.0] {
            evicted.push(push(&mut store, minute * 60.0).evicted);
        }

        assert!(evicted[..5].iter().all(|s| s.is_empty()));
        assert_eq!(evicted[5].info.created_at, 0.0);
        assert_eq!(store.used_slots_count(), 5);
        assert_eq!(store.latest_used().unwrap().1.info.created_at, 3000.0);
        Ok(())
    }

    #[test]
    fn test_auto_merge_requests_promotion_when_tier_fills() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = SlotStore::load(&config(temp_dir.path(), vec![2, 2], true))?;

        assert_eq!(push(&mut store, 1.0).promotion, None);
        assert_eq!(
            push(&mut store, 2.0).promotion,
            Some(MergeRequest { start: 1, end: 2, target_tier: 1 })
        );
        assert_eq!(push(&mut store, 3.0).promotion, None);
        Ok(())
    }

    #[test]
    fn test_last_tier_never_promotes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = SlotStore::load(&config(temp_dir.path(), vec![1], true))?;
        assert_eq!(push(&mut store, 1.0).promotion, None);
        assert_eq!(push(&mut store, 2.0).promotion, None);
        Ok(())
    }

    #[test]
    fn test_clear_and_successor() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = SlotStore::load(&config(temp_dir.path(), vec![4], false))?;
        for t in [1.0, 2.0, 3.0] {
            push(&mut store, t);
        }
        // ids: 1 → 3.0, 2 → 2.0, 3 → 1.0, 4 → empty
        assert_eq!(store.successor(3).map(|(id, _)| id), Some(2));
        assert_eq!(store.successor(1), None);

        let path = store.get(2).unwrap().path.clone();
        let cleared = store.clear(2, true)?.unwrap();
        assert_eq!(cleared.info.created_at, 2.0);
        assert!(!path.join("slot.json").exists());

        // ids shift: 1 → 3.0, 2 → 1.0, 3 and 4 empty
        assert_eq!(store.resolve(2)?.info.created_at, 1.0);
        assert_eq!(store.used_slots_count(), 2);
        Ok(())
    }

    #[test]
    fn test_clear_range() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = SlotStore::load(&config(temp_dir.path(), vec![4], false))?;
        for t in [1.0, 2.0, 3.0, 4.0] {
            push(&mut store, t);
        }

        let cleared = store.clear_range(2, 3, false)?;
        assert_eq!(cleared.len(), 2);
        assert_eq!(store.used_slots_count(), 2);
        assert_eq!(store.resolve(1)?.info.created_at, 4.0);
        assert_eq!(store.resolve(2)?.info.created_at, 1.0);
        Ok(())
    }

    #[test]
    fn test_overwrite_slot_resolution() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = config(temp_dir.path(), vec![2], false);
        let mut store = SlotStore::load(&config)?;

        assert!(store.resolve(OVERWRITE_SLOT_ID).is_err());

        std::fs::create_dir_all(config.overwrite_dir())?;
        info(5.0).save(&config.overwrite_dir())?;
        store.set_overwrite(info(5.0));
        assert_eq!(store.resolve(0)?.path, config.overwrite_dir());
        assert_eq!(store.total_size(), 10);

        let reloaded = SlotStore::load(&config)?;
        assert!(reloaded.overwrite_slot().is_some());

        store.delete_overwrite()?;
        assert!(store.resolve(0).is_err());
        assert!(!config.overwrite_dir().exists());
        Ok(())
    }
}
