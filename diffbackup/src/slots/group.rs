//! One tier of rotating slots.
//!
//! A tier owns a fixed arena of `capacity` slots covering the displayed IDs
//! `start..=end`. Positions run oldest → newest (empty slots sort first), so
//! displayed ID `d` sits at position `end - d`.

use std::path::PathBuf;

use super::info::SlotInfo;

/// A slot directory and what it currently holds
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub path: PathBuf,
    pub info: SlotInfo,
}

impl Slot {
    pub fn new(path: PathBuf, info: SlotInfo) -> Self {
        Self { path, info }
    }

    pub fn empty(path: PathBuf) -> Self {
        Self::new(path, SlotInfo::empty())
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }
}

/// Result of adding a slot to a tier
#[derive(Debug, Clone, PartialEq)]
pub struct Added {
    /// Slot pushed out of position 0
    pub evicted: Slot,
    /// The tier filled up since its last promotion
    pub full: bool,
}

#[derive(Debug, Clone)]
pub struct SlotGroup {
    start: u32,
    end: u32,
    slots: Vec<Slot>,
    added_since_merge: usize,
}

impl SlotGroup {
    /// Build a tier from its slots in any order; they are sorted by time
    pub fn new(start: u32, end: u32, slots: Vec<Slot>) -> Self {
        debug_assert_eq!(slots.len(), (end - start + 1) as usize);
        let mut group = Self {
            start,
            end,
            slots,
            added_since_merge: 0,
        };
        group.sort();
        group.added_since_merge = group.used_count();
        group
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, displayed_id: u32) -> bool {
        (self.start..=self.end).contains(&displayed_id)
    }

    /// Arena position of a displayed ID in this tier
    pub fn position(&self, displayed_id: u32) -> Option<usize> {
        position_in(self.start, self.end, displayed_id)
    }

    pub fn displayed_id(&self, position: usize) -> u32 {
        self.end - position as u32
    }

    pub fn get(&self, displayed_id: u32) -> Option<&Slot> {
        self.position(displayed_id).map(|p| &self.slots[p])
    }

    pub fn get_mut(&mut self, displayed_id: u32) -> Option<&mut Slot> {
        let position = self.position(displayed_id)?;
        Some(&mut self.slots[position])
    }

    pub fn oldest(&self) -> &Slot {
        &self.slots[0]
    }

    pub fn latest(&self) -> &Slot {
        &self.slots[self.slots.len() - 1]
    }

    /// Number of populated slots
    pub fn used_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    pub fn added_since_merge(&self) -> usize {
        self.added_since_merge
    }

    pub fn reset_added(&mut self) {
        self.added_since_merge = 0;
    }

    /// Slots with their displayed IDs, newest first
    pub fn iter_newest_first(&self) -> impl Iterator<Item = (u32, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .rev()
            .map(|(p, s)| (self.displayed_id(p), s))
    }

    /// Ring-buffer insert: drop position 0, append `slot` as the newest
    pub fn add(&mut self, slot: Slot) -> Added {
        let evicted = self.slots.remove(0);
        self.slots.push(slot);
        self.sort();
        self.added_since_merge += 1;
        Added {
            evicted,
            full: self.added_since_merge >= self.capacity(),
        }
    }

    /// Reset one slot to the empty sentinel; returns the previous contents
    pub fn clear(&mut self, displayed_id: u32) -> Option<Slot> {
        let position = self.position(displayed_id)?;
        let path = self.slots[position].path.clone();
        let previous = std::mem::replace(&mut self.slots[position], Slot::empty(path));
        if !previous.is_empty() {
            self.added_since_merge = self.added_since_merge.saturating_sub(1);
        }
        self.sort();
        Some(previous)
    }

    /// Replace the metadata of a populated slot in place
    pub fn update(&mut self, displayed_id: u32, info: SlotInfo) -> bool {
        match self.get_mut(displayed_id) {
            Some(slot) => {
                slot.info = info;
                self.sort();
                true
            }
            None => false,
        }
    }

    fn sort(&mut self) {
        self.slots
            .sort_by(|a, b| a.info.created_at.total_cmp(&b.info.created_at));
    }
}

/// Pure mapping of a displayed ID to an arena position within `start..=end`
pub fn position_in(start: u32, end: u32, displayed_id: u32) -> Option<usize> {
    if displayed_id < start || displayed_id > end {
        return None;
    }
    Some((end - displayed_id) as usize)
}
