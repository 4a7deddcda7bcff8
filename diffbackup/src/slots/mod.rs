//! Slot storage: metadata records, rotating tiers and the overwrite slot.

pub mod group;
pub mod info;
pub mod store;

pub use group::{Slot, SlotGroup};
pub use info::SlotInfo;
pub use store::{AddOutcome, MergeRequest, SlotStore, OVERWRITE_SLOT_ID};
