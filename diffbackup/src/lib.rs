//! Differential Backup Library
//!
//! Slot-based differential backups of a live game-server world: mtime change
//! sets, rotating slot tiers, exclusive backup/restore/merge and a periodic
//! scheduler.

pub mod collab;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod events;
pub mod fs;
pub mod scheduler;
pub mod slots;
pub mod utils;

// Re-export commonly used types
pub use collab::{CommandSource, InfoEvent, Notifier, PlayerRegistry, ProcessControl};
pub use config::EngineConfig;
pub use coordinator::{BackupCoordinator, Mode, Operation, Phase};
pub use engine::Engine;
pub use events::{EngineEvent, EventBus};
pub use scheduler::Scheduler;
pub use utils::errors::{BackupError, Result};
