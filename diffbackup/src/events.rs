//! Engine events for observers (scheduler, host, tests).
//!
//! A broadcast channel fans every event out to all subscribers; sending
//! with no subscriber is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of queued events per subscriber
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    #[serde(rename = "backup:started")]
    BackupStarted { source: String },

    #[serde(rename = "backup:completed")]
    BackupCompleted {
        changed_files: usize,
        backup_size_bytes: u64,
        duration_secs: f64,
    },

    #[serde(rename = "backup:failed")]
    BackupFailed { error: String },

    #[serde(rename = "backup:skipped")]
    BackupSkipped { reason: String },

    #[serde(rename = "save:timed-out")]
    SaveTimedOut { waited_secs: u64 },

    #[serde(rename = "restore:completed")]
    RestoreCompleted {
        slot: u32,
        restored_files: usize,
        deleted_files: usize,
    },

    #[serde(rename = "restore:failed")]
    RestoreFailed { slot: u32, error: String },

    #[serde(rename = "merge:completed")]
    MergeCompleted {
        start: u32,
        end: u32,
        target_tier: usize,
        merged_files: usize,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Event delivered to {} subscriber(s)", count),
            Err(broadcast::error::SendError(event)) => debug!("No subscribers for {:?}", event),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
