//! Backup coordinator - Orchestrates backup, restore and merge.
//!
//! The three operations never overlap: each one holds an [`OpGuard`] from
//! the shared [`ExclusiveState`] for its whole run. The slot store is only
//! written by the guard holder.

mod backup;
mod merge;
mod restore;
pub mod state;

pub use backup::BackupReport;
pub use merge::MergeReport;
pub use restore::{plan_restore, RestorePlan, RestoreReport, SourceSlot};
pub use state::{AbortOutcome, Mode, Operation, OpGuard, PendingRestore, Phase};

use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collab::{CommandSource, Notifier, ProcessControl};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::slots::{Slot, SlotStore, OVERWRITE_SLOT_ID};
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::format_bytes;
use state::ExclusiveState;

/// One line of the slot listing
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSummary {
    pub id: u32,
    pub display_time: String,
    pub size_bytes: u64,
    pub file_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub phase: Phase,
    pub used_slots: usize,
    pub total_slots: usize,
    pub total_size: u64,
    pub overwrite: Option<SlotSummary>,
}

struct Inner {
    config: StdRwLock<EngineConfig>,
    store: RwLock<SlotStore>,
    state: Arc<ExclusiveState>,
    process: Arc<dyn ProcessControl>,
    notifier: Arc<dyn Notifier>,
    events: EventBus,
    unloaded: CancellationToken,
}

/// Cheap to clone; every clone drives the same engine
#[derive(Clone)]
pub struct BackupCoordinator {
    inner: Arc<Inner>,
}

impl BackupCoordinator {
    /// Load the slot store for `config` and wire the collaborators
    pub fn new(
        config: EngineConfig,
        process: Arc<dyn ProcessControl>,
        notifier: Arc<dyn Notifier>,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        let store = SlotStore::load(&config)?;
        info!(
            "Slot store ready: {}/{} slots used in {} tier(s)",
            store.used_slots_count(),
            config.total_slots(),
            store.tiers().len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config: StdRwLock::new(config),
                store: RwLock::new(store),
                state: ExclusiveState::new(),
                process,
                notifier,
                events,
                unloaded: CancellationToken::new(),
            }),
        })
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> EngineConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.phase()
    }

    pub fn pending_restore(&self) -> Option<PendingRestore> {
        self.inner.state.pending()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        self.inner.events.emit(event);
    }

    pub fn process(&self) -> &Arc<dyn ProcessControl> {
        &self.inner.process
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.inner.notifier
    }

    pub fn is_unloaded(&self) -> bool {
        self.inner.unloaded.is_cancelled()
    }

    /// Cancel the pending restore request and the running countdown or save wait
    pub fn trigger_abort(&self, source: &CommandSource) -> AbortOutcome {
        let outcome = self.inner.state.abort();
        let message = match (&outcome.cleared, outcome.cancelled) {
            (Some(pending), _) => format!("Restore to slot {} cancelled", pending.slot),
            (None, Some(op)) => format!("Aborting {}", op),
            (None, None) => "Nothing to abort".to_string(),
        };
        info!(source = %source, "{}", message);
        self.inner.notifier.tell(source, &message);
        outcome
    }

    /// Save-completed notification from the server output
    pub fn on_save_completed(&self) {
        if self.inner.state.mark_saved() {
            debug!("World save completed");
        }
    }

    /// True while a backup waits for the world save to finish
    pub fn is_waiting_for_save(&self) -> bool {
        self.inner.state.stuck_for().is_some()
    }

    /// How long the current save has been outstanding, if nobody recovered it yet
    pub fn save_wait_elapsed(&self) -> Option<Duration> {
        self.inner.state.stuck_for()
    }

    /// Force-restart a server whose save never completed.
    ///
    /// Runs at most once per backup no matter how many callers race; the
    /// waiting backup continues as if the save had completed.
    pub async fn recover_stuck_save(&self) -> Result<bool> {
        let Some(waited) = self.inner.state.stuck_for() else {
            return Ok(false);
        };
        if !self.inner.state.claim_recovery() {
            return Ok(false);
        }

        warn!(
            waited_secs = waited.as_secs(),
            "World save did not complete, forcing a server restart"
        );
        self.inner.events.emit(EngineEvent::SaveTimedOut {
            waited_secs: waited.as_secs(),
        });
        self.inner
            .notifier
            .broadcast("World save is stuck, restarting the server");

        let process = &self.inner.process;
        let result = async {
            process.kill().await?;
            process.wait_until_stopped().await?;
            process.start().await
        }
        .await;

        self.inner.state.mark_saved();
        if let Err(e) = &result {
            error!("Forced restart failed: {}", e);
        }
        result.map(|_| true)
    }

    /// Stop accepting work and abort whatever is running
    pub fn unload(&self) {
        info!("Unloading backup engine");
        self.inner.unloaded.cancel();
        self.inner.state.abort();
    }

    /// Populated slot at `id`; 0 is the overwrite slot
    pub async fn slot(&self, id: u32) -> Result<Slot> {
        self.inner.store.read().await.resolve(id)
    }

    /// Populated slots newest first, the overwrite slot (ID 0) leading
    pub async fn list(&self) -> Vec<SlotSummary> {
        let store = self.inner.store.read().await;
        let mut summaries: Vec<SlotSummary> = store
            .overwrite_slot()
            .map(|slot| summary(OVERWRITE_SLOT_ID, &slot))
            .into_iter()
            .collect();
        summaries.extend(store.slots().into_iter().map(|(id, slot)| summary(id, slot)));
        summaries
    }

    pub async fn status(&self) -> Status {
        let store = self.inner.store.read().await;
        Status {
            phase: self.phase(),
            used_slots: store.used_slots_count(),
            total_slots: store.max_displayed_id() as usize,
            total_size: store.total_size(),
            overwrite: store
                .overwrite_slot()
                .map(|slot| summary(OVERWRITE_SLOT_ID, &slot)),
        }
    }

    /// Rebuild the slot store from disk under a new configuration
    pub async fn reload(&self, source: &CommandSource, config: EngineConfig) -> Result<()> {
        config.validate()?;
        if let Some(pending) = self.inner.state.pending() {
            return Err(BackupError::AlreadyPending(pending.slot));
        }
        let _guard = self.inner.state.try_acquire(Operation::Merging)?;

        let loaded = {
            let config = config.clone();
            tokio::task::spawn_blocking(move || SlotStore::load(&config))
                .await
                .map_err(join_error)??
        };

        let used = loaded.used_slots_count();
        *self.inner.store.write().await = loaded;
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;

        info!("Configuration reloaded, {} slot(s) in use", used);
        self.inner
            .notifier
            .tell(source, &format!("Configuration reloaded, {} slot(s) in use", used));
        Ok(())
    }

    /// Take the exclusivity state; an unload cancels a waiting caller
    async fn enter(&self, op: Operation, mode: Mode) -> Result<OpGuard> {
        if self.is_unloaded() {
            return Err(BackupError::Aborted("engine unloaded".into()));
        }
        tokio::select! {
            guard = self.inner.state.acquire(op, mode) => guard,
            _ = self.inner.unloaded.cancelled() => Err(BackupError::Aborted("engine unloaded".into())),
        }
    }

    /// Tell the source why its request was refused or failed
    fn report(&self, source: &CommandSource, what: &str, err: &BackupError) {
        if err.is_recoverable() {
            info!(source = %source, "{} not performed: {}", what, err);
        } else {
            error!(source = %source, "{} failed: {}", what, err);
        }
        self.inner
            .notifier
            .tell(source, &format!("{} failed: {}", what, err));
    }
}

fn summary(id: u32, slot: &Slot) -> SlotSummary {
    SlotSummary {
        id,
        display_time: slot.info.display_time.clone(),
        size_bytes: slot.info.backup_size_bytes,
        file_count: slot.info.included_files.len(),
    }
}

impl std::fmt::Display for SlotSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({}, {} files)",
            self.id,
            self.display_time,
            format_bytes(self.size_bytes),
            self.file_count
        )
    }
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> BackupError {
    BackupError::Io(std::io::Error::other(e))
}
