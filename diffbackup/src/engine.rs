//! Engine context built once at startup and handed to the host.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::collab::{CommandSource, InfoEvent, Notifier, PlayerRegistry, ProcessControl};
use crate::config::EngineConfig;
use crate::coordinator::BackupCoordinator;
use crate::events::EventBus;
use crate::scheduler::Scheduler;
use crate::utils::errors::Result;

#[derive(Clone)]
pub struct Engine {
    coordinator: BackupCoordinator,
    scheduler: Scheduler,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        process: Arc<dyn ProcessControl>,
        players: Arc<dyn PlayerRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let coordinator = BackupCoordinator::new(config, process, notifier, EventBus::new())?;
        let scheduler = Scheduler::new(coordinator.clone(), players);
        Ok(Self {
            coordinator,
            scheduler,
        })
    }

    /// Start the scheduler loop
    pub fn start(&self) -> JoinHandle<()> {
        self.scheduler.start()
    }

    pub fn coordinator(&self) -> &BackupCoordinator {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Route a notification from the server output
    pub fn handle_info(&self, event: InfoEvent) {
        debug!(?event, "Server info");
        match event {
            InfoEvent::SaveCompleted => self.coordinator.on_save_completed(),
            InfoEvent::PlayerJoined(name) => self.scheduler.on_player_joined(&name),
            InfoEvent::PlayerLeft(name) => self.scheduler.on_player_left(&name),
        }
    }

    /// Swap in a new configuration; the schedule restarts from now
    pub async fn reload(&self, source: &CommandSource, config: EngineConfig) -> Result<()> {
        let enabled = config.enabled;
        self.coordinator.reload(source, config).await?;
        self.scheduler.set_enabled(enabled);
        Ok(())
    }

    pub fn unload(&self) {
        self.scheduler.stop();
        self.coordinator.unload();
    }
}
