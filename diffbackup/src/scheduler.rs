//! Periodic backup scheduling.
//!
//! A one-second tick decides whether an automatic backup is due. Intervals
//! without player activity are skipped; the first player to join after a
//! skip triggers a catch-up backup. The tick also watches for a world save
//! that never completes.

use chrono::Local;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collab::{CommandSource, PlayerRegistry};
use crate::coordinator::{BackupCoordinator, Mode};
use crate::events::EngineEvent;
use crate::utils::format::display_time;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ScheduleState {
    last_backup: Instant,
    enabled: bool,
    /// A player was online at some point since the last backup
    player_active: bool,
    schedule_was_skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Wait,
    Skip,
    Backup,
}

fn decide(state: &ScheduleState, elapsed: Duration, interval: Duration, server_running: bool) -> Decision {
    if elapsed < interval || !state.enabled || !server_running {
        Decision::Wait
    } else if !state.player_active {
        Decision::Skip
    } else {
        Decision::Backup
    }
}

struct Inner {
    coordinator: BackupCoordinator,
    players: Arc<dyn PlayerRegistry>,
    state: Mutex<ScheduleState>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(coordinator: BackupCoordinator, players: Arc<dyn PlayerRegistry>) -> Self {
        let enabled = coordinator.config().enabled;
        let player_active = players.has_any_player();
        Self {
            inner: Arc::new(Inner {
                coordinator,
                players,
                state: Mutex::new(ScheduleState {
                    last_backup: Instant::now(),
                    enabled,
                    player_active,
                    schedule_was_skipped: false,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScheduleState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the tick loop; it runs until [`Scheduler::stop`]
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let cancel = self.inner.cancel.clone();
        let mut events = self.inner.coordinator.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Backup scheduler started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => scheduler.tick().await,
                    event = events.recv() => match event {
                        Ok(EngineEvent::BackupCompleted { .. }) => {
                            scheduler.reset_clock();
                            scheduler.announce_next();
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => warn!("Scheduler missed {} engine event(s)", missed),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            info!("Backup scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// One scheduling decision
    pub async fn tick(&self) {
        let coordinator = &self.inner.coordinator;
        let config = coordinator.config();

        if let Some(waited) = coordinator.save_wait_elapsed() {
            if waited >= config.saving_timeout() {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(e) = coordinator.recover_stuck_save().await {
                        error!("Stuck save recovery failed: {}", e);
                    }
                });
            }
        }

        let server_running = coordinator.process().is_running();
        let decision = {
            let mut state = self.lock();
            let decision = decide(&state, state.last_backup.elapsed(), config.interval(), server_running);
            match decision {
                Decision::Wait => {}
                Decision::Skip => {
                    state.last_backup = Instant::now();
                    state.schedule_was_skipped = true;
                }
                Decision::Backup => {
                    state.last_backup = Instant::now();
                    state.schedule_was_skipped = false;
                    if !self.inner.players.has_any_player() {
                        state.player_active = false;
                    }
                }
            }
            decision
        };

        match decision {
            Decision::Wait => {}
            Decision::Skip => {
                info!("No player activity since the last backup, skipping scheduled backup");
                coordinator.emit(EngineEvent::BackupSkipped {
                    reason: "no player activity".into(),
                });
                self.announce_next();
            }
            Decision::Backup => self.spawn_backup(),
        }
    }

    fn spawn_backup(&self) {
        let coordinator = self.inner.coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.make_backup(&CommandSource::Scheduler, Mode::Wait).await {
                debug!("Scheduled backup did not complete: {}", e);
            }
        });
    }

    pub fn on_player_joined(&self, name: &str) {
        let catch_up = {
            let mut state = self.lock();
            state.player_active = true;
            state.enabled && std::mem::take(&mut state.schedule_was_skipped)
        };
        debug!(player = name, "Player activity recorded");
        if !catch_up {
            return;
        }

        let delay = self.inner.coordinator.config().join_backup_delay();
        info!("{} joined after a skipped backup, backing up in {:?}", name, delay);
        let scheduler = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    scheduler.reset_clock();
                    scheduler.spawn_backup();
                }
            }
        });
    }

    pub fn on_player_left(&self, name: &str) {
        if !self.inner.players.has_any_player() {
            debug!(player = name, "Last player left");
            self.lock().player_active = false;
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut state = self.lock();
            state.enabled = enabled;
            state.last_backup = Instant::now();
        }
        info!("Scheduled backups {}", if enabled { "enabled" } else { "disabled" });
        if enabled {
            self.announce_next();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn reset_clock(&self) {
        self.lock().last_backup = Instant::now();
    }

    /// Time until the next scheduled backup is due
    pub fn next_backup_in(&self) -> Duration {
        let interval = self.inner.coordinator.config().interval();
        interval.saturating_sub(self.lock().last_backup.elapsed())
    }

    fn announce_next(&self) {
        let remaining = self.next_backup_in();
        let at = chrono::Duration::from_std(remaining)
            .map(|d| Local::now() + d)
            .unwrap_or_else(|_| Local::now());
        info!("Next backup at {}", display_time(at));
    }
}
