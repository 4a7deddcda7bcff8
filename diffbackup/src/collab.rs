//! Interfaces the engine consumes from its host.
//!
//! The host owns the managed server process, the online-player list, the
//! operator-facing output and the server's console stream. The engine only
//! sees these traits.

use async_trait::async_trait;
use std::fmt;

use crate::utils::errors::Result;

/// Control over the managed server process
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Run a console command on the server
    async fn execute(&self, command: &str) -> Result<()>;

    /// Ask the server to shut down cleanly
    async fn stop(&self) -> Result<()>;

    /// Terminate the server immediately
    async fn kill(&self) -> Result<()>;

    /// Resolve once the server process has exited
    async fn wait_until_stopped(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Who is online on the managed server
pub trait PlayerRegistry: Send + Sync {
    fn has_any_player(&self) -> bool;

    fn list_players(&self) -> Vec<String>;
}

/// Where an operation was requested from; replies go back there
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSource {
    Console,
    Player(String),
    Scheduler,
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSource::Console => write!(f, "console"),
            CommandSource::Player(name) => write!(f, "player {}", name),
            CommandSource::Scheduler => write!(f, "scheduler"),
        }
    }
}

/// Progress and result reporting
pub trait Notifier: Send + Sync {
    /// Reply to the source of a request
    fn tell(&self, source: &CommandSource, message: &str);

    /// Message every operator and player
    fn broadcast(&self, message: &str) {
        self.tell(&CommandSource::Console, message);
    }
}

/// Notifications parsed from the managed server's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoEvent {
    SaveCompleted,
    PlayerJoined(String),
    PlayerLeft(String),
}
