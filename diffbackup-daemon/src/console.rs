//! Operator console: `!!dab` commands drive the engine, anything else goes
//! to the server.

use diffbackup::{CommandSource, Engine, Mode, Notifier};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::DaemonConfig;

pub const PREFIX: &str = "!!dab";

const HELP: &str = "\
!!dab make                     make a backup now
!!dab back [id]                request a restore (default: slot 1)
!!dab confirm                  confirm the pending restore
!!dab abort                    cancel a pending or running operation
!!dab merge <start> <end> <t>  merge slots start..end into tier t
!!dab del <id>                 delete a slot (0 is the overwrite slot)
!!dab list                     list populated slots
!!dab status                   show engine status
!!dab enable | disable         toggle scheduled backups
!!dab reload                   reload the configuration file";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Make,
    Back(u32),
    Confirm,
    Abort,
    Merge { start: u32, end: u32, tier: usize },
    Delete(u32),
    List,
    Status,
    Enable,
    Disable,
    Reload,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    Command(ConsoleCommand),
    /// Not for us; send to the server console
    Forward(String),
    Invalid(String),
}

fn number<T: std::str::FromStr>(arg: Option<&str>, what: &str) -> Result<T, String> {
    arg.ok_or_else(|| format!("missing {}", what))?
        .parse()
        .map_err(|_| format!("{} must be a non-negative number", what))
}

fn parse_merge<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<ConsoleCommand, String> {
    Ok(ConsoleCommand::Merge {
        start: number(words.next(), "start")?,
        end: number(words.next(), "end")?,
        tier: number(words.next(), "tier")?,
    })
}

pub fn parse(line: &str) -> ConsoleLine {
    let line = line.trim();
    let mut words = line.split_whitespace();
    if words.next() != Some(PREFIX) {
        return ConsoleLine::Forward(line.to_string());
    }

    let parsed = match words.next() {
        None | Some("help") => Ok(ConsoleCommand::Help),
        Some("make") => Ok(ConsoleCommand::Make),
        Some("back") => match words.next() {
            None => Ok(ConsoleCommand::Back(1)),
            id => number(id, "slot id").map(ConsoleCommand::Back),
        },
        Some("confirm") => Ok(ConsoleCommand::Confirm),
        Some("abort") => Ok(ConsoleCommand::Abort),
        Some("merge") => parse_merge(&mut words),
        Some("del") => number(words.next(), "slot id").map(ConsoleCommand::Delete),
        Some("list") => Ok(ConsoleCommand::List),
        Some("status") => Ok(ConsoleCommand::Status),
        Some("enable") => Ok(ConsoleCommand::Enable),
        Some("disable") => Ok(ConsoleCommand::Disable),
        Some("reload") => Ok(ConsoleCommand::Reload),
        Some(other) => Err(format!("unknown command '{}'", other)),
    };

    match parsed {
        Ok(command) if words.next().is_none() => ConsoleLine::Command(command),
        Ok(_) => ConsoleLine::Invalid("too many arguments".to_string()),
        Err(message) => ConsoleLine::Invalid(message),
    }
}

/// Runs console commands against the engine
#[derive(Clone)]
pub struct Console {
    engine: Engine,
    notifier: Arc<dyn Notifier>,
    config_path: Option<PathBuf>,
}

impl Console {
    pub fn new(engine: Engine, notifier: Arc<dyn Notifier>, config_path: Option<PathBuf>) -> Self {
        Self {
            engine,
            notifier,
            config_path,
        }
    }

    fn reply(&self, message: &str) {
        self.notifier.tell(&CommandSource::Console, message);
    }

    /// Handle one stdin line; commands run on their own task so `abort`
    /// can reach an operation that is still running
    pub async fn handle_line(&self, line: &str) {
        match parse(line) {
            ConsoleLine::Forward(command) if command.is_empty() => {}
            ConsoleLine::Forward(command) => {
                if let Err(e) = self.engine.coordinator().process().execute(&command).await {
                    warn!("Failed to forward '{}': {}", command, e);
                }
            }
            ConsoleLine::Invalid(message) => self.reply(&format!("{} (try {} help)", message, PREFIX)),
            ConsoleLine::Command(command) => {
                let console = self.clone();
                tokio::spawn(async move { console.run(command).await });
            }
        }
    }

    pub async fn run(&self, command: ConsoleCommand) {
        let source = CommandSource::Console;
        let coordinator = self.engine.coordinator();
        debug!(?command, "Console command");

        // failures were already reported to the source
        match command {
            ConsoleCommand::Make => {
                let _ = coordinator.make_backup(&source, Mode::Reject).await;
            }
            ConsoleCommand::Back(id) => {
                let _ = coordinator.restore_backup(&source, id).await;
            }
            ConsoleCommand::Confirm => {
                let _ = coordinator.confirm_restore(&source).await;
            }
            ConsoleCommand::Abort => {
                coordinator.trigger_abort(&source);
            }
            ConsoleCommand::Merge { start, end, tier } => {
                let _ = coordinator.merge_slots(&source, start, end, tier, Mode::Reject).await;
            }
            ConsoleCommand::Delete(id) => {
                let _ = coordinator.delete_backup(&source, id).await;
            }
            ConsoleCommand::List => {
                let slots = coordinator.list().await;
                if slots.is_empty() {
                    self.reply("No backups yet");
                }
                for slot in slots {
                    self.reply(&slot.to_string());
                }
            }
            ConsoleCommand::Status => {
                let status = coordinator.status().await;
                let scheduler = self.engine.scheduler();
                self.reply(&format!(
                    "{:?}; {}/{} slot(s) used, {}",
                    status.phase,
                    status.used_slots,
                    status.total_slots,
                    diffbackup::utils::format::format_bytes(status.total_size),
                ));
                if scheduler.is_enabled() {
                    self.reply(&format!(
                        "Next scheduled backup in {}s",
                        scheduler.next_backup_in().as_secs()
                    ));
                } else {
                    self.reply("Scheduled backups are disabled");
                }
                if let Some(overwrite) = status.overwrite {
                    self.reply(&format!("Overwrite slot: {}", overwrite));
                }
            }
            ConsoleCommand::Enable | ConsoleCommand::Disable => {
                let enabled = command == ConsoleCommand::Enable;
                self.engine.scheduler().set_enabled(enabled);
                self.reply(if enabled {
                    "Scheduled backups enabled"
                } else {
                    "Scheduled backups disabled"
                });
            }
            ConsoleCommand::Reload => self.reload().await,
            ConsoleCommand::Help => {
                for line in HELP.lines() {
                    self.reply(line);
                }
            }
        }
    }

    async fn reload(&self) {
        let Some(path) = &self.config_path else {
            self.reply("Running on built-in defaults, nothing to reload");
            return;
        };
        match DaemonConfig::from_file(path) {
            Ok(config) => {
                let _ = self
                    .engine
                    .reload(&CommandSource::Console, config.engine)
                    .await;
            }
            Err(e) => self.reply(&format!("Failed to read {}: {}", path.display(), e)),
        }
    }
}
