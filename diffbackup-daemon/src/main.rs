//! diffbackupd - runs a game server with differential world backups
//!
//! Starts the server as a child process, feeds its output to the backup
//! engine and takes `!!dab` operator commands on stdin.

mod config;
mod console;
mod notifier;
mod output;
mod players;
mod server;
mod shutdown;

use anyhow::Result;
use clap::Parser;
use diffbackup::{utils, Engine, Notifier, ProcessControl};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::DaemonConfig;
use crate::console::Console;
use crate::notifier::ConsoleNotifier;
use crate::players::OnlinePlayers;
use crate::server::ChildServer;
use crate::shutdown::ShutdownCoordinator;

/// How long a clean server stop may take before the child is killed
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting diffbackupd v{} (world: {})",
        env!("CARGO_PKG_VERSION"),
        config.engine.world_dir().display()
    );

    let (server, mut output) = ChildServer::new(config.clone());
    let server = Arc::new(server);
    let players = Arc::new(OnlinePlayers::default());
    let notifier: Arc<dyn Notifier> = Arc::new(ConsoleNotifier::new(server.clone()));
    let engine = Engine::new(
        config.engine.clone(),
        server.clone(),
        players.clone(),
        notifier.clone(),
    )?;

    let shutdown = ShutdownCoordinator::new();

    // Server output: echo, then route save and player notifications
    let output_task = {
        let engine = engine.clone();
        let players = players.clone();
        tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                println!("{}", line);
                if let Some(event) = output::parse_line(&line) {
                    players.apply(&event);
                    engine.handle_info(event);
                }
            }
        })
    };

    // Nobody is online on a server that went down
    {
        let players = players.clone();
        let mut running = server.watch_running();
        tokio::spawn(async move {
            while running.changed().await.is_ok() {
                if !*running.borrow() {
                    players.clear();
                }
            }
        });
    }

    server.start().await?;
    let scheduler = engine.start();

    let console_task = {
        let console = Console::new(engine.clone(), notifier.clone(), args.config.clone());
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => console.handle_line(&line).await,
                        Ok(None) => {
                            tracing::info!("Console input closed");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Failed to read console input: {}", e);
                            break;
                        }
                    },
                }
            }
        })
    };

    shutdown.wait_for_signal().await?;

    engine.unload();
    if let Err(e) = tokio::time::timeout(Duration::from_secs(5), scheduler).await {
        tracing::warn!("Scheduler did not stop in time: {}", e);
    }

    if server.is_running() {
        if let Err(e) = server.stop().await {
            tracing::warn!("Failed to stop server: {}", e);
        }
        if tokio::time::timeout(STOP_TIMEOUT, server.wait_until_stopped())
            .await
            .is_err()
        {
            tracing::warn!("Server did not stop within {:?}, killing it", STOP_TIMEOUT);
            server.kill().await?;
            server.wait_until_stopped().await?;
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(3), console_task).await;
    output_task.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}
