//! The managed game server as a child process.

use async_trait::async_trait;
use diffbackup::{BackupError, ProcessControl, Result};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;

pub struct ChildServer {
    config: DaemonConfig,
    stdin: Mutex<Option<ChildStdin>>,
    /// Cancelled to kill the current child
    kill: StdMutex<Option<CancellationToken>>,
    running: Arc<watch::Sender<bool>>,
    output: mpsc::UnboundedSender<String>,
}

impl ChildServer {
    /// Output lines of every child this server spawns arrive on the receiver
    pub fn new(config: DaemonConfig) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (output, rx) = mpsc::unbounded_channel();
        let (running, _) = watch::channel(false);
        let server = Self {
            config,
            stdin: Mutex::new(None),
            kill: StdMutex::new(None),
            running: Arc::new(running),
            output,
        };
        (server, rx)
    }

    /// Follows the running flag; flips to `false` whenever the child exits
    pub fn watch_running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    fn process_error(message: impl Into<String>) -> BackupError {
        BackupError::Process(message.into())
    }
}

#[async_trait]
impl ProcessControl for ChildServer {
    async fn execute(&self, command: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| Self::process_error("server is not running"))?;
        debug!(command, "Server command");
        pipe.write_all(format!("{}\n", command).as_bytes()).await?;
        pipe.flush().await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.is_running() {
            debug!("Server is already stopped");
            return Ok(());
        }
        info!("Stopping server");
        self.execute(&self.config.server.stop_command).await
    }

    async fn kill(&self) -> Result<()> {
        warn!("Killing server");
        let token = self
            .kill
            .lock()
            .map_err(|_| Self::process_error("kill handle poisoned"))?
            .clone();
        match token {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(Self::process_error("server is not running")),
        }
    }

    async fn wait_until_stopped(&self) -> Result<()> {
        let mut rx = self.running.subscribe();
        rx.wait_for(|running| !*running)
            .await
            .map_err(|_| Self::process_error("server watcher is gone"))?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let working_dir = self.config.working_dir();
        info!(command = %self.config.server.command, dir = %working_dir.display(), "Starting server");
        let mut child = Command::new(&self.config.server.command)
            .args(&self.config.server.args)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Self::process_error("server stdout is not captured"))?;
        *self.stdin.lock().await = child.stdin.take();

        let kill = CancellationToken::new();
        *self
            .kill
            .lock()
            .map_err(|_| Self::process_error("kill handle poisoned"))? = Some(kill.clone());
        self.running.send_replace(true);

        let output = self.output.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if output.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read server output: {}", e);
                        break;
                    }
                }
            }
        });

        let running = self.running.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill server: {}", e);
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => info!(%status, "Server exited"),
                Err(e) => warn!("Failed to wait for server: {}", e),
            }
            running.send_replace(false);
        });

        Ok(())
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A shell stand-in that echoes commands in log format and exits on `stop`
    fn echo_server(dir: &TempDir) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.server.command = "sh".to_string();
        config.server.args = vec![
            "-c".to_string(),
            r#"while read l; do echo "[00:00:00 INFO]: $l"; [ "$l" = stop ] && exit 0; done"#
                .to_string(),
        ];
        config.server.working_dir = Some(dir.path().to_path_buf());
        config
    }

    #[tokio::test]
    async fn test_commands_reach_the_child_and_stop_ends_it() {
        let dir = TempDir::new().unwrap();
        let (server, mut output) = ChildServer::new(echo_server(&dir));
        assert!(server.execute("list").await.is_err());

        server.start().await.unwrap();
        assert!(server.is_running());
        server.execute("save-all flush").await.unwrap();
        assert_eq!(output.recv().await.unwrap(), "[00:00:00 INFO]: save-all flush");

        server.stop().await.unwrap();
        server.wait_until_stopped().await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stop_and_wait_on_a_stopped_server() {
        let dir = TempDir::new().unwrap();
        let (server, _output) = ChildServer::new(echo_server(&dir));

        server.stop().await.unwrap();
        server.wait_until_stopped().await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_kill_and_restart() {
        let dir = TempDir::new().unwrap();
        let (server, mut output) = ChildServer::new(echo_server(&dir));

        server.start().await.unwrap();
        server.kill().await.unwrap();
        server.wait_until_stopped().await.unwrap();
        assert!(!server.is_running());

        server.start().await.unwrap();
        server.execute("hello").await.unwrap();
        assert_eq!(output.recv().await.unwrap(), "[00:00:00 INFO]: hello");
        server.kill().await.unwrap();
        server.wait_until_stopped().await.unwrap();
    }
}
