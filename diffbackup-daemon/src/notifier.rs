use diffbackup::{CommandSource, Notifier, ProcessControl};
use std::sync::Arc;
use tracing::{info, warn};

/// Replies go to the daemon log; broadcasts are also said in game
pub struct ConsoleNotifier {
    server: Arc<dyn ProcessControl>,
}

impl ConsoleNotifier {
    pub fn new(server: Arc<dyn ProcessControl>) -> Self {
        Self { server }
    }

    fn say(&self, message: String) {
        if !self.server.is_running() {
            return;
        }
        let server = self.server.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = server.execute(&message).await {
                    warn!("Failed to broadcast in game: {}", e);
                }
            });
        }
    }
}

impl Notifier for ConsoleNotifier {
    fn tell(&self, source: &CommandSource, message: &str) {
        match source {
            CommandSource::Player(name) => {
                info!(player = %name, "{}", message);
                self.say(format!("tell {} [Backup] {}", name, message));
            }
            _ => info!(%source, "{}", message),
        }
    }

    fn broadcast(&self, message: &str) {
        info!("{}", message);
        self.say(format!("say [Backup] {}", message));
    }
}
