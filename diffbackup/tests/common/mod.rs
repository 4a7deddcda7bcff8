#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

use diffbackup::fs::walker::{walk_directory, WalkOptions};
use diffbackup::{
    BackupCoordinator, CommandSource, Engine, EngineConfig, EngineEvent, Notifier, PlayerRegistry,
    ProcessControl, Result,
};

type SaveHook = Box<dyn Fn() + Send + Sync>;

/// Server stand-in: records commands and answers `save-all` when asked to
pub struct MockServer {
    pub commands: Mutex<Vec<String>>,
    pub stops: AtomicUsize,
    pub kills: AtomicUsize,
    pub starts: AtomicUsize,
    running: AtomicBool,
    answer_saves: AtomicBool,
    save_hook: Mutex<Option<SaveHook>>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            answer_saves: AtomicBool::new(true),
            save_hook: Mutex::new(None),
        })
    }

    pub fn set_save_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.save_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Stop reporting finished saves (a hung server)
    pub fn hang_saves(&self) {
        self.answer_saves.store(false, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| c.as_str() == command).count()
    }
}

#[async_trait]
impl ProcessControl for MockServer {
    async fn execute(&self, command: &str) -> Result<()> {
        self.commands.lock().unwrap().push(command.to_string());
        if command.starts_with("save-all") && self.answer_saves.load(Ordering::SeqCst) {
            if let Some(hook) = self.save_hook.lock().unwrap().as_ref() {
                hook();
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_until_stopped(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockPlayers {
    online: Mutex<Vec<String>>,
}

impl MockPlayers {
    pub fn join(&self, name: &str) {
        self.online.lock().unwrap().push(name.to_string());
    }

    pub fn leave(&self, name: &str) {
        self.online.lock().unwrap().retain(|p| p != name);
    }
}

impl PlayerRegistry for MockPlayers {
    fn has_any_player(&self) -> bool {
        !self.online.lock().unwrap().is_empty()
    }

    fn list_players(&self) -> Vec<String> {
        self.online.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<(CommandSource, String)>>,
}

impl RecordingNotifier {
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().unwrap().iter().any(|(_, m)| m.contains(needle))
    }
}

impl Notifier for RecordingNotifier {
    fn tell(&self, source: &CommandSource, message: &str) {
        self.messages.lock().unwrap().push((source.clone(), message.to_string()));
    }
}

pub struct Harness {
    pub temp_dir: TempDir,
    pub config: EngineConfig,
    pub server: Arc<MockServer>,
    pub players: Arc<MockPlayers>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: Engine,
    clock: AtomicU64,
}

impl Harness {
    pub fn new(tiers: Vec<usize>) -> Self {
        Self::with_config(|config| config.slot_tiers = tiers)
    }

    pub fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig {
            backup_path: temp_dir.path().join("differential_backup"),
            server_path: temp_dir.path().join("server"),
            restore_countdown_secs: 0,
            ..EngineConfig::default()
        };
        adjust(&mut config);
        fs::create_dir_all(config.world_dir()).unwrap();
        fs::write(config.world_dir().join("session.lock"), b"lock").unwrap();

        let server = MockServer::new();
        let players = Arc::new(MockPlayers::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Engine::new(config.clone(), server.clone(), players.clone(), notifier.clone()).unwrap();

        let coordinator = engine.coordinator().clone();
        server.set_save_hook(move || coordinator.on_save_completed());

        Self {
            temp_dir,
            config,
            server,
            players,
            notifier,
            engine,
            clock: AtomicU64::new(1_600_000_000),
        }
    }

    pub fn coordinator(&self) -> &BackupCoordinator {
        self.engine.coordinator()
    }

    pub fn world(&self) -> PathBuf {
        self.config.world_dir()
    }

    /// Write a world file with a fresh, strictly increasing mtime
    pub fn write(&self, relative: &str, content: &str) {
        let path = self.world().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        let secs = self.clock.fetch_add(10, Ordering::SeqCst);
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        fs::File::options().write(true).open(&path).unwrap().set_modified(at).unwrap();
    }

    pub fn remove(&self, relative: &str) {
        fs::remove_file(self.world().join(relative)).unwrap();
    }

    /// Every world file except ignored ones, with its content
    pub fn world_contents(&self) -> BTreeMap<String, String> {
        contents(&self.world(), &self.config.ignored_files)
    }

    pub async fn backup(&self) -> diffbackup::coordinator::BackupReport {
        self.coordinator()
            .make_backup(&CommandSource::Console, diffbackup::Mode::Reject)
            .await
            .unwrap()
    }

    pub async fn included(&self, id: u32) -> Vec<String> {
        let slot = self.coordinator().slot(id).await.unwrap();
        slot.info.included_files.into_iter().collect()
    }

    pub async fn restore(&self, id: u32) {
        let console = CommandSource::Console;
        self.coordinator().restore_backup(&console, id).await.unwrap();
        self.coordinator().confirm_restore(&console).await.unwrap();
    }
}

pub fn contents(root: &Path, excluded: &[String]) -> BTreeMap<String, String> {
    walk_directory(root, &WalkOptions::excluding(excluded))
        .unwrap()
        .into_iter()
        .map(|file| {
            let content = fs::read_to_string(&file.path).unwrap();
            (file.relative_path, content)
        })
        .collect()
}

/// Wait for the first event matching `pred`
pub async fn next_event(
    rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    loop {
        let event = rx.recv().await.unwrap();
        if pred(&event) {
            return event;
        }
    }
}
