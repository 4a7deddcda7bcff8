use diffbackup::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration: the engine section plus how to run the server
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Executable that runs the game server
    #[serde(default = "default_command")]
    pub command: String,

    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Defaults to the engine's `server_path`
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Console command that shuts the server down cleanly
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_command() -> String {
    "java".to_string()
}

fn default_args() -> Vec<String> {
    ["-Xmx2G", "-jar", "server.jar", "nogui"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_stop_command() -> String {
    "stop".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            working_dir: None,
            stop_command: default_stop_command(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn working_dir(&self) -> PathBuf {
        self.server
            .working_dir
            .clone()
            .unwrap_or_else(|| self.engine.server_path.clone())
    }
}
