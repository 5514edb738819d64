//! Configuration management for team-speaker.
//!
//! Loads config from YAML files in standard locations. Every section has
//! defaults, so an absent or partial file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Config record (voice assignments, mute flag) inside the state directory.
pub const STATE_FILE: &str = "state.json";
/// Rendezvous socket inside the state directory.
pub const SOCKET_FILE: &str = "speaker.sock";
/// Advisory lock guarding stale socket recovery.
pub const LOCK_FILE: &str = "speaker.sock.lock";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_dir: String,
    pub teams_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: "~/.team-speaker".into(),
            teams_dir: "~/.claude/teams".into(),
        }
    }
}

impl PathsConfig {
    pub fn state_dir(&self) -> PathBuf {
        expand_home(&self.state_dir)
    }

    pub fn teams_dir(&self) -> PathBuf {
        expand_home(&self.teams_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.state_dir().join(SOCKET_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TTSConfig {
    pub voice: String,
    pub speed: f32,
    pub model_path: String,
    pub voices_path: String,
    pub tokenizer_path: String,
}

impl Default for TTSConfig {
    fn default() -> Self {
        Self {
            voice: "af_heart".into(),
            speed: 1.0,
            model_path: String::new(),
            voices_path: String::new(),
            tokenizer_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackBackend {
    Rodio,
    Command,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub backend: PlaybackBackend,
    pub command: Vec<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        let command = if cfg!(target_os = "macos") {
            "afplay"
        } else {
            "paplay"
        };
        Self {
            backend: PlaybackBackend::Rodio,
            command: vec![command.into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub inbox_debounce_ms: u64,
    pub team_debounce_ms: u64,
    pub read_retries: u32,
    pub retry_delay_ms: u64,
    pub skip_existing: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5000,
            inbox_debounce_ms: 150,
            team_debounce_ms: 1000,
            read_retries: 3,
            retry_delay_ms: 100,
            skip_existing: true,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn inbox_debounce(&self) -> Duration {
        Duration::from_millis(self.inbox_debounce_ms)
    }

    pub fn team_debounce(&self) -> Duration {
        Duration::from_millis(self.team_debounce_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub enabled: bool,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub tts: TTSConfig,
    pub playback: PlaybackConfig,
    pub watcher: WatcherConfig,
    pub mcp: McpConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./team-speaker.yaml
    /// 2. ~/.config/team-speaker/config.yaml
    /// 3. /etc/team-speaker/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("team-speaker.yaml")),
                dirs::home_dir().map(|h| h.join(".config/team-speaker/config.yaml")),
                Some(PathBuf::from("/etc/team-speaker/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> crate::Result<Self> {
        Ok(serde_yml::from_str(contents)?)
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
