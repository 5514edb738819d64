//! Error types for team-speaker.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify_debouncer_full::notify::Error),
}
