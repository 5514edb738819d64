//! Speaker: turns queued speech into audio, one item at a time.
//!
//! Components:
//! - `queue`: bounded FIFO that drains strictly sequentially
//! - `tts`: `Synthesizer` trait + native Kokoro ONNX implementation
//! - `player`: `Player` trait + rodio and external-command implementations

pub mod player;
pub mod queue;
pub mod tts;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// Renders `text` in voice `voice_id` into an audio file at `output`.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str, output: &Path) -> Result<()>;
}

/// Plays an audio file, returning once playback has finished.
#[async_trait]
pub trait Player: Send + Sync {
    async fn play(&self, path: &Path) -> Result<()>;
}
