//! Audio playback backends.
//!
//! `RodioPlayer` plays through the default output device. `CommandPlayer`
//! shells out to a platform player (`afplay`, `paplay`, `aplay`, ...).

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rodio::{Decoder, OutputStreamBuilder, Sink};
use tokio::process::Command;
use tracing::debug;

use super::Player;
use crate::config::{PlaybackBackend, PlaybackConfig};
use crate::error::{Error, Result};

/// Build the player selected in config.
pub fn from_config(config: &PlaybackConfig) -> Result<Arc<dyn Player>> {
    match config.backend {
        PlaybackBackend::Rodio => Ok(Arc::new(RodioPlayer)),
        PlaybackBackend::Command => Ok(Arc::new(CommandPlayer::new(config.command.clone())?)),
    }
}

/// Plays files through rodio on the blocking pool.
///
/// The output stream is opened per file so nothing audio-related is held
/// while the queue is idle.
pub struct RodioPlayer;

#[async_trait]
impl Player for RodioPlayer {
    async fn play(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || play_blocking(&path))
            .await
            .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?
    }
}

fn play_blocking(path: &Path) -> Result<()> {
    let file = File::open(path)?;
    let source = Decoder::new(BufReader::new(file))
        .map_err(|e| Error::Playback(format!("Failed to decode {}: {e}", path.display())))?;

    let mut stream = OutputStreamBuilder::open_default_stream()
        .map_err(|e| Error::Playback(format!("Failed to open audio output: {e}")))?;
    stream.log_on_drop(false);

    let sink = Sink::connect_new(stream.mixer());
    sink.append(source);
    sink.sleep_until_end();
    debug!("Finished playing {}", path.display());
    Ok(())
}

/// Runs `program args... <file>` and waits for it to exit.
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
}

impl CommandPlayer {
    pub fn new(command: Vec<String>) -> Result<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::Config("playback.command must name a program".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn command_for(&self, path: &Path) -> (String, Vec<PathBuf>) {
        let mut args: Vec<PathBuf> = self.args.iter().map(PathBuf::from).collect();
        args.push(path.to_path_buf());
        (self.program.clone(), args)
    }
}

#[async_trait]
impl Player for CommandPlayer {
    async fn play(&self, path: &Path) -> Result<()> {
        let (program, args) = self.command_for(path);
        let output = Command::new(&program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Playback(format!("Failed to spawn {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Playback(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
