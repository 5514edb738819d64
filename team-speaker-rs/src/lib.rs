//! team-speaker: coordinated text-to-speech for agent teams.
//!
//! Several agent processes share one teams directory. Exactly one of them
//! (the leader) owns audio playback; the others forward speech to it over a
//! Unix socket in the shared state directory.

pub mod config;
pub mod coordination;
pub mod error;
pub mod inbox;
pub mod mcp_server;
pub mod speaker;
pub mod voices;

pub use coordination::{Coordinator, Role, SpeechSink};
pub use error::{Error, Result};
pub use speaker::queue::{PlaybackQueue, QueueItem};
pub use voices::{Voice, VoiceRegistry};
