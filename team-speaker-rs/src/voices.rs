//! Sticky agent → voice assignments.
//!
//! New agents get the next voice from a fixed pool (round-robin); manual
//! assignments override. The table and the global mute flag are persisted as
//! one JSON record in the state directory and rewritten after every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A named voice. `id` is what the synthesizer understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub name: String,
    pub id: String,
}

impl Voice {
    fn new(name: &str, id: &str) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

/// Kokoro voices handed out to agents, in assignment order.
pub const VOICE_POOL: &[(&str, &str)] = &[
    ("Heart", "af_heart"),
    ("Adam", "am_adam"),
    ("Emma", "bf_emma"),
    ("George", "bm_george"),
    ("Bella", "af_bella"),
    ("Michael", "am_michael"),
    ("Alice", "bf_alice"),
    ("Lewis", "bm_lewis"),
    ("Nova", "af_nova"),
    ("Echo", "am_echo"),
    ("Sarah", "af_sarah"),
    ("Lily", "bf_lily"),
];

pub fn available_voices() -> Vec<Voice> {
    VOICE_POOL.iter().map(|(name, id)| Voice::new(name, id)).collect()
}

/// Look up a pool voice by name (case-insensitive) or id (exact).
pub fn find_pool_voice(name_or_id: &str) -> Option<Voice> {
    VOICE_POOL
        .iter()
        .find(|(name, id)| name.eq_ignore_ascii_case(name_or_id) || *id == name_or_id)
        .map(|(name, id)| Voice::new(name, id))
}

/// Pool voice if known, otherwise a custom voice whose name and id are the input.
pub fn resolve_voice(name_or_id: &str) -> Voice {
    find_pool_voice(name_or_id).unwrap_or_else(|| Voice::new(name_or_id, name_or_id))
}

/// On-disk config record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct VoiceState {
    voice_assignments: BTreeMap<String, Voice>,
    next_voice_index: usize,
    muted: bool,
}

pub struct VoiceRegistry {
    path: Option<PathBuf>,
    state: Mutex<VoiceState>,
    muted: Arc<AtomicBool>,
}

impl VoiceRegistry {
    /// Registry that never touches disk.
    pub fn in_memory() -> Self {
        Self::from_state(None, VoiceState::default())
    }

    /// Load the record at `path`. Missing or corrupt records yield an empty table.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<VoiceState>(&contents) {
                Ok(state) => {
                    debug!(
                        "Loaded {} voice assignments from {}",
                        state.voice_assignments.len(),
                        path.display()
                    );
                    state
                }
                Err(e) => {
                    warn!("Ignoring corrupt voice record {}: {e}", path.display());
                    VoiceState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VoiceState::default(),
            Err(e) => {
                warn!("Failed to read voice record {}: {e}", path.display());
                VoiceState::default()
            }
        };
        Self::from_state(Some(path), state)
    }

    fn from_state(path: Option<PathBuf>, state: VoiceState) -> Self {
        let muted = Arc::new(AtomicBool::new(state.muted));
        Self {
            path,
            state: Mutex::new(state),
            muted,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Existing assignment for `agent`, or the next pool voice.
    pub fn assign(&self, agent: &str) -> Voice {
        let mut state = self.lock();
        if let Some(voice) = state.voice_assignments.get(agent) {
            return voice.clone();
        }

        let (name, id) = VOICE_POOL[state.next_voice_index % VOICE_POOL.len()];
        let voice = Voice::new(name, id);
        state.next_voice_index += 1;
        state
            .voice_assignments
            .insert(agent.to_string(), voice.clone());
        info!("Assigned voice {} ({}) to {agent}", voice.name, voice.id);
        self.persist(&mut state);
        voice
    }

    /// Bind `agent` to a pool voice (by name or id) or to a custom voice id.
    pub fn manual_assign(&self, agent: &str, name_or_id: &str) -> Voice {
        let voice = resolve_voice(name_or_id);
        let mut state = self.lock();
        state
            .voice_assignments
            .insert(agent.to_string(), voice.clone());
        info!("Voice for {agent} set to {} ({})", voice.name, voice.id);
        self.persist(&mut state);
        voice
    }

    pub fn voice_for(&self, agent: &str) -> Voice {
        self.assign(agent)
    }

    pub fn assignments(&self) -> Vec<(String, Voice)> {
        self.lock()
            .voice_assignments
            .iter()
            .map(|(agent, voice)| (agent.clone(), voice.clone()))
            .collect()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        let mut state = self.lock();
        state.muted = muted;
        self.muted.store(muted, Ordering::Relaxed);
        info!("Speech {}", if muted { "muted" } else { "unmuted" });
        self.persist(&mut state);
    }

    /// Shared mute flag, read by the playback queue on every enqueue.
    pub fn mute_flag(&self) -> Arc<AtomicBool> {
        self.muted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VoiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &mut VoiceState) {
        let Some(path) = &self.path else {
            return;
        };
        // The flag may have been flipped by a follower through the queue.
        state.muted = self.muted.load(Ordering::Relaxed);
        if let Err(e) = write_record(path, state) {
            warn!("Failed to write voice record {}: {e}", path.display());
        }
    }
}

fn write_record(path: &Path, state: &VoiceState) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(state)?)?;
    Ok(())
}
