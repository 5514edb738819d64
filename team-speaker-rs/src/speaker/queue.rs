//! Sequential playback queue.
//!
//! At most one item is synthesized/played at a time. When a burst arrives the
//! backlog is trimmed to the freshest items instead of growing without bound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Player, Synthesizer};
use crate::error::Result;

/// Backlog size that triggers a trim.
const MAX_BACKLOG: usize = 10;
/// Items kept by a trim (the most recent ones).
const TRIM_TO: usize = 5;

/// One utterance. Also the wire format on the rendezvous socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub text: String,
    pub voice_id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub bypass_mute: bool,
}

impl QueueItem {
    pub fn new(text: impl Into<String>, voice_id: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice_id: voice_id.into(),
            from: from.into(),
            bypass_mute: false,
        }
    }

    pub fn bypassing_mute(mut self) -> Self {
        self.bypass_mute = true;
        self
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueItem>,
    playing: bool,
}

pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    muted: Arc<AtomicBool>,
    synthesizer: Arc<dyn Synthesizer>,
    player: Arc<dyn Player>,
}

impl PlaybackQueue {
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        player: Arc<dyn Player>,
        muted: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            muted,
            synthesizer,
            player,
        })
    }

    /// Queue an item and start draining if idle. Returns false if the item
    /// was dropped because speech is muted.
    pub fn enqueue(self: &Arc<Self>, item: QueueItem) -> bool {
        if self.muted.load(Ordering::Relaxed) && !item.bypass_mute {
            debug!("Muted, dropping speech from {}", item.from);
            return false;
        }

        let start_drain = {
            let mut state = self.lock();
            if state.pending.len() + 1 >= MAX_BACKLOG {
                let excess = state.pending.len().saturating_sub(TRIM_TO);
                state.pending = state.pending.split_off(excess);
                info!("Speech backlog trimmed, dropped {excess} stale items");
            }
            state.pending.push_back(item);

            if state.playing {
                false
            } else {
                state.playing = true;
                true
            }
        };

        if start_drain {
            let queue = self.clone();
            tokio::spawn(async move { queue.drain().await });
        }
        true
    }

    /// Items waiting behind the one currently playing.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        if self.muted.swap(muted, Ordering::Relaxed) != muted {
            info!("Playback {}", if muted { "muted" } else { "unmuted" });
        }
    }

    async fn drain(&self) {
        loop {
            let next = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(item) => item,
                    None => {
                        state.playing = false;
                        return;
                    }
                }
            };

            let t0 = Instant::now();
            match self.speak(&next).await {
                Ok(()) => debug!(
                    "Spoke {} chars from {} in {}ms",
                    next.text.len(),
                    next.from,
                    t0.elapsed().as_millis()
                ),
                Err(e) => warn!("Speech from {} failed: {e}", next.from),
            }
        }
    }

    async fn speak(&self, item: &QueueItem) -> Result<()> {
        let audio = tempfile::Builder::new()
            .prefix("team-speaker-")
            .suffix(".wav")
            .tempfile()?
            .into_temp_path();

        let result = async {
            self.synthesizer
                .synthesize(&item.text, &item.voice_id, &audio)
                .await?;
            self.player.play(&audio).await
        }
        .await;

        // Best-effort cleanup
        if let Err(e) = audio.close() {
            debug!("Failed to remove temporary audio file: {e}");
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Records every synthesis call; optionally blocks each call on a permit.
    #[derive(Default)]
    pub(crate) struct RecordingSynth {
        pub calls: Mutex<Vec<QueueItem>>,
        pub gate: Option<Semaphore>,
        pub fail_on: Option<String>,
    }

    impl RecordingSynth {
        pub fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Default::default()
            }
        }

        pub fn texts(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.text.clone()).collect()
        }

        pub fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn release(&self, n: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(n);
            }
        }
    }

    #[async_trait::async_trait]
    impl Synthesizer for RecordingSynth {
        async fn synthesize(&self, text: &str, voice_id: &str, output: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(QueueItem::new(text, voice_id, ""));
            if let Some(gate) = &self.gate {
                gate.acquire().await.map_err(|e| Error::Tts(e.to_string()))?.forget();
            }
            if self.fail_on.as_deref() == Some(text) {
                return Err(Error::Tts("synthetic failure".into()));
            }
            std::fs::write(output, b"RIFF")?;
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingPlayer {
        pub played: Mutex<Vec<PathBuf>>,
    }

    #[async_trait::async_trait]
    impl Player for RecordingPlayer {
        async fn play(&self, path: &Path) -> Result<()> {
            assert!(path.exists(), "audio file should exist while playing");
            self.played.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    pub(crate) fn queue_with(synth: Arc<RecordingSynth>, muted: bool) -> Arc<PlaybackQueue> {
        PlaybackQueue::new(
            synth,
            Arc::new(RecordingPlayer::default()),
            Arc::new(AtomicBool::new(muted)),
        )
    }

    pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn plays_in_arrival_order() {
        let synth = Arc::new(RecordingSynth::default());
        let queue = queue_with(synth.clone(), false);

        for n in 1..=4 {
            assert!(queue.enqueue(QueueItem::new(format!("item {n}"), "af_heart", "lead")));
        }
        wait_until(|| !queue.is_playing()).await;

        assert_eq!(synth.texts(), vec!["item 1", "item 2", "item 3", "item 4"]);
    }

    #[tokio::test]
    async fn burst_is_trimmed_to_freshest_items() {
        let synth = Arc::new(RecordingSynth::gated());
        let queue = queue_with(synth.clone(), false);

        queue.enqueue(QueueItem::new("item 1", "af_heart", "lead"));
        wait_until(|| synth.count() == 1).await;

        for n in 2..=11 {
            queue.enqueue(QueueItem::new(format!("item {n}"), "af_heart", "lead"));
        }
        assert_eq!(queue.len(), 6);

        synth.release(100);
        wait_until(|| !queue.is_playing()).await;
        assert_eq!(
            synth.texts(),
            vec!["item 1", "item 6", "item 7", "item 8", "item 9", "item 10", "item 11"]
        );
    }

    #[tokio::test]
    async fn muted_queue_drops_unless_bypassed() {
        let synth = Arc::new(RecordingSynth::default());
        let queue = queue_with(synth.clone(), true);

        assert!(!queue.enqueue(QueueItem::new("quiet", "af_heart", "lead")));
        assert!(queue.enqueue(QueueItem::new("urgent", "af_heart", "lead").bypassing_mute()));
        wait_until(|| !queue.is_playing()).await;

        assert_eq!(synth.texts(), vec!["urgent"]);

        queue.set_muted(false);
        assert!(queue.enqueue(QueueItem::new("normal", "af_heart", "lead")));
        wait_until(|| synth.count() == 2).await;
    }

    #[tokio::test]
    async fn failed_item_does_not_stall_queue() {
        let synth = Arc::new(RecordingSynth {
            fail_on: Some("bad".into()),
            ..Default::default()
        });
        let player = Arc::new(RecordingPlayer::default());
        let queue = PlaybackQueue::new(synth.clone(), player.clone(), Arc::new(AtomicBool::new(false)));

        queue.enqueue(QueueItem::new("good", "af_heart", "a"));
        queue.enqueue(QueueItem::new("bad", "af_heart", "a"));
        queue.enqueue(QueueItem::new("after", "af_heart", "a"));
        wait_until(|| !queue.is_playing()).await;

        assert_eq!(synth.texts(), vec!["good", "bad", "after"]);
        let played = player.played.lock().unwrap();
        assert_eq!(played.len(), 2);
        assert!(played.iter().all(|p| !p.exists()), "temporary files are removed");
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let item = QueueItem::new("hi", "am_adam", "scout").bypassing_mute();
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["voiceId"], "am_adam");
        assert_eq!(json["bypassMute"], true);

        let parsed: QueueItem = serde_json::from_str(r#"{"text":"x","voiceId":"af_heart"}"#).unwrap();
        assert!(!parsed.bypass_mute);
        assert_eq!(parsed.from, "");
    }
}
