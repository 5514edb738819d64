//! Native Kokoro synthesis into WAV files.
//!
//! Each utterance is cut into sentences; every sentence is phonemized with
//! misaki-rs, mapped through the tokenizer vocabulary and run through the
//! ONNX model together with the voice's style row. The 24kHz outputs are
//! joined with a short silence and written as 16-bit PCM.
//!
//! Model files load on first use, so a follower process never reads them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info, warn};

use super::Synthesizer;
use crate::config::{expand_home, TTSConfig};
use crate::error::{Error, Result};

const SAMPLE_RATE: u32 = 24000;
/// Rows in a voice style table; also the longest token sequence accepted.
const MAX_TOKENS: usize = 510;
const STYLE_DIM: usize = 256;
const SENTENCE_GAP_SAMPLES: usize = (SAMPLE_RATE as usize) / 8;

/// Style rows for one voice, indexed by token count.
type StyleTable = Array2<f32>;

struct LoadedModel {
    session: Session,
    phonemizer: misaki_rs::G2P,
    vocab: HashMap<char, i64>,
    styles: HashMap<String, StyleTable>,
}

pub struct KokoroEngine {
    model: Mutex<Option<LoadedModel>>,
    default_voice: String,
    speed: f32,
    model_path: PathBuf,
    voices_path: PathBuf,
    tokenizer_path: PathBuf,
}

impl KokoroEngine {
    pub fn new(config: &TTSConfig) -> Self {
        let base_dir = std::env::current_dir().unwrap_or_default();
        let resolve = |configured: &str, fallback: &str| {
            if configured.is_empty() {
                base_dir.join(fallback)
            } else {
                expand_home(configured)
            }
        };

        Self {
            model: Mutex::new(None),
            default_voice: config.voice.clone(),
            speed: config.speed,
            model_path: resolve(&config.model_path, "kokoro-v1.0.onnx"),
            voices_path: resolve(&config.voices_path, "voices-v1.0.bin"),
            tokenizer_path: resolve(&config.tokenizer_path, "tokenizer.json"),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().is_some()
    }

    /// Synthesize `text` and write it to `output` as WAV. Blocking.
    pub fn render_to_file(&self, text: &str, voice_id: &str, output: &Path) -> Result<()> {
        let samples = self.render(text, voice_id)?;
        if samples.is_empty() {
            return Err(Error::Tts("no audio generated".into()));
        }
        write_wav(output, &samples)
    }

    /// Synthesize `text` to 24kHz mono samples. Blocking.
    pub fn render(&self, text: &str, voice_id: &str) -> Result<Vec<f32>> {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        let Some(model) = guard.as_mut() else {
            return Err(Error::Tts("model not loaded".into()));
        };

        let voice_name = if model.styles.contains_key(voice_id) {
            voice_id
        } else {
            warn!("Unknown voice {voice_id}, using {}", self.default_voice);
            self.default_voice.as_str()
        };

        let started = Instant::now();
        let mut samples = Vec::new();
        for sentence in split_sentences(text) {
            let chunk = infer_sentence(model, sentence, voice_name, self.speed)?;
            if chunk.is_empty() {
                continue;
            }
            if !samples.is_empty() {
                samples.extend(std::iter::repeat_n(0.0, SENTENCE_GAP_SAMPLES));
            }
            samples.extend(chunk);
        }
        debug!(
            "Rendered {} samples in voice {voice_name} in {}ms",
            samples.len(),
            started.elapsed().as_millis()
        );
        Ok(samples)
    }

    fn load(&self) -> Result<LoadedModel> {
        let started = Instant::now();
        let vocab = load_tokenizer(&self.tokenizer_path)?;
        let styles = load_voice_styles(&self.voices_path)?;
        debug!("{} tokens, {} voices", vocab.len(), styles.len());

        info!("Loading Kokoro model from {}", self.model_path.display());
        let session = Session::builder()
            .map_err(|e| Error::Tts(format!("Failed to create ONNX session builder: {e}")))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| Error::Tts(format!("Failed to set optimization level: {e}")))?
            .with_intra_threads(4)
            .map_err(|e| Error::Tts(format!("Failed to set thread count: {e}")))?
            .commit_from_file(&self.model_path)
            .map_err(|e| Error::Tts(format!("Failed to load ONNX model: {e}")))?;

        let phonemizer = misaki_rs::G2P::new(misaki_rs::Language::EnglishUS);

        info!("Kokoro ready in {}ms", started.elapsed().as_millis());
        Ok(LoadedModel {
            session,
            phonemizer,
            vocab,
            styles,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<LoadedModel>> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `Synthesizer` backed by a shared Kokoro engine; inference runs on the
/// blocking pool so the event loop stays responsive.
#[derive(Clone)]
pub struct KokoroSynthesizer {
    engine: Arc<KokoroEngine>,
}

impl KokoroSynthesizer {
    pub fn new(engine: Arc<KokoroEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Synthesizer for KokoroSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str, output: &Path) -> Result<()> {
        let engine = self.engine.clone();
        let text = text.to_string();
        let voice_id = voice_id.to_string();
        let output = output.to_path_buf();

        tokio::task::spawn_blocking(move || engine.render_to_file(&text, &voice_id, &output))
            .await
            .map_err(|e| Error::Tts(format!("synthesis task failed: {e}")))?
    }
}

fn infer_sentence(model: &mut LoadedModel, sentence: &str, voice: &str, speed: f32) -> Result<Vec<f32>> {
    let (phonemes, _) = model
        .phonemizer
        .g2p(sentence)
        .map_err(|e| Error::Tts(format!("Phonemization failed: {e}")))?;
    if phonemes.is_empty() {
        return Ok(Vec::new());
    }

    // Pad id 0 on both ends; unknown phoneme characters are dropped.
    let mut ids: Vec<i64> = std::iter::once(0)
        .chain(phonemes.chars().filter_map(|ch| model.vocab.get(&ch).copied()))
        .chain(std::iter::once(0))
        .collect();
    ids.truncate(MAX_TOKENS);
    let n_tokens = ids.len();

    let table = model
        .styles
        .get(voice)
        .ok_or_else(|| Error::Tts(format!("Voice not found: {voice}")))?;
    let row = n_tokens.saturating_sub(2).min(table.nrows().saturating_sub(1));
    let style = table.row(row).to_owned().into_shape_with_order((1, STYLE_DIM)).map_err(tensor_err)?;
    let tokens = Array2::from_shape_vec((1, n_tokens), ids).map_err(tensor_err)?;
    let speed = ndarray::Array1::from_vec(vec![speed]);

    let outputs = model
        .session
        .run(ort::inputs![
            "tokens" => Tensor::from_array(tokens).map_err(tensor_err)?,
            "style" => Tensor::from_array(style).map_err(tensor_err)?,
            "speed" => Tensor::from_array(speed).map_err(tensor_err)?
        ])
        .map_err(|e| Error::Tts(format!("Kokoro inference failed: {e}")))?;

    let (_, audio) = outputs
        .iter()
        .next()
        .ok_or_else(|| Error::Tts("Kokoro returned no output".into()))?;
    let (_shape, samples) = audio
        .try_extract_tensor::<f32>()
        .map_err(|e| Error::Tts(format!("Unexpected Kokoro output: {e}")))?;
    Ok(samples.to_vec())
}

fn tensor_err(e: impl std::fmt::Display) -> Error {
    Error::Tts(format!("Failed to build model input: {e}"))
}

/// Write f32 samples as 16-bit mono WAV.
fn write_wav(path: &Path, samples: &[f32]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let wav_err = |e: hound::Error| Error::Tts(format!("Failed to write WAV: {e}"));
    let mut writer = hound::WavWriter::create(path, spec).map_err(wav_err)?;
    for &sample in samples {
        // f32 [-1, 1] → i16
        let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer.write_sample(s).map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)
}

/// Character → id map from the `model.vocab` object of tokenizer.json.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::Tts(format!("Failed to read tokenizer {}: {e}", path.display())))?;
    let data: serde_json::Value = serde_json::from_str(&contents)?;
    let entries = data
        .pointer("/model/vocab")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| Error::Tts(format!("{} has no model.vocab", path.display())))?;

    entries
        .iter()
        .filter_map(|(token, id)| token.chars().next().map(|ch| (ch, token, id)))
        .map(|(ch, token, id)| {
            id.as_i64()
                .map(|id| (ch, id))
                .ok_or_else(|| Error::Tts(format!("Token id for {token:?} is not an integer")))
        })
        .collect()
}

/// Voice style tables from the NPZ archive, each `(510, 1, 256)` squeezed
/// to `(510, 256)`.
fn load_voice_styles(path: &Path) -> Result<HashMap<String, StyleTable>> {
    let npz_err = |e: ndarray_npy::ReadNpzError| Error::Tts(format!("Bad voices archive {}: {e}", path.display()));
    let file = fs::File::open(path)
        .map_err(|e| Error::Tts(format!("Failed to open voices {}: {e}", path.display())))?;
    let mut npz = NpzReader::new(file).map_err(npz_err)?;

    let mut styles = HashMap::new();
    for entry in npz.names().map_err(npz_err)? {
        let raw: Array3<f32> = npz.by_name(&entry).map_err(npz_err)?;
        let (rows, _, dim) = raw.dim();
        let table = raw
            .into_shape_with_order((rows, dim))
            .map_err(|e| Error::Tts(format!("Voice {entry} has an unexpected shape: {e}")))?;
        styles.insert(entry.trim_end_matches(".npy").to_string(), table);
    }
    Ok(styles)
}

/// Sentences ending in `.`, `!` or `?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut rest = text.trim();
    while let Some(end) = rest
        .char_indices()
        .zip(rest.chars().skip(1))
        .find(|((_, c), next)| matches!(c, '.' | '!' | '?') && next.is_whitespace())
        .map(|((i, _), _)| i + 1)
    {
        sentences.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}
