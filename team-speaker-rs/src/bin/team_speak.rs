//! team-speak: one-shot client that hands a single utterance to the running
//! team-speaker leader.
//!
//! Text comes from the arguments, or stdin when none are given. This binary
//! never takes leadership: with no live leader it exits non-zero.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use team_speaker::config::Config;
use team_speaker::coordination::forward;
use team_speaker::voices::resolve_voice;
use team_speaker::{QueueItem, VoiceRegistry};
use tokio::net::UnixStream;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Parser, Debug)]
#[command(name = "team-speak", about = "Speak text through the team-speaker leader")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sender name; picks the sender's assigned voice
    #[arg(short, long, default_value = "user")]
    from: String,

    /// Voice name or id, overriding the sender's voice
    #[arg(long)]
    voice: Option<String>,

    /// Speak even while speech is muted
    #[arg(long)]
    bypass_mute: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Text to speak (read from stdin when omitted)
    text: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let text = if args.text.is_empty() {
        let mut input = String::new();
        if let Err(e) = std::io::stdin().read_to_string(&mut input) {
            error!("Failed to read stdin: {e}");
            return ExitCode::FAILURE;
        }
        input
    } else {
        args.text.join(" ")
    };
    let text = text.trim();
    if text.is_empty() {
        error!("Nothing to speak");
        return ExitCode::from(2);
    }

    let config = Config::load(args.config.as_deref());
    let voices = VoiceRegistry::load(config.paths.state_file());
    if voices.is_muted() && !args.bypass_mute {
        info!("Speech is muted, not sending");
        return ExitCode::SUCCESS;
    }

    let voice = match &args.voice {
        Some(voice) => resolve_voice(voice),
        None => voices.voice_for(&args.from),
    };
    let mut item = QueueItem::new(text, voice.id, args.from.as_str());
    item.bypass_mute = args.bypass_mute;

    // Quick connectivity check: exit if no leader is listening
    let socket = config.paths.socket_path();
    let mut stream = match tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&socket)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!("No team-speaker leader at {}: {e}", socket.display());
            return ExitCode::FAILURE;
        }
        Err(_) => {
            error!("Timed out connecting to {}", socket.display());
            return ExitCode::FAILURE;
        }
    };

    match forward(&mut stream, &item).await {
        Ok(()) => {
            debug!("Sent {} chars as {} in voice {}", text.chars().count(), item.from, item.voice_id);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to send speech: {e}");
            ExitCode::FAILURE
        }
    }
}
