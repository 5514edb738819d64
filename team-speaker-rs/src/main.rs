//! team-speaker-rs: coordinated text-to-speech service for agent teams.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use team_speaker::config::Config;
use team_speaker::inbox::{InboxWatcher, MessageProcessor};
use team_speaker::mcp_server::{self, TeamSpeakerMcp};
use team_speaker::speaker::player;
use team_speaker::speaker::tts::{KokoroEngine, KokoroSynthesizer};
use team_speaker::{Coordinator, PlaybackQueue, SpeechSink, VoiceRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "team-speaker-rs", about = "Coordinated text-to-speech for agent teams")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not serve MCP on stdio; run until Ctrl-C
    #[arg(long)]
    no_mcp: bool,

    /// Do not watch team inboxes
    #[arg(long)]
    no_watch: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Stdout carries MCP traffic, so logs go to stderr (suppress noisy ort/rmcp internals)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug,ort=info,rmcp=info")
        } else {
            EnvFilter::new("info,ort=warn,rmcp=warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("team-speaker-rs starting");

    let config = Config::load(args.config.as_deref());
    let state_dir = config.paths.state_dir();
    std::fs::create_dir_all(&state_dir).map_err(|e| {
        error!("Cannot create state directory {}: {e}", state_dir.display());
        e
    })?;

    let voices = Arc::new(VoiceRegistry::load(config.paths.state_file()));

    // Kokoro loads on first synthesis, so followers never pay for the model
    let engine = Arc::new(KokoroEngine::new(&config.tts));
    let synthesizer = Arc::new(KokoroSynthesizer::new(engine));
    let player = player::from_config(&config.playback)?;
    let queue = PlaybackQueue::new(synthesizer, player, voices.mute_flag());

    let coordinator = Coordinator::start(config.paths.socket_path(), config.paths.lock_path(), queue).await;
    info!("Role: {}", coordinator.role().await);

    let cancel = CancellationToken::new();
    let watcher = if config.watcher.enabled && !args.no_watch {
        let sink: Arc<dyn SpeechSink> = coordinator.clone();
        let watcher = InboxWatcher::new(
            config.paths.teams_dir(),
            config.watcher.clone(),
            MessageProcessor::new(voices.clone()),
            sink,
        );
        let roles = coordinator.roles();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = watcher.run_while_leading(roles, cancel).await {
                error!("Inbox watcher failed: {e}");
            }
        }))
    } else {
        info!("Inbox watching disabled");
        None
    };

    if config.mcp.enabled && !args.no_mcp {
        let server = TeamSpeakerMcp::new(coordinator.clone(), voices.clone(), config.tts.voice.clone());
        tokio::select! {
            result = mcp_server::serve_stdio(server) => {
                if let Err(e) = result {
                    warn!("{e}");
                }
            }
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    } else {
        info!("Running without MCP, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down");
    cancel.cancel();
    if let Some(watcher) = watcher {
        if let Err(e) = watcher.await {
            warn!("Inbox watcher task ended abnormally: {e}");
        }
    }
    coordinator.shutdown().await;

    Ok(())
}
