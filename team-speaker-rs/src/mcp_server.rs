//! MCP server exposing speech controls to the calling agent over stdio.
//!
//! Tools:
//! - speak: queue text through the coordinator (leader plays it)
//! - speaker_status: role, mute state, queue length and voice table
//! - assign_voice: bind an agent to a voice
//! - set_muted: toggle the persisted global mute

use std::future::Future;
use std::sync::Arc;

use rmcp::handler::server::tool::{Parameters, ToolRouter};
use rmcp::model::{CallToolResult, Content, ServerCapabilities, ServerInfo};
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::coordination::Coordinator;
use crate::error::Error;
use crate::speaker::queue::QueueItem;
use crate::voices::{available_voices, resolve_voice, VoiceRegistry};

/// Sender recorded on speech that arrives through the tool surface.
const TOOL_SENDER: &str = "assistant";

// --- Tool parameter structs ---

#[derive(Debug, Deserialize, rmcp::schemars::JsonSchema)]
pub struct SpeakRequest {
    #[schemars(description = "The text to speak aloud")]
    pub text: String,
    #[schemars(description = "Voice name or id (e.g. 'Emma', 'bf_emma'). Defaults to the configured voice")]
    pub voice: Option<String>,
    #[schemars(description = "Speak even while speech is muted")]
    pub bypass_mute: Option<bool>,
}

#[derive(Debug, Deserialize, rmcp::schemars::JsonSchema)]
pub struct AssignVoiceRequest {
    #[schemars(description = "Agent name as it appears in inbox messages")]
    pub agent: String,
    #[schemars(description = "Pool voice name (case-insensitive), pool id, or any custom voice id")]
    pub voice: String,
}

#[derive(Debug, Deserialize, rmcp::schemars::JsonSchema)]
pub struct SetMutedRequest {
    #[schemars(description = "true to mute all speech, false to unmute")]
    pub muted: bool,
}

// --- MCP Server handler ---

#[derive(Clone)]
pub struct TeamSpeakerMcp {
    coordinator: Arc<Coordinator>,
    voices: Arc<VoiceRegistry>,
    default_voice: String,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl TeamSpeakerMcp {
    pub fn new(
        coordinator: Arc<Coordinator>,
        voices: Arc<VoiceRegistry>,
        default_voice: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            voices,
            default_voice: default_voice.into(),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Speak text aloud. Only one process on this machine plays audio; others forward to it.\n\nArgs:\n    text: The text to speak\n    voice: Optional voice name or id\n    bypass_mute: Speak even when muted")]
    async fn speak(
        &self,
        Parameters(req): Parameters<SpeakRequest>,
    ) -> Result<CallToolResult, McpError> {
        let text = req.text.trim();
        if text.is_empty() {
            return Ok(CallToolResult::error(vec![Content::text("Nothing to speak: text is empty")]));
        }

        let voice = resolve_voice(req.voice.as_deref().unwrap_or(&self.default_voice));
        let bypass_mute = req.bypass_mute.unwrap_or(false);
        let mut item = QueueItem::new(text, voice.id.clone(), TOOL_SENDER);
        item.bypass_mute = bypass_mute;
        // The leader's mute state decides; ours is only a hint for the reply.
        self.coordinator.enqueue(item).await;
        if self.voices.is_muted() && !bypass_mute {
            return Ok(CallToolResult::success(vec![Content::text(
                "Speech is muted; nothing will play. Pass bypass_mute to speak anyway.",
            )]));
        }

        Ok(CallToolResult::success(vec![Content::text(format!(
            "Queued {} characters in voice {} ({})",
            text.chars().count(),
            voice.name,
            voice.id
        ))]))
    }

    #[tool(description = "Get speaker status: role, mute state, queue length, voice assignments and available voices (JSON).")]
    async fn speaker_status(&self) -> Result<CallToolResult, McpError> {
        let status = self.status().await;
        let text = serde_json::to_string_pretty(&status)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    #[tool(description = "Assign a voice to an agent. Overrides any automatic assignment.\n\nArgs:\n    agent: Agent name\n    voice: Voice name or id")]
    async fn assign_voice(
        &self,
        Parameters(req): Parameters<AssignVoiceRequest>,
    ) -> Result<CallToolResult, McpError> {
        let agent = req.agent.trim();
        let voice = req.voice.trim();
        if agent.is_empty() || voice.is_empty() {
            return Ok(CallToolResult::error(vec![Content::text("Both agent and voice are required")]));
        }

        let voice = self.voices.manual_assign(agent, voice);
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Voice for {agent} set to {} ({})",
            voice.name, voice.id
        ))]))
    }

    #[tool(description = "Mute or unmute all speech. Persists across restarts.\n\nArgs:\n    muted: true to mute, false to unmute")]
    async fn set_muted(
        &self,
        Parameters(req): Parameters<SetMutedRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.voices.set_muted(req.muted);
        self.coordinator.set_muted(req.muted).await;
        let state = if req.muted { "muted" } else { "unmuted" };
        Ok(CallToolResult::success(vec![Content::text(format!("Speech {state}"))]))
    }
}

impl TeamSpeakerMcp {
    async fn status(&self) -> Value {
        let assignments: Vec<Value> = self
            .voices
            .assignments()
            .into_iter()
            .map(|(agent, voice)| json!({ "agent": agent, "voice": voice.name, "id": voice.id }))
            .collect();

        json!({
            "role": self.coordinator.role().await,
            "muted": self.voices.is_muted(),
            "queueLength": self.coordinator.queue().len(),
            "assignments": assignments,
            "availableVoices": available_voices(),
        })
    }
}

#[tool_handler]
impl ServerHandler for TeamSpeakerMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("Team speaker: coordinated text-to-speech shared by every agent on this machine. Use speak to talk, speaker_status to inspect, assign_voice and set_muted to control.".into()),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}

/// Serve on stdin/stdout until the client disconnects.
pub async fn serve_stdio(server: TeamSpeakerMcp) -> crate::Result<()> {
    let service = server
        .serve(stdio())
        .await
        .map_err(|e| Error::Mcp(format!("failed to start MCP server: {e}")))?;
    info!("MCP server ready on stdio");

    let reason = service
        .waiting()
        .await
        .map_err(|e| Error::Mcp(format!("MCP server task failed: {e}")))?;
    info!("MCP client disconnected ({reason:?})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speaker::queue::tests::{wait_until, RecordingPlayer, RecordingSynth};
    use crate::speaker::queue::PlaybackQueue;
    use tempfile::TempDir;

    struct Harness {
        mcp: TeamSpeakerMcp,
        voices: Arc<VoiceRegistry>,
        synth: Arc<RecordingSynth>,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let voices = Arc::new(VoiceRegistry::load(dir.path().join("state.json")));
        let synth = Arc::new(RecordingSynth::default());
        let queue = PlaybackQueue::new(synth.clone(), Arc::new(RecordingPlayer::default()), voices.mute_flag());
        let coordinator = Coordinator::start(
            dir.path().join("speaker.sock"),
            dir.path().join("speaker.sock.lock"),
            queue,
        )
        .await;
        Harness {
            mcp: TeamSpeakerMcp::new(coordinator, voices.clone(), "af_heart"),
            voices,
            synth,
            _dir: dir,
        }
    }

    fn speak_req(text: &str, voice: Option<&str>, bypass_mute: bool) -> Parameters<SpeakRequest> {
        Parameters(SpeakRequest {
            text: text.into(),
            voice: voice.map(str::to_string),
            bypass_mute: Some(bypass_mute),
        })
    }

    #[tokio::test]
    async fn speak_queues_with_resolved_voice() {
        let h = harness().await;
        let result = h.mcp.speak(speak_req("hello there", Some("emma"), false)).await.unwrap();
        assert_ne!(result.is_error, Some(true));
        h.mcp.speak(speak_req("default voice", None, false)).await.unwrap();

        wait_until(|| h.synth.count() == 2).await;
        let calls = h.synth.calls.lock().unwrap().clone();
        assert_eq!(calls[0].voice_id, "bf_emma");
        assert_eq!(calls[1].voice_id, "af_heart");
    }

    #[tokio::test]
    async fn empty_text_is_an_error_result() {
        let h = harness().await;
        let result = h.mcp.speak(speak_req("  ", None, false)).await.unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(h.synth.count(), 0);
    }

    #[tokio::test]
    async fn mute_is_persisted_and_respected() {
        let h = harness().await;
        h.mcp.set_muted(Parameters(SetMutedRequest { muted: true })).await.unwrap();
        assert!(h.voices.is_muted());

        h.mcp.speak(speak_req("quiet", None, false)).await.unwrap();
        h.mcp.speak(speak_req("loud", None, true)).await.unwrap();
        wait_until(|| h.synth.count() == 1).await;
        assert_eq!(h.synth.texts(), vec!["loud"]);

        let reloaded = VoiceRegistry::load(h.voices.path().unwrap());
        assert!(reloaded.is_muted());
    }

    #[tokio::test]
    async fn mute_from_follower_session_silences_leader() {
        let h = harness().await;
        let follower_voices = Arc::new(VoiceRegistry::load(h.voices.path().unwrap()));
        let follower_queue = PlaybackQueue::new(
            Arc::new(RecordingSynth::default()),
            Arc::new(RecordingPlayer::default()),
            follower_voices.mute_flag(),
        );
        let dir = h.voices.path().unwrap().parent().unwrap().to_path_buf();
        let coordinator = Coordinator::start(
            dir.join("speaker.sock"),
            dir.join("speaker.sock.lock"),
            follower_queue,
        )
        .await;
        let follower = TeamSpeakerMcp::new(coordinator, follower_voices, "af_heart");

        follower.set_muted(Parameters(SetMutedRequest { muted: true })).await.unwrap();
        wait_until(|| h.voices.is_muted()).await;

        h.mcp.speak(speak_req("quiet", None, false)).await.unwrap();
        follower.speak(speak_req("loud", None, true)).await.unwrap();
        wait_until(|| h.synth.count() == 1).await;
        assert_eq!(h.synth.texts(), vec!["loud"]);
    }

    #[tokio::test]
    async fn assign_voice_overrides_and_shows_in_status() {
        let h = harness().await;
        h.mcp
            .assign_voice(Parameters(AssignVoiceRequest {
                agent: "scout".into(),
                voice: "George".into(),
            }))
            .await
            .unwrap();
        assert_eq!(h.voices.voice_for("scout").id, "bm_george");

        let status = h.mcp.status().await;
        assert_eq!(status["role"], "leader");
        assert_eq!(status["muted"], false);
        assert_eq!(status["queueLength"], 0);
        assert_eq!(status["assignments"][0]["agent"], "scout");
        assert_eq!(status["assignments"][0]["id"], "bm_george");
        assert_eq!(status["availableVoices"].as_array().unwrap().len(), available_voices().len());
    }

    #[tokio::test]
    async fn assign_voice_requires_both_fields() {
        let h = harness().await;
        let result = h
            .mcp
            .assign_voice(Parameters(AssignVoiceRequest {
                agent: " ".into(),
                voice: "Emma".into(),
            }))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert!(h.voices.assignments().is_empty());
    }
}
