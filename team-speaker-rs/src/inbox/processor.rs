//! Turns one inbox message into at most one spoken queue item.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::markdown::strip_markdown;
use super::message::InboxMessage;
use crate::speaker::queue::QueueItem;
use crate::voices::VoiceRegistry;

/// Longest utterance produced from a plain message, ellipsis included.
pub const MAX_SPOKEN_CHARS: usize = 500;
const ELLIPSIS: &str = "...";
const FINGERPRINT_CAPACITY: usize = 100;
const UNKNOWN_SENDER: &str = "unknown";

/// Insertion-ordered set of recent message identities with FIFO eviction.
#[derive(Debug)]
pub struct FingerprintSet {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl FingerprintSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record `fingerprint`. Returns false if it was already present.
    pub fn insert(&mut self, fingerprint: String) -> bool {
        if self.seen.contains(&fingerprint) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(fingerprint.clone());
        self.order.push_back(fingerprint);
        true
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for FingerprintSet {
    fn default() -> Self {
        Self::new(FINGERPRINT_CAPACITY)
    }
}

/// Structured control message sent between agents as JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    IdleNotification,
    TaskAssignment {
        assigned_by: Option<String>,
        subject: Option<String>,
    },
    ShutdownRequest {
        reason: Option<String>,
    },
    ShutdownApproved,
    PlanApprovalRequest,
    Other(String),
}

impl ProtocolMessage {
    /// `None` unless `text` is a JSON object with a string `type`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(text).ok()?;
        let kind = value.get("type")?.as_str()?;
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Some(match kind {
            "idle_notification" => Self::IdleNotification,
            "task_assignment" => Self::TaskAssignment {
                assigned_by: field("assignedBy"),
                subject: field("subject"),
            },
            "shutdown_request" => Self::ShutdownRequest {
                reason: field("reason"),
            },
            "shutdown_approved" => Self::ShutdownApproved,
            "plan_approval_request" => Self::PlanApprovalRequest,
            other => Self::Other(other.to_string()),
        })
    }

    /// Spoken form, or `None` for messages that are never spoken.
    pub fn describe(&self, from: &str) -> Option<String> {
        match self {
            Self::IdleNotification => None,
            Self::TaskAssignment {
                assigned_by,
                subject,
            } => Some(format!(
                "{} assigned task: {}",
                assigned_by.as_deref().unwrap_or(from),
                subject.as_deref().unwrap_or("unknown")
            )),
            Self::ShutdownRequest { reason } => Some(format!(
                "{from} requests shutdown: {}",
                reason.as_deref().unwrap_or("work complete")
            )),
            Self::ShutdownApproved => Some(format!("{from} has shut down")),
            Self::PlanApprovalRequest => Some(format!("{from} submitted a plan for approval")),
            Self::Other(kind) => Some(format!("{from}: {}", kind.replace('_', " "))),
        }
    }
}

/// Cut `text` to `MAX_SPOKEN_CHARS` characters, ending in an ellipsis.
pub fn truncate_spoken(text: &str) -> String {
    if text.chars().count() <= MAX_SPOKEN_CHARS {
        return text.to_string();
    }
    let mut cut: String = text
        .chars()
        .take(MAX_SPOKEN_CHARS - ELLIPSIS.len())
        .collect();
    cut.push_str(ELLIPSIS);
    cut
}

/// Filters, deduplicates and formats inbox messages.
pub struct MessageProcessor {
    voices: Arc<VoiceRegistry>,
    seen: FingerprintSet,
}

impl MessageProcessor {
    pub fn new(voices: Arc<VoiceRegistry>) -> Self {
        Self {
            voices,
            seen: FingerprintSet::default(),
        }
    }

    pub fn process(&mut self, message: &InboxMessage) -> Option<QueueItem> {
        if message.text.trim().is_empty() {
            return None;
        }
        let protocol = ProtocolMessage::parse(&message.text);
        if protocol == Some(ProtocolMessage::IdleNotification) {
            return None;
        }

        let fingerprint = format!("{}\u{1f}{}\u{1f}{}", message.from, message.text, message.timestamp);
        if !self.seen.insert(fingerprint) {
            debug!("Skipping duplicate message from {}", message.from);
            return None;
        }

        let from = match message.from.trim() {
            "" => UNKNOWN_SENDER,
            name => name,
        };
        let text = match protocol {
            Some(protocol) => protocol.describe(from)?,
            None => {
                let source = message
                    .summary
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or(&message.text);
                let cleaned = strip_markdown(source);
                if cleaned.is_empty() {
                    debug!("Nothing speakable left in message from {from}");
                    return None;
                }
                truncate_spoken(&format!("{from} says: {cleaned}"))
            }
        };

        let voice = self.voices.voice_for(from);
        Some(QueueItem::new(text, voice.id, from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voices::available_voices;

    fn processor() -> MessageProcessor {
        MessageProcessor::new(Arc::new(VoiceRegistry::in_memory()))
    }

    fn spoken(processor: &mut MessageProcessor, from: &str, text: &str) -> Option<String> {
        processor
            .process(&InboxMessage::new(from, text, "t0"))
            .map(|item| item.text)
    }

    #[test]
    fn formats_shutdown_requests() {
        let mut p = processor();
        assert_eq!(
            spoken(&mut p, "agent-1", r#"{"type":"shutdown_request","reason":"all done"}"#).as_deref(),
            Some("agent-1 requests shutdown: all done")
        );
        assert_eq!(
            spoken(&mut p, "agent-1", r#"{"type":"shutdown_request"}"#).as_deref(),
            Some("agent-1 requests shutdown: work complete")
        );
    }

    #[test]
    fn formats_other_protocol_messages() {
        let mut p = processor();
        assert_eq!(
            spoken(&mut p, "lead", r#"{"type":"task_assignment","assignedBy":"boss","subject":"Fix login"}"#)
                .as_deref(),
            Some("boss assigned task: Fix login")
        );
        assert_eq!(
            spoken(&mut p, "lead", r#"{"type":"task_assignment"}"#).as_deref(),
            Some("lead assigned task: unknown")
        );
        assert_eq!(
            spoken(&mut p, "scout", r#"{"type":"shutdown_approved"}"#).as_deref(),
            Some("scout has shut down")
        );
        assert_eq!(
            spoken(&mut p, "scout", r#"{"type":"plan_approval_request","plan":"..."}"#).as_deref(),
            Some("scout submitted a plan for approval")
        );
        assert_eq!(
            spoken(&mut p, "scout", r#"{"type":"review_ready_now"}"#).as_deref(),
            Some("scout: review ready now")
        );
    }

    #[test]
    fn skips_idle_and_empty_messages() {
        let mut p = processor();
        assert_eq!(spoken(&mut p, "lead", r#"{"type":"idle_notification","from":"lead"}"#), None);
        assert_eq!(spoken(&mut p, "lead", "   \n"), None);
        assert_eq!(spoken(&mut p, "lead", "```\nonly code\n```"), None);
    }

    #[test]
    fn plain_message_prefers_summary_and_strips_markdown() {
        let mut p = processor();
        let message = InboxMessage::new("scout", "A **very** long report", "t1").with_summary("Report is **ready**");
        let item = p.process(&message).unwrap();
        assert_eq!(item.text, "scout says: Report is ready");
        assert_eq!(item.from, "scout");

        assert_eq!(spoken(&mut p, "", "hello").as_deref(), Some("unknown says: hello"));
        assert_eq!(spoken(&mut p, "lead", "{not json").as_deref(), Some("lead says: {not json"));
    }

    #[test]
    fn identical_triples_are_spoken_once() {
        let mut p = processor();
        let message = InboxMessage::new("lead", "broadcast", "t1");
        assert!(p.process(&message).is_some());
        assert!(p.process(&message).is_none());

        assert!(p.process(&InboxMessage::new("lead", "broadcast", "t2")).is_some());
        assert!(p.process(&InboxMessage::new("scout", "broadcast", "t1")).is_some());
        assert!(p.process(&InboxMessage::new("lead", "broadcast!", "t1")).is_some());
    }

    #[test]
    fn fingerprint_set_evicts_oldest() {
        let mut set = FingerprintSet::default();
        for n in 0..101 {
            assert!(set.insert(format!("fp{n}")));
        }
        assert_eq!(set.len(), 100);
        assert!(!set.contains("fp0"));
        assert!(set.contains("fp1"));
        assert!(set.insert("fp0".into()));
        assert!(!set.insert("fp100".into()));
        assert_eq!(set.len(), 100);
    }

    #[test]
    fn long_messages_truncate_to_exact_length() {
        let mut p = processor();
        let text = spoken(&mut p, "lead", &"word ".repeat(200)).unwrap();
        assert_eq!(text.chars().count(), MAX_SPOKEN_CHARS);
        assert!(text.ends_with("..."));
        assert!(text.starts_with("lead says: word"));

        let short = "é".repeat(MAX_SPOKEN_CHARS);
        assert_eq!(truncate_spoken(&short), short);
        let long = "é".repeat(MAX_SPOKEN_CHARS + 1);
        assert_eq!(truncate_spoken(&long).chars().count(), MAX_SPOKEN_CHARS);
    }

    #[test]
    fn items_carry_sticky_sender_voice() {
        let mut p = processor();
        let pool = available_voices();
        let first = p.process(&InboxMessage::new("lead", "one", "t1")).unwrap();
        let second = p.process(&InboxMessage::new("scout", "two", "t2")).unwrap();
        let again = p.process(&InboxMessage::new("lead", "three", "t3")).unwrap();
        assert_eq!(first.voice_id, pool[0].id);
        assert_eq!(second.voice_id, pool[1].id);
        assert_eq!(again.voice_id, first.voice_id);
    }
}
