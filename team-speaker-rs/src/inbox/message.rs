//! On-disk formats written by the agents: inbox files and team descriptors.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::Result;

pub const TEAM_CONFIG_FILE: &str = "config.json";
pub const INBOX_DIR: &str = "inboxes";

/// One entry of an inbox file.
///
/// Fields are read leniently: missing values become empty and non-string
/// scalars (numeric timestamps, for instance) are kept in their JSON form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InboxMessage {
    #[serde(default, deserialize_with = "lenient_string")]
    pub from: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub text: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: String,
    #[serde(default)]
    pub summary: Option<String>,
}

impl InboxMessage {
    pub fn new(from: impl Into<String>, text: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            text: text.into(),
            timestamp: timestamp.into(),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub agent_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TeamConfig {
    #[serde(default)]
    pub members: Vec<TeamMember>,
}

/// Parse an inbox file. Entries that are not message objects still count
/// towards the length (they are read as empty messages) so cursors stay
/// aligned with the array. Blank content is an empty inbox.
pub fn parse_inbox(content: &str) -> Result<Vec<InboxMessage>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<Value> = serde_json::from_str(content)?;
    Ok(entries
        .into_iter()
        .map(|entry| serde_json::from_value(entry).unwrap_or_default())
        .collect())
}

pub fn parse_team_config(content: &str) -> Result<TeamConfig> {
    Ok(serde_json::from_str(content)?)
}

pub fn team_config_path(team_dir: &Path) -> PathBuf {
    team_dir.join(TEAM_CONFIG_FILE)
}

/// Member names become file names under `inboxes/`, so anything that could
/// point outside that directory is refused.
pub fn is_valid_member_name(name: &str) -> bool {
    !name.is_empty() && name != "." && !name.contains("..") && !name.contains(['/', '\\', '\0'])
}

pub fn inbox_path(team_dir: &Path, member: &str) -> PathBuf {
    team_dir.join(INBOX_DIR).join(format!("{member}.json"))
}

/// True for `<anything>/inboxes/<member>.json`.
pub fn is_inbox_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
        && path
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|dir| dir == INBOX_DIR)
}

pub fn is_team_config(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == TEAM_CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inbox_entries() {
        let content = r#"[
            {"from": "lead", "text": "hello", "timestamp": "2025-01-01T00:00:00Z"},
            {"from": "scout", "text": "long", "summary": "short", "timestamp": 1736000000}
        ]"#;
        let messages = parse_inbox(content).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], InboxMessage::new("lead", "hello", "2025-01-01T00:00:00Z"));
        assert_eq!(messages[1].summary.as_deref(), Some("short"));
        assert_eq!(messages[1].timestamp, "1736000000");
    }

    #[test]
    fn odd_entries_keep_their_slot() {
        let messages = parse_inbox(r#"[42, {"text": "hi"}, null]"#).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], InboxMessage::default());
        assert_eq!(messages[1].text, "hi");
        assert_eq!(messages[1].from, "");
    }

    #[test]
    fn blank_inbox_is_empty_and_partial_write_is_an_error() {
        assert!(parse_inbox("  \n").unwrap().is_empty());
        assert!(parse_inbox(r#"[{"from": "lead", "te"#).is_err());
        assert!(parse_inbox(r#"{"from": "lead"}"#).is_err());
    }

    #[test]
    fn parses_team_config() {
        let config = parse_team_config(
            r#"{"name": "alpha", "members": [
                {"name": "lead", "agentId": "lead@alpha", "agentType": "team-lead"},
                {"name": "scout"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(config.members.len(), 2);
        assert_eq!(config.members[0].agent_id, "lead@alpha");
        assert_eq!(config.members[1].agent_type, "");

        assert!(parse_team_config("{}").unwrap().members.is_empty());
    }

    #[test]
    fn recognises_watched_paths() {
        let team = Path::new("/teams/alpha");
        assert!(is_inbox_file(&inbox_path(team, "lead")));
        assert!(!is_inbox_file(&team_config_path(team)));
        assert!(is_team_config(&team_config_path(team)));
        assert!(!is_inbox_file(Path::new("/teams/alpha/notes/lead.json")));
    }

    #[test]
    fn member_names_stay_inside_inbox_dir() {
        assert!(is_valid_member_name("team-lead"));
        assert!(is_valid_member_name("qa.bot"));
        for name in ["", ".", "..", "../../x", "a/b", "a\\b", "/etc/passwd", "x..y"] {
            assert!(!is_valid_member_name(name), "{name:?}");
        }
    }
}
