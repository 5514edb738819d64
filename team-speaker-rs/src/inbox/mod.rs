//! Inbox pipeline: discover team members, read their inbox files and turn new
//! messages into speech.
//!
//! Layout under the teams directory:
//!
//! ```text
//! <teams_dir>/<team>/config.json            team descriptor (member list)
//! <teams_dir>/<team>/inboxes/<member>.json  JSON array of messages
//! ```

pub mod markdown;
pub mod message;
pub mod processor;
pub mod watcher;

pub use message::{InboxMessage, TeamConfig, TeamMember};
pub use processor::MessageProcessor;
pub use watcher::InboxWatcher;
