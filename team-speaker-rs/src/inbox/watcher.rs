//! Watches the teams directory and feeds new inbox messages to the processor.
//!
//! Two debounced recursive watchers cover the same tree: a short one for
//! inbox files and a longer one for team descriptors. A periodic poll
//! rescans teams and rereads every known inbox, catching anything the
//! notifications miss.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::{
    inbox_path, is_inbox_file, is_team_config, is_valid_member_name, parse_inbox,
    parse_team_config, team_config_path, InboxMessage,
};
use super::processor::MessageProcessor;
use crate::config::WatcherConfig;
use crate::coordination::{Role, SpeechSink};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum WatchEvent {
    Inbox(PathBuf),
    Teams,
}

type FsDebouncer = Debouncer<RecommendedWatcher, RecommendedCache>;

enum InboxRead {
    Missing,
    Unreadable,
    Messages(Vec<InboxMessage>),
}

pub struct InboxWatcher {
    teams_dir: PathBuf,
    config: WatcherConfig,
    processor: MessageProcessor,
    sink: Arc<dyn SpeechSink>,
    /// Messages already handled per inbox file.
    cursors: HashMap<PathBuf, usize>,
    /// Inboxes that could not be read while priming; the first good read
    /// sets their cursor without speaking.
    unprimed: HashSet<PathBuf>,
}

impl InboxWatcher {
    pub fn new(
        teams_dir: impl Into<PathBuf>,
        config: WatcherConfig,
        processor: MessageProcessor,
        sink: Arc<dyn SpeechSink>,
    ) -> Self {
        Self {
            teams_dir: teams_dir.into(),
            config,
            processor,
            sink,
            cursors: HashMap::new(),
            unprimed: HashSet::new(),
        }
    }

    pub fn cursor(&self, inbox: &Path) -> Option<usize> {
        self.cursors.get(inbox).copied()
    }

    pub fn watched_inboxes(&self) -> usize {
        self.cursors.len()
    }

    /// Discover teams and start tracking any member inbox not seen before.
    ///
    /// With `prime`, new inboxes start at their current length so history
    /// already on disk is not read out.
    pub async fn scan_teams(&mut self, prime: bool) {
        let mut entries = match tokio::fs::read_dir(&self.teams_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read teams directory {}: {e}", self.teams_dir.display());
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error listing {}: {e}", self.teams_dir.display());
                    break;
                }
            };
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                self.scan_team(&entry.path(), prime).await;
            }
        }
    }

    async fn scan_team(&mut self, team_dir: &Path, prime: bool) {
        let config_path = team_config_path(team_dir);
        let content = match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No team descriptor in {}", team_dir.display());
                return;
            }
            Err(e) => {
                warn!("Failed to read {}: {e}", config_path.display());
                return;
            }
        };
        let team = match parse_team_config(&content) {
            Ok(team) => team,
            Err(e) => {
                warn!("Skipping malformed team descriptor {}: {e}", config_path.display());
                return;
            }
        };

        for member in team.members {
            let name = member.name.trim();
            if name.is_empty() {
                continue;
            }
            if !is_valid_member_name(name) {
                warn!(member = name, "Ignoring member with unusable name in {}", config_path.display());
                continue;
            }
            let inbox = inbox_path(team_dir, name);
            if self.cursors.contains_key(&inbox) {
                continue;
            }
            let mut start = 0;
            if prime {
                match self.read_messages(&inbox).await {
                    InboxRead::Messages(messages) => start = messages.len(),
                    InboxRead::Missing => {}
                    InboxRead::Unreadable => {
                        self.unprimed.insert(inbox.clone());
                    }
                }
            }
            info!(member = name, "Watching inbox {} from message {start}", inbox.display());
            self.cursors.insert(inbox, start);
        }
    }

    /// Read new messages from `inbox` and hand them on. Never fails.
    pub async fn process_inbox(&mut self, inbox: &Path) {
        let Some(&seen) = self.cursors.get(inbox) else {
            return;
        };
        let messages = match self.read_messages(inbox).await {
            InboxRead::Messages(messages) => messages,
            InboxRead::Missing => {
                // Nothing on disk to skip any more
                self.unprimed.remove(inbox);
                return;
            }
            InboxRead::Unreadable => return,
        };

        if self.unprimed.remove(inbox) {
            info!(
                "Inbox {} readable, skipping {} existing messages",
                inbox.display(),
                messages.len()
            );
            self.cursors.insert(inbox.to_path_buf(), messages.len());
            return;
        }

        if messages.len() < seen {
            warn!(
                "Inbox {} shrank from {seen} to {} messages; waiting for it to grow past {seen}",
                inbox.display(),
                messages.len()
            );
            return;
        }
        if messages.len() == seen {
            return;
        }

        // Advance first so a concurrent pass can never replay these.
        self.cursors.insert(inbox.to_path_buf(), messages.len());
        debug!("{} new messages in {}", messages.len() - seen, inbox.display());
        for message in &messages[seen..] {
            if let Some(item) = self.processor.process(message) {
                self.sink.submit(item).await;
            }
        }
    }

    pub async fn poll_all(&mut self) {
        let inboxes: Vec<PathBuf> = self.cursors.keys().cloned().collect();
        for inbox in inboxes {
            self.process_inbox(&inbox).await;
        }
    }

    /// Read and parse with bounded retries; the file may be mid-write.
    async fn read_messages(&self, inbox: &Path) -> InboxRead {
        let mut attempt = 0;
        loop {
            let failure = match tokio::fs::read_to_string(inbox).await {
                Ok(content) => match parse_inbox(&content) {
                    Ok(messages) => return InboxRead::Messages(messages),
                    Err(e) => e.to_string(),
                },
                Err(e) if e.kind() == ErrorKind::NotFound => return InboxRead::Missing,
                Err(e) => e.to_string(),
            };

            attempt += 1;
            if attempt > self.config.read_retries {
                warn!("Giving up on {} after {attempt} attempts: {failure}", inbox.display());
                return InboxRead::Unreadable;
            }
            debug!("Retrying {} ({failure})", inbox.display());
            tokio::time::sleep(self.config.retry_delay()).await;
        }
    }

    /// Wait until this process plays speech itself, then watch until
    /// `cancel` fires. Followers leave inboxes to the leader, so each
    /// message is read by one process only.
    pub async fn run_while_leading(
        self,
        mut roles: watch::Receiver<Role>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let leading = async { roles.wait_for(|role| role.plays_locally()).await.is_ok() };
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            promoted = leading => if !promoted {
                return Ok(());
            },
        }
        info!("Playing locally, starting inbox watcher");
        self.run(cancel).await
    }

    /// Watch until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tokio::fs::create_dir_all(&self.teams_dir).await?;

        self.scan_teams(self.config.skip_existing).await;
        self.poll_all().await;
        info!(
            "Watching {} inboxes under {}",
            self.cursors.len(),
            self.teams_dir.display()
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _inbox_debouncer = watch_tree(&self.teams_dir, self.config.inbox_debounce(), tx.clone(), |path| {
            is_inbox_file(path).then(|| WatchEvent::Inbox(path.to_path_buf()))
        })?;
        let _team_debouncer = watch_tree(&self.teams_dir, self.config.team_debounce(), tx, |path| {
            is_team_config(path).then_some(WatchEvent::Teams)
        })?;

        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = rx.recv() => match event {
                    WatchEvent::Inbox(path) => self.process_inbox(&path).await,
                    WatchEvent::Teams => {
                        self.scan_teams(false).await;
                        self.poll_all().await;
                    }
                },
                _ = poll.tick() => {
                    // Directories created in a burst can outrun the recursive watch.
                    self.scan_teams(false).await;
                    self.poll_all().await;
                }
            }
        }

        info!("Inbox watcher stopped");
        Ok(())
    }
}

/// Recursive debounced watch on `root`, forwarding each distinct event that
/// `classify` accepts.
fn watch_tree<F>(
    root: &Path,
    debounce: Duration,
    tx: mpsc::UnboundedSender<WatchEvent>,
    classify: F,
) -> Result<FsDebouncer>
where
    F: Fn(&Path) -> Option<WatchEvent> + Send + 'static,
{
    let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| match result {
        Ok(events) => {
            let mut batch = BTreeSet::new();
            for event in events {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                for path in &event.paths {
                    if let Some(watch_event) = classify(path) {
                        batch.insert(watch_event);
                    }
                }
            }
            for watch_event in batch {
                let _ = tx.send(watch_event);
            }
        }
        Err(errors) => {
            for e in errors {
                warn!(error = %e, "teams watcher error");
            }
        }
    })?;
    debouncer.watch(root, RecursiveMode::Recursive)?;
    Ok(debouncer)
}
