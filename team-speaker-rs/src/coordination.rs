//! Leader election and speech forwarding between cooperating processes.
//!
//! All processes sharing a state directory race to bind one Unix socket.
//! The winner (leader) owns the playback queue and accepts forwarded items;
//! everyone else (followers) connects to it and writes newline-delimited
//! JSON `QueueItem`s, or `{"setMuted": bool}` control lines. A socket file
//! that refuses connections was left by a leader that died without cleanup;
//! it is removed and the election rerun.
//!
//! Stale recovery happens under an advisory lock so two recovering processes
//! cannot delete each other's freshly bound socket. Followers watch their
//! connection and rerun the election as soon as the leader hangs up.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::speaker::queue::{PlaybackQueue, QueueItem};

const MAX_ELECTION_ATTEMPTS: u32 = 3;

/// Anything that accepts speech produced in this process.
#[async_trait]
pub trait SpeechSink: Send + Sync {
    async fn submit(&self, item: QueueItem);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
    /// Election failed; speech is played locally without coordination.
    Standalone,
    Stopped,
}

impl Role {
    /// Roles whose own queue is the one that plays.
    pub fn plays_locally(self) -> bool {
        matches!(self, Self::Leader | Self::Standalone)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "LEADER"),
            Self::Follower => write!(f, "FOLLOWER"),
            Self::Standalone => write!(f, "STANDALONE"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Outcome of one election.
pub enum Elected {
    Leader(UnixListener),
    Follower(UnixStream),
}

/// Become the listener on `socket_path`, or connect to whoever is.
pub async fn elect(socket_path: &Path, lock_path: &Path) -> Result<Elected> {
    for attempt in 1..=MAX_ELECTION_ATTEMPTS {
        match UnixListener::bind(socket_path) {
            Ok(listener) => return Ok(Elected::Leader(listener)),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {}
            Err(e) => return Err(e.into()),
        }

        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(Elected::Follower(stream)),
            Err(e) if is_stale(&e) => {
                debug!(attempt, "Rendezvous socket {} is stale: {e}", socket_path.display());
                if let Some(elected) = recover_stale(socket_path, lock_path).await? {
                    return Ok(elected);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    UnixStream::connect(socket_path)
        .await
        .map(Elected::Follower)
        .map_err(|e| {
            Error::Coordination(format!(
                "no leader reachable at {} after {MAX_ELECTION_ATTEMPTS} attempts: {e}",
                socket_path.display()
            ))
        })
}

/// Nobody listening (refused), or the file vanished under a concurrent recovery.
fn is_stale(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound)
}

async fn recover_stale(socket_path: &Path, lock_path: &Path) -> Result<Option<Elected>> {
    let _lock = RecoveryLock::acquire(lock_path).await?;

    // Someone else may have finished recovering while we waited.
    match UnixStream::connect(socket_path).await {
        Ok(stream) => return Ok(Some(Elected::Follower(stream))),
        Err(e) if is_stale(&e) => {}
        Err(e) => return Err(e.into()),
    }

    match fs::remove_file(socket_path) {
        Ok(()) => warn!("Removed stale rendezvous socket {}", socket_path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    match UnixListener::bind(socket_path) {
        Ok(listener) => Ok(Some(Elected::Leader(listener))),
        // A fresh process bound the now-free path first
        Err(e) if e.kind() == ErrorKind::AddrInUse => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Exclusive advisory lock, released when dropped.
struct RecoveryLock {
    _file: File,
}

impl RecoveryLock {
    async fn acquire(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<Self> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock()?;
            debug!("Acquired recovery lock {}", path.display());
            Ok(Self { _file: file })
        })
        .await
        .map_err(|e| Error::Coordination(format!("lock task failed: {e}")))?
    }
}

/// One line on the rendezvous socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Control(Control),
    Speech(QueueItem),
}

/// State change a follower pushes to the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Control {
    pub set_muted: bool,
}

/// Write one item to the leader as a JSON line.
pub async fn forward<W>(writer: &mut W, item: &QueueItem) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, item).await
}

async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Play or apply an envelope against the queue owned by this process.
fn apply(queue: &Arc<PlaybackQueue>, envelope: Envelope) {
    match envelope {
        Envelope::Speech(item) => {
            queue.enqueue(item);
        }
        Envelope::Control(Control { set_muted }) => queue.set_muted(set_muted),
    }
}

/// Leader side of the socket. Dropping it stops accepting and removes the
/// socket file so the next process can win a clean election.
struct LeaderGuard {
    socket_path: PathBuf,
    server: JoinHandle<()>,
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.server.abort();
        match fs::remove_file(&self.socket_path) {
            Ok(()) => info!("Released rendezvous socket {}", self.socket_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {e}", self.socket_path.display()),
        }
    }
}

fn spawn_server(listener: UnixListener, queue: Arc<PlaybackQueue>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!("Follower connected");
                        connections.spawn(read_forwarded(stream, queue.clone()));
                    }
                    Err(e) => {
                        warn!("Rendezvous accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    })
}

async fn read_forwarded(stream: UnixStream, queue: Arc<PlaybackQueue>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Envelope>(&line) {
                    Ok(envelope) => {
                        if let Envelope::Speech(item) = &envelope {
                            debug!("Forwarded speech from {}", item.from);
                        }
                        apply(&queue, envelope);
                    }
                    Err(e) => warn!("Ignoring malformed forwarded line: {e}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Follower connection error: {e}");
                break;
            }
        }
    }
    debug!("Follower disconnected");
}

/// Write side of a follower's connection. Dropping it also stops the task
/// watching the read side.
struct FollowerLink {
    writer: OwnedWriteHalf,
    _closed: DropGuard,
}

enum Link {
    Leader(LeaderGuard),
    Follower(FollowerLink),
    Standalone,
    Stopped,
}

impl Link {
    fn role(&self) -> Role {
        match self {
            Link::Leader(_) => Role::Leader,
            Link::Follower(_) => Role::Follower,
            Link::Standalone => Role::Standalone,
            Link::Stopped => Role::Stopped,
        }
    }
}

/// Routes speech to the leader's queue, wherever it lives.
pub struct Coordinator {
    socket_path: PathBuf,
    lock_path: PathBuf,
    queue: Arc<PlaybackQueue>,
    link: Mutex<Link>,
    role: watch::Sender<Role>,
    this: Weak<Coordinator>,
}

impl Coordinator {
    /// Run the election and start serving followers if this process wins.
    pub async fn start(
        socket_path: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
        queue: Arc<PlaybackQueue>,
    ) -> Arc<Self> {
        let (role, _) = watch::channel(Role::Stopped);
        let coordinator = Arc::new_cyclic(|this| Self {
            socket_path: socket_path.into(),
            lock_path: lock_path.into(),
            queue,
            link: Mutex::new(Link::Stopped),
            role,
            this: this.clone(),
        });
        {
            let mut link = coordinator.link.lock().await;
            coordinator.establish(&mut link).await;
        }
        coordinator
    }

    pub async fn role(&self) -> Role {
        self.link.lock().await.role()
    }

    /// Role changes, starting with the current role.
    pub fn roles(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    /// The local queue. Only the leader's is ever drained.
    pub fn queue(&self) -> &Arc<PlaybackQueue> {
        &self.queue
    }

    /// Queue locally when leading, otherwise forward to the leader, whose
    /// mute state decides whether the item plays.
    pub async fn enqueue(&self, item: QueueItem) {
        self.deliver(Envelope::Speech(item)).await;
    }

    /// Mute or unmute the queue that actually plays.
    pub async fn set_muted(&self, muted: bool) {
        self.deliver(Envelope::Control(Control { set_muted: muted })).await;
    }

    /// A lost leader connection triggers one re-election before giving up.
    async fn deliver(&self, envelope: Envelope) {
        let mut link = self.link.lock().await;
        match &mut *link {
            Link::Leader(_) | Link::Standalone => {
                apply(&self.queue, envelope);
                return;
            }
            Link::Stopped => {
                debug!("Coordinator stopped, dropping {envelope:?}");
                return;
            }
            Link::Follower(follower) => match write_line(&mut follower.writer, &envelope).await {
                Ok(()) => return,
                Err(e) => warn!("Lost connection to leader ({e}), re-running election"),
            },
        }

        self.establish(&mut link).await;
        match &mut *link {
            Link::Follower(follower) => {
                if let Err(e) = write_line(&mut follower.writer, &envelope).await {
                    warn!("Dropping {envelope:?}: {e}");
                }
            }
            Link::Leader(_) | Link::Standalone => apply(&self.queue, envelope),
            Link::Stopped => {}
        }
    }

    /// Stop serving and release the socket if leading.
    pub async fn shutdown(&self) {
        let mut link = self.link.lock().await;
        let previous = std::mem::replace(&mut *link, Link::Stopped);
        if matches!(previous, Link::Leader(_)) {
            info!("Leader shutting down");
        }
        drop(previous);
        self.role.send_replace(Role::Stopped);
    }

    async fn establish(&self, link: &mut Link) {
        // Close any old connection before electing.
        *link = Link::Stopped;
        *link = match elect(&self.socket_path, &self.lock_path).await {
            Ok(Elected::Leader(listener)) => {
                info!("Role: LEADER on {}", self.socket_path.display());
                Link::Leader(LeaderGuard {
                    socket_path: self.socket_path.clone(),
                    server: spawn_server(listener, self.queue.clone()),
                })
            }
            Ok(Elected::Follower(stream)) => {
                info!("Role: FOLLOWER of {}", self.socket_path.display());
                Link::Follower(self.follow(stream))
            }
            Err(e) => {
                error!("Leader election failed: {e}; playing speech locally");
                Link::Standalone
            }
        };
        self.role.send_replace(link.role());
    }

    fn follow(&self, stream: UnixStream) -> FollowerLink {
        let (reader, writer) = stream.into_split();
        let closed = CancellationToken::new();
        tokio::spawn(watch_leader(self.this.clone(), reader, closed.clone()));
        FollowerLink {
            writer,
            _closed: closed.drop_guard(),
        }
    }

    async fn leader_lost(&self, closed: &CancellationToken) {
        let mut link = self.link.lock().await;
        // Already replaced by a re-election or shutdown
        if closed.is_cancelled() {
            return;
        }
        warn!("Leader hung up, re-running election");
        self.establish(&mut link).await;
    }
}

#[async_trait]
impl SpeechSink for Coordinator {
    async fn submit(&self, item: QueueItem) {
        self.enqueue(item).await;
    }
}

/// The leader never writes to followers, so any end of the read side means
/// it is gone.
async fn watch_leader(
    coordinator: Weak<Coordinator>,
    mut reader: OwnedReadHalf,
    closed: CancellationToken,
) {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = closed.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    if let Some(coordinator) = coordinator.upgrade() {
        coordinator.leader_lost(&closed).await;
    }
}
