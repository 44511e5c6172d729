//! Per-site receiver: a server applying replicated operations under its
//! storage root.
//!
//! Enforces the configured max payload size, verifies payload checksums,
//! and applies operations per-path in sequence order. Out-of-order
//! arrivals are held briefly; after the gap wait they are applied anyway
//! and the gap is logged, not fatal.

use crate::error::{Result, SyncError};
use crate::routing::normalize_path;
use crate::task::OperationKind;
use crate::transmit::protocol::{
    self, Ack, AckStatus, Data, Hello, HelloAck, MessageType, TaskEnd, TaskStart, TaskFlags,
    PROTOCOL_VERSION,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

/// How long an out-of-order arrival waits for its missing predecessor.
pub const DEFAULT_GAP_WAIT: Duration = Duration::from_secs(3);

/// Validate that a relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(SyncError::Protocol("empty path not allowed".into()));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return Err(SyncError::Protocol(format!(
            "absolute paths not allowed: {relative}"
        )));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                return Err(SyncError::Protocol(format!(
                    "path traversal not allowed: {relative}"
                )));
            }
            Component::Prefix(_) => {
                return Err(SyncError::Protocol(format!(
                    "prefix paths not allowed: {relative}"
                )));
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    let normalized = normalize_path(&full);
    let root_normalized = normalize_path(root);
    if !normalized.starts_with(&root_normalized) {
        return Err(SyncError::Protocol(format!(
            "path escapes storage root: {relative}"
        )));
    }

    Ok(full)
}

/// Removes a staging file on drop. A successful apply renames the file
/// away first, which makes the drop a no-op.
struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct SiteReceiverConfig {
    /// Storage root operations are applied under.
    pub root: PathBuf,
    /// Largest accepted payload, in bytes.
    pub max_payload: u64,
    /// Bounded wait for sequence gaps.
    pub gap_wait: Duration,
}

impl SiteReceiverConfig {
    pub fn new(root: PathBuf, max_payload: u64) -> Self {
        Self {
            root,
            max_payload,
            gap_wait: DEFAULT_GAP_WAIT,
        }
    }
}

/// A task admitted from the wire, payload already staged.
struct ReceivedTask {
    /// Root this connection's tasks apply under (upload root plus the
    /// transmitter's storage subdirectory).
    root: Arc<PathBuf>,
    start: TaskStart,
    staged: Option<TempFileGuard>,
}

type SeqKey = (String, String);

#[derive(Default)]
struct Sequencer {
    /// Last applied sequence per (origin, path).
    applied: HashMap<SeqKey, u64>,
    /// Out-of-order arrivals held for their predecessor.
    held: HashMap<SeqKey, BTreeMap<u64, ReceivedTask>>,
}

/// Per-site receiving server.
pub struct SiteReceiver {
    config: SiteReceiverConfig,
    sequencer: Mutex<Sequencer>,
    staging_seq: AtomicU64,
}

/// Handle to a bound, running receiver.
pub struct RunningReceiver {
    local_addr: std::net::SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningReceiver {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for RunningReceiver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl SiteReceiver {
    pub fn new(config: SiteReceiverConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sequencer: Mutex::new(Sequencer::default()),
            staging_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Bind and serve. Returns once listening; connections are handled on
    /// background tasks until the handle is dropped or shut down.
    pub async fn bind(self: Arc<Self>, addr: &str) -> Result<RunningReceiver> {
        fs::create_dir_all(&self.config.root).await?;
        fs::create_dir_all(self.staging_dir()).await?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::Transfer(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::Transfer(format!("local addr: {e}")))?;
        info!(%local_addr, root = %self.config.root.display(), "receiver listening");

        let receiver = self;
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "transmitter connected");
                        let receiver = Arc::clone(&receiver);
                        tokio::spawn(async move {
                            if let Err(err) = receiver.serve_stream(stream).await {
                                debug!(%peer, %err, "connection ended");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                    }
                }
            }
        });

        Ok(RunningReceiver { local_addr, handle })
    }

    fn staging_dir(&self) -> PathBuf {
        self.config.root.join(".staging")
    }

    /// Drive one transmitter connection. Generic over the stream so tests
    /// can exercise the protocol over an in-memory duplex.
    pub async fn serve_stream<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (msg_type, payload) = protocol::read_frame(&mut reader).await?;
        if msg_type != MessageType::Hello {
            return Err(SyncError::Protocol(format!(
                "expected Hello, got {msg_type:?}"
            )));
        }
        let hello = Hello::decode(payload)?;
        debug!(
            origin = %hello.origin,
            version = hello.version,
            storage_root = %hello.storage_root,
            "handshake"
        );

        let root = if hello.storage_root.is_empty() {
            Arc::new(self.config.root.clone())
        } else {
            Arc::new(validate_path(&self.config.root, &hello.storage_root)?)
        };

        let ack = HelloAck {
            version: PROTOCOL_VERSION,
            max_payload: self.config.max_payload,
        };
        protocol::write_frame(&mut writer, &ack.encode()).await?;
        writer.flush().await?;

        loop {
            let (msg_type, payload) = match protocol::read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(SyncError::LocalIo(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            if msg_type != MessageType::TaskStart {
                return Err(SyncError::Protocol(format!(
                    "expected TaskStart, got {msg_type:?}"
                )));
            }
            let start = TaskStart::decode(payload)?;
            let ack = Arc::clone(&self)
                .receive_task(&mut reader, Arc::clone(&root), start)
                .await?;
            protocol::write_frame(&mut writer, &ack.encode()).await?;
            writer.flush().await?;
        }
    }

    /// Stage the payload (if any), then admit the task into the sequencer.
    async fn receive_task<R>(
        self: Arc<Self>,
        reader: &mut R,
        root: Arc<PathBuf>,
        start: TaskStart,
    ) -> Result<Ack>
    where
        R: AsyncRead + Unpin + Send,
    {
        let has_payload = start.flags.contains(TaskFlags::HAS_PAYLOAD);

        if has_payload && start.payload_len > self.config.max_payload {
            // Drain the frames the transmitter may already have queued.
            self.discard_payload(reader).await?;
            warn!(
                path = %start.path,
                len = start.payload_len,
                max = self.config.max_payload,
                "payload over site limit"
            );
            return Ok(Ack::rejected(
                start.path.clone(),
                start.seq,
                format!(
                    "payload of {} bytes exceeds site limit of {}",
                    start.payload_len, self.config.max_payload
                ),
            ));
        }

        let staged = if has_payload {
            match self.stage_payload(reader, &start).await {
                Ok(guard) => Some(guard),
                Err(SyncError::Protocol(msg)) => {
                    return Ok(Ack::rejected(start.path.clone(), start.seq, msg));
                }
                Err(err) => return Err(err),
            }
        } else {
            self.read_task_end(reader).await?;
            None
        };

        self.admit(ReceivedTask {
            root,
            start,
            staged,
        })
        .await
    }

    /// Read DATA frames into a staging file until TASK_END, verifying
    /// length and checksum.
    async fn stage_payload<R>(&self, reader: &mut R, start: &TaskStart) -> Result<TempFileGuard>
    where
        R: AsyncRead + Unpin + Send,
    {
        let staging = self.staging_dir().join(format!(
            "in-{}.part",
            self.staging_seq.fetch_add(1, Ordering::Relaxed)
        ));
        let guard = TempFileGuard::new(staging.clone());

        let file = File::create(&staging).await?;
        let mut writer = BufWriter::new(file);
        let mut hasher = Xxh3::new();
        let mut received = 0u64;

        let checksum = loop {
            let (msg_type, payload) = protocol::read_frame(reader).await?;
            match msg_type {
                MessageType::Data => {
                    let data = Data::decode(payload)?;
                    received += data.data.len() as u64;
                    if received > start.payload_len {
                        return Err(SyncError::Protocol(format!(
                            "payload exceeds declared length {}",
                            start.payload_len
                        )));
                    }
                    hasher.update(&data.data);
                    writer.write_all(&data.data).await?;
                }
                MessageType::TaskEnd => break TaskEnd::decode(payload)?.checksum,
                other => {
                    return Err(SyncError::Protocol(format!(
                        "unexpected {other:?} inside payload"
                    )))
                }
            }
        };

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        if received != start.payload_len {
            return Err(SyncError::Protocol(format!(
                "payload truncated: declared {}, received {received}",
                start.payload_len
            )));
        }
        if hasher.digest() != checksum {
            return Err(SyncError::Protocol("payload checksum mismatch".into()));
        }

        Ok(guard)
    }

    async fn discard_payload<R>(&self, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            let (msg_type, _) = protocol::read_frame(reader).await?;
            if msg_type == MessageType::TaskEnd {
                return Ok(());
            }
        }
    }

    async fn read_task_end<R>(&self, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (msg_type, _) = protocol::read_frame(reader).await?;
        if msg_type != MessageType::TaskEnd {
            return Err(SyncError::Protocol(format!(
                "expected TaskEnd, got {msg_type:?}"
            )));
        }
        Ok(())
    }

    /// Sequence-order admission. Applies, holds, or discards the task.
    async fn admit(self: Arc<Self>, task: ReceivedTask) -> Result<Ack> {
        let key: SeqKey = (task.start.origin.clone(), task.start.path.clone());
        let seq = task.start.seq;
        let path = task.start.path.clone();

        let mut sequencer = self.sequencer.lock().await;
        let expected = sequencer.applied.get(&key).map(|last| last + 1).unwrap_or(1);
        if seq < expected {
            debug!(%path, seq, expected, "duplicate sequence, no-op");
            return Ok(Ack::accepted(path, seq, AckStatus::Duplicate));
        }
        if seq > expected {
            debug!(%path, seq, expected, "holding out-of-order arrival");
            sequencer.held.entry(key.clone()).or_default().insert(seq, task);
            Arc::clone(&self).schedule_gap_flush(key);
            return Ok(Ack::accepted(path, seq, AckStatus::Buffered));
        }

        // In order (or first ever seen for this path): apply, then drain
        // any held successors.
        let ack = match self.apply(&task).await {
            Ok(()) => {
                sequencer.applied.insert(key.clone(), seq);
                Ack::accepted(path, seq, AckStatus::Applied)
            }
            Err(err) => {
                warn!(%path, seq, %err, "apply failed");
                Ack::rejected(path, seq, err.to_string())
            }
        };

        self.drain_held(&mut sequencer, &key).await;
        Ok(ack)
    }

    /// Apply held successors that are now in order.
    async fn drain_held(&self, sequencer: &mut Sequencer, key: &SeqKey) {
        loop {
            let Some(&last) = sequencer.applied.get(key) else {
                return;
            };
            let Some(held) = sequencer.held.get_mut(key) else {
                return;
            };
            let Some(task) = held.remove(&(last + 1)) else {
                if held.is_empty() {
                    sequencer.held.remove(key);
                }
                return;
            };
            let seq = task.start.seq;
            if let Err(err) = self.apply(&task).await {
                warn!(path = %task.start.path, seq, %err, "apply of held task failed");
            }
            sequencer.applied.insert(key.clone(), seq);
        }
    }

    /// After the gap wait, give up on the missing predecessor and apply
    /// whatever is held, in order.
    fn schedule_gap_flush(self: Arc<Self>, key: SeqKey) {
        let gap_wait = self.config.gap_wait;
        let receiver = self;
        tokio::spawn(async move {
            tokio::time::sleep(gap_wait).await;
            let mut sequencer = receiver.sequencer.lock().await;
            let Some(held) = sequencer.held.remove(&key) else {
                return;
            };
            if held.is_empty() {
                return;
            }
            let expected = sequencer.applied.get(&key).map(|l| l + 1).unwrap_or(1);
            for (seq, task) in held {
                if seq > expected {
                    warn!(
                        path = %key.1,
                        expected,
                        got = seq,
                        "sequence gap not resolved within wait, applying anyway"
                    );
                }
                if let Err(err) = receiver.apply(&task).await {
                    warn!(path = %key.1, seq, %err, "apply after gap failed");
                }
                sequencer.applied.insert(key.clone(), seq);
            }
        });
    }

    /// Perform the local equivalent of the replicated operation under the
    /// connection's storage root.
    async fn apply(&self, task: &ReceivedTask) -> Result<()> {
        let start = &task.start;
        let root: &Path = &task.root;
        let full = validate_path(root, &start.path)?;

        debug!(op = ?start.op, path = %start.path, seq = start.seq, "applying");

        match start.op {
            OperationKind::Write | OperationKind::StreamWrite => {
                let staged = task
                    .staged
                    .as_ref()
                    .ok_or_else(|| SyncError::Protocol("write without payload".into()))?;
                self.place_staged(staged, &full).await
            }
            OperationKind::Append => {
                let staged = task
                    .staged
                    .as_ref()
                    .ok_or_else(|| SyncError::Protocol("append without payload".into()))?;
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let mut dst = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&full)
                    .await?;
                let mut src = File::open(staged.path()).await?;
                tokio::io::copy(&mut src, &mut dst).await?;
                dst.flush().await?;
                Ok(())
            }
            OperationKind::Copy | OperationKind::Move | OperationKind::Rename => {
                if let Some(staged) = &task.staged {
                    // Content-bearing form: the source was outside the
                    // replicated tree, so this lands as a plain write.
                    return self.place_staged(staged, &full).await;
                }
                let src_rel = start
                    .src
                    .as_deref()
                    .ok_or_else(|| SyncError::Protocol("two-path op without src".into()))?;
                let src_full = validate_path(root, src_rel)?;
                if start.flags.contains(TaskFlags::REPLACE) {
                    remove_existing(&full).await;
                }
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).await?;
                }
                if start.op == OperationKind::Copy {
                    if start.flags.contains(TaskFlags::DIR) {
                        copy_tree(&src_full, &full).await
                    } else {
                        fs::copy(&src_full, &full).await?;
                        Ok(())
                    }
                } else {
                    fs::rename(&src_full, &full).await?;
                    Ok(())
                }
            }
            OperationKind::MkdirTree => {
                fs::create_dir_all(&full).await?;
                Ok(())
            }
            OperationKind::Symlink => {
                let target = start
                    .src
                    .as_deref()
                    .ok_or_else(|| SyncError::Protocol("symlink without target".into()))?;
                let target_path = if start.flags.contains(TaskFlags::SOURCE_IN_SITE) {
                    validate_path(root, target)?
                } else {
                    if Path::new(target).is_absolute() {
                        warn!(link = %start.path, target, "symlink target outside storage root");
                    }
                    PathBuf::from(target)
                };
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let _ = fs::remove_file(&full).await;
                #[cfg(unix)]
                fs::symlink(&target_path, &full).await?;
                #[cfg(not(unix))]
                return Err(SyncError::Protocol("symlinks unsupported here".into()));
                #[cfg(unix)]
                Ok(())
            }
            OperationKind::Unlink => {
                if start.flags.contains(TaskFlags::DIR) {
                    fs::remove_dir_all(&full).await?;
                } else {
                    fs::remove_file(&full).await?;
                }
                Ok(())
            }
        }
    }

    /// Move a verified staging file into its final location.
    async fn place_staged(&self, staged: &TempFileGuard, full: &Path) -> Result<()> {
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staged.path(), full).await?;
        Ok(())
    }
}

async fn remove_existing(path: &Path) {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            let _ = fs::remove_dir_all(path).await;
        }
        Ok(_) => {
            let _ = fs::remove_file(path).await;
        }
        Err(_) => {}
    }
}

/// Recursive directory copy, overwriting files that already exist.
async fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).await?;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = stack.pop() {
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let from_child = entry.path();
            let to_child = to.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                fs::create_dir_all(&to_child).await?;
                stack.push((from_child, to_child));
            } else if file_type.is_symlink() {
                #[cfg(unix)]
                {
                    let target = fs::read_link(&from_child).await?;
                    let _ = fs::remove_file(&to_child).await;
                    fs::symlink(&target, &to_child).await?;
                }
            } else {
                fs::copy(&from_child, &to_child).await?;
            }
        }
    }
    Ok(())
}
