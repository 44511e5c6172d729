//! Dispatch coordinator: decides when the caller is told an operation is
//! done, and routes task delivery failures.
//!
//! Both modes always run the local action first (in the facade); the
//! dispatcher only ever adds propagation on top.

use crate::channel::CommandChannel;
use crate::config::{ConfirmLevel, SyncMode};
use crate::error::{Result, SyncError};
use crate::routing::SiteTable;
use crate::task::{OperationKind, Task, TaskPayload};
use crate::transmit::{Outbound, TaskFlags, TaskStart, Transmitter};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Bounded wait for receiver acknowledgments in synchronous mode with
/// `ConfirmLevel::Receipt`.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_SIZE: usize = 256;

/// Process-wide notifications. Asynchronous-mode propagation failures only
/// ever surface here, never through the original caller.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Initial broker connection established.
    Ready,
    /// A task could not be propagated to a site.
    PropagationError {
        site: String,
        path: PathBuf,
        error: String,
    },
}

/// Where and how a task goes out, after routing normalization.
struct Plan {
    op: OperationKind,
    rel: PathBuf,
    src: Option<String>,
    flags: TaskFlags,
    payload: TaskPayload,
}

pub struct Dispatcher {
    mode: SyncMode,
    confirm: ConfirmLevel,
    origin: String,
    queue_name: String,
    table: Arc<SiteTable>,
    channel: Arc<CommandChannel>,
    transmitters: HashMap<String, Arc<Transmitter>>,
    /// Next sequence number per routed path. Held while enqueueing so
    /// transmitter queue order always matches sequence order.
    seqs: Mutex<HashMap<PathBuf, u64>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Dispatcher {
    pub fn new(
        mode: SyncMode,
        confirm: ConfirmLevel,
        origin: String,
        queue_name: String,
        table: Arc<SiteTable>,
        channel: Arc<CommandChannel>,
        transmitters: HashMap<String, Arc<Transmitter>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            mode,
            confirm,
            origin,
            queue_name,
            table,
            channel,
            transmitters,
            seqs: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn emit_ready(&self) {
        let _ = self.events.send(SyncEvent::Ready);
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    /// Stop the transmitters and close the broker connection. Local
    /// filesystem work already in flight is never cancelled.
    pub async fn shutdown(&self) {
        for transmitter in self.transmitters.values() {
            transmitter.shutdown();
        }
        let _ = self.channel.close().await;
    }

    /// Propagate a task per the configured synchronization mode. In
    /// synchronous mode this resolves once the broker accepted the publish
    /// (and, with `ConfirmLevel::Receipt`, once every site acknowledged);
    /// in asynchronous mode it resolves immediately and failures go to the
    /// event channel.
    pub async fn dispatch(&self, mut task: Task) -> Result<()> {
        let Some(plan) = self.plan(&task) else {
            debug!(path = %task.source().display(), "path not watched, no propagation");
            return Ok(());
        };
        task.origin = self.origin.clone();

        let mut start = TaskStart {
            op: plan.op,
            flags: plan.flags,
            seq: 0,
            created_at: task.created_at.timestamp(),
            payload_len: 0,
            origin: self.origin.clone(),
            path: plan.rel.to_string_lossy().into_owned(),
            src: plan.src,
            description: task.description.clone(),
        };

        // Sequence assignment and transmitter enqueue under one lock, so a
        // concurrent dispatch on the same path cannot interleave.
        let mut receipts = Vec::with_capacity(self.transmitters.len());
        {
            let mut seqs = self.seqs.lock().unwrap();
            let seq = seqs.entry(plan.rel.clone()).or_insert(0);
            *seq += 1;
            start.seq = *seq;
            task.seq = *seq;

            for transmitter in self.transmitters.values() {
                let (done, receipt) = oneshot::channel();
                let outbound = Outbound {
                    start: start.clone(),
                    payload: plan.payload.clone(),
                    done,
                };
                if transmitter.send(outbound).is_ok() {
                    receipts.push((transmitter.site().to_string(), receipt));
                }
            }
        }

        match self.mode {
            SyncMode::Synchronous => {
                self.publish_all(&task).await?;
                match self.confirm {
                    ConfirmLevel::Receipt => self.await_receipts(receipts).await,
                    ConfirmLevel::Publish => {
                        self.watch_receipts(&start, receipts);
                        Ok(())
                    }
                }
            }
            SyncMode::Asynchronous => {
                let channel = Arc::clone(&self.channel);
                let table = Arc::clone(&self.table);
                let queue_name = self.queue_name.clone();
                let events = self.events.clone();
                let path = plan.rel.clone();
                tokio::spawn(async move {
                    for site in table.sites() {
                        let queue = site.queue_name(&queue_name);
                        if let Err(err) = channel.publish(&queue, &task).await {
                            warn!(%err, "async publish failed");
                            let _ = events.send(SyncEvent::PropagationError {
                                site: "broker".into(),
                                path: path.clone(),
                                error: err.to_string(),
                            });
                            break;
                        }
                    }
                });
                self.watch_receipts(&start, receipts);
                Ok(())
            }
        }
    }

    async fn publish_all(&self, task: &Task) -> Result<()> {
        for site in self.table.sites() {
            let queue = site.queue_name(&self.queue_name);
            self.channel.publish(&queue, task).await?;
        }
        Ok(())
    }

    /// Synchronous + Receipt: the caller's completion is the union of every
    /// site's outcome.
    async fn await_receipts(
        &self,
        receipts: Vec<(String, oneshot::Receiver<Result<()>>)>,
    ) -> Result<()> {
        for (site, receipt) in receipts {
            match tokio::time::timeout(RECEIPT_TIMEOUT, receipt).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    return Err(SyncError::Transfer(format!("site {site}: {err}")))
                }
                Ok(Err(_)) => {
                    return Err(SyncError::Transfer(format!(
                        "site {site}: transmitter stopped"
                    )))
                }
                Err(_) => {
                    return Err(SyncError::Transfer(format!(
                        "site {site}: no acknowledgment within {}s",
                        RECEIPT_TIMEOUT.as_secs()
                    )))
                }
            }
        }
        Ok(())
    }

    /// Fire-and-forget watch: transfer failures become events.
    fn watch_receipts(
        &self,
        start: &TaskStart,
        receipts: Vec<(String, oneshot::Receiver<Result<()>>)>,
    ) {
        let events = self.events.clone();
        let path = PathBuf::from(&start.path);
        tokio::spawn(async move {
            for (site, receipt) in receipts {
                match receipt.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = events.send(SyncEvent::PropagationError {
                            site,
                            path: path.clone(),
                            error: err.to_string(),
                        });
                    }
                    Err(_) => {
                        let _ = events.send(SyncEvent::PropagationError {
                            site,
                            path: path.clone(),
                            error: "transmitter stopped".into(),
                        });
                    }
                }
            }
        });
    }

    /// Routing normalization: which site-relative path the task mutates,
    /// what travels as content, and how two-path operations degrade when
    /// one side is outside the replicated tree.
    fn plan(&self, task: &Task) -> Option<Plan> {
        let mut flags = TaskFlags::empty();
        if task.options.replace {
            flags |= TaskFlags::REPLACE;
        }
        if task.options.dir {
            flags |= TaskFlags::DIR;
        }

        match task.op {
            OperationKind::Write
            | OperationKind::Append
            | OperationKind::StreamWrite
            | OperationKind::MkdirTree
            | OperationKind::Unlink => {
                let routed = self.table.resolve(&task.paths[0])?;
                Some(Plan {
                    op: task.op,
                    rel: routed.rel,
                    src: None,
                    flags,
                    payload: task.payload.clone(),
                })
            }
            OperationKind::Symlink => {
                // paths = [target, link]; the link is the mutated path.
                let link = self.table.resolve(task.paths.get(1)?)?;
                let target = &task.paths[0];
                let src = match self.table.resolve(target) {
                    Some(routed) => {
                        flags |= TaskFlags::SOURCE_IN_SITE;
                        routed.rel.to_string_lossy().into_owned()
                    }
                    None => target.to_string_lossy().into_owned(),
                };
                Some(Plan {
                    op: task.op,
                    rel: link.rel,
                    src: Some(src),
                    flags,
                    payload: TaskPayload::None,
                })
            }
            OperationKind::Copy | OperationKind::Move | OperationKind::Rename => {
                let src = self.table.resolve(&task.paths[0]);
                let dst = self.table.resolve(task.paths.get(1)?);
                match (src, dst) {
                    (Some(src), Some(dst)) => {
                        flags |= TaskFlags::SOURCE_IN_SITE;
                        Some(Plan {
                            op: task.op,
                            rel: dst.rel,
                            src: Some(src.rel.to_string_lossy().into_owned()),
                            flags,
                            payload: TaskPayload::None,
                        })
                    }
                    (None, Some(dst)) => {
                        if task.options.dir {
                            warn!(
                                src = %task.paths[0].display(),
                                "directory {} from outside the replicated tree cannot be streamed",
                                task.op.as_str()
                            );
                            return None;
                        }
                        Some(Plan {
                            op: task.op,
                            rel: dst.rel,
                            src: None,
                            flags,
                            payload: task.payload.clone(),
                        })
                    }
                    (Some(src), None) => {
                        // A move out of the tree removes the source from
                        // the replicated view; a copy changes nothing.
                        if task.op == OperationKind::Copy {
                            return None;
                        }
                        Some(Plan {
                            op: OperationKind::Unlink,
                            rel: src.rel,
                            src: None,
                            flags,
                            payload: TaskPayload::None,
                        })
                    }
                    (None, None) => None,
                }
            }
        }
    }
}
