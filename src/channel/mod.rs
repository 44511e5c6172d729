//! Command channel: broker connection lifecycle and task metadata publishes.
//!
//! One broker connection per process, owned exclusively by `CommandChannel`.
//! Connections are created lazily on the first publish, closed explicitly
//! via [`CommandChannel::close`], and re-created transparently on the next
//! publish after a close or a drop.

pub mod broker;

pub use broker::{AmqpBroker, Broker, BrokerChannel, MemoryBroker};

use crate::config::QueueConfig;
use crate::error::{Result, SyncError};
use crate::task::Task;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

struct ChannelInner {
    phase: ConnectionState,
    channel: Option<Box<dyn BrokerChannel>>,
    /// Queues declared on the current connection.
    declared: HashSet<String>,
    /// Publishes that failed and await the next attempt, submission order.
    pending: VecDeque<(String, Vec<u8>)>,
    last_activity: Instant,
}

/// Broker-facing control plane. Serializes task metadata onto per-site
/// queues and owns the connection state machine.
pub struct CommandChannel {
    broker: Arc<dyn Broker>,
    queue_config: QueueConfig,
    inner: Mutex<ChannelInner>,
}

impl CommandChannel {
    pub fn new(broker: Arc<dyn Broker>, queue_config: QueueConfig) -> Self {
        Self {
            broker,
            queue_config,
            inner: Mutex::new(ChannelInner {
                phase: ConnectionState::Disconnected,
                channel: None,
                declared: HashSet::new(),
                pending: VecDeque::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.phase
    }

    /// Establish the connection now instead of on the first publish.
    pub async fn ensure_connected(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await
    }

    /// Publish a task's metadata on `queue`. Resolves once the broker has
    /// accepted it. Reconnects on demand; a publish that still fails is
    /// parked and retried before the next publish on any queue.
    pub async fn publish(&self, queue: &str, task: &Task) -> Result<()> {
        let body = serde_json::to_vec(&task.to_record())
            .map_err(|e| SyncError::Publish(format!("task encode: {e}")))?;

        let mut inner = self.inner.lock().await;

        // Earlier failed publishes go out first to preserve submission order.
        while let Some((parked_queue, parked_body)) = inner.pending.pop_front() {
            if let Err(err) = self
                .publish_locked(&mut inner, &parked_queue, &parked_body)
                .await
            {
                inner.pending.push_front((parked_queue, parked_body));
                inner.pending.push_back((queue.to_string(), body));
                return Err(err);
            }
        }

        if let Err(err) = self.publish_locked(&mut inner, queue, &body).await {
            inner.pending.push_back((queue.to_string(), body));
            return Err(err);
        }
        inner.last_activity = Instant::now();
        Ok(())
    }

    /// Close the connection if nothing has been published for `idle`.
    /// Returns whether a close happened. The next publish reconnects.
    pub async fn close_if_idle(&self, idle: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.channel.is_none() || inner.last_activity.elapsed() < idle {
            return false;
        }
        if let Some(channel) = inner.channel.take() {
            inner.phase = ConnectionState::Closing;
            if let Err(err) = channel.close().await {
                warn!(%err, "idle close failed");
            }
        }
        inner.declared.clear();
        inner.phase = ConnectionState::Disconnected;
        debug!("command channel closed after idle period");
        true
    }

    /// Graceful shutdown of the current connection. Pending publishes are
    /// kept and retried on the next publish, which reconnects transparently.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(channel) = inner.channel.take() {
            inner.phase = ConnectionState::Closing;
            if let Err(err) = channel.close().await {
                warn!(%err, "broker channel close failed");
            }
        }
        inner.declared.clear();
        inner.phase = ConnectionState::Disconnected;
        debug!("command channel closed");
        Ok(())
    }

    async fn connect_locked(&self, inner: &mut ChannelInner) -> Result<()> {
        if inner.channel.is_some() {
            return Ok(());
        }
        inner.phase = ConnectionState::Connecting;
        match self.broker.connect().await {
            Ok(channel) => {
                inner.channel = Some(channel);
                inner.declared.clear();
                inner.phase = ConnectionState::Connected;
                Ok(())
            }
            Err(err) => {
                inner.phase = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    async fn publish_locked(
        &self,
        inner: &mut ChannelInner,
        queue: &str,
        body: &[u8],
    ) -> Result<()> {
        self.connect_locked(inner).await?;
        self.declare_locked(inner, queue).await?;

        let channel = inner
            .channel
            .as_ref()
            .ok_or_else(|| SyncError::Publish("not connected".into()))?;
        match channel.publish(queue, body).await {
            Ok(()) => Ok(()),
            Err(first) => {
                // The connection may have dropped since the last publish;
                // reconnect once and retry before giving up.
                debug!(%first, queue, "publish failed, reconnecting");
                inner.channel = None;
                inner.declared.clear();
                inner.phase = ConnectionState::Disconnected;

                self.connect_locked(inner).await?;
                self.declare_locked(inner, queue).await?;
                let channel = inner
                    .channel
                    .as_ref()
                    .ok_or_else(|| SyncError::Publish("not connected".into()))?;
                channel.publish(queue, body).await
            }
        }
    }

    async fn declare_locked(&self, inner: &mut ChannelInner, queue: &str) -> Result<()> {
        if inner.declared.contains(queue) {
            return Ok(());
        }
        let channel = inner
            .channel
            .as_ref()
            .ok_or_else(|| SyncError::Publish("not connected".into()))?;
        channel.declare_queue(queue, &self.queue_config).await?;
        inner.declared.insert(queue.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{OperationKind, Task, TaskPayload};
    use std::path::PathBuf;

    fn write_task(name: &str) -> Task {
        Task::new(
            OperationKind::Write,
            vec![PathBuf::from(name)],
            TaskPayload::None,
        )
    }

    #[tokio::test]
    async fn lazy_connect_on_first_publish() {
        let broker = MemoryBroker::new();
        let channel = CommandChannel::new(Arc::new(broker.clone()), QueueConfig::default());

        assert_eq!(channel.state().await, ConnectionState::Disconnected);
        channel.publish("q.sync", &write_task("a")).await.unwrap();
        assert_eq!(channel.state().await, ConnectionState::Connected);
        assert_eq!(broker.published("q.sync").len(), 1);
        assert!(broker.declared("q.sync"));
    }

    #[tokio::test]
    async fn close_then_publish_reconnects() {
        let broker = MemoryBroker::new();
        let channel = CommandChannel::new(Arc::new(broker.clone()), QueueConfig::default());

        channel.publish("q.sync", &write_task("a")).await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(channel.state().await, ConnectionState::Disconnected);

        channel.publish("q.sync", &write_task("b")).await.unwrap();
        assert_eq!(channel.state().await, ConnectionState::Connected);
        assert_eq!(broker.published("q.sync").len(), 2);
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn idle_close_then_publish_reconnects() {
        let broker = MemoryBroker::new();
        let channel = CommandChannel::new(Arc::new(broker.clone()), QueueConfig::default());

        channel.publish("q.sync", &write_task("a")).await.unwrap();
        assert!(channel.close_if_idle(Duration::ZERO).await);
        assert_eq!(channel.state().await, ConnectionState::Disconnected);

        // Not connected: nothing to close.
        assert!(!channel.close_if_idle(Duration::ZERO).await);

        channel.publish("q.sync", &write_task("b")).await.unwrap();
        assert_eq!(broker.published("q.sync").len(), 2);
    }

    #[tokio::test]
    async fn failed_publish_is_parked_and_flushed() {
        let broker = MemoryBroker::new();
        let channel = CommandChannel::new(Arc::new(broker.clone()), QueueConfig::default());

        broker.set_down(true);
        assert!(channel.publish("q.sync", &write_task("a")).await.is_err());
        assert!(channel.publish("q.sync", &write_task("b")).await.is_err());
        assert!(broker.published("q.sync").is_empty());

        broker.set_down(false);
        channel.publish("q.sync", &write_task("c")).await.unwrap();

        // All three arrive, submission order preserved.
        let bodies = broker.published("q.sync");
        assert_eq!(bodies.len(), 3);
        let first: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
        assert_eq!(first["paths"][0], "a");
        let last: serde_json::Value = serde_json::from_slice(&bodies[2]).unwrap();
        assert_eq!(last["paths"][0], "c");
    }
}
