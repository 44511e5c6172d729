//! Broker clients for the command channel.
//!
//! The channel talks to an AMQP broker through the `Broker`/`BrokerChannel`
//! traits so the connection lifecycle can be driven against an in-memory
//! implementation as well as a real broker.

use crate::config::{BrokerConfig, QueueConfig};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Connection factory. One `connect` yields one owned channel.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>>;
}

/// A single open connection/channel to the broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, queue: &str, config: &QueueConfig) -> Result<()>;
    /// Resolves when the broker has accepted the publish, not when a
    /// consumer has seen it.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

// =============================================================================
// AMQP (lapin)
// =============================================================================

/// AMQP broker client.
pub struct AmqpBroker {
    config: BrokerConfig,
}

impl AmqpBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        let uri = self.config.amqp_uri();
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = lapin::Connection::connect(&uri, properties)
            .await
            .map_err(|e| SyncError::Publish(format!("broker connect: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SyncError::Publish(format!("channel open: {e}")))?;

        // Publisher confirms so publish() resolves on broker acceptance.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| SyncError::Publish(format!("confirm select: {e}")))?;

        info!(host = %self.config.host, port = self.config.port, "connected to broker");

        Ok(Box::new(AmqpChannel {
            _connection: connection,
            channel,
            queue: self.config.queue.clone(),
        }))
    }
}

struct AmqpChannel {
    _connection: lapin::Connection,
    channel: lapin::Channel,
    queue: QueueConfig,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str, config: &QueueConfig) -> Result<()> {
        let options = QueueDeclareOptions {
            durable: config.durable,
            auto_delete: config.auto_delete,
            ..Default::default()
        };
        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|e| SyncError::Publish(format!("queue declare {queue}: {e}")))?;
        debug!(queue, "queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let options = BasicPublishOptions {
            mandatory: self.queue.mandatory,
            ..Default::default()
        };
        let mut properties = BasicProperties::default();
        if self.queue.persistent {
            properties = properties.with_delivery_mode(2);
        }
        let confirm = self
            .channel
            .basic_publish("", queue, options, body, properties)
            .await
            .map_err(|e| SyncError::Publish(format!("publish to {queue}: {e}")))?;
        confirm
            .await
            .map_err(|e| SyncError::Publish(format!("publish confirm on {queue}: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "client close")
            .await
            .map_err(|e| SyncError::Publish(format!("channel close: {e}")))?;
        Ok(())
    }
}

// =============================================================================
// In-memory broker
// =============================================================================

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, Vec<Vec<u8>>>,
    declared: HashMap<String, QueueConfig>,
}

/// In-process broker used by tests and broker-less local runs. Messages are
/// retained per queue and can be drained for assertions.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
    down: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage: `connect` fails until restored.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Number of successful connections made so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// All message bodies published to a queue, in order.
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    pub fn declared(&self, queue: &str) -> bool {
        self.state.lock().unwrap().declared.contains_key(queue)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SyncError::Publish("broker unreachable".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChannel {
            state: Arc::clone(&self.state),
            down: Arc::clone(&self.down),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
    down: Arc<AtomicBool>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str, config: &QueueConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.declared.insert(queue.to_string(), config.clone());
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Publish("channel closed".into()));
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(SyncError::Publish("broker unreachable".into()));
        }
        self.state
            .lock()
            .unwrap()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push(body.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_broker_retains_publishes() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel
            .declare_queue("usync.sync", &QueueConfig::default())
            .await
            .unwrap();
        channel.publish("usync.sync", b"one").await.unwrap();
        channel.publish("usync.sync", b"two").await.unwrap();

        assert!(broker.declared("usync.sync"));
        assert_eq!(broker.published("usync.sync"), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn closed_channel_rejects_publish() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel.close().await.unwrap();
        assert!(channel.publish("q", b"x").await.is_err());
    }

    #[tokio::test]
    async fn down_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_down(true);
        assert!(broker.connect().await.is_err());
        broker.set_down(false);
        assert!(broker.connect().await.is_ok());
    }
}
