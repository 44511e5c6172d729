//! sitesync - transparent multi-site filesystem replication.
//!
//! Callers mutate the local filesystem through [`SyncFs`]; every
//! successful mutation under a watched directory becomes a task that is
//! announced on an AMQP queue per site and streamed to each site's
//! receiver over a persistent connection.
//!
//! ```no_run
//! use sitesync::{Directive, SyncConfig, Synchroniser};
//!
//! # async fn demo() -> sitesync::Result<()> {
//! let config = SyncConfig::load(std::path::Path::new("sitesync.toml"))?;
//! let sync = Synchroniser::start(config).await?;
//!
//! let fs = sync.fs();
//! fs.write_file("sites/a/hello.txt", "example text...").await?;
//! fs.with(Directive::skip()).unlink("sites/a/hello.txt").await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fsx;
pub mod routing;
pub mod task;
pub mod transmit;

pub use channel::{AmqpBroker, Broker, CommandChannel, ConnectionState, MemoryBroker};
pub use config::{
    BrokerConfig, ConfirmLevel, QueueConfig, ReceiverEndpoint, SyncConfig, SyncMode,
    TransmitterEndpoint,
};
pub use dispatch::SyncEvent;
pub use error::{Result, SyncError};
pub use fsx::{CopyOptions, SyncFs, SyncWriteStream};
pub use task::{Directive, OperationKind, Task, TaskOptions, TaskPayload, TaskRecord};
pub use transmit::{RunningReceiver, SiteReceiver, SiteReceiverConfig};

use crate::dispatch::Dispatcher;
use crate::routing::SiteTable;
use crate::transmit::Transmitter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// A configured replication instance: the facade, the command channel and
/// one transmitter per site.
pub struct Synchroniser {
    dispatcher: Arc<Dispatcher>,
    idle_task: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for Synchroniser {
    fn drop(&mut self) {
        if let Some(task) = &self.idle_task {
            task.abort();
        }
    }
}

impl Synchroniser {
    /// Start against the configured AMQP broker.
    pub async fn start(config: SyncConfig) -> Result<Self> {
        let broker = Arc::new(AmqpBroker::new(config.broker.clone()));
        Self::start_with_broker(config, broker).await
    }

    /// Start with an injected broker implementation (tests, broker-less
    /// local runs).
    pub async fn start_with_broker(config: SyncConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        config.validate()?;

        let table = Arc::new(SiteTable::from_config(&config));
        let channel = Arc::new(CommandChannel::new(broker, config.broker.queue.clone()));

        let transmitters: HashMap<String, Arc<Transmitter>> = config
            .transmitters
            .iter()
            .map(|(name, endpoint)| {
                (
                    name.clone(),
                    Arc::new(Transmitter::spawn(
                        name.clone(),
                        endpoint.clone(),
                        config.origin.clone(),
                    )),
                )
            })
            .collect();

        let dispatcher = Arc::new(Dispatcher::new(
            config.mode(),
            config.confirm,
            config.origin.clone(),
            config.queue_name.clone(),
            table,
            channel,
            transmitters,
        ));

        // Initial connection; later publishes reconnect on their own.
        dispatcher.channel().ensure_connected().await?;
        dispatcher.emit_ready();
        info!(
            mode = ?config.mode(),
            sites = config.transmitters.len(),
            "synchroniser ready"
        );

        let idle_task = config.broker.idle_close_ms.map(|ms| {
            let channel = Arc::clone(dispatcher.channel());
            let idle = std::time::Duration::from_millis(ms.max(1));
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(idle);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    channel.close_if_idle(idle).await;
                }
            })
        });

        Ok(Self {
            dispatcher,
            idle_task,
        })
    }

    /// Filesystem facade. Cheap to call; handles share the dispatcher.
    pub fn fs(&self) -> SyncFs {
        SyncFs::new(Arc::clone(&self.dispatcher))
    }

    /// The command channel, e.g. for an explicit `close()`. Publishes
    /// after a close reconnect transparently.
    pub fn channel(&self) -> &CommandChannel {
        self.dispatcher.channel()
    }

    /// Subscribe to process-wide events (ready, async-mode propagation
    /// failures). Any number of subscribers; publishing never blocks.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.dispatcher.subscribe()
    }

    /// Stop transmitters and close the broker connection.
    pub async fn shutdown(&self) {
        if let Some(task) = &self.idle_task {
            task.abort();
        }
        self.dispatcher.shutdown().await;
    }
}
