//! Per-site transmitter: streams task payloads to the site's receiver over
//! a persistent connection.
//!
//! One worker task owns the connection and a submission-ordered queue.
//! Connection loss is retried after the site's fixed reconnect delay; the
//! task being sent is retried in place so later tasks can never overtake
//! it. A task that keeps failing is abandoned and its completion handle
//! resolves with the error.

use crate::config::TransmitterEndpoint;
use crate::error::{Result, SyncError};
use crate::task::TaskPayload;
use crate::transmit::protocol::{
    self, Ack, Data, Hello, HelloAck, MessageType, TaskEnd, TaskStart, TaskFlags,
    DATA_CHUNK_SIZE,
};
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use xxhash_rust::xxh3::Xxh3;

/// Attempts per task before it is abandoned (each failed attempt waits the
/// reconnect delay).
const MAX_SEND_ATTEMPTS: u32 = 5;

/// A task queued for transfer. `start.payload_len` and the payload flag
/// are filled in by the worker once the payload size is known.
pub struct Outbound {
    pub start: TaskStart,
    pub payload: TaskPayload,
    pub done: oneshot::Sender<Result<()>>,
}

/// Client half of the data plane for one site.
pub struct Transmitter {
    site: String,
    tx: mpsc::UnboundedSender<Outbound>,
    handle: tokio::task::JoinHandle<()>,
}

impl Transmitter {
    /// Spawn the worker for a site. No connection is made until the first
    /// send.
    pub fn spawn(site: impl Into<String>, endpoint: TransmitterEndpoint, origin: String) -> Self {
        let site = site.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            site: site.clone(),
            endpoint,
            origin,
            conn: None,
        };
        let handle = tokio::spawn(worker.run(rx));
        Self { site, tx, handle }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    /// Enqueue a task. Submission order is delivery order. The returned
    /// error only occurs after shutdown.
    pub fn send(&self, outbound: Outbound) -> Result<()> {
        self.tx
            .send(outbound)
            .map_err(|_| SyncError::Transfer(format!("transmitter for {} is gone", self.site)))
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Connection {
    stream: TcpStream,
    max_payload: u64,
}

struct Worker {
    site: String,
    endpoint: TransmitterEndpoint,
    origin: String,
    conn: Option<Connection>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(outbound) = rx.recv().await {
            let result = self.send_task(&outbound).await;
            if let Err(err) = &result {
                warn!(site = %self.site, path = %outbound.start.path, %err, "send abandoned");
            }
            let _ = outbound.done.send(result);
        }
        debug!(site = %self.site, "transmitter worker stopped");
    }

    /// Send one task, reconnecting and retrying in place until it is
    /// delivered, rejected, or abandoned.
    async fn send_task(&mut self, outbound: &Outbound) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            if self.conn.is_none() {
                match self.connect_once().await {
                    Ok(conn) => self.conn = Some(conn),
                    Err(err) => {
                        attempts += 1;
                        if attempts >= MAX_SEND_ATTEMPTS {
                            return Err(err);
                        }
                        debug!(site = %self.site, %err, "connect failed, retrying");
                        tokio::time::sleep(self.endpoint.reconnect_delay()).await;
                        continue;
                    }
                }
            }

            match self.transfer(outbound).await {
                Ok(()) => return Ok(()),
                // The receiver answered; resending the same task would get
                // the same answer.
                Err(err @ SyncError::Oversize { .. }) => return Err(err),
                Err(SyncError::Transfer(msg)) if msg.starts_with("rejected:") => {
                    return Err(SyncError::Transfer(msg));
                }
                Err(err) => {
                    self.conn = None;
                    attempts += 1;
                    if attempts >= MAX_SEND_ATTEMPTS {
                        return Err(err);
                    }
                    debug!(site = %self.site, %err, "transfer failed, reconnecting");
                    tokio::time::sleep(self.endpoint.reconnect_delay()).await;
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<Connection> {
        let addr = self.endpoint.connect_addr();
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| SyncError::Transfer(format!("connect {addr}: {e}")))?;

        let mut hello = Hello::new(self.origin.clone());
        if let Some(storage_root) = &self.endpoint.storage_root {
            hello = hello.with_storage_root(storage_root.to_string_lossy());
        }
        protocol::write_frame(&mut stream, &hello.encode()).await?;
        stream.flush().await?;

        let (msg_type, payload) = protocol::read_frame(&mut stream).await?;
        if msg_type != MessageType::HelloAck {
            return Err(SyncError::Protocol(format!(
                "expected HelloAck, got {msg_type:?}"
            )));
        }
        let ack = HelloAck::decode(payload)?;
        debug!(site = %self.site, %addr, max_payload = ack.max_payload, "connected");

        Ok(Connection {
            stream,
            max_payload: ack.max_payload,
        })
    }

    async fn transfer(&mut self, outbound: &Outbound) -> Result<()> {
        let payload_len = match &outbound.payload {
            TaskPayload::None => 0,
            TaskPayload::Inline(bytes) => bytes.len() as u64,
            TaskPayload::File(path) => tokio::fs::metadata(path)
                .await
                .map_err(|e| SyncError::Transfer(format!("stat {}: {e}", path.display())))?
                .len(),
        };

        let Some(conn) = self.conn.as_mut() else {
            return Err(SyncError::Transfer("not connected".into()));
        };
        if payload_len > conn.max_payload {
            return Err(SyncError::Oversize {
                len: payload_len,
                max: conn.max_payload,
            });
        }

        let mut start = outbound.start.clone();
        start.payload_len = payload_len;
        if !outbound.payload.is_none() {
            start.flags |= TaskFlags::HAS_PAYLOAD;
        }
        protocol::write_frame(&mut conn.stream, &start.encode()).await?;

        let checksum = match &outbound.payload {
            TaskPayload::None => 0,
            TaskPayload::Inline(bytes) => {
                Self::write_chunks(&mut conn.stream, bytes).await?;
                xxhash_rust::xxh3::xxh3_64(bytes)
            }
            TaskPayload::File(path) => {
                Self::write_file(&mut conn.stream, path, payload_len).await?
            }
        };

        protocol::write_frame(&mut conn.stream, &TaskEnd { checksum }.encode()).await?;
        conn.stream.flush().await?;

        let (msg_type, payload) = protocol::read_frame(&mut conn.stream).await?;
        if msg_type != MessageType::Ack {
            return Err(SyncError::Protocol(format!(
                "expected Ack, got {msg_type:?}"
            )));
        }
        let ack = Ack::decode(payload)?;
        if !ack.status.is_accepted() {
            return Err(SyncError::Transfer(format!("rejected: {}", ack.message)));
        }
        debug!(site = %self.site, path = %ack.path, seq = ack.seq, status = ?ack.status, "delivered");
        Ok(())
    }

    async fn write_chunks(stream: &mut TcpStream, bytes: &Bytes) -> Result<()> {
        for chunk in bytes.chunks(DATA_CHUNK_SIZE) {
            let data = Data {
                data: Bytes::copy_from_slice(chunk),
            };
            protocol::write_frame(stream, &data.encode()).await?;
        }
        Ok(())
    }

    /// Stream exactly `expected` bytes from a staged file, returning the
    /// running xxh3 digest.
    async fn write_file(stream: &mut TcpStream, path: &std::path::Path, expected: u64) -> Result<u64> {
        let file = File::open(path)
            .await
            .map_err(|e| SyncError::Transfer(format!("open {}: {e}", path.display())))?;
        let mut reader = BufReader::new(file);
        let mut hasher = Xxh3::new();
        let mut buf = vec![0u8; DATA_CHUNK_SIZE];
        let mut sent = 0u64;

        while sent < expected {
            let want = ((expected - sent) as usize).min(buf.len());
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(SyncError::Transfer(format!(
                    "{} truncated while streaming",
                    path.display()
                )));
            }
            hasher.update(&buf[..n]);
            let data = Data {
                data: Bytes::copy_from_slice(&buf[..n]),
            };
            protocol::write_frame(stream, &data.encode()).await?;
            sent += n as u64;
        }

        Ok(hasher.digest())
    }
}
