//! Wire protocol for the transmitter/receiver data plane.
//!
//! Frame format: len:u32 | type:u8 | payload. All multi-byte integers are
//! big-endian; strings are length-prefixed (u16 len + UTF-8). One task is
//! in flight per connection at a time: TASK_START, zero or more DATA
//! chunks, TASK_END, then a single ACK from the receiver.

use crate::error::{Result, SyncError};
use crate::task::OperationKind;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum frame size (16MB) - prevents OOM from malicious/corrupted frames.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Payload chunk size for DATA frames.
pub const DATA_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    HelloAck = 0x02,
    TaskStart = 0x03,
    Data = 0x04,
    TaskEnd = 0x05,
    Ack = 0x06,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::HelloAck),
            0x03 => Some(Self::TaskStart),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::TaskEnd),
            0x06 => Some(Self::Ack),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskFlags: u8 {
        const REPLACE = 1 << 0;
        const SOURCE_IN_SITE = 1 << 1;
        const DIR = 1 << 2;
        const HAS_SRC = 1 << 3;
        const HAS_PAYLOAD = 1 << 4;
    }
}

fn op_to_u8(op: OperationKind) -> u8 {
    match op {
        OperationKind::Write => 1,
        OperationKind::Append => 2,
        OperationKind::Copy => 3,
        OperationKind::Move => 4,
        OperationKind::Rename => 5,
        OperationKind::MkdirTree => 6,
        OperationKind::Symlink => 7,
        OperationKind::Unlink => 8,
        OperationKind::StreamWrite => 9,
    }
}

fn op_from_u8(b: u8) -> Option<OperationKind> {
    match b {
        1 => Some(OperationKind::Write),
        2 => Some(OperationKind::Append),
        3 => Some(OperationKind::Copy),
        4 => Some(OperationKind::Move),
        5 => Some(OperationKind::Rename),
        6 => Some(OperationKind::MkdirTree),
        7 => Some(OperationKind::Symlink),
        8 => Some(OperationKind::Unlink),
        9 => Some(OperationKind::StreamWrite),
        _ => None,
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn str_len(s: &str) -> usize {
    2 + s.len()
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(SyncError::Protocol(format!("{what} length truncated")));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(SyncError::Protocol(format!("{what} truncated")));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| SyncError::Protocol(format!("invalid UTF-8 in {what}")))
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Hello {
    pub version: u16,
    pub origin: String,
    /// Subdirectory under the receiver's upload root this connection's
    /// tasks land in; empty for the root itself.
    pub storage_root: String,
}

impl Hello {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            origin: origin.into(),
            storage_root: String::new(),
        }
    }

    pub fn with_storage_root(mut self, storage_root: impl Into<String>) -> Self {
        self.storage_root = storage_root.into();
        self
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 2 + str_len(&self.origin) + str_len(&self.storage_root);
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(MessageType::Hello as u8);
        buf.put_u16(self.version);
        put_str(&mut buf, &self.origin);
        put_str(&mut buf, &self.storage_root);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            return Err(SyncError::Protocol("Hello payload too short".into()));
        }
        let version = payload.get_u16();
        let origin = get_str(&mut payload, "Hello origin")?;
        let storage_root = get_str(&mut payload, "Hello storage root")?;
        Ok(Self {
            version,
            origin,
            storage_root,
        })
    }
}

// =============================================================================
// HELLO_ACK (0x02)
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct HelloAck {
    pub version: u16,
    /// The receiving site's payload limit, so the transmitter can fail
    /// oversized sends before streaming anything.
    pub max_payload: u64,
}

impl HelloAck {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 10);
        buf.put_u32(10);
        buf.put_u8(MessageType::HelloAck as u8);
        buf.put_u16(self.version);
        buf.put_u64(self.max_payload);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 10 {
            return Err(SyncError::Protocol("HelloAck payload too short".into()));
        }
        Ok(Self {
            version: payload.get_u16(),
            max_payload: payload.get_u64(),
        })
    }
}

// =============================================================================
// TASK_START (0x03)
// =============================================================================

/// Task announcement. `path` is always the mutated, site-relative path the
/// receiver sequences on; `src` is the secondary path when the operation
/// has one (rename/copy source, symlink target). Content, when present,
/// flows src -> path.
#[derive(Debug, Clone)]
pub struct TaskStart {
    pub op: OperationKind,
    pub flags: TaskFlags,
    pub seq: u64,
    pub created_at: i64,
    pub payload_len: u64,
    pub origin: String,
    pub path: String,
    pub src: Option<String>,
    pub description: String,
}

impl TaskStart {
    pub fn encode(&self) -> Bytes {
        let mut flags = self.flags;
        if self.src.is_some() {
            flags |= TaskFlags::HAS_SRC;
        }

        let mut payload_len = 1 + 1 + 8 + 8 + 8 + str_len(&self.origin) + str_len(&self.path);
        if let Some(src) = &self.src {
            payload_len += str_len(src);
        }
        payload_len += str_len(&self.description);

        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(MessageType::TaskStart as u8);
        buf.put_u8(op_to_u8(self.op));
        buf.put_u8(flags.bits());
        buf.put_u64(self.seq);
        buf.put_i64(self.created_at);
        buf.put_u64(self.payload_len);
        put_str(&mut buf, &self.origin);
        put_str(&mut buf, &self.path);
        if let Some(src) = &self.src {
            put_str(&mut buf, src);
        }
        put_str(&mut buf, &self.description);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 26 {
            return Err(SyncError::Protocol("TaskStart payload too short".into()));
        }
        let op = op_from_u8(payload.get_u8())
            .ok_or_else(|| SyncError::Protocol("unknown operation kind".into()))?;
        let flags = TaskFlags::from_bits_truncate(payload.get_u8());
        let seq = payload.get_u64();
        let created_at = payload.get_i64();
        let payload_len = payload.get_u64();
        let origin = get_str(&mut payload, "TaskStart origin")?;
        let path = get_str(&mut payload, "TaskStart path")?;
        let src = if flags.contains(TaskFlags::HAS_SRC) {
            Some(get_str(&mut payload, "TaskStart src")?)
        } else {
            None
        };
        let description = get_str(&mut payload, "TaskStart description")?;

        Ok(Self {
            op,
            flags,
            seq,
            created_at,
            payload_len,
            origin,
            path,
            src,
            description,
        })
    }
}

// =============================================================================
// DATA (0x04)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Data {
    pub data: Bytes,
}

impl Data {
    pub fn encode(&self) -> Bytes {
        let payload_len = 4 + self.data.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(MessageType::Data as u8);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            return Err(SyncError::Protocol("Data payload too short".into()));
        }
        let data_len = payload.get_u32() as usize;
        if payload.remaining() < data_len {
            return Err(SyncError::Protocol("Data content truncated".into()));
        }
        Ok(Self {
            data: payload.copy_to_bytes(data_len),
        })
    }
}

// =============================================================================
// TASK_END (0x05)
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct TaskEnd {
    /// xxh3 over the payload bytes; zero when no payload was sent.
    pub checksum: u64,
}

impl TaskEnd {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 8);
        buf.put_u32(8);
        buf.put_u8(MessageType::TaskEnd as u8);
        buf.put_u64(self.checksum);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 8 {
            return Err(SyncError::Protocol("TaskEnd payload too short".into()));
        }
        Ok(Self {
            checksum: payload.get_u64(),
        })
    }
}

// =============================================================================
// ACK (0x06)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    /// Applied under the storage root.
    Applied = 0,
    /// Held pending a missing predecessor sequence.
    Buffered = 1,
    /// Sequence already seen; no-op.
    Duplicate = 2,
    /// Refused (oversize payload, invalid path, checksum mismatch).
    Rejected = 3,
}

impl AckStatus {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Applied),
            1 => Some(Self::Buffered),
            2 => Some(Self::Duplicate),
            3 => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Whether the transmitter should treat the send as delivered.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, AckStatus::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub path: String,
    pub seq: u64,
    pub status: AckStatus,
    pub message: String,
}

impl Ack {
    pub fn accepted(path: impl Into<String>, seq: u64, status: AckStatus) -> Self {
        Self {
            path: path.into(),
            seq,
            status,
            message: String::new(),
        }
    }

    pub fn rejected(path: impl Into<String>, seq: u64, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            seq,
            status: AckStatus::Rejected,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = str_len(&self.path) + 8 + 1 + str_len(&self.message);
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(MessageType::Ack as u8);
        put_str(&mut buf, &self.path);
        buf.put_u64(self.seq);
        buf.put_u8(self.status as u8);
        put_str(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_str(&mut payload, "Ack path")?;
        if payload.remaining() < 9 {
            return Err(SyncError::Protocol("Ack payload truncated".into()));
        }
        let seq = payload.get_u64();
        let status = AckStatus::from_u8(payload.get_u8())
            .ok_or_else(|| SyncError::Protocol("unknown ack status".into()))?;
        let message = get_str(&mut payload, "Ack message")?;

        Ok(Self {
            path,
            seq,
            status,
            message,
        })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream. Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await?;

    if len > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!(
            "frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }

    let msg_type = r.read_u8().await?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| SyncError::Protocol(format!("unknown message type 0x{msg_type:02x}")))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    Ok(())
}
