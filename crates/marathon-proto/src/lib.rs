//! Framed binary protocol for host-guest and node-orchestrator communication.
//!
//! ## Wire Format
//!
//! Every message, on every transport (vsock UDS or TCP/TLS), is one frame:
//!
//! ```text
//! [4B magic "MRTN"][1B type][1B version][2B flags][4B request_id][4B payload_len][payload]
//! ```
//!
//! All integers are big-endian. The 16-byte header is followed by exactly
//! `payload_len` bytes of payload. Within a payload, variable-length fields
//! carry a `u32` length prefix and optional fields a 1-byte presence flag.
//!
//! ## Message Types
//!
//! | Type | Direction | Name               |
//! |------|-----------|--------------------|
//! | 0x01 | N→O       | heartbeat_request  |
//! | 0x02 | O→N       | heartbeat_response |
//! | 0x03 | O→N       | error_response     |
//! | 0x10 | G→H       | vsock_ready        |
//! | 0x11 | H→G       | vsock_start        |
//! | 0x12 | G→H       | vsock_output       |
//! | 0x13 | G→H       | vsock_metrics      |
//! | 0x14 | G→H       | vsock_progress     |
//! | 0x15 | G→H       | vsock_complete     |
//! | 0x16 | G→H       | vsock_error        |
//! | 0x17 | H→G       | vsock_cancel       |
//!
//! (N = node, O = orchestrator, H = host, G = guest.)

mod messages;
mod wire;

pub use messages::{
    Command, CommandType, ErrorResponse, ExecuteRequest, HeartbeatRequest, HeartbeatResponse,
    NodeStatus, OutputEvent, OutputType, TaskResult, UsageMetrics, VsockComplete, VsockError,
    VsockOutput, VsockProgress,
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic, first four bytes of every header.
pub const MAGIC: [u8; 4] = *b"MRTN";

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Size of the heartbeat auth token.
pub const AUTH_TOKEN_SIZE: usize = 32;

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unexpected message type: 0x{0:02X}")]
    UnexpectedMessageType(u8),

    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProtoError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::ConnectionClosed
        } else {
            Self::Io(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;

/// Message type byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HeartbeatRequest = 0x01,
    HeartbeatResponse = 0x02,
    ErrorResponse = 0x03,
    VsockReady = 0x10,
    VsockStart = 0x11,
    VsockOutput = 0x12,
    VsockMetrics = 0x13,
    VsockProgress = 0x14,
    VsockComplete = 0x15,
    VsockError = 0x16,
    VsockCancel = 0x17,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::HeartbeatRequest),
            0x02 => Some(Self::HeartbeatResponse),
            0x03 => Some(Self::ErrorResponse),
            0x10 => Some(Self::VsockReady),
            0x11 => Some(Self::VsockStart),
            0x12 => Some(Self::VsockOutput),
            0x13 => Some(Self::VsockMetrics),
            0x14 => Some(Self::VsockProgress),
            0x15 => Some(Self::VsockComplete),
            0x16 => Some(Self::VsockError),
            0x17 => Some(Self::VsockCancel),
            _ => None,
        }
    }
}

/// A decoded frame: type, correlation id, and raw payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MessageType,
    pub request_id: u32,
    pub payload: Vec<u8>,
}

/// Encode one frame: header + payload, ready to write in a single call.
pub fn encode_frame(msg_type: MessageType, request_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtoError::PayloadTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(msg_type as u8);
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one frame to the transport.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg_type: MessageType,
    request_id: u32,
    payload: &[u8],
) -> Result<()> {
    let buf = encode_frame(msg_type, request_id, payload)?;
    w.write_all(&buf).await?;
    Ok(())
}

/// Read exactly one frame from the transport.
///
/// Consumes no more bytes than one message. Fails with
/// [`ProtoError::InvalidMagic`] if the header does not start with `MRTN` and
/// [`ProtoError::ConnectionClosed`] when fewer than header or payload bytes
/// arrive before EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    r.read_exact(&mut header).await?;

    let magic: [u8; 4] = header
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtoError::ConnectionClosed)?;
    if magic != MAGIC {
        return Err(ProtoError::InvalidMagic(magic));
    }

    let type_byte = header.get(4).copied().unwrap_or_default();
    let msg_type =
        MessageType::from_u8(type_byte).ok_or(ProtoError::UnexpectedMessageType(type_byte))?;

    let request_id = be_u32(&header, 8);
    let payload_len = be_u32(&header, 12) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtoError::PayloadTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload).await?;

    Ok(Frame {
        msg_type,
        request_id,
        payload,
    })
}

/// Read a big-endian `u32` from a header slice; zero when out of bounds
/// (the fixed-size header makes the bounds statically true).
fn be_u32(buf: &[u8], offset: usize) -> u32 {
    buf.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .unwrap_or_default()
}
