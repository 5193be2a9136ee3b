//! Wire framing for the icoin P2P protocol.
//!
//! Every frame is a fixed 24-byte header followed by a MessagePack payload:
//!
//! ```text
//! offset 0  : magic        u32 LE   (network id)
//! offset 4  : command      12 bytes (ASCII, NUL-padded)
//! offset 16 : payload_len  u32 LE
//! offset 20 : checksum     u32 LE   (CRC-32 of the payload)
//! offset 24 : payload      payload_len bytes
//! ```
//!
//! The header is written before the body as a separate write. A failure in
//! between leaves the stream desynchronized, so callers must drop the
//! connection on any write error.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use icoin_core::constants::{
    CMD_BROADCAST, CMD_VERSION, COMMAND_SIZE, HEADER_LEN, MAX_PAYLOAD_SIZE, NetId,
};
use icoin_core::error::{FrameError, NetworkError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Commands with a registered payload type.
pub const KNOWN_COMMANDS: [&str; 2] = [CMD_VERSION, CMD_BROADCAST];

/// Returns `true` if `command` maps to a payload type.
pub fn is_known_command(command: &str) -> bool {
    KNOWN_COMMANDS.contains(&command)
}

/// Handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MsgVersion {
    pub version: u32,
    pub user_agent: String,
    /// Sender's clock, seconds since the Unix epoch.
    pub timestamp: i64,
}

/// Free-form text relayed to every peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MsgBroadcast {
    pub content: String,
}

/// A message exchanged between icoin peers.
///
/// The wire identity of a message is its [`command`](Message::command); the
/// body is serialized with named fields so it stays self-describing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(MsgVersion),
    Broadcast(MsgBroadcast),
}

impl Message {
    pub fn broadcast(content: impl Into<String>) -> Self {
        Message::Broadcast(MsgBroadcast {
            content: content.into(),
        })
    }

    /// Build a `version` message stamped with the current time.
    pub fn version(version: u32, user_agent: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Message::Version(MsgVersion {
            version,
            user_agent: user_agent.into(),
            timestamp,
        })
    }

    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => CMD_VERSION,
            Message::Broadcast(_) => CMD_BROADCAST,
        }
    }

    /// Serialize the message body (without header).
    pub fn to_payload(&self) -> Result<Vec<u8>, FrameError> {
        let encoded = match self {
            Message::Version(body) => rmp_serde::to_vec_named(body),
            Message::Broadcast(body) => rmp_serde::to_vec_named(body),
        };
        encoded.map_err(|e| FrameError::PayloadEncode(e.to_string()))
    }

    /// Look up `command` in the command table and deserialize `payload` into
    /// the matching message type.
    pub fn from_payload(command: &str, payload: &[u8]) -> Result<Self, FrameError> {
        let decoded = match command {
            CMD_VERSION => rmp_serde::from_slice(payload).map(Message::Version),
            CMD_BROADCAST => rmp_serde::from_slice(payload).map(Message::Broadcast),
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        };
        decoded.map_err(|e| FrameError::PayloadDecode(e.to_string()))
    }
}

/// The fixed 24-byte frame preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: NetId,
    /// Command name with trailing NULs removed.
    pub command: String,
    pub payload_len: u32,
    pub checksum: u32,
}

impl MessageHeader {
    /// Header describing `payload` sent as `command` on network `magic`.
    ///
    /// Fails with [`FrameError::PayloadTooLarge`] if `payload` exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn new(magic: NetId, command: &str, payload: &[u8]) -> Result<Self, FrameError> {
        let too_large = || FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        };
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(too_large());
        }
        let payload_len = u32::try_from(payload.len()).map_err(|_| too_large())?;
        Ok(Self {
            magic,
            command: command.to_string(),
            payload_len,
            checksum: crc32fast::hash(payload),
        })
    }

    /// Lay the header out on the wire. Commands longer than
    /// [`COMMAND_SIZE`] bytes are truncated.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_u32_le(self.magic.0);
        buf.put_slice(&pad_command(&self.command));
        buf.put_u32_le(self.payload_len);
        buf.put_u32_le(self.checksum);

        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut buf = &bytes[..];
        let magic = NetId(buf.get_u32_le());
        let mut command = [0u8; COMMAND_SIZE];
        buf.copy_to_slice(&mut command);
        let payload_len = buf.get_u32_le();
        let checksum = buf.get_u32_le();

        let end = command.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Self {
            magic,
            command: String::from_utf8_lossy(&command[..end]).into_owned(),
            payload_len,
            checksum,
        }
    }
}

fn pad_command(command: &str) -> [u8; COMMAND_SIZE] {
    let mut out = [0u8; COMMAND_SIZE];
    let bytes = command.as_bytes();
    let n = bytes.len().min(COMMAND_SIZE);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Fill `buf` completely. Unlike `read_exact`, a premature close reports how
/// many bytes arrived, so a clean close between frames (`got == 0`) is
/// distinguishable from a torn frame.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => {
                return Err(FrameError::ShortRead {
                    expected: buf.len(),
                    got: filled,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(FrameError::Io(e.to_string())),
        }
    }
    Ok(())
}

/// Read one complete frame from `reader` and decode it.
///
/// The command is checked against the command table before any payload byte
/// is consumed. On error nothing partial is returned.
pub async fn read_message<R>(reader: &mut R, magic: NetId) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; HEADER_LEN];
    read_full(reader, &mut raw).await?;
    let header = MessageHeader::decode(&raw);
    trace!(?header, "read message header");

    if header.magic != magic {
        return Err(FrameError::MagicMismatch {
            got: header.magic,
            expected: magic,
        });
    }
    if !is_known_command(&header.command) {
        return Err(FrameError::UnknownCommand(header.command));
    }

    let len = header.payload_len as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload).await?;

    let actual = crc32fast::hash(&payload);
    if actual != header.checksum {
        return Err(FrameError::PayloadDecode(format!(
            "checksum mismatch: header {:#010x}, payload {:#010x}",
            header.checksum, actual
        )));
    }

    Message::from_payload(&header.command, &payload)
}

/// Encode `message` for network `magic` and write header then body.
pub async fn write_message<W>(
    writer: &mut W,
    magic: NetId,
    message: &Message,
) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = message.to_payload()?;
    let header = MessageHeader::new(magic, message.command(), &payload)?;
    trace!(?header, "write message header");

    writer
        .write_all(&header.encode())
        .await
        .map_err(|e| NetworkError::Write(format!("header: {e}")))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| NetworkError::Write(format!("payload: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| NetworkError::Write(format!("flush: {e}")))?;
    Ok(())
}
