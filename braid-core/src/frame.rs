use bytes::{BufMut, Bytes, BytesMut};

use crate::stream::StreamId;

/// Latest protocol version. A decoded frame carrying any other value is
/// rejected as `InvalidProtocol`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed size of the frame header in bytes.
/// Consists of:
/// - version: u8 (1 byte)
/// - command: u8 (1 byte)
/// - length: u16 little-endian (2 bytes)
/// - stream_id: u32 little-endian (4 bytes)
pub const HEADER_SIZE: usize = 8;

/// Largest payload a single frame can carry, bounded by the 16-bit
/// length field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Frame commands.
///
/// Bytes outside the known set decode to `Unknown` and are carried
/// through untouched; the session treats them as fatal on receive, but
/// they are the vehicle for custom control extensions on send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cmd {
    /// Open a stream.
    Syn,
    /// Close a stream.
    Fin,
    /// Data for a stream.
    Psh,
    /// Keepalive / RTT probe.
    Nop,
    /// Probe reply, echoing the probe's sid.
    Ack,
    /// Peer's receive buffer for this stream is full.
    Ful,
    /// Peer's receive buffer for this stream drained.
    Emp,
    Unknown(u8),
}

impl From<u8> for Cmd {
    fn from(value: u8) -> Self {
        match value {
            0 => Cmd::Syn,
            1 => Cmd::Fin,
            2 => Cmd::Psh,
            3 => Cmd::Nop,
            4 => Cmd::Ack,
            5 => Cmd::Ful,
            6 => Cmd::Emp,
            other => Cmd::Unknown(other),
        }
    }
}

impl From<Cmd> for u8 {
    fn from(cmd: Cmd) -> Self {
        match cmd {
            Cmd::Syn => 0,
            Cmd::Fin => 1,
            Cmd::Psh => 2,
            Cmd::Nop => 3,
            Cmd::Ack => 4,
            Cmd::Ful => 5,
            Cmd::Emp => 6,
            Cmd::Unknown(other) => other,
        }
    }
}

/// The frame structure that is sent between the peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ver: u8,
    pub cmd: Cmd,
    pub sid: StreamId,
    pub payload: Bytes,
}

impl Frame {
    /// Create a control frame with no payload.
    pub fn new(cmd: Cmd, sid: StreamId) -> Self {
        Self {
            ver: PROTOCOL_VERSION,
            cmd,
            sid,
            payload: Bytes::new(),
        }
    }

    /// Create a frame carrying a payload.
    pub fn with_payload(cmd: Cmd, sid: StreamId, payload: Bytes) -> Self {
        Self {
            ver: PROTOCOL_VERSION,
            cmd,
            sid,
            payload,
        }
    }

    /// Length of the frame on the wire, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize header and payload into one contiguous buffer.
    ///
    /// The caller is responsible for the payload fitting the length
    /// field; the codec enforces it on the send path.
    pub fn encode_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.ver);
        dst.put_u8(self.cmd.into());
        dst.put_u16_le(self.payload.len() as u16);
        dst.put_u32_le(self.sid.0);
        dst.extend_from_slice(&self.payload);
    }
}
