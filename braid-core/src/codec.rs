use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::MuxError;
use crate::frame::{Cmd, Frame, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::stream::StreamId;

/// A codec for encoding and decoding frames.
///
/// Decoded payloads are carved out of the shared read buffer without
/// copying; they stay valid for as long as the returned `Bytes` handle
/// is held.
pub struct FrameCodec {
    state: DecodeState,
}

#[derive(Clone, Copy)]
enum DecodeState {
    ReadingHeader,
    ReadingPayload {
        cmd: Cmd,
        sid: StreamId,
        remaining: usize,
    },
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::ReadingHeader,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        loop {
            match self.state {
                DecodeState::ReadingHeader => {
                    if src.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let mut header = src.split_to(HEADER_SIZE);
                    let ver = header.get_u8();
                    if ver != PROTOCOL_VERSION {
                        return Err(MuxError::InvalidProtocol {
                            expected: PROTOCOL_VERSION,
                            found: ver,
                        });
                    }
                    let cmd = Cmd::from(header.get_u8());
                    let remaining = header.get_u16_le() as usize;
                    let sid = StreamId(header.get_u32_le());

                    self.state = DecodeState::ReadingPayload {
                        cmd,
                        sid,
                        remaining,
                    };
                }

                DecodeState::ReadingPayload {
                    cmd,
                    sid,
                    remaining,
                } => {
                    if src.len() < remaining {
                        src.reserve(remaining - src.len());
                        return Ok(None);
                    }

                    let payload = src.split_to(remaining).freeze();
                    self.state = DecodeState::ReadingHeader;
                    return Ok(Some(Frame {
                        ver: PROTOCOL_VERSION,
                        cmd,
                        sid,
                        payload,
                    }));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(MuxError::OversizedPayload(frame.payload.len()));
        }
        frame.encode_to(dst);
        Ok(())
    }
}
