// Frame codec module
pub mod codec;
// Session identity module
pub mod connection;
// Default configuration values
pub mod default;
// Error taxonomy
pub mod error;
// Wire frame module
pub mod frame;
// Stream ID type
pub mod stream;

pub use codec::FrameCodec;
pub use connection::SessionId;
pub use error::{MuxError, Result};
pub use frame::{Cmd, Frame, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
pub use stream::StreamId;

// The 0 ID is reserved for session-level control frames.
pub const RESERVED_STREAM_ID: StreamId = StreamId(0);
