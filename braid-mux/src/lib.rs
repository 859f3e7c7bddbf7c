// Session configuration
pub mod config;
// Session module
pub mod session;
// Stream module
pub mod stream;

// Outbound fair-scheduling stage
mod pipeline;

pub use braid_core::{Cmd, Frame, MuxError, Result, SessionId, StreamId};
pub use braid_core::{PROTOCOL_VERSION, RESERVED_STREAM_ID};

pub use crate::config::SessionConfig;
pub use crate::session::{Session, SessionSide};
pub use crate::stream::Stream;
