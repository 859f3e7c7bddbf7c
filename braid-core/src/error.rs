use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxError {
    /// Operation attempted on a dead session or a closed stream.
    #[error("broken pipe")]
    BrokenPipe,

    /// The local stream id space is exhausted; existing streams keep
    /// working but no new stream can be opened on this session.
    #[error("stream id exhausted, open a new session")]
    GoAway,

    /// Version byte of a decoded frame did not match ours. Fatal.
    #[error("invalid protocol version: expected {expected}, found {found}")]
    InvalidProtocol { expected: u8, found: u8 },

    /// Accept deadline exceeded.
    #[error("accept deadline exceeded")]
    Timeout,

    /// Decoded command outside the known set. Fatal.
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),

    /// Payload does not fit the 16-bit length field of the wire header.
    #[error("payload of {0} bytes exceeds the wire frame limit")]
    OversizedPayload(usize),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Read or write on the underlying transport failed. Fatal.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MuxError>;
