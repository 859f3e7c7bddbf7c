use std::time::Duration;

// Default values for the session configuration

/// The default maximum payload of a single data frame, in bytes. (4KB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4096;
/// The default session-wide receive buffer, in bytes. (4MB)
pub const DEFAULT_MAX_RECEIVE_BUFFER: usize = 4 * 1024 * 1024;
/// The default per-stream receive buffer target, in bytes. (64KB)
pub const DEFAULT_MAX_STREAM_BUFFER: usize = 64 * 1024;
/// The default grace period before per-stream buffer signaling kicks in.
pub const DEFAULT_BOOST_TIMEOUT: Duration = Duration::from_secs(10);

/// The default depth of a per-stream outbound write queue.
pub const DEFAULT_WRITE_REQUEST_QUEUE_SIZE: usize = 32;

/// The default keep-alive probe interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// The default liveness timeout. Must be larger than the probe interval.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// The default capacity of the inbound stream accept queue.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 1024;
