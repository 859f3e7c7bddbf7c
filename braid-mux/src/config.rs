use std::time::Duration;

use braid_core::default::{
    DEFAULT_BOOST_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_KEEP_ALIVE_TIMEOUT,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_RECEIVE_BUFFER, DEFAULT_MAX_STREAM_BUFFER,
    DEFAULT_WRITE_REQUEST_QUEUE_SIZE,
};
use braid_core::{MuxError, Result, MAX_PAYLOAD_SIZE};

/// The configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum payload of a single data frame. Stream writes are split
    /// into frames of at most this size.
    pub max_frame_size: usize,
    /// Session-wide receive buffer in bytes; the initial value of the
    /// receive-credit bucket.
    pub max_receive_buffer: usize,
    /// Per-stream receive buffer target; only meaningful when
    /// `enable_stream_buffer` is set.
    pub max_stream_buffer: usize,
    /// Grace period after stream creation before per-stream buffer
    /// signaling kicks in.
    pub boost_timeout: Duration,
    /// Reply ACK to inbound NOP probes and emit FUL/EMP per-stream
    /// buffer signals.
    pub enable_stream_buffer: bool,
    /// Depth of each per-stream outbound write queue.
    pub write_request_queue_size: usize,
    /// Keepalive probe interval.
    pub keep_alive_interval: Duration,
    /// Liveness timeout; the session closes after a full timeout period
    /// without any inbound frame.
    pub keep_alive_timeout: Duration,
    /// Select the single-stage send pipeline, bypassing fair
    /// scheduling. Frames are written in arrival order.
    pub test: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_receive_buffer: DEFAULT_MAX_RECEIVE_BUFFER,
            max_stream_buffer: DEFAULT_MAX_STREAM_BUFFER,
            boost_timeout: DEFAULT_BOOST_TIMEOUT,
            enable_stream_buffer: false,
            write_request_queue_size: DEFAULT_WRITE_REQUEST_QUEUE_SIZE,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            test: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 || self.max_frame_size > MAX_PAYLOAD_SIZE {
            return Err(MuxError::Config(format!(
                "max_frame_size must be within 1..={}",
                MAX_PAYLOAD_SIZE
            )));
        }
        if self.max_receive_buffer == 0 {
            return Err(MuxError::Config(
                "max_receive_buffer must be positive".into(),
            ));
        }
        if self.write_request_queue_size == 0 {
            return Err(MuxError::Config(
                "write_request_queue_size must be positive".into(),
            ));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(MuxError::Config(
                "keep_alive_interval must be positive".into(),
            ));
        }
        if self.keep_alive_timeout <= self.keep_alive_interval {
            return Err(MuxError::Config(
                "keep_alive_timeout must exceed keep_alive_interval".into(),
            ));
        }
        Ok(())
    }
}
