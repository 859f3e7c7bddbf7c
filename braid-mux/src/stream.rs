use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use braid_core::{Cmd, Frame, MuxError, Result, StreamId};
use bytes::{Buf, Bytes};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::session::SessionCore;

/// A logical ordered byte channel within a session.
///
/// The stream holds a non-owning handle to the session internals; the
/// session owns the stream for as long as it is registered. Dropping a
/// stream without closing it leaves the registry entry in place until
/// the peer sends FIN or the session closes.
pub struct Stream {
    sid: StreamId,
    max_frame_size: usize,
    session: Weak<SessionCore>,

    inner: Mutex<StreamInner>,
    read_notify: Notify,
    write_notify: Notify,

    /// Peer signaled FUL; our writes wait for EMP.
    paused: AtomicBool,
    /// Peer sent FIN, or the session tore us down.
    rst: AtomicBool,
    /// We sent FIN via `close`.
    local_closed: AtomicBool,
    /// Session died underneath us.
    session_closed: AtomicBool,
    /// A FUL for this stream is outstanding; cleared when the buffer
    /// drains and EMP goes out.
    ful_sent: AtomicBool,

    created_at: Instant,
    enable_stream_buffer: bool,
    max_stream_buffer: usize,
    boost_timeout: std::time::Duration,
}

struct StreamInner {
    buffers: VecDeque<Bytes>,
    /// Total bytes queued across `buffers`.
    buffered: usize,
}

impl Stream {
    pub(crate) fn new(sid: StreamId, core: &Arc<SessionCore>) -> Arc<Self> {
        let config = &core.config;
        Arc::new(Self {
            sid,
            max_frame_size: config.max_frame_size,
            session: Arc::downgrade(core),
            inner: Mutex::new(StreamInner {
                buffers: VecDeque::new(),
                buffered: 0,
            }),
            read_notify: Notify::new(),
            write_notify: Notify::new(),
            paused: AtomicBool::new(false),
            rst: AtomicBool::new(false),
            local_closed: AtomicBool::new(false),
            session_closed: AtomicBool::new(false),
            ful_sent: AtomicBool::new(false),
            created_at: Instant::now(),
            enable_stream_buffer: config.enable_stream_buffer,
            max_stream_buffer: config.max_stream_buffer,
            boost_timeout: config.boost_timeout,
        })
    }

    pub fn sid(&self) -> StreamId {
        self.sid
    }

    /// Whether the peer reset this stream or the session tore it down.
    pub fn is_reset(&self) -> bool {
        self.rst.load(Ordering::Acquire)
    }

    /// Read buffered bytes, blocking until data arrives, the stream
    /// reaches EOF (peer FIN with nothing buffered) or the session dies.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let (n, drained) = self.drain_into(buf);
            if n > 0 {
                if let Some(core) = self.session.upgrade() {
                    core.return_tokens(n);
                    if drained && self.ful_sent.swap(false, Ordering::AcqRel) {
                        let _ = core.write_frame(Frame::new(Cmd::Emp, self.sid)).await;
                    }
                }
                return Ok(n);
            }

            if self.session_closed.load(Ordering::Acquire) {
                return Err(MuxError::BrokenPipe);
            }
            if self.local_closed.load(Ordering::Acquire) {
                return Err(MuxError::BrokenPipe);
            }
            if self.rst.load(Ordering::Acquire) {
                return Ok(0);
            }
            if self.session.upgrade().is_none() {
                return Err(MuxError::BrokenPipe);
            }
            self.read_notify.notified().await;
        }
    }

    fn drain_into(&self, buf: &mut [u8]) -> (usize, bool) {
        let mut inner = self.inner.lock().unwrap();
        let mut n = 0;
        while n < buf.len() {
            let Some(front) = inner.buffers.front_mut() else {
                break;
            };
            let take = front.len().min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&front[..take]);
            front.advance(take);
            n += take;
            if front.is_empty() {
                inner.buffers.pop_front();
            }
        }
        inner.buffered -= n;
        (n, inner.buffered == 0)
    }

    /// Write bytes, split into data frames of at most `max_frame_size`,
    /// honoring the peer's FUL/EMP flow-control signals.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let core = self.session.upgrade().ok_or(MuxError::BrokenPipe)?;
        let mut written = 0;
        for chunk in buf.chunks(self.max_frame_size) {
            loop {
                if self.local_closed.load(Ordering::Acquire)
                    || self.rst.load(Ordering::Acquire)
                    || self.session_closed.load(Ordering::Acquire)
                {
                    return Err(MuxError::BrokenPipe);
                }
                if !self.paused.load(Ordering::Acquire) {
                    break;
                }
                self.write_notify.notified().await;
            }

            let frame =
                Frame::with_payload(Cmd::Psh, self.sid, Bytes::copy_from_slice(chunk));
            written += core.write_frame(frame).await?;
        }
        Ok(written)
    }

    /// Close the stream: send FIN (best effort on a live session) and
    /// drop the registry entry, recycling unread receive credit.
    pub async fn close(&self) -> Result<()> {
        if self.local_closed.swap(true, Ordering::AcqRel) {
            return Err(MuxError::BrokenPipe);
        }
        self.read_notify.notify_one();
        self.write_notify.notify_one();

        let Some(core) = self.session.upgrade() else {
            return Err(MuxError::BrokenPipe);
        };
        if !core.is_closed() {
            let _ = core.write_frame(Frame::new(Cmd::Fin, self.sid)).await;
        }
        core.stream_closed(self.sid);
        Ok(())
    }

    // --- Session-facing hooks ---

    /// Append an inbound payload to the receive buffer.
    pub(crate) fn push_bytes(&self, data: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        inner.buffered += data.len();
        inner.buffers.push_back(data);
    }

    /// Wake one pending reader.
    pub(crate) fn notify_read_event(&self) {
        self.read_notify.notify_one();
    }

    /// Peer reset the stream.
    pub(crate) fn mark_rst(&self) {
        self.rst.store(true, Ordering::Release);
        self.write_notify.notify_one();
    }

    /// Peer's receive buffer for this stream is full.
    pub(crate) fn pause_write(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Peer's receive buffer for this stream drained.
    pub(crate) fn resume_write(&self) {
        self.paused.store(false, Ordering::Release);
        self.write_notify.notify_one();
    }

    /// Bytes received but never consumed; returned to the session
    /// bucket when the stream closes.
    pub(crate) fn recycle_tokens(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.buffered;
        inner.buffered = 0;
        inner.buffers.clear();
        n
    }

    /// Terminal shutdown driven by session close.
    pub(crate) fn session_close(&self) {
        self.session_closed.store(true, Ordering::Release);
        self.rst.store(true, Ordering::Release);
        self.read_notify.notify_one();
        self.write_notify.notify_one();
    }

    /// Whether a FUL should go out for this stream: the buffer sits
    /// above its target and no FUL is outstanding. The boost window
    /// after creation suppresses the signal so short bursts are not
    /// throttled.
    pub(crate) fn take_full_signal(&self) -> bool {
        if !self.enable_stream_buffer {
            return false;
        }
        if self.created_at.elapsed() < self.boost_timeout {
            return false;
        }
        if self.inner.lock().unwrap().buffered <= self.max_stream_buffer {
            return false;
        }
        !self.ful_sent.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("sid", &self.sid)
            .field("rst", &self.rst.load(Ordering::Relaxed))
            .field("paused", &self.paused.load(Ordering::Relaxed))
            .finish()
    }
}
