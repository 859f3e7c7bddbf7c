use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use braid_core::default::DEFAULT_ACCEPT_BACKLOG;
use braid_core::{
    Cmd, Frame, FrameCodec, MuxError, Result, SessionId, StreamId, RESERVED_STREAM_ID,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nohash_hasher::IntMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::config::SessionConfig;
use crate::pipeline::{run_classifier, run_scheduler, SendPipeline, WriteRequest};
use crate::stream::Stream;

/// Capacity of the serializer's inbound frame channel.
const SERIALIZER_QUEUE_CAPACITY: usize = 32;

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// Session side, client or server
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SessionSide {
    /// The session dialed the transport.
    Client,
    /// The session accepted the transport.
    Server,
}

impl SessionSide {
    pub fn is_client(self) -> bool {
        self == SessionSide::Client
    }

    pub fn is_server(self) -> bool {
        self == SessionSide::Server
    }
}

/// Local stream id allocation. Clients issue odd ids starting at 1,
/// servers even ids starting at 2; id 0 stays reserved for control
/// frames. Once the id space wraps, `go_away` latches and every later
/// allocation fails.
struct SidAllocator {
    next: u32,
    go_away: bool,
}

impl SidAllocator {
    fn new(side: SessionSide) -> Self {
        let next = match side {
            SessionSide::Client => 1,
            SessionSide::Server => 2,
        };
        Self {
            next,
            go_away: false,
        }
    }

    fn allocate(&mut self) -> Result<StreamId> {
        if self.go_away {
            return Err(MuxError::GoAway);
        }
        let sid = self.next;
        let advanced = sid.wrapping_add(2);
        // Wraparound: the post-increment value falls below the
        // pre-increment value.
        if advanced < sid {
            self.go_away = true;
            return Err(MuxError::GoAway);
        }
        self.next = advanced;
        Ok(StreamId(sid))
    }
}

/// Shared session state. Streams hold a `Weak` reference to this; the
/// session tasks hold `Arc`s.
pub(crate) struct SessionCore {
    pub(crate) config: SessionConfig,
    session_id: SessionId,
    side: SessionSide,

    /// Entry point of the send pipeline.
    writes_tx: mpsc::Sender<WriteRequest>,

    /// Session-wide receive credit in bytes. The receive loop pauses
    /// while this is non-positive.
    pub(crate) bucket: AtomicI32,
    bucket_notify_tx: mpsc::Sender<()>,

    /// All live streams of this session.
    streams: Mutex<IntMap<StreamId, Arc<Stream>>>,
    sids: Mutex<SidAllocator>,

    die: CancellationToken,
    closed: AtomicBool,

    /// Flag set on every inbound frame, consumed by the liveness check.
    data_ready: AtomicBool,

    rtt_sn: AtomicU32,
    rtt_probe_at: Mutex<Instant>,
    rtt: Mutex<Option<Duration>>,

    accept_deadline: Mutex<Option<Instant>>,
}

impl SessionCore {
    pub(crate) fn is_closed(&self) -> bool {
        self.die.is_cancelled()
    }

    /// Tear the session down. Single-shot; later calls fail with
    /// `BrokenPipe`. The serializer closes the transport on its way out.
    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(MuxError::BrokenPipe);
        }
        tracing::info!(session = %self.session_id, "session closing");
        self.die.cancel();

        let streams: Vec<Arc<Stream>> = self.streams.lock().unwrap().values().cloned().collect();
        for stream in streams {
            stream.session_close();
        }
        self.notify_bucket();
        Ok(())
    }

    /// Coalescing wakeup for a receive loop stalled on credit.
    pub(crate) fn notify_bucket(&self) {
        let _ = self.bucket_notify_tx.try_send(());
    }

    /// Credit returned by a stream after its consumer read bytes.
    pub(crate) fn return_tokens(&self, n: usize) {
        if self.bucket.fetch_add(n as i32, Ordering::AcqRel) + n as i32 > 0 {
            self.notify_bucket();
        }
    }

    /// A stream is done: recycle its unread credit and drop it from the
    /// registry, atomically under the registry lock.
    pub(crate) fn stream_closed(&self, sid: StreamId) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(stream) = streams.remove(&sid) {
            let n = stream.recycle_tokens();
            if n > 0 && self.bucket.fetch_add(n as i32, Ordering::AcqRel) + n as i32 > 0 {
                self.notify_bucket();
            }
            tracing::debug!(session = %self.session_id, %sid, "stream closed and removed");
        }
    }

    /// Submit a frame and wait for the serializer's report. Returns the
    /// number of payload bytes written.
    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<usize> {
        let (reply, reply_rx) = oneshot::channel();
        let request = WriteRequest { frame, reply };
        tokio::select! {
            _ = self.die.cancelled() => return Err(MuxError::BrokenPipe),
            sent = self.writes_tx.send(request) => {
                if sent.is_err() {
                    return Err(MuxError::BrokenPipe);
                }
            }
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(MuxError::BrokenPipe),
        }
    }

    /// Send one keepalive probe and remember when it left.
    async fn send_ping(&self) {
        *self.rtt_probe_at.lock().unwrap() = Instant::now();
        let sn = self.rtt_sn.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.write_frame(Frame::new(Cmd::Nop, StreamId(sn))).await;
        self.notify_bucket();
    }
}

/// A multiplexed session bound to one reliable transport.
pub struct Session {
    core: Arc<SessionCore>,
    accept_rx: mpsc::Receiver<Arc<Stream>>,
    _tasks: Vec<AbortOnDropHandle<()>>,
}

impl Session {
    /// Create a client session over the transport. Clients issue odd
    /// stream ids.
    pub fn client<T>(transport: T, config: SessionConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(transport, config, SessionSide::Client)
    }

    /// Create a server session over the transport. Servers issue even
    /// stream ids.
    pub fn server<T>(transport: T, config: SessionConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(transport, config, SessionSide::Server)
    }

    fn spawn<T>(transport: T, config: SessionConfig, side: SessionSide) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;

        let (read_half, write_half) = tokio::io::split(transport);
        let framed_reader = FramedRead::new(read_half, FrameCodec::new());
        let framed_writer = FramedWrite::new(write_half, FrameCodec::new());

        let (writes_tx, writes_rx) = mpsc::channel(1);
        let (bucket_notify_tx, bucket_notify_rx) = mpsc::channel(1);
        let (accept_tx, accept_rx) = mpsc::channel(DEFAULT_ACCEPT_BACKLOG);
        let die = CancellationToken::new();
        let session_id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));

        let core = Arc::new(SessionCore {
            bucket: AtomicI32::new(config.max_receive_buffer as i32),
            config,
            session_id,
            side,
            writes_tx,
            bucket_notify_tx,
            streams: Mutex::new(IntMap::default()),
            sids: Mutex::new(SidAllocator::new(side)),
            die: die.clone(),
            closed: AtomicBool::new(false),
            data_ready: AtomicBool::new(false),
            rtt_sn: AtomicU32::new(0),
            rtt_probe_at: Mutex::new(Instant::now()),
            rtt: Mutex::new(None),
            accept_deadline: Mutex::new(None),
        });

        let mut tasks = Vec::new();
        let mut spawn_task = |fut: futures::future::BoxFuture<'static, ()>| {
            tasks.push(AbortOnDropHandle::new(tokio::spawn(fut)));
        };

        if core.config.test {
            // Single-stage pipeline: arrival order, no fairness.
            spawn_task(Box::pin(serialize_loop(
                core.clone(),
                framed_writer,
                writes_rx,
            )));
        } else {
            let (serial_tx, serial_rx) = mpsc::channel(SERIALIZER_QUEUE_CAPACITY);
            let (write_notify_tx, write_notify_rx) = mpsc::channel(1);
            let pipeline = Arc::new(SendPipeline::new(
                core.config.write_request_queue_size,
                serial_tx,
                write_notify_tx,
            ));
            spawn_task(Box::pin(run_classifier(
                pipeline.clone(),
                writes_rx,
                die.clone(),
            )));
            spawn_task(Box::pin(run_scheduler(pipeline, write_notify_rx, die)));
            spawn_task(Box::pin(serialize_loop(
                core.clone(),
                framed_writer,
                serial_rx,
            )));
        }

        spawn_task(Box::pin(recv_loop(
            core.clone(),
            framed_reader,
            bucket_notify_rx,
            accept_tx,
        )));
        spawn_task(Box::pin(keepalive_loop(core.clone())));

        tracing::debug!(session = %session_id, ?side, "session started");

        Ok(Session {
            core,
            accept_rx,
            _tasks: tasks,
        })
    }

    /// Open a new outbound stream.
    pub async fn open_stream(&self) -> Result<Arc<Stream>> {
        if self.core.is_closed() {
            return Err(MuxError::BrokenPipe);
        }

        let sid = self.core.sids.lock().unwrap().allocate()?;
        let stream = Stream::new(sid, &self.core);

        // SYN first; a submit failure must leave no registry entry.
        self.core.write_frame(Frame::new(Cmd::Syn, sid)).await?;

        self.core.streams.lock().unwrap().insert(sid, stream.clone());
        tracing::debug!(session = %self.core.session_id, %sid, "stream opened");
        Ok(stream)
    }

    /// Block until the peer opens a stream, the accept deadline passes
    /// or the session dies.
    pub async fn accept_stream(&mut self) -> Result<Arc<Stream>> {
        let deadline = *self.core.accept_deadline.lock().unwrap();
        let accepted = match deadline {
            Some(at) => tokio::select! {
                _ = self.core.die.cancelled() => return Err(MuxError::BrokenPipe),
                outcome = tokio::time::timeout_at(at, self.accept_rx.recv()) => match outcome {
                    Ok(accepted) => accepted,
                    Err(_) => return Err(MuxError::Timeout),
                },
            },
            None => tokio::select! {
                _ = self.core.die.cancelled() => return Err(MuxError::BrokenPipe),
                accepted = self.accept_rx.recv() => accepted,
            },
        };
        let stream = accepted.ok_or(MuxError::BrokenPipe)?;
        tracing::debug!(session = %self.core.session_id, sid = %stream.sid(), "stream accepted");
        Ok(stream)
    }

    /// Close the session and every stream on it.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Number of currently registered streams; 0 once closed.
    pub fn num_streams(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.core.streams.lock().unwrap().len()
    }

    /// Deadline for `accept_stream`. `None` disables it.
    pub fn set_accept_deadline(&self, deadline: Option<Instant>) {
        *self.core.accept_deadline.lock().unwrap() = deadline;
    }

    /// Latest round-trip sample from the keepalive probes. Best-effort
    /// telemetry; `None` until the first ACK arrives.
    pub fn rtt(&self) -> Option<Duration> {
        *self.core.rtt.lock().unwrap()
    }

    /// Submit a control frame with an application-defined command and
    /// sid 0. Returns the number of payload bytes written.
    pub async fn write_custom_cmd(&self, cmd: u8, payload: Bytes) -> Result<usize> {
        if self.core.is_closed() {
            return Err(MuxError::BrokenPipe);
        }
        let frame = Frame::with_payload(Cmd::from(cmd), RESERVED_STREAM_ID, payload);
        self.core.write_frame(frame).await
    }

    pub fn session_id(&self) -> SessionId {
        self.core.session_id
    }

    pub fn side(&self) -> SessionSide {
        self.core.side
    }
}

/// Receive loop: reads frames while receive credit is available and
/// dispatches them by command. Any transport or protocol error is fatal
/// to the session.
async fn recv_loop<R>(
    core: Arc<SessionCore>,
    mut framed: FramedRead<R, FrameCodec>,
    mut bucket_notify_rx: mpsc::Receiver<()>,
    accept_tx: mpsc::Sender<Arc<Stream>>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        // Credit gate: hold off reading while the bucket is drained.
        while core.bucket.load(Ordering::Acquire) <= 0 && !core.is_closed() {
            tokio::select! {
                _ = core.die.cancelled() => return,
                _ = bucket_notify_rx.recv() => {}
            }
        }

        let frame = tokio::select! {
            _ = core.die.cancelled() => return,
            next = framed.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::error!(session = %core.session_id, error = %e, "fatal receive error");
                    let _ = core.close();
                    return;
                }
                None => {
                    tracing::debug!(session = %core.session_id, "transport closed by peer");
                    let _ = core.close();
                    return;
                }
            },
        };

        core.data_ready.store(true, Ordering::Release);

        match frame.cmd {
            Cmd::Nop => {
                if core.config.enable_stream_buffer {
                    let _ = core.write_frame(Frame::new(Cmd::Ack, frame.sid)).await;
                }
            }
            Cmd::Ack => {
                if frame.sid.id() == core.rtt_sn.load(Ordering::Acquire) {
                    let probe_at = *core.rtt_probe_at.lock().unwrap();
                    let sample = probe_at.elapsed().max(Duration::from_nanos(1));
                    *core.rtt.lock().unwrap() = Some(sample);
                }
            }
            Cmd::Syn => {
                if frame.sid == RESERVED_STREAM_ID {
                    // Control-plane sid, never a stream.
                    continue;
                }
                let admitted = {
                    let mut streams = core.streams.lock().unwrap();
                    if streams.contains_key(&frame.sid) {
                        // Duplicate SYN
                        None
                    } else {
                        let stream = Stream::new(frame.sid, &core);
                        streams.insert(frame.sid, stream.clone());
                        Some(stream)
                    }
                };
                if let Some(stream) = admitted {
                    tracing::debug!(session = %core.session_id, sid = %frame.sid, "inbound stream admitted");
                    tokio::select! {
                        // Dying session: admission discarded.
                        _ = core.die.cancelled() => {}
                        _ = accept_tx.send(stream) => {}
                    }
                }
            }
            Cmd::Psh => {
                let len = frame.payload.len() as i32;
                let mut signal_full = false;
                {
                    let streams = core.streams.lock().unwrap();
                    if let Some(stream) = streams.get(&frame.sid) {
                        core.bucket.fetch_sub(len, Ordering::AcqRel);
                        stream.push_bytes(frame.payload);
                        stream.notify_read_event();
                        signal_full = stream.take_full_signal();
                    }
                    // Unknown sid: drop the payload, keep the credit.
                }
                if signal_full {
                    let _ = core.write_frame(Frame::new(Cmd::Ful, frame.sid)).await;
                }
            }
            Cmd::Fin => {
                let streams = core.streams.lock().unwrap();
                if let Some(stream) = streams.get(&frame.sid) {
                    stream.mark_rst();
                    stream.notify_read_event();
                }
            }
            Cmd::Ful => {
                let streams = core.streams.lock().unwrap();
                if let Some(stream) = streams.get(&frame.sid) {
                    stream.pause_write();
                }
            }
            Cmd::Emp => {
                let streams = core.streams.lock().unwrap();
                if let Some(stream) = streams.get(&frame.sid) {
                    stream.resume_write();
                    stream.notify_read_event();
                }
            }
            Cmd::Unknown(byte) => {
                tracing::error!(
                    session = %core.session_id,
                    error = %MuxError::UnknownCommand(byte),
                    "fatal receive error"
                );
                let _ = core.close();
                return;
            }
        }
    }
}

/// Serializer: the only writer on the transport. Encodes each frame,
/// flushes it as one contiguous write and reports back to the
/// submitter.
async fn serialize_loop<W>(
    core: Arc<SessionCore>,
    mut framed: FramedWrite<W, FrameCodec>,
    mut serial_rx: mpsc::Receiver<WriteRequest>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let request = tokio::select! {
            _ = core.die.cancelled() => break,
            request = serial_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let n = request.frame.payload.len();
        match framed.send(request.frame).await {
            Ok(()) => {
                let _ = request.reply.send(Ok(n));
            }
            Err(e) => {
                tracing::error!(session = %core.session_id, error = %e, "transport write failed");
                let _ = request.reply.send(Err(e));
                let _ = core.close();
                break;
            }
        }
    }

    // Sole owner of the write half; this is the one transport close.
    if let Err(e) = framed.close().await {
        tracing::warn!(session = %core.session_id, error = %e, "error closing transport writer");
    }
}

/// Keepalive: probe on every interval tick, kill the session on a full
/// timeout period without inbound frames.
async fn keepalive_loop(core: Arc<SessionCore>) {
    let start = Instant::now();
    let mut ping = interval_at(
        start + core.config.keep_alive_interval,
        core.config.keep_alive_interval,
    );
    let mut timeout = interval_at(
        start + core.config.keep_alive_timeout,
        core.config.keep_alive_timeout,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timeout.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Startup probe; also seeds the first RTT sample.
    core.send_ping().await;

    loop {
        tokio::select! {
            _ = core.die.cancelled() => return,
            _ = ping.tick() => {
                core.send_ping().await;
            }
            _ = timeout.tick() => {
                if !core.data_ready.swap(false, Ordering::AcqRel) {
                    tracing::warn!(session = %core.session_id, "keepalive timeout, closing session");
                    let _ = core.close();
                    return;
                }
            }
        }
    }
}
