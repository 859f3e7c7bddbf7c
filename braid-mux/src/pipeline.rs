use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use braid_core::{Cmd, Frame, MuxError, StreamId};
use nohash_hasher::IntMap;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

/// A frame on its way to the serializer, paired with the reply channel
/// the submitter is blocked on.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    pub frame: Frame,
    pub reply: oneshot::Sender<Result<usize, MuxError>>,
}

/// Bounded FIFO of pending outbound frames for one stream.
///
/// The classifier is the only producer; both the classifier (rotation)
/// and the scheduler take from the head.
pub(crate) struct StreamQueue {
    deque: Mutex<VecDeque<WriteRequest>>,
    capacity: usize,
    space: Notify,
}

impl StreamQueue {
    fn new(capacity: usize) -> Self {
        Self {
            deque: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            space: Notify::new(),
        }
    }

    pub(crate) fn try_push(&self, request: WriteRequest) -> Result<(), WriteRequest> {
        let mut deque = self.deque.lock().unwrap();
        if deque.len() >= self.capacity {
            return Err(request);
        }
        deque.push_back(request);
        Ok(())
    }

    /// Enqueue, waiting for space when the queue is full.
    pub(crate) async fn push(&self, request: WriteRequest) {
        let mut request = request;
        loop {
            match self.try_push(request) {
                Ok(()) => return,
                Err(back) => {
                    request = back;
                    self.space.notified().await;
                }
            }
        }
    }

    /// Enqueue; when full, evict the head to make room and hand it back
    /// for direct bypass to the serializer. Both moves happen under one
    /// lock so the queue is never observed mid-rotation.
    pub(crate) fn rotate(&self, request: WriteRequest) -> Option<WriteRequest> {
        let mut deque = self.deque.lock().unwrap();
        if deque.len() >= self.capacity {
            let evicted = deque.pop_front();
            deque.push_back(request);
            evicted
        } else {
            deque.push_back(request);
            None
        }
    }

    pub(crate) fn try_pop(&self) -> Option<WriteRequest> {
        let popped = self.deque.lock().unwrap().pop_front();
        if popped.is_some() {
            self.space.notify_one();
        }
        popped
    }
}

/// Shared state of the fair-mode send pipeline.
pub(crate) struct SendPipeline {
    queues: Mutex<IntMap<StreamId, Arc<StreamQueue>>>,
    pending: AtomicUsize,
    queue_capacity: usize,
    serial_tx: mpsc::Sender<WriteRequest>,
    write_notify_tx: mpsc::Sender<()>,
}

impl SendPipeline {
    pub(crate) fn new(
        queue_capacity: usize,
        serial_tx: mpsc::Sender<WriteRequest>,
        write_notify_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            queues: Mutex::new(IntMap::default()),
            pending: AtomicUsize::new(0),
            queue_capacity,
            serial_tx,
            write_notify_tx,
        }
    }

    pub(crate) fn queue_for(&self, sid: StreamId) -> Arc<StreamQueue> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(sid)
            .or_insert_with(|| Arc::new(StreamQueue::new(self.queue_capacity)))
            .clone()
    }

    fn existing_queue(&self, sid: StreamId) -> Option<Arc<StreamQueue>> {
        self.queues.lock().unwrap().get(&sid).cloned()
    }

    fn remove_queue(&self, sid: StreamId) {
        self.queues.lock().unwrap().remove(&sid);
    }

    fn active_sids(&self) -> Vec<StreamId> {
        self.queues.lock().unwrap().keys().copied().collect()
    }

    pub(crate) fn note_enqueued(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn note_forwarded(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Coalescing wakeup for the scheduler: "something changed,
    /// re-check", never a count.
    pub(crate) fn notify_write(&self) {
        let _ = self.write_notify_tx.try_send(());
    }
}

/// Classifier stage. Sorts each submitted request into its per-stream
/// queue or bypasses it straight to the serializer.
pub(crate) async fn run_classifier(
    pipeline: Arc<SendPipeline>,
    mut writes_rx: mpsc::Receiver<WriteRequest>,
    die: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = die.cancelled() => return,
            request = writes_rx.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        let sid = request.frame.sid;
        match request.frame.cmd {
            Cmd::Syn => {
                let queue = pipeline.queue_for(sid);
                tokio::select! {
                    _ = die.cancelled() => return,
                    _ = queue.push(request) => {}
                }
                pipeline.note_enqueued();
                pipeline.notify_write();
            }
            Cmd::Psh => {
                let queue = pipeline.queue_for(sid);
                match queue.rotate(request) {
                    None => pipeline.note_enqueued(),
                    // Evicted head jumps the scheduler; the one
                    // documented reordering window.
                    Some(evicted) => {
                        if pipeline.serial_tx.send(evicted).await.is_err() {
                            return;
                        }
                    }
                }
                pipeline.notify_write();
            }
            Cmd::Fin => match pipeline.existing_queue(sid) {
                Some(queue) => {
                    match queue.rotate(request) {
                        None => pipeline.note_enqueued(),
                        Some(evicted) => {
                            if pipeline.serial_tx.send(evicted).await.is_err() {
                                return;
                            }
                        }
                    }
                    pipeline.notify_write();
                }
                None => {
                    if pipeline.serial_tx.send(request).await.is_err() {
                        return;
                    }
                }
            },
            _ => {
                if pipeline.serial_tx.send(request).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Scheduler stage. On each wakeup, round-robins over the active sids
/// in ascending order, forwarding at most one frame per stream per
/// pass, until nothing is pending.
pub(crate) async fn run_scheduler(
    pipeline: Arc<SendPipeline>,
    mut write_notify_rx: mpsc::Receiver<()>,
    die: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = die.cancelled() => return,
            notified = write_notify_rx.recv() => if notified.is_none() { return },
        }

        while pipeline.pending.load(Ordering::Acquire) > 0 {
            let mut sids = pipeline.active_sids();
            sids.sort_unstable();

            let mut forwarded = 0usize;
            for sid in sids {
                let Some(queue) = pipeline.existing_queue(sid) else {
                    continue;
                };
                if let Some(request) = queue.try_pop() {
                    if matches!(request.frame.cmd, Cmd::Fin) {
                        pipeline.remove_queue(sid);
                    }
                    if pipeline.serial_tx.send(request).await.is_err() {
                        return;
                    }
                    pipeline.note_forwarded();
                    forwarded += 1;
                }
            }
            if forwarded == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(cmd: Cmd, sid: u32) -> WriteRequest {
        let (reply, _rx) = oneshot::channel();
        WriteRequest {
            frame: Frame::with_payload(cmd, StreamId(sid), Bytes::new()),
            reply,
        }
    }

    fn tagged(cmd: Cmd, sid: u32, tag: u8) -> WriteRequest {
        let (reply, _rx) = oneshot::channel();
        WriteRequest {
            frame: Frame::with_payload(cmd, StreamId(sid), Bytes::from(vec![tag])),
            reply,
        }
    }

    #[test]
    fn test_queue_preserves_fifo_order() {
        let queue = StreamQueue::new(4);
        for tag in 0..4u8 {
            assert!(queue.try_push(tagged(Cmd::Psh, 1, tag)).is_ok());
        }
        assert!(queue.try_push(request(Cmd::Psh, 1)).is_err());

        for tag in 0..4u8 {
            let popped = queue.try_pop().unwrap();
            assert_eq!(popped.frame.payload[0], tag);
        }
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_rotate_evicts_head_when_full() {
        let queue = StreamQueue::new(2);
        assert!(queue.rotate(tagged(Cmd::Psh, 1, 0)).is_none());
        assert!(queue.rotate(tagged(Cmd::Psh, 1, 1)).is_none());

        let evicted = queue.rotate(tagged(Cmd::Psh, 1, 2)).unwrap();
        assert_eq!(evicted.frame.payload[0], 0);

        assert_eq!(queue.try_pop().unwrap().frame.payload[0], 1);
        assert_eq!(queue.try_pop().unwrap().frame.payload[0], 2);
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_scheduler_serves_sids_in_sorted_rounds() {
        let (serial_tx, mut serial_rx) = mpsc::channel(256);
        let (write_notify_tx, write_notify_rx) = mpsc::channel(1);
        let pipeline = Arc::new(SendPipeline::new(16, serial_tx, write_notify_tx));

        // Populate three contending streams before the scheduler runs.
        for sid in [5u32, 3, 7] {
            let queue = pipeline.queue_for(StreamId(sid));
            for _ in 0..10 {
                assert!(queue.try_push(request(Cmd::Psh, sid)).is_ok());
                pipeline.note_enqueued();
            }
        }
        pipeline.notify_write();

        let die = CancellationToken::new();
        let scheduler = tokio::spawn(run_scheduler(pipeline.clone(), write_notify_rx, die.clone()));

        let mut order = Vec::new();
        for _ in 0..30 {
            order.push(serial_rx.recv().await.unwrap().frame.sid.id());
        }

        // Every pass serves each non-empty queue exactly once, lowest
        // sid first.
        for round in order.chunks(3) {
            assert_eq!(round, &[3, 5, 7]);
        }

        die.cancel();
        scheduler.await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_removes_queue_on_fin() {
        let (serial_tx, mut serial_rx) = mpsc::channel(256);
        let (write_notify_tx, write_notify_rx) = mpsc::channel(1);
        let pipeline = Arc::new(SendPipeline::new(16, serial_tx, write_notify_tx));

        let queue = pipeline.queue_for(StreamId(2));
        assert!(queue.try_push(request(Cmd::Psh, 2)).is_ok());
        pipeline.note_enqueued();
        assert!(queue.try_push(request(Cmd::Fin, 2)).is_ok());
        pipeline.note_enqueued();
        pipeline.notify_write();

        let die = CancellationToken::new();
        let scheduler = tokio::spawn(run_scheduler(pipeline.clone(), write_notify_rx, die.clone()));

        assert_eq!(serial_rx.recv().await.unwrap().frame.cmd, Cmd::Psh);
        assert_eq!(serial_rx.recv().await.unwrap().frame.cmd, Cmd::Fin);

        // The FIN dequeue tore the queue down.
        assert!(pipeline.existing_queue(StreamId(2)).is_none());

        die.cancel();
        scheduler.await.unwrap();
    }

    #[tokio::test]
    async fn test_classifier_bypasses_control_frames() {
        let (serial_tx, mut serial_rx) = mpsc::channel(8);
        let (write_notify_tx, _write_notify_rx) = mpsc::channel(1);
        let (writes_tx, writes_rx) = mpsc::channel(1);
        let pipeline = Arc::new(SendPipeline::new(4, serial_tx, write_notify_tx));

        let die = CancellationToken::new();
        let classifier = tokio::spawn(run_classifier(pipeline.clone(), writes_rx, die.clone()));

        writes_tx.send(request(Cmd::Nop, 0)).await.unwrap();
        let forwarded = serial_rx.recv().await.unwrap();
        assert_eq!(forwarded.frame.cmd, Cmd::Nop);
        // Control frames never enter a per-stream queue.
        assert!(pipeline.existing_queue(StreamId(0)).is_none());

        die.cancel();
        classifier.await.unwrap();
    }
}
