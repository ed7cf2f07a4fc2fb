//! Bounded FIFO between the frame-receiving path and the writer thread.
//!
//! ```text
//!   add_frame ──try_enqueue──▶ [ capacity N ] ──dequeue(timeout)──▶ WriterWorker
//! ```
//!
//! Enqueue never blocks: a full queue hands the frame back so the caller can
//! report the drop. Closing is drain-to-completion: frames already queued are
//! still delivered, then the consumer sees `Closed`.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::decode::Frame;

/// Create a queue holding at most `capacity` frames.
///
/// # Panics
/// If `capacity` is zero. The config layer rejects that before we get here.
pub fn bounded(capacity: usize) -> (FrameProducer, FrameConsumer) {
    assert!(capacity > 0, "frame queue capacity must be non-zero");
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (
        FrameProducer { tx, capacity },
        FrameConsumer { rx },
    )
}

/// Why a frame was not enqueued. The frame is handed back untouched.
#[derive(Debug)]
pub enum EnqueueError {
    Full(Frame),
    /// The consumer is gone (writer thread exited).
    Closed(Frame),
}

impl EnqueueError {
    pub fn into_frame(self) -> Frame {
        match self {
            EnqueueError::Full(frame) | EnqueueError::Closed(frame) => frame,
        }
    }
}

/// Result of one `dequeue` attempt.
#[derive(Debug)]
pub enum Dequeued {
    Frame(Frame),
    /// Nothing arrived within the timeout; the queue is still open.
    Empty,
    /// Closed by the producer and fully drained.
    Closed,
}

/// Producer half. Owned by the session recorder.
pub struct FrameProducer {
    tx: Sender<Frame>,
    capacity: usize,
}

impl FrameProducer {
    pub fn try_enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(frame) => EnqueueError::Full(frame),
            TrySendError::Disconnected(frame) => EnqueueError::Closed(frame),
        })
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the queue. Queued frames stay deliverable.
    pub fn close(self) {
        drop(self.tx);
    }
}

/// Consumer half. Owned by the writer thread.
pub struct FrameConsumer {
    rx: Receiver<Frame>,
}

impl FrameConsumer {
    pub fn dequeue(&self, timeout: Duration) -> Dequeued {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Dequeued::Frame(frame),
            Err(RecvTimeoutError::Timeout) => Dequeued::Empty,
            Err(RecvTimeoutError::Disconnected) => Dequeued::Closed,
        }
    }
}
