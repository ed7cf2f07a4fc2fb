//! Writer thread: the only code that touches a session's sink.
//!
//! ```text
//!   FrameConsumer ──dequeue(poll)──▶ FileEncoderSink::write ──▶ … ──▶ close()
//!                                                                    │
//!                               done signal ◀───────────────────────┘
//! ```
//!
//! The sink sits in a slot shared with `finish()`. The thread holds the slot's
//! lock only while writing one frame; `finish()` only takes the lock after a
//! drain timeout, to pull the sink out and close it itself. Writes are
//! therefore never concurrent, and a forced close waits for at most one
//! in-flight frame.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::queue::{Dequeued, FrameConsumer};
use crate::writer::{FileEncoderSink, session_label};

/// What the writer achieved, as seen by `finish()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub path: PathBuf,
    pub frames_written: u64,
    pub write_errors: u64,
    /// `false` when the drain timeout forced the close and queued frames were
    /// abandoned.
    pub drained: bool,
}

struct Shared {
    sink: Mutex<Option<FileEncoderSink>>,
    abort: AtomicBool,
    frames_written: AtomicU64,
    write_errors: AtomicU64,
}

impl Shared {
    /// Pull the sink out of the slot and close it. `None` if someone already
    /// did.
    fn close_sink(&self, session: &str) -> Option<(PathBuf, u64)> {
        let mut sink = self.sink.lock().take()?;
        let frames = sink.frames_written();
        let path = match sink.close() {
            Ok(path) => path,
            Err(e) => {
                error!(session, "Closing sink failed: {e}");
                sink.path().to_path_buf()
            }
        };
        Some((path, frames))
    }
}

pub struct WriterWorker {
    session: String,
    path: PathBuf,
    shared: Arc<Shared>,
    done: Receiver<(PathBuf, u64)>,
    handle: Option<JoinHandle<()>>,
}

impl WriterWorker {
    /// Start the writer thread for `session`. It owns `consumer` and is the
    /// sole writer of `sink` from now on.
    pub fn spawn(
        session: &str,
        sink: FileEncoderSink,
        consumer: FrameConsumer,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let path = sink.path().to_path_buf();
        let shared = Arc::new(Shared {
            sink: Mutex::new(Some(sink)),
            abort: AtomicBool::new(false),
            frames_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        });
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let thread_shared = shared.clone();
        let thread_session = session.to_string();
        // Session ids are opaque; thread names must not contain NUL.
        let spawned = thread::Builder::new()
            .name(format!("framecast-writer-{}", session_label(session)))
            .spawn(move || run(&thread_session, &thread_shared, &consumer, poll_interval, done_tx));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // No writer will ever own this output: remove it.
                if let Some(sink) = shared.sink.lock().take() {
                    sink.discard();
                }
                return Err(e);
            }
        };

        info!(session, "Writer thread started");
        Ok(Self {
            session: session.to_string(),
            path,
            shared,
            done: done_rx,
            handle: Some(handle),
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.shared.frames_written.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.shared.write_errors.load(Ordering::Relaxed)
    }

    /// Wait for the writer to drain a closed queue, at most `timeout`.
    ///
    /// The queue's producer must be closed first, otherwise this always runs
    /// into the timeout. On timeout the writer is told to stop, the sink is
    /// closed here, and the thread is left to exit on its own. In every case
    /// the sink is closed when this returns.
    pub fn finish(mut self, timeout: Duration) -> WorkerReport {
        let (closed, drained) = match self.done.recv_timeout(timeout) {
            Ok(closed) => {
                self.join();
                (Some(closed), true)
            }
            Err(RecvTimeoutError::Disconnected) => {
                // The thread died without signalling (panic in an encoder).
                self.join();
                (self.shared.close_sink(&self.session), true)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.shared.abort.store(true, Ordering::SeqCst);
                match self.shared.close_sink(&self.session) {
                    Some(closed) => {
                        warn!(
                            session = %self.session,
                            timeout_ms = timeout.as_millis() as u64,
                            written = closed.1,
                            "Writer did not drain in time; sink force-closed"
                        );
                        // Detach; it exits on its next dequeue.
                        self.handle.take();
                        (Some(closed), false)
                    }
                    None => {
                        // The writer drained and is closing the sink itself.
                        // Wait for that close, it is the last step.
                        debug!(session = %self.session, "Drain timeout hit while the writer was closing");
                        let closed = self.done.recv().ok();
                        self.join();
                        (closed, true)
                    }
                }
            }
        };

        let (path, frames_written) = closed.unwrap_or_else(|| (self.path.clone(), self.frames_written()));
        WorkerReport {
            path,
            frames_written,
            write_errors: self.write_errors(),
            drained,
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(session = %self.session, "Writer thread panicked");
            }
        }
    }
}

impl Drop for WriterWorker {
    fn drop(&mut self) {
        // Reached only when finish() was never called.
        if self.handle.is_some() {
            self.shared.abort.store(true, Ordering::SeqCst);
            self.shared.close_sink(&self.session);
        }
    }
}

fn run(
    session: &str,
    shared: &Shared,
    consumer: &FrameConsumer,
    poll_interval: Duration,
    done: Sender<(PathBuf, u64)>,
) {
    loop {
        if shared.abort.load(Ordering::SeqCst) {
            debug!(session, "Writer aborted");
            return;
        }

        let frame = match consumer.dequeue(poll_interval) {
            Dequeued::Frame(frame) => frame,
            Dequeued::Empty => continue,
            Dequeued::Closed => break,
        };

        let mut slot = shared.sink.lock();
        let Some(sink) = slot.as_mut() else {
            // Force-closed by finish().
            return;
        };
        match sink.write(&frame) {
            Ok(()) => {
                shared.frames_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                shared.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(session, sequence = frame.sequence(), "Frame write failed: {e}");
            }
        }
    }

    if let Some((path, frames)) = shared.close_sink(session) {
        info!(session, frames, "Writer finished");
        let _ = done.send((path, frames));
    }
}
