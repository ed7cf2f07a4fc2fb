//! Per-session recorder: lifecycle state machine + backpressure policy.
//!
//! ```text
//!   Idle ──first decoded frame──▶ Active ──finalize──▶ Draining ──▶ Closed
//!     └──────────────────────finalize─────────────────────────────────┘
//! ```
//!
//! - The sink, queue and writer thread are created on the first frame that
//!   decodes, because only then are the dimensions known. A session that never
//!   delivers a frame never creates a file.
//! - `add_frame` costs one decode plus one non-blocking enqueue. A full queue
//!   drops the frame and says so (`Dropped`); the caller is never stalled.
//! - `finalize` is the one blocking call, bounded by the drain timeout. Stop,
//!   disconnect and eviction all end up here, and it is idempotent.

use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{MAX_FRAME_RATE, RecorderConfig};
use crate::decode::{self, Dimensions, Frame};
use crate::error::{DecodeError, RecorderError};
use crate::queue::{self, EnqueueError, FrameProducer};
use crate::worker::WriterWorker;
use crate::writer::{EncoderFactory, FileEncoderSink, VideoFormat};

// ── Identity ─────────────────────────────────────────────────────────

/// Opaque identifier handed to us by the transport, stable for the session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Active,
    Draining,
    Closed,
}

/// Per-frame result of `add_frame`.
#[derive(Debug)]
pub enum FrameOutcome {
    /// Queued for writing. `accepted` counts accepted frames of the session,
    /// this one included.
    Accepted { sequence: u64, accepted: u64 },
    Dropped(DropReason),
}

impl FrameOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FrameOutcome::Accepted { .. })
    }
}

/// Why a frame never reached the queue. The session carries on either way.
#[derive(Debug)]
pub enum DropReason {
    Decode(DecodeError),
    DimensionMismatch {
        expected: Dimensions,
        actual: Dimensions,
    },
    /// Backpressure: the writer is behind and the queue is at capacity.
    QueueFull { sequence: u64 },
    /// The writer thread is gone.
    QueueClosed { sequence: u64 },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Decode(e) => write!(f, "decode failed: {e}"),
            DropReason::DimensionMismatch { expected, actual } => {
                write!(f, "frame is {actual}, session records {expected}")
            }
            DropReason::QueueFull { .. } => f.write_str("queue full"),
            DropReason::QueueClosed { .. } => f.write_str("writer stopped"),
        }
    }
}

/// Counters gathered over the life of a session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordingStats {
    pub frames_accepted: u64,
    pub dropped_decode: u64,
    pub dropped_dimension_mismatch: u64,
    pub dropped_queue_full: u64,
    pub dropped_queue_closed: u64,
    pub write_errors: u64,
    pub avg_decode_time: Duration,
    /// From recorder creation to the end of finalize.
    pub duration: Duration,
}

impl RecordingStats {
    pub fn frames_dropped(&self) -> u64 {
        self.dropped_decode
            + self.dropped_dimension_mismatch
            + self.dropped_queue_full
            + self.dropped_queue_closed
    }
}

/// What `finalize` produced for a session that received at least one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recording {
    pub path: PathBuf,
    pub format: VideoFormat,
    pub frames_written: u64,
    pub frames_dropped: u64,
    /// `false` when the drain timeout forced the close: the file is valid but
    /// may miss trailing frames.
    pub drained: bool,
    pub stats: RecordingStats,
}

// ── Recorder ─────────────────────────────────────────────────────────

enum State {
    /// No frame decoded yet. Holds the latest valid frame rate hint.
    Idle { frame_rate: Option<u32> },
    Active(Active),
    Draining,
    Closed(Option<Recording>),
}

struct Active {
    producer: FrameProducer,
    worker: WriterWorker,
    format: VideoFormat,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    dropped_decode: AtomicU64,
    dropped_dimension: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_queue_closed: AtomicU64,
    decodes: AtomicU64,
    decode_nanos: AtomicU64,
}

impl Counters {
    fn record_decode(&self, elapsed: Duration) {
        self.decodes.fetch_add(1, Ordering::Relaxed);
        self.decode_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn avg_decode_time(&self) -> Duration {
        let decodes = self.decodes.load(Ordering::Relaxed);
        if decodes == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.decode_nanos.load(Ordering::Relaxed) / decodes)
    }
}

pub struct SessionRecorder {
    id: SessionId,
    config: Arc<RecorderConfig>,
    encoders: Arc<dyn EncoderFactory>,
    state: Mutex<State>,
    /// Signalled when the state reaches `Closed`.
    closed: Condvar,
    next_sequence: AtomicU64,
    counters: Counters,
    created: Instant,
}

impl SessionRecorder {
    pub fn new(
        id: SessionId,
        config: Arc<RecorderConfig>,
        encoders: Arc<dyn EncoderFactory>,
    ) -> Self {
        debug!(session = %id, "Recorder created");
        Self {
            id,
            config,
            encoders,
            state: Mutex::new(State::Idle { frame_rate: None }),
            closed: Condvar::new(),
            next_sequence: AtomicU64::new(0),
            counters: Counters::default(),
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Decode `payload` and queue it for writing.
    ///
    /// `frame_rate_hint` only matters until the first frame opens the sink.
    /// Per-frame problems come back as `Ok(Dropped(..))`; `Err` means the
    /// session itself is unusable.
    pub fn add_frame(
        &self,
        payload: &[u8],
        frame_rate_hint: Option<u32>,
    ) -> Result<FrameOutcome, RecorderError> {
        {
            let mut state = self.state.lock();
            match &mut *state {
                State::Idle { frame_rate } => {
                    if let Some(fps) = frame_rate_hint {
                        if (1..=MAX_FRAME_RATE).contains(&fps) {
                            *frame_rate = Some(fps);
                        } else {
                            debug!(session = %self.id, fps, "Ignoring out-of-range frame rate hint");
                        }
                    }
                }
                State::Active(_) => {}
                State::Draining | State::Closed(_) => return Err(self.closed_error()),
            }
        }

        // Decode outside the lock: it is the expensive part.
        let started = Instant::now();
        let decoded = decode::decode_image(payload);
        self.counters.record_decode(started.elapsed());
        let image = match decoded {
            Ok(image) => image,
            Err(e) => {
                self.counters.dropped_decode.fetch_add(1, Ordering::Relaxed);
                warn!(session = %self.id, "Failed to decode frame: {e}");
                return Ok(FrameOutcome::Dropped(DropReason::Decode(e)));
            }
        };
        let frame = Frame::new(self.next_sequence.fetch_add(1, Ordering::Relaxed), image);

        let mut state = self.state.lock();
        if let State::Idle { frame_rate } = &*state {
            let frame_rate = frame_rate.unwrap_or(self.config.default_frame_rate);
            match self.activate(frame.dimensions(), frame_rate) {
                Ok(active) => *state = State::Active(active),
                Err(e) => {
                    // Never keep a session around that cannot write.
                    error!(session = %self.id, "Closing session: {e}");
                    *state = State::Closed(None);
                    self.closed.notify_all();
                    return Err(e);
                }
            }
        }
        let State::Active(active) = &mut *state else {
            return Err(self.closed_error());
        };

        let actual = frame.dimensions();
        if actual != active.format.dimensions {
            self.counters.dropped_dimension.fetch_add(1, Ordering::Relaxed);
            warn!(
                session = %self.id,
                expected = %active.format.dimensions,
                actual = %actual,
                "Rejecting frame with different dimensions"
            );
            return Ok(FrameOutcome::Dropped(DropReason::DimensionMismatch {
                expected: active.format.dimensions,
                actual,
            }));
        }

        let sequence = frame.sequence();
        match active.producer.try_enqueue(frame) {
            Ok(()) => {
                let accepted = self.counters.accepted.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(FrameOutcome::Accepted { sequence, accepted })
            }
            Err(EnqueueError::Full(_)) => {
                let dropped = self.counters.dropped_queue_full.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(
                        session = %self.id,
                        dropped,
                        capacity = active.producer.capacity(),
                        "Frame queue full, dropping frames"
                    );
                }
                Ok(FrameOutcome::Dropped(DropReason::QueueFull { sequence }))
            }
            Err(EnqueueError::Closed(_)) => {
                self.counters
                    .dropped_queue_closed
                    .fetch_add(1, Ordering::Relaxed);
                error!(session = %self.id, sequence, "Writer thread is gone, dropping frame");
                Ok(FrameOutcome::Dropped(DropReason::QueueClosed { sequence }))
            }
        }
    }

    /// Drain and close the session's output.
    ///
    /// Returns `None` when no frame was ever decoded (no file exists). Calling
    /// it again, or concurrently, returns the first call's result.
    pub fn finalize(&self) -> Option<Recording> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                State::Closed(result) => return result.clone(),
                State::Draining => self.closed.wait(&mut state),
                State::Idle { .. } | State::Active(_) => break,
            }
        }
        let previous = std::mem::replace(&mut *state, State::Draining);
        drop(state);

        let result = match previous {
            State::Active(active) => Some(self.drain(active)),
            _ => {
                info!(session = %self.id, "Finalized without frames; no output created");
                None
            }
        };

        *self.state.lock() = State::Closed(result.clone());
        self.closed.notify_all();
        result
    }

    pub fn state(&self) -> LifecycleState {
        match &*self.state.lock() {
            State::Idle { .. } => LifecycleState::Idle,
            State::Active(_) => LifecycleState::Active,
            State::Draining => LifecycleState::Draining,
            State::Closed(_) => LifecycleState::Closed,
        }
    }

    /// Frames durably handed to the sink so far.
    pub fn frames_written(&self) -> u64 {
        match &*self.state.lock() {
            State::Active(active) => active.worker.frames_written(),
            State::Closed(Some(recording)) => recording.frames_written,
            _ => 0,
        }
    }

    /// Frames accepted into the queue so far (written or still pending).
    pub fn frames_accepted(&self) -> u64 {
        self.counters.accepted.load(Ordering::Relaxed)
    }

    /// Format locked in by the first frame, once there was one.
    pub fn format(&self) -> Option<VideoFormat> {
        match &*self.state.lock() {
            State::Active(active) => Some(active.format),
            State::Closed(Some(recording)) => Some(recording.format),
            _ => None,
        }
    }

    pub fn stats(&self) -> RecordingStats {
        let write_errors = match &*self.state.lock() {
            State::Active(active) => active.worker.write_errors(),
            State::Closed(Some(recording)) => recording.stats.write_errors,
            _ => 0,
        };
        self.snapshot_stats(write_errors)
    }

    fn snapshot_stats(&self, write_errors: u64) -> RecordingStats {
        let c = &self.counters;
        RecordingStats {
            frames_accepted: c.accepted.load(Ordering::Relaxed),
            dropped_decode: c.dropped_decode.load(Ordering::Relaxed),
            dropped_dimension_mismatch: c.dropped_dimension.load(Ordering::Relaxed),
            dropped_queue_full: c.dropped_queue_full.load(Ordering::Relaxed),
            dropped_queue_closed: c.dropped_queue_closed.load(Ordering::Relaxed),
            write_errors,
            avg_decode_time: c.avg_decode_time(),
            duration: self.created.elapsed(),
        }
    }

    fn activate(&self, dimensions: Dimensions, frame_rate: u32) -> Result<Active, RecorderError> {
        let format = VideoFormat {
            dimensions,
            frame_rate,
        };
        let sink = FileEncoderSink::open(
            &self.config.output_dir,
            self.id.as_str(),
            format,
            self.encoders.as_ref(),
        )
        .map_err(|source| RecorderError::SinkOpen {
            session: self.id.to_string(),
            source,
        })?;

        let (producer, consumer) = queue::bounded(self.config.queue_capacity);
        let worker = WriterWorker::spawn(
            self.id.as_str(),
            sink,
            consumer,
            self.config.poll_interval(),
        )
        .map_err(|source| RecorderError::WorkerSpawn {
            session: self.id.to_string(),
            source,
        })?;

        info!(
            session = %self.id,
            dimensions = %dimensions,
            fps = frame_rate,
            capacity = self.config.queue_capacity,
            "Recording started"
        );
        Ok(Active {
            producer,
            worker,
            format,
        })
    }

    fn drain(&self, active: Active) -> Recording {
        let Active {
            producer,
            worker,
            format,
        } = active;

        info!(
            session = %self.id,
            pending = producer.len(),
            "Finalizing; waiting for queued frames"
        );
        producer.close();
        let report = worker.finish(self.config.drain_timeout());

        let stats = self.snapshot_stats(report.write_errors);
        let recording = Recording {
            path: report.path,
            format,
            frames_written: report.frames_written,
            frames_dropped: stats.frames_dropped(),
            drained: report.drained,
            stats,
        };

        if recording.drained {
            info!(
                session = %self.id,
                path = %recording.path.display(),
                frames = recording.frames_written,
                dropped = recording.frames_dropped,
                duration_s = recording.stats.duration.as_secs_f64(),
                avg_decode_ms = recording.stats.avg_decode_time.as_secs_f64() * 1000.0,
                "Video saved"
            );
        } else {
            warn!(
                session = %self.id,
                path = %recording.path.display(),
                frames = recording.frames_written,
                accepted = recording.stats.frames_accepted,
                "Video saved without full drain; trailing frames lost"
            );
        }
        recording
    }

    fn closed_error(&self) -> RecorderError {
        RecorderError::SessionClosed(self.id.to_string())
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        if !matches!(&*self.state.get_mut(), State::Closed(_)) {
            debug!(session = %self.id, "Recorder dropped while open; finalizing");
            self.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderKind;
    use crate::decode::tests::png_payload;
    use crate::writer::BuiltinEncoders;
    use std::fs;
    use std::path::Path;

    fn recorder(dir: &Path) -> SessionRecorder {
        let config = RecorderConfig {
            output_dir: dir.to_path_buf(),
            poll_interval_ms: 10,
            ..RecorderConfig::default()
        };
        SessionRecorder::new(
            SessionId::from("unit"),
            Arc::new(config),
            Arc::new(BuiltinEncoders(EncoderKind::Y4m)),
        )
    }

    #[test]
    fn idle_finalize_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(dir.path());
        assert_eq!(rec.state(), LifecycleState::Idle);
        assert_eq!(rec.finalize(), None);
        assert_eq!(rec.state(), LifecycleState::Closed);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn undecodable_frames_keep_session_idle() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(dir.path());
        let outcome = rec.add_frame(b"%%%", None).unwrap();
        assert!(matches!(outcome, FrameOutcome::Dropped(DropReason::Decode(_))));
        assert_eq!(rec.state(), LifecycleState::Idle);
        assert_eq!(rec.stats().dropped_decode, 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn first_frame_locks_format_and_frame_rate_hint() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(dir.path());
        // Hint arrives with a frame that fails to decode; it still counts.
        rec.add_frame(b"garbage!", Some(30)).unwrap();
        let outcome = rec.add_frame(png_payload(8, 6, [1, 2, 3]).as_bytes(), None).unwrap();
        assert!(matches!(outcome, FrameOutcome::Accepted { sequence: 0, accepted: 1 }));
        assert_eq!(rec.state(), LifecycleState::Active);

        // Later hints are ignored.
        rec.add_frame(png_payload(8, 6, [1, 2, 3]).as_bytes(), Some(60)).unwrap();
        let format = rec.format().unwrap();
        assert_eq!(format.dimensions, Dimensions::new(8, 6));
        assert_eq!(format.frame_rate, 30);

        let recording = rec.finalize().unwrap();
        assert_eq!(recording.frames_written, 2);
        assert_eq!(recording.format.frame_rate, 30);
        assert!(recording.drained);
    }

    #[test]
    fn mismatched_dimensions_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(dir.path());
        rec.add_frame(png_payload(8, 8, [0, 0, 0]).as_bytes(), None).unwrap();
        let outcome = rec.add_frame(png_payload(16, 8, [0, 0, 0]).as_bytes(), None).unwrap();
        match outcome {
            FrameOutcome::Dropped(DropReason::DimensionMismatch { expected, actual }) => {
                assert_eq!(expected, Dimensions::new(8, 8));
                assert_eq!(actual, Dimensions::new(16, 8));
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }

        let recording = rec.finalize().unwrap();
        assert_eq!(recording.frames_written, 1);
        assert_eq!(recording.frames_dropped, 1);
        assert_eq!(recording.stats.dropped_dimension_mismatch, 1);
    }

    #[test]
    fn closed_session_refuses_frames() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(dir.path());
        rec.finalize();
        let err = rec.add_frame(png_payload(2, 2, [0, 0, 0]).as_bytes(), None).unwrap_err();
        assert!(matches!(err, RecorderError::SessionClosed(_)));
    }

    #[test]
    fn unwritable_output_closes_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(&dir.path().join("missing"));
        let err = rec.add_frame(png_payload(4, 4, [9, 9, 9]).as_bytes(), None).unwrap_err();
        assert!(matches!(err, RecorderError::SinkOpen { .. }));
        assert_eq!(rec.state(), LifecycleState::Closed);
        assert_eq!(rec.finalize(), None);
    }

    #[test]
    fn session_id_with_nul_records_normally() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecorderConfig {
            output_dir: dir.path().to_path_buf(),
            poll_interval_ms: 10,
            ..RecorderConfig::default()
        };
        let rec = SessionRecorder::new(
            SessionId::from("a\0b"),
            Arc::new(config),
            Arc::new(BuiltinEncoders(EncoderKind::Y4m)),
        );
        for _ in 0..3 {
            let outcome = rec.add_frame(png_payload(4, 4, [1, 1, 1]).as_bytes(), None).unwrap();
            assert!(outcome.is_accepted());
        }
        assert_eq!(rec.state(), LifecycleState::Active);

        let recording = rec.finalize().unwrap();
        assert_eq!(recording.frames_written, 3);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        assert!(recording.path.to_string_lossy().ends_with("_a_b.y4m"));
    }

    #[test]
    fn dropping_an_active_recorder_finalizes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let rec = recorder(dir.path());
            rec.add_frame(png_payload(4, 4, [9, 9, 9]).as_bytes(), None).unwrap();
        }
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        let format = VideoFormat {
            dimensions: Dimensions::new(4, 4),
            frame_rate: 24,
        };
        let expected = crate::writer::y4m::header(&format).len() + crate::writer::y4m::frame_len(&format);
        assert_eq!(fs::metadata(path).unwrap().len() as usize, expected);
    }
}
