//! framecast: per-session live frame recorder.
//!
//! Pipeline (one per session):
//!   transport → SessionRegistry → SessionRecorder::add_frame
//!     → decode (base64 → RGB) → bounded queue → writer thread → FileEncoderSink → file
//!
//! Frames that cannot be queued are dropped and reported, never buffered
//! without bound. `finalize` drains the queue (bounded by a timeout) and
//! closes the output on stop, disconnect, eviction or shutdown alike.

pub mod config;
pub mod decode;
pub mod error;
pub mod queue;
pub mod recorder;
pub mod registry;
pub mod transport;
pub mod worker;
pub mod writer;

pub use config::{EncoderKind, RecorderConfig};
pub use decode::{Dimensions, Frame};
pub use error::{ConfigError, DecodeError, RecorderError, SinkError};
pub use recorder::{
    DropReason, FrameOutcome, LifecycleState, Recording, RecordingStats, SessionId,
    SessionRecorder,
};
pub use registry::SessionRegistry;
pub use transport::{AckPolicy, ClientEvent, Dispatcher, EventRouter, ServerEvent};
pub use writer::{BuiltinEncoders, EncoderFactory, FileEncoderSink, VideoEncoder, VideoFormat};
