//! Error taxonomy for the recording pipeline.
//!
//! Per-frame failures (`DecodeError`, sink write errors) are absorbed where
//! they happen and only show up as counters or `Dropped` outcomes.
//! Session-level failures (`RecorderError`) are returned to the caller.

use std::io;
use std::path::PathBuf;

use crate::decode::Dimensions;

/// A payload could not be turned into a frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty frame payload")]
    EmptyPayload,

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("image decoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("decoded image has no pixels ({0})")]
    EmptyImage(Dimensions),
}

/// Failures of the file sink and the encoder behind it.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("cannot reserve output path in {dir}: {source}")]
    Reserve {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot open encoder for {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("frame is {actual}, sink was opened for {expected}")]
    DimensionMismatch {
        expected: Dimensions,
        actual: Dimensions,
    },

    #[error("write to {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("finishing {path} failed: {source}")]
    Finish {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("sink for {0} is already closed")]
    Closed(PathBuf),
}

/// Session-level failures surfaced to the caller of `add_frame`.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("session {0} is not connected")]
    UnknownSession(String),

    #[error("session {0} is finalized")]
    SessionClosed(String),

    #[error("output for session {session} could not be opened: {source}")]
    SinkOpen {
        session: String,
        #[source]
        source: SinkError,
    },

    #[error("writer thread for session {session} could not start: {source}")]
    WorkerSpawn {
        session: String,
        #[source]
        source: io::Error,
    },
}

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
