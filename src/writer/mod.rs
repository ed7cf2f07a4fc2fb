//! File sink: owns the output artifact of one session and the encoder behind it.
//!
//! The sink is opened once the first frame reveals the session's dimensions,
//! then written only by the session's writer thread:
//!
//! ```text
//!   open(dims, fps) ──▶ write(frame) × N ──▶ close() → path
//! ```
//!
//! Output naming: `video_<YYYYmmdd_HHMMSS_mmm>_<session>.<ext>` in the
//! configured directory (`frames_…/` for the image-sequence encoder). The path
//! is reserved with create-new semantics, so two sessions opening in the same
//! millisecond never share a file.
//!
//! Encoders:
//!   - `y4m`: YUV4MPEG2 4:4:4, pure Rust, playable after every frame
//!   - `ffmpeg`: H.264 / MP4 via an `ffmpeg` child process
//!   - `frames`: PNG image sequence

pub mod ffmpeg;
pub mod frames;
pub mod y4m;

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::EncoderKind;
use crate::decode::{Dimensions, Frame};
use crate::error::SinkError;

/// How many numeric suffixes we try before giving up on a colliding name.
const MAX_NAME_ATTEMPTS: u32 = 100;
/// Longest session label embedded in a file name.
const MAX_SESSION_LABEL: usize = 32;

/// Geometry and timing every frame of one output shares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoFormat {
    pub dimensions: Dimensions,
    pub frame_rate: u32,
}

// ────────────────────────────────────────────────────────────────
//  Encoder capability
// ────────────────────────────────────────────────────────────────

/// Opaque container/codec writer. Receives frames in order, already checked
/// against the format it was created with.
pub trait VideoEncoder: Send {
    fn write_frame(&mut self, image: &RgbImage) -> io::Result<()>;

    /// Flush and finalize the container. Called exactly once.
    fn finish(&mut self) -> io::Result<()>;
}

/// Creates encoders for freshly reserved output paths.
pub trait EncoderFactory: Send + Sync {
    /// File extension of the artifact, or `None` when the artifact is a
    /// directory of images.
    fn extension(&self) -> Option<&str>;

    fn create(&self, path: &Path, format: &VideoFormat) -> io::Result<Box<dyn VideoEncoder>>;
}

/// The encoders shipped with the crate, selected by configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuiltinEncoders(pub EncoderKind);

impl EncoderFactory for BuiltinEncoders {
    fn extension(&self) -> Option<&str> {
        match self.0 {
            EncoderKind::Y4m => Some("y4m"),
            EncoderKind::Ffmpeg => Some("mp4"),
            EncoderKind::Frames => None,
        }
    }

    fn create(&self, path: &Path, format: &VideoFormat) -> io::Result<Box<dyn VideoEncoder>> {
        Ok(match self.0 {
            EncoderKind::Y4m => Box::new(y4m::Y4mEncoder::create(path, format)?),
            EncoderKind::Ffmpeg => Box::new(ffmpeg::FfmpegEncoder::spawn(path, format)?),
            EncoderKind::Frames => Box::new(frames::FrameSequenceEncoder::create(path, format)?),
        })
    }
}

// ────────────────────────────────────────────────────────────────
//  FileEncoderSink
// ────────────────────────────────────────────────────────────────

pub struct FileEncoderSink {
    path: PathBuf,
    format: VideoFormat,
    /// `None` once closed.
    encoder: Option<Box<dyn VideoEncoder>>,
    frames_written: u64,
}

impl FileEncoderSink {
    /// Reserve the output path in `dir` and start an encoder on it.
    ///
    /// The timestamp in the name is taken here, at sink creation.
    pub fn open(
        dir: &Path,
        session: &str,
        format: VideoFormat,
        encoders: &dyn EncoderFactory,
    ) -> Result<Self, SinkError> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f").to_string();
        let path = reserve_output_path(dir, &timestamp, session, encoders.extension())
            .map_err(|source| SinkError::Reserve {
                dir: dir.to_path_buf(),
                source,
            })?;

        let encoder = match encoders.create(&path, &format) {
            Ok(encoder) => encoder,
            Err(source) => {
                release_reservation(&path);
                return Err(SinkError::Open { path, source });
            }
        };

        info!(
            session,
            path = %path.display(),
            dimensions = %format.dimensions,
            fps = format.frame_rate,
            "Sink opened"
        );
        Ok(Self {
            path,
            format,
            encoder: Some(encoder),
            frames_written: 0,
        })
    }

    /// Append one frame. A frame whose shape differs from the one bound at
    /// open is refused; the sink stays usable.
    pub fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| SinkError::Closed(self.path.clone()))?;

        let actual = frame.dimensions();
        if actual != self.format.dimensions {
            return Err(SinkError::DimensionMismatch {
                expected: self.format.dimensions,
                actual,
            });
        }

        encoder
            .write_frame(frame.image())
            .map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.frames_written += 1;

        if self.frames_written % 100 == 0 {
            debug!(
                path = %self.path.display(),
                frames = self.frames_written,
                "Sink progress"
            );
        }
        Ok(())
    }

    /// Finalize the container and return its path. Calling it again is a
    /// no-op returning the same path.
    pub fn close(&mut self) -> Result<PathBuf, SinkError> {
        let Some(mut encoder) = self.encoder.take() else {
            return Ok(self.path.clone());
        };
        encoder.finish().map_err(|source| SinkError::Finish {
            path: self.path.clone(),
            source,
        })?;
        info!(
            path = %self.path.display(),
            frames = self.frames_written,
            "Sink closed"
        );
        Ok(self.path.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Close the sink and delete its artifact. For a sink that never got a
    /// writer.
    pub fn discard(mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), "Closing discarded sink failed: {e}");
        }
        release_reservation(&self.path);
    }
}

impl Drop for FileEncoderSink {
    fn drop(&mut self) {
        if self.encoder.is_some() {
            if let Err(e) = self.close() {
                warn!("Closing dropped sink failed: {e}");
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────
//  Output naming
// ────────────────────────────────────────────────────────────────

/// Keep file names portable: `[A-Za-z0-9_-]`, bounded length.
pub(crate) fn session_label(session: &str) -> String {
    let label: String = session
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(MAX_SESSION_LABEL)
        .collect();
    if label.is_empty() { "session".to_string() } else { label }
}

/// Atomically claim `video_<ts>_<session>[-n].<ext>` (or a `frames_…`
/// directory) so the name is ours even before the encoder starts.
fn reserve_output_path(
    dir: &Path,
    timestamp: &str,
    session: &str,
    extension: Option<&str>,
) -> io::Result<PathBuf> {
    let label = session_label(session);
    let prefix = if extension.is_some() { "video" } else { "frames" };

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let stem = if attempt == 0 {
            format!("{prefix}_{timestamp}_{label}")
        } else {
            format!("{prefix}_{timestamp}_{label}-{attempt}")
        };
        let candidate = match extension {
            Some(ext) => dir.join(format!("{stem}.{ext}")),
            None => dir.join(stem),
        };

        let claimed = match extension {
            Some(_) => OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .map(drop),
            None => fs::create_dir(&candidate),
        };
        match claimed {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free output name for session {label} at {timestamp}"),
    ))
}

fn release_reservation(path: &Path) {
    let removed = if path.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = removed {
        warn!(path = %path.display(), "Failed to remove unused output reservation: {e}");
    }
}
