//! Recorder configuration.
//!
//! Layering: built-in defaults → optional JSON file → environment variables.
//! Everything the recorder tunes (output directory, queue capacity, drain
//! timeout, default frame rate, encoder) comes from here.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Frame rate used when the client never sends an `fps` hint.
pub const DEFAULT_FRAME_RATE: u32 = 24;
/// Frames buffered between the receive path and the writer thread.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Upper bound on how long `finalize` waits for the writer to drain.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;
/// Acknowledge every N-th accepted frame instead of every frame.
pub const DEFAULT_ACK_INTERVAL: u64 = 30;
/// How long one writer `dequeue` waits before re-checking its abort flag.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
/// Highest frame rate hint we accept from a client.
pub const MAX_FRAME_RATE: u32 = 240;

/// Which encoder turns frames into the output artifact.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// Uncompressed YUV4MPEG2 stream, pure Rust, always playable.
    #[default]
    Y4m,
    /// H.264 / MP4 through an external `ffmpeg` process.
    Ffmpeg,
    /// One PNG per frame in a per-session directory.
    Frames,
}

impl EncoderKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "y4m" | "yuv4mpeg" => Some(Self::Y4m),
            "ffmpeg" | "mp4" => Some(Self::Ffmpeg),
            "frames" | "images" | "png" => Some(Self::Frames),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderConfig {
    /// Directory receiving one artifact per session. Created at startup.
    pub output_dir: PathBuf,
    pub queue_capacity: usize,
    pub drain_timeout_ms: u64,
    pub default_frame_rate: u32,
    pub encoder: EncoderKind,
    pub ack_interval: u64,
    pub poll_interval_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            default_frame_rate: DEFAULT_FRAME_RATE,
            encoder: EncoderKind::default(),
            ack_interval: DEFAULT_ACK_INTERVAL,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl RecorderConfig {
    /// Load the full layering: defaults, then `path` if given, then the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from environment-style lookups.
    ///
    /// `lookup` is the process environment in production; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // FRAMECAST_OUTPUT_DIR wins over the legacy upload folder variable.
        if let Some(dir) = lookup("FRAMECAST_OUTPUT_DIR").or_else(|| lookup("UPLOAD_FOLDER")) {
            if !dir.trim().is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
        if let Some(v) = lookup("FRAMECAST_QUEUE_CAPACITY") {
            self.queue_capacity = parse_number("FRAMECAST_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("FRAMECAST_DRAIN_TIMEOUT_MS") {
            self.drain_timeout_ms = parse_number("FRAMECAST_DRAIN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("FRAMECAST_DEFAULT_FPS") {
            self.default_frame_rate = parse_number("FRAMECAST_DEFAULT_FPS", &v)?;
        }
        if let Some(v) = lookup("FRAMECAST_ACK_INTERVAL") {
            self.ack_interval = parse_number("FRAMECAST_ACK_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("FRAMECAST_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_number("FRAMECAST_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("FRAMECAST_ENCODER") {
            self.encoder = EncoderKind::parse(&v).ok_or_else(|| ConfigError::Invalid {
                key: "FRAMECAST_ENCODER",
                reason: format!("unknown encoder {v:?} (expected y4m, ffmpeg or frames)"),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.default_frame_rate == 0 || self.default_frame_rate > MAX_FRAME_RATE {
            return Err(invalid(
                "default_frame_rate",
                format!("must be within 1..={MAX_FRAME_RATE}"),
            ));
        }
        if self.ack_interval == 0 {
            return Err(invalid("ack_interval", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be at least 1"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(invalid("output_dir", "must not be empty"));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, format!("{value:?} is not a valid number")))
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}
