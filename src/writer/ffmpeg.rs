//! H.264 / MP4 encoding through an `ffmpeg` child process.
//!
//! Pipeline:
//!   raw RGB24 frames → ffmpeg stdin → libx264 → MP4 (`+faststart`)
//!
//! Encoding settings:
//!   - Codec: H.264, yuv420p (dimensions rounded down to even)
//!   - Bitrate: adaptive to resolution
//!     - 4K:    22 Mbps
//!     - 1440p: 14 Mbps
//!     - 1080p and below: 8 Mbps
//!   - Keyframe interval: 2 seconds at the session frame rate
//!
//! The MP4 is not playable until `finish()` has closed stdin and ffmpeg has
//! written the moov atom.

use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

use image::RgbImage;
use tracing::{info, warn};

use super::{VideoEncoder, VideoFormat};

pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
}

impl FfmpegEncoder {
    /// Start ffmpeg writing to `path` (overwriting the reserved empty file).
    pub fn spawn(path: &Path, format: &VideoFormat) -> io::Result<Self> {
        let mut child = command(path, format)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("ffmpeg stdin was not captured"))?;

        info!(
            path = %path.display(),
            dimensions = %format.dimensions,
            bitrate = compute_bitrate(format.dimensions.width, format.dimensions.height),
            "ffmpeg encoder started"
        );
        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
        })
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn write_frame(&mut self, image: &RgbImage) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        stdin.write_all(image.as_raw())
    }

    fn finish(&mut self) -> io::Result<()> {
        // Dropping stdin is ffmpeg's end-of-stream.
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush()?;
        }
        let status = self.child.wait()?;
        if !status.success() {
            return Err(io::Error::other(format!("ffmpeg exited with {status}")));
        }
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        // Only reached without finish(): don't leave an orphaned process.
        if self.stdin.take().is_some() {
            warn!("ffmpeg encoder dropped before finish; killing child");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Build the ffmpeg invocation for one session.
pub fn command(path: &Path, format: &VideoFormat) -> Command {
    let VideoFormat {
        dimensions,
        frame_rate,
    } = *format;
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"])
        .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
        .arg("-s")
        .arg(dimensions.to_string())
        .arg("-r")
        .arg(frame_rate.to_string())
        .args(["-i", "pipe:0"])
        .args(["-vf", "scale=trunc(iw/2)*2:trunc(ih/2)*2"])
        .args(["-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p"])
        .arg("-b:v")
        .arg(compute_bitrate(dimensions.width, dimensions.height).to_string())
        .arg("-g")
        .arg((frame_rate * 2).to_string())
        .args(["-movflags", "+faststart", "-y"])
        .arg(path);
    cmd
}

/// Target bitrate for the given resolution.
///
///   - 4K (3840x2160): 22 Mbps
///   - 1440p:          14 Mbps
///   - otherwise:       8 Mbps
pub fn compute_bitrate(width: u32, height: u32) -> u64 {
    let pixels = width as u64 * height as u64;
    if pixels >= 3840 * 2160 {
        22_000_000
    } else if pixels >= 2560 * 1440 {
        14_000_000
    } else {
        8_000_000
    }
}
