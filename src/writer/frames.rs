//! Image-sequence output: every frame saved as `frame_NNNNNN.png` inside the
//! session's `frames_…` directory. Useful when no video tooling is around, or
//! to inspect exactly what a client sent.

use std::io;
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};

use super::{VideoEncoder, VideoFormat};

pub struct FrameSequenceEncoder {
    dir: PathBuf,
    next_index: u64,
}

impl FrameSequenceEncoder {
    /// `dir` has already been created by the sink's path reservation.
    pub fn create(dir: &Path, _format: &VideoFormat) -> io::Result<Self> {
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", dir.display()),
            ));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            next_index: 0,
        })
    }

    fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{index:06}.png"))
    }
}

impl VideoEncoder for FrameSequenceEncoder {
    fn write_frame(&mut self, image: &RgbImage) -> io::Result<()> {
        let path = self.frame_path(self.next_index);
        image
            .save_with_format(&path, ImageFormat::Png)
            .map_err(io::Error::other)?;
        self.next_index += 1;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}
