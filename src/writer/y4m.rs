//! YUV4MPEG2 writer.
//!
//! Layout:
//!   - header: `YUV4MPEG2 W<w> H<h> F<fps>:1 Ip A1:1 C444\n`
//!   - per frame: `FRAME\n` + Y plane + Cb plane + Cr plane (full resolution)
//!
//! There is no trailer, so the stream is a valid video after every complete
//! frame. A forced close therefore yields a short file, never a corrupt one.
//! Any player built on ffmpeg reads it directly; `ffmpeg -i x.y4m x.mp4`
//! compresses it.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use image::RgbImage;

use super::{VideoEncoder, VideoFormat};

pub const FRAME_MARKER: &[u8] = b"FRAME\n";

/// 4 MiB of buffering in front of the file.
const WRITE_BUFFER: usize = 4 * 1024 * 1024;

pub struct Y4mEncoder {
    out: BufWriter<File>,
    /// Reused plane scratch: Y, Cb, Cr back to back.
    planes: Vec<u8>,
}

impl Y4mEncoder {
    /// Truncate `path` and write the stream header.
    pub fn create(path: &Path, format: &VideoFormat) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut out = BufWriter::with_capacity(WRITE_BUFFER, file);
        out.write_all(header(format).as_bytes())?;
        Ok(Self {
            out,
            planes: Vec::with_capacity(format.dimensions.pixel_count() * 3),
        })
    }
}

impl VideoEncoder for Y4mEncoder {
    fn write_frame(&mut self, image: &RgbImage) -> io::Result<()> {
        rgb_to_planes(image, &mut self.planes);
        self.out.write_all(FRAME_MARKER)?;
        self.out.write_all(&self.planes)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }
}

pub fn header(format: &VideoFormat) -> String {
    format!(
        "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C444\n",
        format.dimensions.width, format.dimensions.height, format.frame_rate
    )
}

/// Bytes one frame occupies in the stream, marker included.
pub fn frame_len(format: &VideoFormat) -> usize {
    FRAME_MARKER.len() + format.dimensions.pixel_count() * 3
}

/// BT.601 studio-range RGB → planar Y'CbCr 4:4:4.
fn rgb_to_planes(image: &RgbImage, planes: &mut Vec<u8>) {
    let pixels = image.width() as usize * image.height() as usize;
    planes.clear();
    planes.resize(pixels * 3, 0);
    let (y_plane, chroma) = planes.split_at_mut(pixels);
    let (cb_plane, cr_plane) = chroma.split_at_mut(pixels);

    for (i, px) in image.pixels().enumerate() {
        let (r, g, b) = (px[0] as i32, px[1] as i32, px[2] as i32);
        y_plane[i] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
        cb_plane[i] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8;
        cr_plane[i] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8;
    }
}
