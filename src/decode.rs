//! Frame decoding: base64 text → compressed image → RGB pixel buffer.
//!
//! Pure functions only. The recorder calls this off the transport's event
//! loop (see `transport`), so a slow decode never delays reading the next
//! frame from the connection.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::RgbImage;

use crate::error::DecodeError;

/// Width and height of a frame, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of(image: &RgbImage) -> Self {
        Self::new(image.width(), image.height())
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One decoded image plus the sequence number it was given at decode time.
///
/// Frames are moved through the pipeline, never shared: recorder → queue →
/// writer thread → sink.
#[derive(Debug)]
pub struct Frame {
    sequence: u64,
    image: RgbImage,
}

impl Frame {
    pub fn new(sequence: u64, image: RgbImage) -> Self {
        Self { sequence, image }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::of(&self.image)
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

/// Decode one client payload into an RGB image.
///
/// Accepts plain base64 or a `data:image/...;base64,` URL as produced by
/// `canvas.toDataURL()`. PNG and JPEG are recognised by their signature.
pub fn decode_image(payload: &[u8]) -> Result<RgbImage, DecodeError> {
    let text = strip_data_url(payload.trim_ascii());
    if text.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    let compressed = STANDARD.decode(text)?;
    if compressed.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    let image = image::load_from_memory(&compressed)?.into_rgb8();
    let dimensions = Dimensions::of(&image);
    if dimensions.width == 0 || dimensions.height == 0 {
        return Err(DecodeError::EmptyImage(dimensions));
    }
    Ok(image)
}

/// `data:image/jpeg;base64,/9j/4AAQ...` → `/9j/4AAQ...`
fn strip_data_url(payload: &[u8]) -> &[u8] {
    if !payload.starts_with(b"data:") {
        return payload;
    }
    match payload.iter().position(|&b| b == b',') {
        Some(comma) => &payload[comma + 1..],
        None => payload,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    /// Base64 PNG of a solid-colour frame, the way a browser client sends it.
    pub(crate) fn png_payload(width: u32, height: u32, color: [u8; 3]) -> String {
        let image = RgbImage::from_pixel(width, height, Rgb(color));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        STANDARD.encode(bytes.into_inner())
    }

    #[test]
    fn decodes_png_payload() {
        let payload = png_payload(640, 480, [10, 20, 30]);
        let image = decode_image(payload.as_bytes()).unwrap();
        assert_eq!(Dimensions::of(&image), Dimensions::new(640, 480));
        assert_eq!(image.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn decodes_jpeg_data_url() {
        let image = RgbImage::from_pixel(32, 16, Rgb([200, 200, 200]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Jpeg).unwrap();
        let payload = format!("data:image/jpeg;base64,{}\n", STANDARD.encode(bytes.into_inner()));

        let decoded = decode_image(payload.as_bytes()).unwrap();
        assert_eq!(Dimensions::of(&decoded), Dimensions::new(32, 16));
    }

    #[test]
    fn rejects_bad_base64() {
        let err = decode_image(b"not*base64!").unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_)));
    }

    #[test]
    fn rejects_non_image_bytes() {
        let payload = STANDARD.encode(b"definitely not an image");
        let err = decode_image(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::Image(_)));
    }

    #[test]
    fn rejects_empty_payload() {
        assert!(matches!(decode_image(b"").unwrap_err(), DecodeError::EmptyPayload));
        assert!(matches!(decode_image(b"  \n").unwrap_err(), DecodeError::EmptyPayload));
        assert!(matches!(
            decode_image(b"data:image/png;base64,").unwrap_err(),
            DecodeError::EmptyPayload
        ));
    }

    #[test]
    fn frame_keeps_sequence_and_shape() {
        let frame = Frame::new(7, RgbImage::new(4, 2));
        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.dimensions().to_string(), "4x2");
        assert_eq!(frame.dimensions().pixel_count(), 8);
    }
}
