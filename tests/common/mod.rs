#![allow(dead_code)]

use std::io::{self, Cursor};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{ImageFormat, Rgb, RgbImage};

use framecast::writer::y4m::Y4mEncoder;
use framecast::{EncoderFactory, RecorderConfig, VideoEncoder, VideoFormat};

/// Base64 PNG of a solid-colour frame.
pub fn png_payload(width: u32, height: u32, color: [u8; 3]) -> String {
    let image = RgbImage::from_pixel(width, height, Rgb(color));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    STANDARD.encode(bytes.into_inner())
}

pub fn config(dir: &Path) -> RecorderConfig {
    RecorderConfig {
        output_dir: dir.to_path_buf(),
        poll_interval_ms: 10,
        ..RecorderConfig::default()
    }
}

pub fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    files.sort();
    files
}

/// Real Y4M output, but every frame write takes `delay`.
pub struct SlowY4m {
    pub delay: Duration,
}

struct SlowEncoder {
    inner: Y4mEncoder,
    delay: Duration,
}

impl VideoEncoder for SlowEncoder {
    fn write_frame(&mut self, image: &RgbImage) -> io::Result<()> {
        thread::sleep(self.delay);
        self.inner.write_frame(image)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.finish()
    }
}

impl EncoderFactory for SlowY4m {
    fn extension(&self) -> Option<&str> {
        Some("y4m")
    }

    fn create(&self, path: &Path, format: &VideoFormat) -> io::Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(SlowEncoder {
            inner: Y4mEncoder::create(path, format)?,
            delay: self.delay,
        }))
    }
}

/// Encoder that remembers the red channel of every frame it writes and can be
/// held shut until the test opens the gate.
#[derive(Clone, Default)]
pub struct Tally {
    pub written: Arc<Mutex<Vec<u8>>>,
    gate: Arc<(Mutex<GateState>, Condvar)>,
}

#[derive(Default)]
struct GateState {
    closed: bool,
    blocked_writers: usize,
}

impl Tally {
    pub fn gated() -> Self {
        let tally = Self::default();
        tally.gate.0.lock().unwrap().closed = true;
        tally
    }

    /// Wait until the writer is stuck inside a write.
    pub fn wait_until_blocked(&self, timeout: Duration) -> bool {
        let (state, cond) = &*self.gate;
        let guard = state.lock().unwrap();
        let (guard, _) = cond
            .wait_timeout_while(guard, timeout, |s| s.blocked_writers == 0)
            .unwrap();
        guard.blocked_writers > 0
    }

    pub fn open(&self) {
        let (state, cond) = &*self.gate;
        state.lock().unwrap().closed = false;
        cond.notify_all();
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

struct TallyEncoder(Tally);

impl VideoEncoder for TallyEncoder {
    fn write_frame(&mut self, image: &RgbImage) -> io::Result<()> {
        {
            let (state, cond) = &*self.0.gate;
            let mut guard = state.lock().unwrap();
            guard.blocked_writers += 1;
            cond.notify_all();
            while guard.closed {
                guard = cond.wait(guard).unwrap();
            }
            guard.blocked_writers -= 1;
        }
        self.0.written.lock().unwrap().push(image.get_pixel(0, 0)[0]);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EncoderFactory for Tally {
    fn extension(&self) -> Option<&str> {
        Some("tally")
    }

    fn create(&self, _path: &Path, _format: &VideoFormat) -> io::Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(TallyEncoder(self.clone())))
    }
}
