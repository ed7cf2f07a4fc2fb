mod common;

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use framecast::writer::y4m;
use framecast::{
    BuiltinEncoders, Dimensions, DropReason, EncoderKind, FrameOutcome, LifecycleState,
    RecorderConfig, RecorderError, SessionId, SessionRecorder, SessionRegistry, VideoFormat,
};

use common::{Tally, SlowY4m, config, files_in, png_payload};

fn y4m_len(format: &VideoFormat, frames: u64) -> u64 {
    (y4m::header(format).len() + frames as usize * y4m::frame_len(format)) as u64
}

#[test]
fn three_frames_make_one_video() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(config(dir.path())).unwrap();
    registry.connect("cam-1");

    let payload = png_payload(640, 480, [30, 60, 90]);
    for _ in 0..3 {
        let outcome = registry.add_frame("cam-1", payload.as_bytes(), Some(24)).unwrap();
        assert!(outcome.is_accepted());
    }

    let recording = registry.finalize("cam-1").unwrap();
    assert_eq!(recording.frames_written, 3);
    assert_eq!(recording.frames_dropped, 0);
    assert!(recording.drained);
    assert_eq!(recording.format.dimensions, Dimensions::new(640, 480));
    assert_eq!(recording.format.frame_rate, 24);

    assert_eq!(files_in(dir.path()), vec![recording.path.clone()]);
    let name = recording.path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("video_") && name.ends_with("_cam-1.y4m"), "{name}");
    assert_eq!(
        fs::metadata(&recording.path).unwrap().len(),
        y4m_len(&recording.format, 3)
    );
}

#[test]
fn mismatched_frame_never_reaches_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(config(dir.path())).unwrap();
    registry.connect("s");

    registry
        .add_frame("s", png_payload(640, 480, [0, 0, 0]).as_bytes(), None)
        .unwrap();
    let outcome = registry
        .add_frame("s", png_payload(320, 240, [0, 0, 0]).as_bytes(), None)
        .unwrap();
    assert!(matches!(
        outcome,
        FrameOutcome::Dropped(DropReason::DimensionMismatch { .. })
    ));

    let recording = registry.finalize("s").unwrap();
    assert_eq!(recording.frames_written, 1);
    assert_eq!(
        fs::metadata(&recording.path).unwrap().len(),
        y4m_len(&recording.format, 1)
    );
}

#[test]
fn session_without_frames_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(config(dir.path())).unwrap();
    registry.connect("quiet");
    registry
        .add_frame("quiet", b"definitely not an image", None)
        .unwrap();

    assert_eq!(registry.finalize("quiet"), None);
    assert!(files_in(dir.path()).is_empty());
}

#[test]
fn finalize_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = SessionRecorder::new(
        SessionId::from("twice"),
        Arc::new(config(dir.path())),
        Arc::new(BuiltinEncoders(EncoderKind::Y4m)),
    );
    recorder
        .add_frame(png_payload(8, 8, [1, 2, 3]).as_bytes(), None)
        .unwrap();

    let first = recorder.finalize().unwrap();
    let second = recorder.finalize().unwrap();
    assert_eq!(first, second);
    assert_eq!(recorder.state(), LifecycleState::Closed);
    assert_eq!(files_in(dir.path()).len(), 1);
}

#[test]
fn stalled_writer_drops_frames_without_blocking() {
    let dir = tempfile::tempdir().unwrap();
    let tally = Tally::gated();
    let registry =
        SessionRegistry::with_encoders(config(dir.path()), Arc::new(tally.clone())).unwrap();
    registry.connect("busy");

    let payload = png_payload(8, 8, [7, 7, 7]);
    assert!(registry.add_frame("busy", payload.as_bytes(), None).unwrap().is_accepted());
    assert!(tally.wait_until_blocked(Duration::from_secs(5)));

    let mut accepted = 1;
    let mut dropped = 0;
    let mut slowest = Duration::ZERO;
    for _ in 0..1000 {
        let started = Instant::now();
        match registry.add_frame("busy", payload.as_bytes(), None).unwrap() {
            FrameOutcome::Accepted { .. } => accepted += 1,
            FrameOutcome::Dropped(DropReason::QueueFull { .. }) => dropped += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
        slowest = slowest.max(started.elapsed());
    }
    assert!(dropped >= 900, "only {dropped} dropped");
    assert!(slowest < Duration::from_millis(500), "add_frame took {slowest:?}");

    tally.open();
    let recording = registry.finalize("busy").unwrap();
    assert!(recording.drained);
    assert_eq!(recording.frames_written, accepted);
    assert_eq!(recording.frames_written, 1001 - recording.frames_dropped);
    assert_eq!(recording.stats.dropped_queue_full, dropped);
}

#[test]
fn drain_timeout_still_leaves_a_valid_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        drain_timeout_ms: 250,
        ..config(dir.path())
    };
    let slow = SlowY4m {
        delay: Duration::from_millis(100),
    };
    let registry = SessionRegistry::with_encoders(config, Arc::new(slow)).unwrap();
    registry.connect("slow");

    let payload = png_payload(4, 4, [200, 10, 10]);
    for _ in 0..20 {
        assert!(registry.add_frame("slow", payload.as_bytes(), None).unwrap().is_accepted());
    }

    let started = Instant::now();
    let recording = registry.finalize("slow").unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!recording.drained);
    assert!(recording.frames_written < 20);
    assert_eq!(
        fs::metadata(&recording.path).unwrap().len(),
        y4m_len(&recording.format, recording.frames_written)
    );
}

#[test]
fn frames_are_written_in_enqueue_order() {
    let dir = tempfile::tempdir().unwrap();
    let tally = Tally::default();
    let registry =
        SessionRegistry::with_encoders(config(dir.path()), Arc::new(tally.clone())).unwrap();
    registry.connect("ordered");

    let mut sequences = Vec::new();
    for shade in 0..50u8 {
        if shade % 10 == 5 {
            // A broken payload leaves no sequence gap of its own; it never decodes.
            registry.add_frame("ordered", b"###", None).unwrap();
        }
        match registry
            .add_frame("ordered", png_payload(6, 6, [shade, 0, 0]).as_bytes(), None)
            .unwrap()
        {
            FrameOutcome::Accepted { sequence, .. } => sequences.push(sequence),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    let recording = registry.finalize("ordered").unwrap();
    assert_eq!(recording.frames_written, 50);
    assert_eq!(recording.stats.dropped_decode, 5);
    assert_eq!(tally.written(), (0..50).collect::<Vec<u8>>());
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn unwritable_output_is_fatal_to_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let not_a_dir = dir.path().join("file");
    fs::write(&not_a_dir, b"occupied").unwrap();

    let recorder = SessionRecorder::new(
        SessionId::from("doomed"),
        Arc::new(config(&not_a_dir)),
        Arc::new(BuiltinEncoders(EncoderKind::Y4m)),
    );
    let err = recorder
        .add_frame(png_payload(4, 4, [0, 0, 0]).as_bytes(), None)
        .unwrap_err();
    assert!(matches!(err, RecorderError::SinkOpen { .. }));
    assert_eq!(recorder.state(), LifecycleState::Closed);
    assert_eq!(recorder.finalize(), None);

    let err = recorder
        .add_frame(png_payload(4, 4, [0, 0, 0]).as_bytes(), None)
        .unwrap_err();
    assert!(matches!(err, RecorderError::SessionClosed(_)));
}

#[test]
fn session_id_is_reusable_after_finalize() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(config(dir.path())).unwrap();
    let payload = png_payload(8, 8, [50, 50, 50]);

    let mut paths = Vec::new();
    for _ in 0..2 {
        registry.connect("again");
        registry.add_frame("again", payload.as_bytes(), None).unwrap();
        paths.push(registry.finalize("again").unwrap().path);
    }
    assert_ne!(paths[0], paths[1]);
    assert_eq!(files_in(dir.path()).len(), 2);
}

#[test]
fn image_sequence_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        encoder: EncoderKind::Frames,
        ..config(dir.path())
    };
    let registry = SessionRegistry::new(config).unwrap();
    registry.connect("pngs");
    for shade in [10, 20] {
        registry
            .add_frame("pngs", png_payload(5, 5, [shade, shade, shade]).as_bytes(), None)
            .unwrap();
    }

    let recording = registry.finalize("pngs").unwrap();
    assert!(recording.path.is_dir());
    assert!(recording.path.file_name().unwrap().to_string_lossy().starts_with("frames_"));
    let frames = files_in(&recording.path);
    assert_eq!(frames.len(), 2);
    assert!(frames[0].ends_with("frame_000000.png"));
}
