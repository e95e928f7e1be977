//! Frame source behavior over real files and mock devices


use face_overlay_pipeline::{
    frame_source::{self, live::LiveCaptureSource, FrameSource, SourceConfig, SourceMode},
    Error, SourceError,
};
use opencv::core::Vec3b;
use opencv::prelude::*;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use test_helpers::{init_logging, write_y4m, write_y4m_with_colorspace, StalledDevice, SteadyDevice};

#[test]
fn test_y4m_file_yields_every_frame_then_ends() {
    init_logging();
    let path = write_y4m("three_frames", 32, 16, 3, |i| 60 + 40 * i as u8);
    let source = frame_source::open(&SourceConfig::file(&path)).unwrap();

    let info = source.info();
    assert_eq!(info.mode, SourceMode::DemuxedFile);
    assert_eq!((info.width, info.height), (32, 16));
    assert!((info.fps - 25.0).abs() < 1e-9);

    let mut lumas = Vec::new();
    for _ in 0..3 {
        let frame = source.next_frame().unwrap();
        assert_eq!((frame.cols(), frame.rows()), (32, 16));
        lumas.push(frame.at_2d::<Vec3b>(8, 16).unwrap()[1]);
    }
    assert!(lumas[0] < lumas[1] && lumas[1] < lumas[2]);

    assert_eq!(source.next_frame().unwrap_err(), SourceError::EndOfStream);
    assert_eq!(source.next_frame().unwrap_err(), SourceError::EndOfStream);

    source.close();
    let _ = std::fs::remove_file(path);
}

#[test]
fn test_current_frame_does_not_advance() {
    init_logging();
    let path = write_y4m("current_frame", 16, 16, 2, |i| if i == 0 { 30 } else { 200 });
    let source = frame_source::open(&SourceConfig::file(&path)).unwrap();

    assert!(source.current_frame().is_err());
    let first = source.next_frame().unwrap();
    let again = source.current_frame().unwrap();
    let once_more = source.current_frame().unwrap();

    let pixel = |m: &opencv::core::Mat| *m.at_2d::<Vec3b>(4, 4).unwrap();
    assert_eq!(pixel(&first), pixel(&again));
    assert_eq!(pixel(&again), pixel(&once_more));

    let second = source.next_frame().unwrap();
    assert!(pixel(&second)[0] > pixel(&first)[0]);

    let _ = std::fs::remove_file(path);
}

#[test]
fn test_closed_file_source_fails_fast() {
    let path = write_y4m("closed", 16, 16, 2, |_| 10);
    let source = frame_source::open(&SourceConfig::file(&path)).unwrap();
    source.close();
    source.close();

    assert_eq!(source.next_frame().unwrap_err(), SourceError::Closed);
    assert!(source.current_frame().is_err());

    let _ = std::fs::remove_file(path);
}

#[test]
fn test_unsupported_colorspace_has_no_decoder() {
    for colorspace in ["444", "420p10"] {
        let path = write_y4m_with_colorspace(&format!("c{colorspace}"), 16, 16, 1, colorspace, |_| 10);
        match frame_source::open(&SourceConfig::file(&path)) {
            Err(Error::NoDecoder(codec)) => assert!(codec.contains(colorspace), "{codec}"),
            Err(e) => panic!("Expected NoDecoder for {colorspace}, got {e}"),
            Ok(_) => panic!("Expected NoDecoder for {colorspace}, got a source"),
        }
        let _ = std::fs::remove_file(path);
    }
}

#[test]
fn test_missing_file_fails_to_open() {
    let result = frame_source::open(&SourceConfig::file("/nonexistent/clip.y4m"));
    assert!(matches!(result, Err(Error::SourceOpen(_))));
}

#[test]
fn test_live_source_delivers_newest_frames() {
    init_logging();
    let source = LiveCaptureSource::with_device(Box::new(SteadyDevice { width: 48, height: 32 }), "steady".into())
        .unwrap();
    assert_eq!(source.info().mode, SourceMode::LiveCapture);
    assert_eq!((source.info().width, source.info().height), (48, 32));

    for _ in 0..3 {
        let frame = source.next_frame().unwrap();
        assert_eq!((frame.cols(), frame.rows()), (48, 32));
    }
    assert!(source.current_frame().is_ok());

    source.close();
    assert_eq!(source.next_frame().unwrap_err(), SourceError::Closed);
}

#[test]
fn test_interrupt_unblocks_waiting_consumer() {
    init_logging();
    let device = StalledDevice {
        reads: Arc::new(AtomicBool::new(false)),
    };
    let source = Arc::new(LiveCaptureSource::with_device(Box::new(device), "stalled".into()).unwrap());

    let waiter = {
        let source = Arc::clone(&source);
        thread::spawn(move || {
            let started = Instant::now();
            (source.next_frame(), started.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(50));
    source.interrupt();
    let (result, waited) = waiter.join().unwrap();

    assert_eq!(result.unwrap_err(), SourceError::Interrupted);
    assert!(waited < Duration::from_secs(2));
    assert_eq!(source.next_frame().unwrap_err(), SourceError::Interrupted);
}
