//! Error handling tests for all modules


use face_overlay_pipeline::{
    avatar::{AvatarRenderer, SpriteAvatar},
    config::Config,
    display::{DisplayBuffer, DisplayCompositor, PixelFormat},
    filters::{create_filter, FilterKind},
    frame_source::{
        demux::{find_decoder, CodecId, MediaType, RawFormat, StreamInfo},
        DemuxedFileSource, SourceConfig,
    },
    orientation::{Orientation, OrientationNormalizer},
    recorder::{FrameRecord, FrameRecorder},
    tracking::TrackerParams,
    utils::{refine_boxes, safe_cast::*},
    Capabilities, Error, Session,
};
use opencv::core::{Mat, Rect, Scalar, CV_8UC1};
use opencv::prelude::*;
use std::path::Path;
use test_helpers::{rgba_display, solid_frame, temp_path, write_y4m};

#[test]
fn test_filter_creation_errors() {
    let result = create_filter(FilterKind::MovingAverage, 0.5, 0);
    match result {
        Err(Error::ConfigError(msg)) => assert!(msg.contains("window")),
        Err(e) => panic!("Expected ConfigError, got {e}"),
        Ok(_) => panic!("Expected ConfigError"),
    }

    assert!(matches!(create_filter(FilterKind::Exponential, 2.0, 5), Err(Error::ConfigError(_))));
    assert!(matches!(create_filter(FilterKind::Exponential, -0.1, 5), Err(Error::ConfigError(_))));
    assert!(create_filter(FilterKind::Kalman, 0.5, 5).is_ok());
    assert!(create_filter(FilterKind::None, 0.0, 0).is_ok());
}

#[test]
fn test_invalid_orientation_degrees() {
    for degrees in [-90, 45, 360, 1] {
        assert!(matches!(Orientation::from_degrees(degrees), Err(Error::InvalidInput(_))));
    }
}

#[test]
fn test_normalizer_rejects_unusable_frames() {
    let mut normalizer = OrientationNormalizer::new();
    assert!(normalizer.normalize(&Mat::default(), Orientation::Deg0).is_err());

    let gray = Mat::new_rows_cols_with_default(8, 8, CV_8UC1, Scalar::all(0.0)).unwrap();
    assert!(matches!(
        normalizer.normalize(&gray, Orientation::Deg90),
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(normalizer.reallocations(), 0);
}

#[test]
fn test_display_buffer_errors() {
    assert!(DisplayBuffer::new(0, 10, PixelFormat::Rgba8888).is_err());
    assert!(DisplayBuffer::new(10, -1, PixelFormat::Rgba8888).is_err());

    // Wrong pixel format skips the cycle without failing
    let mut buffer = DisplayBuffer::new(16, 16, PixelFormat::Rgb565).unwrap();
    let mut compositor = DisplayCompositor::new();
    assert_eq!(compositor.composite(&solid_frame(8, 8, 10.0), &mut buffer).unwrap(), None);
    assert!(buffer.pixels().iter().all(|&b| b == 0));
}

#[test]
fn test_tracker_params_errors() {
    assert!(TrackerParams::from_file("/nonexistent/params.yaml").is_err());

    let path = temp_path("bad_params", "yaml");
    std::fs::write(&path, "search_expansion: [1, 2]\n").unwrap();
    assert!(matches!(TrackerParams::from_file(&path), Err(Error::ConfigError(_))));

    std::fs::write(&path, "filter: moving_average\nfilter_window: 0\n").unwrap();
    assert!(matches!(TrackerParams::from_file(&path), Err(Error::ConfigError(_))));
    let _ = std::fs::remove_file(path);
}

#[test]
fn test_config_errors() {
    assert!(Config::from_file("/nonexistent/config.yaml").is_err());

    let path = temp_path("bad_config", "yaml");
    std::fs::write(&path, "camera: [not, a, map]\n").unwrap();
    assert!(matches!(Config::from_file(&path), Err(Error::ConfigError(_))));
    let _ = std::fs::remove_file(path);

    let mut config = Config::default();
    config.display.width = 0;
    assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
}

#[test]
fn test_missing_detector_is_fatal() {
    let mut config = Config::default();
    config.models.face_detector = "/nonexistent/face.onnx".into();
    assert!(Capabilities::load(&config).is_err());

    config.models.face_detector = "/nonexistent/face.bin".into();
    assert!(matches!(Capabilities::load(&config), Err(Error::ModelError(_))));
}

#[test]
fn test_session_start_rejects_invalid_config() {
    let video = write_y4m("invalid_config", 16, 16, 1, |_| 10);

    let mut config = Config::default();
    config.face_detection.scale_factor = 1.0;
    let result = Session::start(&config, &SourceConfig::file(&video), rgba_display(16, 16), Box::new(|_| {}));
    match result {
        Err(Error::ConfigError(msg)) => assert!(msg.contains("Scale factor")),
        Err(e) => panic!("Expected ConfigError, got {e}"),
        Ok(_) => panic!("Expected ConfigError, got a session"),
    }

    let mut config = Config::default();
    config.face_detection.confidence_threshold = 1.5;
    assert!(matches!(
        Session::start(&config, &SourceConfig::file(&video), rgba_display(16, 16), Box::new(|_| {})),
        Err(Error::ConfigError(_))
    ));

    let _ = std::fs::remove_file(video);
}

#[test]
fn test_source_open_errors() {
    assert!(matches!(
        DemuxedFileSource::open(Path::new("/nonexistent/clip.y4m")),
        Err(Error::SourceOpen(_))
    ));

    let path = temp_path("not_y4m", "y4m");
    std::fs::write(&path, b"RIFF....AVI LIST").unwrap();
    assert!(matches!(DemuxedFileSource::open(&path), Err(Error::SourceOpen(_))));
    let _ = std::fs::remove_file(path);
}

#[test]
fn test_decoder_selection_errors() {
    let mut stream = StreamInfo {
        index: 0,
        media_type: MediaType::Video,
        codec: CodecId::Other("h264".into()),
        width: 64,
        height: 48,
        fps: 30.0,
    };
    assert!(matches!(find_decoder(&stream), Err(Error::NoDecoder(_))));

    stream.codec = CodecId::RawVideo(RawFormat::I420);
    stream.width = 0;
    assert!(matches!(find_decoder(&stream), Err(Error::CodecOpen(_))));
}

#[test]
fn test_avatar_errors() {
    assert!(SpriteAvatar::load(Path::new("/nonexistent/avatars")).is_err());

    let sprite = solid_frame(8, 8, 255.0);
    let mut avatar = SpriteAvatar::from_images(vec![sprite]).unwrap();
    assert!(avatar.select_variant(3).is_err());
    assert!(avatar.initialise(&solid_frame(32, 32, 0.0), &[]).is_err());
}

#[test]
fn test_recorder_rejects_out_of_order_records() {
    let info = face_overlay_pipeline::frame_source::SourceInfo {
        mode: face_overlay_pipeline::frame_source::SourceMode::DemuxedFile,
        identifier: "clip.y4m".into(),
        width: 8,
        height: 8,
        fps: 25.0,
    };
    let output = temp_path("out_of_order", "expression.json");
    let mut recorder = FrameRecorder::with_output(&info, output.clone());
    assert!(matches!(recorder.record(FrameRecord::empty(2)), Err(Error::InvalidInput(_))));

    assert_eq!(recorder.export().unwrap(), Some(output.clone()));
    assert!(face_overlay_pipeline::recorder::ExpressionDocument::from_file(&output)
        .unwrap()
        .frames
        .is_empty());
    let _ = std::fs::remove_file(output);
}

#[test]
fn test_refine_boxes_and_casts() {
    let mut boxes = vec![Rect::new(10, 10, 20, 20)];
    assert!(refine_boxes(&mut boxes, 100, 100, 0.1).is_ok());
    assert!(boxes[0].x >= 0 && boxes[0].x + boxes[0].width <= 100);

    assert!(i32_to_usize(-1).is_err());
    assert!(usize_to_i32(usize::MAX).is_err());
    assert!(f64_to_i32(f64::NAN).is_err());
    assert_eq!(f32_to_i32_clamp(1e9, 0, 10), 10);
}
