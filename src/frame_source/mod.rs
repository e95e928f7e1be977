//! Frame acquisition from a live camera or a demuxed media file.
//!
//! Both variants implement [`FrameSource`]. A source is shared between the
//! worker, which pulls frames with [`FrameSource::next_frame`], and the host,
//! which may re-derive the last frame with [`FrameSource::current_frame`] to
//! calibrate or save a face. Methods take `&self`; each variant guards its
//! decoding state internally so a blocked wait never holds a lock the host
//! needs.

/// Demuxed file variant: stream selection, packet loop, color conversion
pub mod demux;

/// Live capture variant: capture thread and interruptible frame slot
pub mod live;

/// `OpenCV` `VideoCapture` container backend
pub mod videoio;

/// Native YUV4MPEG2 container backend
pub mod y4m;

use crate::config::CameraConfig;
use crate::error::SourceError;
use crate::Result;
use opencv::core::Mat;
use std::path::PathBuf;
use std::sync::Arc;

pub use demux::DemuxedFileSource;
pub use live::LiveCaptureSource;

/// Kind of frame source a session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// Continuous device stream
    LiveCapture,
    /// Container demux, codec decode, color conversion
    DemuxedFile,
}

/// How to open a frame source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    /// Camera device with requested geometry
    Camera { index: i32, width: i32, height: i32 },
    /// Media file on disk
    File { path: PathBuf },
}

impl SourceConfig {
    /// Camera source from the camera configuration section
    #[must_use]
    pub fn camera(config: &CameraConfig) -> Self {
        Self::Camera {
            index: config.index,
            width: config.width,
            height: config.height,
        }
    }

    /// File source
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self::File { path: path.into() }
    }

    #[must_use]
    pub fn mode(&self) -> SourceMode {
        match self {
            Self::Camera { .. } => SourceMode::LiveCapture,
            Self::File { .. } => SourceMode::DemuxedFile,
        }
    }
}

/// Metadata fixed when a source is opened
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub mode: SourceMode,
    /// Device name or file path
    pub identifier: String,
    pub width: i32,
    pub height: i32,
    pub fps: f64,
}

/// "Get next frame" over live and file sources
pub trait FrameSource: Send + Sync {
    /// Metadata captured at open time
    fn info(&self) -> &SourceInfo;

    /// Block until the next 8-bit BGR frame is available
    ///
    /// # Errors
    ///
    /// `EndOfStream` when exhausted, `Decode`/`Device` on hard failures,
    /// `Interrupted` after [`FrameSource::interrupt`], `Closed` after
    /// [`FrameSource::close`]
    fn next_frame(&self) -> std::result::Result<Mat, SourceError>;

    /// Re-derive the most recently produced frame without advancing
    ///
    /// # Errors
    ///
    /// Returns an error if no frame was produced yet or the source is closed
    fn current_frame(&self) -> Result<Mat>;

    /// Wake any blocked [`FrameSource::next_frame`] call; later calls fail fast
    fn interrupt(&self);

    /// Release the device or decoder; idempotent
    fn close(&self);
}

/// Open the source described by `config`
///
/// # Errors
///
/// Returns the initialization failure (device unavailable, unreadable file,
/// no video stream, no decoder, codec open failure)
pub fn open(config: &SourceConfig) -> Result<Arc<dyn FrameSource>> {
    log::info!("Initializing source, mode {:?}", config.mode());

    match config {
        SourceConfig::Camera { index, width, height } => {
            Ok(Arc::new(LiveCaptureSource::open(*index, *width, *height)?))
        }
        SourceConfig::File { path } => Ok(Arc::new(DemuxedFileSource::open(path)?)),
    }
}
