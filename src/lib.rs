//! Real-time face tracking pipeline with avatar overlay.
//!
//! A dedicated worker turns raw video frames into letterboxed display frames:
//! - frames come from a live camera or a demuxed media file
//! - each frame is oriented upright and converted to grayscale
//! - the largest detected face becomes the active face region
//! - a landmark tracker scores and shapes the face; once calibrated, an
//!   avatar is composited over it
//! - file sessions record every frame's tracking result and export them as
//!   JSON on teardown
//! - the processed frame is scaled into a shared RGBA buffer and the host is
//!   told which region changed
//!
//! Detection, landmark tracking, avatar rendering and demuxing are traits;
//! the crate ships `OpenCV` and ONNX Runtime implementations of each.
//!
//! # Examples
//!
//! ## File session
//!
//! ```no_run
//! use face_overlay_pipeline::{
//!     config::Config,
//!     display::{DisplayBuffer, PixelFormat},
//!     frame_source::SourceConfig,
//!     Session,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("config.yaml")?;
//! let display = DisplayBuffer::new(config.display.width, config.display.height, PixelFormat::Rgba8888)?.shared();
//!
//! let session = Session::start(
//!     &config,
//!     &SourceConfig::file("clip.y4m"),
//!     display,
//!     Box::new(|rect| log::debug!("updated {rect:?}")),
//! )?;
//!
//! // Records are exported to clip.expression.json when the worker ends
//! let summary = session.wait();
//! println!("{} frames, {:?}", summary.frames_processed, summary.exit);
//! # Ok(())
//! # }
//! ```
//!
//! ## Live session with host commands
//!
//! ```no_run
//! use face_overlay_pipeline::{
//!     config::Config,
//!     display::{DisplayBuffer, PixelFormat},
//!     frame_source::SourceConfig,
//!     Session,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let display = DisplayBuffer::new(800, 600, PixelFormat::Rgba8888)?.shared();
//! let session = Session::start(&config, &SourceConfig::camera(&config.camera), display, Box::new(|_| {}))?;
//!
//! session.set_orientation(90)?;
//! if !session.request_calibration() {
//!     println!("Face tracking too weak to calibrate");
//! }
//! session.save_current_face("face.png");
//!
//! let summary = session.stop();
//! println!("stopped after {} frames", summary.frames_processed);
//! # Ok(())
//! # }
//! ```

/// Capability trait and sprite renderer for the avatar overlay
pub mod avatar;

/// Configuration management
pub mod config;

/// Constants used throughout the pipeline
pub mod constants;

/// Destination pixel buffer and letterbox compositing
pub mod display;

/// Error types and result handling
pub mod error;

/// Face detection and active face selection
pub mod face_detection;

/// Landmark shape smoothing
pub mod filters;

/// Live capture and demuxed file sources
pub mod frame_source;

/// 68-point facial landmark regression
pub mod mark_detection;

/// Frame orientation and grayscale derivation
pub mod orientation;

/// Head pose and 3-D landmark shape using `PnP`
pub mod pose_estimation;

/// Per-frame tracking records and their export
pub mod recorder;

/// Host-facing session handle
pub mod session;

/// Landmark tracking and calibration
pub mod tracking;

/// Utility functions for rectangles and numeric casts
pub mod utils;

/// Per-cycle pipeline and worker loop
pub mod worker;

pub use error::{Error, Result, SourceError};
pub use session::{Capabilities, Session, SessionOptions};
pub use worker::{ExitReason, SessionSummary};
