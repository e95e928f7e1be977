//! Host-facing session handle.
//!
//! [`Session::start`] opens the source, loads the capability providers and
//! spawns the worker. The handle is the only way to reach a running session;
//! [`Session::stop`] and [`Session::wait`] consume it, so nothing can be
//! called on a session after its teardown.
//!
//! The host and the worker share three things: the [`SharedState`] scalars,
//! the [`TrackingState`] behind a mutex, and the display buffer. Reads of the
//! scalars may observe the previous or the current cycle.

use crate::avatar::{AvatarRenderer, SpriteAvatar};
use crate::config::Config;
use crate::display::SharedDisplay;
use crate::face_detection::{load_detector, FaceDetector, FaceLocator};
use crate::frame_source::{self, FrameSource, SourceConfig, SourceInfo, SourceMode};
use crate::orientation::{orient, Orientation};
use crate::recorder::{expression_path, FrameRecorder};
use crate::tracking::{LandmarkTracker, OnnxLandmarkTracker, TrackerParams, TrackingState};
use crate::utils::clip_rect;
use crate::worker::{DisplayNotify, ExitReason, SessionSummary, Worker};
use crate::Result;
use log::{info, warn};
use opencv::{
    core::{Mat, Rect, Vector},
    imgcodecs,
    prelude::*,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Scalars shared between the host and the worker
#[derive(Debug, Default)]
pub struct SharedState {
    cancel: AtomicBool,
    orientation: AtomicU32,
    calibrated: AtomicBool,
    strength: AtomicI32,
    frame_count: AtomicU64,
    finished: AtomicBool,
    face: Mutex<Rect>,
}

impl SharedState {
    #[must_use]
    pub fn new(orientation: Orientation) -> Self {
        Self {
            orientation: AtomicU32::new(orientation.degrees()),
            ..Self::default()
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Orientation for the next normalization
    #[must_use]
    pub fn orientation(&self) -> Orientation {
        #[allow(clippy::cast_possible_wrap)]
        let degrees = self.orientation.load(Ordering::Relaxed) as i32;
        Orientation::from_degrees(degrees).unwrap_or_default()
    }

    pub fn set_orientation(&self, orientation: Orientation) {
        self.orientation.store(orientation.degrees(), Ordering::Relaxed);
    }

    /// Active face region of the latest cycle; empty when none was found
    #[must_use]
    pub fn face(&self) -> Rect {
        *self.face.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_face(&self, face: Rect) {
        *self.face.lock().unwrap_or_else(PoisonError::into_inner) = face;
    }

    pub fn publish_tracking(&self, strength: i32, calibrated: bool) {
        self.strength.store(strength, Ordering::Relaxed);
        self.calibrated.store(calibrated, Ordering::Relaxed);
    }

    #[must_use]
    pub fn strength(&self) -> i32 {
        self.strength.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.calibrated.load(Ordering::Relaxed)
    }

    /// Count one more consumed frame and return its 1-based index
    pub fn next_frame_index(&self) -> u64 {
        self.frame_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Capability providers of one session.
///
/// The detector is required. A tracker, its parameters or an avatar that
/// fails to load is logged and its pipeline stage becomes a no-op.
pub struct Capabilities {
    pub detector: Box<dyn FaceDetector>,
    pub tracker: Option<Box<dyn LandmarkTracker>>,
    pub tracker_params: TrackerParams,
    pub avatar: Option<Box<dyn AvatarRenderer>>,
}

impl Capabilities {
    /// Only a detector; tracking and overlay stay disabled
    #[must_use]
    pub fn detector_only(detector: Box<dyn FaceDetector>) -> Self {
        Self {
            detector,
            tracker: None,
            tracker_params: TrackerParams::default(),
            avatar: None,
        }
    }

    /// Load every provider named in `config`
    ///
    /// # Errors
    ///
    /// Returns an error only if the face detector cannot be loaded
    pub fn load(config: &Config) -> Result<Self> {
        let detector = load_detector(&config.models.face_detector, &config.face_detection)?;

        let params = match TrackerParams::from_file(&config.models.tracker_params) {
            Ok(params) => Some(params),
            Err(e) => {
                warn!(
                    "Tracker parameters unavailable ({}), tracking disabled: {e}",
                    config.models.tracker_params.display()
                );
                None
            }
        };

        let tracker = params.as_ref().and_then(|params| {
            match OnnxLandmarkTracker::load(config, params) {
                Ok(tracker) => Some(Box::new(tracker) as Box<dyn LandmarkTracker>),
                Err(e) => {
                    warn!("Landmark tracker unavailable, tracking disabled: {e}");
                    None
                }
            }
        });

        let avatar = match SpriteAvatar::load(&config.models.avatar) {
            Ok(avatar) => {
                let mut avatar: Box<dyn AvatarRenderer> = Box::new(avatar);
                if let Err(e) = avatar.select_variant(config.tracking.avatar_variant) {
                    warn!("Keeping default avatar variant: {e}");
                }
                Some(avatar)
            }
            Err(e) => {
                warn!(
                    "Avatar unavailable ({}), overlay disabled: {e}",
                    config.models.avatar.display()
                );
                None
            }
        };

        Ok(Self {
            detector,
            tracker,
            tracker_params: params.unwrap_or_default(),
            avatar,
        })
    }
}

/// Session behavior that is not a capability
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub orientation: Orientation,
    pub auto_calibrate: bool,
    pub annotate: bool,
    /// Where a file session exports its records; next to the source when `None`
    pub export_path: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            orientation: Orientation::default(),
            auto_calibrate: true,
            annotate: true,
            export_path: None,
        }
    }
}

impl SessionOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            auto_calibrate: config.tracking.auto_calibrate,
            annotate: config.tracking.annotate,
            ..Self::default()
        }
    }
}

/// Handle to a running session
pub struct Session {
    info: SourceInfo,
    source: Arc<dyn FrameSource>,
    shared: Arc<SharedState>,
    tracking: Arc<Mutex<TrackingState>>,
    worker: Option<JoinHandle<SessionSummary>>,
}

impl Session {
    /// Open `source`, load the providers named in `config` and start the
    /// worker
    ///
    /// # Errors
    ///
    /// Returns the initialization failure, an invalid `config` included; no
    /// worker is spawned then
    pub fn start(
        config: &Config,
        source: &SourceConfig,
        display: SharedDisplay,
        notify: DisplayNotify,
    ) -> Result<Self> {
        info!("Starting session, mode {:?}", source.mode());
        config.validate()?;
        let capabilities = Capabilities::load(config)?;
        let source = frame_source::open(source)?;
        Self::start_with(source, capabilities, SessionOptions::from_config(config), display, notify)
    }

    /// Start a worker on an already opened source
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned
    pub fn start_with(
        source: Arc<dyn FrameSource>,
        capabilities: Capabilities,
        options: SessionOptions,
        display: SharedDisplay,
        notify: DisplayNotify,
    ) -> Result<Self> {
        let info = source.info().clone();
        let shared = Arc::new(SharedState::new(options.orientation));
        let tracking = Arc::new(Mutex::new(TrackingState::new(
            capabilities.tracker,
            capabilities.tracker_params,
            capabilities.avatar,
            options.auto_calibrate,
        )));

        let recorder = (info.mode == SourceMode::DemuxedFile).then(|| {
            let output = options
                .export_path
                .clone()
                .unwrap_or_else(|| expression_path(Path::new(&info.identifier)));
            FrameRecorder::with_output(&info, output)
        });

        let worker = Worker::new(
            Arc::clone(&source),
            Arc::clone(&shared),
            Arc::clone(&tracking),
            FaceLocator::new(capabilities.detector),
            display,
            notify,
            recorder,
            options.annotate,
        );

        let handle = match thread::Builder::new()
            .name("pipeline-worker".to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                source.close();
                return Err(e.into());
            }
        };

        info!(
            "Session started on {} ({}x{} @ {:.2} fps)",
            info.identifier, info.width, info.height, info.fps
        );
        Ok(Self {
            info,
            source,
            shared,
            tracking,
            worker: Some(handle),
        })
    }

    #[must_use]
    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    /// Rotation applied from the next cycle on
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for anything but 0, 90, 180 or 270
    pub fn set_orientation(&self, degrees: i32) -> Result<()> {
        let orientation = Orientation::from_degrees(degrees)?;
        self.shared.set_orientation(orientation);
        info!("Orientation set to {degrees}");
        Ok(())
    }

    /// Drop calibration and the tracker's history
    pub fn reset_tracking(&self) {
        let mut tracking = self.lock_tracking();
        tracking.reset();
        self.shared
            .publish_tracking(tracking.strength(), tracking.is_calibrated());
    }

    /// Calibrate the avatar on the current frame. `false` when no face is
    /// active, tracking is too weak or the frame is unavailable.
    pub fn request_calibration(&self) -> bool {
        if !has_area(self.shared.face()) {
            warn!("Cannot calibrate, no active face region");
            return false;
        }

        let frame = match self.current_oriented_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot calibrate, no current frame: {e}");
                return false;
            }
        };

        let mut tracking = self.lock_tracking();
        let calibrated = match tracking.request_calibration(&frame) {
            Ok(calibrated) => calibrated,
            Err(e) => {
                warn!("Calibration failed: {e}");
                false
            }
        };
        self.shared
            .publish_tracking(tracking.strength(), tracking.is_calibrated());
        calibrated
    }

    /// Write the active face region of the current frame to `path`.
    /// `false` when no face is active or the image cannot be written.
    pub fn save_current_face<P: AsRef<Path>>(&self, path: P) -> bool {
        let face = self.shared.face();
        if !has_area(face) {
            warn!("No active face region to save");
            return false;
        }

        match self.write_face(face, path.as_ref()) {
            Ok(written) => written,
            Err(e) => {
                warn!("Failed to save face to {}: {e}", path.as_ref().display());
                false
            }
        }
    }

    #[must_use]
    pub fn active_face_region(&self) -> Rect {
        self.shared.face()
    }

    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.shared.is_calibrated()
    }

    #[must_use]
    pub fn tracker_strength(&self) -> i32 {
        self.shared.strength()
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count()
    }

    /// Whether the worker has torn down
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// Cancel the worker and block until its teardown completes
    #[must_use = "the summary reports how the session ended"]
    pub fn stop(mut self) -> SessionSummary {
        self.shutdown(true)
    }

    /// Block until the worker ends on its own (end of a file)
    #[must_use = "the summary reports how the session ended"]
    pub fn wait(mut self) -> SessionSummary {
        self.shutdown(false)
    }

    fn shutdown(&mut self, cancel: bool) -> SessionSummary {
        if cancel {
            info!("Stopping session");
            self.shared.request_cancel();
            self.source.interrupt();
        }

        let fallback = |shared: &SharedState| SessionSummary {
            frames_processed: shared.frame_count(),
            frames_recorded: 0,
            exit: ExitReason::Panicked,
        };

        let Some(handle) = self.worker.take() else {
            return fallback(&self.shared);
        };
        match handle.join() {
            Ok(summary) => summary,
            Err(_) => {
                log::error!("Worker thread panicked");
                fallback(&self.shared)
            }
        }
    }

    fn lock_tracking(&self) -> std::sync::MutexGuard<'_, TrackingState> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_oriented_frame(&self) -> Result<Mat> {
        let raw = self.source.current_frame()?;
        let (frame, _) = orient(&raw, self.shared.orientation())?;
        Ok(frame)
    }

    fn write_face(&self, face: Rect, path: &Path) -> Result<bool> {
        let frame = self.current_oriented_frame()?;
        let region = clip_rect(face, frame.cols(), frame.rows());
        if region.width <= 0 || region.height <= 0 {
            warn!("Face region {face:?} lies outside the current frame");
            return Ok(false);
        }

        let crop = Mat::roi(&frame, region)?.try_clone()?;
        let written = imgcodecs::imwrite(&path.to_string_lossy(), &crop, &Vector::new())?;
        if written {
            info!("Saved face {region:?} to {}", path.display());
        }
        Ok(written)
    }
}

fn has_area(rect: Rect) -> bool {
    rect.width > 0 && rect.height > 0
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.shutdown(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_state_defaults() {
        let shared = SharedState::new(Orientation::Deg90);
        assert_eq!(shared.orientation(), Orientation::Deg90);
        assert!(!shared.is_cancelled());
        assert!(!shared.is_calibrated());
        assert_eq!(shared.face(), Rect::default());
        assert_eq!(shared.frame_count(), 0);
    }

    #[test]
    fn test_frame_indices_are_one_based() {
        let shared = SharedState::default();
        assert_eq!(shared.next_frame_index(), 1);
        assert_eq!(shared.next_frame_index(), 2);
        assert_eq!(shared.frame_count(), 2);
    }

    #[test]
    fn test_orientation_round_trip() {
        let shared = SharedState::default();
        for degrees in [0, 90, 180, 270] {
            let orientation = Orientation::from_degrees(degrees).unwrap();
            shared.set_orientation(orientation);
            assert_eq!(shared.orientation(), orientation);
        }
    }

    #[test]
    fn test_options_follow_config() {
        let mut config = Config::default();
        config.tracking.auto_calibrate = false;
        config.tracking.annotate = false;
        let options = SessionOptions::from_config(&config);
        assert!(!options.auto_calibrate);
        assert!(!options.annotate);
        assert_eq!(options.orientation, Orientation::Deg0);
    }

    #[test]
    fn test_capabilities_require_detector() {
        let mut config = Config::default();
        config.models.face_detector = PathBuf::from("/nonexistent/detector.xml");
        assert!(Capabilities::load(&config).is_err());
    }
}
