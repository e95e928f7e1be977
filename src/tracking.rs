//! Landmark tracking and the calibration state machine.
//!
//! A [`LandmarkTracker`] fits a 68-point shape to the located face of an
//! oriented grayscale frame and scores the fit with a strength.
//! [`TrackingState`] owns the tracker and the avatar renderer and decides
//! when the avatar's reference pose is fixed:
//!
//! * uninitialized: not calibrated, strength below [`MIN_FACE_STRENGTH`]
//! * tracking: not calibrated, strength qualifies
//! * calibrated: reference pose fixed; the overlay runs on every cycle
//!   whose strength qualifies
//!
//! Calibration needs a located face. A cycle without one never calibrates.
//!
//! Calibration is sticky. Weak tracking never clears it, only
//! [`TrackingState::reset`] does.

use crate::avatar::AvatarRenderer;
use crate::config::Config;
use crate::constants::{MIN_FACE_STRENGTH, NUM_FACIAL_LANDMARKS};
use crate::filters::{create_filter, FilterKind, ShapeFilter};
use crate::mark_detection::MarkDetector;
use crate::pose_estimation::PoseEstimator;
use crate::utils::refine_boxes;
use crate::{Error, Result};
use log::{debug, info, warn};
use opencv::{
    core::{Mat, Point2f, Point3f, Rect, Size},
    imgproc,
    prelude::*,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Parameters handed to the tracker with every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    /// Fraction of the face box added on each side before landmark fitting
    pub search_expansion: f32,

    /// Faces smaller than this (pixels) are not tracked
    pub min_face_size: i32,

    /// Upper bound of the strength score
    pub max_strength: i32,

    /// Landmark smoothing
    pub filter: FilterKind,

    /// Weight of the newest shape for exponential smoothing
    pub filter_alpha: f32,

    /// Shapes averaged by the moving average filter
    pub filter_window: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            search_expansion: 0.1,
            min_face_size: 40,
            max_strength: 10,
            filter: FilterKind::default(),
            filter_alpha: 0.5,
            filter_window: 5,
        }
    }
}

impl TrackerParams {
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let params: Self = serde_yaml::from_str(&contents)
            .map_err(|e| Error::ConfigError(format!("Failed to parse tracker params: {e}")))?;
        params.validate()?;
        Ok(params)
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` for out-of-range values
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.search_expansion) {
            return Err(Error::ConfigError("search_expansion must be between 0.0 and 1.0".into()));
        }
        if self.min_face_size < 0 {
            return Err(Error::ConfigError("min_face_size must not be negative".into()));
        }
        if self.max_strength < MIN_FACE_STRENGTH {
            return Err(Error::ConfigError(format!(
                "max_strength must be at least {MIN_FACE_STRENGTH}"
            )));
        }
        create_filter(self.filter, self.filter_alpha, self.filter_window).map(|_| ())
    }
}

/// Per-frame landmark tracker
pub trait LandmarkTracker: Send {
    /// Track `gray` around the located `face` and return the strength of
    /// the fit. `face` is empty when the locator found no candidate.
    ///
    /// # Errors
    ///
    /// Returns an error if tracking failed for this frame
    fn new_frame(&mut self, gray: &Mat, face: Rect, params: &TrackerParams) -> Result<i32>;

    /// Latest 2-D shape
    fn shape(&self) -> Vec<Point2f>;

    /// Latest 3-D shape, when the tracker supports it
    fn shape_3d(&self) -> Option<Vec<Point3f>>;

    /// Forget tracking history
    fn reset(&mut self);
}

/// Whether a strength score is good enough to use the shape
#[must_use]
pub fn strength_qualifies(strength: i32) -> bool {
    strength >= MIN_FACE_STRENGTH
}

/// Tracker built from the ONNX landmark regressor and an optional PnP solve
/// for the 3-D shape. It fits inside the face region the locator found.
///
/// Strength counts consecutive frames with a full shape, capped at
/// `max_strength`, and drops to zero when the face is lost.
pub struct OnnxLandmarkTracker {
    marks: MarkDetector,
    pose: Option<PoseEstimator>,
    filter: Box<dyn ShapeFilter>,
    filter_kind: FilterKind,
    bgr: Mat,
    shape: Vec<Point2f>,
    shape_3d: Option<Vec<Point3f>>,
    strength: i32,
}

impl OnnxLandmarkTracker {
    /// # Errors
    ///
    /// Returns an error if the filter parameters are invalid
    pub fn new(marks: MarkDetector, pose: Option<PoseEstimator>, params: &TrackerParams) -> Result<Self> {
        Ok(Self {
            marks,
            pose,
            filter: create_filter(params.filter, params.filter_alpha, params.filter_window)?,
            filter_kind: params.filter,
            bgr: Mat::default(),
            shape: Vec::new(),
            shape_3d: None,
            strength: 0,
        })
    }

    /// Load the landmark and 3-D face models named in `config`.
    /// A missing 3-D model only disables the 3-D shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the landmark model cannot be loaded
    pub fn load(config: &Config, params: &TrackerParams) -> Result<Self> {
        let marks = MarkDetector::new(&config.models.face_landmarks)?;
        let pose = match PoseEstimator::new(&config.models.face_model_3d) {
            Ok(pose) => Some(pose),
            Err(e) => {
                warn!("3-D face model unavailable, tracking in 2-D only: {e}");
                None
            }
        };
        Self::new(marks, pose, params)
    }

    fn lose(&mut self) {
        self.shape.clear();
        self.shape_3d = None;
        self.strength = 0;
        self.filter.reset();
    }

    fn fit(&mut self, gray: &Mat, face: Rect, params: &TrackerParams) -> Result<Option<Vec<Point2f>>> {
        if face.width <= 0 || face.height <= 0 || face.width < params.min_face_size || face.height < params.min_face_size {
            return Ok(None);
        }

        let mut regions = [face];
        refine_boxes(&mut regions, gray.cols(), gray.rows(), params.search_expansion)?;

        imgproc::cvt_color(gray, &mut self.bgr, imgproc::COLOR_GRAY2BGR, 0)?;
        let mut shape = self.marks.detect(&self.bgr, regions[0])?;
        if shape.len() != NUM_FACIAL_LANDMARKS {
            return Ok(None);
        }

        self.filter.apply(&mut shape);
        Ok(Some(shape))
    }
}

impl LandmarkTracker for OnnxLandmarkTracker {
    fn new_frame(&mut self, gray: &Mat, face: Rect, params: &TrackerParams) -> Result<i32> {
        if params.filter != self.filter_kind {
            self.filter = create_filter(params.filter, params.filter_alpha, params.filter_window)?;
            self.filter_kind = params.filter;
        }

        let Some(shape) = self.fit(gray, face, params)? else {
            self.lose();
            return Ok(0);
        };

        self.shape_3d = self.pose.as_ref().and_then(|pose| {
            pose.shape_3d(&shape, Size::new(gray.cols(), gray.rows()))
                .map_err(|e| debug!("No 3-D shape this frame: {e}"))
                .ok()
        });
        self.shape = shape;
        self.strength = (self.strength + 1).min(params.max_strength);
        Ok(self.strength)
    }

    fn shape(&self) -> Vec<Point2f> {
        self.shape.clone()
    }

    fn shape_3d(&self) -> Option<Vec<Point3f>> {
        self.shape_3d.clone()
    }

    fn reset(&mut self) {
        self.lose();
    }
}

/// Calibration flags for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    calibrated: bool,
    auto_pending: bool,
}

impl Calibration {
    /// With `auto_calibrate`, the first qualifying frame calibrates
    #[must_use]
    pub fn new(auto_calibrate: bool) -> Self {
        Self {
            calibrated: false,
            auto_pending: auto_calibrate,
        }
    }

    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// This frame is the session's first qualifying one in automatic mode
    #[must_use]
    pub fn should_auto_calibrate(&self, strength: i32) -> bool {
        !self.calibrated && self.auto_pending && strength_qualifies(strength)
    }

    /// Reference pose fixed
    pub fn accept(&mut self) {
        self.calibrated = true;
        self.auto_pending = false;
    }

    /// Back to uninitialized; only an explicit request calibrates again
    pub fn reset(&mut self) {
        self.calibrated = false;
        self.auto_pending = false;
    }

    #[must_use]
    pub fn overlay_enabled(&self, strength: i32) -> bool {
        self.calibrated && strength_qualifies(strength)
    }
}

/// Shape produced by a qualifying frame
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackedShape {
    pub points: Vec<Point2f>,
    /// Empty when the tracker has no 3-D shape
    pub points_3d: Vec<Point3f>,
}

/// Tracker, avatar and calibration of one session.
///
/// Shared by the worker and the host behind a mutex; the worker holds it for
/// the tracking part of a cycle.
pub struct TrackingState {
    tracker: Option<Box<dyn LandmarkTracker>>,
    params: TrackerParams,
    avatar: Option<Box<dyn AvatarRenderer>>,
    calibration: Calibration,
    strength: i32,
}

impl TrackingState {
    #[must_use]
    pub fn new(
        tracker: Option<Box<dyn LandmarkTracker>>,
        params: TrackerParams,
        avatar: Option<Box<dyn AvatarRenderer>>,
        auto_calibrate: bool,
    ) -> Self {
        Self {
            tracker,
            params,
            avatar,
            calibration: Calibration::new(auto_calibrate),
            strength: 0,
        }
    }

    #[must_use]
    pub fn has_tracker(&self) -> bool {
        self.tracker.is_some()
    }

    #[must_use]
    pub fn strength(&self) -> i32 {
        self.strength
    }

    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_calibrated()
    }

    /// Feed the oriented gray frame and its located face to the tracker.
    ///
    /// Returns the shape when the strength qualifies, calibrating on `frame`
    /// if this is the first qualifying frame with a located face in
    /// automatic mode. `None` when no tracker is configured.
    ///
    /// # Errors
    ///
    /// Returns the tracker's or the avatar's error; strength drops to zero
    pub fn track(&mut self, frame: &Mat, gray: &Mat, face: Rect) -> Result<Option<TrackedShape>> {
        let Some(tracker) = self.tracker.as_mut() else {
            return Ok(None);
        };

        self.strength = match tracker.new_frame(gray, face, &self.params) {
            Ok(strength) => strength,
            Err(e) => {
                self.strength = 0;
                return Err(e);
            }
        };
        if !strength_qualifies(self.strength) {
            return Ok(None);
        }

        let shape = TrackedShape {
            points: tracker.shape(),
            points_3d: tracker.shape_3d().unwrap_or_default(),
        };

        let located = face.width > 0 && face.height > 0;
        if located && self.calibration.should_auto_calibrate(self.strength) {
            self.calibrate_with(frame, &shape.points)?;
            info!("Calibrated on first tracked frame (strength {})", self.strength);
        }

        Ok(Some(shape))
    }

    /// Composite the avatar over `frame` when calibrated.
    /// Returns whether the renderer ran.
    ///
    /// # Errors
    ///
    /// Returns the renderer's error
    pub fn overlay(&mut self, frame: &mut Mat, shape: &TrackedShape) -> Result<bool> {
        if !self.calibration.overlay_enabled(self.strength) {
            return Ok(false);
        }
        let Some(avatar) = self.avatar.as_mut() else {
            return Ok(false);
        };

        avatar.animate(frame, &shape.points)?;
        Ok(true)
    }

    /// Calibrate on `frame` with the tracker's latest shape.
    /// `Ok(false)` when tracking is too weak.
    ///
    /// # Errors
    ///
    /// Returns the renderer's initialization error
    pub fn request_calibration(&mut self, frame: &Mat) -> Result<bool> {
        if !strength_qualifies(self.strength) {
            warn!("Cannot calibrate, face tracking too weak (strength {})", self.strength);
            return Ok(false);
        }
        let Some(shape) = self.tracker.as_ref().map(|t| t.shape()) else {
            return Ok(false);
        };

        self.calibrate_with(frame, &shape)?;
        info!("Calibrated on request (strength {})", self.strength);
        Ok(true)
    }

    /// Clear calibration and the tracker's history
    pub fn reset(&mut self) {
        info!("Resetting face tracking");
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.reset();
        }
        self.calibration.reset();
        self.strength = 0;
    }

    fn calibrate_with(&mut self, frame: &Mat, shape: &[Point2f]) -> Result<()> {
        if let Some(avatar) = self.avatar.as_mut() {
            avatar.initialise(frame, shape)?;
        }
        self.calibration.accept();
        Ok(())
    }
}
