//! Configuration management for the tracking pipeline

use crate::constants::{CAMERA_HEIGHT, CAMERA_WIDTH, DEFAULT_AVATAR_VARIANT};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Capability model paths
    pub models: ModelConfig,

    /// Face detection configuration
    pub face_detection: FaceDetectionConfig,

    /// Live capture configuration
    pub camera: CameraConfig,

    /// Landmark tracking and calibration configuration
    pub tracking: TrackingConfig,

    /// Destination buffer configuration
    pub display: DisplayConfig,
}

/// Model file paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Face detector: a Haar cascade (`.xml`) or an SCRFD ONNX model (`.onnx`)
    pub face_detector: PathBuf,

    /// Path to facial landmarks ONNX model
    pub face_landmarks: PathBuf,

    /// Path to 3D face model points
    pub face_model_3d: PathBuf,

    /// Path to the landmark tracker parameters (YAML)
    pub tracker_params: PathBuf,

    /// Avatar image, or a directory holding one image per variant
    pub avatar: PathBuf,
}

/// Face detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceDetectionConfig {
    /// Confidence threshold for SCRFD detection (0.0-1.0)
    pub confidence_threshold: f32,

    /// IOU threshold for non-maximum suppression (0.0-1.0)
    pub iou_threshold: f32,

    /// Pyramid scale step for the cascade detector
    pub scale_factor: f64,

    /// Neighbour count a cascade candidate needs to be kept
    pub min_neighbors: i32,

    /// Smallest face side in pixels
    pub min_face_size: i32,
}

/// Camera parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device index
    pub index: i32,

    /// Requested frame width (the device may not honor it)
    pub width: i32,

    /// Requested frame height (the device may not honor it)
    pub height: i32,
}

/// Tracking and calibration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Calibrate on the first qualifying frame of a session
    pub auto_calibrate: bool,

    /// Avatar variant to select after loading
    pub avatar_variant: usize,

    /// Draw the face rectangle and landmark dots on the frame
    pub annotate: bool,
}

/// Display configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Destination buffer width
    pub width: i32,

    /// Destination buffer height
    pub height: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            face_detector: PathBuf::from("assets/haarcascade_frontalface_alt2.xml"),
            face_landmarks: PathBuf::from("assets/face_landmarks.onnx"),
            face_model_3d: PathBuf::from("assets/model.txt"),
            tracker_params: PathBuf::from("assets/tracker_params.yaml"),
            avatar: PathBuf::from("assets/avatars"),
        }
    }
}

impl Default for FaceDetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.4,
            scale_factor: 1.1,
            min_neighbors: 2,
            min_face_size: 40,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: CAMERA_WIDTH,
            height: CAMERA_HEIGHT,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            auto_calibrate: true,
            avatar_variant: DEFAULT_AVATAR_VARIANT,
            annotate: true,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        serde_yaml::from_str(&content).map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)?;

        Ok(())
    }

    /// Validate configuration
    ///
    /// Only the face detector is required; the tracker, its parameters and the
    /// avatar degrade to no-ops when missing.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.face_detection.confidence_threshold) {
            return Err(Error::ConfigError(
                "Confidence threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.face_detection.iou_threshold) {
            return Err(Error::ConfigError(
                "IOU threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.face_detection.scale_factor <= 1.0 {
            return Err(Error::ConfigError("Scale factor must be greater than 1.0".to_string()));
        }
        if self.face_detection.min_face_size <= 0 {
            return Err(Error::ConfigError("Minimum face size must be positive".to_string()));
        }

        if self.camera.width <= 0 || self.camera.height <= 0 {
            return Err(Error::ConfigError("Camera dimensions must be positive".to_string()));
        }
        if self.display.width <= 0 || self.display.height <= 0 {
            return Err(Error::ConfigError("Display dimensions must be positive".to_string()));
        }

        if !self.models.face_detector.exists() {
            return Err(Error::ConfigError(format!(
                "Face detector model not found: {}",
                self.models.face_detector.display()
            )));
        }

        Ok(())
    }
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = r#"# Face overlay pipeline configuration

# Capability model paths
models:
  face_detector: "assets/haarcascade_frontalface_alt2.xml"
  face_landmarks: "assets/face_landmarks.onnx"
  face_model_3d: "assets/model.txt"
  tracker_params: "assets/tracker_params.yaml"
  avatar: "assets/avatars"

# Face detection parameters
face_detection:
  confidence_threshold: 0.5
  iou_threshold: 0.4
  scale_factor: 1.1
  min_neighbors: 2
  min_face_size: 40

# Live capture
camera:
  index: 0
  width: 640
  height: 480

# Tracking and calibration
tracking:
  auto_calibrate: true
  avatar_variant: 2
  annotate: true

# Destination buffer
display:
  width: 800
  height: 600
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = serde_yaml::from_str(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.camera.height, 480);
        assert_eq!(config.tracking.avatar_variant, 2);
        assert!(config.tracking.auto_calibrate);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("tracking:\n  auto_calibrate: false\n").unwrap();
        assert!(!config.tracking.auto_calibrate);
        assert!(config.tracking.annotate);
        assert_eq!(config.display.width, 800);
        assert_eq!(config.face_detection.min_neighbors, 2);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = Config::default();
        config.face_detection.confidence_threshold = 1.5;
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let mut config = Config::default();
        config.face_detection.scale_factor = 1.0;
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_validate_requires_detector() {
        let mut config = Config::default();
        config.models.face_detector = PathBuf::from("/nonexistent/detector.xml");
        match config.validate() {
            Err(Error::ConfigError(msg)) => assert!(msg.contains("Face detector")),
            other => panic!("Expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn test_round_trip_through_file() {
        let path = std::env::temp_dir().join(format!("fop_config_{}.yaml", std::process::id()));
        let mut config = Config::default();
        config.display.width = 1024;
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.display.width, 1024);

        let _ = std::fs::remove_file(path);
    }
}
