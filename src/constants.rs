//! Constants used throughout the pipeline

/// Minimum tracker strength for a landmark shape to be trusted
pub const MIN_FACE_STRENGTH: i32 = 1;

/// Number of facial landmarks for full face
pub const NUM_FACIAL_LANDMARKS: usize = 68;

/// Total number of 3D model coordinates (68 points × 3 dimensions)
pub const MODEL_POINTS_TOTAL_VALUES: usize = 204;

/// Requested live capture geometry
pub const CAMERA_WIDTH: i32 = 640;
pub const CAMERA_HEIGHT: i32 = 480;

/// Avatar variant selected after loading the renderer
pub const DEFAULT_AVATAR_VARIANT: usize = 2;

/// Suffix replacing the source extension for the expression export
pub const EXPRESSION_FILE_EXTENSION: &str = "expression.json";

/// Default frames per second assumption when the container reports none
pub const DEFAULT_FPS: f64 = 30.0;

/// Camera matrix center factor
pub const CAMERA_CENTER_FACTOR: f64 = 2.0;

/// Image normalization constants for SCRFD face detection
pub const IMAGE_NORMALIZATION_OFFSET: f32 = 127.5;
pub const IMAGE_NORMALIZATION_SCALE: f32 = 128.0;

/// Polling interval of the capture thread when the device yields nothing
pub const CAPTURE_IDLE_MS: u64 = 5;
