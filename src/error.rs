//! Error types for the face overlay pipeline.

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// `OpenCV` operation failed
    #[error("OpenCV error: {0}")]
    OpenCV(#[from] opencv::Error),

    /// `ONNX` Runtime inference failed
    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(#[from] ort::OrtError),

    /// File I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Expression document serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame acquisition failed outside the worker loop
    #[error("Frame source error: {0}")]
    Source(#[from] SourceError),

    /// Camera device or media file could not be opened
    #[error("Cannot open source: {0}")]
    SourceOpen(String),

    /// The container holds no video stream
    #[error("No video stream found in {0}")]
    NoVideoStream(String),

    /// No decoder is available for the selected stream
    #[error("No decoder available: {0}")]
    NoDecoder(String),

    /// The decoder exists but could not be opened for the stream
    #[error("Cannot open codec: {0}")]
    CodecOpen(String),

    /// Invalid input parameters provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Model loading or inference error
    #[error("Model error: {0}")]
    ModelError(String),

    /// Model output processing error
    #[error("Model output error: {0}")]
    ModelOutputError(String),

    /// Model validation error (wrong number of points, etc.)
    #[error("Model validation error: {0}")]
    ModelValidationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Outcome of a failed frame acquisition.
///
/// Every variant ends the worker loop; none of them is fatal to the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source has no more frames
    #[error("end of stream")]
    EndOfStream,

    /// A packet could not be decoded; the stream is not retried
    #[error("decode error: {0}")]
    Decode(String),

    /// The capture device stopped delivering frames
    #[error("capture device error: {0}")]
    Device(String),

    /// A blocked wait was interrupted by a stop request
    #[error("acquisition interrupted")]
    Interrupted,

    /// The source was already closed
    #[error("source closed")]
    Closed,
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
