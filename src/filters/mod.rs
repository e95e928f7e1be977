//! Temporal smoothing of tracked landmark shapes.
//!
//! Landmark regressors jitter from frame to frame. A [`ShapeFilter`] smooths
//! every point of a shape in place and is cleared whenever tracking is reset
//! or the shape's point count changes.

/// Kalman filter with a constant-velocity model per point
pub mod kalman;

/// Moving average over the last few shapes
pub mod moving_average;

/// Exponential smoothing
pub mod exponential;

use crate::{Error, Result};
use opencv::core::Point2f;
use serde::{Deserialize, Serialize};

/// Smoothing applied to successive landmark shapes
pub trait ShapeFilter: Send {
    /// Smooth `shape` in place using the filter's history
    fn apply(&mut self, shape: &mut [Point2f]);

    /// Forget all history
    fn reset(&mut self);

    fn name(&self) -> &str;
}

/// Selects a filter in tracker parameter files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    None,
    #[default]
    Exponential,
    MovingAverage,
    Kalman,
}

/// Passes shapes through unchanged
pub struct NoFilter;

impl ShapeFilter for NoFilter {
    fn apply(&mut self, _shape: &mut [Point2f]) {}

    fn reset(&mut self) {}

    fn name(&self) -> &str {
        "NoFilter"
    }
}

/// Build a filter of the given kind
///
/// # Errors
///
/// Returns `Error::ConfigError` if `alpha` is outside (0, 1] or `window` is zero
pub fn create_filter(kind: FilterKind, alpha: f32, window: usize) -> Result<Box<dyn ShapeFilter>> {
    match kind {
        FilterKind::None => Ok(Box::new(NoFilter)),
        FilterKind::Exponential => {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(Error::ConfigError(format!("filter_alpha must be in (0, 1], got {alpha}")));
            }
            Ok(Box::new(exponential::ExponentialFilter::new(alpha)))
        }
        FilterKind::MovingAverage => {
            if window == 0 {
                return Err(Error::ConfigError("filter_window must be at least 1".into()));
            }
            Ok(Box::new(moving_average::MovingAverageFilter::new(window)))
        }
        FilterKind::Kalman => Ok(Box::new(kalman::KalmanFilter::new())),
    }
}
