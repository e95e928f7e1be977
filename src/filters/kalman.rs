use super::ShapeFilter;
use crate::constants::DEFAULT_FPS;
use nalgebra::{Matrix2, Matrix4, Vector2, Vector4};
use opencv::core::Point2f;

type Matrix2x4<T> = nalgebra::Matrix<T, nalgebra::U2, nalgebra::U4, nalgebra::ArrayStorage<T, 2, 4>>;

const INITIAL_COVARIANCE: f64 = 1000.0;

/// Constant-velocity model shared by every tracked point
struct Model {
    process_noise: Matrix4<f64>,
    measurement_noise: Matrix2<f64>,
    transition: Matrix4<f64>,
    measurement: Matrix2x4<f64>,
}

impl Model {
    #[rustfmt::skip]
    fn new(dt: f64) -> Self {
        let transition = Matrix4::new(
            1.0, 0.0, dt, 0.0,
            0.0, 1.0, 0.0, dt,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );

        // Only position is observed
        let measurement = Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        );

        let q: f64 = 0.5;
        let process_noise = Matrix4::new(
            q * dt.powi(4) / 4.0, 0.0, q * dt.powi(3) / 2.0, 0.0,
            0.0, q * dt.powi(4) / 4.0, 0.0, q * dt.powi(3) / 2.0,
            q * dt.powi(3) / 2.0, 0.0, q * dt.powi(2), 0.0,
            0.0, q * dt.powi(3) / 2.0, 0.0, q * dt.powi(2),
        );

        let measurement_noise = Matrix2::identity() * 2.0;

        Self {
            process_noise,
            measurement_noise,
            transition,
            measurement,
        }
    }
}

/// State `[x, y, vx, vy]` of one landmark
struct PointState {
    state: Vector4<f64>,
    covariance: Matrix4<f64>,
}

impl PointState {
    fn at(point: Point2f) -> Self {
        Self {
            state: Vector4::new(f64::from(point.x), f64::from(point.y), 0.0, 0.0),
            covariance: Matrix4::identity() * INITIAL_COVARIANCE,
        }
    }

    fn step(&mut self, model: &Model, observed: Vector2<f64>) {
        self.state = model.transition * self.state;
        self.covariance = model.transition * self.covariance * model.transition.transpose() + model.process_noise;

        let innovation = observed - model.measurement * self.state;
        let innovation_cov =
            model.measurement * self.covariance * model.measurement.transpose() + model.measurement_noise;

        // A singular innovation covariance leaves the prediction in place
        let Some(inverse) = innovation_cov.try_inverse() else {
            return;
        };
        let gain = self.covariance * model.measurement.transpose() * inverse;

        self.state += gain * innovation;
        self.covariance = (Matrix4::identity() - gain * model.measurement) * self.covariance;
    }
}

/// Kalman smoothing of every landmark independently
pub struct KalmanFilter {
    model: Model,
    points: Vec<PointState>,
}

impl KalmanFilter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            model: Model::new(1.0 / DEFAULT_FPS),
            points: Vec::new(),
        }
    }
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeFilter for KalmanFilter {
    #[allow(clippy::cast_possible_truncation)] // back to pixel precision
    fn apply(&mut self, shape: &mut [Point2f]) {
        if self.points.len() != shape.len() {
            self.points = shape.iter().copied().map(PointState::at).collect();
            return;
        }

        for (point, state) in shape.iter_mut().zip(&mut self.points) {
            state.step(
                &self.model,
                Vector2::new(f64::from(point.x), f64::from(point.y)),
            );
            point.x = state.state[0] as f32;
            point.y = state.state[1] as f32;
        }
    }

    fn reset(&mut self) {
        self.points.clear();
    }

    fn name(&self) -> &str {
        "KalmanFilter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kalman_filter() {
        let mut filter = KalmanFilter::new();

        // First shape initializes the filter
        let mut shape = vec![Point2f::new(10.0, 20.0)];
        filter.apply(&mut shape);
        assert_eq!(shape[0], Point2f::new(10.0, 20.0));

        // A jump is pulled towards the history
        let mut shape = vec![Point2f::new(11.0, 21.0)];
        filter.apply(&mut shape);
        assert!(shape[0].x > 10.0 && shape[0].x <= 11.0);
        assert!(shape[0].y > 20.0 && shape[0].y <= 21.0);
    }

    #[test]
    fn test_kalman_tracks_static_point() {
        let mut filter = KalmanFilter::new();
        for _ in 0..30 {
            let mut shape = vec![Point2f::new(100.0, 50.0)];
            filter.apply(&mut shape);
            assert!((shape[0].x - 100.0).abs() < 1e-3);
        }
    }
}
