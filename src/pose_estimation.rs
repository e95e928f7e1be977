use crate::{
    constants::{CAMERA_CENTER_FACTOR, MODEL_POINTS_TOTAL_VALUES, NUM_FACIAL_LANDMARKS},
    Error, Result,
};
use nalgebra::{Matrix3, Vector3};
use opencv::{
    calib3d,
    core::{Mat, Point2f, Point3f, Size, Vector, CV_64F},
    prelude::*,
};
use std::fs;
use std::path::Path;

/// Rigid head pose in camera coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct HeadPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl HeadPose {
    /// Pitch, yaw and roll in degrees
    #[must_use]
    pub fn euler_degrees(&self) -> Vector3<f64> {
        let r = &self.rotation;
        let pitch = (-r[(1, 2)]).clamp(-1.0, 1.0).asin();
        let yaw = r[(0, 2)].atan2(r[(2, 2)]);
        let roll = r[(1, 0)].atan2(r[(1, 1)]);
        Vector3::new(pitch.to_degrees(), yaw.to_degrees(), roll.to_degrees())
    }

    /// Move a model point into camera coordinates
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn transform(&self, point: &Point3f) -> Point3f {
        let p = self.rotation * Vector3::new(f64::from(point.x), f64::from(point.y), f64::from(point.z))
            + self.translation;
        Point3f::new(p.x as f32, p.y as f32, p.z as f32)
    }
}

/// Solves the head pose of a 68-point shape against a 3-D face model
pub struct PoseEstimator {
    model_points: Vector<Point3f>,
}

impl PoseEstimator {
    /// Load the 3-D face model (204 values, one per line)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or has the wrong size
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        log::info!(
            "Initializing PoseEstimator with model: {}",
            model_path.as_ref().display()
        );
        let model_content = fs::read_to_string(model_path)?;
        Ok(Self::from_model_points(&Self::parse_model_points(&model_content)?))
    }

    #[must_use]
    pub fn from_model_points(points: &[Point3f]) -> Self {
        Self {
            model_points: Vector::from_slice(points),
        }
    }

    /// Pinhole intrinsics: focal length equals the image width, center at
    /// the image middle, no distortion
    fn camera_matrix(image_size: Size) -> Result<Mat> {
        let focal_length = f64::from(image_size.width);
        let cx = f64::from(image_size.width) / CAMERA_CENTER_FACTOR;
        let cy = f64::from(image_size.height) / CAMERA_CENTER_FACTOR;
        Ok(Mat::from_slice_2d(&[
            [focal_length, 0.0, cx],
            [0.0, focal_length, cy],
            [0.0, 0.0, 1.0],
        ])?)
    }

    /// Head pose of `landmarks` observed in an image of `image_size`
    ///
    /// # Errors
    ///
    /// Returns an error if the landmark count does not match the model or
    /// the `PnP` solver fails
    pub fn estimate(&self, landmarks: &[Point2f], image_size: Size) -> Result<HeadPose> {
        if landmarks.len() != self.model_points.len() {
            return Err(Error::InvalidInput(format!(
                "Expected {} landmarks, got {}",
                self.model_points.len(),
                landmarks.len()
            )));
        }

        let image_points = Vector::<Point2f>::from_slice(landmarks);
        let camera_matrix = Self::camera_matrix(image_size)?;
        let dist_coeffs = Mat::zeros(4, 1, CV_64F)?.to_mat()?;

        let mut rvec = Mat::default();
        let mut tvec = Mat::default();
        let solved = calib3d::solve_pnp(
            &self.model_points,
            &image_points,
            &camera_matrix,
            &dist_coeffs,
            &mut rvec,
            &mut tvec,
            false,
            calib3d::SOLVEPNP_ITERATIVE,
        )?;
        if !solved {
            return Err(Error::ModelOutputError("PnP did not converge".into()));
        }

        let mut rotation_mat = Mat::default();
        calib3d::rodrigues(&rvec, &mut rotation_mat, &mut Mat::default())?;

        let mut rotation = Matrix3::zeros();
        for row in 0..3 {
            for col in 0..3 {
                rotation[(row, col)] = *rotation_mat.at_2d::<f64>(row as i32, col as i32)?;
            }
        }
        let translation = Vector3::new(
            *tvec.at_2d::<f64>(0, 0)?,
            *tvec.at_2d::<f64>(1, 0)?,
            *tvec.at_2d::<f64>(2, 0)?,
        );

        Ok(HeadPose { rotation, translation })
    }

    /// The face model posed like `landmarks`, in camera coordinates
    ///
    /// # Errors
    ///
    /// Returns the pose estimation error
    pub fn shape_3d(&self, landmarks: &[Point2f], image_size: Size) -> Result<Vec<Point3f>> {
        let pose = self.estimate(landmarks, image_size)?;
        Ok(self.model_points.iter().map(|p| pose.transform(&p)).collect())
    }

    /// Parse 3D model points from text, one coordinate per line
    fn parse_model_points(content: &str) -> Result<Vec<Point3f>> {
        let values: Vec<f32> = content
            .lines()
            .filter_map(|line| line.trim().parse::<f32>().ok())
            .collect();

        if values.len() != MODEL_POINTS_TOTAL_VALUES {
            return Err(Error::ModelValidationError(format!(
                "Expected {} coordinate values ({} points × 3), got {}",
                MODEL_POINTS_TOTAL_VALUES,
                NUM_FACIAL_LANDMARKS,
                values.len()
            )));
        }

        Ok(values
            .chunks_exact(3)
            .map(|xyz| Point3f::new(xyz[0], xyz[1], xyz[2]))
            .collect())
    }
}
