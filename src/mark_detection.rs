use crate::{constants::NUM_FACIAL_LANDMARKS, utils::safe_cast::i32_to_usize, Error, Result};
use ndarray::{Array4, CowArray};
use opencv::core::{Mat, Point2f, Rect, Size, Vec3f, CV_32FC3};
use opencv::imgproc::{self, InterpolationFlags};
use opencv::prelude::*;
use ort::{Environment, Session, Value};
use std::path::Path;
use std::sync::Arc;

/// Default landmark detector input size
const DEFAULT_LANDMARK_INPUT_SIZE: i32 = 128;

/// 68-point facial landmark regressor using `ONNX` Runtime
pub struct MarkDetector {
    session: Session,
    input_size: i32,
    resized: Mat,
    rgb: Mat,
    float_image: Mat,
}

impl MarkDetector {
    /// Create a new landmark detector from an `ONNX` model file
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded or has no outputs
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        log::info!(
            "Initializing MarkDetector with model: {}",
            model_path.as_ref().display()
        );
        let environment = Arc::new(
            Environment::builder()
                .with_name("mark_detector")
                .with_log_level(ort::LoggingLevel::Warning)
                .build()?,
        );

        let session = ort::SessionBuilder::new(&environment)?
            .with_optimization_level(ort::GraphOptimizationLevel::Level3)?
            .with_model_from_file(model_path)?;

        if session.outputs.is_empty() {
            return Err(Error::ModelOutputError("Model has no outputs".to_string()));
        }

        Ok(Self {
            session,
            input_size: DEFAULT_LANDMARK_INPUT_SIZE,
            resized: Mat::default(),
            rgb: Mat::default(),
            float_image: Mat::default(),
        })
    }

    /// Landmarks of the face inside `region` of a BGR `frame`, in frame
    /// coordinates
    ///
    /// # Errors
    ///
    /// Returns an error if the crop, inference or output layout fails
    pub fn detect(&mut self, frame: &Mat, region: Rect) -> Result<Vec<Point2f>> {
        if region.width <= 0 || region.height <= 0 {
            return Err(Error::InvalidInput(format!("Empty landmark region {region:?}")));
        }

        let face = Mat::roi(frame, region)?.try_clone()?;
        let input = self.preprocess(&face)?;
        let marks = self.forward(input)?;

        Ok(self.to_frame_points(&marks, region))
    }

    /// Resize to the model input, RGB, scaled to [0, 1], NHWC
    fn preprocess(&mut self, face: &Mat) -> Result<Array4<f32>> {
        imgproc::resize(
            face,
            &mut self.resized,
            Size::new(self.input_size, self.input_size),
            0.0,
            0.0,
            InterpolationFlags::INTER_LINEAR as i32,
        )?;
        imgproc::cvt_color(&self.resized, &mut self.rgb, imgproc::COLOR_BGR2RGB, 0)?;
        self.rgb
            .convert_to(&mut self.float_image, CV_32FC3, 1.0 / 255.0, 0.0)?;

        let size = i32_to_usize(self.input_size)?;
        let pixels = self.float_image.data_typed::<Vec3f>()?;

        Ok(Array4::from_shape_fn((1, size, size, 3), |(_, y, x, c)| {
            pixels[y * size + x][c]
        }))
    }

    fn forward(&self, input: Array4<f32>) -> Result<Vec<f32>> {
        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let marks_output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| Error::ModelOutputError("No output from model".to_string()))?;
        let marks_tensor = marks_output.try_extract::<f32>()?;
        let marks_view = marks_tensor.view();
        let marks = marks_view
            .as_slice()
            .ok_or_else(|| Error::ModelOutputError("Failed to get output data".to_string()))?;

        if marks.len() < NUM_FACIAL_LANDMARKS * 2 {
            return Err(Error::ModelOutputError(format!(
                "Expected {} landmark values, got {}",
                NUM_FACIAL_LANDMARKS * 2,
                marks.len()
            )));
        }

        Ok(marks.to_vec())
    }

    /// Marks are normalized to the model input; map them into the region
    #[allow(clippy::cast_precision_loss)]
    fn to_frame_points(&self, marks: &[f32], region: Rect) -> Vec<Point2f> {
        let scale_x = region.width as f32 / self.input_size as f32;
        let scale_y = region.height as f32 / self.input_size as f32;

        marks
            .chunks_exact(2)
            .take(NUM_FACIAL_LANDMARKS)
            .map(|xy| {
                Point2f::new(
                    region.x as f32 + xy[0] * scale_x,
                    region.y as f32 + xy[1] * scale_y,
                )
            })
            .collect()
    }
}
