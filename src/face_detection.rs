//! Face region detection over grayscale frames.
//!
//! Two detectors implement [`FaceDetector`]: an `OpenCV` Haar cascade and an
//! SCRFD network run through `ONNX` Runtime. [`FaceLocator`] reduces their
//! candidates to the single active face.

use crate::config::FaceDetectionConfig;
use crate::constants::{IMAGE_NORMALIZATION_OFFSET, IMAGE_NORMALIZATION_SCALE};
use crate::utils::{rect_area, safe_cast::{f32_to_i32_clamp, i32_to_usize}};
use crate::{Error, Result};
use ndarray::{Array2, Array4, CowArray};
use opencv::{
    core::{Mat, Rect, Scalar, Size, Vec3f, Vector, CV_32FC3, CV_8UC3},
    imgproc::{self, InterpolationFlags},
    objdetect::CascadeClassifier,
    prelude::*,
};
use ort::{Environment, Session, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Multi-scale face detector
pub trait FaceDetector: Send {
    /// Candidate face rectangles in `gray`, in provider order
    ///
    /// # Errors
    ///
    /// Returns an error if detection fails for this frame
    fn detect(&mut self, gray: &Mat) -> Result<Vec<Rect>>;
}

/// Candidate with the largest area; the first one wins ties. The empty
/// rectangle when there are no candidates.
#[must_use]
pub fn select_largest(candidates: &[Rect]) -> Rect {
    let mut face = Rect::default();
    for candidate in candidates {
        if rect_area(candidate) > rect_area(&face) {
            face = *candidate;
        }
    }
    face
}

/// Runs a detector and keeps the largest candidate
pub struct FaceLocator {
    detector: Box<dyn FaceDetector>,
}

impl FaceLocator {
    #[must_use]
    pub fn new(detector: Box<dyn FaceDetector>) -> Self {
        Self { detector }
    }

    /// Active face region of `gray`, empty when nothing was found
    ///
    /// # Errors
    ///
    /// Returns the detector's error
    pub fn locate(&mut self, gray: &Mat) -> Result<Rect> {
        let candidates = self.detector.detect(gray)?;
        Ok(select_largest(&candidates))
    }
}

/// Load a detector, choosing the implementation by file extension
///
/// # Errors
///
/// Returns an error if the model cannot be loaded or its type is unknown
pub fn load_detector(path: &Path, config: &FaceDetectionConfig) -> Result<Box<dyn FaceDetector>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("xml") => Ok(Box::new(CascadeDetector::new(path, config)?)),
        Some("onnx") => Ok(Box::new(ScrfdDetector::new(
            path,
            config.confidence_threshold,
            config.iou_threshold,
        )?)),
        _ => Err(Error::ModelError(format!(
            "Unsupported face detector model {}",
            path.display()
        ))),
    }
}

/// Haar cascade detector
pub struct CascadeDetector {
    classifier: CascadeClassifier,
    scale_factor: f64,
    min_neighbors: i32,
    min_size: Size,
    equalized: Mat,
}

impl CascadeDetector {
    /// # Errors
    ///
    /// Returns `Error::ModelError` if the cascade file is missing or invalid
    pub fn new(path: &Path, config: &FaceDetectionConfig) -> Result<Self> {
        log::info!("Loading cascade face detector: {}", path.display());
        let name = path
            .to_str()
            .ok_or_else(|| Error::ModelError(format!("non UTF-8 path {}", path.display())))?;

        let classifier = CascadeClassifier::new(name)?;
        if classifier.empty()? {
            return Err(Error::ModelError(format!("Cannot load cascade {name}")));
        }

        Ok(Self {
            classifier,
            scale_factor: config.scale_factor,
            min_neighbors: config.min_neighbors,
            min_size: Size::new(config.min_face_size, config.min_face_size),
            equalized: Mat::default(),
        })
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&mut self, gray: &Mat) -> Result<Vec<Rect>> {
        imgproc::equalize_hist(gray, &mut self.equalized)?;

        let mut faces = Vector::<Rect>::new();
        self.classifier.detect_multi_scale(
            &self.equalized,
            &mut faces,
            self.scale_factor,
            self.min_neighbors,
            0,
            self.min_size,
            Size::default(),
        )?;

        Ok(faces.to_vec())
    }
}

/// One SCRFD detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: Rect,
    pub score: f32,
}

/// SCRFD face detector using `ONNX` Runtime
pub struct ScrfdDetector {
    session: Session,
    input_size: (i32, i32),
    conf_threshold: f32,
    nms_threshold: f32,
    num_anchors: usize,
    strides: Vec<i32>,
    offset: usize,
    center_cache: HashMap<(i32, i32, i32), Array2<f32>>,
    bgr: Mat,
}

impl ScrfdDetector {
    /// Load an SCRFD model; the stride layout is derived from its output count
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded or has no inputs
    #[allow(clippy::cast_possible_truncation)] // model dimensions are small
    pub fn new<P: AsRef<Path>>(model_path: P, conf_threshold: f32, nms_threshold: f32) -> Result<Self> {
        log::info!("Loading SCRFD face detector: {}", model_path.as_ref().display());
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_detector")
                .with_log_level(ort::LoggingLevel::Warning)
                .build()?,
        );

        let session = ort::SessionBuilder::new(&environment)?
            .with_optimization_level(ort::GraphOptimizationLevel::Level3)?
            .with_model_from_file(model_path)?;

        let input_shape = &session
            .inputs
            .first()
            .ok_or_else(|| Error::ModelError("Model has no inputs".to_string()))?
            .dimensions;

        // [batch, channels, height, width]; dynamic axes fall back to 640
        let input_size = if input_shape.len() >= 4 {
            let height = input_shape[2].unwrap_or(640) as i32;
            let width = input_shape[3].unwrap_or(640) as i32;
            (width, height)
        } else {
            (640, 640)
        };

        let (offset, strides, num_anchors) = match session.outputs.len() {
            6 | 9 => (3, vec![8, 16, 32], 2),
            10 | 15 => (5, vec![8, 16, 32, 64, 128], 1),
            n => {
                log::warn!("Unknown SCRFD layout with {n} outputs, assuming 3 strides");
                (3, vec![8, 16, 32], 2)
            }
        };

        Ok(Self {
            session,
            input_size,
            conf_threshold,
            nms_threshold,
            num_anchors,
            strides,
            offset,
            center_cache: HashMap::new(),
            bgr: Mat::default(),
        })
    }

    /// Detections in a BGR image, highest score first
    ///
    /// # Errors
    ///
    /// Returns an error if preprocessing or inference fails
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn detect_faces(&mut self, image: &Mat) -> Result<Vec<Detection>> {
        let (input_width, input_height) = self.input_size;
        let ratio_img = image.rows() as f32 / image.cols() as f32;
        let ratio_model = input_height as f32 / input_width as f32;

        let (new_width, new_height) = if ratio_img > ratio_model {
            ((input_height as f32 / ratio_img) as i32, input_height)
        } else {
            (input_width, (input_width as f32 * ratio_img) as i32)
        };
        let det_scale = new_height as f32 / image.rows() as f32;

        let mut resized = Mat::default();
        imgproc::resize(
            image,
            &mut resized,
            Size::new(new_width, new_height),
            0.0,
            0.0,
            InterpolationFlags::INTER_LINEAR as i32,
        )?;

        let mut padded = Mat::new_rows_cols_with_default(input_height, input_width, CV_8UC3, Scalar::all(0.0))?;
        let mut roi = padded.roi_mut(Rect::new(0, 0, new_width, new_height))?;
        resized.copy_to(&mut roi)?;

        let input = Self::preprocess(&padded)?;
        let (scores, boxes) = self.forward(input)?;

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(std::cmp::Ordering::Equal));

        let scaled: Vec<[f32; 4]> = boxes
            .iter()
            .map(|b| [b[0] / det_scale, b[1] / det_scale, b[2] / det_scale, b[3] / det_scale])
            .collect();

        let keep = nms(&scaled, &order, self.nms_threshold);
        Ok(keep
            .into_iter()
            .map(|i| {
                let [x1, y1, x2, y2] = scaled[i];
                Detection {
                    bbox: Rect::new(
                        f32_to_i32_clamp(x1, 0, image.cols()),
                        f32_to_i32_clamp(y1, 0, image.rows()),
                        f32_to_i32_clamp(x2 - x1, 0, image.cols()),
                        f32_to_i32_clamp(y2 - y1, 0, image.rows()),
                    ),
                    score: scores[i],
                }
            })
            .collect())
    }

    /// BGR u8 image to normalized RGB NCHW tensor
    fn preprocess(image: &Mat) -> Result<Array4<f32>> {
        let mut rgb = Mat::default();
        imgproc::cvt_color(image, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        let mut float_image = Mat::default();
        rgb.convert_to(
            &mut float_image,
            CV_32FC3,
            1.0 / f64::from(IMAGE_NORMALIZATION_SCALE),
            -f64::from(IMAGE_NORMALIZATION_OFFSET / IMAGE_NORMALIZATION_SCALE),
        )?;

        let height = i32_to_usize(float_image.rows())?;
        let width = i32_to_usize(float_image.cols())?;
        let pixels = float_image.data_typed::<Vec3f>()?;

        Ok(Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
            pixels[y * width + x][c]
        }))
    }

    /// Scores and decoded `[x1, y1, x2, y2]` boxes above the confidence threshold
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn forward(&mut self, input: Array4<f32>) -> Result<(Vec<f32>, Vec<[f32; 4]>)> {
        let input_height = input.shape()[2] as i32;
        let input_width = input.shape()[3] as i32;

        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let mut scores = Vec::new();
        let mut boxes = Vec::new();

        for (idx, &stride) in self.strides.iter().enumerate() {
            let score_tensor = outputs
                .get(idx)
                .ok_or_else(|| Error::ModelOutputError(format!("missing score output {idx}")))?
                .try_extract::<f32>()?;
            let score_view = score_tensor.view();
            let stride_scores = score_view
                .as_slice()
                .ok_or_else(|| Error::ModelOutputError("non-contiguous scores".into()))?;

            let bbox_tensor = outputs
                .get(idx + self.offset)
                .ok_or_else(|| Error::ModelOutputError(format!("missing bbox output {idx}")))?
                .try_extract::<f32>()?;
            let bbox_view = bbox_tensor.view();
            let distances = bbox_view
                .as_slice()
                .ok_or_else(|| Error::ModelOutputError("non-contiguous boxes".into()))?;

            let key = (input_height / stride, input_width / stride, stride);
            let num_anchors = self.num_anchors;
            let centers = self
                .center_cache
                .entry(key)
                .or_insert_with(|| anchor_centers(key.0, key.1, stride, num_anchors));

            for (i, &score) in stride_scores.iter().enumerate() {
                if score < self.conf_threshold || i >= centers.nrows() {
                    continue;
                }
                let Some(d) = distances.get(i * 4..i * 4 + 4) else {
                    continue;
                };
                let stride = stride as f32;
                scores.push(score);
                boxes.push(distance_to_bbox(
                    (centers[[i, 0]], centers[[i, 1]]),
                    [d[0] * stride, d[1] * stride, d[2] * stride, d[3] * stride],
                ));
            }
        }

        Ok((scores, boxes))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, gray: &Mat) -> Result<Vec<Rect>> {
        imgproc::cvt_color(gray, &mut self.bgr, imgproc::COLOR_GRAY2BGR, 0)?;
        let image = std::mem::take(&mut self.bgr);
        let detections = self.detect_faces(&image);
        self.bgr = image;
        Ok(detections?.into_iter().map(|d| d.bbox).collect())
    }
}

/// Anchor centers of a `height × width` feature map, `num_anchors` per cell
#[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
fn anchor_centers(height: i32, width: i32, stride: i32, num_anchors: usize) -> Array2<f32> {
    let cells = (height.max(0) * width.max(0)) as usize;
    Array2::from_shape_fn((cells * num_anchors, 2), |(i, axis)| {
        let cell = (i / num_anchors) as i32;
        let value = if axis == 0 { cell % width } else { cell / width };
        (value * stride) as f32
    })
}

/// Box from an anchor center and its left, top, right, bottom distances
fn distance_to_bbox(center: (f32, f32), distances: [f32; 4]) -> [f32; 4] {
    [
        center.0 - distances[0],
        center.1 - distances[1],
        center.0 + distances[2],
        center.1 + distances[3],
    ]
}

/// Greedy non-maximum suppression; `order` lists box indices by descending score
fn nms(boxes: &[[f32; 4]], order: &[usize], threshold: f32) -> Vec<usize> {
    let mut keep = Vec::new();
    let mut order = order.to_vec();

    while let Some((&i, rest)) = order.split_first() {
        keep.push(i);
        let [x1_i, y1_i, x2_i, y2_i] = boxes[i];
        let area_i = (x2_i - x1_i + 1.0) * (y2_i - y1_i + 1.0);

        order = rest
            .iter()
            .copied()
            .filter(|&j| {
                let [x1_j, y1_j, x2_j, y2_j] = boxes[j];
                let area_j = (x2_j - x1_j + 1.0) * (y2_j - y1_j + 1.0);

                let w = (x2_i.min(x2_j) - x1_i.max(x1_j) + 1.0).max(0.0);
                let h = (y2_i.min(y2_j) - y1_i.max(y1_j) + 1.0).max(0.0);
                let inter = w * h;

                inter / (area_i + area_j - inter) <= threshold
            })
            .collect();
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDetector(Vec<Rect>);

    impl FaceDetector for FixedDetector {
        fn detect(&mut self, _gray: &Mat) -> Result<Vec<Rect>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_select_largest() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 30, 20);
        let c = Rect::new(50, 50, 20, 20);
        assert_eq!(select_largest(&[a, b, c]), b);
        assert_eq!(select_largest(&[]), Rect::default());
    }

    #[test]
    fn test_select_largest_tie_keeps_first() {
        let first = Rect::new(0, 0, 20, 10);
        let second = Rect::new(100, 100, 10, 20);
        assert_eq!(select_largest(&[first, second]), first);
    }

    #[test]
    fn test_locator_uses_detector() {
        let gray = Mat::default();
        let mut locator = FaceLocator::new(Box::new(FixedDetector(vec![
            Rect::new(0, 0, 4, 4),
            Rect::new(1, 1, 8, 8),
        ])));
        assert_eq!(locator.locate(&gray).unwrap(), Rect::new(1, 1, 8, 8));

        let mut empty = FaceLocator::new(Box::new(FixedDetector(Vec::new())));
        assert_eq!(empty.locate(&gray).unwrap(), Rect::default());
    }

    #[test]
    fn test_distance_to_bbox() {
        let bbox = distance_to_bbox((100.0, 100.0), [10.0, 10.0, 20.0, 20.0]);
        assert_eq!(bbox, [90.0, 90.0, 120.0, 120.0]);
    }

    #[test]
    fn test_anchor_centers_layout() {
        let centers = anchor_centers(2, 3, 8, 2);
        assert_eq!(centers.nrows(), 12);
        // Two anchors per cell share a center, row-major over the feature map
        assert_eq!((centers[[0, 0]], centers[[0, 1]]), (0.0, 0.0));
        assert_eq!((centers[[1, 0]], centers[[1, 1]]), (0.0, 0.0));
        assert_eq!((centers[[2, 0]], centers[[2, 1]]), (8.0, 0.0));
        assert_eq!((centers[[6, 0]], centers[[6, 1]]), (0.0, 8.0));
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let boxes = [
            [0.0, 0.0, 100.0, 100.0],
            [5.0, 5.0, 105.0, 105.0],
            [200.0, 200.0, 250.0, 250.0],
        ];
        let keep = nms(&boxes, &[0, 1, 2], 0.4);
        assert_eq!(keep, vec![0, 2]);
    }

    #[test]
    fn test_unknown_detector_extension() {
        let result = load_detector(Path::new("model.bin"), &FaceDetectionConfig::default());
        assert!(matches!(result, Err(Error::ModelError(_))));
    }

    #[test]
    fn test_missing_cascade_fails() {
        let result = load_detector(Path::new("/nonexistent/cascade.xml"), &FaceDetectionConfig::default());
        assert!(result.is_err());
    }
}
