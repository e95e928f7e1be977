//! Avatar overlay driven by the tracked landmark shape.
//!
//! [`SpriteAvatar`] pastes a BGRA sprite over the face. The sprite is placed
//! with a similarity transform that maps its eye line onto the tracked eyes,
//! then stretched vertically by how far the mouth opened relative to the
//! calibrated reference shape.

use crate::constants::NUM_FACIAL_LANDMARKS;
use crate::utils::safe_cast::i32_to_usize;
use crate::{Error, Result};
use log::{info, warn};
use nalgebra::Matrix3;
use opencv::{
    core::{self, Mat, Point2f, Scalar, Size, CV_8UC3, CV_8UC4},
    imgcodecs, imgproc,
    prelude::*,
};
use std::path::{Path, PathBuf};

/// Landmark index ranges of the 68-point layout
const LEFT_EYE: std::ops::Range<usize> = 36..42;
const RIGHT_EYE: std::ops::Range<usize> = 42..48;
const INNER_LIP_TOP: usize = 62;
const INNER_LIP_BOTTOM: usize = 66;

/// Eye centers in sprite coordinates, as fractions of the sprite size
const SPRITE_LEFT_EYE: (f64, f64) = (0.3, 0.4);
const SPRITE_RIGHT_EYE: (f64, f64) = (0.7, 0.4);

/// Vertical stretch per unit of mouth opening (relative to eye distance)
const EXPRESSION_GAIN: f64 = 1.5;
const MIN_STRETCH: f64 = 0.5;
const MAX_STRETCH: f64 = 2.0;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Renders an avatar over a frame
pub trait AvatarRenderer: Send {
    /// Fix the reference pose from a calibration frame and its shape
    ///
    /// # Errors
    ///
    /// Returns an error if the shape cannot serve as a reference
    fn initialise(&mut self, frame: &Mat, shape: &[Point2f]) -> Result<()>;

    /// Composite the avatar onto `frame` in place
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails
    fn animate(&mut self, frame: &mut Mat, shape: &[Point2f]) -> Result<()>;

    /// Switch to variant `id`
    ///
    /// # Errors
    ///
    /// Returns an error if the variant does not exist
    fn select_variant(&mut self, id: usize) -> Result<()>;
}

/// Facial measurements the renderer needs from a shape
#[derive(Debug, Clone, Copy, PartialEq)]
struct FaceAnchors {
    left_eye: Point2f,
    right_eye: Point2f,
    /// Inner lip gap divided by eye distance
    mouth_opening: f64,
}

impl FaceAnchors {
    fn from_shape(shape: &[Point2f]) -> Option<Self> {
        if shape.len() < NUM_FACIAL_LANDMARKS {
            return None;
        }

        let left_eye = centroid(&shape[LEFT_EYE]);
        let right_eye = centroid(&shape[RIGHT_EYE]);
        let eye_distance = distance(left_eye, right_eye);
        if eye_distance < f64::EPSILON {
            return None;
        }

        Some(Self {
            left_eye,
            right_eye,
            mouth_opening: distance(shape[INNER_LIP_TOP], shape[INNER_LIP_BOTTOM]) / eye_distance,
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn centroid(points: &[Point2f]) -> Point2f {
    let n = points.len().max(1) as f32;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point2f::new(sx / n, sy / n)
}

fn distance(a: Point2f, b: Point2f) -> f64 {
    f64::from(a.x - b.x).hypot(f64::from(a.y - b.y))
}

/// Sprite avatar with one image per variant
pub struct SpriteAvatar {
    variants: Vec<Mat>,
    active: usize,
    reference_opening: Option<f64>,
    warped: Mat,
}

impl SpriteAvatar {
    /// Load a single image, or every image of a directory in name order
    ///
    /// # Errors
    ///
    /// Returns an error if no image can be loaded
    pub fn load(path: &Path) -> Result<Self> {
        let files = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                })
                .collect();
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut variants = Vec::with_capacity(files.len());
        for file in &files {
            let name = file
                .to_str()
                .ok_or_else(|| Error::ModelError(format!("non UTF-8 path {}", file.display())))?;
            let image = imgcodecs::imread(name, imgcodecs::IMREAD_UNCHANGED)?;
            if image.empty() {
                warn!("Skipping unreadable avatar image {name}");
                continue;
            }
            variants.push(image);
        }

        let avatar = Self::from_images(variants)?;
        info!("Loaded {} avatar variant(s) from {}", avatar.variant_count(), path.display());
        Ok(avatar)
    }

    /// Build from decoded images (BGR, BGRA or gray)
    ///
    /// # Errors
    ///
    /// Returns an error if `images` is empty or a conversion fails
    pub fn from_images(images: Vec<Mat>) -> Result<Self> {
        if images.is_empty() {
            return Err(Error::ModelError("No avatar images".into()));
        }

        let variants = images
            .into_iter()
            .map(to_bgra)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            variants,
            active: 0,
            reference_opening: None,
            warped: Mat::default(),
        })
    }

    #[must_use]
    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    #[must_use]
    pub fn active_variant(&self) -> usize {
        self.active
    }

    /// Sprite-to-frame transform for the given anchors
    fn placement(&self, sprite_size: Size, anchors: &FaceAnchors) -> Matrix3<f64> {
        let (w, h) = (f64::from(sprite_size.width), f64::from(sprite_size.height));
        let src_left = (SPRITE_LEFT_EYE.0 * w, SPRITE_LEFT_EYE.1 * h);
        let src_right = (SPRITE_RIGHT_EYE.0 * w, SPRITE_RIGHT_EYE.1 * h);
        let src_mid = ((src_left.0 + src_right.0) / 2.0, (src_left.1 + src_right.1) / 2.0);

        let dst_left = (f64::from(anchors.left_eye.x), f64::from(anchors.left_eye.y));
        let dst_right = (f64::from(anchors.right_eye.x), f64::from(anchors.right_eye.y));
        let dst_mid = ((dst_left.0 + dst_right.0) / 2.0, (dst_left.1 + dst_right.1) / 2.0);

        let src_span = (src_right.0 - src_left.0).hypot(src_right.1 - src_left.1);
        let dst_span = (dst_right.0 - dst_left.0).hypot(dst_right.1 - dst_left.1);
        let scale = dst_span / src_span;
        let angle = (dst_right.1 - dst_left.1).atan2(dst_right.0 - dst_left.0)
            - (src_right.1 - src_left.1).atan2(src_right.0 - src_left.0);

        let stretch = self.reference_opening.map_or(1.0, |reference| {
            (1.0 + (anchors.mouth_opening - reference) * EXPRESSION_GAIN).clamp(MIN_STRETCH, MAX_STRETCH)
        });

        let (sin, cos) = angle.sin_cos();
        #[rustfmt::skip]
        let to_origin = Matrix3::new(
            1.0, 0.0, -src_mid.0,
            0.0, 1.0, -src_mid.1,
            0.0, 0.0, 1.0,
        );
        #[rustfmt::skip]
        let expression = Matrix3::new(
            1.0, 0.0, 0.0,
            0.0, stretch, 0.0,
            0.0, 0.0, 1.0,
        );
        #[rustfmt::skip]
        let similarity = Matrix3::new(
            scale * cos, -scale * sin, dst_mid.0,
            scale * sin, scale * cos, dst_mid.1,
            0.0, 0.0, 1.0,
        );

        similarity * expression * to_origin
    }
}

fn to_bgra(image: Mat) -> Result<Mat> {
    let code = match image.channels() {
        4 => return Ok(image),
        3 => imgproc::COLOR_BGR2BGRA,
        1 => imgproc::COLOR_GRAY2BGRA,
        n => return Err(Error::ModelError(format!("Unsupported avatar image with {n} channels"))),
    };
    let mut bgra = Mat::default();
    imgproc::cvt_color(&image, &mut bgra, code, 0)?;
    Ok(bgra)
}

/// Blend a BGRA overlay onto a BGR frame of the same size using its alpha
fn blend_over(frame: &mut Mat, overlay: &Mat) -> Result<()> {
    if frame.typ() != CV_8UC3 || overlay.typ() != CV_8UC4 || frame.size()? != overlay.size()? {
        return Err(Error::InvalidInput("Overlay does not match the frame".into()));
    }
    if !frame.is_continuous() || !overlay.is_continuous() {
        return Err(Error::InvalidInput("Frame buffers must be continuous".into()));
    }

    let pixels = i32_to_usize(frame.rows())? * i32_to_usize(frame.cols())?;
    let source = overlay.data_bytes()?;
    let target = frame.data_bytes_mut()?;

    for (dst, src) in target
        .chunks_exact_mut(3)
        .zip(source.chunks_exact(4))
        .take(pixels)
    {
        let alpha = u16::from(src[3]);
        if alpha == 0 {
            continue;
        }
        for c in 0..3 {
            let blended = (u16::from(src[c]) * alpha + u16::from(dst[c]) * (255 - alpha) + 127) / 255;
            dst[c] = u8::try_from(blended).unwrap_or(u8::MAX);
        }
    }

    Ok(())
}

impl AvatarRenderer for SpriteAvatar {
    fn initialise(&mut self, _frame: &Mat, shape: &[Point2f]) -> Result<()> {
        let anchors = FaceAnchors::from_shape(shape).ok_or_else(|| {
            Error::InvalidInput(format!("Reference shape needs {NUM_FACIAL_LANDMARKS} landmarks"))
        })?;
        self.reference_opening = Some(anchors.mouth_opening);
        Ok(())
    }

    fn animate(&mut self, frame: &mut Mat, shape: &[Point2f]) -> Result<()> {
        let Some(anchors) = FaceAnchors::from_shape(shape) else {
            return Ok(());
        };
        let sprite = &self.variants[self.active];
        let transform = self.placement(sprite.size()?, &anchors);

        let affine = Mat::from_slice_2d(&[
            [transform[(0, 0)], transform[(0, 1)], transform[(0, 2)]],
            [transform[(1, 0)], transform[(1, 1)], transform[(1, 2)]],
        ])?;

        imgproc::warp_affine(
            sprite,
            &mut self.warped,
            &affine,
            frame.size()?,
            imgproc::INTER_LINEAR,
            core::BORDER_CONSTANT,
            Scalar::all(0.0),
        )?;

        blend_over(frame, &self.warped)
    }

    fn select_variant(&mut self, id: usize) -> Result<()> {
        if id >= self.variants.len() {
            return Err(Error::InvalidInput(format!(
                "Avatar variant {id} out of range ({} loaded)",
                self.variants.len()
            )));
        }
        self.active = id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Vec3b;

    /// 68 points with eyes centered at `left`/`right` and the inner lips
    /// `gap` pixels apart below the eyes
    fn face_shape(left: (f32, f32), right: (f32, f32), gap: f32) -> Vec<Point2f> {
        let mut shape = vec![Point2f::new(0.0, 0.0); NUM_FACIAL_LANDMARKS];
        for i in LEFT_EYE {
            shape[i] = Point2f::new(left.0, left.1);
        }
        for i in RIGHT_EYE {
            shape[i] = Point2f::new(right.0, right.1);
        }
        let mouth_x = (left.0 + right.0) / 2.0;
        let mouth_y = left.1 + 30.0;
        shape[INNER_LIP_TOP] = Point2f::new(mouth_x, mouth_y - gap / 2.0);
        shape[INNER_LIP_BOTTOM] = Point2f::new(mouth_x, mouth_y + gap / 2.0);
        shape
    }

    fn sprite(alpha: f64) -> Mat {
        Mat::new_rows_cols_with_default(20, 20, CV_8UC4, Scalar::new(0.0, 0.0, 255.0, alpha)).unwrap()
    }

    fn black_frame() -> Mat {
        Mat::new_rows_cols_with_default(120, 120, CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    #[test]
    fn test_anchors_need_full_shape() {
        assert!(FaceAnchors::from_shape(&[Point2f::new(1.0, 1.0)]).is_none());

        let anchors = FaceAnchors::from_shape(&face_shape((40.0, 50.0), (80.0, 50.0), 8.0)).unwrap();
        assert_eq!(anchors.left_eye, Point2f::new(40.0, 50.0));
        assert!((anchors.mouth_opening - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_animate_places_sprite_between_eyes() {
        let mut avatar = SpriteAvatar::from_images(vec![sprite(255.0)]).unwrap();
        let shape = face_shape((40.0, 50.0), (80.0, 50.0), 4.0);
        let mut frame = black_frame();

        avatar.initialise(&black_frame(), &shape).unwrap();
        avatar.animate(&mut frame, &shape).unwrap();

        assert_eq!(*frame.at_2d::<Vec3b>(50, 60).unwrap(), Vec3b::from([0, 0, 255]));
        assert_eq!(*frame.at_2d::<Vec3b>(2, 2).unwrap(), Vec3b::from([0, 0, 0]));
    }

    #[test]
    fn test_transparent_sprite_leaves_frame() {
        let mut avatar = SpriteAvatar::from_images(vec![sprite(0.0)]).unwrap();
        let shape = face_shape((40.0, 50.0), (80.0, 50.0), 4.0);
        let mut frame = black_frame();

        avatar.animate(&mut frame, &shape).unwrap();
        assert!(frame.data_bytes().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_open_mouth_stretches_sprite() {
        let mut avatar = SpriteAvatar::from_images(vec![sprite(255.0)]).unwrap();
        let neutral = face_shape((40.0, 50.0), (80.0, 50.0), 0.0);
        avatar.initialise(&black_frame(), &neutral).unwrap();

        let size = Size::new(20, 20);
        let rest = avatar.placement(size, &FaceAnchors::from_shape(&neutral).unwrap());
        let open = face_shape((40.0, 50.0), (80.0, 50.0), 20.0);
        let stretched = avatar.placement(size, &FaceAnchors::from_shape(&open).unwrap());

        assert!(stretched[(1, 1)] > rest[(1, 1)]);
        assert!((stretched[(0, 0)] - rest[(0, 0)]).abs() < 1e-9);
    }

    #[test]
    fn test_variant_selection() {
        let mut avatar = SpriteAvatar::from_images(vec![sprite(255.0), sprite(128.0), sprite(64.0)]).unwrap();
        assert_eq!(avatar.variant_count(), 3);
        avatar.select_variant(2).unwrap();
        assert_eq!(avatar.active_variant(), 2);
        assert!(avatar.select_variant(3).is_err());
        assert_eq!(avatar.active_variant(), 2);
    }

    #[test]
    fn test_gray_images_become_bgra() {
        let gray = Mat::new_rows_cols_with_default(4, 4, opencv::core::CV_8UC1, Scalar::all(9.0)).unwrap();
        let avatar = SpriteAvatar::from_images(vec![gray]).unwrap();
        assert_eq!(avatar.variants[0].typ(), CV_8UC4);
        assert!(SpriteAvatar::from_images(Vec::new()).is_err());
    }
}
