//! Orientation correction for incoming frames.
//!
//! Raw frames arrive in sensor orientation. The normalizer turns them upright,
//! producing a color frame and a grayscale copy for detection and tracking, and
//! keeps those buffers alive across cycles so that a steady stream of equally
//! sized frames never reallocates.

use crate::{Error, Result};
use opencv::{
    core::{self, Mat, Scalar, CV_8UC1, CV_8UC3},
    imgproc,
    prelude::*,
};

/// Rotation applied to a raw frame before processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    /// Horizontal mirror (front camera held upright)
    #[default]
    Deg0,
    /// Transpose
    Deg90,
    /// Vertical mirror
    Deg180,
    /// Transpose and mirror on both axes
    Deg270,
}

impl Orientation {
    /// Parse a rotation given in degrees
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for anything but 0, 90, 180 or 270
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            _ => Err(Error::InvalidInput(format!(
                "Orientation must be 0, 90, 180 or 270 degrees, got {degrees}"
            ))),
        }
    }

    /// Rotation in degrees
    #[must_use]
    pub const fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Whether rows and columns swap
    #[must_use]
    pub const fn is_transposed(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }

    /// `(rows, cols)` of a `rows × cols` frame after orientation
    #[must_use]
    pub const fn oriented_dims(self, rows: i32, cols: i32) -> (i32, i32) {
        if self.is_transposed() {
            (cols, rows)
        } else {
            (rows, cols)
        }
    }
}

/// Orients frames into reusable color and grayscale buffers
pub struct OrientationNormalizer {
    oriented: Mat,
    gray: Mat,
    scratch: Mat,
    reallocations: usize,
}

impl Default for OrientationNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl OrientationNormalizer {
    /// Create a normalizer with empty buffers
    #[must_use]
    pub fn new() -> Self {
        Self {
            oriented: Mat::default(),
            gray: Mat::default(),
            scratch: Mat::default(),
            reallocations: 0,
        }
    }

    /// Orient `input` (8-bit BGR) and derive its grayscale version
    ///
    /// # Errors
    ///
    /// Returns an error if the input is empty or not 8-bit 3-channel, or if an
    /// `OpenCV` operation fails
    pub fn normalize(&mut self, input: &Mat, orientation: Orientation) -> Result<()> {
        if input.empty() {
            return Err(Error::InvalidInput("Cannot orient an empty frame".to_string()));
        }
        if input.typ() != CV_8UC3 {
            return Err(Error::InvalidInput(format!(
                "Expected an 8-bit BGR frame, got type {}",
                input.typ()
            )));
        }

        let (rows, cols) = orientation.oriented_dims(input.rows(), input.cols());
        self.ensure_buffers(rows, cols, orientation)?;

        match orientation {
            Orientation::Deg0 => core::flip(input, &mut self.oriented, 1)?,
            Orientation::Deg90 => core::transpose(input, &mut self.oriented)?,
            Orientation::Deg180 => core::flip(input, &mut self.oriented, 0)?,
            Orientation::Deg270 => {
                core::transpose(input, &mut self.scratch)?;
                core::flip(&self.scratch, &mut self.oriented, -1)?;
            }
        }

        imgproc::cvt_color(&self.oriented, &mut self.gray, imgproc::COLOR_BGR2GRAY, 0)?;

        Ok(())
    }

    /// Resize the buffers when the oriented geometry changed
    fn ensure_buffers(&mut self, rows: i32, cols: i32, orientation: Orientation) -> Result<()> {
        if self.oriented.rows() != rows || self.oriented.cols() != cols {
            log::debug!("Reallocating oriented buffers for {cols}x{rows}");
            self.oriented = Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(0.0))?;
            self.reallocations += 1;
        }

        if self.gray.rows() != rows || self.gray.cols() != cols {
            self.gray = Mat::new_rows_cols_with_default(rows, cols, CV_8UC1, Scalar::all(0.0))?;
        }

        if orientation == Orientation::Deg270 && (self.scratch.rows() != rows || self.scratch.cols() != cols) {
            self.scratch = Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(0.0))?;
        }

        Ok(())
    }

    /// Oriented color frame of the last call to `normalize`
    #[must_use]
    pub fn frame(&self) -> &Mat {
        &self.oriented
    }

    /// Oriented grayscale frame of the last call to `normalize`
    #[must_use]
    pub fn gray(&self) -> &Mat {
        &self.gray
    }

    /// Mutable color frame alongside the grayscale frame
    pub fn buffers_mut(&mut self) -> (&mut Mat, &Mat) {
        (&mut self.oriented, &self.gray)
    }

    /// Number of times the oriented buffers were (re)allocated
    #[must_use]
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    /// Consume the normalizer, keeping the color and grayscale frames
    #[must_use]
    pub fn into_parts(self) -> (Mat, Mat) {
        (self.oriented, self.gray)
    }
}

/// Orient a single frame into freshly allocated buffers
///
/// # Errors
///
/// Same as [`OrientationNormalizer::normalize`]
pub fn orient(input: &Mat, orientation: Orientation) -> Result<(Mat, Mat)> {
    let mut normalizer = OrientationNormalizer::new();
    normalizer.normalize(input, orientation)?;
    Ok(normalizer.into_parts())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Vec3b;

    /// 2×3 frame whose pixel at (r, c) has blue channel 10*r + c
    fn numbered_frame(rows: i32, cols: i32) -> Mat {
        let mut mat = Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(0.0)).unwrap();
        for r in 0..rows {
            for c in 0..cols {
                let value = u8::try_from(10 * r + c).unwrap();
                *mat.at_2d_mut::<Vec3b>(r, c).unwrap() = Vec3b::from([value, value, value]);
            }
        }
        mat
    }

    fn value_at(mat: &Mat, r: i32, c: i32) -> u8 {
        mat.at_2d::<Vec3b>(r, c).unwrap()[0]
    }

    #[test]
    fn test_from_degrees() {
        assert_eq!(Orientation::from_degrees(0).unwrap(), Orientation::Deg0);
        assert_eq!(Orientation::from_degrees(270).unwrap(), Orientation::Deg270);
        assert!(Orientation::from_degrees(45).is_err());
        assert!(Orientation::from_degrees(-90).is_err());
        assert!(Orientation::from_degrees(360).is_err());
    }

    #[test]
    fn test_zero_degrees_mirrors_horizontally() {
        let input = numbered_frame(2, 3);
        let (out, _) = orient(&input, Orientation::Deg0).unwrap();
        assert_eq!((out.rows(), out.cols()), (2, 3));
        assert_eq!(value_at(&out, 0, 0), value_at(&input, 0, 2));
        assert_eq!(value_at(&out, 1, 2), value_at(&input, 1, 0));
    }

    #[test]
    fn test_ninety_degrees_transposes() {
        let input = numbered_frame(2, 3);
        let (out, gray) = orient(&input, Orientation::Deg90).unwrap();
        assert_eq!((out.rows(), out.cols()), (3, 2));
        assert_eq!((gray.rows(), gray.cols()), (3, 2));
        assert_eq!(value_at(&out, 2, 1), value_at(&input, 1, 2));
        assert_eq!(value_at(&out, 0, 1), value_at(&input, 1, 0));
    }

    #[test]
    fn test_one_eighty_degrees_mirrors_vertically() {
        let input = numbered_frame(2, 3);
        let (out, _) = orient(&input, Orientation::Deg180).unwrap();
        assert_eq!(value_at(&out, 0, 1), value_at(&input, 1, 1));
        assert_eq!(value_at(&out, 1, 0), value_at(&input, 0, 0));
    }

    #[test]
    fn test_two_seventy_degrees_transposes_and_flips() {
        let input = numbered_frame(2, 3);
        let (out, _) = orient(&input, Orientation::Deg270).unwrap();
        assert_eq!((out.rows(), out.cols()), (3, 2));
        for r in 0..3 {
            for c in 0..2 {
                assert_eq!(value_at(&out, r, c), value_at(&input, 1 - c, 2 - r));
            }
        }
    }

    #[test]
    fn test_gray_matches_color_geometry() {
        let input = numbered_frame(4, 6);
        let mut normalizer = OrientationNormalizer::new();
        normalizer.normalize(&input, Orientation::Deg90).unwrap();
        assert_eq!(normalizer.gray().typ(), CV_8UC1);
        assert_eq!(normalizer.gray().rows(), normalizer.frame().rows());
        assert_eq!(normalizer.gray().cols(), normalizer.frame().cols());
    }

    #[test]
    fn test_rejects_wrong_input_type() {
        let gray = Mat::new_rows_cols_with_default(4, 4, CV_8UC1, Scalar::all(0.0)).unwrap();
        assert!(orient(&gray, Orientation::Deg0).is_err());
        assert!(orient(&Mat::default(), Orientation::Deg0).is_err());
    }
}
