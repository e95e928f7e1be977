//! Letterboxed compositing of processed frames into the host's pixel buffer.

use crate::utils::safe_cast::i32_to_usize;
use crate::{Error, Result};
use opencv::{
    core::{Mat, Size},
    imgproc::{self, InterpolationFlags},
    prelude::*,
};
use std::sync::{Arc, Mutex};

/// Pixel layout of a destination buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 channels, 8 bits each, R G B A byte order
    Rgba8888,
    /// 16-bit packed 5-6-5
    Rgb565,
    /// Single 8-bit alpha channel
    Alpha8,
}

impl PixelFormat {
    /// Bytes used by one pixel
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8888 => 4,
            Self::Rgb565 => 2,
            Self::Alpha8 => 1,
        }
    }
}

/// Fixed-size destination pixel buffer owned by the host
#[derive(Debug, Clone)]
pub struct DisplayBuffer {
    width: i32,
    height: i32,
    stride: usize,
    format: PixelFormat,
    pixels: Vec<u8>,
}

/// Destination buffer shared between the worker and the host
pub type SharedDisplay = Arc<Mutex<DisplayBuffer>>;

impl DisplayBuffer {
    /// Allocate a zeroed buffer with a tightly packed stride
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for non-positive dimensions
    pub fn new(width: i32, height: i32, format: PixelFormat) -> Result<Self> {
        if width <= 0 || height <= 0 {
            return Err(Error::InvalidInput(format!(
                "Display buffer dimensions must be positive, got {width}x{height}"
            )));
        }
        let stride = i32_to_usize(width)? * format.bytes_per_pixel();
        let pixels = vec![0; stride * i32_to_usize(height)?];

        Ok(Self {
            width,
            height,
            stride,
            format,
            pixels,
        })
    }

    /// Wrap the buffer for sharing with a session
    #[must_use]
    pub fn shared(self) -> SharedDisplay {
        Arc::new(Mutex::new(self))
    }

    #[must_use]
    pub fn width(&self) -> i32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> i32 {
        self.height
    }

    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Bytes of the pixel at `(x, y)`, if inside the buffer
    #[must_use]
    pub fn pixel(&self, x: i32, y: i32) -> Option<&[u8]> {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride + x as usize * bpp;
        self.pixels.get(offset..offset + bpp)
    }
}

/// Region of the destination buffer written by one composite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlitRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BlitRect {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Largest aspect-preserving rectangle of a `frame_width × frame_height`
/// frame that fits a `dest_width × dest_height` buffer, centered
#[must_use]
#[allow(clippy::cast_possible_truncation)] // results are bounded by the destination size
pub fn letterbox_fit(frame_width: i32, frame_height: i32, dest_width: i32, dest_height: i32) -> BlitRect {
    if frame_width <= 0 || frame_height <= 0 || dest_width <= 0 || dest_height <= 0 {
        return BlitRect::default();
    }

    let (fw, fh) = (i64::from(frame_width), i64::from(frame_height));
    let (dw, dh) = (i64::from(dest_width), i64::from(dest_height));

    let (w, h) = if fw * dh > dw * fh {
        // frame is wider
        (dw, fh * dw / fw)
    } else {
        (fw * dh / fh, dh)
    };

    BlitRect {
        x: ((dw - w) / 2) as i32,
        y: ((dh - h) / 2) as i32,
        width: w as i32,
        height: h as i32,
    }
}

/// Scales processed BGR frames into RGBA destination buffers
#[derive(Default)]
pub struct DisplayCompositor {
    rgba: Mat,
    scaled: Mat,
}

impl DisplayCompositor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Letterbox `frame` into `buffer` with nearest-neighbour scaling
    ///
    /// Returns the written region, or `None` when the cycle was skipped
    /// because the buffer is not RGBA8888 or nothing would be visible.
    ///
    /// # Errors
    ///
    /// Returns an error if color conversion or scaling fails
    pub fn composite(&mut self, frame: &Mat, buffer: &mut DisplayBuffer) -> Result<Option<BlitRect>> {
        if buffer.format != PixelFormat::Rgba8888 {
            log::error!("Display buffer is not RGBA8888 ({:?}), skipping frame", buffer.format);
            return Ok(None);
        }
        if frame.empty() {
            return Ok(None);
        }

        let rect = letterbox_fit(frame.cols(), frame.rows(), buffer.width, buffer.height);
        if rect.is_empty() {
            return Ok(None);
        }

        imgproc::cvt_color(frame, &mut self.rgba, imgproc::COLOR_BGR2RGBA, 0)?;
        imgproc::resize(
            &self.rgba,
            &mut self.scaled,
            Size::new(rect.width, rect.height),
            0.0,
            0.0,
            InterpolationFlags::INTER_NEAREST as i32,
        )?;

        let source = self.scaled.data_bytes()?;
        let row_bytes = i32_to_usize(rect.width)? * 4;
        let x_offset = i32_to_usize(rect.x)? * 4;
        let y_offset = i32_to_usize(rect.y)?;

        for (row, src_row) in source.chunks_exact(row_bytes).enumerate() {
            let start = (y_offset + row) * buffer.stride + x_offset;
            buffer.pixels[start..start + row_bytes].copy_from_slice(src_row);
        }

        Ok(Some(rect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    #[test]
    fn test_fit_same_aspect_fills_buffer() {
        let rect = letterbox_fit(640, 480, 800, 600);
        assert_eq!(rect, BlitRect { x: 0, y: 0, width: 800, height: 600 });
    }

    #[test]
    fn test_fit_portrait_frame_pillarboxes() {
        let rect = letterbox_fit(480, 640, 800, 600);
        assert_eq!(rect, BlitRect { x: 175, y: 0, width: 450, height: 600 });
    }

    #[test]
    fn test_fit_wide_frame_letterboxes() {
        let rect = letterbox_fit(1280, 480, 640, 480);
        assert_eq!(rect, BlitRect { x: 0, y: 120, width: 640, height: 240 });
    }

    #[test]
    fn test_fit_degenerate_inputs() {
        assert!(letterbox_fit(0, 480, 800, 600).is_empty());
        assert!(letterbox_fit(640, 480, 0, 600).is_empty());
    }

    #[test]
    fn test_composite_writes_centered_region() {
        // Pure blue BGR frame, portrait
        let frame = Mat::new_rows_cols_with_default(4, 2, CV_8UC3, Scalar::new(255.0, 0.0, 0.0, 0.0)).unwrap();
        let mut buffer = DisplayBuffer::new(8, 4, PixelFormat::Rgba8888).unwrap();
        let mut compositor = DisplayCompositor::new();

        let rect = compositor.composite(&frame, &mut buffer).unwrap().unwrap();
        assert_eq!(rect, BlitRect { x: 3, y: 0, width: 2, height: 4 });

        assert_eq!(buffer.pixel(3, 0).unwrap(), &[0, 0, 255, 255]);
        assert_eq!(buffer.pixel(4, 3).unwrap(), &[0, 0, 255, 255]);
        // Margins untouched
        assert_eq!(buffer.pixel(0, 0).unwrap(), &[0, 0, 0, 0]);
        assert_eq!(buffer.pixel(7, 3).unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_composite_skips_unexpected_format() {
        let frame = Mat::new_rows_cols_with_default(4, 4, CV_8UC3, Scalar::all(200.0)).unwrap();
        let mut buffer = DisplayBuffer::new(4, 4, PixelFormat::Rgb565).unwrap();
        let mut compositor = DisplayCompositor::new();

        assert!(compositor.composite(&frame, &mut buffer).unwrap().is_none());
        assert!(buffer.pixels().iter().all(|&b| b == 0));
    }
}
