//! Utility functions for region handling and coordinate transformations.

pub mod safe_cast;

use crate::Result;
use opencv::core::Rect;
use safe_cast::f32_to_i32_clamp;

/// Expand bounding boxes by `shift` of their size, square them and keep them
/// inside a `max_width × max_height` image
///
/// # Errors
///
/// Currently returns Ok(()) always, but returns Result for API consistency
#[allow(clippy::cast_precision_loss)] // Precision loss acceptable for box dimensions
pub fn refine_boxes(boxes: &mut [Rect], max_width: i32, max_height: i32, shift: f32) -> Result<()> {
    for bbox in boxes.iter_mut() {
        let x_shift = f32_to_i32_clamp(bbox.width as f32 * shift, 0, max_width);
        let y_shift = f32_to_i32_clamp(bbox.height as f32 * shift, 0, max_height);

        bbox.x = (bbox.x - x_shift).max(0);
        bbox.y = (bbox.y - y_shift).max(0);
        bbox.width = (bbox.width + 2 * x_shift).min(max_width - bbox.x);
        bbox.height = (bbox.height + 2 * y_shift).min(max_height - bbox.y);

        // Square it, but never beyond the image
        let side_length = bbox.width.max(bbox.height).min(max_width).min(max_height);
        bbox.width = side_length;
        bbox.height = side_length;

        if bbox.x + bbox.width > max_width {
            bbox.x = max_width - bbox.width;
        }
        if bbox.y + bbox.height > max_height {
            bbox.y = max_height - bbox.height;
        }
    }

    Ok(())
}

/// Part of `rect` inside a `width × height` image; zero-sized when disjoint
#[must_use]
pub fn clip_rect(rect: Rect, width: i32, height: i32) -> Rect {
    let left = rect.x.clamp(0, width.max(0));
    let top = rect.y.clamp(0, height.max(0));
    let right = (rect.x.saturating_add(rect.width)).clamp(left, width.max(left));
    let bottom = (rect.y.saturating_add(rect.height)).clamp(top, height.max(top));
    Rect::new(left, top, right - left, bottom - top)
}

/// Area of a rectangle, widened so large regions cannot overflow
#[must_use]
pub fn rect_area(rect: &Rect) -> i64 {
    i64::from(rect.width.max(0)) * i64::from(rect.height.max(0))
}
