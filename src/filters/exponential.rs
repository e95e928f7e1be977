use super::ShapeFilter;
use opencv::core::Point2f;

/// Exponential smoothing of every landmark
pub struct ExponentialFilter {
    alpha: f32,
    last: Option<Vec<Point2f>>,
}

impl ExponentialFilter {
    /// `alpha` is the weight of the newest shape, in (0, 1]
    #[must_use]
    pub fn new(alpha: f32) -> Self {
        Self { alpha, last: None }
    }
}

impl ShapeFilter for ExponentialFilter {
    fn apply(&mut self, shape: &mut [Point2f]) {
        if let Some(last) = self.last.as_ref().filter(|last| last.len() == shape.len()) {
            for (point, previous) in shape.iter_mut().zip(last) {
                point.x = self.alpha * point.x + (1.0 - self.alpha) * previous.x;
                point.y = self.alpha * point.y + (1.0 - self.alpha) * previous.y;
            }
        }
        self.last = Some(shape.to_vec());
    }

    fn reset(&mut self) {
        self.last = None;
    }

    fn name(&self) -> &str {
        "ExponentialFilter"
    }
}
