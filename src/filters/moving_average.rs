use super::ShapeFilter;
use opencv::core::Point2f;
use std::collections::VecDeque;

/// Average of the last `window_size` shapes
pub struct MovingAverageFilter {
    window_size: usize,
    history: VecDeque<Vec<Point2f>>,
}

impl MovingAverageFilter {
    #[must_use]
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            history: VecDeque::with_capacity(window_size),
        }
    }
}

impl ShapeFilter for MovingAverageFilter {
    #[allow(clippy::cast_precision_loss)] // window sizes are tiny
    fn apply(&mut self, shape: &mut [Point2f]) {
        if self.history.front().is_some_and(|s| s.len() != shape.len()) {
            self.history.clear();
        }
        if self.history.len() >= self.window_size {
            self.history.pop_front();
        }
        self.history.push_back(shape.to_vec());

        let count = self.history.len() as f32;
        for (i, point) in shape.iter_mut().enumerate() {
            let (sum_x, sum_y) = self
                .history
                .iter()
                .fold((0.0, 0.0), |(sx, sy), s| (sx + s[i].x, sy + s[i].y));
            point.x = sum_x / count;
            point.y = sum_y / count;
        }
    }

    fn reset(&mut self) {
        self.history.clear();
    }

    fn name(&self) -> &str {
        "MovingAverageFilter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(filter: &mut MovingAverageFilter, x: f32) -> f32 {
        let mut shape = vec![Point2f::new(x, x * 2.0)];
        filter.apply(&mut shape);
        assert_eq!(shape[0].y, shape[0].x * 2.0);
        shape[0].x
    }

    #[test]
    fn test_moving_average() {
        let mut filter = MovingAverageFilter::new(3);

        assert_eq!(step(&mut filter, 10.0), 10.0);
        assert_eq!(step(&mut filter, 20.0), 15.0);
        assert_eq!(step(&mut filter, 30.0), 20.0);

        // Window is full, oldest shape is dropped
        assert_eq!(step(&mut filter, 40.0), 30.0);
    }
}
