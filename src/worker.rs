//! The per-cycle pipeline and the worker loop that drives it.
//!
//! One cycle: acquire, orient, locate the face, track and overlay, record
//! (file sessions), then composite into the display buffer and notify the
//! host. A frame is recorded before the host is told about it.
//! Cycles run strictly one after another on the worker thread. Cancellation
//! is checked at the top of every cycle, so a started cycle always finishes.

use crate::display::{BlitRect, DisplayCompositor, SharedDisplay};
use crate::error::SourceError;
use crate::face_detection::FaceLocator;
use crate::frame_source::FrameSource;
use crate::orientation::OrientationNormalizer;
use crate::recorder::{FrameRecord, FrameRecorder};
use crate::session::SharedState;
use crate::tracking::{TrackedShape, TrackingState};
use crate::Result;
use log::{debug, error, info, warn};
use opencv::{
    core::{Mat, Point, Point2f, Rect, Scalar},
    imgproc::{self, LINE_8},
    prelude::*,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Host callback receiving the region written by each composite
pub type DisplayNotify = Box<dyn Fn(BlitRect) + Send>;

/// Why a worker loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// A stop request was observed
    Cancelled,
    /// The source ran out of frames
    EndOfStream,
    /// Acquisition failed; the stream is not retried
    SourceFailed(SourceError),
    /// The worker thread panicked
    Panicked,
}

impl From<SourceError> for ExitReason {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::EndOfStream => Self::EndOfStream,
            SourceError::Interrupted | SourceError::Closed => Self::Cancelled,
            other => Self::SourceFailed(other),
        }
    }
}

/// What a finished session did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames_processed: u64,
    /// Zero for live sessions
    pub frames_recorded: usize,
    pub exit: ExitReason,
}

/// Resources released on every exit path of the worker, panics included
struct Teardown {
    source: Arc<dyn FrameSource>,
    recorder: Option<FrameRecorder>,
    shared: Arc<SharedState>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.source.close();
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.export() {
                error!("Failed to export frame records to {}: {e}", recorder.output().display());
            }
        }
        self.shared.mark_finished();
        info!("Worker teardown complete");
    }
}

/// Everything one session's worker thread owns
pub struct Worker {
    source: Arc<dyn FrameSource>,
    shared: Arc<SharedState>,
    tracking: Arc<Mutex<TrackingState>>,
    locator: FaceLocator,
    normalizer: OrientationNormalizer,
    compositor: DisplayCompositor,
    display: SharedDisplay,
    notify: DisplayNotify,
    recorder: Option<FrameRecorder>,
    annotate: bool,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        source: Arc<dyn FrameSource>,
        shared: Arc<SharedState>,
        tracking: Arc<Mutex<TrackingState>>,
        locator: FaceLocator,
        display: SharedDisplay,
        notify: DisplayNotify,
        recorder: Option<FrameRecorder>,
        annotate: bool,
    ) -> Self {
        Self {
            source,
            shared,
            tracking,
            locator,
            normalizer: OrientationNormalizer::new(),
            compositor: DisplayCompositor::new(),
            display,
            notify,
            recorder,
            annotate,
        }
    }

    /// Run cycles until cancelled or the source ends, then tear down
    pub fn run(mut self) -> SessionSummary {
        let mut teardown = Teardown {
            source: Arc::clone(&self.source),
            recorder: self.recorder.take(),
            shared: Arc::clone(&self.shared),
        };
        info!("Worker started on {}", self.source.info().identifier);

        let exit = loop {
            if self.shared.is_cancelled() {
                info!("Stop requested");
                break ExitReason::Cancelled;
            }

            let raw = match self.source.next_frame() {
                Ok(frame) => frame,
                Err(SourceError::EndOfStream) => {
                    info!("End of stream reached");
                    break ExitReason::EndOfStream;
                }
                Err(e) => {
                    if self.shared.is_cancelled() {
                        break ExitReason::Cancelled;
                    }
                    warn!("Frame acquisition failed: {e}");
                    break ExitReason::from(e);
                }
            };

            let started = Instant::now();
            let frame_index = self.shared.next_frame_index();
            self.cycle(&raw, frame_index, teardown.recorder.as_mut());

            debug!(
                "Frame time: {:.2} ms (frame {frame_index})",
                started.elapsed().as_secs_f64() * 1000.0
            );
        };

        let summary = SessionSummary {
            frames_processed: self.shared.frame_count(),
            frames_recorded: teardown.recorder.as_ref().map_or(0, FrameRecorder::len),
            exit,
        };
        drop(teardown);
        info!(
            "Worker stopped after {} frames ({:?})",
            summary.frames_processed, summary.exit
        );
        summary
    }

    /// Process one acquired frame, recording it before it is presented.
    ///
    /// Every failure is local to the cycle: it is logged and the cycle
    /// continues or skips compositing.
    fn cycle(&mut self, raw: &Mat, frame_index: u64, recorder: Option<&mut FrameRecorder>) {
        if let Err(e) = self.normalizer.normalize(raw, self.shared.orientation()) {
            warn!("Skipping frame {frame_index}: {e}");
            self.shared.set_face(Rect::default());
            record(recorder, frame_index, None);
            return;
        }

        let face = match self.locator.locate(self.normalizer.gray()) {
            Ok(face) => face,
            Err(e) => {
                warn!("Face detection failed on frame {frame_index}: {e}");
                Rect::default()
            }
        };
        self.shared.set_face(face);

        let shape = self.track_and_overlay(face);

        if self.annotate {
            if let Err(e) = self.annotate_frame(face, shape.as_ref()) {
                warn!("Annotation failed on frame {frame_index}: {e}");
            }
        }

        record(recorder, frame_index, shape.as_ref());
        self.present();
    }

    fn track_and_overlay(&mut self, face: Rect) -> Option<TrackedShape> {
        let (frame, gray) = self.normalizer.buffers_mut();
        let mut tracking = self.tracking.lock().unwrap_or_else(PoisonError::into_inner);

        let shape = match tracking.track(frame, gray, face) {
            Ok(shape) => shape,
            Err(e) => {
                warn!("Landmark tracking failed: {e}");
                None
            }
        };

        if let Some(shape) = shape.as_ref() {
            if let Err(e) = tracking.overlay(frame, shape) {
                warn!("Avatar overlay failed: {e}");
            }
        }

        self.shared
            .publish_tracking(tracking.strength(), tracking.is_calibrated());
        shape
    }

    fn annotate_frame(&mut self, face: Rect, shape: Option<&TrackedShape>) -> Result<()> {
        let (frame, _) = self.normalizer.buffers_mut();

        if face.width > 0 && face.height > 0 {
            imgproc::rectangle(frame, face, Scalar::new(0.0, 255.0, 0.0, 0.0), 2, LINE_8, 0)?;
        }

        if let Some(shape) = shape {
            for point in &shape.points {
                draw_dot(frame, *point)?;
            }
        }

        Ok(())
    }

    fn present(&mut self) {
        let mut buffer = self.display.lock().unwrap_or_else(PoisonError::into_inner);
        let blit = match self.compositor.composite(self.normalizer.frame(), &mut buffer) {
            Ok(blit) => blit,
            Err(e) => {
                warn!("Compositing failed: {e}");
                None
            }
        };
        drop(buffer);

        if let Some(rect) = blit {
            (self.notify)(rect);
        }
    }
}

fn record(recorder: Option<&mut FrameRecorder>, frame_index: u64, shape: Option<&TrackedShape>) {
    let Some(recorder) = recorder else {
        return;
    };
    let record = shape.map_or_else(
        || FrameRecord::empty(frame_index),
        |shape| FrameRecord::from_shape(frame_index, shape),
    );
    if let Err(e) = recorder.record(record) {
        error!("Dropped record of frame {frame_index}: {e}");
    }
}

#[allow(clippy::cast_possible_truncation)]
fn draw_dot(frame: &mut Mat, point: Point2f) -> Result<()> {
    let center = Point::new(point.x.round() as i32, point.y.round() as i32);
    if center.x < 0 || center.y < 0 || center.x >= frame.cols() || center.y >= frame.rows() {
        return Ok(());
    }
    imgproc::circle(frame, center, 1, Scalar::new(0.0, 0.0, 255.0, 0.0), -1, LINE_8, 0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Vec3b, CV_8UC3};

    #[test]
    fn test_exit_reason_from_source_error() {
        assert_eq!(ExitReason::from(SourceError::EndOfStream), ExitReason::EndOfStream);
        assert_eq!(ExitReason::from(SourceError::Interrupted), ExitReason::Cancelled);
        assert_eq!(ExitReason::from(SourceError::Closed), ExitReason::Cancelled);
        assert_eq!(
            ExitReason::from(SourceError::Decode("bad packet".into())),
            ExitReason::SourceFailed(SourceError::Decode("bad packet".into()))
        );
    }

    #[test]
    fn test_dot_outside_frame_is_ignored() {
        let mut frame = Mat::new_rows_cols_with_default(10, 10, CV_8UC3, Scalar::all(0.0)).unwrap();
        draw_dot(&mut frame, Point2f::new(-3.0, 4.0)).unwrap();
        draw_dot(&mut frame, Point2f::new(4.0, 40.0)).unwrap();
        draw_dot(&mut frame, Point2f::new(5.0, 5.0)).unwrap();

        assert_eq!(*frame.at_2d::<Vec3b>(5, 5).unwrap(), Vec3b::from([0, 0, 255]));
        assert_eq!(*frame.at_2d::<Vec3b>(0, 0).unwrap(), Vec3b::from([0, 0, 0]));
    }
}
