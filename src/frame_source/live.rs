use super::{FrameSource, SourceInfo, SourceMode};
use crate::constants::CAPTURE_IDLE_MS;
use crate::error::SourceError;
use crate::utils::safe_cast::f64_to_i32;
use crate::{Error, Result};
use log::{debug, error, info, warn};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A device producing BGR frames on demand
pub trait CaptureDevice: Send {
    /// Read one frame; `Ok(None)` when the device had nothing ready
    ///
    /// # Errors
    ///
    /// Returns an error when the device failed and will not recover
    fn read(&mut self) -> Result<Option<Mat>>;

    /// Negotiated frame geometry
    fn frame_size(&self) -> (i32, i32);
}

/// Camera opened through `OpenCV`'s `VideoCapture`
pub struct OpenCvCamera {
    capture: VideoCapture,
    width: i32,
    height: i32,
}

impl OpenCvCamera {
    /// Open camera `index` and request `width × height` with a single
    /// buffered frame, so reads always see the newest image
    ///
    /// # Errors
    ///
    /// Returns `Error::SourceOpen` if the device is unavailable
    pub fn open(index: i32, width: i32, height: i32) -> Result<Self> {
        let mut capture = VideoCapture::new(index, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(Error::SourceOpen(format!("camera {index}")));
        }

        capture.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(width))?;
        capture.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(height))?;
        if !capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)? {
            debug!("Camera {index} ignores the buffer size property");
        }

        let actual_width = f64_to_i32(capture.get(videoio::CAP_PROP_FRAME_WIDTH)?)?;
        let actual_height = f64_to_i32(capture.get(videoio::CAP_PROP_FRAME_HEIGHT)?)?;
        if (actual_width, actual_height) != (width, height) {
            warn!("Camera {index} negotiated {actual_width}x{actual_height} instead of {width}x{height}");
        }

        Ok(Self {
            capture,
            width: actual_width,
            height: actual_height,
        })
    }
}

impl CaptureDevice for OpenCvCamera {
    fn read(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        if self.capture.read(&mut frame)? && !frame.empty() {
            Ok(Some(frame))
        } else {
            Ok(None)
        }
    }

    fn frame_size(&self) -> (i32, i32) {
        (self.width, self.height)
    }
}

#[derive(Default)]
struct SlotState {
    latest: Option<Mat>,
    produced: u64,
    consumed: u64,
    interrupted: bool,
    closed: bool,
    failure: Option<String>,
}

/// Single-frame handoff between the capture thread and the consumer.
///
/// Only the newest frame is kept; a slow consumer skips frames rather than
/// queueing them.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the latest frame and wake the consumer
    pub fn publish(&self, frame: Mat) {
        let mut state = self.lock();
        state.latest = Some(frame);
        state.produced += 1;
        drop(state);
        self.ready.notify_all();
    }

    /// Record a device failure; pending and future waits report it
    pub fn fail(&self, reason: String) {
        self.lock().failure = Some(reason);
        self.ready.notify_all();
    }

    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.ready.notify_all();
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.latest = None;
        drop(state);
        self.ready.notify_all();
    }

    /// Block until a frame newer than the last one handed out arrives
    ///
    /// # Errors
    ///
    /// `Closed`, `Interrupted` or `Device` once the slot can no longer
    /// produce frames
    pub fn wait_next(&self) -> std::result::Result<Mat, SourceError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(SourceError::Closed);
            }
            if state.interrupted {
                return Err(SourceError::Interrupted);
            }
            if state.produced > state.consumed {
                if let Some(frame) = state.latest.as_ref() {
                    let frame = frame
                        .try_clone()
                        .map_err(|e| SourceError::Device(e.to_string()))?;
                    state.consumed = state.produced;
                    return Ok(frame);
                }
            }
            if let Some(reason) = &state.failure {
                return Err(SourceError::Device(reason.clone()));
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Copy of the newest frame, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be copied
    pub fn latest(&self) -> Result<Option<Mat>> {
        let state = self.lock();
        if state.closed {
            return Err(Error::Source(SourceError::Closed));
        }
        Ok(state.latest.as_ref().map(Mat::try_clone).transpose()?)
    }
}

/// Live camera source; a dedicated thread keeps the newest frame in a
/// [`FrameSlot`]
pub struct LiveCaptureSource {
    info: SourceInfo,
    slot: Arc<FrameSlot>,
    stop: Arc<AtomicBool>,
    capture_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LiveCaptureSource {
    /// Open a camera and start capturing
    ///
    /// # Errors
    ///
    /// Returns `Error::SourceOpen` if the camera is unavailable
    pub fn open(index: i32, width: i32, height: i32) -> Result<Self> {
        let camera = OpenCvCamera::open(index, width, height)?;
        Self::with_device(Box::new(camera), format!("camera {index}"))
    }

    /// Start capturing from an already opened device
    ///
    /// # Errors
    ///
    /// Returns an error if the capture thread cannot be spawned
    pub fn with_device(device: Box<dyn CaptureDevice>, identifier: String) -> Result<Self> {
        let (width, height) = device.frame_size();
        let slot = Arc::new(FrameSlot::default());
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let slot = Arc::clone(&slot);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("frame-capture".into())
                .spawn(move || capture_loop(device, &slot, &stop))?
        };

        info!("Live capture started on {identifier} ({width}x{height})");

        Ok(Self {
            info: SourceInfo {
                mode: SourceMode::LiveCapture,
                identifier,
                width,
                height,
                fps: 0.0,
            },
            slot,
            stop,
            capture_thread: Mutex::new(Some(handle)),
        })
    }
}

fn capture_loop(mut device: Box<dyn CaptureDevice>, slot: &FrameSlot, stop: &AtomicBool) {
    debug!("Capture thread running");
    while !stop.load(Ordering::Acquire) {
        match device.read() {
            Ok(Some(frame)) => slot.publish(frame),
            Ok(None) => thread::sleep(Duration::from_millis(CAPTURE_IDLE_MS)),
            Err(e) => {
                error!("Capture device failed: {e}");
                slot.fail(e.to_string());
                break;
            }
        }
    }
    debug!("Capture thread exiting");
}

impl FrameSource for LiveCaptureSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn next_frame(&self) -> std::result::Result<Mat, SourceError> {
        self.slot.wait_next()
    }

    fn current_frame(&self) -> Result<Mat> {
        self.slot
            .latest()?
            .ok_or_else(|| Error::InvalidInput("no frame captured yet".into()))
    }

    fn interrupt(&self) {
        self.slot.interrupt();
    }

    fn close(&self) {
        self.stop.store(true, Ordering::Release);
        self.slot.close();

        let handle = self
            .capture_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
            info!("Live capture on {} closed", self.info.identifier);
        }
    }
}

impl Drop for LiveCaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}
