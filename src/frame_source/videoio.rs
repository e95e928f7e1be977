use super::demux::{CodecId, MediaDemuxer, MediaType, Packet, RawFormat, StreamInfo};
use crate::constants::DEFAULT_FPS;
use crate::utils::safe_cast::f64_to_i32;
use crate::{Error, Result};
use log::debug;
use opencv::{
    core::{Mat, CV_8UC3},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::path::Path;

/// Container backend for everything `OpenCV` can open.
///
/// The backend decodes internally, so each packet carries one packed BGR
/// picture and the stream reports a raw BGR codec.
pub struct VideoCaptureDemuxer {
    capture: VideoCapture,
    streams: Vec<StreamInfo>,
    pending: Option<Packet>,
}

impl VideoCaptureDemuxer {
    /// # Errors
    ///
    /// Returns `Error::SourceOpen` if the file cannot be opened
    pub fn open(path: &Path) -> Result<Self> {
        let name = path
            .to_str()
            .ok_or_else(|| Error::SourceOpen(format!("non UTF-8 path {}", path.display())))?;
        if !path.is_file() {
            return Err(Error::SourceOpen(format!("{name}: no such file")));
        }

        let capture = VideoCapture::from_file(name, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(Error::SourceOpen(name.to_string()));
        }

        let mut width = f64_to_i32(capture.get(videoio::CAP_PROP_FRAME_WIDTH)?).unwrap_or(0);
        let mut height = f64_to_i32(capture.get(videoio::CAP_PROP_FRAME_HEIGHT)?).unwrap_or(0);
        let fps = capture.get(videoio::CAP_PROP_FPS)?;
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { DEFAULT_FPS };

        let mut demuxer = Self {
            capture,
            streams: Vec::new(),
            pending: None,
        };

        // Some backends only know the geometry after the first read
        if width <= 0 || height <= 0 {
            debug!("{name}: probing first frame for geometry");
            if let Some((packet, w, h)) = demuxer.read_bgr()? {
                width = w;
                height = h;
                demuxer.pending = Some(packet);
            }
        }

        demuxer.streams.push(StreamInfo {
            index: 0,
            media_type: MediaType::Video,
            codec: CodecId::RawVideo(RawFormat::Bgr24),
            width,
            height,
            fps,
        });

        Ok(demuxer)
    }

    fn read_bgr(&mut self) -> Result<Option<(Packet, i32, i32)>> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }

        let frame = to_bgr(frame)?;
        let frame = if frame.is_continuous() { frame } else { frame.try_clone()? };

        let packet = Packet {
            stream_index: 0,
            data: frame.data_bytes()?.to_vec(),
        };
        Ok(Some((packet, frame.cols(), frame.rows())))
    }
}

/// Backends deliver BGR, BGRA or gray frames
fn to_bgr(frame: Mat) -> Result<Mat> {
    if frame.typ() == CV_8UC3 {
        return Ok(frame);
    }

    let code = match frame.channels() {
        1 => imgproc::COLOR_GRAY2BGR,
        4 => imgproc::COLOR_BGRA2BGR,
        channels => {
            return Err(Error::InvalidInput(format!(
                "unsupported capture frame with {channels} channels"
            )))
        }
    };
    let mut bgr = Mat::default();
    imgproc::cvt_color(&frame, &mut bgr, code, 0)?;
    Ok(bgr)
}

impl MediaDemuxer for VideoCaptureDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if let Some(packet) = self.pending.take() {
            return Ok(Some(packet));
        }
        Ok(self.read_bgr()?.map(|(packet, _, _)| packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, Vec3b, CV_8UC1, CV_8UC2, CV_8UC4};

    #[test]
    fn test_capture_frames_converted_to_bgr() {
        let bgra = Mat::new_rows_cols_with_default(4, 6, CV_8UC4, Scalar::new(10.0, 20.0, 30.0, 255.0)).unwrap();
        let bgr = to_bgr(bgra).unwrap();
        assert_eq!(bgr.typ(), CV_8UC3);
        assert_eq!((bgr.cols(), bgr.rows()), (6, 4));
        assert_eq!(*bgr.at_2d::<Vec3b>(2, 3).unwrap(), Vec3b::from([10, 20, 30]));

        let gray = Mat::new_rows_cols_with_default(4, 6, CV_8UC1, Scalar::all(77.0)).unwrap();
        assert_eq!(*to_bgr(gray).unwrap().at_2d::<Vec3b>(0, 0).unwrap(), Vec3b::from([77, 77, 77]));

        let two = Mat::new_rows_cols_with_default(4, 6, CV_8UC2, Scalar::all(0.0)).unwrap();
        assert!(matches!(to_bgr(two), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_missing_file_is_source_open_error() {
        let result = VideoCaptureDemuxer::open(Path::new("/nonexistent/video.mp4"));
        assert!(matches!(result, Err(Error::SourceOpen(_))));
    }
}
