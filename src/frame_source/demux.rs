use super::{videoio::VideoCaptureDemuxer, y4m::Y4mDemuxer, FrameSource, SourceInfo, SourceMode};
use crate::error::SourceError;
use crate::utils::safe_cast::i32_to_usize;
use crate::{Error, Result};
use log::{debug, info, warn};
use opencv::{
    core::{Mat, Scalar, CV_8UC1, CV_8UC3},
    imgproc,
    prelude::*,
};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
    Data,
}

/// Uncompressed picture layouts the color converter understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    /// Planar Y, U, V with 2×2 chroma subsampling
    I420,
    /// Y plane followed by interleaved UV, 2×2 subsampling
    Nv12,
    Gray8,
    Rgb24,
    Bgr24,
}

impl RawFormat {
    /// Bytes of one `width × height` picture
    #[must_use]
    pub fn picture_size(self, width: usize, height: usize) -> usize {
        match self {
            Self::I420 | Self::Nv12 => width * height + 2 * width.div_ceil(2) * height.div_ceil(2),
            Self::Gray8 => width * height,
            Self::Rgb24 | Self::Bgr24 => 3 * width * height,
        }
    }

    fn is_subsampled(self) -> bool {
        matches!(self, Self::I420 | Self::Nv12)
    }
}

/// Codec of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecId {
    /// Uncompressed pictures in the given layout
    RawVideo(RawFormat),
    /// Anything without a registered decoder
    Other(String),
}

/// One stream of a container
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub media_type: MediaType,
    pub codec: CodecId,
    pub width: i32,
    pub height: i32,
    pub fps: f64,
}

/// A compressed unit read from the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_index: usize,
    pub data: Vec<u8>,
}

/// A decoded picture in its native layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub width: i32,
    pub height: i32,
    pub format: RawFormat,
    pub data: Vec<u8>,
}

/// Container reader
pub trait MediaDemuxer: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Next packet of any stream, `Ok(None)` at end of file
    ///
    /// # Errors
    ///
    /// Returns an error if the container is corrupt or unreadable
    fn read_packet(&mut self) -> Result<Option<Packet>>;
}

/// Packet-to-picture decoder for one stream
pub trait VideoDecoder: Send {
    /// Feed bytes of the current packet.
    ///
    /// Returns how many bytes were consumed and, once enough input has
    /// accumulated, a complete picture.
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be decoded
    fn decode(&mut self, data: &[u8]) -> Result<(usize, Option<Picture>)>;
}

/// First video stream of the container
#[must_use]
pub fn select_video_stream(streams: &[StreamInfo]) -> Option<&StreamInfo> {
    streams.iter().find(|s| s.media_type == MediaType::Video)
}

/// Decoder registered for the stream's codec
///
/// # Errors
///
/// `Error::NoDecoder` for unknown codecs, `Error::CodecOpen` when the stream
/// parameters are unusable
pub fn find_decoder(stream: &StreamInfo) -> Result<Box<dyn VideoDecoder>> {
    match &stream.codec {
        CodecId::RawVideo(format) => Ok(Box::new(RawVideoDecoder::open(stream, *format)?)),
        CodecId::Other(name) => Err(Error::NoDecoder(name.clone())),
    }
}

/// Decoder for uncompressed video; packets may split or span pictures
pub struct RawVideoDecoder {
    width: i32,
    height: i32,
    format: RawFormat,
    picture_size: usize,
    partial: Vec<u8>,
}

impl RawVideoDecoder {
    /// # Errors
    ///
    /// Returns `Error::CodecOpen` for empty or odd-sized subsampled geometry
    pub fn open(stream: &StreamInfo, format: RawFormat) -> Result<Self> {
        let (width, height) = (stream.width, stream.height);
        if width <= 0 || height <= 0 {
            return Err(Error::CodecOpen(format!("invalid geometry {width}x{height}")));
        }
        if format.is_subsampled() && (width % 2 != 0 || height % 2 != 0) {
            return Err(Error::CodecOpen(format!(
                "{format:?} requires even dimensions, got {width}x{height}"
            )));
        }

        let picture_size = format.picture_size(i32_to_usize(width)?, i32_to_usize(height)?);
        Ok(Self {
            width,
            height,
            format,
            picture_size,
            partial: Vec::with_capacity(picture_size),
        })
    }
}

impl VideoDecoder for RawVideoDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<(usize, Option<Picture>)> {
        let needed = self.picture_size - self.partial.len();
        if data.len() < needed {
            self.partial.extend_from_slice(data);
            return Ok((data.len(), None));
        }

        self.partial.extend_from_slice(&data[..needed]);
        let data = std::mem::replace(&mut self.partial, Vec::with_capacity(self.picture_size));
        Ok((
            needed,
            Some(Picture {
                width: self.width,
                height: self.height,
                format: self.format,
                data,
            }),
        ))
    }
}

/// Converts decoded pictures to 8-bit BGR, reusing its buffers while the
/// geometry stays the same
#[derive(Default)]
pub struct ColorConverter {
    input: Mat,
    output: Mat,
    geometry: Option<(i32, i32, RawFormat)>,
}

impl ColorConverter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_buffers(&mut self, picture: &Picture) -> Result<()> {
        let geometry = (picture.width, picture.height, picture.format);
        if self.geometry == Some(geometry) {
            return Ok(());
        }

        let (rows, kind) = match picture.format {
            RawFormat::I420 | RawFormat::Nv12 => (picture.height * 3 / 2, CV_8UC1),
            RawFormat::Gray8 => (picture.height, CV_8UC1),
            RawFormat::Rgb24 | RawFormat::Bgr24 => (picture.height, CV_8UC3),
        };
        self.input = Mat::new_rows_cols_with_default(rows, picture.width, kind, Scalar::all(0.0))?;
        self.output =
            Mat::new_rows_cols_with_default(picture.height, picture.width, CV_8UC3, Scalar::all(0.0))?;
        self.geometry = Some(geometry);
        debug!(
            "Color conversion buffers sized for {}x{} {:?}",
            picture.width, picture.height, picture.format
        );
        Ok(())
    }

    /// Convert `picture` into a new BGR frame
    ///
    /// # Errors
    ///
    /// Returns an error if the picture size does not match its geometry or
    /// the conversion fails
    pub fn convert(&mut self, picture: &Picture) -> Result<Mat> {
        self.ensure_buffers(picture)?;

        let input = self.input.data_bytes_mut()?;
        if input.len() != picture.data.len() {
            return Err(Error::InvalidInput(format!(
                "picture holds {} bytes, expected {}",
                picture.data.len(),
                input.len()
            )));
        }
        input.copy_from_slice(&picture.data);

        match picture.format {
            RawFormat::I420 => imgproc::cvt_color(&self.input, &mut self.output, imgproc::COLOR_YUV2BGR_I420, 0)?,
            RawFormat::Nv12 => imgproc::cvt_color(&self.input, &mut self.output, imgproc::COLOR_YUV2BGR_NV12, 0)?,
            RawFormat::Gray8 => imgproc::cvt_color(&self.input, &mut self.output, imgproc::COLOR_GRAY2BGR, 0)?,
            RawFormat::Rgb24 => imgproc::cvt_color(&self.input, &mut self.output, imgproc::COLOR_RGB2BGR, 0)?,
            RawFormat::Bgr24 => self.input.copy_to(&mut self.output)?,
        }

        Ok(self.output.try_clone()?)
    }
}

struct DemuxState {
    demuxer: Box<dyn MediaDemuxer>,
    decoder: Box<dyn VideoDecoder>,
    converter: ColorConverter,
    stream_index: usize,
    packet: Option<Packet>,
    offset: usize,
    last_picture: Option<Picture>,
}

impl DemuxState {
    /// Pull packets until the decoder yields a picture of the video stream
    fn decode_next(&mut self) -> std::result::Result<Picture, SourceError> {
        loop {
            let exhausted = self
                .packet
                .as_ref()
                .map_or(true, |p| self.offset >= p.data.len());
            if exhausted {
                self.offset = 0;
                self.packet = match self.demuxer.read_packet() {
                    Ok(Some(packet)) => Some(packet),
                    Ok(None) => return Err(SourceError::EndOfStream),
                    Err(e) => return Err(SourceError::Decode(e.to_string())),
                };
                continue;
            }

            let Some(packet) = self.packet.as_ref() else {
                continue;
            };
            if packet.stream_index != self.stream_index {
                self.packet = None;
                continue;
            }

            let (consumed, picture) = self
                .decoder
                .decode(&packet.data[self.offset..])
                .map_err(|e| SourceError::Decode(e.to_string()))?;
            if consumed == 0 && picture.is_none() {
                return Err(SourceError::Decode("decoder made no progress".into()));
            }
            self.offset += consumed;

            if let Some(picture) = picture {
                return Ok(picture);
            }
        }
    }
}

/// File source: demux, decode the first video stream, convert to BGR
pub struct DemuxedFileSource {
    info: SourceInfo,
    state: Mutex<Option<DemuxState>>,
}

impl DemuxedFileSource {
    /// Open a media file; `.y4m` files use the native reader, everything else
    /// goes through `OpenCV`
    ///
    /// # Errors
    ///
    /// Returns `SourceOpen`, `NoVideoStream`, `NoDecoder` or `CodecOpen`
    pub fn open(path: &Path) -> Result<Self> {
        let is_y4m = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("y4m"));

        let demuxer: Box<dyn MediaDemuxer> = if is_y4m {
            Box::new(Y4mDemuxer::open(path)?)
        } else {
            Box::new(VideoCaptureDemuxer::open(path)?)
        };

        Self::from_demuxer(demuxer, path.display().to_string())
    }

    /// Build a source over an already opened container
    ///
    /// # Errors
    ///
    /// Returns `NoVideoStream`, `NoDecoder` or `CodecOpen`
    pub fn from_demuxer(demuxer: Box<dyn MediaDemuxer>, identifier: String) -> Result<Self> {
        let stream = select_video_stream(demuxer.streams())
            .cloned()
            .ok_or_else(|| Error::NoVideoStream(identifier.clone()))?;
        let decoder = find_decoder(&stream)?;

        info!(
            "Opened {identifier}: stream {} {}x{} at {:.2} fps ({:?})",
            stream.index, stream.width, stream.height, stream.fps, stream.codec
        );

        Ok(Self {
            info: SourceInfo {
                mode: SourceMode::DemuxedFile,
                identifier,
                width: stream.width,
                height: stream.height,
                fps: stream.fps,
            },
            state: Mutex::new(Some(DemuxState {
                demuxer,
                decoder,
                converter: ColorConverter::new(),
                stream_index: stream.index,
                packet: None,
                offset: 0,
                last_picture: None,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<DemuxState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSource for DemuxedFileSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn next_frame(&self) -> std::result::Result<Mat, SourceError> {
        let mut guard = self.lock();
        let state = guard.as_mut().ok_or(SourceError::Closed)?;

        let picture = state.decode_next()?;
        let frame = state
            .converter
            .convert(&picture)
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        state.last_picture = Some(picture);
        Ok(frame)
    }

    fn current_frame(&self) -> Result<Mat> {
        let mut guard = self.lock();
        let state = guard.as_mut().ok_or(Error::Source(SourceError::Closed))?;
        let DemuxState {
            converter,
            last_picture,
            ..
        } = state;

        match last_picture {
            Some(picture) => converter.convert(picture),
            None => Err(Error::InvalidInput("no frame decoded yet".into())),
        }
    }

    fn interrupt(&self) {
        // Decoding never blocks on an external producer
    }

    fn close(&self) {
        if self.lock().take().is_some() {
            info!("Closed {}", self.info.identifier);
        } else {
            warn!("{} already closed", self.info.identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedDemuxer {
        streams: Vec<StreamInfo>,
        packets: VecDeque<Packet>,
    }

    impl MediaDemuxer for ScriptedDemuxer {
        fn streams(&self) -> &[StreamInfo] {
            &self.streams
        }

        fn read_packet(&mut self) -> Result<Option<Packet>> {
            Ok(self.packets.pop_front())
        }
    }

    fn stream(index: usize, media_type: MediaType, codec: CodecId) -> StreamInfo {
        StreamInfo {
            index,
            media_type,
            codec,
            width: 4,
            height: 2,
            fps: 25.0,
        }
    }

    fn gray_stream(index: usize) -> StreamInfo {
        stream(index, MediaType::Video, CodecId::RawVideo(RawFormat::Gray8))
    }

    #[test]
    fn test_select_first_video_stream() {
        let streams = vec![
            stream(0, MediaType::Audio, CodecId::Other("aac".into())),
            gray_stream(1),
            gray_stream(2),
        ];
        assert_eq!(select_video_stream(&streams).unwrap().index, 1);
        assert!(select_video_stream(&streams[..1]).is_none());
    }

    #[test]
    fn test_picture_sizes() {
        assert_eq!(RawFormat::I420.picture_size(640, 480), 460_800);
        assert_eq!(RawFormat::Gray8.picture_size(4, 2), 8);
        assert_eq!(RawFormat::Bgr24.picture_size(4, 2), 24);
    }

    #[test]
    fn test_raw_decoder_assembles_split_packets() {
        let mut decoder = RawVideoDecoder::open(&gray_stream(0), RawFormat::Gray8).unwrap();

        let (consumed, picture) = decoder.decode(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(consumed, 5);
        assert!(picture.is_none());

        let (consumed, picture) = decoder.decode(&[6, 7, 8, 9, 10]).unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(picture.unwrap().data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_raw_decoder_rejects_odd_yuv_geometry() {
        let mut odd = gray_stream(0);
        odd.width = 3;
        assert!(matches!(
            RawVideoDecoder::open(&odd, RawFormat::I420),
            Err(Error::CodecOpen(_))
        ));
    }

    #[test]
    fn test_unknown_codec_has_no_decoder() {
        let s = stream(0, MediaType::Video, CodecId::Other("vp9".into()));
        assert!(matches!(find_decoder(&s), Err(Error::NoDecoder(_))));
    }

    #[test]
    fn test_converter_gray_to_bgr() {
        let mut converter = ColorConverter::new();
        let picture = Picture {
            width: 2,
            height: 1,
            format: RawFormat::Gray8,
            data: vec![10, 200],
        };
        let frame = converter.convert(&picture).unwrap();
        assert_eq!(frame.typ(), CV_8UC3);
        assert_eq!(frame.data_bytes().unwrap(), &[10, 10, 10, 200, 200, 200]);

        let short = Picture { data: vec![1], ..picture };
        assert!(converter.convert(&short).is_err());
    }

    #[test]
    fn test_source_skips_foreign_packets_and_ends() {
        let demuxer = ScriptedDemuxer {
            streams: vec![stream(0, MediaType::Audio, CodecId::Other("pcm".into())), gray_stream(1)],
            packets: VecDeque::from(vec![
                Packet { stream_index: 0, data: vec![0xAA; 3] },
                Packet { stream_index: 1, data: vec![50; 8] },
                Packet { stream_index: 0, data: vec![0xBB; 3] },
                Packet { stream_index: 1, data: vec![90; 8] },
            ]),
        };
        let source = DemuxedFileSource::from_demuxer(Box::new(demuxer), "scripted".into()).unwrap();
        assert_eq!(source.info().mode, SourceMode::DemuxedFile);
        assert_eq!((source.info().width, source.info().height), (4, 2));

        let first = source.next_frame().unwrap();
        assert!(first.data_bytes().unwrap().iter().all(|&b| b == 50));
        let second = source.next_frame().unwrap();
        assert!(second.data_bytes().unwrap().iter().all(|&b| b == 90));
        assert_eq!(source.next_frame().unwrap_err(), SourceError::EndOfStream);

        let again = source.current_frame().unwrap();
        assert!(again.data_bytes().unwrap().iter().all(|&b| b == 90));

        source.close();
        assert_eq!(source.next_frame().unwrap_err(), SourceError::Closed);
        assert!(source.current_frame().is_err());
    }

    #[test]
    fn test_source_without_video_stream() {
        let demuxer = ScriptedDemuxer {
            streams: vec![stream(0, MediaType::Audio, CodecId::Other("aac".into()))],
            packets: VecDeque::new(),
        };
        let result = DemuxedFileSource::from_demuxer(Box::new(demuxer), "audio-only".into());
        assert!(matches!(result, Err(Error::NoVideoStream(_))));
    }
}
