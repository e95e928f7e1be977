use super::demux::{CodecId, MediaDemuxer, MediaType, Packet, RawFormat, StreamInfo};
use crate::constants::DEFAULT_FPS;
use crate::utils::safe_cast::i32_to_usize;
use crate::{Error, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::Path;

const STREAM_MAGIC: &[u8] = b"YUV4MPEG2";
const FRAME_MAGIC: &[u8] = b"FRAME";

/// Reader for YUV4MPEG2 files: a single uncompressed video stream
pub struct Y4mDemuxer<R = BufReader<File>> {
    reader: R,
    streams: Vec<StreamInfo>,
    picture_size: usize,
    line: Vec<u8>,
}

impl Y4mDemuxer<BufReader<File>> {
    /// # Errors
    ///
    /// Returns `Error::SourceOpen` if the file is missing or not YUV4MPEG2
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::SourceOpen(format!("{}: {e}", path.display())))?;
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: BufRead + Send> Y4mDemuxer<R> {
    /// # Errors
    ///
    /// Returns `Error::SourceOpen` if the stream header is malformed
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let mut header = Vec::new();
        reader.read_until(b'\n', &mut header)?;
        let stream = parse_header(&header)?;

        let picture_size = match stream.codec {
            CodecId::RawVideo(format) => {
                format.picture_size(i32_to_usize(stream.width)?, i32_to_usize(stream.height)?)
            }
            CodecId::Other(_) => 0,
        };

        Ok(Self {
            reader,
            streams: vec![stream],
            picture_size,
            line: Vec::new(),
        })
    }
}

fn parse_header(header: &[u8]) -> Result<StreamInfo> {
    let text = std::str::from_utf8(header)
        .map_err(|_| Error::SourceOpen("Y4M header is not text".into()))?
        .trim_end();

    let mut tokens = text.split(' ');
    if tokens.next().map(str::as_bytes) != Some(STREAM_MAGIC) {
        return Err(Error::SourceOpen("missing YUV4MPEG2 signature".into()));
    }

    let mut width = None;
    let mut height = None;
    let mut fps = DEFAULT_FPS;
    let mut colorspace = "420jpeg";

    for token in tokens.filter(|t| !t.is_empty()) {
        let mut chars = token.chars();
        let tag = chars.next();
        let value = chars.as_str();
        match tag {
            Some('W') => width = value.parse::<i32>().ok(),
            Some('H') => height = value.parse::<i32>().ok(),
            Some('F') => {
                if let Some((num, den)) = value.split_once(':') {
                    if let (Ok(num), Ok(den)) = (num.parse::<f64>(), den.parse::<f64>()) {
                        if num > 0.0 && den > 0.0 {
                            fps = num / den;
                        }
                    }
                }
            }
            Some('C') => colorspace = value,
            _ => {}
        }
    }

    let (Some(width), Some(height)) = (width, height) else {
        return Err(Error::SourceOpen("Y4M header lacks frame size".into()));
    };

    // High bit depth tags (420p10, mono16, ...) store 16-bit samples
    let codec = match colorspace {
        "420" | "420jpeg" | "420paldv" | "420mpeg2" => CodecId::RawVideo(RawFormat::I420),
        "mono" => CodecId::RawVideo(RawFormat::Gray8),
        other => CodecId::Other(format!("y4m C{other}")),
    };

    Ok(StreamInfo {
        index: 0,
        media_type: MediaType::Video,
        codec,
        width,
        height,
        fps,
    })
}

impl<R: BufRead + Send> MediaDemuxer for Y4mDemuxer<R> {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        self.line.clear();
        if self.reader.read_until(b'\n', &mut self.line)? == 0 {
            return Ok(None);
        }
        if !self.line.starts_with(FRAME_MAGIC) {
            return Err(Error::InvalidInput("corrupt Y4M frame header".into()));
        }

        let mut data = vec![0; self.picture_size];
        match self.reader.read_exact(&mut data) {
            Ok(()) => Ok(Some(Packet { stream_index: 0, data })),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(Error::InvalidInput("truncated Y4M frame".into()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn y4m(header: &str, frames: &[&[u8]]) -> Cursor<Vec<u8>> {
        let mut bytes = format!("{header}\n").into_bytes();
        for frame in frames {
            bytes.extend_from_slice(b"FRAME\n");
            bytes.extend_from_slice(frame);
        }
        Cursor::new(bytes)
    }

    #[test]
    fn test_parse_header_fields() {
        let demuxer = Y4mDemuxer::from_reader(y4m("YUV4MPEG2 W4 H2 F30000:1001 Ip A1:1 C420jpeg", &[])).unwrap();
        let stream = &demuxer.streams()[0];
        assert_eq!((stream.width, stream.height), (4, 2));
        assert!((stream.fps - 29.97).abs() < 0.01);
        assert_eq!(stream.codec, CodecId::RawVideo(RawFormat::I420));
    }

    #[test]
    fn test_mono_and_unsupported_colorspaces() {
        let mono = Y4mDemuxer::from_reader(y4m("YUV4MPEG2 W4 H2 Cmono", &[])).unwrap();
        assert_eq!(mono.streams()[0].codec, CodecId::RawVideo(RawFormat::Gray8));

        let full = Y4mDemuxer::from_reader(y4m("YUV4MPEG2 W4 H2 C444", &[])).unwrap();
        assert!(matches!(full.streams()[0].codec, CodecId::Other(_)));
    }

    #[test]
    fn test_high_bit_depth_has_no_raw_format() {
        for colorspace in ["420p10", "420p12", "420p16", "mono16"] {
            let demuxer = Y4mDemuxer::from_reader(y4m(&format!("YUV4MPEG2 W4 H2 F25:1 C{colorspace}"), &[])).unwrap();
            assert_eq!(
                demuxer.streams()[0].codec,
                CodecId::Other(format!("y4m C{colorspace}")),
                "{colorspace}"
            );
        }

        for colorspace in ["420", "420paldv", "420mpeg2"] {
            let demuxer = Y4mDemuxer::from_reader(y4m(&format!("YUV4MPEG2 W4 H2 C{colorspace}"), &[])).unwrap();
            assert_eq!(demuxer.streams()[0].codec, CodecId::RawVideo(RawFormat::I420));
        }
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert!(Y4mDemuxer::from_reader(y4m("RIFF W4 H2", &[])).is_err());
        assert!(Y4mDemuxer::from_reader(y4m("YUV4MPEG2 W4", &[])).is_err());
    }

    #[test]
    fn test_reads_frames_until_eof() {
        let frame = [7u8; 8];
        let mut demuxer = Y4mDemuxer::from_reader(y4m("YUV4MPEG2 W4 H2 Cmono", &[&frame, &frame])).unwrap();

        assert_eq!(demuxer.read_packet().unwrap().unwrap().data, frame.to_vec());
        assert!(demuxer.read_packet().unwrap().is_some());
        assert!(demuxer.read_packet().unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut demuxer = Y4mDemuxer::from_reader(y4m("YUV4MPEG2 W4 H2 Cmono", &[&[1, 2, 3]])).unwrap();
        assert!(demuxer.read_packet().is_err());
    }
}
