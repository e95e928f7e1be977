//! Per-frame tracking records for file sessions and their JSON export.

use crate::constants::EXPRESSION_FILE_EXTENSION;
use crate::frame_source::SourceInfo;
use crate::tracking::TrackedShape;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Tracking result of one decoded frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// 1-based frame index
    pub frame: u64,
    pub has_face: bool,
    pub points2d: Vec<[f32; 2]>,
    pub points3d: Vec<[f32; 3]>,
}

impl FrameRecord {
    /// Record of a frame without a usable face
    #[must_use]
    pub fn empty(frame: u64) -> Self {
        Self {
            frame,
            has_face: false,
            points2d: Vec::new(),
            points3d: Vec::new(),
        }
    }

    /// Record of a frame whose shape qualified
    #[must_use]
    pub fn from_shape(frame: u64, shape: &TrackedShape) -> Self {
        Self {
            frame,
            has_face: true,
            points2d: shape.points.iter().map(|p| [p.x, p.y]).collect(),
            points3d: shape.points_3d.iter().map(|p| [p.x, p.y, p.z]).collect(),
        }
    }
}

/// Exported document: session metadata plus every frame record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionDocument {
    pub source: String,
    pub frame_width: i32,
    pub frame_height: i32,
    pub fps: f64,
    pub frames: Vec<FrameRecord>,
}

impl ExpressionDocument {
    /// Read a previously exported document
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// `clip.mp4` becomes `clip.expression.json`, next to the source
#[must_use]
pub fn expression_path(source: &Path) -> PathBuf {
    source.with_extension(EXPRESSION_FILE_EXTENSION)
}

/// Append-only frame log of one file session, exported once at teardown
#[derive(Debug)]
pub struct FrameRecorder {
    document: ExpressionDocument,
    output: PathBuf,
    exported: bool,
}

impl FrameRecorder {
    /// Recorder exporting next to the source file
    #[must_use]
    pub fn new(info: &SourceInfo) -> Self {
        Self::with_output(info, expression_path(Path::new(&info.identifier)))
    }

    /// Recorder exporting to `output`
    #[must_use]
    pub fn with_output(info: &SourceInfo, output: PathBuf) -> Self {
        Self {
            document: ExpressionDocument {
                source: info.identifier.clone(),
                frame_width: info.width,
                frame_height: info.height,
                fps: info.fps,
                frames: Vec::new(),
            },
            output,
            exported: false,
        }
    }

    /// Append the record of the next frame
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` once the document was exported, or when
    /// the frame index does not follow the previous record
    pub fn record(&mut self, record: FrameRecord) -> Result<()> {
        if self.exported {
            return Err(Error::InvalidInput("Recorder already exported".to_string()));
        }
        let expected = self.document.frames.len() as u64 + 1;
        if record.frame != expected {
            return Err(Error::InvalidInput(format!(
                "Expected record for frame {expected}, got {}",
                record.frame
            )));
        }
        self.document.frames.push(record);
        Ok(())
    }

    /// Records appended so far
    pub(crate) fn len(&self) -> usize {
        self.document.frames.len()
    }

    #[must_use]
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Write the document as pretty-printed JSON.
    ///
    /// Returns the written path, or `None` if it was already exported.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written
    pub fn export(&mut self) -> Result<Option<PathBuf>> {
        if self.exported {
            return Ok(None);
        }
        self.exported = true;

        let writer = BufWriter::new(File::create(&self.output)?);
        serde_json::to_writer_pretty(writer, &self.document)?;
        log::info!(
            "Exported {} frame records to {}",
            self.document.frames.len(),
            self.output.display()
        );
        Ok(Some(self.output.clone()))
    }
}
