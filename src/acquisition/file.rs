//! Replays a raw recording written by a recorder unit.

use super::FrameSource;
use crate::error::SourceError;
use crate::frame::FrameShape;
use crate::storage::RecordingMeta;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Frames are cropped or zero-padded to the output shape; color recordings
/// contribute their green channel.
#[derive(Debug)]
pub struct RawFileSource {
    path: PathBuf,
    recorded: FrameShape,
    output: FrameShape,
    reader: Option<BufReader<File>>,
    scratch: Vec<u8>,
    exhausted: bool,
}

impl RawFileSource {
    pub fn open(path: &Path, output: FrameShape) -> Result<Self, SourceError> {
        let meta = RecordingMeta::load(path)
            .map_err(|e| SourceError::InvalidRecording(format!("{e:#}")))?;
        let recorded = meta.shape();
        if recorded.channels != 1 && recorded.channels != 3 {
            return Err(SourceError::InvalidRecording(format!(
                "{} channels per pixel",
                recorded.channels
            )));
        }
        let mut source = Self {
            path: path.to_path_buf(),
            recorded,
            output,
            reader: None,
            scratch: vec![0; recorded.len()],
            exhausted: false,
        };
        source.connect()?;
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn copy_out(&self, out: &mut [u8]) {
        out.fill(0);
        let channels = self.recorded.channels as usize;
        let pick = if channels == 3 { 1 } else { 0 };
        let rows = self.recorded.rows.min(self.output.rows) as usize;
        let cols = self.recorded.cols.min(self.output.cols) as usize;
        let in_stride = self.recorded.cols as usize * channels;
        let out_stride = self.output.cols as usize;
        for r in 0..rows {
            for c in 0..cols {
                out[r * out_stride + c] = self.scratch[r * in_stride + c * channels + pick];
            }
        }
    }
}

impl FrameSource for RawFileSource {
    fn name(&self) -> &str {
        "file"
    }

    fn is_live(&self) -> bool {
        false
    }

    fn connect(&mut self) -> Result<(), SourceError> {
        let file = File::open(&self.path)?;
        self.reader = Some(BufReader::new(file));
        self.exhausted = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    fn next_frame(&mut self, out: &mut [u8]) -> Result<(), SourceError> {
        if out.len() != self.output.len() {
            return Err(SourceError::Camera(format!(
                "buffer of {} bytes for {:?}",
                out.len(),
                self.output
            )));
        }
        if self.exhausted {
            return Err(SourceError::Exhausted);
        }
        let reader = self.reader.as_mut().ok_or(SourceError::Disconnected)?;
        match reader.read_exact(&mut self.scratch) {
            Ok(()) => {
                self.copy_out(out);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::info!(path = %self.path.display(), "Recording exhausted");
                self.exhausted = true;
                Err(SourceError::Exhausted)
            }
            Err(e) => Err(SourceError::File(e)),
        }
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RawVideoSink;
    use tempfile::tempdir;

    #[test]
    fn test_replays_then_reports_exhausted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t_raw.frames");
        let mut sink = RawVideoSink::create(&path, FrameShape::gray(2, 3), 15.0).unwrap();
        sink.write_frame(&[1, 2, 3, 4, 5, 6]).unwrap();
        sink.write_frame(&[7, 8, 9, 10, 11, 12]).unwrap();
        sink.finish().unwrap();

        // larger output: padded with zeros
        let mut source = RawFileSource::open(&path, FrameShape::gray(3, 4)).unwrap();
        let mut out = vec![0xFF; 12];
        source.next_frame(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 0, 4, 5, 6, 0, 0, 0, 0, 0]);
        source.next_frame(&mut out).unwrap();
        assert_eq!(out[..3], [7, 8, 9]);
        assert!(matches!(source.next_frame(&mut out), Err(SourceError::Exhausted)));
        assert!(matches!(source.next_frame(&mut out), Err(SourceError::Exhausted)));

        // reconnecting rewinds
        source.connect().unwrap();
        source.next_frame(&mut out).unwrap();
        assert_eq!(out[0], 1);
    }

    #[test]
    fn test_color_recording_uses_green() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t_processed.frames");
        let mut sink = RawVideoSink::create(&path, FrameShape::rgb(1, 2), 15.0).unwrap();
        sink.write_frame(&[10, 20, 30, 40, 50, 60]).unwrap();
        sink.finish().unwrap();

        let mut source = RawFileSource::open(&path, FrameShape::gray(1, 1)).unwrap();
        let mut out = vec![0; 1];
        source.next_frame(&mut out).unwrap();
        assert_eq!(out, vec![20]);
    }

    #[test]
    fn test_missing_sidecar_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bare.frames");
        std::fs::write(&path, [0u8; 4]).unwrap();
        assert!(matches!(
            RawFileSource::open(&path, FrameShape::gray(2, 2)),
            Err(SourceError::InvalidRecording(_))
        ));
    }
}
