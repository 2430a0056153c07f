//! Recording canvas assembled from observed channels.

use crate::error::FrameError;
use crate::frame::{FrameObserver, FrameShape};

struct Placement {
    observer: FrameObserver,
    row: u32,
    col: u32,
    scratch: Vec<u8>,
}

/// Fixed layout of source channels on one output frame.
///
/// Every source is copied from its channel with a seqlock snapshot; a torn
/// snapshot keeps that region's previous contents.
pub struct Canvas {
    shape: FrameShape,
    pixels: Vec<u8>,
    placements: Vec<Placement>,
}

impl std::fmt::Debug for Canvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canvas")
            .field("shape", &self.shape)
            .field("sources", &self.placements.len())
            .finish()
    }
}

impl Canvas {
    pub fn new(shape: FrameShape) -> Self {
        Self {
            shape,
            pixels: vec![0; shape.len()],
            placements: Vec::new(),
        }
    }

    /// One source covering the whole frame.
    pub fn single(observer: FrameObserver) -> Self {
        let mut canvas = Self::new(observer.shape());
        canvas.placements.push(Placement {
            scratch: vec![0; observer.shape().len()],
            observer,
            row: 0,
            col: 0,
        });
        canvas
    }

    /// Processed-video layout.
    ///
    /// ```text
    /// +---------+----------------+
    /// | path    | tracker frame  |
    /// +---------+                |
    /// | heatmap |                |
    /// +---------+----------------+
    /// | legend  | progress strip |
    /// +---------+----------------+
    /// ```
    pub fn processed(
        path: FrameObserver,
        heatmap: FrameObserver,
        gradient: FrameObserver,
        tracker: FrameObserver,
        progress: FrameObserver,
    ) -> Result<Self, FrameError> {
        let (p, h, g, t, s) = (
            path.shape(),
            heatmap.shape(),
            gradient.shape(),
            tracker.shape(),
            progress.shape(),
        );
        let left = p.rows + h.rows + g.rows;
        let right = t.rows + 1 + s.rows;
        let shape = FrameShape::rgb(left.max(right), p.cols + t.cols);

        let mut canvas = Self::new(shape);
        canvas.place(path, 0, 0)?;
        canvas.place(heatmap, p.rows, 0)?;
        canvas.place(gradient, p.rows + h.rows, 0)?;
        canvas.place(tracker, 0, p.cols)?;
        canvas.place(progress, t.rows + 1, p.cols)?;
        Ok(canvas)
    }

    /// Put `observer`'s frame with its top-left corner at `row`, `col`.
    pub fn place(&mut self, observer: FrameObserver, row: u32, col: u32) -> Result<(), FrameError> {
        let source = observer.shape();
        if source.channels != self.shape.channels
            || row + source.rows > self.shape.rows
            || col + source.cols > self.shape.cols
        {
            return Err(FrameError::InvalidHeader(format!(
                "{source:?} at ({row}, {col}) does not fit canvas {:?}",
                self.shape
            )));
        }
        self.placements.push(Placement {
            scratch: vec![0; source.len()],
            observer,
            row,
            col,
        });
        Ok(())
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Refresh every region from its source and return the composed frame.
    pub fn compose(&mut self) -> Result<&[u8], FrameError> {
        let channels = self.shape.channels as usize;
        let stride = self.shape.cols as usize * channels;
        for placement in &mut self.placements {
            if !placement.observer.snapshot_into(&mut placement.scratch)? {
                tracing::trace!(row = placement.row, col = placement.col, "Torn snapshot, keeping region");
                continue;
            }
            let source = placement.observer.shape();
            let width = source.cols as usize * channels;
            let left = placement.col as usize * channels;
            for (i, line) in placement.scratch.chunks_exact(width).enumerate() {
                let start = (placement.row as usize + i) * stride + left;
                self.pixels[start..start + width].copy_from_slice(line);
            }
        }
        Ok(&self.pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{frame_channel, FrameProducer};
    use std::time::Duration;
    use tempfile::tempdir;

    fn source(dir: &std::path::Path, name: &str, shape: FrameShape, fill: u8) -> FrameProducer {
        let (producer, consumer) =
            frame_channel(&dir.join(name), shape, Duration::from_millis(1)).unwrap();
        producer.try_publish(&vec![fill; shape.len()]).unwrap();
        // the recorder observes, it never consumes
        drop(consumer);
        producer
    }

    #[test]
    fn test_processed_layout() {
        let dir = tempdir().unwrap();
        let path = source(dir.path(), "path", FrameShape::rgb(240, 320), 1);
        let heatmap = source(dir.path(), "heatmap", FrameShape::rgb(240, 320), 2);
        let gradient = source(dir.path(), "gradient", FrameShape::rgb(100, 320), 3);
        let tracker = source(dir.path(), "tracker", FrameShape::rgb(480, 640), 4);
        let progress = source(dir.path(), "progress", FrameShape::rgb(98, 640), 5);

        let mut canvas = Canvas::processed(
            path.observer(),
            heatmap.observer(),
            gradient.observer(),
            tracker.observer(),
            progress.observer(),
        )
        .unwrap();
        assert_eq!(canvas.shape(), FrameShape::rgb(580, 960));

        let frame = canvas.compose().unwrap().to_vec();
        let at = |row: usize, col: usize| frame[(row * 960 + col) * 3];
        assert_eq!(at(0, 0), 1);
        assert_eq!(at(239, 319), 1);
        assert_eq!(at(240, 0), 2);
        assert_eq!(at(480, 100), 3);
        assert_eq!(at(579, 319), 3);
        assert_eq!(at(0, 320), 4);
        assert_eq!(at(479, 959), 4);
        // separator row between tracker frame and progress strip
        assert_eq!(at(480, 500), 0);
        assert_eq!(at(481, 320), 5);
        assert_eq!(at(578, 959), 5);
        assert_eq!(at(579, 959), 0);
    }

    #[test]
    fn test_mismatched_source_is_rejected() {
        let dir = tempdir().unwrap();
        let gray = source(dir.path(), "gray", FrameShape::gray(10, 10), 0);
        let mut canvas = Canvas::new(FrameShape::rgb(20, 20));
        assert!(canvas.place(gray.observer(), 0, 0).is_err());

        let big = source(dir.path(), "big", FrameShape::rgb(10, 10), 0);
        assert!(canvas.place(big.observer(), 15, 0).is_err());
        assert!(canvas.place(big.observer(), 10, 10).is_ok());
    }

    #[test]
    fn test_single_copies_whole_frame() {
        let dir = tempdir().unwrap();
        let raw = source(dir.path(), "raw", FrameShape::gray(4, 6), 9);
        let mut canvas = Canvas::single(raw.observer());
        assert_eq!(canvas.compose().unwrap(), &[9u8; 24][..]);
    }
}
