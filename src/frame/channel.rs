//! Single-slot, flow-controlled frame buffer backed by a memory-mapped file.
//!
//! A `FrameChannel` holds exactly one frame of a fixed shape plus a binary
//! `ready` flag:
//!
//! - `ready == false`: the producer may write, the consumer must not read
//! - `ready == true`: the consumer may read, the producer must not write
//!
//! The primitive never blocks and never queues. Callers check `may_write` /
//! `may_read` and spin with a short sleep in between (see
//! [`FrameProducer::publish`]).
//!
//! # Layout
//!
//! The backing file is a 64-byte `#[repr(C)]` header followed by the raw pixel
//! bytes (`rows * cols * channels`, row-major, no padding). The header only
//! exists so another process can attach to the file with [`FrameChannel::open`]
//! and agree on the shape; the pixel region itself is headerless.
//!
//! # Observers
//!
//! Writes bump a seqlock epoch before and after the copy. Recorders use
//! [`FrameChannel::snapshot`] to take a consistent copy of the slot without
//! touching the `ready` flag, so they never interfere with the flow-controlled
//! consumer.

use crate::error::FrameError;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Magic number for header validation
const MAGIC: u64 = 0xF4_A3_E0_00_C4_A1_00_01;

/// Header size in bytes (one cache line)
const HEADER_SIZE: usize = 64;

/// Snapshot attempts before giving up on a writer that keeps the epoch odd
const SNAPSHOT_RETRIES: usize = 10_000;

/// Pixel-grid shape of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameShape {
    pub rows: u32,
    pub cols: u32,
    pub channels: u32,
}

impl FrameShape {
    pub const fn gray(rows: u32, cols: u32) -> Self {
        Self {
            rows,
            cols,
            channels: 1,
        }
    }

    pub const fn rgb(rows: u32, cols: u32) -> Self {
        Self {
            rows,
            cols,
            channels: 3,
        }
    }

    /// Number of bytes in one frame.
    pub fn len(&self) -> usize {
        self.rows as usize * self.cols as usize * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Layout (64 bytes total):
/// - magic: u64
/// - rows, cols, channels: u32 each
/// - ready: AtomicU32
/// - epoch: AtomicU64
/// - produced: AtomicU64
/// - _padding: [u8; 24]
#[repr(C)]
struct ChannelHeader {
    magic: u64,
    rows: u32,
    cols: u32,
    channels: u32,
    /// 0 = empty (producer-writable), 1 = ready (consumer-readable)
    ready: AtomicU32,
    /// Seqlock counter; odd while a write is in progress
    epoch: AtomicU64,
    /// Frames marked produced since creation
    produced: AtomicU64,
    _padding: [u8; 24],
}

const _: () = assert!(
    std::mem::size_of::<ChannelHeader>() == HEADER_SIZE,
    "ChannelHeader size must equal HEADER_SIZE (64 bytes)"
);

/// Single-slot frame buffer shared by one producer and one consumer.
///
/// # Safety
/// Holds raw pointers into the mapping. They stay valid because `mmap` is
/// owned by the struct and never remapped.
pub struct FrameChannel {
    #[allow(dead_code)]
    mmap: MmapMut,

    /// SAFETY: start of mmap, valid while mmap lives
    header: *mut ChannelHeader,

    /// SAFETY: HEADER_SIZE bytes into mmap, `shape.len()` bytes long
    data_ptr: *mut u8,

    shape: FrameShape,
    path: PathBuf,

    /// Serializes writers inside this process
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for FrameChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameChannel")
            .field("path", &self.path)
            .field("shape", &self.shape)
            .field("ready", &self.may_read())
            .field("produced", &self.produced_count())
            .finish()
    }
}

// SAFETY: the flag and epoch are atomics; the pixel region is only written under
// write_lock while ready == 0 and only read by the consumer while ready == 1.
unsafe impl Send for FrameChannel {}

// SAFETY: see Send. Observers read through the seqlock and retry on a torn copy.
unsafe impl Sync for FrameChannel {}

impl FrameChannel {
    /// Create (or reset) a channel file at `path` with the given shape.
    ///
    /// The slot starts empty.
    pub fn create(path: &Path, shape: FrameShape) -> Result<Self, FrameError> {
        if shape.is_empty() {
            return Err(FrameError::InvalidHeader(format!(
                "frame shape {:?} has no pixels",
                shape
            )));
        }
        let total_size = HEADER_SIZE + shape.len();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size as u64)?;

        // SAFETY: the file was just sized to total_size
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        // SAFETY: mmap holds at least HEADER_SIZE bytes
        let header = mmap.as_mut_ptr() as *mut ChannelHeader;
        unsafe {
            (*header).magic = MAGIC;
            (*header).rows = shape.rows;
            (*header).cols = shape.cols;
            (*header).channels = shape.channels;
            (*header).ready = AtomicU32::new(0);
            (*header).epoch = AtomicU64::new(0);
            (*header).produced = AtomicU64::new(0);
            (*header)._padding.fill(0);
        }

        // SAFETY: offset HEADER_SIZE is inside a total_size mapping
        let data_ptr = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };

        tracing::debug!(path = %path.display(), ?shape, "Created frame channel");

        Ok(Self {
            mmap,
            header,
            data_ptr,
            shape,
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Attach to a channel created by [`FrameChannel::create`], possibly in another process.
    pub fn open(path: &Path) -> Result<Self, FrameError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < HEADER_SIZE {
            return Err(FrameError::InvalidHeader(format!(
                "file is {} bytes, smaller than the {} byte header",
                file_len, HEADER_SIZE
            )));
        }

        // SAFETY: the file is at least HEADER_SIZE bytes long
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let header = mmap.as_mut_ptr() as *mut ChannelHeader;

        // SAFETY: header lies inside the mapping
        let (magic, shape) = unsafe {
            (
                (*header).magic,
                FrameShape {
                    rows: (*header).rows,
                    cols: (*header).cols,
                    channels: (*header).channels,
                },
            )
        };

        if magic != MAGIC {
            return Err(FrameError::InvalidHeader(format!(
                "expected magic 0x{:016X}, got 0x{:016X}",
                MAGIC, magic
            )));
        }
        if file_len != HEADER_SIZE + shape.len() {
            return Err(FrameError::SizeMismatch {
                expected: HEADER_SIZE + shape.len(),
                actual: file_len,
            });
        }

        // SAFETY: mapping size validated above
        let data_ptr = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };

        Ok(Self {
            mmap,
            header,
            data_ptr,
            shape,
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn header(&self) -> &ChannelHeader {
        // SAFETY: header is valid for the lifetime of self
        unsafe { &*self.header }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the slot is empty and the producer may write.
    pub fn may_write(&self) -> bool {
        self.header().ready.load(Ordering::Acquire) == 0
    }

    /// True when the slot holds a frame the consumer has not read yet.
    pub fn may_read(&self) -> bool {
        self.header().ready.load(Ordering::Acquire) == 1
    }

    /// Copy `frame` into the slot. Does not mark it produced.
    pub fn write(&self, frame: &[u8]) -> Result<(), FrameError> {
        if frame.len() != self.shape.len() {
            return Err(FrameError::SizeMismatch {
                expected: self.shape.len(),
                actual: frame.len(),
            });
        }
        self.write_with(|slot| slot.copy_from_slice(frame))
    }

    /// Fill the slot in place. Does not mark it produced.
    pub fn write_with<F>(&self, fill: F) -> Result<(), FrameError>
    where
        F: FnOnce(&mut [u8]),
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| FrameError::LockPoisoned)?;

        if !self.may_write() {
            return Err(FrameError::SlotOccupied);
        }

        let header = self.header();
        header.epoch.fetch_add(1, Ordering::AcqRel);

        // SAFETY: the slot is empty so the consumer is not reading it, and
        // write_lock excludes other writers in this process.
        let slot = unsafe { std::slice::from_raw_parts_mut(self.data_ptr, self.shape.len()) };
        fill(slot);

        header.epoch.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Hand the slot to the consumer.
    pub fn mark_produced(&self) {
        let header = self.header();
        header.produced.fetch_add(1, Ordering::Relaxed);
        header.ready.store(1, Ordering::Release);
    }

    /// Hand the slot back to the producer.
    pub fn mark_consumed(&self) {
        self.header().ready.store(0, Ordering::Release);
    }

    /// Copy the frame out of the slot. Does not mark it consumed.
    pub fn read(&self) -> Result<Vec<u8>, FrameError> {
        self.with_frame(|frame| frame.to_vec())
    }

    /// Borrow the frame in the slot without copying.
    pub fn with_frame<R, F>(&self, f: F) -> Result<R, FrameError>
    where
        F: FnOnce(&[u8]) -> R,
    {
        if !self.may_read() {
            return Err(FrameError::SlotEmpty);
        }
        // SAFETY: ready == 1 so the producer will not write until mark_consumed
        let frame = unsafe { std::slice::from_raw_parts(self.data_ptr, self.shape.len()) };
        Ok(f(frame))
    }

    /// Consistent copy of the last written frame, regardless of the ready flag.
    ///
    /// Returns `Ok(false)` if a writer kept the slot busy for every retry.
    pub fn snapshot(&self, out: &mut [u8]) -> Result<bool, FrameError> {
        if out.len() != self.shape.len() {
            return Err(FrameError::SizeMismatch {
                expected: self.shape.len(),
                actual: out.len(),
            });
        }
        let header = self.header();
        for _ in 0..SNAPSHOT_RETRIES {
            let before = header.epoch.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: reading a possibly concurrently written region; the epoch
            // check below discards torn copies.
            unsafe {
                std::ptr::copy_nonoverlapping(self.data_ptr, out.as_mut_ptr(), out.len());
            }
            fence(Ordering::Acquire);
            let after = header.epoch.load(Ordering::Relaxed);
            if before == after {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Frames marked produced since the channel was created.
    pub fn produced_count(&self) -> u64 {
        self.header().produced.load(Ordering::Relaxed)
    }
}
