//! Record framing on the sample-data pipe.
//!
//! Each frame is the index of the event (counter) that produced the record,
//! followed by the record exactly as the kernel wrote it. The record carries
//! its own length in `RecordHeader::size`.

use std::io::{self, Read, Write};
use thiserror::Error;

use crate::header::read_fully;
use crate::{RecordHeader, RECORD_HEADER_SIZE};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("stream ended inside a frame after {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },

    #[error("record size {0} is smaller than its header")]
    BadSize(u16),

    #[error("malformed {kind} record: {reason}")]
    Malformed { kind: &'static str, reason: &'static str },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A single framed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: u32,
    pub header: RecordHeader,
    /// Record bytes following the header
    pub body: Vec<u8>,
}

/// Write one frame. `record` must start with a `perf_event_header`.
///
/// # Errors
/// Returns an error if the writer fails
pub fn write_frame<W: Write>(w: &mut W, event: u32, record: &[u8]) -> io::Result<()> {
    w.write_all(&event.to_ne_bytes())?;
    w.write_all(record)
}

/// Pulls frames off a byte stream until the writer closes it
pub struct FrameReader<R> {
    inner: R,
    frames: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, frames: 0 }
    }

    /// Number of frames successfully read so far
    #[must_use]
    pub fn frames_read(&self) -> u64 {
        self.frames
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream, i.e. EOF exactly at a
    /// frame boundary.
    ///
    /// # Errors
    /// Returns an error if the stream ends mid-frame or a record header is invalid
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut index = [0u8; 4];
        match read_fully(&mut self.inner, &mut index)? {
            0 => return Ok(None),
            4 => {}
            got => return Err(FrameError::Truncated { expected: 4, got }),
        }

        let mut raw = [0u8; RECORD_HEADER_SIZE];
        let got = read_fully(&mut self.inner, &mut raw)?;
        if got < RECORD_HEADER_SIZE {
            return Err(FrameError::Truncated { expected: RECORD_HEADER_SIZE, got });
        }
        let header = RecordHeader::from_bytes(raw);
        let size = usize::from(header.size);
        if size < RECORD_HEADER_SIZE {
            return Err(FrameError::BadSize(header.size));
        }

        let mut body = vec![0u8; size - RECORD_HEADER_SIZE];
        let got = read_fully(&mut self.inner, &mut body)?;
        if got < body.len() {
            return Err(FrameError::Truncated { expected: body.len(), got });
        }

        self.frames += 1;
        Ok(Some(Frame { event: u32::from_ne_bytes(index), header, body }))
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}
