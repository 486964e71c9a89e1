//! The sample-data stream from the recorder to the converter.
//!
//! An ordinary pipe. The reader sees EOF only once every write end is
//! closed, which is why each process that is not the recorder must drop
//! its copy of the writer right after fork.

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use crate::domain::ChannelError;

const WRITE_BUFFER: usize = 64 * 1024;

/// Create the stream pipe.
///
/// # Errors
/// Returns an error if the kernel refuses to create the pipe
pub fn sample_stream() -> Result<(StreamWriter, StreamReader), ChannelError> {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC).map_err(ChannelError::Create)?;
    let writer = StreamWriter {
        inner: BufWriter::with_capacity(WRITE_BUFFER, File::from(tx)),
        written: 0,
    };
    Ok((writer, StreamReader { inner: File::from(rx) }))
}

#[derive(Debug)]
pub struct StreamWriter {
    inner: BufWriter<File>,
    written: u64,
}

impl StreamWriter {
    /// Flush and close the write end, returning the total byte count.
    ///
    /// # Errors
    /// Returns an error if buffered data cannot be flushed
    pub fn finish(mut self) -> io::Result<u64> {
        self.inner.flush()?;
        Ok(self.written)
    }
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl AsRawFd for StreamWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}

#[derive(Debug)]
pub struct StreamReader {
    inner: File,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl AsRawFd for StreamReader {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
