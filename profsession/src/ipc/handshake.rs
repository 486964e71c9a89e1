//! One-shot integer handshakes between session processes.
//!
//! A handshake is a pipe carrying exactly one native-endian `i32`. `1` means
//! ready (or proceed), `0` means abort. A writer that exits or drops its end
//! without writing is seen by the reader as "not ready".

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use crate::domain::ChannelError;

pub const READY: i32 = 1;
pub const ABORT: i32 = 0;

/// Create a close-on-exec handshake pipe.
///
/// # Errors
/// Returns an error if the kernel refuses to create the pipe
pub fn handshake_pipe() -> Result<(HandshakeSender, HandshakeReceiver), ChannelError> {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC).map_err(ChannelError::Create)?;
    Ok((HandshakeSender { pipe: File::from(tx) }, HandshakeReceiver { pipe: File::from(rx) }))
}

#[derive(Debug)]
pub struct HandshakeSender {
    pipe: File,
}

impl HandshakeSender {
    /// Write one value. Dropping the sender afterwards closes the pipe.
    ///
    /// # Errors
    /// Returns an error if the reader is gone or the write fails
    pub fn send(&mut self, value: i32) -> Result<(), ChannelError> {
        self.pipe.write_all(&value.to_ne_bytes())?;
        Ok(())
    }
}

impl AsRawFd for HandshakeSender {
    fn as_raw_fd(&self) -> RawFd {
        self.pipe.as_raw_fd()
    }
}

#[derive(Debug)]
pub struct HandshakeReceiver {
    pipe: File,
}

impl HandshakeReceiver {
    /// Block until a value arrives or every writer has closed the pipe.
    ///
    /// Returns `Ok(None)` if the pipe closed before a full value was written.
    ///
    /// # Errors
    /// Returns an error on a read failure other than EOF
    pub fn recv(&mut self) -> Result<Option<i32>, ChannelError> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.pipe.read(&mut buf[filled..]) {
                Ok(0) => return Ok(None),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(i32::from_ne_bytes(buf)))
    }
}

impl AsRawFd for HandshakeReceiver {
    fn as_raw_fd(&self) -> RawFd {
        self.pipe.as_raw_fd()
    }
}
