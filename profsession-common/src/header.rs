//! Session header written by the recorder before the first frame.

use std::io::{self, Read, Write};
use thiserror::Error;

/// Identifies a profsession sample stream
pub const STREAM_MAGIC: [u8; 8] = *b"PSSTREAM";

/// Bumped whenever the header or frame layout changes
pub const STREAM_VERSION: u32 = 1;

const FLAG_CALLGRAPH: u32 = 1;

/// Longest event name accepted in the event table
const MAX_EVENT_NAME: usize = 256;

#[derive(Error, Debug)]
pub enum HeaderError {
    /// The writer closed the stream before sending anything. The recorder
    /// only does this after it has already reported why to the user.
    #[error("sample stream ended before the header was written")]
    Empty,

    #[error("sample stream has bad magic {0:02x?}")]
    BadMagic([u8; 8]),

    #[error("unsupported sample stream version {0}")]
    UnsupportedVersion(u32),

    #[error("sample stream header is truncated")]
    Truncated,

    #[error("invalid event table entry: {0}")]
    InvalidEvent(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HeaderError {
    /// True when the failure was already reported by the recorder side
    #[must_use]
    pub fn is_handled(&self) -> bool {
        matches!(self, HeaderError::Empty)
    }
}

/// One counter as described to the converter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDesc {
    pub name: String,
    pub count: u64,
    pub unit_mask: u32,
    pub code: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub sample_type: u64,
    pub callgraph: bool,
    pub kernel_start: u64,
    pub kernel_end: u64,
    pub events: Vec<EventDesc>,
}

impl StreamHeader {
    /// Serialize the header.
    ///
    /// # Errors
    /// Returns an error if the writer fails or an event name is too long
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&STREAM_MAGIC)?;
        w.write_all(&STREAM_VERSION.to_ne_bytes())?;
        let flags = if self.callgraph { FLAG_CALLGRAPH } else { 0 };
        w.write_all(&flags.to_ne_bytes())?;
        w.write_all(&self.sample_type.to_ne_bytes())?;
        w.write_all(&self.kernel_start.to_ne_bytes())?;
        w.write_all(&self.kernel_end.to_ne_bytes())?;
        let nr_events = u32::try_from(self.events.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many events"))?;
        w.write_all(&nr_events.to_ne_bytes())?;
        for event in &self.events {
            let name = event.name.as_bytes();
            if name.len() > MAX_EVENT_NAME {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("event name too long: {}", event.name),
                ));
            }
            #[allow(clippy::cast_possible_truncation)]
            w.write_all(&(name.len() as u16).to_ne_bytes())?;
            w.write_all(name)?;
            w.write_all(&event.count.to_ne_bytes())?;
            w.write_all(&event.unit_mask.to_ne_bytes())?;
            w.write_all(&event.code.to_ne_bytes())?;
        }
        Ok(())
    }

    /// Read and validate the header at the start of a stream.
    ///
    /// # Errors
    /// [`HeaderError::Empty`] if the stream ends before its first byte,
    /// any other variant for a malformed or truncated header.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, HeaderError> {
        let mut magic = [0u8; 8];
        let got = read_fully(r, &mut magic)?;
        if got == 0 {
            return Err(HeaderError::Empty);
        }
        if got < magic.len() {
            return Err(HeaderError::Truncated);
        }
        if magic != STREAM_MAGIC {
            return Err(HeaderError::BadMagic(magic));
        }

        let version = read_u32(r)?;
        if version != STREAM_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        let flags = read_u32(r)?;
        let sample_type = read_u64(r)?;
        let kernel_start = read_u64(r)?;
        let kernel_end = read_u64(r)?;
        let nr_events = read_u32(r)?;

        let mut events = Vec::with_capacity(nr_events.min(64) as usize);
        for _ in 0..nr_events {
            let name_len = usize::from(read_u16(r)?);
            if name_len == 0 || name_len > MAX_EVENT_NAME {
                return Err(HeaderError::InvalidEvent(format!("name length {name_len}")));
            }
            let mut name = vec![0u8; name_len];
            if read_fully(r, &mut name)? < name_len {
                return Err(HeaderError::Truncated);
            }
            let name = String::from_utf8(name)
                .map_err(|_| HeaderError::InvalidEvent("name is not UTF-8".into()))?;
            events.push(EventDesc {
                name,
                count: read_u64(r)?,
                unit_mask: read_u32(r)?,
                code: read_u64(r)?,
            });
        }

        Ok(StreamHeader {
            sample_type,
            callgraph: flags & FLAG_CALLGRAPH != 0,
            kernel_start,
            kernel_end,
            events,
        })
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
pub(crate) fn read_fully<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_exact_or_truncated<R: Read, const N: usize>(r: &mut R) -> Result<[u8; N], HeaderError> {
    let mut buf = [0u8; N];
    if read_fully(r, &mut buf)? < N {
        return Err(HeaderError::Truncated);
    }
    Ok(buf)
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16, HeaderError> {
    read_exact_or_truncated::<R, 2>(r).map(u16::from_ne_bytes)
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, HeaderError> {
    read_exact_or_truncated::<R, 4>(r).map(u32::from_ne_bytes)
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, HeaderError> {
    read_exact_or_truncated::<R, 8>(r).map(u64::from_ne_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_header() -> StreamHeader {
        StreamHeader {
            sample_type: crate::SUPPORTED_SAMPLE_TYPE,
            callgraph: true,
            kernel_start: 0xffff_ffff_8100_0000,
            kernel_end: 0xffff_ffff_8200_0000,
            events: vec![EventDesc {
                name: "CPU_CLK_UNHALTED".into(),
                count: 100_000,
                unit_mask: 0,
                code: 0x3c,
            }],
        }
    }

    #[test]
    fn test_header_survives_the_pipe() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();

        let parsed = StreamHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_empty_stream_is_handled() {
        let err = StreamHeader::read_from(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, HeaderError::Empty));
        assert!(err.is_handled());
    }

    #[test]
    fn test_bad_magic_is_not_handled() {
        let err = StreamHeader::read_from(&mut Cursor::new(b"NOTASTREAM-AT-ALL".to_vec()))
            .unwrap_err();
        assert!(matches!(err, HeaderError::BadMagic(_)));
        assert!(!err.is_handled());
    }

    #[test]
    fn test_truncated_header() {
        let mut buf = Vec::new();
        sample_header().write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);

        let err = StreamHeader::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, HeaderError::Truncated));
    }

    #[test]
    fn test_version_mismatch() {
        let mut buf = Vec::new();
        sample_header().write_to(&mut buf).unwrap();
        buf[8..12].copy_from_slice(&99u32.to_ne_bytes());

        let err = StreamHeader::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, HeaderError::UnsupportedVersion(99)));
    }
}
