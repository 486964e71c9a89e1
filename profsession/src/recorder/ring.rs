//! Reading records out of a perf ring buffer's data area.

use log::warn;
use profsession_common::{RecordHeader, RECORD_HEADER_SIZE};
use std::io;

/// Copy every complete record between `tail` and `head` to `sink`.
///
/// `data` is the ring's data area; positions are free-running byte counts
/// that wrap modulo its length. Returns the number of records and the new
/// tail position.
pub(crate) fn drain_records(
    data: &[u8],
    tail: u64,
    head: u64,
    scratch: &mut Vec<u8>,
    sink: &mut dyn FnMut(&[u8]) -> io::Result<()>,
) -> io::Result<(u64, u64)> {
    let header_size = RECORD_HEADER_SIZE as u64;
    let mut pos = tail;
    let mut count = 0;

    while head.saturating_sub(pos) >= header_size {
        copy_wrapped(data, pos, RECORD_HEADER_SIZE, scratch);
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        raw.copy_from_slice(&scratch[..RECORD_HEADER_SIZE]);
        let size = u64::from(RecordHeader::from_bytes(raw).size);

        if size < header_size || pos + size > head {
            warn!("Corrupt record in ring buffer, discarding {} bytes", head - pos);
            return Ok((count, head));
        }

        // Bounded by the u16 record size
        #[allow(clippy::cast_possible_truncation)]
        copy_wrapped(data, pos, size as usize, scratch);
        sink(scratch)?;
        pos += size;
        count += 1;
    }

    Ok((count, pos))
}

fn copy_wrapped(data: &[u8], pos: u64, len: usize, out: &mut Vec<u8>) {
    out.clear();
    #[allow(clippy::cast_possible_truncation)]
    let start = (pos % data.len() as u64) as usize;
    let first = len.min(data.len() - start);
    out.extend_from_slice(&data[start..start + first]);
    out.extend_from_slice(&data[..len - first]);
}
