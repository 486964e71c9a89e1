//! Decoded views of the kernel records the converter consumes.
//!
//! Only the record kinds needed to attribute samples to images are decoded;
//! everything else is surfaced as [`Record::Unknown`] and skipped.

use crate::frame::FrameError;
use crate::{
    PERF_CONTEXT_MAX, PERF_RECORD_COMM, PERF_RECORD_EXIT, PERF_RECORD_FORK, PERF_RECORD_LOST,
    PERF_RECORD_MISC_CPUMODE_MASK, PERF_RECORD_MISC_KERNEL, PERF_RECORD_MISC_USER,
    PERF_RECORD_MMAP, PERF_RECORD_SAMPLE, PERF_SAMPLE_CALLCHAIN, PERF_SAMPLE_CPU,
    PERF_SAMPLE_IP, PERF_SAMPLE_PERIOD, PERF_SAMPLE_TID, PERF_SAMPLE_TIME, RECORD_HEADER_SIZE,
};

/// `struct perf_event_header`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

impl RecordHeader {
    #[must_use]
    pub fn from_bytes(raw: [u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            kind: u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]),
            misc: u16::from_ne_bytes([raw[4], raw[5]]),
            size: u16::from_ne_bytes([raw[6], raw[7]]),
        }
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; RECORD_HEADER_SIZE] {
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.kind.to_ne_bytes());
        raw[4..6].copy_from_slice(&self.misc.to_ne_bytes());
        raw[6..8].copy_from_slice(&self.size.to_ne_bytes());
        raw
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleRecord {
    pub misc: u16,
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub cpu: u32,
    pub period: u64,
    /// Return addresses, innermost first, with context markers removed
    pub callchain: Vec<u64>,
}

impl SampleRecord {
    /// Whether the kernel flagged this sample as taken in kernel mode
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapRecord {
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommRecord {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
}

/// Layout shared by FORK and EXIT records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRecord {
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Sample(SampleRecord),
    Mmap(MmapRecord),
    Comm(CommRecord),
    Fork(TaskRecord),
    Exit(TaskRecord),
    Lost { id: u64, lost: u64 },
    Unknown(u32),
}

impl Record {
    /// Decode a record body according to the session's `sample_type`.
    ///
    /// # Errors
    /// Returns [`FrameError::Malformed`] if the body is shorter than its layout requires
    pub fn decode(header: &RecordHeader, body: &[u8], sample_type: u64) -> Result<Self, FrameError> {
        match header.kind {
            PERF_RECORD_SAMPLE => decode_sample(header.misc, body, sample_type).map(Record::Sample),
            PERF_RECORD_MMAP => {
                let mut c = Cursor::new(body, "mmap");
                Ok(Record::Mmap(MmapRecord {
                    pid: c.u32()?,
                    tid: c.u32()?,
                    addr: c.u64()?,
                    len: c.u64()?,
                    pgoff: c.u64()?,
                    filename: c.c_string()?,
                }))
            }
            PERF_RECORD_COMM => {
                let mut c = Cursor::new(body, "comm");
                Ok(Record::Comm(CommRecord { pid: c.u32()?, tid: c.u32()?, comm: c.c_string()? }))
            }
            PERF_RECORD_FORK | PERF_RECORD_EXIT => {
                let mut c = Cursor::new(body, "task");
                let task = TaskRecord {
                    pid: c.u32()?,
                    ppid: c.u32()?,
                    tid: c.u32()?,
                    ptid: c.u32()?,
                    time: c.u64()?,
                };
                Ok(if header.kind == PERF_RECORD_FORK { Record::Fork(task) } else { Record::Exit(task) })
            }
            PERF_RECORD_LOST => {
                let mut c = Cursor::new(body, "lost");
                Ok(Record::Lost { id: c.u64()?, lost: c.u64()? })
            }
            other => Ok(Record::Unknown(other)),
        }
    }
}

fn decode_sample(misc: u16, body: &[u8], sample_type: u64) -> Result<SampleRecord, FrameError> {
    let mut c = Cursor::new(body, "sample");
    let mut sample = SampleRecord { misc, ..SampleRecord::default() };

    if sample_type & PERF_SAMPLE_IP != 0 {
        sample.ip = c.u64()?;
    }
    if sample_type & PERF_SAMPLE_TID != 0 {
        sample.pid = c.u32()?;
        sample.tid = c.u32()?;
    }
    if sample_type & PERF_SAMPLE_TIME != 0 {
        sample.time = c.u64()?;
    }
    if sample_type & PERF_SAMPLE_CPU != 0 {
        sample.cpu = c.u32()?;
        let _reserved = c.u32()?;
    }
    if sample_type & PERF_SAMPLE_PERIOD != 0 {
        sample.period = c.u64()?;
    }
    if sample_type & PERF_SAMPLE_CALLCHAIN != 0 {
        let nr = c.u64()?;
        if nr > (body.len() / 8) as u64 {
            return Err(FrameError::Malformed { kind: "sample", reason: "callchain too long" });
        }
        for _ in 0..nr {
            let addr = c.u64()?;
            if addr < PERF_CONTEXT_MAX {
                sample.callchain.push(addr);
            }
        }
    }
    Ok(sample)
}

// ============================================================================
// Encoding (recorder-synthesized records and test fixtures)
// ============================================================================

/// Encode a SAMPLE record for the given `sample_type`.
#[must_use]
pub fn encode_sample(sample_type: u64, sample: &SampleRecord) -> Vec<u8> {
    let mut body = Vec::new();
    if sample_type & PERF_SAMPLE_IP != 0 {
        body.extend_from_slice(&sample.ip.to_ne_bytes());
    }
    if sample_type & PERF_SAMPLE_TID != 0 {
        body.extend_from_slice(&sample.pid.to_ne_bytes());
        body.extend_from_slice(&sample.tid.to_ne_bytes());
    }
    if sample_type & PERF_SAMPLE_TIME != 0 {
        body.extend_from_slice(&sample.time.to_ne_bytes());
    }
    if sample_type & PERF_SAMPLE_CPU != 0 {
        body.extend_from_slice(&sample.cpu.to_ne_bytes());
        body.extend_from_slice(&0u32.to_ne_bytes());
    }
    if sample_type & PERF_SAMPLE_PERIOD != 0 {
        body.extend_from_slice(&sample.period.to_ne_bytes());
    }
    if sample_type & PERF_SAMPLE_CALLCHAIN != 0 {
        body.extend_from_slice(&(sample.callchain.len() as u64).to_ne_bytes());
        for addr in &sample.callchain {
            body.extend_from_slice(&addr.to_ne_bytes());
        }
    }
    with_header(PERF_RECORD_SAMPLE, sample.misc, body)
}

/// Encode an MMAP record, as the recorder does for mappings that predate the attach.
#[must_use]
pub fn encode_mmap(mmap: &MmapRecord) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&mmap.pid.to_ne_bytes());
    body.extend_from_slice(&mmap.tid.to_ne_bytes());
    body.extend_from_slice(&mmap.addr.to_ne_bytes());
    body.extend_from_slice(&mmap.len.to_ne_bytes());
    body.extend_from_slice(&mmap.pgoff.to_ne_bytes());
    push_padded_str(&mut body, &mmap.filename);
    with_header(PERF_RECORD_MMAP, PERF_RECORD_MISC_USER, body)
}

/// Encode a COMM record.
#[must_use]
pub fn encode_comm(comm: &CommRecord) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&comm.pid.to_ne_bytes());
    body.extend_from_slice(&comm.tid.to_ne_bytes());
    push_padded_str(&mut body, &comm.comm);
    with_header(PERF_RECORD_COMM, 0, body)
}

/// NUL-terminate and pad to a multiple of 8 bytes, like the kernel does.
fn push_padded_str(body: &mut Vec<u8>, s: &str) {
    body.extend_from_slice(s.as_bytes());
    body.push(0);
    while body.len() % 8 != 0 {
        body.push(0);
    }
}

fn with_header(kind: u32, misc: u16, body: Vec<u8>) -> Vec<u8> {
    let size = u16::try_from(RECORD_HEADER_SIZE + body.len()).unwrap_or(u16::MAX);
    let mut record = RecordHeader { kind, misc, size }.to_bytes().to_vec();
    record.extend_from_slice(&body[..usize::from(size) - RECORD_HEADER_SIZE]);
    record
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    kind: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], kind: &'static str) -> Self {
        Self { buf, pos: 0, kind }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(FrameError::Malformed { kind: self.kind, reason: "record too short" })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        self.take::<4>().map(u32::from_ne_bytes)
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        self.take::<8>().map(u64::from_ne_bytes)
    }

    fn c_string(&mut self) -> Result<String, FrameError> {
        let rest = &self.buf[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(FrameError::Malformed { kind: self.kind, reason: "unterminated string" })?;
        self.pos = self.buf.len();
        Ok(String::from_utf8_lossy(&rest[..len]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SUPPORTED_SAMPLE_TYPE;

    fn split(record: &[u8]) -> (RecordHeader, &[u8]) {
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        raw.copy_from_slice(&record[..RECORD_HEADER_SIZE]);
        (RecordHeader::from_bytes(raw), &record[RECORD_HEADER_SIZE..])
    }

    #[test]
    fn test_sample_callchain_drops_context_markers() {
        let sample = SampleRecord {
            misc: PERF_RECORD_MISC_USER,
            ip: 0x40_1000,
            pid: 42,
            tid: 43,
            time: 7,
            cpu: 3,
            period: 100_000,
            callchain: vec![0x40_1000, 0x40_2000],
        };
        let mut record = encode_sample(SUPPORTED_SAMPLE_TYPE, &sample);
        // Splice a PERF_CONTEXT_USER marker in front of the chain.
        let nr_offset = RECORD_HEADER_SIZE + 8 + 8 + 8 + 8 + 8;
        record[nr_offset..nr_offset + 8].copy_from_slice(&3u64.to_ne_bytes());
        record.splice(nr_offset + 8..nr_offset + 8, (u64::MAX - 511).to_ne_bytes());
        let size = u16::try_from(record.len()).unwrap();
        record[6..8].copy_from_slice(&size.to_ne_bytes());

        let (header, body) = split(&record);
        let Record::Sample(decoded) = Record::decode(&header, body, SUPPORTED_SAMPLE_TYPE).unwrap()
        else {
            panic!("expected a sample");
        };
        assert_eq!(decoded.callchain, vec![0x40_1000, 0x40_2000]);
        assert_eq!(decoded.pid, 42);
        assert!(!decoded.is_kernel());
    }

    #[test]
    fn test_mmap_filename_padding() {
        let mmap = MmapRecord {
            pid: 1,
            tid: 1,
            addr: 0x1000,
            len: 0x2000,
            pgoff: 0,
            filename: "/usr/lib/libc.so.6".into(),
        };
        let record = encode_mmap(&mmap);
        assert_eq!(record.len() % 8, 0);

        let (header, body) = split(&record);
        assert_eq!(Record::decode(&header, body, 0).unwrap(), Record::Mmap(mmap));
    }

    #[test]
    fn test_short_sample_is_malformed() {
        let header = RecordHeader { kind: PERF_RECORD_SAMPLE, misc: 0, size: 12 };
        let err = Record::decode(&header, &[0u8; 4], SUPPORTED_SAMPLE_TYPE).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { kind: "sample", .. }));
    }

    #[test]
    fn test_unknown_records_are_skipped() {
        let header = RecordHeader { kind: 14, misc: 0, size: 8 };
        assert_eq!(Record::decode(&header, &[], 0).unwrap(), Record::Unknown(14));
    }
}
