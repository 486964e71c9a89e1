//! # Shared Stream Format (Recorder ↔ Converter)
//!
//! Defines the byte stream that flows through the sample-data pipe from the
//! recorder process to the converter process. Both sides are built from this
//! crate so the layout can never drift between them.
//!
//! ## Stream Layout
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ StreamHeader                 │  magic, version, sample_type, kernel range,
//! │                              │  event table
//! ├──────────────────────────────┤
//! │ [u32 event index][record]    │  one frame per kernel record
//! │ [u32 event index][record]    │
//! │ ...                          │
//! └──────────────────────────────┘
//!         EOF = recorder closed its write end
//! ```
//!
//! Records are copied verbatim from the kernel ring buffer, so their layout is
//! the `perf_event_open(2)` record layout for the `sample_type` carried in the
//! header. There is no trailer: end-of-stream is signalled only by the write
//! end of the pipe being closed.
//!
//! ## Key Types
//!
//! - [`StreamHeader`] - Session metadata written once at the start of the stream
//! - [`FrameReader`] / [`write_frame`] - Record framing
//! - [`Record`] - Decoded view of the record kinds the converter consumes

mod frame;
mod header;
mod record;

pub use frame::{write_frame, Frame, FrameError, FrameReader};
pub use header::{EventDesc, HeaderError, StreamHeader, STREAM_MAGIC, STREAM_VERSION};
pub use record::{
    encode_comm, encode_mmap, encode_sample, CommRecord, MmapRecord, Record, RecordHeader,
    SampleRecord, TaskRecord,
};

// ============================================================================
// perf_event record types (include/uapi/linux/perf_event.h)
// ============================================================================

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// Mask for the cpumode bits in `RecordHeader::misc`
pub const PERF_RECORD_MISC_CPUMODE_MASK: u16 = 0x7;
pub const PERF_RECORD_MISC_KERNEL: u16 = 1;
pub const PERF_RECORD_MISC_USER: u16 = 2;

// ============================================================================
// perf_event sample_type bits
// ============================================================================

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;

/// Sample fields the converter knows how to decode, in kernel emission order.
pub const SUPPORTED_SAMPLE_TYPE: u64 = PERF_SAMPLE_IP
    | PERF_SAMPLE_TID
    | PERF_SAMPLE_TIME
    | PERF_SAMPLE_CPU
    | PERF_SAMPLE_PERIOD
    | PERF_SAMPLE_CALLCHAIN;

/// Callchain entries at or above this value are context markers
/// (`PERF_CONTEXT_KERNEL`, `PERF_CONTEXT_USER`, ...), not addresses.
pub const PERF_CONTEXT_MAX: u64 = u64::MAX - 4094;

/// Size of `struct perf_event_header`
pub const RECORD_HEADER_SIZE: usize = 8;
