//! Describing processes that were running before the counters were attached.
//!
//! The kernel only reports COMM and MMAP events for things that happen
//! after a counter is opened. When attaching to an existing process (or to
//! the whole system), the recorder reads `/proc` and emits equivalent
//! records up front so the converter can attribute samples to images.

use log::debug;
use profsession_common::{encode_comm, encode_mmap, CommRecord, MmapRecord};
use std::fs;

/// An executable file mapping from `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecMapping {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub path: String,
}

/// Parse one line of `/proc/<pid>/maps`.
///
/// Format: "start-end perms offset dev inode pathname". Only executable
/// mappings backed by a file path are returned.
#[must_use]
pub fn parse_maps_line(line: &str) -> Option<ExecMapping> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    // Pathnames may contain spaces
    let path = parts.collect::<Vec<_>>().join(" ");

    if !perms.contains('x') || !path.starts_with('/') {
        return None;
    }

    Some(ExecMapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
#[must_use]
pub fn extract_comm(stat_line: &str) -> Option<&str> {
    let open = stat_line.find('(')?;
    let close = stat_line.rfind(')')?;
    (open < close).then(|| &stat_line[open + 1..close])
}

/// COMM and MMAP records describing `pid` as it is right now.
///
/// A process that exits while being read yields whatever was read so far.
#[must_use]
pub fn synthesize_process(pid: u32) -> Vec<Vec<u8>> {
    let mut records = Vec::new();

    if let Some(comm) = fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .as_deref()
        .and_then(extract_comm)
    {
        records.push(encode_comm(&CommRecord { pid, tid: pid, comm: comm.to_string() }));
    }

    let Ok(maps) = fs::read_to_string(format!("/proc/{pid}/maps")) else {
        debug!("Cannot read maps for pid {pid}; it may have exited");
        return records;
    };
    for mapping in maps.lines().filter_map(parse_maps_line) {
        records.push(encode_mmap(&MmapRecord {
            pid,
            tid: pid,
            addr: mapping.start,
            len: mapping.end - mapping.start,
            pgoff: mapping.offset,
            filename: mapping.path,
        }));
    }
    records
}

/// Records for every process currently visible in `/proc`.
#[must_use]
pub fn synthesize_system() -> Vec<Vec<u8>> {
    let Ok(proc_dir) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for entry in proc_dir.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        records.extend(synthesize_process(pid));
    }
    records
}
