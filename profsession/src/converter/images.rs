//! Attributing sample addresses to the binary images they fall in.

use profsession_common::MmapRecord;
use std::collections::{BTreeMap, HashMap};

use crate::domain::KernelRange;

/// Where a sample landed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Image {
    Kernel,
    /// A file-backed mapping, by absolute path
    File(String),
    /// No known mapping in the given process
    Anon(u32),
}

#[derive(Debug, Clone)]
struct Mapping {
    end: u64,
    pgoff: u64,
    path: String,
}

/// Per-process address space layout rebuilt from MMAP and FORK records
#[derive(Debug, Default)]
pub struct ImageTable {
    kernel: KernelRange,
    by_pid: HashMap<u32, BTreeMap<u64, Mapping>>,
    comms: HashMap<u32, String>,
}

impl ImageTable {
    #[must_use]
    pub fn new(kernel: KernelRange) -> Self {
        Self { kernel, ..Self::default() }
    }

    pub fn add_mapping(&mut self, mmap: &MmapRecord) {
        // Anonymous memory is reported as "//anon"
        if !mmap.filename.starts_with('/') || mmap.filename.starts_with("//") || mmap.len == 0 {
            return;
        }
        let start = mmap.addr;
        let end = start.saturating_add(mmap.len);
        let table = self.by_pid.entry(mmap.pid).or_default();
        // A new mapping replaces whatever it overlaps
        let stale: Vec<u64> = table
            .range(..end)
            .filter(|(&s, m)| m.end > start && s < end)
            .map(|(&s, _)| s)
            .collect();
        for s in stale {
            table.remove(&s);
        }
        table.insert(start, Mapping { end, pgoff: mmap.pgoff, path: mmap.filename.clone() });
    }

    /// A new process starts with a copy of its parent's mappings.
    pub fn fork(&mut self, parent: u32, child: u32) {
        if parent == child {
            return;
        }
        if let Some(table) = self.by_pid.get(&parent).cloned() {
            self.by_pid.insert(child, table);
        }
        if let Some(comm) = self.comms.get(&parent).cloned() {
            self.comms.entry(child).or_insert(comm);
        }
    }

    pub fn set_comm(&mut self, pid: u32, comm: &str) {
        self.comms.insert(pid, comm.to_string());
    }

    #[must_use]
    pub fn comm(&self, pid: u32) -> Option<&str> {
        self.comms.get(&pid).map(String::as_str)
    }

    /// The image `ip` belongs to and the offset within it. Kernel and
    /// anonymous addresses are kept as-is.
    #[must_use]
    pub fn resolve(&self, pid: u32, ip: u64, kernel_mode: bool) -> (Image, u64) {
        if kernel_mode || self.kernel.contains(ip) {
            return (Image::Kernel, ip);
        }
        let hit = self
            .by_pid
            .get(&pid)
            .and_then(|table| table.range(..=ip).next_back())
            .filter(|(_, m)| ip < m.end);
        // pgoff comes straight from the stream and may be garbage
        match hit.and_then(|(&start, m)| (ip - start).checked_add(m.pgoff).map(|offset| (m, offset))) {
            Some((m, offset)) => (Image::File(m.path.clone()), offset),
            None => (Image::Anon(pid), ip),
        }
    }
}
