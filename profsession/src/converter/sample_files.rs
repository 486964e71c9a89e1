//! Accumulating sample counts and writing them as per-image sample files.
//!
//! Layout under `<samples>/current/`:
//!
//! ```text
//! {kern}/<kernel image>/<event>.<count>.<um>.<tgid>.<tid>.<cpu>
//! {root}/<absolute image path>/<event>.<count>.<um>.<tgid>.<tid>.<cpu>
//! {anon}/<pid>/<event>.<count>.<um>.<tgid>.<tid>.<cpu>
//! ```
//!
//! `tgid`, `tid` and `cpu` are `all` unless samples are being separated by
//! thread or CPU. Each file holds one `0x<offset> <count>` line per sampled
//! offset. Callgraph arcs go to a sibling `.arcs` file as
//! `0x<caller offset> 0x<callee offset> <count>`.

use log::warn;
use profsession_common::EventDesc;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use super::images::Image;
use crate::domain::ConvertError;

const KERNEL_DIR: &str = "{kern}";
const ROOT_DIR: &str = "{root}";
const ANON_DIR: &str = "{anon}";
const ARCS_SUFFIX: &str = ".arcs";

/// Which sample attributes get their own files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Separation {
    pub thread: bool,
    pub cpu: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SampleKey {
    pub image: Image,
    pub event: u32,
    pub tgid: Option<u32>,
    pub tid: Option<u32>,
    pub cpu: Option<u32>,
}

impl SampleKey {
    #[must_use]
    pub fn new(image: Image, event: u32, pid: u32, tid: u32, cpu: u32, separation: Separation) -> Self {
        Self {
            image,
            event,
            tgid: separation.thread.then_some(pid),
            tid: separation.thread.then_some(tid),
            cpu: separation.cpu.then_some(cpu),
        }
    }

    /// Path of the sample file relative to `current/`
    #[must_use]
    pub fn relative_path(&self, kernel_image: &str, event: &EventDesc) -> PathBuf {
        let mut path = match &self.image {
            Image::Kernel => Path::new(KERNEL_DIR).join(kernel_image),
            Image::File(file) => Path::new(ROOT_DIR).join(file.trim_start_matches('/')),
            Image::Anon(pid) => Path::new(ANON_DIR).join(pid.to_string()),
        };
        let part = |v: Option<u32>| v.map_or_else(|| "all".to_string(), |v| v.to_string());
        path.push(format!(
            "{}.{}.{}.{}.{}.{}",
            event.name,
            event.count,
            event.unit_mask,
            part(self.tgid),
            part(self.tid),
            part(self.cpu)
        ));
        path
    }
}

/// A line key in a sample or arcs file
trait LineKey: Ord + Copy {
    fn parse(fields: &[&str]) -> Option<Self>;
    fn format(&self, out: &mut String);
}

fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s.strip_prefix("0x")?, 16).ok()
}

impl LineKey for u64 {
    fn parse(fields: &[&str]) -> Option<Self> {
        match fields {
            [offset] => parse_hex(offset),
            _ => None,
        }
    }

    fn format(&self, out: &mut String) {
        let _ = write!(out, "{self:#x}");
    }
}

impl LineKey for (u64, u64) {
    fn parse(fields: &[&str]) -> Option<Self> {
        match fields {
            [from, to] => Some((parse_hex(from)?, parse_hex(to)?)),
            _ => None,
        }
    }

    fn format(&self, out: &mut String) {
        let _ = write!(out, "{:#x} {:#x}", self.0, self.1);
    }
}

#[derive(Debug, Default)]
pub struct SampleSet {
    counts: BTreeMap<SampleKey, BTreeMap<u64, u64>>,
    arcs: BTreeMap<SampleKey, BTreeMap<(u64, u64), u64>>,
    total: u64,
}

impl SampleSet {
    pub fn add(&mut self, key: SampleKey, offset: u64) {
        *self.counts.entry(key).or_default().entry(offset).or_default() += 1;
        self.total += 1;
    }

    pub fn add_arc(&mut self, key: SampleKey, from: u64, to: u64) {
        *self.arcs.entry(key).or_default().entry((from, to)).or_default() += 1;
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.arcs.is_empty()
    }

    /// Write every accumulated file under `current`, merging with files
    /// already present. Returns the number of files written.
    ///
    /// # Errors
    /// Returns an error naming the first file that could not be written
    pub fn write_to(&self, current: &Path, kernel_image: &str, events: &[EventDesc]) -> Result<usize, ConvertError> {
        let mut written = 0;
        for (key, counts) in &self.counts {
            let Some(event) = events.get(key.event as usize) else {
                return Err(ConvertError::UnknownEvent(key.event));
            };
            let path = current.join(key.relative_path(kernel_image, event));
            merge_into_file(&path, counts).map_err(|source| ConvertError::Write { path, source })?;
            written += 1;
        }
        for (key, arcs) in &self.arcs {
            let Some(event) = events.get(key.event as usize) else {
                return Err(ConvertError::UnknownEvent(key.event));
            };
            let mut path = current.join(key.relative_path(kernel_image, event)).into_os_string();
            path.push(ARCS_SUFFIX);
            let path = PathBuf::from(path);
            merge_into_file(&path, arcs).map_err(|source| ConvertError::Write { path, source })?;
            written += 1;
        }
        Ok(written)
    }
}

/// Add `counts` to whatever `path` already holds and replace it atomically.
fn merge_into_file<K: LineKey>(path: &Path, counts: &BTreeMap<K, u64>) -> io::Result<()> {
    let mut merged = counts.clone();
    match fs::read_to_string(path) {
        Ok(existing) => {
            for line in existing.lines().filter(|l| !l.trim().is_empty()) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                let parsed = fields
                    .split_last()
                    .and_then(|(count, key)| Some((K::parse(key)?, count.parse::<u64>().ok()?)));
                match parsed {
                    Some((key, count)) => *merged.entry(key).or_default() += count,
                    None => warn!("Ignoring malformed line in {}: {line:?}", path.display()),
                }
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut out = String::new();
    for (key, count) in &merged {
        key.format(&mut out);
        let _ = writeln!(out, " {count}");
    }

    let dir = path.parent().ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "sample file has no parent"))?;
    fs::create_dir_all(dir)?;
    let file_name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.tmp"));
    fs::write(&tmp, out)?;
    fs::rename(&tmp, path)
}
