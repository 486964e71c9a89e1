//! CPU utility functions
//!
//! Utilities for querying CPU information from /sys filesystem.

use std::fs;
use std::io;

const ONLINE_CPUS: &str = "/sys/devices/system/cpu/online";

/// Get list of online CPU IDs from /sys/devices/system/cpu/online
///
/// The format in /sys is like "0-3" or "0-3,8-11" for NUMA systems.
pub fn online_cpus() -> io::Result<Vec<u32>> {
    let content = fs::read_to_string(ONLINE_CPUS)?;
    parse_cpu_list(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{ONLINE_CPUS}: {e}")))
}

fn parse_cpu_list(content: &str) -> Result<Vec<u32>, std::num::ParseIntError> {
    let mut cpus = Vec::new();

    for range in content.trim().split(',').filter(|r| !r.is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            // Range like "0-3"
            let start: u32 = start.parse()?;
            let end: u32 = end.parse()?;
            cpus.extend(start..=end);
        } else {
            // Single CPU like "5"
            cpus.push(range.parse()?);
        }
    }

    Ok(cpus)
}
