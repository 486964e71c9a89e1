//! Pre-flight checks for profsession
//!
//! Validates system requirements before any session process is started.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() and access() require unsafe

use anyhow::{bail, Result};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::config::{SessionConfig, TargetMode};
use crate::converter::rotation::{CURRENT_DIR, PREVIOUS_DIR};
use crate::recorder::perf::probe_support;

/// Run all pre-flight checks for `config`
pub fn run_preflight_checks(config: &SessionConfig) -> Result<()> {
    check_perf_events_support()?;
    let root = is_root();
    check_privileges(config.system_wide(), root)?;
    if let TargetMode::AttachPid(pid) = config.target {
        check_process_exists(pid.as_raw())?;
    }
    if !root {
        precheck_samples_dir(&config.samples_dir(), config.append)?;
    }
    Ok(())
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check that the kernel has a usable counter subsystem
fn check_perf_events_support() -> Result<()> {
    match probe_support().map_err(|e| e.raw_os_error()) {
        Err(Some(libc::ENOSYS)) => bail!(
            "Your kernel does not appear to have the perf_event_open syscall.\n\n\
             A kernel built with CONFIG_PERF_EVENTS is required."
        ),
        Err(Some(libc::ENOENT | libc::ENODEV | libc::EOPNOTSUPP)) => bail!(
            "Your kernel's performance events subsystem does not support your processor type.\n\n\
             Hardware counters may be unavailable inside a virtual machine."
        ),
        // Permission problems are reported per counter once the session runs
        _ => Ok(()),
    }
}

/// Whole-system profiling needs root
fn check_privileges(system_wide: bool, root: bool) -> Result<()> {
    if system_wide && !root {
        bail!(
            "Permission denied: profsession requires root privileges for --system-wide.\n\n\
             Run with: sudo profsession --system-wide ..."
        );
    }
    Ok(())
}

/// Check if the target process exists
pub fn check_process_exists(pid: i32) -> Result<()> {
    let proc_path = format!("/proc/{pid}");
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}

/// Make sure sample rotation will not fail half-way for lack of permission.
///
/// Nothing is removed here; every existing directory under `current` (and
/// `previous`, unless appending) must be writable.
pub fn precheck_samples_dir(samples_dir: &Path, append: bool) -> Result<()> {
    let mut roots = vec![samples_dir.join(CURRENT_DIR)];
    if !append {
        roots.push(samples_dir.join(PREVIOUS_DIR));
    }
    for root in roots.iter().filter(|r| r.is_dir()) {
        if let Some(denied) = first_unwritable(root) {
            bail!(
                "Permission denied: cannot write to {}.\n\n\
                 The samples were probably created by another user (or root).\n\
                 Remove {} or choose another --session-dir.",
                denied.display(),
                samples_dir.display()
            );
        }
    }
    Ok(())
}

fn first_unwritable(dir: &Path) -> Option<std::path::PathBuf> {
    if !writable(dir) {
        return Some(dir.to_path_buf());
    }
    let entries = fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .find_map(|e| first_unwritable(&e.path()))
}

fn writable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}
