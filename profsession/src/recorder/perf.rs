//! Linux perf_event counters.
//!
//! One counter per (event, online CPU), each with its own mmap'd ring
//! buffer. The first event's counters also carry the side-band records
//! (MMAP, COMM, FORK/EXIT) so each is reported once per CPU.
#![allow(unsafe_code)]

use log::{debug, info};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::Pid;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::cpus::online_cpus;
use super::ring::drain_records;
use super::{AttachRequest, CounterSession, CounterSource, Scope};
use crate::domain::{EventSpec, RecordError};

const PERF_TYPE_RAW: u32 = 4;
/// PERF_ATTR_SIZE_VER5
const PERF_ATTR_SIZE: u32 = 112;

// perf_event_attr flag bits
const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_INHERIT: u64 = 1 << 1;
const ATTR_EXCLUDE_USER: u64 = 1 << 4;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;
const ATTR_MMAP: u64 = 1 << 8;
const ATTR_COMM: u64 = 1 << 9;
const ATTR_ENABLE_ON_EXEC: u64 = 1 << 12;
const ATTR_TASK: u64 = 1 << 13;
const ATTR_WATERMARK: u64 = 1 << 14;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

// perf_event_mmap_page
const DATA_HEAD_OFFSET: usize = 1024;
const DATA_TAIL_OFFSET: usize = 1032;

/// `struct perf_event_attr` up to `sample_max_stack`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PerfEventAttr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_watermark: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved: u16,
}

fn perf_event_open(attr: &PerfEventAttr, pid: i32, cpu: i32) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            ptr::from_ref(attr),
            pid,
            cpu,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

const PERF_TYPE_HARDWARE: u32 = 0;

/// Open (and immediately close) a disabled cycle counter on this process.
///
/// # Errors
/// Returns the raw open error; ENOSYS and ENOENT mean counters are unusable
pub fn probe_support() -> io::Result<()> {
    let attr = PerfEventAttr {
        kind: PERF_TYPE_HARDWARE,
        size: PERF_ATTR_SIZE,
        flags: ATTR_DISABLED | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV,
        ..PerfEventAttr::default()
    };
    perf_event_open(&attr, 0, -1).map(drop)
}

/// The kernel's counter subsystem
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfCounters;

impl PerfCounters {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn attr_for(request: &AttachRequest, event: &EventSpec, side_band: bool, data_bytes: usize) -> PerfEventAttr {
        let mut flags = ATTR_EXCLUDE_HV | ATTR_WATERMARK;
        match request.scope {
            Scope::Launched(_) => flags |= ATTR_DISABLED | ATTR_ENABLE_ON_EXEC | ATTR_INHERIT,
            Scope::Process(_) => flags |= ATTR_INHERIT,
            Scope::SystemWide => {}
        }
        if !event.kernel {
            flags |= ATTR_EXCLUDE_KERNEL;
        }
        if !event.user {
            flags |= ATTR_EXCLUDE_USER;
        }
        if side_band {
            flags |= ATTR_MMAP | ATTR_COMM | ATTR_TASK;
        }

        PerfEventAttr {
            kind: PERF_TYPE_RAW,
            size: PERF_ATTR_SIZE,
            config: event.raw_config(),
            sample_period: event.count,
            sample_type: request.sample_type(),
            flags,
            wakeup_watermark: u32::try_from(data_bytes / 2).unwrap_or(u32::MAX),
            ..PerfEventAttr::default()
        }
    }
}

fn classify_open_error(err: io::Error, event: &EventSpec, scope: Scope) -> RecordError {
    match err.raw_os_error() {
        Some(libc::EBUSY) => RecordError::DeviceBusy,
        Some(libc::ESRCH) => match scope.pid() {
            Some(pid) => RecordError::TargetGone(pid),
            None => RecordError::Open { event: event.name.clone(), source: err },
        },
        Some(libc::EACCES | libc::EPERM) => RecordError::PermissionDenied,
        Some(libc::ENOENT | libc::EOPNOTSUPP) => RecordError::Unsupported(event.name.clone()),
        _ => RecordError::Open { event: event.name.clone(), source: err },
    }
}

impl CounterSource for PerfCounters {
    type Session = PerfSession;

    fn attach(&self, request: &AttachRequest) -> Result<PerfSession, RecordError> {
        if let Scope::Process(pid) = request.scope {
            if !Path::new(&format!("/proc/{pid}")).exists() {
                return Err(RecordError::InvalidPid(pid));
            }
        }

        let page_size = page_size();
        let data_pages = request.buffer_pages.max(1).next_power_of_two();
        let cpus = online_cpus()?;
        let pid = request.scope.pid().map_or(-1, Pid::as_raw);

        let mut counters = Vec::with_capacity(request.events.len() * cpus.len());
        for (index, event) in request.events.iter().enumerate() {
            let attr = Self::attr_for(request, event, index == 0, data_pages * page_size);
            for &cpu in &cpus {
                let cpu = i32::try_from(cpu).unwrap_or(i32::MAX);
                let fd = perf_event_open(&attr, pid, cpu)
                    .map_err(|e| classify_open_error(e, event, request.scope))?;
                let ring = RingBuffer::map(&fd, data_pages, page_size)?;
                debug!("Opened counter for {event} on cpu {cpu}");
                counters.push(Counter { event: u32::try_from(index).unwrap_or(u32::MAX), fd, ring });
            }
        }

        info!(
            "Attached {} counters ({} events on {} CPUs), {} KB ring buffer each",
            counters.len(),
            request.events.len(),
            cpus.len(),
            data_pages * page_size / 1024
        );
        Ok(PerfSession { counters })
    }
}

struct Counter {
    event: u32,
    fd: OwnedFd,
    ring: RingBuffer,
}

pub struct PerfSession {
    counters: Vec<Counter>,
}

impl CounterSession for PerfSession {
    fn poll(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(u32, &[u8]) -> io::Result<()>,
    ) -> Result<u64, RecordError> {
        let mut fds: Vec<PollFd<'_>> =
            self.counters.iter().map(|c| PollFd::new(c.fd.as_fd(), PollFlags::POLLIN)).collect();
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let ready = match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(RecordError::Io(e.into())),
        };
        drop(fds);

        let mut total = 0;
        for counter in &mut self.counters {
            let event = counter.event;
            total += counter.ring.drain(&mut |record| sink(event, record)).map_err(RecordError::Write)?;
        }

        // Hung-up counters (the target exited) poll ready forever
        if total == 0 && ready > 0 && !timeout.is_zero() {
            std::thread::sleep(timeout);
        }
        Ok(total)
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

/// A counter's mmap'd metadata page plus data area
struct RingBuffer {
    base: *mut u8,
    map_len: usize,
    page_size: usize,
    scratch: Vec<u8>,
}

impl RingBuffer {
    fn map(fd: &OwnedFd, data_pages: usize, page_size: usize) -> Result<Self, RecordError> {
        let map_len = page_size * (data_pages + 1);
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RecordError::Mmap(io::Error::last_os_error()));
        }
        Ok(Self { base: base.cast(), map_len, page_size, scratch: Vec::new() })
    }

    fn drain(&mut self, sink: &mut dyn FnMut(&[u8]) -> io::Result<()>) -> io::Result<u64> {
        // The kernel publishes data_head after writing the records it covers;
        // data_tail tells it which space may be reused.
        let (head_pos, tail_pos) = unsafe {
            (
                &*self.base.add(DATA_HEAD_OFFSET).cast::<AtomicU64>(),
                &*self.base.add(DATA_TAIL_OFFSET).cast::<AtomicU64>(),
            )
        };
        let head = head_pos.load(Ordering::Acquire);
        let tail = tail_pos.load(Ordering::Relaxed);
        if head == tail {
            return Ok(0);
        }

        let data = unsafe {
            std::slice::from_raw_parts(self.base.add(self.page_size), self.map_len - self.page_size)
        };
        let (count, new_tail) = drain_records(data, tail, head, &mut self.scratch, sink)?;
        tail_pos.store(new_tail, Ordering::Release);
        Ok(count)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.map_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_layout_matches_kernel_abi() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), PERF_ATTR_SIZE as usize);
    }

    #[test]
    fn test_launch_attr_waits_for_exec() {
        let request = AttachRequest {
            scope: Scope::Launched(Pid::from_raw(100)),
            events: vec![EventSpec::new("CPU_CLK_UNHALTED", 100_000)],
            callgraph: false,
            buffer_pages: 64,
        };
        let attr = PerfCounters::attr_for(&request, &request.events[0], true, 4096 * 64);
        assert_ne!(attr.flags & ATTR_DISABLED, 0);
        assert_ne!(attr.flags & ATTR_ENABLE_ON_EXEC, 0);
        assert_ne!(attr.flags & ATTR_INHERIT, 0);
        assert_ne!(attr.flags & ATTR_MMAP, 0);
        assert_eq!(attr.sample_period, 100_000);
    }

    #[test]
    fn test_system_wide_attr_is_enabled_immediately() {
        let mut event = EventSpec::new("X", 5000);
        event.kernel = false;
        let request = AttachRequest {
            scope: Scope::SystemWide,
            events: vec![event],
            callgraph: true,
            buffer_pages: 64,
        };
        let attr = PerfCounters::attr_for(&request, &request.events[0], false, 4096);
        assert_eq!(attr.flags & (ATTR_DISABLED | ATTR_INHERIT | ATTR_MMAP), 0);
        assert_ne!(attr.flags & ATTR_EXCLUDE_KERNEL, 0);
        assert_ne!(attr.sample_type & profsession_common::PERF_SAMPLE_CALLCHAIN, 0);
    }

    #[test]
    fn test_open_errors_are_classified() {
        let event = EventSpec::new("X", 1);
        let pid = Pid::from_raw(77);
        let busy = io::Error::from_raw_os_error(libc::EBUSY);
        assert!(matches!(classify_open_error(busy, &event, Scope::SystemWide), RecordError::DeviceBusy));
        let gone = io::Error::from_raw_os_error(libc::ESRCH);
        assert!(matches!(classify_open_error(gone, &event, Scope::Process(pid)), RecordError::TargetGone(p) if p == pid));
        let unsupported = io::Error::from_raw_os_error(libc::ENOENT);
        assert!(matches!(
            classify_open_error(unsupported, &event, Scope::SystemWide),
            RecordError::Unsupported(_)
        ));
    }
}
