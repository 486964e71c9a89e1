//! Shared fixtures for session tests: a counter source that needs no
//! privileges and a ready-made configuration.

#![allow(dead_code)]

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use profsession::config::{SessionConfig, TargetMode};
use profsession::converter::sample_files::Separation;
use profsession::domain::{EventSpec, KernelRange, RecordError, ResultCode, SessionError};
use profsession::recorder::{AttachRequest, CounterSession, CounterSource};
use profsession::tools::{KernelImage, NO_VMLINUX};
use profsession_common::{encode_mmap, encode_sample, MmapRecord, SampleRecord, PERF_RECORD_MISC_USER};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const APP_IMAGE: &str = "/usr/bin/fakeapp";
pub const SAMPLE_FILE: &str = "CPU_CLK_UNHALTED.100000.0.all.all.all";
const FAKE_PID: u32 = 4242;

static SESSION_LOCK: Mutex<()> = Mutex::new(());

/// Sessions fork and install process-wide signal handlers; run one at a time.
pub fn serial() -> MutexGuard<'static, ()> {
    SESSION_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Emits one mapping, then one sample in that mapping per poll
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeCounters {
    pub busy: bool,
}

impl FakeCounters {
    pub fn busy() -> Self {
        Self { busy: true }
    }
}

pub struct FakeSession {
    sample_type: u64,
    mapped: bool,
    time: u64,
}

impl CounterSource for FakeCounters {
    type Session = FakeSession;

    fn attach(&self, request: &AttachRequest) -> Result<FakeSession, RecordError> {
        if self.busy {
            return Err(RecordError::DeviceBusy);
        }
        Ok(FakeSession { sample_type: request.sample_type(), mapped: false, time: 0 })
    }
}

impl CounterSession for FakeSession {
    fn poll(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(u32, &[u8]) -> io::Result<()>,
    ) -> Result<u64, RecordError> {
        std::thread::sleep(timeout.min(Duration::from_millis(20)));
        let mut records = 0;
        if !self.mapped {
            let mmap = MmapRecord {
                pid: FAKE_PID,
                tid: FAKE_PID,
                addr: 0x40_0000,
                len: 0x1000,
                pgoff: 0,
                filename: APP_IMAGE.into(),
            };
            sink(0, &encode_mmap(&mmap)).map_err(RecordError::Write)?;
            self.mapped = true;
            records += 1;
        }
        self.time += 1;
        let sample = SampleRecord {
            misc: PERF_RECORD_MISC_USER,
            ip: 0x40_0010,
            pid: FAKE_PID,
            tid: FAKE_PID,
            time: self.time,
            cpu: 0,
            period: 100_000,
            callchain: Vec::new(),
        };
        sink(0, &encode_sample(self.sample_type, &sample)).map_err(RecordError::Write)?;
        Ok(records + 1)
    }
}

pub fn config(session_dir: &Path, target: TargetMode) -> SessionConfig {
    let mut event = EventSpec::new("CPU_CLK_UNHALTED", 100_000);
    event.code = 0x3c;
    SessionConfig {
        target,
        session_dir: session_dir.to_path_buf(),
        events: vec![event],
        callgraph: false,
        append: false,
        separation: Separation::default(),
        buffer_pages: 64,
        kernel: KernelImage { range: KernelRange::default(), name: NO_VMLINUX.into() },
        duration: None,
        jit_helper: None,
        start_time: 0,
        verbose: false,
    }
}

/// Set when the test binary is re-run to host a single session
const SESSION_CHILD: &str = "PROFSESSION_TEST_SESSION_DIR";

/// Inside a re-run test binary: the session directory to use.
pub fn session_child() -> Option<PathBuf> {
    std::env::var_os(SESSION_CHILD).map(PathBuf::from)
}

/// End the re-run test binary with the session's exit status.
pub fn exit_with(result: Result<ResultCode, SessionError>) -> ! {
    let code = match result {
        Ok(result) => result.exit_code(),
        Err(e) => {
            eprintln!("session setup failed: {e}");
            100
        }
    };
    std::process::exit(code)
}

/// A session hosted by a fresh copy of the test binary.
///
/// The copy runs with `--nocapture`, so everything the session and its
/// children print reaches real stdout/stderr, and it can be interrupted
/// like a session started from a terminal.
pub struct SessionProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
    seen: String,
}

/// What a finished [`SessionProcess`] left behind
pub struct SessionOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl SessionOutput {
    pub fn stderr_lines(&self) -> Vec<&str> {
        self.stderr.lines().filter(|l| !l.trim().is_empty()).collect()
    }
}

impl SessionProcess {
    /// Re-run `test`, which must start with a [`session_child`] check.
    pub fn spawn(test: &str, session_dir: &Path) -> Self {
        let mut child = Command::new(std::env::current_exe().unwrap())
            .args([test, "--exact", "--nocapture", "--test-threads=1"])
            .env(SESSION_CHILD, session_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap());
        Self { child, stdout, seen: String::new() }
    }

    /// Block until the coordinator announces that profiling has started.
    pub fn wait_until_started(&mut self) {
        loop {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line).unwrap();
            assert!(n > 0, "session ended before it started:\n{}", self.seen);
            self.seen.push_str(&line);
            if line.contains("Profiler started") {
                return;
            }
        }
    }

    pub fn interrupt(&self) {
        let pid = Pid::from_raw(i32::try_from(self.child.id()).unwrap());
        kill(pid, Signal::SIGINT).unwrap();
    }

    pub fn finish(mut self) -> SessionOutput {
        self.stdout.read_to_string(&mut self.seen).unwrap();
        let mut stderr = String::new();
        self.child.stderr.take().unwrap().read_to_string(&mut stderr).unwrap();
        let status = self.child.wait().unwrap();
        SessionOutput { code: status.code(), stdout: self.seen, stderr }
    }
}
