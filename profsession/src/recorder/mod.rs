//! The recorder role: attach counters and stream raw records to the converter.
//!
//! The stream starts with a [`StreamHeader`], followed by synthesized
//! COMM/MMAP records for processes that already existed, followed by
//! whatever the kernel produces until SIGUSR1 arrives. Closing the stream
//! is how the converter learns that recording is over.

pub mod cpus;
pub mod perf;
pub mod proc_maps;
mod ring;

use log::{debug, info, warn};
use nix::unistd::Pid;
use profsession_common::{
    write_frame, StreamHeader, PERF_SAMPLE_CALLCHAIN, PERF_SAMPLE_CPU, PERF_SAMPLE_IP,
    PERF_SAMPLE_PERIOD, PERF_SAMPLE_TID, PERF_SAMPLE_TIME,
};
use std::io::{self, Write};
use std::time::Duration;

pub use perf::PerfCounters;

use crate::domain::{EventSpec, RecordError, Role};
use crate::ipc::{HandshakeSender, StreamWriter, ABORT, READY};
use crate::process::signals::{self, StopRequest};
use crate::process::{ChildRole, EXIT_FAILURE, EXIT_REPORTED, EXIT_SUCCESS};

/// How long a single wait for counter data may block before the stop flag
/// is checked again
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the counters are attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// A launcher process that has not exec'd yet; counting starts at exec
    Launched(Pid),
    /// An existing process and the children it creates from now on
    Process(Pid),
    SystemWide,
}

impl Scope {
    #[must_use]
    pub fn pid(self) -> Option<Pid> {
        match self {
            Scope::Launched(pid) | Scope::Process(pid) => Some(pid),
            Scope::SystemWide => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub scope: Scope,
    pub events: Vec<EventSpec>,
    pub callgraph: bool,
    /// Data pages per ring buffer, rounded up to a power of two
    pub buffer_pages: usize,
}

impl AttachRequest {
    /// Fields the kernel includes in each sample
    #[must_use]
    pub fn sample_type(&self) -> u64 {
        let base = PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU | PERF_SAMPLE_PERIOD;
        if self.callgraph {
            base | PERF_SAMPLE_CALLCHAIN
        } else {
            base
        }
    }
}

/// Something that can attach sampling counters to a target
pub trait CounterSource {
    type Session: CounterSession;

    /// Open and map counters for every requested event.
    ///
    /// # Errors
    /// [`RecordError::DeviceBusy`], [`RecordError::TargetGone`] and the other
    /// configuration errors when the counters cannot be attached
    fn attach(&self, request: &AttachRequest) -> Result<Self::Session, RecordError>;
}

/// Attached counters producing raw records
pub trait CounterSession {
    /// Wait up to `timeout` for data, then pass every available record to
    /// `sink` along with the index of the event that produced it.
    ///
    /// # Errors
    /// Returns an error if reading the counters or the sink fails
    fn poll(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(u32, &[u8]) -> io::Result<()>,
    ) -> Result<u64, RecordError>;
}

pub struct Recorder<C> {
    counters: C,
    request: AttachRequest,
    header: StreamHeader,
    stream: StreamWriter,
    /// Taken once readiness has been reported
    ready: Option<HandshakeSender>,
}

impl<C: CounterSource> Recorder<C> {
    pub fn new(
        counters: C,
        request: AttachRequest,
        header: StreamHeader,
        stream: StreamWriter,
        ready: HandshakeSender,
    ) -> Self {
        Self { counters, request, header, stream, ready: Some(ready) }
    }

    fn report(&mut self, value: i32) {
        if let Some(mut ready) = self.ready.take() {
            if let Err(e) = ready.send(value) {
                warn!("Unable to report recorder state to the coordinator: {e}");
            }
        }
    }

    fn synthesized_records(&self) -> Vec<Vec<u8>> {
        match self.request.scope {
            Scope::Launched(_) => Vec::new(),
            Scope::Process(pid) => u32::try_from(pid.as_raw()).map_or_else(|_| Vec::new(), proc_maps::synthesize_process),
            Scope::SystemWide => proc_maps::synthesize_system(),
        }
    }

    fn record(mut self, stop: &StopRequest) -> Result<u64, RecordError> {
        let mut session = match self.counters.attach(&self.request) {
            Ok(session) => session,
            Err(e) => {
                self.report(ABORT);
                return Err(e);
            }
        };
        // Before any stream write: the converter may not be reading yet
        self.report(READY);

        self.header.write_to(&mut self.stream).map_err(RecordError::Write)?;
        let synthesized = self.synthesized_records();
        debug!("Writing {} records for pre-existing processes", synthesized.len());
        for record in &synthesized {
            write_frame(&mut self.stream, 0, record).map_err(RecordError::Write)?;
        }
        self.stream.flush().map_err(RecordError::Write)?;

        let stream = &mut self.stream;
        let mut sink = |event: u32, record: &[u8]| write_frame(&mut *stream, event, record);
        while !stop.requested() {
            session.poll(POLL_INTERVAL, &mut sink)?;
        }
        session.poll(Duration::ZERO, &mut sink)?;
        drop(session);

        self.stream.finish().map_err(RecordError::Write)
    }
}

impl<C: CounterSource> ChildRole for Recorder<C> {
    const ROLE: Role = Role::Recorder;

    fn run(self) -> i32 {
        let stop = match signals::ignore_interrupts().and_then(|()| StopRequest::install()) {
            Ok(stop) => stop,
            Err(e) => {
                eprintln!("recorder: {e}");
                return EXIT_FAILURE;
            }
        };

        match self.record(&stop) {
            Ok(bytes) => {
                info!("Total bytes recorded from perf events: {bytes}");
                EXIT_SUCCESS
            }
            Err(e) if e.is_configuration() => {
                eprintln!("Unable to start profiling: {e}");
                EXIT_REPORTED
            }
            Err(e) => {
                eprintln!("Caught runtime error while recording: {e}");
                EXIT_FAILURE
            }
        }
    }
}
