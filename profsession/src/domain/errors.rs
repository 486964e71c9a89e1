//! Structured error types for profsession
//!
//! Using thiserror for automatic Display implementation and error chaining.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use profsession_common::{FrameError, HeaderError};
use std::path::PathBuf;
use thiserror::Error;

use super::types::Role;

/// Failures creating or using a handshake pipe or the sample stream
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("could not create pipe: {0}")]
    Create(#[source] Errno),

    #[error("pipe I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("fork of {role} process failed: {source}")]
    Fork { role: Role, source: Errno },

    #[error("waitpid for {role} process {pid} failed: {source}")]
    Wait { role: Role, pid: Pid, source: Errno },

    #[error("sending {signal} to {role} process {pid} failed: {source}")]
    Signal { role: Role, pid: Pid, signal: Signal, source: Errno },

    #[error("{role} process {pid} was already reaped")]
    AlreadyReaped { role: Role, pid: Pid },
}

/// Failures attaching to or reading from the kernel counter subsystem
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("profiled process {0} has already ended")]
    TargetGone(Pid),

    #[error("no such process: {0}")]
    InvalidPid(Pid),

    #[error("performance counter device or resource busy")]
    DeviceBusy,

    #[error("permission denied opening performance counters")]
    PermissionDenied,

    #[error("event {0} is not supported by this processor")]
    Unsupported(String),

    #[error("opening counter for event {event} failed: {source}")]
    Open { event: String, source: std::io::Error },

    #[error("mapping counter ring buffer failed: {0}")]
    Mmap(#[source] std::io::Error),

    #[error("writing sample data failed: {0}")]
    Write(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RecordError {
    /// The "known" attach failures: reported once and the session is
    /// abandoned before any recording happens.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RecordError::TargetGone(_)
                | RecordError::InvalidPid(_)
                | RecordError::DeviceBusy
                | RecordError::PermissionDenied
                | RecordError::Unsupported(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("cannot read header info for sample data: {0}")]
    Header(#[from] HeaderError),

    #[error("sample data is corrupt after {frames} records: {source}")]
    Frame { frames: u64, source: FrameError },

    #[error("sample stream uses unsupported sample_type {0:#x}")]
    UnsupportedSampleType(u64),

    #[error("record refers to unknown event index {0}")]
    UnknownEvent(u32),

    #[error("unable to rotate sample data at {path}: {source}")]
    Rotate { path: PathBuf, source: std::io::Error },

    #[error("unable to write sample file {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
}

impl ConvertError {
    /// Header failures the recorder already explained to the user
    #[must_use]
    pub fn is_handled(&self) -> bool {
        matches!(self, ConvertError::Header(e) if e.is_handled())
    }
}

/// Failures running one of the external helper programs
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unable to execute {tool}: {source}")]
    Spawn { tool: String, source: std::io::Error },

    #[error("{tool} failed: {detail}")]
    Failed { tool: String, detail: String },

    #[error("unexpected output from {tool}: {detail}")]
    Parse { tool: String, detail: String },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("invalid argument for {what}: {detail}")]
    InvalidArgument { what: &'static str, detail: String },

    #[error("signal setup failed: {0}")]
    Signals(#[source] Errno),
}
