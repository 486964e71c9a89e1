//! Core value types shared by every role in a profiling session.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Aggregated outcome of a session, returned as the process exit status.
///
/// Each failure source owns one bit. Bits are only ever OR-ed in, so a
/// failure recorded early is never hidden by a later success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ResultCode(u8);

impl ResultCode {
    pub const OK: Self = Self(0);
    /// The profiled application exited non-zero or was killed
    pub const APP_ABNORMAL_END: Self = Self(1);
    /// The recorder failed to attach, exited non-zero or was killed
    pub const RECORD_ERROR: Self = Self(2);
    /// The converter failed or had to be killed
    pub const READ_ERROR: Self = Self(4);

    /// Exit status reported when both the recorder and the converter failed
    const BOTH_ERROR_STATUS: i32 = 8;

    #[must_use]
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Process exit status for this outcome.
    ///
    /// `RECORD_ERROR | READ_ERROR` is reported as `8` rather than `6`.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        let app = i32::from(self.0 & Self::APP_ABNORMAL_END.0);
        if self.contains(Self::RECORD_ERROR | Self::READ_ERROR) {
            app | Self::BOTH_ERROR_STATUS
        } else {
            app | i32::from(self.0 & (Self::RECORD_ERROR.0 | Self::READ_ERROR.0))
        }
    }
}

impl BitOr for ResultCode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ResultCode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "ok");
        }
        let mut names = Vec::new();
        if self.contains(Self::APP_ABNORMAL_END) {
            names.push("app-abnormal-end");
        }
        if self.contains(Self::RECORD_ERROR) {
            names.push("record-error");
        }
        if self.contains(Self::READ_ERROR) {
            names.push("read-error");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// Which part a forked process plays in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    AppLauncher,
    Recorder,
    Converter,
    JitBridge,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::AppLauncher => "profiled app",
            Role::Recorder => "recorder",
            Role::Converter => "converter",
            Role::JitBridge => "JIT conversion helper",
        };
        f.write_str(name)
    }
}

/// Coordinator phase. Progress is strictly forward; `Terminating` can be
/// entered from any active phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Initializing,
    Launching,
    Recording,
    Converting,
    JitConverting,
    Terminating,
    Done,
}

impl SessionState {
    #[must_use]
    pub fn can_advance_to(self, next: SessionState) -> bool {
        match next {
            SessionState::Terminating => self < SessionState::Terminating,
            SessionState::Done => self == SessionState::Terminating,
            _ => next > self,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
