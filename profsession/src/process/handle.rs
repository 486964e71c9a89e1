//! Tracking and reaping forked session processes.

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fmt;
use std::time::{Duration, Instant};

use crate::domain::{ProcessError, Role};

/// How a reaped process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled(Signal),
}

impl ExitState {
    #[must_use]
    pub fn success(self) -> bool {
        self == ExitState::Exited(0)
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Exited(code) => write!(f, "exit status {code}"),
            ExitState::Signaled(sig) => write!(f, "killed by {sig}"),
        }
    }
}

/// Bounded wait used when stopping a process that should exit on its own
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    pub grace: Duration,
    pub poll_interval: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self { grace: Duration::from_secs(5), poll_interval: Duration::from_millis(100) }
    }
}

/// Result of [`ProcessHandle::stop_with_escalation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped {
    pub state: ExitState,
    /// The grace period ran out and the process had to be signaled
    pub escalated: bool,
}

/// Result of [`ProcessHandle::wait_until`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ExitState),
    Cancelled,
}

/// A forked child owned by the coordinator.
///
/// Once reaped, the pid may be reused by the system, so further signals or
/// waits are refused with [`ProcessError::AlreadyReaped`].
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    role: Role,
    exit: Option<ExitState>,
}

impl ProcessHandle {
    #[must_use]
    pub fn new(pid: Pid, role: Role) -> Self {
        Self { pid, role, exit: None }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn is_reaped(&self) -> bool {
        self.exit.is_some()
    }

    /// Block until the process exits.
    ///
    /// # Errors
    /// Returns an error if the process was already reaped or waitpid fails
    pub fn wait(&mut self) -> Result<ExitState, ProcessError> {
        self.ensure_running()?;
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(state) = self.record(status) {
                        return Ok(state);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(source) => return Err(self.wait_error(source)),
            }
        }
    }

    /// Reap the process if it has exited, without blocking.
    ///
    /// # Errors
    /// Returns an error if the process was already reaped or waitpid fails
    pub fn try_wait(&mut self) -> Result<Option<ExitState>, ProcessError> {
        self.ensure_running()?;
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => Ok(self.record(status)),
            Err(Errno::EINTR) => Ok(None),
            Err(source) => Err(self.wait_error(source)),
        }
    }

    /// Poll for exit every `interval` until `timeout` elapses.
    ///
    /// # Errors
    /// Returns an error if the process was already reaped or waitpid fails
    pub fn wait_timeout(
        &mut self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Option<ExitState>, ProcessError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(state) = self.try_wait()? {
                return Ok(Some(state));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(interval.min(deadline - now));
        }
    }

    /// Poll for exit every `interval` until the process exits or `cancel`
    /// returns true.
    ///
    /// # Errors
    /// Returns an error if the process was already reaped or waitpid fails
    pub fn wait_until(
        &mut self,
        interval: Duration,
        mut cancel: impl FnMut() -> bool,
    ) -> Result<WaitOutcome, ProcessError> {
        loop {
            if let Some(state) = self.try_wait()? {
                return Ok(WaitOutcome::Exited(state));
            }
            if cancel() {
                return Ok(WaitOutcome::Cancelled);
            }
            std::thread::sleep(interval);
        }
    }

    /// Send a signal to the process.
    ///
    /// # Errors
    /// Returns an error if the process was already reaped or kill fails
    pub fn signal(&self, signal: Signal) -> Result<(), ProcessError> {
        self.ensure_running()?;
        kill(self.pid, signal).map_err(|source| ProcessError::Signal {
            role: self.role,
            pid: self.pid,
            signal,
            source,
        })
    }

    /// Give the process `policy.grace` to exit on its own, then send
    /// `signal` and wait once more without a bound.
    ///
    /// # Errors
    /// Returns an error if waiting or signaling fails
    pub fn stop_with_escalation(
        &mut self,
        signal: Signal,
        policy: &EscalationPolicy,
    ) -> Result<Stopped, ProcessError> {
        if let Some(state) = self.wait_timeout(policy.grace, policy.poll_interval)? {
            return Ok(Stopped { state, escalated: false });
        }

        warn!(
            "{} process {} did not exit within {:?}, sending {signal}",
            self.role, self.pid, policy.grace
        );
        self.signal(signal)?;
        let state = self.wait()?;
        Ok(Stopped { state, escalated: true })
    }

    /// SIGKILL and reap, for cleanup paths where the outcome no longer matters.
    pub fn kill_and_reap(&mut self) {
        if self.is_reaped() {
            return;
        }
        if let Err(e) = self.signal(Signal::SIGKILL) {
            debug!("{e}");
        }
        if let Err(e) = self.wait() {
            warn!("{e}");
        }
    }

    fn ensure_running(&self) -> Result<(), ProcessError> {
        if self.exit.is_some() {
            return Err(ProcessError::AlreadyReaped { role: self.role, pid: self.pid });
        }
        Ok(())
    }

    fn record(&mut self, status: WaitStatus) -> Option<ExitState> {
        let state = match status {
            WaitStatus::Exited(_, code) => ExitState::Exited(code),
            WaitStatus::Signaled(_, signal, _) => ExitState::Signaled(signal),
            _ => return None,
        };
        debug!("{} process {} ended: {state}", self.role, self.pid);
        self.exit = Some(state);
        Some(state)
    }

    fn wait_error(&self, source: Errno) -> ProcessError {
        ProcessError::Wait { role: self.role, pid: self.pid, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn spawn(cmd: &str, args: &[&str]) -> ProcessHandle {
        let child = Command::new(cmd).args(args).spawn().unwrap();
        let pid = Pid::from_raw(i32::try_from(child.id()).unwrap());
        ProcessHandle::new(pid, Role::Converter)
    }

    #[test]
    fn test_wait_reports_exit_code() {
        let mut handle = spawn("/bin/sh", &["-c", "exit 3"]);
        assert_eq!(handle.wait().unwrap(), ExitState::Exited(3));
        assert!(handle.is_reaped());
    }

    #[test]
    fn test_second_wait_is_refused() {
        let mut handle = spawn("/bin/true", &[]);
        handle.wait().unwrap();
        assert!(matches!(handle.wait(), Err(ProcessError::AlreadyReaped { .. })));
        assert!(matches!(handle.signal(Signal::SIGTERM), Err(ProcessError::AlreadyReaped { .. })));
    }

    #[test]
    fn test_wait_timeout_expires_for_running_process() {
        let mut handle = spawn("/bin/sleep", &["5"]);
        let started = Instant::now();
        let res = handle.wait_timeout(Duration::from_millis(200), Duration::from_millis(20)).unwrap();
        assert!(res.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
        handle.kill_and_reap();
        assert!(handle.is_reaped());
    }

    #[test]
    fn test_escalation_not_needed_for_prompt_exit() {
        let mut handle = spawn("/bin/sh", &["-c", "exit 0"]);
        let stopped = handle.stop_with_escalation(Signal::SIGUSR1, &EscalationPolicy::default()).unwrap();
        assert_eq!(stopped, Stopped { state: ExitState::Exited(0), escalated: false });
    }

    #[test]
    fn test_escalation_signals_after_grace() {
        let mut handle = spawn("/bin/sleep", &["30"]);
        let policy = EscalationPolicy {
            grace: Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
        };
        let started = Instant::now();
        let stopped = handle.stop_with_escalation(Signal::SIGUSR1, &policy).unwrap();
        assert!(stopped.escalated);
        assert_eq!(stopped.state, ExitState::Signaled(Signal::SIGUSR1));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[test]
    fn test_wait_until_cancel() {
        let mut handle = spawn("/bin/sleep", &["30"]);
        let mut polls = 0;
        let outcome = handle
            .wait_until(Duration::from_millis(10), || {
                polls += 1;
                polls > 3
            })
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        handle.kill_and_reap();
    }
}
