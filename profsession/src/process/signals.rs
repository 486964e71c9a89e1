//! Signal dispositions for the coordinator and its children.
//!
//! SIGINT and SIGUSR1 are blocked in the coordinator while children are
//! forked, so no child can be hit by either before it has installed its own
//! disposition. Each role then sets what it needs and unblocks:
//!
//! | process     | SIGINT                 | SIGUSR1           |
//! |-------------|------------------------|-------------------|
//! | coordinator | flag + SIGKILL the app | (not used)        |
//! | launcher    | default (restored)     | default           |
//! | recorder    | ignored                | stop request flag |
//! | converter   | ignored                | default (kills)   |
#![allow(unsafe_code)]

use nix::sys::signal::{
    kill, pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::domain::SessionError;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static FORWARD_PID: AtomicI32 = AtomicI32::new(0);
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

fn session_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGUSR1);
    set
}

fn set_disposition(signal: Signal, handler: SigHandler) -> Result<(), SessionError> {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // Handlers installed here only touch atomics and call kill(2).
    unsafe { sigaction(signal, &action) }.map(drop).map_err(SessionError::Signals)
}

/// Block SIGINT and SIGUSR1 in the calling thread; forked children inherit
/// the mask.
///
/// # Errors
/// Returns an error if the mask cannot be changed
pub fn block_session_signals() -> Result<(), SessionError> {
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&session_signals()), None).map_err(SessionError::Signals)
}

/// Undo [`block_session_signals`].
///
/// # Errors
/// Returns an error if the mask cannot be changed
pub fn unblock_session_signals() -> Result<(), SessionError> {
    pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&session_signals()), None).map_err(SessionError::Signals)
}

/// Writes to a pipe whose reader has gone must fail with EPIPE instead of
/// killing the writer.
///
/// # Errors
/// Returns an error if the disposition cannot be changed
pub fn ignore_broken_pipes() -> Result<(), SessionError> {
    set_disposition(Signal::SIGPIPE, SigHandler::SigIgn)
}

/// Recorder and converter leave SIGINT to the coordinator.
///
/// # Errors
/// Returns an error if the disposition cannot be changed
pub fn ignore_interrupts() -> Result<(), SessionError> {
    set_disposition(Signal::SIGINT, SigHandler::SigIgn)?;
    unblock_session_signals()
}

/// Give an exec'd program the dispositions it would have had if started
/// from a shell.
///
/// # Errors
/// Returns an error if a disposition or the mask cannot be changed
pub fn restore_defaults_for_exec() -> Result<(), SessionError> {
    for signal in [Signal::SIGINT, Signal::SIGUSR1, Signal::SIGPIPE] {
        set_disposition(signal, SigHandler::SigDfl)?;
    }
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None).map_err(SessionError::Signals)
}

extern "C" fn on_interrupt(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    let pid = FORWARD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

extern "C" fn on_stop_request(_: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// The coordinator's SIGINT handling, installed for the whole session.
///
/// On SIGINT the profiled app (if any) is killed right away and the
/// interrupt flag is raised for the coordinator's wait loop. Later
/// interrupts only raise the flag again, so teardown always runs to the end.
/// The default disposition comes back when this is dropped.
pub struct InterruptSource {
    _private: (),
}

impl InterruptSource {
    /// Install the handler. The signal mask is left alone: while session
    /// signals are blocked, an interrupt stays pending until they are not.
    ///
    /// # Errors
    /// Returns an error if the handler cannot be installed
    pub fn install() -> Result<Self, SessionError> {
        INTERRUPTED.store(false, Ordering::SeqCst);
        FORWARD_PID.store(0, Ordering::SeqCst);
        set_disposition(Signal::SIGINT, SigHandler::Handler(on_interrupt))?;
        Ok(Self { _private: () })
    }

    /// Kill `app` on the next interrupt.
    pub fn forward_to(&self, app: Pid) {
        FORWARD_PID.store(app.as_raw(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn interrupted(&self) -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }

    /// Stop forwarding to the app once it has been reaped; its pid may be reused.
    pub fn forget_app(&self) {
        FORWARD_PID.store(0, Ordering::SeqCst);
    }
}

impl Drop for InterruptSource {
    fn drop(&mut self) {
        FORWARD_PID.store(0, Ordering::SeqCst);
        let _ = set_disposition(Signal::SIGINT, SigHandler::SigDfl);
    }
}

/// The recorder's SIGUSR1 handling: a request to finish and exit.
pub struct StopRequest {
    _private: (),
}

impl StopRequest {
    /// Install the handler and unblock SIGUSR1.
    ///
    /// # Errors
    /// Returns an error if the handler cannot be installed
    pub fn install() -> Result<Self, SessionError> {
        STOP_REQUESTED.store(false, Ordering::SeqCst);
        set_disposition(Signal::SIGUSR1, SigHandler::Handler(on_stop_request))?;
        unblock_session_signals()?;
        Ok(Self { _private: () })
    }

    #[must_use]
    pub fn requested(&self) -> bool {
        STOP_REQUESTED.load(Ordering::SeqCst)
    }
}
