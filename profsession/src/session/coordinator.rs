//! The session coordinator: starts every process of a profiling session,
//! waits for the target, then stops everything in order and combines how
//! each process ended into one [`ResultCode`].
//!
//! ```text
//!  coordinator ──fork──▶ launcher ──exec──▶ app        (launch mode only)
//!       │      ──fork──▶ recorder ──stream──▶ converter ──▶ JIT helper
//!       └──────────────────────────────fork──────▲
//! ```

use log::{debug, info};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Instant;

use super::gate::{await_recorder_readiness, LaunchGate};
use crate::config::{SessionConfig, TargetMode};
use crate::converter::Converter;
use crate::domain::{ResultCode, Role, SessionError, SessionState};
use crate::ipc::{handshake_pipe, sample_stream, HandshakeReceiver, HandshakeSender, StreamReader, StreamWriter};
use crate::launcher::AppLauncher;
use crate::process::signals::{self, InterruptSource};
use crate::process::{spawn_role, EscalationPolicy, ExitState, ProcessHandle, WaitOutcome, EXIT_REPORTED};
use crate::recorder::{CounterSource, Recorder, Scope};

pub struct SessionCoordinator<C> {
    config: SessionConfig,
    counters: C,
    policy: EscalationPolicy,
}

impl<C: CounterSource> SessionCoordinator<C> {
    #[must_use]
    pub fn new(config: SessionConfig, counters: C) -> Self {
        Self { config, counters, policy: EscalationPolicy::default() }
    }

    /// Grace period and poll interval used for the primary wait and for
    /// stopping the converter
    #[must_use]
    pub fn with_policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run a whole session.
    ///
    /// Failures of the session's processes are folded into the returned
    /// code; an `Err` means the session could not be set up, in which case
    /// every process already started has been killed and reaped.
    ///
    /// # Errors
    /// Returns an error if a pipe, fork or signal disposition fails
    pub fn start_session(self) -> Result<ResultCode, SessionError> {
        let Self { config, counters, policy } = self;
        let mut run = SessionRun { config: &config, policy, state: SessionState::Initializing, children: Children::default() };

        signals::ignore_broken_pipes()?;
        let interrupt = match signals::block_session_signals().and_then(|()| InterruptSource::install()) {
            Ok(interrupt) => interrupt,
            Err(e) => {
                let _ = signals::unblock_session_signals();
                return Err(e);
            }
        };

        let outcome = run.run(counters, &interrupt);
        if outcome.is_err() {
            run.children.kill_all();
        }
        // The app is reaped by now and its pid may be reused
        interrupt.forget_app();
        let unblocked = signals::unblock_session_signals();
        let result = outcome?;
        unblocked?;

        run.children.kill_remaining();
        run.advance(SessionState::Done);
        drop(interrupt);
        report_outcome(result, &config.session_dir);
        Ok(result)
    }
}

/// Processes of one session, kept so that none is left unreaped
#[derive(Default)]
struct Children {
    app: Option<ProcessHandle>,
    recorder: Option<ProcessHandle>,
    converter: Option<ProcessHandle>,
}

impl Children {
    fn all(&mut self) -> impl Iterator<Item = &mut ProcessHandle> {
        [&mut self.app, &mut self.recorder, &mut self.converter].into_iter().flatten()
    }

    fn kill_all(&mut self) {
        for child in self.all() {
            child.kill_and_reap();
        }
    }

    /// By now only a failed session can have left a process running.
    fn kill_remaining(&mut self) {
        for child in self.all() {
            if !child.is_reaped() {
                debug!("Killing leftover {} process {}", child.role(), child.pid());
                child.kill_and_reap();
            }
        }
    }
}

/// How the coordinator learns that recording has started
enum Readiness {
    Launch(LaunchGate),
    Recorder(HandshakeReceiver),
}

impl Readiness {
    fn raw_fds(&self) -> Vec<RawFd> {
        match self {
            Readiness::Launch(gate) => gate.raw_fds().to_vec(),
            Readiness::Recorder(rx) => vec![rx.as_raw_fd()],
        }
    }

    fn await_ready(self) -> bool {
        match self {
            Readiness::Launch(gate) => gate.await_launch_readiness(),
            Readiness::Recorder(rx) => await_recorder_readiness(rx),
        }
    }
}

struct SessionRun<'a> {
    config: &'a SessionConfig,
    policy: EscalationPolicy,
    state: SessionState,
    children: Children,
}

impl SessionRun<'_> {
    fn advance(&mut self, next: SessionState) {
        if self.state.can_advance_to(next) {
            debug!("Session state {} -> {next}", self.state);
            self.state = next;
        }
    }

    fn run<C: CounterSource>(&mut self, counters: C, interrupt: &InterruptSource) -> Result<ResultCode, SessionError> {
        let config = self.config;
        let (writer, reader) = sample_stream()?;
        let (recorder_ready, recorder_ready_rx) = handshake_pipe()?;

        let (scope, readiness) = match &config.target {
            TargetMode::LaunchApp { program, args } => {
                self.advance(SessionState::Launching);
                let close = [writer.as_raw_fd(), reader.as_raw_fd(), recorder_ready.as_raw_fd()];
                let (pid, gate) = self.spawn_launcher(program, args, recorder_ready_rx, &close)?;
                interrupt.forward_to(pid);
                (Scope::Launched(pid), Readiness::Launch(gate))
            }
            TargetMode::AttachPid(pid) => (Scope::Process(*pid), Readiness::Recorder(recorder_ready_rx)),
            TargetMode::SystemWide => (Scope::SystemWide, Readiness::Recorder(recorder_ready_rx)),
        };

        let mut close_in_recorder = vec![reader.as_raw_fd()];
        close_in_recorder.extend(readiness.raw_fds());
        self.spawn_recorder(counters, scope, writer, recorder_ready, &close_in_recorder)?;

        if !readiness.await_ready() {
            return Ok(self.abort_start());
        }

        self.spawn_converter(reader)?;
        self.advance(SessionState::Recording);
        signals::unblock_session_signals()?;
        println!("profsession: Profiler started");

        let mut result = self.wait_for_target(interrupt)?;
        result |= self.terminate_and_collect();
        Ok(result)
    }

    fn spawn_launcher(
        &mut self,
        program: &Path,
        args: &[String],
        recorder_ready: HandshakeReceiver,
        close_in_child: &[RawFd],
    ) -> Result<(Pid, LaunchGate), SessionError> {
        let (app_ready_tx, app_ready_rx) = handshake_pipe()?;
        let (start_tx, start_rx) = handshake_pipe()?;

        let gate = LaunchGate::new(app_ready_rx, recorder_ready, start_tx);
        let mut close = close_in_child.to_vec();
        close.extend(gate.raw_fds());

        let launcher = AppLauncher::new(program, args, app_ready_tx, start_rx)?;
        let app = spawn_role(launcher, &close)?;
        let pid = app.pid();
        info!("Launching {} as process {pid}", program.display());
        self.children.app = Some(app);
        Ok((pid, gate))
    }

    fn spawn_recorder<C: CounterSource>(
        &mut self,
        counters: C,
        scope: Scope,
        writer: StreamWriter,
        ready: HandshakeSender,
        close: &[RawFd],
    ) -> Result<(), SessionError> {
        let request = self.config.attach_request(scope);
        let header = self.config.stream_header(&request);
        let recorder = Recorder::new(counters, request, header, writer, ready);
        self.children.recorder = Some(spawn_role(recorder, close)?);
        Ok(())
    }

    fn spawn_converter(&mut self, reader: StreamReader) -> Result<(), SessionError> {
        let converter = Converter::new(reader, self.config.converter_config());
        self.children.converter = Some(spawn_role(converter, &[])?);
        Ok(())
    }

    /// Recording never started and a launcher, if any, has been told not to
    /// exec. The converter was never forked, so no sample data was touched.
    fn abort_start(&mut self) -> ResultCode {
        self.advance(SessionState::Terminating);
        if let Some(recorder) = self.children.recorder.as_mut() {
            if let Err(e) = recorder.signal(Signal::SIGUSR1).and_then(|()| recorder.wait()) {
                debug!("{e}");
            }
        }
        if let Some(app) = self.children.app.as_mut() {
            if let Err(e) = app.wait() {
                debug!("{e}");
            }
        }
        ResultCode::RECORD_ERROR
    }

    /// Wait for the launched app or, without one, the recorder. Ends early on
    /// interrupt, when the duration limit passes, or when an attached
    /// process goes away.
    fn wait_for_target(&mut self, interrupt: &InterruptSource) -> Result<ResultCode, SessionError> {
        let deadline = self.config.duration.map(|d| Instant::now() + d);
        let attached = match self.config.target {
            TargetMode::AttachPid(pid) => Some(pid),
            _ => None,
        };
        let interval = self.policy.poll_interval;
        let mut reason = "interrupted";
        let mut cancel = || {
            if interrupt.interrupted() {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                reason = "duration limit reached";
                return true;
            }
            if attached.is_some_and(|pid| !Path::new(&format!("/proc/{pid}")).exists()) {
                reason = "profiled process exited";
                return true;
            }
            false
        };

        if let Some(app) = self.children.app.as_mut() {
            debug!("Waiting on profiled app {}", app.pid());
            let outcome = app.wait_until(interval, &mut cancel)?;
            let state = match outcome {
                WaitOutcome::Exited(state) => state,
                WaitOutcome::Cancelled => {
                    info!("Stopping profiled app: {reason}");
                    // Already killed by the interrupt handler on ctrl-C
                    if !interrupt.interrupted() {
                        app.signal(Signal::SIGKILL)?;
                    }
                    interrupt.forget_app();
                    app.wait()?
                }
            };
            interrupt.forget_app();
            return Ok(classify_app(state));
        }

        if self.config.duration.is_none() {
            println!("profsession: Press Ctrl-C to stop profiling");
        }
        let Some(recorder) = self.children.recorder.as_mut() else {
            return Ok(ResultCode::OK);
        };
        debug!("Waiting on recorder process {}", recorder.pid());
        match recorder.wait_until(interval, &mut cancel)? {
            WaitOutcome::Exited(state) => Ok(classify(Role::Recorder, state, ResultCode::RECORD_ERROR)),
            WaitOutcome::Cancelled => {
                info!("Stopping profiler: {reason}");
                Ok(ResultCode::OK)
            }
        }
    }

    /// Stop the recorder, then give the converter a bounded time to finish.
    /// Every step runs even if an earlier one failed.
    fn terminate_and_collect(&mut self) -> ResultCode {
        let mut result = ResultCode::OK;
        self.advance(SessionState::Converting);

        if let Some(recorder) = self.children.recorder.as_mut() {
            if !recorder.is_reaped() {
                match recorder.signal(Signal::SIGUSR1).and_then(|()| recorder.wait()) {
                    Ok(state) => result |= classify(Role::Recorder, state, ResultCode::RECORD_ERROR),
                    Err(e) => {
                        eprintln!("Attempt to stop the recorder failed: {e}");
                        recorder.kill_and_reap();
                        result |= ResultCode::RECORD_ERROR;
                    }
                }
            }
        }

        if let Some(converter) = self.children.converter.as_mut() {
            match converter.stop_with_escalation(Signal::SIGUSR1, &self.policy) {
                Ok(stopped) => {
                    if stopped.escalated {
                        eprintln!("The converter did not finish in time and was stopped");
                    }
                    let reported = stopped.state == ExitState::Exited(EXIT_REPORTED);
                    // An empty stream is the recorder's failure, already counted
                    if !(reported && result.contains(ResultCode::RECORD_ERROR)) {
                        result |= classify(Role::Converter, stopped.state, ResultCode::READ_ERROR);
                    }
                }
                Err(e) => {
                    eprintln!("Attempt to stop the converter failed: {e}");
                    converter.kill_and_reap();
                    result |= ResultCode::READ_ERROR;
                }
            }
        }

        self.advance(SessionState::Terminating);
        result
    }
}

fn classify(role: Role, state: ExitState, failure: ResultCode) -> ResultCode {
    match state {
        state if state.success() => {
            debug!("{role} process returned OK");
            ResultCode::OK
        }
        ExitState::Exited(EXIT_REPORTED) => {
            debug!("{role} process failed and has reported why");
            failure
        }
        state => {
            eprintln!("{role} process ended abnormally: {state}");
            failure
        }
    }
}

fn classify_app(state: ExitState) -> ResultCode {
    classify(Role::AppLauncher, state, ResultCode::APP_ABNORMAL_END)
}

/// One line for the user describing how the session ended
pub fn report_outcome(result: ResultCode, session_dir: &Path) {
    if result.is_ok() {
        println!(
            "\nUse '--session-dir={}'\nwith your reporting tools to view the profile data.",
            session_dir.display()
        );
    } else if result.contains(ResultCode::RECORD_ERROR) {
        eprintln!("Error running profiler");
    } else if result.contains(ResultCode::READ_ERROR) {
        eprintln!("Error converting sample data to sample file format");
    } else {
        eprintln!("WARNING: Profile results may be incomplete due to abnormal end of profiled app.");
    }
}
