//! The process that becomes the profiled application.
//!
//! The launcher reports that it is ready, then waits for the coordinator's
//! decision. On `1` it execs the application, so the recorder (attached
//! to the launcher's pid with enable-on-exec) starts counting exactly at
//! the program's first instruction. On `0` or EOF it exits without
//! running anything.

use log::debug;
use nix::unistd::execvp;
use std::ffi::{CStr, CString};
use std::path::Path;

use crate::domain::{Role, SessionError};
use crate::ipc::{HandshakeReceiver, HandshakeSender, READY};
use crate::process::{signals, ChildRole, EXIT_FAILURE};

pub struct AppLauncher {
    program: CString,
    argv: Vec<CString>,
    ready: HandshakeSender,
    start: HandshakeReceiver,
}

impl AppLauncher {
    /// `program` should already be resolved; argv\[0\] is its file name.
    ///
    /// # Errors
    /// Returns an error if the program path or an argument contains a NUL byte
    pub fn new(
        program: &Path,
        args: &[String],
        ready: HandshakeSender,
        start: HandshakeReceiver,
    ) -> Result<Self, SessionError> {
        let to_c = |s: &str| {
            CString::new(s).map_err(|_| SessionError::InvalidArgument {
                what: "application command",
                detail: format!("{s:?} contains a NUL byte"),
            })
        };

        let program_str = program.to_string_lossy();
        let name = program.file_name().map_or(program_str.clone(), |n| n.to_string_lossy());
        let mut argv = vec![to_c(&name)?];
        for arg in args {
            argv.push(to_c(arg)?);
        }

        Ok(Self { program: to_c(&program_str)?, argv, ready, start })
    }
}

impl ChildRole for AppLauncher {
    const ROLE: Role = Role::AppLauncher;

    fn run(mut self) -> i32 {
        // An exec that always fails, made before reporting ready. Whatever
        // one-time work the loader path does happens now rather than while
        // counters are running.
        let _ = execvp(c"", &self.argv);

        if let Err(e) = self.ready.send(READY) {
            eprintln!("Internal error on app ready pipe: {e}");
            return EXIT_FAILURE;
        }
        drop(self.ready);

        match self.start.recv() {
            Ok(Some(READY)) => {}
            Ok(value) => {
                debug!("Launch of {:?} cancelled ({value:?})", self.program);
                return EXIT_FAILURE;
            }
            Err(e) => {
                eprintln!("Internal error on start pipe: {e}");
                return EXIT_FAILURE;
            }
        }

        if let Err(e) = signals::restore_defaults_for_exec() {
            eprintln!("{e}");
            return EXIT_FAILURE;
        }

        let err = match execvp(&self.program, &self.argv) {
            Ok(never) => match never {},
            Err(e) => e,
        };
        eprintln!("Failed to run {}: {err}", program_name(&self.program));
        EXIT_FAILURE
    }
}

fn program_name(program: &CStr) -> String {
    program.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{handshake_pipe, ABORT};
    use crate::process::{spawn_role, ExitState};
    use std::os::fd::AsRawFd;
    use tempfile::TempDir;

    fn launch_touch(marker: &Path) -> (crate::process::ProcessHandle, HandshakeReceiver, HandshakeSender) {
        let (ready_tx, ready_rx) = handshake_pipe().unwrap();
        let (start_tx, start_rx) = handshake_pipe().unwrap();
        let launcher = AppLauncher::new(
            Path::new("/bin/sh"),
            &["-c".to_string(), format!("touch {}", marker.display())],
            ready_tx,
            start_rx,
        )
        .unwrap();
        let handle = spawn_role(launcher, &[ready_rx.as_raw_fd(), start_tx.as_raw_fd()]).unwrap();
        (handle, ready_rx, start_tx)
    }

    #[test]
    fn test_proceed_runs_application() {
        let _serial = crate::test_support::serial();
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let (mut handle, mut ready_rx, mut start_tx) = launch_touch(&marker);

        assert_eq!(ready_rx.recv().unwrap(), Some(READY));
        start_tx.send(READY).unwrap();
        assert_eq!(handle.wait().unwrap(), ExitState::Exited(0));
        assert!(marker.exists());
    }

    #[test]
    fn test_abort_never_runs_application() {
        let _serial = crate::test_support::serial();
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let (mut handle, mut ready_rx, mut start_tx) = launch_touch(&marker);

        assert_eq!(ready_rx.recv().unwrap(), Some(READY));
        start_tx.send(ABORT).unwrap();
        assert_eq!(handle.wait().unwrap(), ExitState::Exited(EXIT_FAILURE));
        assert!(!marker.exists());
    }

    #[test]
    fn test_closed_start_pipe_never_runs_application() {
        let _serial = crate::test_support::serial();
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let (mut handle, _ready_rx, start_tx) = launch_touch(&marker);

        drop(start_tx);
        assert_eq!(handle.wait().unwrap(), ExitState::Exited(EXIT_FAILURE));
        assert!(!marker.exists());
    }

    #[test]
    fn test_nul_in_argument_is_rejected() {
        let (ready_tx, _ready_rx) = handshake_pipe().unwrap();
        let (_start_tx, start_rx) = handshake_pipe().unwrap();
        let res = AppLauncher::new(Path::new("/bin/true"), &["a\0b".to_string()], ready_tx, start_rx);
        assert!(matches!(res, Err(SessionError::InvalidArgument { .. })));
    }
}
