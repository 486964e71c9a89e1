//! Forking a role into its own process.
#![allow(unsafe_code)]

use log::debug;
use nix::unistd::{close, fork, ForkResult};
use std::io::Write;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::handle::ProcessHandle;
use crate::domain::{ProcessError, Role};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// Failed, and the user has already been told why
pub const EXIT_REPORTED: i32 = 3;

/// Work that runs in a dedicated child process.
///
/// The value is built in the coordinator, moved into the child by fork and
/// dropped in the parent. Anything the role owns (pipe ends in particular)
/// is therefore closed in the coordinator as soon as the child exists.
pub trait ChildRole {
    const ROLE: Role;

    /// Body of the child. The return value becomes its exit status.
    fn run(self) -> i32;
}

/// Fork a child that runs `role` and then exits.
///
/// `close_in_child` lists coordinator descriptors the child must not keep
/// open, most importantly other copies of the sample stream writer.
///
/// # Errors
/// Returns an error if fork fails
pub fn spawn_role<R: ChildRole>(role: R, close_in_child: &[RawFd]) -> Result<ProcessHandle, ProcessError> {
    // The coordinator is single-threaded while the session is running.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            for &fd in close_in_child {
                let _ = close(fd);
            }
            let code = catch_unwind(AssertUnwindSafe(|| role.run())).unwrap_or(EXIT_FAILURE);
            exit_child(code)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(role);
            debug!("Started {} process {child}", R::ROLE);
            Ok(ProcessHandle::new(child, R::ROLE))
        }
        Err(source) => Err(ProcessError::Fork { role: R::ROLE, source }),
    }
}

/// Leave a forked child without running the parent's exit handlers.
pub fn exit_child(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    unsafe { libc::_exit(code) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{handshake_pipe, HandshakeSender};
    use crate::process::ExitState;
    use std::os::fd::AsRawFd;

    struct Reporter {
        tx: HandshakeSender,
        code: i32,
    }

    impl ChildRole for Reporter {
        const ROLE: Role = Role::Recorder;

        fn run(mut self) -> i32 {
            if self.tx.send(7).is_err() {
                return EXIT_FAILURE;
            }
            self.code
        }
    }

    struct Panics;

    impl ChildRole for Panics {
        const ROLE: Role = Role::Converter;

        fn run(self) -> i32 {
            panic!("role failed");
        }
    }

    #[test]
    fn test_child_runs_role_and_exits_with_its_code() {
        let _serial = crate::test_support::serial();
        let (tx, mut rx) = handshake_pipe().unwrap();
        let mut handle = spawn_role(Reporter { tx, code: 5 }, &[rx.as_raw_fd()]).unwrap();
        assert_eq!(handle.role(), Role::Recorder);
        assert_eq!(rx.recv().unwrap(), Some(7));
        assert_eq!(rx.recv().unwrap(), None);
        assert_eq!(handle.wait().unwrap(), ExitState::Exited(5));
    }

    #[test]
    fn test_panicking_role_exits_with_failure() {
        let _serial = crate::test_support::serial();
        let mut handle = spawn_role(Panics, &[]).unwrap();
        assert_eq!(handle.wait().unwrap(), ExitState::Exited(EXIT_FAILURE));
    }
}
