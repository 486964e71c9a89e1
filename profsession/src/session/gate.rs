//! The launch gate: the profiled application starts only once both the
//! launcher and the recorder have said they are ready.

use log::debug;
use std::os::fd::{AsRawFd, RawFd};

use crate::domain::Role;
use crate::ipc::{HandshakeReceiver, HandshakeSender, ABORT, READY};

/// Coordinator ends of the three launch handshakes
pub struct LaunchGate {
    app_ready: HandshakeReceiver,
    recorder_ready: HandshakeReceiver,
    start: HandshakeSender,
}

impl LaunchGate {
    #[must_use]
    pub fn new(app_ready: HandshakeReceiver, recorder_ready: HandshakeReceiver, start: HandshakeSender) -> Self {
        Self { app_ready, recorder_ready, start }
    }

    /// Descriptors no child other than their peers may keep open
    #[must_use]
    pub fn raw_fds(&self) -> [RawFd; 3] {
        [self.app_ready.as_raw_fd(), self.recorder_ready.as_raw_fd(), self.start.as_raw_fd()]
    }

    /// Wait for the launcher, then the recorder. Tells the launcher to exec
    /// (`1`) only if both reported ready, otherwise to give up (`0`).
    pub fn await_launch_readiness(self) -> bool {
        let Self { app_ready, recorder_ready, mut start } = self;

        let ready = observe(app_ready, Role::AppLauncher) && observe(recorder_ready, Role::Recorder);
        let value = if ready { READY } else { ABORT };
        debug!("Telling the launcher to {}", if ready { "start the app" } else { "abort" });

        match start.send(value) {
            Ok(()) => ready,
            Err(e) if ready => {
                eprintln!("Internal error starting the profiled app: {e}");
                false
            }
            Err(e) => {
                debug!("Launcher already gone: {e}");
                false
            }
        }
    }
}

/// Without an app to launch only the recorder's readiness matters.
pub fn await_recorder_readiness(recorder_ready: HandshakeReceiver) -> bool {
    observe(recorder_ready, Role::Recorder)
}

fn observe(mut receiver: HandshakeReceiver, role: Role) -> bool {
    match receiver.recv() {
        Ok(Some(READY)) => true,
        // The peer printed its own reason
        Ok(Some(ABORT)) => {
            debug!("{role} reported it cannot start");
            false
        }
        Ok(Some(value)) => {
            eprintln!("{role} is not ready to start (reported {value}); exiting");
            false
        }
        Ok(None) => {
            eprintln!("{role} ended before it was ready; exiting");
            false
        }
        Err(e) => {
            eprintln!("Internal error waiting for the {role}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::handshake_pipe;

    struct Peers {
        app: HandshakeSender,
        recorder: HandshakeSender,
        start: HandshakeReceiver,
    }

    fn gate() -> (LaunchGate, Peers) {
        let (app, app_ready) = handshake_pipe().unwrap();
        let (recorder, recorder_ready) = handshake_pipe().unwrap();
        let (start_tx, start) = handshake_pipe().unwrap();
        (LaunchGate::new(app_ready, recorder_ready, start_tx), Peers { app, recorder, start })
    }

    #[test]
    fn test_both_ready_releases_app() {
        let _serial = crate::test_support::serial();
        let (gate, mut peers) = gate();
        peers.app.send(READY).unwrap();
        peers.recorder.send(READY).unwrap();
        assert!(gate.await_launch_readiness());
        assert_eq!(peers.start.recv().unwrap(), Some(READY));
    }

    #[test]
    fn test_recorder_failure_aborts_app() {
        let _serial = crate::test_support::serial();
        let (gate, mut peers) = gate();
        peers.app.send(READY).unwrap();
        peers.recorder.send(ABORT).unwrap();
        assert!(!gate.await_launch_readiness());
        assert_eq!(peers.start.recv().unwrap(), Some(ABORT));
    }

    #[test]
    fn test_recorder_readiness_without_app() {
        let _serial = crate::test_support::serial();
        let (mut tx, rx) = handshake_pipe().unwrap();
        tx.send(READY).unwrap();
        assert!(await_recorder_readiness(rx));

        let (mut tx, rx) = handshake_pipe().unwrap();
        tx.send(ABORT).unwrap();
        assert!(!await_recorder_readiness(rx));

        let (tx, rx) = handshake_pipe().unwrap();
        drop(tx);
        assert!(!await_recorder_readiness(rx));
    }

    #[test]
    fn test_launcher_gone_is_not_ready() {
        let _serial = crate::test_support::serial();
        let (gate, peers) = gate();
        let Peers { app, recorder: _recorder, mut start } = peers;
        drop(app);
        // The recorder is never consulted, so its silence does not block.
        assert!(!gate.await_launch_readiness());
        assert_eq!(start.recv().unwrap(), Some(ABORT));
    }
}
