//! Handing JIT dump files to the external conversion helper.
//!
//! Runs inside the converter once sample conversion is done. The helper
//! gets a short bounded window; a helper that is still running afterwards
//! is killed so the converter can exit.

use log::{debug, info, warn};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;

use crate::domain::Role;

pub const DEFAULT_JIT_HELPER: &str = "opjitconv";

/// How often and how long the bridge waits for the helper
const WAIT_ATTEMPTS: u32 = 2;
const WAIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitRequest {
    pub helper: PathBuf,
    /// Directory the helper searches for JIT dumps and writes into
    pub session_dir: PathBuf,
    /// Session start, seconds since the epoch
    pub start_time: u64,
    pub debug: bool,
    pub non_root: bool,
}

impl JitRequest {
    /// Arguments for the helper: `[-d] [--non-root] --delete-jitdumps <dir> <start> <end>`
    #[must_use]
    pub fn args(&self, end_time: u64) -> Vec<OsString> {
        let mut args = Vec::new();
        if self.debug {
            args.push("-d".into());
        }
        if self.non_root {
            args.push("--non-root".into());
        }
        args.push("--delete-jitdumps".into());
        args.push(self.session_dir.clone().into_os_string());
        args.push(self.start_time.to_string().into());
        args.push(end_time.to_string().into());
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitOutcome {
    Completed,
    Failed(ExitStatus),
    /// Still running after the wait window and killed
    Killed,
    NotStarted,
}

#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// Run the helper and wait a bounded time for it.
///
/// Failures are logged, never propagated: JIT symbols are optional.
#[must_use]
pub fn run_jit_bridge(request: &JitRequest) -> JitOutcome {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            warn!("Cannot start {}: {e}", Role::JitBridge);
            return JitOutcome::NotStarted;
        }
    };
    runtime.block_on(bridge(request))
}

async fn bridge(request: &JitRequest) -> JitOutcome {
    let mut child = match Command::new(&request.helper)
        .args(request.args(unix_now()))
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            eprintln!("Failed to exec {}: {e}", request.helper.display());
            return JitOutcome::NotStarted;
        }
    };

    for attempt in 1..=WAIT_ATTEMPTS {
        tokio::select! {
            status = child.wait() => return classify(status),
            () = tokio::time::sleep(WAIT_INTERVAL) => {
                debug!("{} still running after {attempt}s", Role::JitBridge);
            }
        }
    }

    warn!("{} did not finish, killing it", Role::JitBridge);
    if let Err(e) = child.kill().await {
        warn!("Unable to kill {}: {e}", Role::JitBridge);
    }
    JitOutcome::Killed
}

fn classify(status: std::io::Result<ExitStatus>) -> JitOutcome {
    match status {
        Ok(status) if status.success() => {
            info!("JIT dump processing complete.");
            JitOutcome::Completed
        }
        Ok(status) => {
            eprintln!("JIT dump processing exited abnormally: {status}");
            JitOutcome::Failed(status)
        }
        Err(e) => {
            warn!("Waiting for {} failed: {e}", Role::JitBridge);
            JitOutcome::Failed(ExitStatus::default())
        }
    }
}
