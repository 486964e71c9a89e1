//! End-to-end sessions with a fake counter source.

mod common;

use common::{config, exit_with, serial, session_child, FakeCounters, SessionProcess, APP_IMAGE, SAMPLE_FILE};
use profsession::config::TargetMode;
use profsession::domain::ResultCode;
use profsession::process::EscalationPolicy;
use profsession::session::SessionCoordinator;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn samples(dir: &Path) -> PathBuf {
    dir.join("oprofile_data/samples")
}

fn shell(script: &str) -> TargetMode {
    TargetMode::LaunchApp { program: PathBuf::from("/bin/sh"), args: vec!["-c".into(), script.into()] }
}

fn seed_current(dir: &Path) -> PathBuf {
    let old = samples(dir).join("current/{root}/old/image").join(SAMPLE_FILE);
    fs::create_dir_all(old.parent().unwrap()).unwrap();
    fs::write(&old, "0x1 1\n").unwrap();
    old
}

#[test]
fn test_system_wide_session_stops_at_duration_limit() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path(), TargetMode::SystemWide);
    cfg.duration = Some(Duration::from_secs(2));

    let started = Instant::now();
    let result = SessionCoordinator::new(cfg, FakeCounters::default()).start_session().unwrap();

    assert_eq!(result, ResultCode::OK);
    assert!(started.elapsed() >= Duration::from_secs(2));
    let file = samples(dir.path()).join("current/{root}").join(APP_IMAGE.trim_start_matches('/')).join(SAMPLE_FILE);
    let content = fs::read_to_string(file).unwrap();
    assert!(content.starts_with("0x10 "));
}

#[test]
fn test_busy_device_never_starts_app() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let old = seed_current(dir.path());
    let marker = dir.path().join("started");
    let cfg = config(dir.path(), shell(&format!("touch {}", marker.display())));

    let result = SessionCoordinator::new(cfg, FakeCounters::busy()).start_session().unwrap();

    assert!(result.contains(ResultCode::RECORD_ERROR));
    assert!(!marker.exists());
    // No converter ran, so nothing was rotated
    assert!(old.exists());
    assert!(!samples(dir.path()).join("previous").exists());
}

#[test]
fn test_launched_app_runs_after_handshake() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    seed_current(dir.path());
    let marker = dir.path().join("started");
    let cfg = config(dir.path(), shell(&format!("touch {}", marker.display())));

    let result = SessionCoordinator::new(cfg, FakeCounters::default()).start_session().unwrap();

    assert_eq!(result, ResultCode::OK);
    assert!(marker.exists());
    let previous = samples(dir.path()).join("previous/{root}/old/image").join(SAMPLE_FILE);
    assert!(previous.exists());
}

#[test]
fn test_failing_app_is_reported() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path(), shell("exit 3"));

    let result = SessionCoordinator::new(cfg, FakeCounters::default()).start_session().unwrap();

    assert_eq!(result, ResultCode::APP_ABNORMAL_END);
    assert_eq!(result.exit_code(), 1);
}

#[test]
fn test_long_running_app_is_killed_at_duration_limit() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path(), shell("exec sleep 30"));
    cfg.duration = Some(Duration::from_millis(500));
    let policy = EscalationPolicy { grace: Duration::from_secs(2), poll_interval: Duration::from_millis(20) };

    let started = Instant::now();
    let result = SessionCoordinator::new(cfg, FakeCounters::default()).with_policy(policy).start_session().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result, ResultCode::APP_ABNORMAL_END);
}

fn sample_file(dir: &Path) -> PathBuf {
    samples(dir).join("current/{root}").join(APP_IMAGE.trim_start_matches('/')).join(SAMPLE_FILE)
}

#[test]
fn test_interrupt_ends_system_wide_session_cleanly() {
    if let Some(dir) = session_child() {
        let cfg = config(&dir, TargetMode::SystemWide);
        exit_with(SessionCoordinator::new(cfg, FakeCounters::default()).start_session());
    }
    let _serial = serial();
    let dir = TempDir::new().unwrap();

    let mut session = SessionProcess::spawn("test_interrupt_ends_system_wide_session_cleanly", dir.path());
    session.wait_until_started();
    std::thread::sleep(Duration::from_millis(500));
    session.interrupt();
    let output = session.finish();

    assert_eq!(output.code, Some(0), "stderr:\n{}", output.stderr);
    assert!(output.stdout.contains("--session-dir="));
    assert!(fs::read_to_string(sample_file(dir.path())).unwrap().starts_with("0x10 "));
}

#[test]
fn test_interrupt_kills_launched_app() {
    if let Some(dir) = session_child() {
        let script = format!("echo $$ > {}; exec sleep 30", dir.join("app.pid").display());
        let cfg = config(&dir, shell(&script));
        exit_with(SessionCoordinator::new(cfg, FakeCounters::default()).start_session());
    }
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("app.pid");

    let started = Instant::now();
    let mut session = SessionProcess::spawn("test_interrupt_kills_launched_app", dir.path());
    session.wait_until_started();
    while fs::read_to_string(&pid_file).map_or(true, |p| !p.ends_with('\n')) {
        assert!(started.elapsed() < Duration::from_secs(10), "app never started");
        std::thread::sleep(Duration::from_millis(20));
    }
    session.interrupt();
    let output = session.finish();

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(output.code, Some(ResultCode::APP_ABNORMAL_END.exit_code()), "stderr:\n{}", output.stderr);
    assert!(output.stderr.contains("abnormal end of profiled app"));
    let app = fs::read_to_string(&pid_file).unwrap();
    assert!(!Path::new(&format!("/proc/{}", app.trim())).exists());
}

#[test]
fn test_second_interrupt_during_teardown_is_survived() {
    if let Some(dir) = session_child() {
        let mut cfg = config(&dir, TargetMode::SystemWide);
        cfg.jit_helper = Some(dir.join("jit.sh"));
        exit_with(SessionCoordinator::new(cfg, FakeCounters::default()).start_session());
    }
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let helper = dir.path().join("jit.sh");
    fs::write(&helper, "#!/bin/sh\nsleep 1\ntouch \"$(dirname \"$0\")/jit-done\"\n").unwrap();
    fs::set_permissions(&helper, fs::Permissions::from_mode(0o755)).unwrap();

    let mut session = SessionProcess::spawn("test_second_interrupt_during_teardown_is_survived", dir.path());
    session.wait_until_started();
    std::thread::sleep(Duration::from_millis(300));
    session.interrupt();
    // The converter is now running the slow JIT helper
    std::thread::sleep(Duration::from_millis(300));
    session.interrupt();
    let output = session.finish();

    assert_eq!(output.code, Some(0), "stderr:\n{}", output.stderr);
    assert!(dir.path().join("jit-done").exists());
}

#[test]
fn test_busy_device_is_reported_once() {
    if let Some(dir) = session_child() {
        let cfg = config(&dir, TargetMode::SystemWide);
        exit_with(SessionCoordinator::new(cfg, FakeCounters::busy()).start_session());
    }
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let old = seed_current(dir.path());

    let output = SessionProcess::spawn("test_busy_device_is_reported_once", dir.path()).finish();

    assert_eq!(output.code, Some(ResultCode::RECORD_ERROR.exit_code()));
    assert!(!output.stdout.contains("Profiler started"));
    let lines = output.stderr_lines();
    assert_eq!(lines.iter().filter(|l| l.contains("busy")).count(), 1, "{lines:?}");
    assert!(!lines.iter().any(|l| l.contains("abnormally")), "{lines:?}");
    assert_eq!(lines.len(), 2, "{lines:?}");
    assert!(old.exists());
}
