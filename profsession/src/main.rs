//! # profsession - Main Entry Point
//!
//! Parses arguments, builds the session configuration, runs the pre-flight
//! checks and hands over to the coordinator. The exit status is the
//! session's result code, or one of the setup codes below when the session
//! never started.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use profsession::cli::Args;
use profsession::config::SessionConfig;
use profsession::preflight::run_preflight_checks;
use profsession::recorder::PerfCounters;
use profsession::session::SessionCoordinator;

// Exit codes for failures before the session starts
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    std::process::exit(match run(&args) {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run(args: &Args) -> Result<i32> {
    let config = SessionConfig::from_args(args)?;
    run_preflight_checks(&config)?;

    info!("profsession v{}", env!("CARGO_PKG_VERSION"));
    for event in &config.events {
        info!("event: {event}");
    }

    let result = SessionCoordinator::new(config, PerfCounters::new())
        .start_session()
        .context("Internal error setting up the profiling session")?;
    Ok(result.exit_code())
}
