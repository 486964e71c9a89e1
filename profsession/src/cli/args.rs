//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::jit::DEFAULT_JIT_HELPER;
use crate::tools::DEFAULT_EVENT_HELPER;

#[derive(Parser, Debug, Default)]
#[command(
    name = "profsession",
    about = "Profile an application, a running process or the whole system with performance counters",
    after_help = "\
EXAMPLES:
    profsession ./myapp --flag              Launch and profile an application
    sudo profsession --pid 1234             Profile a running process (Ctrl-C to stop)
    sudo profsession --system-wide --duration 10
                                            Profile every CPU for ten seconds"
)]
pub struct Args {
    /// Directory for the profile data (default: current directory)
    #[arg(short = 'd', long, value_name = "DIR")]
    pub session_dir: Option<PathBuf>,

    /// Uncompressed kernel image used to locate kernel text
    #[arg(short = 'k', long, value_name = "FILE")]
    pub vmlinux: Option<PathBuf>,

    /// Record call chains
    #[arg(short = 'g', long)]
    pub callgraph: bool,

    /// Profile all processes on all CPUs (requires root)
    #[arg(short = 's', long, conflicts_with = "pid")]
    pub system_wide: bool,

    /// Add to the existing samples instead of starting a new profile
    #[arg(short = 'a', long)]
    pub append: bool,

    /// Profile an already running process
    #[arg(short = 'p', long)]
    pub pid: Option<i32>,

    /// Multiplier for the per-CPU kernel sample buffer
    #[arg(short = 'b', long = "kernel-buffersize-multiplier", default_value_t = 1, value_name = "N")]
    pub buffer_multiplier: usize,

    /// Events as name:count[:unitmask[:kernel[:user]]], comma separated
    #[arg(short = 'e', long, value_delimiter = ',', value_name = "EVENTS")]
    pub events: Vec<String>,

    /// Keep samples from each CPU separate
    #[arg(short = 'c', long)]
    pub separate_cpu: bool,

    /// Keep samples from each thread separate
    #[arg(short = 't', long)]
    pub separate_thread: bool,

    /// Stop after N seconds
    #[arg(long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Program that converts JIT dump files after the run
    #[arg(long, value_name = "PROGRAM", default_value = DEFAULT_JIT_HELPER)]
    pub jit_helper: PathBuf,

    /// Skip JIT dump conversion
    #[arg(long)]
    pub no_jit: bool,

    /// Program that validates events and looks up their codes
    #[arg(long, value_name = "PROGRAM", default_value = DEFAULT_EVENT_HELPER)]
    pub event_helper: PathBuf,

    /// Debug logging
    #[arg(short = 'V', long)]
    pub verbose: bool,

    /// Application to launch, followed by its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}
