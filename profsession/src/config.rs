//! Session configuration, built once from validated command-line input.

use anyhow::{bail, Context, Result};
use log::debug;
use nix::unistd::{geteuid, Pid};
use profsession_common::StreamHeader;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;
use crate::converter::sample_files::Separation;
use crate::converter::ConverterConfig;
use crate::domain::EventSpec;
use crate::jit::{unix_now, JitRequest};
use crate::recorder::{AttachRequest, Scope};
use crate::tools::{detect_kernel, EventHelper, KernelImage};

/// Everything profiling data lives under this directory of the session dir
pub const DATA_DIR: &str = "oprofile_data";
const SAMPLES_DIR: &str = "samples";
/// Ring buffer data pages per CPU before the multiplier
const BASE_BUFFER_PAGES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetMode {
    LaunchApp { program: PathBuf, args: Vec<String> },
    AttachPid(Pid),
    SystemWide,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target: TargetMode,
    /// Absolute path of the session directory
    pub session_dir: PathBuf,
    pub events: Vec<EventSpec>,
    pub callgraph: bool,
    pub append: bool,
    pub separation: Separation,
    pub buffer_pages: usize,
    pub kernel: KernelImage,
    pub duration: Option<Duration>,
    pub jit_helper: Option<PathBuf>,
    /// Seconds since the epoch when the configuration was built
    pub start_time: u64,
    pub verbose: bool,
}

impl SessionConfig {
    /// Validate `args` and resolve everything the session needs up front.
    ///
    /// # Errors
    /// Returns an error for conflicting or missing targets, an unusable
    /// session directory, events the helper rejects, or a bad vmlinux
    pub fn from_args(args: &Args) -> Result<Self> {
        let target = target_mode(args)?;
        let session_dir = prepare_session_dir(args.session_dir.as_deref())?;

        let callgraph = args.callgraph;
        let (mut events, specs) = if args.events.is_empty() {
            let event = EventSpec::default_for(callgraph);
            let spec = format!("{}:{}", event.name, event.count);
            (vec![event], vec![spec])
        } else {
            let events = args.events.iter().map(|s| EventSpec::parse(s)).collect::<Result<Vec<_>, _>>()?;
            (events, args.events.clone())
        };
        EventHelper::new(&args.event_helper)
            .resolve(&mut events, &specs, callgraph)
            .context("Invalid event specification")?;

        let kernel = detect_kernel(args.vmlinux.as_deref())?;

        if args.buffer_multiplier == 0 {
            bail!("Missing required argument value: --kernel-buffersize-multiplier must be at least 1");
        }

        let config = Self {
            target,
            session_dir,
            events,
            callgraph,
            append: args.append,
            separation: Separation { thread: args.separate_thread, cpu: args.separate_cpu },
            buffer_pages: buffer_pages(args.buffer_multiplier),
            kernel,
            duration: args.duration.map(Duration::from_secs),
            jit_helper: (!args.no_jit).then(|| args.jit_helper.clone()),
            start_time: unix_now(),
            verbose: args.verbose,
        };
        debug!("{config:?}");
        Ok(config)
    }

    /// `<session-dir>/oprofile_data/samples`
    #[must_use]
    pub fn samples_dir(&self) -> PathBuf {
        self.session_dir.join(DATA_DIR).join(SAMPLES_DIR)
    }

    #[must_use]
    pub fn system_wide(&self) -> bool {
        self.target == TargetMode::SystemWide
    }

    #[must_use]
    pub fn attach_request(&self, scope: Scope) -> AttachRequest {
        AttachRequest {
            scope,
            events: self.events.clone(),
            callgraph: self.callgraph,
            buffer_pages: self.buffer_pages,
        }
    }

    #[must_use]
    pub fn stream_header(&self, request: &AttachRequest) -> StreamHeader {
        StreamHeader {
            sample_type: request.sample_type(),
            callgraph: self.callgraph,
            kernel_start: self.kernel.range.start,
            kernel_end: self.kernel.range.end,
            events: self.events.iter().map(EventSpec::describe).collect(),
        }
    }

    #[must_use]
    pub fn converter_config(&self) -> ConverterConfig {
        ConverterConfig {
            samples_dir: self.samples_dir(),
            append: self.append,
            separation: self.separation,
            kernel_image: self.kernel.name.clone(),
            jit: self.jit_helper.as_ref().map(|helper| JitRequest {
                helper: helper.clone(),
                session_dir: self.session_dir.clone(),
                start_time: self.start_time,
                debug: self.verbose,
                non_root: !geteuid().is_root(),
            }),
        }
    }
}

/// Exactly one of COMMAND, `--pid` and `--system-wide`.
///
/// # Errors
/// Returns an error if none or more than one target was given
pub fn target_mode(args: &Args) -> Result<TargetMode> {
    let given = usize::from(!args.command.is_empty()) + usize::from(args.pid.is_some()) + usize::from(args.system_wide);
    if given == 0 {
        bail!(
            "Missing required argument: COMMAND, --pid or --system-wide\n\n\
             Usage:\n  \
             profsession ./myapp [ARGS]...     Launch and profile an application\n  \
             profsession --pid 1234            Profile a running process\n  \
             profsession --system-wide         Profile the whole system\n\n\
             Run 'profsession --help' for more options"
        );
    }
    if given > 1 {
        bail!("Missing required argument: only one of COMMAND, --pid and --system-wide may be given");
    }

    if let Some(pid) = args.pid {
        if pid <= 0 {
            bail!("Invalid process ID {pid}");
        }
        return Ok(TargetMode::AttachPid(Pid::from_raw(pid)));
    }
    if args.system_wide {
        return Ok(TargetMode::SystemWide);
    }

    let (name, app_args) = args.command.split_first().context("Missing required argument: COMMAND")?;
    let path_var = env::var_os("PATH").unwrap_or_default();
    let program = resolve_program(name, &path_var)
        .with_context(|| format!("Cannot find application {name}: not a path and not found in $PATH"))?;
    Ok(TargetMode::LaunchApp { program, args: app_args.to_vec() })
}

/// Full path of `name`: as given when it contains a slash (made absolute),
/// otherwise the first executable match in `path_var`.
#[must_use]
pub fn resolve_program(name: &str, path_var: &std::ffi::OsStr) -> Option<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        let path = if path.is_absolute() { path.to_path_buf() } else { env::current_dir().ok()?.join(path) };
        return is_executable(&path).then_some(path);
    }
    env::split_paths(path_var).map(|dir| dir.join(name)).find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Absolute session directory with its data directory created.
///
/// # Errors
/// Returns an error if an explicit directory does not exist or is not a
/// directory, or the data directory cannot be created
pub fn prepare_session_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    let dir = match explicit {
        Some(dir) => {
            if !dir.is_dir() {
                bail!("Session directory {} does not exist or is not a directory", dir.display());
            }
            fs::canonicalize(dir).with_context(|| format!("Failed to resolve path: {}", dir.display()))?
        }
        None => env::current_dir().context("Cannot determine the current directory")?,
    };
    let data = dir.join(DATA_DIR);
    fs::create_dir_all(&data).with_context(|| format!("Cannot create {}", data.display()))?;
    Ok(dir)
}

/// Per-CPU ring buffer data pages; the kernel needs a power of two.
#[must_use]
pub fn buffer_pages(multiplier: usize) -> usize {
    BASE_BUFFER_PAGES.saturating_mul(multiplier.max(1)).next_power_of_two()
}
