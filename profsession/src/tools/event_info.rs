//! Validating event specifications with the event-info helper.
//!
//! `<helper> --check-events <spec> [--callgraph=1]` prints something for a
//! valid spec and nothing for an invalid one. `<helper> <name>` prints the
//! event's numeric code.

use log::debug;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::domain::{EventSpec, ToolError};

pub const DEFAULT_EVENT_HELPER: &str = "ophelp";

#[derive(Debug, Clone)]
pub struct EventHelper {
    program: PathBuf,
}

impl EventHelper {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn tool(&self) -> String {
        self.program.display().to_string()
    }

    fn stdout_of(&self, args: &[String]) -> Result<String, ToolError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| ToolError::Spawn { tool: self.tool(), source })?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Check that the helper accepts `spec`.
    ///
    /// # Errors
    /// Returns an error if the helper cannot run or prints nothing
    pub fn check_event(&self, spec: &str, callgraph: bool) -> Result<(), ToolError> {
        let mut args = vec!["--check-events".to_string(), spec.to_string()];
        if callgraph {
            args.push("--callgraph=1".to_string());
        }
        if self.stdout_of(&args)?.is_empty() {
            let mut detail = format!("Error retrieving info for event {spec}");
            if callgraph {
                detail.push_str(
                    "\nNote: When doing callgraph profiling, the sample count must be\n\
                     15 times the minimum count value for the event.",
                );
            }
            return Err(ToolError::Failed { tool: self.tool(), detail });
        }
        Ok(())
    }

    /// Numeric code for event `name`.
    ///
    /// # Errors
    /// Returns an error if the helper cannot run or prints no number
    pub fn event_code(&self, name: &str) -> Result<u64, ToolError> {
        let stdout = self.stdout_of(&[name.to_string()])?;
        parse_event_code(&stdout).ok_or_else(|| ToolError::Parse {
            tool: self.tool(),
            detail: format!("Unable to find info for event {name}"),
        })
    }

    /// Validate every event and fill in its code.
    ///
    /// `specs` are the strings the events were parsed from, checked as given.
    ///
    /// # Errors
    /// Returns the first helper failure
    pub fn resolve(&self, events: &mut [EventSpec], specs: &[String], callgraph: bool) -> Result<(), ToolError> {
        for spec in specs {
            self.check_event(spec, callgraph)?;
        }
        for event in events.iter_mut() {
            event.code = self.event_code(&event.name)?;
            debug!("Event {} has code {:#x}", event.name, event.code);
        }
        Ok(())
    }
}

/// The code is the leading number of the helper's output.
fn parse_event_code(stdout: &str) -> Option<u64> {
    let token = stdout.split_whitespace().next()?;
    match token.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}
