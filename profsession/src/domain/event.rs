//! Hardware event selection and the kernel text range.

use profsession_common::EventDesc;
use std::fmt;

use super::errors::SessionError;

/// Event used when none is given on the command line
pub const DEFAULT_EVENT: &str = "CPU_CLK_UNHALTED";
pub const DEFAULT_COUNT: u64 = 100_000;
/// Callgraph sampling is more expensive; the default count is raised by this factor
pub const CALLGRAPH_COUNT_FACTOR: u64 = 15;
pub const DEFAULT_CALLGRAPH_BASE_COUNT: u64 = 6_000;

/// One hardware event to count, from `name:count[:unitmask[:kernel[:user]]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    pub name: String,
    /// Sample every `count` occurrences
    pub count: u64,
    pub unit_mask: u32,
    /// Numeric event code, filled in from the event helper
    pub code: u64,
    pub kernel: bool,
    pub user: bool,
}

impl EventSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, count: u64) -> Self {
        Self { name: name.into(), count, unit_mask: 0, code: 0, kernel: true, user: true }
    }

    /// The default event for a session
    #[must_use]
    pub fn default_for(callgraph: bool) -> Self {
        let count = if callgraph {
            DEFAULT_CALLGRAPH_BASE_COUNT * CALLGRAPH_COUNT_FACTOR
        } else {
            DEFAULT_COUNT
        };
        Self::new(DEFAULT_EVENT, count)
    }

    /// Parse one event specification.
    ///
    /// # Errors
    /// Returns an error if a field is missing or not a number
    pub fn parse(spec: &str) -> Result<Self, SessionError> {
        let invalid = |detail: String| SessionError::InvalidArgument { what: "--events", detail };

        let mut fields = spec.split(':');
        let name = fields.next().filter(|n| !n.is_empty()).ok_or_else(|| invalid(format!("{spec:?} has no event name")))?;
        let count = fields
            .next()
            .ok_or_else(|| invalid(format!("{spec:?} has no count")))?
            .parse::<u64>()
            .map_err(|e| invalid(format!("bad count in {spec:?}: {e}")))?;
        if count == 0 {
            return Err(invalid(format!("count in {spec:?} must be positive")));
        }

        let mut event = Self::new(name, count);
        if let Some(um) = fields.next().filter(|s| !s.is_empty()) {
            event.unit_mask = parse_unit_mask(um).map_err(|e| invalid(format!("bad unit mask in {spec:?}: {e}")))?;
        }
        if let Some(flag) = fields.next() {
            event.kernel = parse_flag(flag).ok_or_else(|| invalid(format!("kernel flag in {spec:?} must be 0 or 1")))?;
        }
        if let Some(flag) = fields.next() {
            event.user = parse_flag(flag).ok_or_else(|| invalid(format!("user flag in {spec:?} must be 0 or 1")))?;
        }
        if fields.next().is_some() {
            return Err(invalid(format!("{spec:?} has too many fields")));
        }
        Ok(event)
    }

    /// `config` value for a raw hardware event
    #[must_use]
    pub fn raw_config(&self) -> u64 {
        self.code | (u64::from(self.unit_mask) << 8)
    }

    #[must_use]
    pub fn describe(&self) -> EventDesc {
        EventDesc {
            name: self.name.clone(),
            count: self.count,
            unit_mask: self.unit_mask,
            code: self.code,
        }
    }
}

impl fmt::Display for EventSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{:#x}:{}:{}",
            self.name,
            self.count,
            self.unit_mask,
            u8::from(self.kernel),
            u8::from(self.user)
        )
    }
}

fn parse_unit_mask(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

/// Address range of the kernel's text section. Empty when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelRange {
    pub start: u64,
    pub end: u64,
}

impl KernelRange {
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.end > self.start
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}
