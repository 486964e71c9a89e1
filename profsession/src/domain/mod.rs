//! Domain model for profsession
//!
//! This module contains core domain types and errors that provide:
//! - Bit-flag aggregation of independent failures ([`ResultCode`])
//! - Role and phase tags for the session's processes
//! - Structured error handling

pub mod errors;
pub mod event;
pub mod types;

// Re-export common types for convenience
pub use event::{EventSpec, KernelRange};
pub use types::{ResultCode, Role, SessionState};

pub use errors::{
    ChannelError, ConvertError, ProcessError, RecordError, SessionError, ToolError,
};
