//! Child process management: forking roles, reaping and signals.

pub mod handle;
pub mod role;
pub mod signals;

pub use handle::{EscalationPolicy, ExitState, ProcessHandle, Stopped, WaitOutcome};
pub use role::{exit_child, spawn_role, ChildRole, EXIT_FAILURE, EXIT_REPORTED, EXIT_SUCCESS};
