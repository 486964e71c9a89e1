//! Running a profiling session across its cooperating processes.

pub mod coordinator;
pub mod gate;

pub use coordinator::{report_outcome, SessionCoordinator};
pub use gate::LaunchGate;
