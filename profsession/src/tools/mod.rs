//! External helper programs consulted while building a session.

pub mod event_info;
pub mod kernel_text;

pub use event_info::{EventHelper, DEFAULT_EVENT_HELPER};
pub use kernel_text::{detect as detect_kernel, KernelImage, NO_VMLINUX};
