//! # profsession - Multi-process Profiling Session Coordinator
//!
//! profsession samples hardware performance counters for a launched
//! application, an existing process or the whole system, and turns the raw
//! samples into per-image sample files. The work is split across processes
//! that fail independently; the coordinator combines their outcomes into a
//! single [`domain::ResultCode`].
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        SessionCoordinator                        │
//! │   pipes + fork ─ launch gate ─ primary wait ─ stop & collect     │
//! └──────┬───────────────────┬─────────────────────────┬─────────────┘
//!        │ fork              │ fork                    │ fork
//!        ▼                   ▼                         ▼
//! ┌──────────────┐    ┌──────────────┐  sample   ┌──────────────┐
//! │ AppLauncher  │    │   Recorder   │  stream   │  Converter   │
//! │ (exec app on │    │ perf_event + │─────────▶│ sample files │
//! │  start = 1)  │    │ ring buffers │   pipe    │ + JIT helper │
//! └──────────────┘    └──────────────┘           └──────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`session`]: the coordinator and the launch gate
//! - [`launcher`], [`recorder`], [`converter`]: the child roles
//! - [`jit`]: bounded run of the JIT dump conversion helper
//! - [`process`]: forking roles, reaping, signal dispositions
//! - [`ipc`]: handshake pipes and the sample stream
//! - [`config`], [`cli`], [`preflight`]: turning arguments into a session
//! - [`tools`]: the event-info and kernel-text helpers
//! - [`domain`]: result codes, roles, events, errors
//!
//! ## Exit Status
//!
//! The process exits with the session's result code: the OR of
//! app-abnormal-end (1), record error (2) and read error (4), with record
//! plus read error reported as 8.

pub mod cli;
pub mod config;
pub mod converter;
pub mod domain;
pub mod ipc;
pub mod jit;
pub mod launcher;
pub mod preflight;
pub mod process;
pub mod recorder;
pub mod session;
pub mod tools;
