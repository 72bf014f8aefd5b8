//! External process invocation for the renderer.
//!
//! [`executor::CommandRunner`] resolves a program once and runs it per job;
//! [`subprocess::run_command`] handles the spawn, stdin payload, output
//! capture, and wall-clock timeout.

pub mod executor;
pub mod subprocess;
