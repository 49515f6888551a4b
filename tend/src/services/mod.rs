//! Daemon services.
//!
//! - **Supervisor**: owns the running tasks and their processes
//! - **Control**: the socket protocol CLI invocations use to drive the supervisor

pub mod control;
pub mod supervisor;
