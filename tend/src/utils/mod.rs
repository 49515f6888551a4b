//! OS-facing helpers shared by the supervisor and the daemon.

pub mod privilege;
pub mod signals;
pub mod systemd;
