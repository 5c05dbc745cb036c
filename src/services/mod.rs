//! Orchestration services.

pub mod browser;
pub mod emissary;
pub mod polling;
pub mod provisioning;
pub mod publisher;
pub mod scan_progress;
pub mod session_run;
pub mod session_state;
pub mod strategies;
pub mod tester;
