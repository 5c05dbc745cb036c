//! Domain models: jobs, per-session SUTs, provisioning items and scan state.

pub mod job;
pub mod provisioning;
pub mod scan;
pub mod session;
pub mod sut;
