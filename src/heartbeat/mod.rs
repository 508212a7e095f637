//! Agent liveness monitoring.

pub mod monitor;

pub use monitor::{announce_state_change, recover, HeartbeatMonitor, SweepReport};
