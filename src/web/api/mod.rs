//! API endpoints module.

pub mod agents;
pub mod status;
pub mod workflows;

pub use agents::{delete_agent, get_agent, list_agents, select_agent};
pub use status::{get_status, list_dead_letters};
pub use workflows::get_workflow;
