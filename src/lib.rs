//! agentmesh library root.

pub mod bus;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod heartbeat;
pub mod logging;
pub mod patterns;
pub mod protocol;
pub mod registry;
pub mod selector;
pub mod web;
pub mod worker;
pub mod workflow;

pub use bus::MessageBus;
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use engine::{Engine, ENGINE_ID};
pub use error::{Error, Result};
pub use protocol::{AgentState, EventType, Message, Priority};
pub use registry::{AgentRegistration, AgentRegistry};
pub use selector::{CapabilitySelector, SelectionRequest};
pub use worker::{Worker, WorkerRuntime};
pub use workflow::{Workflow, WorkflowCoordinator, WorkflowStatus};
