//! Core value types shared by the coordination protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Event classification carried by every message.
///
/// Unknown event names round-trip through [`EventType::Custom`], so agents
/// can subscribe to event types the engine knows nothing about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    Broadcast,
    Heartbeat,
    Error,
    Coordination,
    ParallelTask,
    SequentialTask,
    HierarchicalCoordination,
    EmergentInitialization,
    WorkflowFailed,
    #[serde(untagged)]
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::TaskRequest => "task_request",
            EventType::TaskResponse => "task_response",
            EventType::StatusUpdate => "status_update",
            EventType::Broadcast => "broadcast",
            EventType::Heartbeat => "heartbeat",
            EventType::Error => "error",
            EventType::Coordination => "coordination",
            EventType::ParallelTask => "parallel_task",
            EventType::SequentialTask => "sequential_task",
            EventType::HierarchicalCoordination => "hierarchical_coordination",
            EventType::EmergentInitialization => "emergent_initialization",
            EventType::WorkflowFailed => "workflow_failed",
            EventType::Custom(name) => name,
        }
    }

    /// Parse an event name, falling back to [`EventType::Custom`].
    pub fn parse(name: &str) -> Self {
        let normalized = name.trim().to_lowercase();
        serde_json::from_value(serde_json::Value::String(normalized.clone()))
            .unwrap_or(EventType::Custom(normalized))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message priority, a small bounded integer where higher is more urgent.
///
/// Values outside `0..=10` are clamped on construction and on deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const LOW: Priority = Priority(1);
    pub const BROADCAST: Priority = Priority(3);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(8);
    pub const MAX: Priority = Priority(10);

    pub fn new(value: i64) -> Self {
        Priority(value.clamp(Self::MIN.0 as i64, Self::MAX.0 as i64) as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i64> for Priority {
    fn from(value: i64) -> Self {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Running,
    Busy,
    Error,
    Disconnected,
}

impl AgentState {
    /// Whether the selector may hand new work to an agent in this state.
    pub fn accepts_work(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Running => "running",
            AgentState::Busy => "busy",
            AgentState::Error => "error",
            AgentState::Disconnected => "disconnected",
        }
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
