//! Execution patterns: choreographies for handing one task to many agents.

pub mod emergent;
pub mod hierarchical;
pub mod parallel;
pub mod sequential;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::MessageBus;
use crate::error::{Error, Result};
use crate::protocol::{EventType, Message, Priority};
use crate::registry::Agent;

pub use emergent::EmergentExecution;
pub use hierarchical::HierarchicalExecution;
pub use parallel::ParallelExecution;
pub use sequential::SequentialExecution;

/// What a pattern needs from the engine.
#[derive(Clone)]
pub struct PatternContext {
    pub bus: Arc<MessageBus>,
    pub engine_id: String,
    pub response_timeout: Duration,
}

impl PatternContext {
    pub fn new(bus: Arc<MessageBus>, engine_id: impl Into<String>, response_timeout: Duration) -> Self {
        Self {
            bus,
            engine_id: engine_id.into(),
            response_timeout,
        }
    }

    /// Send a task message to one agent and wait for its reply.
    pub(crate) async fn dispatch(
        &self,
        agent_id: &str,
        event_type: EventType,
        priority: Priority,
        payload: Value,
    ) -> PatternResult {
        let message = Message::new(event_type, self.engine_id.as_str(), payload)
            .to(agent_id)
            .with_priority(priority);

        let outcome = match self.bus.request(message, self.response_timeout).await {
            Ok(reply) if reply.event_type == EventType::Error => PatternOutcome::Failed {
                error: reply
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("agent reported an error")
                    .to_string(),
            },
            Ok(reply) => PatternOutcome::Completed { response: reply },
            Err(e) => PatternOutcome::Failed { error: e.to_string() },
        };
        PatternResult {
            agent_id: agent_id.to_string(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PatternOutcome {
    Completed { response: Message },
    Failed { error: String },
    /// Handed off without waiting for completion.
    Dispatched { message_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternResult {
    pub agent_id: String,
    #[serde(flatten)]
    pub outcome: PatternOutcome,
}

impl PatternResult {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, PatternOutcome::Failed { .. })
    }

    pub fn response(&self) -> Option<&Message> {
        match &self.outcome {
            PatternOutcome::Completed { response } => Some(response),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Parallel,
    Sequential,
    Hierarchical,
    Emergent,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Parallel => "parallel",
            PatternKind::Sequential => "sequential",
            PatternKind::Hierarchical => "hierarchical",
            PatternKind::Emergent => "emergent",
        }
    }

    pub fn pattern(&self) -> Box<dyn ExecutionPattern> {
        match self {
            PatternKind::Parallel => Box::new(ParallelExecution),
            PatternKind::Sequential => Box::new(SequentialExecution),
            PatternKind::Hierarchical => Box::new(HierarchicalExecution),
            PatternKind::Emergent => Box::new(EmergentExecution),
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "parallel" => Ok(PatternKind::Parallel),
            "sequential" => Ok(PatternKind::Sequential),
            "hierarchical" => Ok(PatternKind::Hierarchical),
            "emergent" => Ok(PatternKind::Emergent),
            other => Err(Error::Other(format!("unknown execution pattern '{}'", other))),
        }
    }
}

#[async_trait]
pub trait ExecutionPattern: Send + Sync {
    fn kind(&self) -> PatternKind;

    async fn execute(&self, ctx: &PatternContext, agents: &[Agent], task: &Value) -> Result<Vec<PatternResult>>;
}

/// `required_capabilities` listed in the task payload.
pub(crate) fn required_capabilities(task: &Value) -> Vec<String> {
    task.get("required_capabilities")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(|t| t.trim().to_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

/// Agents holding at least one required capability, or all when none are required.
pub(crate) fn capable<'a>(agents: &'a [Agent], task: &Value) -> Vec<&'a Agent> {
    let required = required_capabilities(task);
    agents
        .iter()
        .filter(|a| required.is_empty() || a.has_any_capability(&required))
        .collect()
}
