//! Agent records held by the registry.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{AgentState, EventType};

/// Registration request sent by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Event types to receive broadcasts for. Empty means every event type.
    #[serde(default)]
    pub subscriptions: Vec<EventType>,
    /// Specialization archetype; the agent id is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype: Option<String>,
}

fn default_priority() -> i64 {
    5
}

impl AgentRegistration {
    pub fn new(agent_id: impl Into<String>, capabilities: &[&str], priority: i64) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            priority,
            subscriptions: Vec::new(),
            archetype: None,
        }
    }

    pub fn with_subscriptions(mut self, events: impl IntoIterator<Item = EventType>) -> Self {
        self.subscriptions.extend(events);
        self
    }

    pub fn with_archetype(mut self, archetype: impl Into<String>) -> Self {
        self.archetype = Some(archetype.into());
        self
    }
}

/// Per task-type outcome counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskTypeStats {
    pub count: u64,
    pub success: u64,
}

/// Reported performance of an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Performance {
    pub success_rate: f64,
    /// Mean completion time in seconds.
    pub avg_completion_time: f64,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub total_time: f64,
    /// Assignments in the selector's recent load window.
    pub recent_assignment_count: usize,
    #[serde(default)]
    pub task_types: HashMap<String, TaskTypeStats>,
}

impl Performance {
    pub fn record(&mut self, success: bool, completion_secs: f64, task_type: Option<&str>) {
        self.total_tasks += 1;
        if success {
            self.successful_tasks += 1;
        }
        self.total_time += completion_secs.max(0.0);

        self.success_rate = self.successful_tasks as f64 / self.total_tasks as f64;
        self.avg_completion_time = self.total_time / self.total_tasks as f64;

        if let Some(task_type) = task_type {
            let stats = self.task_types.entry(task_type.to_string()).or_default();
            stats.count += 1;
            if success {
                stats.success += 1;
            }
        }
    }

    pub fn has_history(&self) -> bool {
        self.total_tasks > 0
    }
}

/// A registered agent.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    /// Alias tags resolved from the taxonomy at registration.
    pub related_capabilities: BTreeSet<String>,
    pub priority: i64,
    pub state: AgentState,
    pub performance: Performance,
    pub subscriptions: HashSet<EventType>,
    pub archetype: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// When the monitor last pinged this agent in the current silence window.
    #[serde(skip)]
    pub last_ping_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// Key into the specialization table.
    pub fn archetype_key(&self) -> &str {
        self.archetype.as_deref().unwrap_or(&self.id)
    }

    pub fn is_subscribed(&self, event: &EventType) -> bool {
        self.subscriptions.is_empty() || self.subscriptions.contains(event)
    }

    pub fn has_any_capability<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> bool {
        tags.into_iter().any(|t| self.capabilities.contains(t))
    }
}
