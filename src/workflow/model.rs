//! Workflow records.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initializing,
    Coordinating,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Initializing => "initializing",
            WorkflowStatus::Coordinating => "coordinating",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A multi-agent coordination session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    /// Fixed at creation.
    pub participants: Vec<String>,
    pub coordination_data: Value,
    pub status: WorkflowStatus,
    /// Number of acknowledgments received.
    pub current_step: usize,
    pub acknowledged: BTreeSet<String>,
    /// Participants whose coordination request expired unanswered.
    pub unanswered: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, participants: Vec<String>, coordination_data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            participants,
            coordination_data,
            status: WorkflowStatus::Initializing,
            current_step: 0,
            acknowledged: BTreeSet::new(),
            unanswered: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            terminated_at: None,
            failure_reason: None,
        }
    }

    pub fn has_participant(&self, agent_id: &str) -> bool {
        self.participants.iter().any(|p| p == agent_id)
    }

    pub fn all_acknowledged(&self) -> bool {
        self.participants.iter().all(|p| self.acknowledged.contains(p))
    }

    /// Reference time for TTL purging.
    pub fn age_reference(&self) -> DateTime<Utc> {
        self.terminated_at.unwrap_or(self.created_at)
    }

    pub(crate) fn transition(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if status.is_terminal() {
            self.terminated_at = Some(self.updated_at);
        }
    }
}
