//! Capability-based agent selection.

pub mod policy;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::SelectorConfig;
use crate::error::{Error, Result};
use crate::registry::{Agent, AgentRegistry};

pub use policy::{ScoreBreakdown, ScoreWeights, ScoringPolicy, SelectionRequest, WeightedScoringPolicy};

/// One selection decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub timestamp: DateTime<Utc>,
    pub task_type: String,
    pub required_capabilities: Vec<String>,
    pub selected_agent: String,
    pub scores: BTreeMap<String, f64>,
    pub rationale: String,
    pub policy_version: u64,
    /// Reported task outcome; `None` until the worker reports back.
    pub outcome: Option<bool>,
}

/// A scored candidate.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub agent_id: String,
    pub score: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionAnalytics {
    pub total_selections: usize,
    pub most_used_agents: Vec<(String, usize)>,
    pub common_task_types: Vec<(String, usize)>,
    pub recorded_outcomes: usize,
    pub recent_rationales: Vec<String>,
    pub policy: serde_json::Value,
}

pub struct CapabilitySelector {
    registry: Arc<AgentRegistry>,
    policy: RwLock<Arc<dyn ScoringPolicy>>,
    history: Mutex<VecDeque<SelectionRecord>>,
    config: SelectorConfig,
}

impl CapabilitySelector {
    pub fn new(
        registry: Arc<AgentRegistry>,
        policy: Arc<dyn ScoringPolicy>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            registry,
            policy: RwLock::new(policy),
            history: Mutex::new(VecDeque::new()),
            config,
        }
    }

    pub fn policy(&self) -> Arc<dyn ScoringPolicy> {
        self.policy.read().clone()
    }

    pub fn set_policy(&self, policy: Arc<dyn ScoringPolicy>) {
        *self.policy.write() = policy;
    }

    /// Score every eligible agent, best first.
    ///
    /// Eligible means: accepting work, not excluded, and matching at least
    /// one required capability (directly or by alias) when any are required.
    /// Ties break on agent id.
    pub fn rank(&self, request: &SelectionRequest) -> Vec<Candidate> {
        let policy = self.policy();
        let recent = self.recent_assignments();

        let mut candidates: Vec<Candidate> = self
            .registry
            .list()
            .into_iter()
            .filter(|agent| self.is_eligible(policy.as_ref(), agent, request))
            .map(|agent| {
                let load = recent.get(&agent.id).copied().unwrap_or(0);
                Candidate {
                    score: policy.score(&agent, request, load),
                    agent_id: agent.id,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .total
                .total_cmp(&a.score.total)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        candidates
    }

    /// Pick the best agent and record the decision.
    pub fn select_best(&self, request: &SelectionRequest) -> Result<String> {
        let candidates = self.rank(request);
        let Some(best) = candidates.first() else {
            tracing::warn!(task_type = %request.task_type, "No eligible agent");
            return Err(Error::NoCandidate {
                task_type: request.task_type.clone(),
            });
        };

        let selected = best.agent_id.clone();
        let rationale = rationale(&candidates);
        tracing::info!(
            task_type = %request.task_type,
            agent = %selected,
            %rationale,
            "Selected agent"
        );

        let record = SelectionRecord {
            timestamp: Utc::now(),
            task_type: request.task_type.clone(),
            required_capabilities: request.required_capabilities.clone(),
            selected_agent: selected.clone(),
            scores: candidates
                .iter()
                .map(|c| (c.agent_id.clone(), c.score.total))
                .collect(),
            rationale,
            policy_version: self.policy().version(),
            outcome: None,
        };
        self.push_record(record);
        self.refresh_load_counts();

        Ok(selected)
    }

    /// Report a task outcome for `agent_id`.
    ///
    /// Updates the agent's performance and stamps the most recent selection
    /// of that agent which has no outcome yet.
    pub fn record_outcome(
        &self,
        agent_id: &str,
        success: bool,
        completion_secs: f64,
        task_type: Option<&str>,
    ) -> Result<()> {
        self.registry
            .record_outcome(agent_id, success, completion_secs, task_type)?;

        let mut history = self.history.lock();
        if let Some(record) = history.iter_mut().rev().find(|r| {
            r.selected_agent == agent_id
                && r.outcome.is_none()
                && task_type.map_or(true, |t| r.task_type == t)
        }) {
            record.outcome = Some(success);
        }
        Ok(())
    }

    /// Retune the policy from recorded outcomes. Returns the active version.
    pub fn retune(&self) -> u64 {
        let history: Vec<SelectionRecord> = self.history.lock().iter().cloned().collect();
        let current = self.policy();
        match current.retuned(&history) {
            Some(next) => {
                let version = next.version();
                self.set_policy(next);
                version
            }
            None => current.version(),
        }
    }

    pub fn history(&self) -> Vec<SelectionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn analytics(&self) -> SelectionAnalytics {
        let history = self.history.lock();
        let mut usage: HashMap<&str, usize> = HashMap::new();
        let mut tasks: HashMap<&str, usize> = HashMap::new();
        for record in history.iter() {
            *usage.entry(record.selected_agent.as_str()).or_default() += 1;
            *tasks.entry(record.task_type.as_str()).or_default() += 1;
        }

        SelectionAnalytics {
            total_selections: history.len(),
            most_used_agents: top_five(usage),
            common_task_types: top_five(tasks),
            recorded_outcomes: history.iter().filter(|r| r.outcome.is_some()).count(),
            recent_rationales: history
                .iter()
                .rev()
                .take(10)
                .map(|r| r.rationale.clone())
                .collect(),
            policy: self.policy().describe(),
        }
    }

    fn is_eligible(&self, policy: &dyn ScoringPolicy, agent: &Agent, request: &SelectionRequest) -> bool {
        if !agent.state.accepts_work() || request.exclude.iter().any(|id| *id == agent.id) {
            return false;
        }
        request.required_capabilities.is_empty()
            || policy.capability_score(agent, &request.required_capabilities) > 0.0
    }

    fn push_record(&self, record: SelectionRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Assignment counts over the load window.
    fn recent_assignments(&self) -> HashMap<String, usize> {
        let history = self.history.lock();
        let mut counts = HashMap::new();
        for record in history.iter().rev().take(self.config.load_window) {
            *counts.entry(record.selected_agent.clone()).or_insert(0) += 1;
        }
        counts
    }

    fn refresh_load_counts(&self) {
        let counts = self.recent_assignments();
        for id in self.registry.ids() {
            self.registry
                .set_recent_assignments(&id, counts.get(&id).copied().unwrap_or(0));
        }
    }
}

fn rationale(ranked: &[Candidate]) -> String {
    let best = &ranked[0];
    let Some(runner_up) = ranked.get(1) else {
        return format!("Only available agent: {}", best.agent_id);
    };

    let margin = best.score.total - runner_up.score.total;
    let label = if margin > 20.0 {
        "Clear best choice"
    } else if margin > 10.0 {
        "Good match"
    } else {
        "Close decision"
    };
    format!("{}: {} (score: {:.1})", label, best.agent_id, best.score.total)
}

fn top_five(counts: HashMap<&str, usize>) -> Vec<(String, usize)> {
    let mut sorted: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.truncate(5);
    sorted
}
