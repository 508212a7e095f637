//! Scoring policies for agent selection.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::registry::Agent;

use super::SelectionRecord;

/// Relative weight of each scoring term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub priority: f64,
    pub capability: f64,
    pub performance: f64,
    pub load: f64,
    pub specialization: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            priority: 10.0,
            capability: 50.0,
            performance: 30.0,
            load: 20.0,
            specialization: 40.0,
        }
    }
}

/// What is being selected for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub task_type: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl SelectionRequest {
    pub fn new(task_type: impl Into<String>, required: &[&str]) -> Self {
        Self {
            task_type: task_type.into(),
            required_capabilities: required.iter().map(|c| c.to_string()).collect(),
            exclude: Vec::new(),
        }
    }

    pub fn excluding(mut self, ids: &[&str]) -> Self {
        self.exclude.extend(ids.iter().map(|s| s.to_string()));
        self
    }
}

/// Per-term scores (each in `0..=1` except `priority`, the raw agent
/// priority) and their weighted total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub priority: f64,
    pub capability: f64,
    pub performance: f64,
    pub load: f64,
    pub specialization: f64,
    pub total: f64,
}

/// Pluggable, versioned scoring policy.
pub trait ScoringPolicy: Send + Sync + fmt::Debug {
    fn version(&self) -> u64;

    fn score(&self, agent: &Agent, request: &SelectionRequest, recent_assignments: usize) -> ScoreBreakdown;

    /// Capability term alone, used for eligibility.
    fn capability_score(&self, agent: &Agent, required: &[String]) -> f64;

    /// Next policy version derived from recorded outcomes, or `None` when
    /// nothing would change. Records without an outcome must be ignored.
    fn retuned(&self, history: &[SelectionRecord]) -> Option<Arc<dyn ScoringPolicy>>;

    fn describe(&self) -> serde_json::Value;
}

/// The default weighted-sum policy.
#[derive(Debug, Clone)]
pub struct WeightedScoringPolicy {
    version: u64,
    weights: ScoreWeights,
    capability_weights: BTreeMap<String, f64>,
    partial_credit: f64,
    retune_min_samples: usize,
    specializations: HashMap<String, Vec<String>>,
}

const MIN_CAPABILITY_WEIGHT: f64 = 0.1;
const MAX_CAPABILITY_WEIGHT: f64 = 2.0;

impl WeightedScoringPolicy {
    pub fn new(specializations: HashMap<String, Vec<String>>) -> Self {
        Self {
            version: 1,
            weights: ScoreWeights::default(),
            capability_weights: BTreeMap::new(),
            partial_credit: 0.7,
            retune_min_samples: 10,
            specializations,
        }
    }

    pub fn with_partial_credit(mut self, credit: f64) -> Self {
        self.partial_credit = credit;
        self
    }

    pub fn with_retune_min_samples(mut self, samples: usize) -> Self {
        self.retune_min_samples = samples;
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn capability_weight(&self, tag: &str) -> f64 {
        self.capability_weights.get(tag).copied().unwrap_or(1.0)
    }

    fn performance_score(agent: &Agent) -> f64 {
        let perf = &agent.performance;
        if !perf.has_history() {
            return 0.5;
        }
        let time_score = (1.0 - perf.avg_completion_time / 3600.0).max(0.0);
        let experience = (perf.total_tasks as f64 / 100.0).min(0.2);
        (perf.success_rate + time_score * 0.3 + experience).min(1.0)
    }

    fn load_score(recent_assignments: usize) -> f64 {
        match recent_assignments {
            0 => 1.0,
            1..=2 => 0.8,
            3..=5 => 0.6,
            6..=10 => 0.4,
            _ => 0.2,
        }
    }

    fn specialization_score(&self, agent: &Agent, task_type: &str) -> f64 {
        let task_type = task_type.trim().to_lowercase();
        let Some(preferred) = self.specializations.get(agent.archetype_key()) else {
            return 0.1;
        };
        if preferred.iter().any(|p| *p == task_type) {
            return 1.0;
        }
        if !task_type.is_empty()
            && preferred
                .iter()
                .any(|p| p.contains(task_type.as_str()) || task_type.contains(p.as_str()))
        {
            return 0.7;
        }
        0.1
    }
}

impl ScoringPolicy for WeightedScoringPolicy {
    fn version(&self) -> u64 {
        self.version
    }

    fn score(&self, agent: &Agent, request: &SelectionRequest, recent_assignments: usize) -> ScoreBreakdown {
        let priority = agent.priority as f64;
        let capability = self.capability_score(agent, &request.required_capabilities);
        let performance = Self::performance_score(agent);
        let load = Self::load_score(recent_assignments);
        let specialization = self.specialization_score(agent, &request.task_type);

        let w = &self.weights;
        let total = priority * w.priority
            + capability * w.capability
            + performance * w.performance
            + load * w.load
            + specialization * w.specialization;

        ScoreBreakdown {
            priority,
            capability,
            performance,
            load,
            specialization,
            total,
        }
    }

    fn capability_score(&self, agent: &Agent, required: &[String]) -> f64 {
        if required.is_empty() {
            return 0.5;
        }

        let mut matched = 0.0;
        let mut total_weight = 0.0;
        for raw in required {
            let tag = raw.trim().to_lowercase();
            let weight = self.capability_weight(&tag);
            total_weight += weight;

            if agent.capabilities.contains(&tag) {
                matched += weight;
            } else if agent.related_capabilities.contains(&tag) {
                matched += weight * self.partial_credit;
            }
        }

        if total_weight > 0.0 {
            matched / total_weight
        } else {
            0.0
        }
    }

    fn retuned(&self, history: &[SelectionRecord]) -> Option<Arc<dyn ScoringPolicy>> {
        // tag -> (recorded, successes)
        let mut tally: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for record in history {
            let Some(success) = record.outcome else { continue };
            for tag in &record.required_capabilities {
                let entry = tally.entry(tag.trim().to_lowercase()).or_default();
                entry.0 += 1;
                if success {
                    entry.1 += 1;
                }
            }
        }

        let mut next = self.clone();
        let mut changed = false;
        for (tag, (total, successes)) in tally {
            if total <= self.retune_min_samples {
                continue;
            }
            let rate = successes as f64 / total as f64;
            let factor = if rate > 0.8 {
                1.1
            } else if rate < 0.6 {
                0.9
            } else {
                continue;
            };

            let current = self.capability_weight(&tag);
            let updated = (current * factor).clamp(MIN_CAPABILITY_WEIGHT, MAX_CAPABILITY_WEIGHT);
            if (updated - current).abs() > f64::EPSILON {
                next.capability_weights.insert(tag, updated);
                changed = true;
            }
        }

        if !changed {
            return None;
        }
        next.version += 1;
        tracing::info!(version = next.version, "Retuned capability weights");
        Some(Arc::new(next))
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "policy": "weighted",
            "version": self.version,
            "weights": self.weights,
            "capability_weights": self.capability_weights,
            "partial_credit": self.partial_credit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_specializations, default_taxonomy};
    use crate::registry::{AgentRegistration, AgentRegistry, CapabilityTaxonomy};
    use chrono::Utc;

    fn agent(id: &str, caps: &[&str], priority: i64) -> Agent {
        let registry = AgentRegistry::new(CapabilityTaxonomy::from_table(&default_taxonomy()));
        registry
            .register(AgentRegistration::new(id, caps, priority))
            .unwrap();
        registry.get(id).unwrap()
    }

    fn record(required: &[&str], outcome: Option<bool>) -> SelectionRecord {
        SelectionRecord {
            timestamp: Utc::now(),
            task_type: "t".to_string(),
            required_capabilities: required.iter().map(|s| s.to_string()).collect(),
            selected_agent: "a".to_string(),
            scores: BTreeMap::new(),
            rationale: String::new(),
            policy_version: 1,
            outcome,
        }
    }

    #[test]
    fn test_capability_direct_and_partial() {
        let policy = WeightedScoringPolicy::new(default_specializations());
        let a = agent("a", &["api"], 5);

        assert_eq!(policy.capability_score(&a, &["api".to_string()]), 1.0);
        assert!((policy.capability_score(&a, &["backend".to_string()]) - 0.7).abs() < 1e-9);
        assert_eq!(policy.capability_score(&a, &["css".to_string()]), 0.0);
        assert_eq!(policy.capability_score(&a, &[]), 0.5);
    }

    #[test]
    fn test_score_terms() {
        let policy = WeightedScoringPolicy::new(default_specializations());
        let a = agent("backend_dev", &["backend", "api"], 8);
        let request = SelectionRequest::new("api", &["backend"]);

        let score = policy.score(&a, &request, 0);
        assert_eq!(score.capability, 1.0);
        assert_eq!(score.performance, 0.5);
        assert_eq!(score.load, 1.0);
        assert_eq!(score.specialization, 1.0);
        assert_eq!(score.total, 80.0 + 50.0 + 15.0 + 20.0 + 40.0);

        assert_eq!(policy.score(&a, &request, 11).load, 0.2);
        assert_eq!(policy.score(&a, &SelectionRequest::new("api_build", &[]), 0).specialization, 0.7);
    }

    #[test]
    fn test_performance_term_with_history() {
        let policy = WeightedScoringPolicy::new(HashMap::new());
        let mut a = agent("a", &["x"], 5);
        a.performance.record(true, 1800.0, None);

        let score = policy.score(&a, &SelectionRequest::new("t", &[]), 0);
        // 1.0 + 0.5 * 0.3 + 0.01, capped at 1.0
        assert_eq!(score.performance, 1.0);
        assert_eq!(score.specialization, 0.1);
    }

    #[test]
    fn test_retune_ignores_unrecorded() {
        let policy = WeightedScoringPolicy::new(HashMap::new());
        let unrecorded: Vec<_> = (0..20).map(|_| record(&["backend"], None)).collect();
        assert!(policy.retuned(&unrecorded).is_none());

        let failures: Vec<_> = (0..11).map(|_| record(&["backend"], Some(false))).collect();
        let next = policy.retuned(&failures).unwrap();
        assert_eq!(next.version(), 2);
        assert_eq!(next.describe()["capability_weights"]["backend"], 0.9);
    }

    #[test]
    fn test_retune_clamps() {
        let mut policy = WeightedScoringPolicy::new(HashMap::new());
        policy.capability_weights.insert("backend".to_string(), 1.95);
        let wins: Vec<_> = (0..11).map(|_| record(&["backend"], Some(true))).collect();

        let next = policy.retuned(&wins).unwrap();
        assert_eq!(next.describe()["capability_weights"]["backend"], 2.0);
    }
}
