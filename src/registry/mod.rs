//! Agent registry.
//!
//! The registry is an injected repository object, shared by `Arc` between
//! components. Entries live in a sharded map so updates to one agent do not
//! serialize traffic for others.

pub mod agent;
pub mod taxonomy;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::protocol::{AgentState, EventType, Priority};

pub use agent::{Agent, AgentRegistration, Performance, TaskTypeStats};
pub use taxonomy::{normalize_tag, CapabilityTaxonomy};

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Agent>,
    taxonomy: CapabilityTaxonomy,
}

impl AgentRegistry {
    pub fn new(taxonomy: CapabilityTaxonomy) -> Self {
        Self {
            agents: DashMap::new(),
            taxonomy,
        }
    }

    pub fn taxonomy(&self) -> &CapabilityTaxonomy {
        &self.taxonomy
    }

    /// Register or replace an agent. Returns true when an entry was replaced.
    ///
    /// A fresh entry always starts `Idle` with zeroed performance.
    pub fn register(&self, registration: AgentRegistration) -> Result<bool> {
        let agent_id = registration.agent_id.trim().to_string();
        if agent_id.is_empty() {
            return Err(Error::Registration("agent_id must not be empty".to_string()));
        }
        if !(Priority::MIN.value() as i64..=Priority::MAX.value() as i64)
            .contains(&registration.priority)
        {
            return Err(Error::Registration(format!(
                "priority {} for '{}' is outside {}..={}",
                registration.priority,
                agent_id,
                Priority::MIN,
                Priority::MAX
            )));
        }

        let capabilities = validate_capabilities(&agent_id, &registration.capabilities)?;
        let related_capabilities = self.taxonomy.resolve_related(&capabilities);
        let now = Utc::now();

        let agent = Agent {
            id: agent_id.clone(),
            capabilities,
            related_capabilities,
            priority: registration.priority,
            state: AgentState::Idle,
            performance: Performance::default(),
            subscriptions: registration.subscriptions.into_iter().collect(),
            archetype: registration.archetype,
            registered_at: now,
            last_heartbeat: now,
            last_ping_at: None,
        };

        let replaced = self.agents.insert(agent_id.clone(), agent).is_some();
        tracing::info!(
            agent = %agent_id,
            replaced,
            "Registered agent"
        );
        Ok(replaced)
    }

    /// Remove an agent. Unknown ids are a no-op.
    pub fn unregister(&self, agent_id: &str) -> Option<Agent> {
        let removed = self.agents.remove(agent_id).map(|(_, agent)| agent);
        if removed.is_some() {
            tracing::info!(agent = %agent_id, "Unregistered agent");
        }
        removed
    }

    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.get(agent_id).map(|a| a.clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Snapshot of every agent, sorted by id.
    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.iter().map(|a| a.value().clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|a| a.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Set an agent's state, returning the previous state.
    pub fn set_state(&self, agent_id: &str, state: AgentState) -> Result<AgentState> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", agent_id)))?;
        let previous = agent.state;
        agent.state = state;
        if previous != state {
            tracing::debug!(agent = %agent_id, %previous, new_state = %state, "Agent state changed");
        }
        Ok(previous)
    }

    /// Record liveness. Returns false for unknown agents.
    pub fn record_heartbeat(&self, agent_id: &str) -> bool {
        self.record_heartbeat_at(agent_id, Utc::now())
    }

    pub fn record_heartbeat_at(&self, agent_id: &str, at: DateTime<Utc>) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(mut agent) => {
                if at > agent.last_heartbeat {
                    agent.last_heartbeat = at;
                }
                agent.last_ping_at = None;
                true
            }
            None => false,
        }
    }

    pub fn mark_pinged(&self, agent_id: &str, at: DateTime<Utc>) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            agent.last_ping_at = Some(at);
        }
    }

    pub fn record_outcome(
        &self,
        agent_id: &str,
        success: bool,
        completion_secs: f64,
        task_type: Option<&str>,
    ) -> Result<Performance> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", agent_id)))?;
        agent.performance.record(success, completion_secs, task_type);
        Ok(agent.performance.clone())
    }

    pub fn set_recent_assignments(&self, agent_id: &str, count: usize) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            agent.performance.recent_assignment_count = count;
        }
    }

    /// Add broadcast subscriptions for an agent.
    pub fn subscribe(&self, agent_id: &str, events: impl IntoIterator<Item = EventType>) -> Result<()> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", agent_id)))?;
        agent.subscriptions.extend(events);
        Ok(())
    }

    /// Ids of agents receiving broadcasts of `event`, sorted.
    pub fn subscribers(&self, event: &EventType) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .iter()
            .filter(|a| a.is_subscribed(event))
            .map(|a| a.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

fn validate_capabilities(agent_id: &str, capabilities: &[String]) -> Result<BTreeSet<String>> {
    let mut tags = BTreeSet::new();
    for raw in capabilities {
        let tag = normalize_tag(raw);
        if tag.is_empty() || tag.chars().any(char::is_whitespace) {
            return Err(Error::Registration(format!(
                "malformed capability '{}' for agent '{}'",
                raw, agent_id
            )));
        }
        tags.insert(tag);
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_taxonomy;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(CapabilityTaxonomy::from_table(&default_taxonomy()))
    }

    #[test]
    fn test_register_and_replace() {
        let registry = registry();
        assert!(!registry
            .register(AgentRegistration::new("a", &["backend"], 8))
            .unwrap());
        registry.set_state("a", AgentState::Busy).unwrap();
        registry.record_outcome("a", true, 10.0, None).unwrap();

        let replaced = registry
            .register(AgentRegistration::new("a", &["Frontend"], 3))
            .unwrap();
        assert!(replaced);
        assert_eq!(registry.len(), 1);

        let agent = registry.get("a").unwrap();
        assert_eq!(agent.state, AgentState::Idle);
        assert_eq!(agent.priority, 3);
        assert_eq!(agent.performance.total_tasks, 0);
        assert!(agent.capabilities.contains("frontend"));
        assert!(agent.related_capabilities.contains("react"));
    }

    #[test]
    fn test_register_rejects_malformed() {
        let registry = registry();
        assert!(matches!(
            registry.register(AgentRegistration::new("", &["x"], 1)),
            Err(Error::Registration(_))
        ));
        assert!(matches!(
            registry.register(AgentRegistration::new("a", &["two words"], 1)),
            Err(Error::Registration(_))
        ));
        assert!(matches!(
            registry.register(AgentRegistration::new("a", &["  "], 1)),
            Err(Error::Registration(_))
        ));
        assert!(matches!(
            registry.register(AgentRegistration::new("a", &["ok"], 11)),
            Err(Error::Registration(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let registry = registry();
        assert!(registry.unregister("ghost").is_none());
    }

    #[test]
    fn test_subscribers() {
        let registry = registry();
        registry
            .register(
                AgentRegistration::new("watcher", &["ops"], 5)
                    .with_subscriptions([EventType::StatusUpdate]),
            )
            .unwrap();
        registry
            .register(AgentRegistration::new("all", &["ops"], 5))
            .unwrap();
        registry
            .register(
                AgentRegistration::new("trader", &["ops"], 5)
                    .with_subscriptions([EventType::Custom("market_tick".into())]),
            )
            .unwrap();

        assert_eq!(registry.subscribers(&EventType::StatusUpdate), vec!["all", "watcher"]);

        registry.subscribe("trader", [EventType::StatusUpdate]).unwrap();
        assert_eq!(registry.subscribers(&EventType::StatusUpdate).len(), 3);
    }

    #[test]
    fn test_heartbeat_never_moves_backwards() {
        let registry = registry();
        registry.register(AgentRegistration::new("a", &[], 5)).unwrap();
        let before = registry.get("a").unwrap().last_heartbeat;

        assert!(registry.record_heartbeat_at("a", before - chrono::Duration::seconds(30)));
        assert_eq!(registry.get("a").unwrap().last_heartbeat, before);
        assert!(!registry.record_heartbeat("ghost"));
    }
}
