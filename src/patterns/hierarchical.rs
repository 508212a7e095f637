//! Delegate to a lead agent.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::{EventType, Priority};
use crate::registry::Agent;

use super::{ExecutionPattern, PatternContext, PatternKind, PatternResult};

/// The agent with the most capabilities leads and is told who its
/// subordinates are. Any further fan-out is the lead's business.
#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchicalExecution;

impl HierarchicalExecution {
    /// Most capabilities wins; the earliest agent wins ties.
    pub fn lead(agents: &[Agent]) -> Option<&Agent> {
        agents.iter().fold(None, |best: Option<&Agent>, agent| match best {
            Some(b) if b.capabilities.len() >= agent.capabilities.len() => Some(b),
            _ => Some(agent),
        })
    }
}

#[async_trait]
impl ExecutionPattern for HierarchicalExecution {
    fn kind(&self) -> PatternKind {
        PatternKind::Hierarchical
    }

    async fn execute(&self, ctx: &PatternContext, agents: &[Agent], task: &Value) -> Result<Vec<PatternResult>> {
        let lead = Self::lead(agents)
            .ok_or_else(|| Error::Workflow("hierarchical execution needs at least one agent".to_string()))?;
        let subordinates: Vec<&str> = agents
            .iter()
            .filter(|a| a.id != lead.id)
            .map(|a| a.id.as_str())
            .collect();

        let mut payload = match task {
            Value::Object(map) => Value::Object(map.clone()),
            other => serde_json::json!({ "task": other }),
        };
        payload["subordinate_agents"] = serde_json::json!(subordinates);

        tracing::debug!(lead = %lead.id, subordinates = subordinates.len(), "Hierarchical delegation");
        let result = ctx
            .dispatch(&lead.id, EventType::HierarchicalCoordination, Priority::new(4), payload)
            .await;
        Ok(vec![result])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::testing::{context, respond};
    use serde_json::json;

    #[tokio::test]
    async fn test_lead_gets_subordinates() {
        let (ctx, agents) = context(&[
            ("narrow", &["ops"]),
            ("broad", &["ops", "backend", "api"]),
            ("other", &["ops"]),
        ]);
        respond(&ctx, "broad");

        let results = HierarchicalExecution
            .execute(&ctx, &agents, &json!({"job": "plan"}))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].agent_id, "broad");
        let received = &results[0].response().unwrap().payload["received"];
        assert_eq!(received["subordinate_agents"], json!(["narrow", "other"]));
        assert_eq!(received["job"], "plan");
    }

    #[tokio::test]
    async fn test_no_agents_is_error() {
        let (ctx, _) = context(&[]);
        assert!(HierarchicalExecution.execute(&ctx, &[], &json!({})).await.is_err());
    }
}
