//! Seed a shared context and let agents self-organize.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;
use crate::protocol::{generate_id, EventType, Message, Priority};
use crate::registry::Agent;

use super::{capable, ExecutionPattern, PatternContext, PatternKind, PatternOutcome, PatternResult};

/// Sends one `emergent_initialization` per eligible agent, all sharing a
/// correlation id, and returns without waiting. Agents coordinate among
/// themselves from there; there is no completion criterion.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmergentExecution;

#[async_trait]
impl ExecutionPattern for EmergentExecution {
    fn kind(&self) -> PatternKind {
        PatternKind::Emergent
    }

    async fn execute(&self, ctx: &PatternContext, agents: &[Agent], task: &Value) -> Result<Vec<PatternResult>> {
        let eligible = capable(agents, task);
        let ids: Vec<String> = eligible.iter().map(|a| a.id.clone()).collect();

        let mut shared = match task {
            Value::Object(map) => Value::Object(map.clone()),
            other => json!({ "task": other }),
        };
        shared["emergent_pool"] = json!(true);
        shared["agents_available"] = json!(ids);
        shared["coordination_style"] = json!("emergent");

        let base = Message::new(EventType::EmergentInitialization, ctx.engine_id.as_str(), shared)
            .with_priority(Priority::LOW)
            .with_correlation_id(generate_id());

        let mut results = Vec::with_capacity(ids.len());
        for agent_id in &ids {
            let copy = base.fork_for(agent_id);
            let message_id = copy.id.clone();
            let outcome = match ctx.bus.send(copy).await {
                Ok(_) => PatternOutcome::Dispatched { message_id },
                Err(e) => PatternOutcome::Failed { error: e.to_string() },
            };
            results.push(PatternResult {
                agent_id: agent_id.clone(),
                outcome,
            });
        }
        tracing::debug!(agents = results.len(), "Emergent pool seeded");
        Ok(results)
    }
}
