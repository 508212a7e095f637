//! Hand a task down a chain, growing a shared context.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::protocol::{EventType, Priority};
use crate::registry::Agent;

use super::{capable, ExecutionPattern, PatternContext, PatternKind, PatternOutcome, PatternResult};

/// Each capable agent, in the given order, sees the task merged with every
/// earlier reply payload. The first failure ends the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecution;

#[async_trait]
impl ExecutionPattern for SequentialExecution {
    fn kind(&self) -> PatternKind {
        PatternKind::Sequential
    }

    async fn execute(&self, ctx: &PatternContext, agents: &[Agent], task: &Value) -> Result<Vec<PatternResult>> {
        let mut context = match task {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("task".to_string(), other.clone());
                map
            }
        };
        let mut results = Vec::new();

        for agent in capable(agents, task) {
            let result = ctx
                .dispatch(
                    &agent.id,
                    EventType::SequentialTask,
                    Priority::new(3),
                    Value::Object(context.clone()),
                )
                .await;

            match &result.outcome {
                PatternOutcome::Completed { response } => {
                    if let Value::Object(update) = &response.payload {
                        context.extend(update.clone());
                    }
                    results.push(result);
                }
                _ => {
                    tracing::warn!(agent = %agent.id, "Sequential chain aborted");
                    results.push(result);
                    break;
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::testing::{context, respond};
    use serde_json::json;

    #[tokio::test]
    async fn test_context_flows_forward() {
        let (ctx, agents) = context(&[("first", &["ops"]), ("second", &["ops"])]);
        respond(&ctx, "first");
        respond(&ctx, "second");

        let results = SequentialExecution
            .execute(&ctx, &agents, &json!({"job": "deploy"}))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let seen_by_second = &results[1].response().unwrap().payload["received"];
        assert_eq!(seen_by_second["first_seen"], true);
        assert_eq!(seen_by_second["job"], "deploy");
    }

    #[tokio::test]
    async fn test_failure_aborts_chain() {
        let (ctx, agents) = context(&[("faulty", &["ops"]), ("after", &["ops"])]);
        respond(&ctx, "faulty");
        respond(&ctx, "after");

        let results = SequentialExecution
            .execute(&ctx, &agents, &json!({}))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(!results[0].is_success());
    }
}
