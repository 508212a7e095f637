//! Fan one task out to every capable agent at once.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;

use crate::error::Result;
use crate::protocol::{EventType, Priority};
use crate::registry::Agent;

use super::{capable, ExecutionPattern, PatternContext, PatternKind, PatternResult};

/// Results come back in no particular order; one agent failing does not
/// hold up the others.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelExecution;

#[async_trait]
impl ExecutionPattern for ParallelExecution {
    fn kind(&self) -> PatternKind {
        PatternKind::Parallel
    }

    async fn execute(&self, ctx: &PatternContext, agents: &[Agent], task: &Value) -> Result<Vec<PatternResult>> {
        let targets = capable(agents, task);
        tracing::debug!(agents = targets.len(), "Parallel dispatch");

        let dispatches = targets.iter().map(|agent| {
            ctx.dispatch(&agent.id, EventType::ParallelTask, Priority::new(2), task.clone())
        });
        Ok(join_all(dispatches).await)
    }
}
