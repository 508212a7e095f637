//! Worker agents.
//!
//! A [`Worker`] is the collaborator contract for concrete agents: it turns
//! one inbound message into an optional reply. [`WorkerRuntime`] drives a
//! worker against an in-process engine as an independent task with its own
//! mailbox.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::Result;
use crate::protocol::{AgentState, EventType, Message};
use crate::registry::AgentRegistration;

#[async_trait]
pub trait Worker: Send + Sync {
    /// How this worker introduces itself to the engine.
    fn registration(&self) -> AgentRegistration;

    /// Handle one message. A returned message is sent back through the bus.
    async fn process_event(&self, message: &Message) -> anyhow::Result<Option<Message>>;
}

pub struct WorkerRuntime<W: Worker> {
    engine: Arc<Engine>,
    worker: W,
    agent_id: String,
    batch_size: usize,
    poll_interval: Duration,
}

impl<W: Worker + 'static> WorkerRuntime<W> {
    pub fn new(engine: Arc<Engine>, worker: W) -> Self {
        let agent_id = worker.registration().agent_id;
        Self {
            engine,
            worker,
            agent_id,
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Register, then process messages until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        self.engine.register_agent(self.worker.registration()).await?;
        tracing::info!(agent = %self.agent_id, "Worker started");

        let bus = self.engine.bus().clone();
        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => break,
                batch = bus.receive_wait(&self.agent_id, self.batch_size, self.poll_interval) => batch,
            };
            for message in batch {
                self.handle(message).await;
            }
        }

        self.engine.unregister_agent(&self.agent_id).await;
        tracing::info!(agent = %self.agent_id, "Worker stopped");
        Ok(())
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(token))
    }

    /// Per-task state churn, not announced to subscribers.
    fn mark(&self, state: AgentState) {
        if let Err(e) = self.engine.registry().set_state(&self.agent_id, state) {
            tracing::debug!(agent = %self.agent_id, %state, "Could not set state: {}", e);
        }
    }

    async fn handle(&self, message: Message) {
        if message.event_type == EventType::Heartbeat {
            if message.requires_response {
                let ack = message.reply(&self.agent_id, EventType::Heartbeat, json!({ "status": "alive" }));
                self.send(ack).await;
            }
            return;
        }

        self.mark(AgentState::Running);
        let started = Instant::now();
        let result = self.worker.process_event(&message).await;
        let elapsed = started.elapsed();
        self.mark(AgentState::Idle);

        let task_type = message.payload.get("task_type").and_then(Value::as_str);
        if let Err(e) = self
            .engine
            .record_outcome(&self.agent_id, result.is_ok(), elapsed, task_type)
        {
            tracing::debug!(agent = %self.agent_id, "Could not record outcome: {}", e);
        }

        match result {
            Ok(Some(reply)) => self.send(reply).await,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    agent = %self.agent_id,
                    message_id = %message.id,
                    event = %message.event_type,
                    "Worker failed: {:#}",
                    e
                );
                if message.requires_response {
                    let error = message.reply(
                        &self.agent_id,
                        EventType::Error,
                        json!({ "error": format!("{:#}", e) }),
                    );
                    self.send(error).await;
                }
            }
        }
    }

    async fn send(&self, message: Message) {
        if let Err(e) = self.engine.send(message).await {
            tracing::warn!(agent = %self.agent_id, "Reply not delivered: {}", e);
        }
    }
}
