//! The coordination engine.
//!
//! Owns one instance of every component and wires them together
//! explicitly: no component reaches for global state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{DeadLetter, DeadLetterStore, InMemoryDeadLetters, JsonlDeadLetters, MessageBus, MessageStats, SendOutcome};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::events::{BusEvent, EventHub};
use crate::heartbeat::{announce_state_change, recover, HeartbeatMonitor};
use crate::patterns::{PatternContext, PatternKind, PatternResult};
use crate::protocol::{AgentState, EventType, Message, Priority};
use crate::registry::{Agent, AgentRegistration, AgentRegistry, CapabilityTaxonomy, Performance};
use crate::selector::{Candidate, CapabilitySelector, SelectionAnalytics, SelectionRequest, WeightedScoringPolicy};
use crate::workflow::{Workflow, WorkflowCoordinator};

/// Source id used for messages the engine sends itself.
pub const ENGINE_ID: &str = "agentmesh_engine";

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub engine_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub registered_agents: usize,
    pub live_connections: usize,
    pub active_workflows: usize,
    pub queued_messages: usize,
    pub pending_responses: usize,
    pub retrying_messages: usize,
    pub dead_letters: usize,
    pub message_stats: MessageStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub state: AgentState,
    pub capabilities: Vec<String>,
    pub priority: i64,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub queued_messages: usize,
    pub connected: bool,
    pub performance: Performance,
}

/// Where a dispatched task went.
#[derive(Debug, Clone, Serialize)]
pub struct Dispatch {
    pub agent_id: String,
    pub message_id: String,
    pub outcome: SendOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub expired_responses: usize,
    pub purged_workflows: Vec<String>,
}

pub struct Engine {
    settings: Settings,
    registry: Arc<AgentRegistry>,
    selector: CapabilitySelector,
    bus: Arc<MessageBus>,
    workflows: Arc<WorkflowCoordinator>,
    monitor: Arc<HeartbeatMonitor>,
    started_at: DateTime<Utc>,
}

impl Engine {
    pub fn new(settings: Settings) -> Result<Self> {
        let dead_letters: Arc<dyn DeadLetterStore> = match &settings.bus.dead_letter_path {
            Some(path) => Arc::new(JsonlDeadLetters::open(path)?),
            None => Arc::new(InMemoryDeadLetters::new()),
        };
        Ok(Self::with_dead_letters(settings, dead_letters))
    }

    pub fn with_dead_letters(settings: Settings, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        let registry = Arc::new(AgentRegistry::new(CapabilityTaxonomy::from_table(&settings.taxonomy)));

        let policy = WeightedScoringPolicy::new(settings.specializations.clone())
            .with_partial_credit(settings.selector.partial_match_credit)
            .with_retune_min_samples(settings.selector.retune_min_samples);
        let selector = CapabilitySelector::new(registry.clone(), Arc::new(policy), settings.selector.clone());

        let bus = Arc::new(MessageBus::new(
            registry.clone(),
            dead_letters,
            EventHub::default(),
            settings.bus.clone(),
        ));
        let workflows = Arc::new(WorkflowCoordinator::new(bus.clone(), settings.workflow.clone(), ENGINE_ID));
        let monitor = Arc::new(HeartbeatMonitor::new(bus.clone(), settings.heartbeat.clone(), ENGINE_ID));

        Self {
            settings,
            registry,
            selector,
            bus,
            workflows,
            monitor,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        ENGINE_ID
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn selector(&self) -> &CapabilitySelector {
        &self.selector
    }

    pub fn events(&self) -> &EventHub {
        self.bus.events()
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    // Agents

    /// Register (or replace) an agent and announce it.
    pub async fn register_agent(&self, registration: AgentRegistration) -> Result<()> {
        let agent_id = registration.agent_id.trim().to_string();
        let replaced = self.registry.register(registration)?;
        self.bus.mailbox(&agent_id);
        tracing::info!(agent = %agent_id, replaced, "Agent registered");

        self.events().publish(BusEvent::AgentRegistered {
            agent_id: agent_id.clone(),
        });
        self.bus
            .broadcast(
                ENGINE_ID,
                EventType::StatusUpdate,
                json!({ "event": "agent_registered", "agent_id": agent_id }),
                &[agent_id.clone()],
            )
            .await;
        Ok(())
    }

    /// Remove an agent and its mailbox. Unknown ids are a no-op returning `None`.
    pub async fn unregister_agent(&self, agent_id: &str) -> Option<Agent> {
        let agent = self.registry.unregister(agent_id)?;
        self.bus.remove_agent(agent_id);
        tracing::info!(agent = %agent_id, "Agent unregistered");

        self.events().publish(BusEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
        });
        self.bus
            .broadcast(
                ENGINE_ID,
                EventType::StatusUpdate,
                json!({ "event": "agent_unregistered", "agent_id": agent_id }),
                &[],
            )
            .await;
        Some(agent)
    }

    /// Change an agent's state, announcing it when it actually changed.
    pub async fn update_agent_state(&self, agent_id: &str, state: AgentState) -> Result<AgentState> {
        let previous = self.registry.set_state(agent_id, state)?;
        if previous != state {
            tracing::info!(agent = %agent_id, from = %previous, to = %state, "Agent state changed");
            announce_state_change(&self.bus, ENGINE_ID, agent_id, previous, state).await;
        }
        Ok(previous)
    }

    pub fn subscribe(&self, agent_id: &str, events: impl IntoIterator<Item = EventType>) -> Result<()> {
        self.registry.subscribe(agent_id, events)
    }

    /// Record a heartbeat. A disconnected agent comes back as Idle.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        if !self.registry.record_heartbeat(agent_id) {
            return Err(Error::NotFound(format!("agent '{}'", agent_id)));
        }
        recover(&self.bus, ENGINE_ID, agent_id).await;
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<AgentSummary> {
        self.registry.get(agent_id).map(|a| self.summarize(a))
    }

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        self.registry
            .list()
            .into_iter()
            .map(|a| self.summarize(a))
            .collect()
    }

    fn summarize(&self, agent: Agent) -> AgentSummary {
        AgentSummary {
            queued_messages: self.bus.queued_for(&agent.id),
            connected: self.bus.is_connected(&agent.id),
            capabilities: agent.capabilities.into_iter().collect(),
            id: agent.id,
            state: agent.state,
            priority: agent.priority,
            registered_at: agent.registered_at,
            last_heartbeat: agent.last_heartbeat,
            performance: agent.performance,
        }
    }

    // Selection

    pub fn select_best(&self, request: &SelectionRequest) -> Result<String> {
        self.selector.select_best(request)
    }

    pub fn rank(&self, request: &SelectionRequest) -> Vec<Candidate> {
        self.selector.rank(request)
    }

    pub fn record_outcome(
        &self,
        agent_id: &str,
        success: bool,
        completion_time: Duration,
        task_type: Option<&str>,
    ) -> Result<()> {
        self.selector
            .record_outcome(agent_id, success, completion_time.as_secs_f64(), task_type)
    }

    pub fn retune(&self) -> u64 {
        self.selector.retune()
    }

    pub fn selection_analytics(&self) -> SelectionAnalytics {
        self.selector.analytics()
    }

    /// Select the best agent for `request` and send it a task request.
    pub async fn dispatch(&self, request: &SelectionRequest, task: Value, priority: Priority) -> Result<Dispatch> {
        let agent_id = self.selector.select_best(request)?;
        let mut payload = match task {
            Value::Object(map) => Value::Object(map),
            other => json!({ "task": other }),
        };
        payload["task_type"] = json!(request.task_type);

        let message = Message::new(EventType::TaskRequest, ENGINE_ID, payload)
            .to(agent_id.as_str())
            .with_priority(priority);
        let message_id = message.id.clone();
        let outcome = self.bus.send(message).await?;
        Ok(Dispatch {
            agent_id,
            message_id,
            outcome,
        })
    }

    // Messaging

    pub async fn send(&self, message: Message) -> Result<SendOutcome> {
        self.bus.send(message).await
    }

    pub async fn broadcast(&self, source_agent: &str, event_type: EventType, payload: Value, exclude: &[String]) -> Vec<String> {
        self.bus.broadcast(source_agent, event_type, payload, exclude).await
    }

    pub fn receive(&self, agent_id: &str, limit: usize) -> Vec<Message> {
        self.bus.receive(agent_id, limit)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.bus.dead_letters().list()
    }

    // Workflows

    pub async fn start_workflow(&self, workflow_id: &str, participants: Vec<String>, coordination_data: Value) -> Result<Workflow> {
        self.workflows
            .start_workflow(workflow_id, participants, coordination_data)
            .await
    }

    pub async fn complete_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        self.workflows.complete_workflow(workflow_id).await
    }

    pub async fn fail_workflow(&self, workflow_id: &str, reason: &str) -> Result<Workflow> {
        self.workflows.fail_workflow(workflow_id, reason).await
    }

    pub async fn workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows.get(workflow_id).await
    }

    pub async fn workflows(&self) -> Vec<Workflow> {
        self.workflows.list().await
    }

    /// Run an execution pattern over the named agents.
    pub async fn execute_pattern(&self, kind: PatternKind, agent_ids: &[String], task: &Value) -> Result<Vec<PatternResult>> {
        let agents = agent_ids
            .iter()
            .map(|id| {
                self.registry
                    .get(id)
                    .ok_or_else(|| Error::NotFound(format!("agent '{}'", id)))
            })
            .collect::<Result<Vec<Agent>>>()?;

        let ctx = PatternContext::new(
            self.bus.clone(),
            ENGINE_ID,
            Duration::from_secs(self.settings.patterns.response_timeout_secs),
        );
        tracing::info!(pattern = %kind, agents = agents.len(), "Executing pattern");
        kind.pattern().execute(&ctx, &agents, task).await
    }

    // Housekeeping

    pub async fn status(&self) -> EngineStatus {
        let now = Utc::now();
        EngineStatus {
            engine_id: ENGINE_ID.to_string(),
            status: "running".to_string(),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            registered_agents: self.registry.len(),
            live_connections: self.bus.connection_count(),
            active_workflows: self.workflows.active_count().await,
            queued_messages: self.bus.queued_total(),
            pending_responses: self.bus.pending().len(),
            retrying_messages: self.bus.retrying_count(),
            dead_letters: self.bus.dead_letters().len(),
            message_stats: self.bus.stats(),
        }
    }

    /// Purge expired pending responses and workflows.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> CleanupReport {
        let expired = self.bus.purge_expired_responses(now);
        let purged = self.workflows.purge_expired(now).await;
        if !expired.is_empty() || !purged.is_empty() {
            tracing::info!(
                expired_responses = expired.len(),
                purged_workflows = purged.len(),
                "Cleanup"
            );
        }
        CleanupReport {
            expired_responses: expired.len(),
            purged_workflows: purged,
        }
    }

    /// Start the background loops: heartbeat sweep, workflow event
    /// handling, periodic cleanup and (when configured) selector retuning.
    /// All stop when `token` is cancelled.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let monitor = self.monitor.clone().spawn(token.clone());
        let workflows = self.workflows.clone().spawn(token.clone());
        let retune = (self.settings.selector.retune_interval_secs > 0).then(|| self.spawn_retune(token.clone()));

        let engine = self.clone();
        let period = Duration::from_secs(self.settings.workflow.cleanup_interval_secs.max(1));
        let cleanup = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        engine.cleanup(Utc::now()).await;
                    }
                }
            }
            tracing::debug!("Cleanup loop stopped");
        });

        let mut handles = vec![monitor, workflows, cleanup];
        handles.extend(retune);

        tracing::info!(engine = ENGINE_ID, "Engine started");
        handles
    }

    /// Periodically retune selection weights from recorded outcomes.
    fn spawn_retune(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let period = Duration::from_secs(self.settings.selector.retune_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; there is nothing to learn from yet.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let version = engine.retune();
                        tracing::debug!(version, "Selection policy retune pass");
                    }
                }
            }
            tracing::debug!("Retune loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStatus;

    fn engine() -> Engine {
        Engine::new(Settings::default()).unwrap()
    }

    fn status_events(messages: &[Message], event: &str) -> Vec<Message> {
        messages
            .iter()
            .filter(|m| m.event_type == EventType::StatusUpdate && m.payload["event"] == event)
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_register_broadcasts_to_others() {
        let engine = engine();
        engine
            .register_agent(AgentRegistration::new("A", &["backend"], 8))
            .await
            .unwrap();
        engine
            .register_agent(AgentRegistration::new("B", &["frontend"], 5))
            .await
            .unwrap();

        let inbox_a = engine.receive("A", 10);
        let announced = status_events(&inbox_a, "agent_registered");
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].payload["agent_id"], "B");
        assert!(status_events(&engine.receive("B", 10), "agent_registered").is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_malformed_capabilities() {
        let engine = engine();
        let err = engine
            .register_agent(AgentRegistration::new("A", &["has space"], 5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "registration");
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_select_scenario() {
        let engine = engine();
        engine
            .register_agent(AgentRegistration::new("A", &["backend", "api"], 8))
            .await
            .unwrap();
        engine
            .register_agent(AgentRegistration::new("B", &["frontend"], 5))
            .await
            .unwrap();
        let picked = engine
            .select_best(&SelectionRequest::new("api_build", &["backend"]))
            .unwrap();
        assert_eq!(picked, "A");
    }

    #[tokio::test]
    async fn test_dispatch_sends_task_request() {
        let engine = engine();
        engine
            .register_agent(AgentRegistration::new("A", &["backend"], 5))
            .await
            .unwrap();
        let dispatch = engine
            .dispatch(
                &SelectionRequest::new("api_build", &["backend"]),
                json!({"resource": "users"}),
                Priority::HIGH,
            )
            .await
            .unwrap();
        assert_eq!(dispatch.agent_id, "A");

        let inbox = engine.receive("A", 10);
        let task = inbox
            .iter()
            .find(|m| m.event_type == EventType::TaskRequest)
            .unwrap();
        assert_eq!(task.id, dispatch.message_id);
        assert_eq!(task.payload["task_type"], "api_build");
        assert_eq!(task.payload["resource"], "users");
    }

    #[tokio::test]
    async fn test_dispatch_without_candidate() {
        let engine = engine();
        let err = engine
            .dispatch(&SelectionRequest::new("anything", &[]), json!({}), Priority::NORMAL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCandidate { .. }));
    }

    #[tokio::test]
    async fn test_update_state_announces_once() {
        let engine = engine();
        engine
            .register_agent(AgentRegistration::new("A", &["ops"], 5))
            .await
            .unwrap();
        engine
            .register_agent(AgentRegistration::new("B", &["ops"], 5))
            .await
            .unwrap();
        engine.receive("B", 10);

        engine.update_agent_state("A", AgentState::Busy).await.unwrap();
        engine.update_agent_state("A", AgentState::Busy).await.unwrap();

        let changes = status_events(&engine.receive("B", 10), "agent_state_changed");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].payload["new_state"], "busy");
    }

    #[tokio::test]
    async fn test_unregister_then_send_is_unknown_target() {
        let engine = engine();
        engine
            .register_agent(AgentRegistration::new("A", &["ops"], 5))
            .await
            .unwrap();
        assert!(engine.unregister_agent("A").await.is_some());
        assert!(engine.unregister_agent("A").await.is_none());

        let err = engine
            .send(Message::new(EventType::TaskRequest, "cli", json!({})).to("A"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_target");
        assert!(engine.dead_letters().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_disconnected() {
        let engine = engine();
        engine
            .register_agent(AgentRegistration::new("A", &["ops"], 5))
            .await
            .unwrap();
        engine.registry().set_state("A", AgentState::Disconnected).unwrap();

        engine.heartbeat("A").await.unwrap();
        assert_eq!(engine.registry().get("A").unwrap().state, AgentState::Idle);
        assert!(engine.heartbeat("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let engine = engine();
        engine
            .register_agent(AgentRegistration::new("A", &["ops"], 5))
            .await
            .unwrap();
        engine
            .send(Message::new(EventType::TaskRequest, "cli", json!({})).to("A"))
            .await
            .unwrap();

        let status = engine.status().await;
        assert_eq!(status.engine_id, ENGINE_ID);
        assert_eq!(status.registered_agents, 1);
        assert_eq!(status.queued_messages, 1);
        assert_eq!(status.dead_letters, 0);

        let agents = engine.list_agents();
        assert_eq!(agents[0].queued_messages, 1);
        assert!(!agents[0].connected);
    }

    #[tokio::test]
    async fn test_cleanup_force_fails_stale_workflow() {
        let engine = engine();
        engine
            .register_agent(AgentRegistration::new("A", &["ops"], 5))
            .await
            .unwrap();
        engine
            .start_workflow("W", vec!["A".to_string()], json!({}))
            .await
            .unwrap();
        assert_eq!(
            engine.workflow("W").await.unwrap().status,
            WorkflowStatus::Coordinating
        );

        let report = engine
            .cleanup(Utc::now() + chrono::Duration::hours(25))
            .await;
        assert_eq!(report.purged_workflows, vec!["W"]);
        assert_eq!(report.expired_responses, 1);
        assert!(engine.workflow("W").await.is_none());
    }

    #[tokio::test]
    async fn test_execute_pattern_unknown_agent() {
        let engine = engine();
        let err = engine
            .execute_pattern(PatternKind::Parallel, &["ghost".to_string()], &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_dead_letter_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.bus.dead_letter_path = Some(dir.path().join("dead.jsonl"));
        let engine = Engine::new(settings).unwrap();
        assert!(engine.dead_letters().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_retune_applies_outcomes() {
        use crate::selector::ScoringPolicy;

        let mut settings = Settings::default();
        settings.selector.retune_min_samples = 1;
        settings.selector.retune_interval_secs = 5;
        let engine = Arc::new(Engine::new(settings).unwrap());
        engine
            .register_agent(AgentRegistration::new("A", &["backend"], 5))
            .await
            .unwrap();

        let request = SelectionRequest {
            task_type: "api".to_string(),
            required_capabilities: vec!["backend".to_string()],
            exclude: vec![],
        };
        for _ in 0..3 {
            assert_eq!(engine.select_best(&request).unwrap(), "A");
            engine
                .record_outcome("A", true, Duration::from_millis(200), Some("api"))
                .unwrap();
        }
        assert_eq!(engine.selector().policy().version(), 1);

        let token = CancellationToken::new();
        let handles = engine.start(token.clone());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(engine.selector().policy().version(), 2);

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_retune_disabled_by_zero_interval() {
        let mut settings = Settings::default();
        settings.selector.retune_interval_secs = 0;
        let engine = Arc::new(Engine::new(settings).unwrap());
        let token = CancellationToken::new();
        let handles = engine.start(token.clone());
        assert_eq!(handles.len(), 3);
        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
