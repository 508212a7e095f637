//! Multi-agent workflow coordination.
//!
//! `Initializing -> Coordinating -> Running -> {Completed | Failed}`.
//! Each workflow sits behind its own lock; unrelated workflows never contend.
//! Participant failures arrive as [`BusEvent`]s and are handled
//! asynchronously, never by blocking the caller that started the workflow.

pub mod model;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::config::WorkflowConfig;
use crate::error::{Error, Result};
use crate::events::{BusEvent, EventHubError};
use crate::protocol::{AgentState, EventType, Message, Priority};

pub use model::{Workflow, WorkflowStatus};

/// Which workflow a coordination message belongs to.
#[derive(Debug, Clone)]
struct CoordinationRef {
    workflow_id: String,
    participant: String,
}

pub struct WorkflowCoordinator {
    bus: Arc<MessageBus>,
    workflows: DashMap<String, Arc<Mutex<Workflow>>>,
    coordination_index: DashMap<String, CoordinationRef>,
    config: WorkflowConfig,
    engine_id: String,
}

impl WorkflowCoordinator {
    pub fn new(bus: Arc<MessageBus>, config: WorkflowConfig, engine_id: impl Into<String>) -> Self {
        Self {
            bus,
            workflows: DashMap::new(),
            coordination_index: DashMap::new(),
            config,
            engine_id: engine_id.into(),
        }
    }

    /// Create a workflow and send one coordination request per participant.
    ///
    /// Returns once every request is queued; acknowledgments arrive later.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        participants: Vec<String>,
        coordination_data: Value,
    ) -> Result<Workflow> {
        let workflow_id = workflow_id.trim();
        if workflow_id.is_empty() {
            return Err(Error::Workflow("workflow id must not be empty".to_string()));
        }
        if participants.is_empty() {
            return Err(Error::Workflow(format!("workflow '{}' has no participants", workflow_id)));
        }

        let mut unique = Vec::with_capacity(participants.len());
        for p in participants {
            if !self.bus.registry().contains(&p) {
                return Err(Error::Workflow(format!(
                    "participant '{}' of workflow '{}' is not registered",
                    p, workflow_id
                )));
            }
            if !unique.contains(&p) {
                unique.push(p);
            }
        }

        let slot = Arc::new(Mutex::new(Workflow::new(workflow_id, unique.clone(), coordination_data.clone())));
        {
            use dashmap::mapref::entry::Entry;
            match self.workflows.entry(workflow_id.to_string()) {
                Entry::Occupied(_) => {
                    return Err(Error::Workflow(format!("workflow '{}' already exists", workflow_id)));
                }
                Entry::Vacant(v) => {
                    v.insert(slot.clone());
                }
            }
        }

        let mut workflow = slot.lock().await;
        tracing::info!(workflow = %workflow_id, participants = ?unique, "Starting workflow");

        let priority = Priority::new(self.config.coordination_priority as i64);
        for participant in &unique {
            let request = Message::new(
                EventType::Coordination,
                self.engine_id.as_str(),
                json!({
                    "workflow_id": workflow_id,
                    "action": "join_workflow",
                    "coordination_data": coordination_data,
                }),
            )
            .to(participant.as_str())
            .with_priority(priority)
            .requiring_response();

            self.coordination_index.insert(
                request.id.clone(),
                CoordinationRef {
                    workflow_id: workflow_id.to_string(),
                    participant: participant.clone(),
                },
            );
            let request_id = request.id.clone();
            if let Err(e) = self.bus.send(request).await {
                self.coordination_index.remove(&request_id);
                let reason = format!("coordination request to '{}' failed: {}", participant, e);
                drop(workflow);
                self.fail_internal(workflow_id, &reason, Some(participant)).await;
                return Err(Error::Workflow(reason));
            }
        }

        workflow.transition(WorkflowStatus::Coordinating);
        self.publish_status(&workflow);
        Ok(workflow.clone())
    }

    /// React to a bus event.
    pub async fn handle_event(&self, event: &BusEvent) {
        match event {
            BusEvent::ResponseReceived { request, .. } => {
                if let Some((_, r)) = self.coordination_index.remove(&request.id) {
                    self.acknowledge(&r.workflow_id, &r.participant).await;
                }
            }
            BusEvent::ResponseExpired { request } => {
                if let Some((_, r)) = self.coordination_index.remove(&request.id) {
                    self.flag_unanswered(&r.workflow_id, &r.participant).await;
                }
            }
            BusEvent::AgentStateChanged {
                agent_id,
                new_state: AgentState::Disconnected,
                ..
            } => {
                for workflow_id in self.active_workflows_with(agent_id).await {
                    let reason = format!("participant '{}' disconnected", agent_id);
                    self.fail_internal(&workflow_id, &reason, Some(agent_id)).await;
                }
            }
            BusEvent::DeliveryFailed { message, .. } | BusEvent::DeadLettered { message, .. } => {
                if let Some((workflow_id, participant)) = self.workflow_of(message).await {
                    let reason = format!("delivery to participant '{}' failed", participant);
                    self.fail_internal(&workflow_id, &reason, Some(&participant)).await;
                }
            }
            _ => {}
        }
    }

    /// Mark a running workflow completed.
    pub async fn complete_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let slot = self.slot(workflow_id)?;
        let mut workflow = slot.lock().await;
        if workflow.status != WorkflowStatus::Running {
            return Err(Error::Workflow(format!(
                "workflow '{}' is {}, not running",
                workflow_id, workflow.status
            )));
        }
        workflow.transition(WorkflowStatus::Completed);
        tracing::info!(workflow = %workflow_id, "Workflow completed");
        self.publish_status(&workflow);
        Ok(workflow.clone())
    }

    /// Fail a workflow and notify its participants.
    pub async fn fail_workflow(&self, workflow_id: &str, reason: &str) -> Result<Workflow> {
        let slot = self.slot(workflow_id)?;
        if slot.lock().await.status.is_terminal() {
            return Err(Error::Workflow(format!("workflow '{}' already terminated", workflow_id)));
        }
        self.fail_internal(workflow_id, reason, None).await;
        let workflow = slot.lock().await.clone();
        Ok(workflow)
    }

    pub async fn get(&self, workflow_id: &str) -> Option<Workflow> {
        let slot = self.workflows.get(workflow_id).map(|w| w.value().clone())?;
        let workflow = slot.lock().await;
        Some(workflow.clone())
    }

    pub async fn list(&self) -> Vec<Workflow> {
        let mut out = Vec::new();
        for slot in self.slots() {
            out.push(slot.lock().await.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for slot in self.slots() {
            if !slot.lock().await.status.is_terminal() {
                count += 1;
            }
        }
        count
    }

    /// Remove workflows past the TTL, force-failing any still in flight.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let ttl = chrono::Duration::seconds(self.config.ttl_secs as i64);
        let mut expired = Vec::new();

        for slot in self.slots() {
            let (id, terminal, reference) = {
                let w = slot.lock().await;
                (w.id.clone(), w.status.is_terminal(), w.age_reference())
            };
            if now - reference <= ttl {
                continue;
            }
            if !terminal {
                let reason = Error::WorkflowTimeout(id.clone()).to_string();
                tracing::warn!(workflow = %id, "Workflow exceeded TTL, force-failing");
                self.fail_internal(&id, &reason, None).await;
            }
            self.workflows.remove(&id);
            self.coordination_index.retain(|_, r| r.workflow_id != id);
            tracing::debug!(workflow = %id, "Purged workflow");
            expired.push(id);
        }
        expired
    }

    /// Consume bus events until cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let mut events = self.bus.events().subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => self.handle_event(&event).await,
                        Err(EventHubError::Lagged(_)) => continue,
                        Err(EventHubError::Closed) => break,
                    }
                }
            }
            tracing::debug!("Workflow event loop stopped");
        })
    }

    fn slot(&self, workflow_id: &str) -> Result<Arc<Mutex<Workflow>>> {
        self.workflows
            .get(workflow_id)
            .map(|w| w.value().clone())
            .ok_or_else(|| Error::NotFound(format!("workflow '{}'", workflow_id)))
    }

    fn slots(&self) -> Vec<Arc<Mutex<Workflow>>> {
        self.workflows.iter().map(|w| w.value().clone()).collect()
    }

    async fn acknowledge(&self, workflow_id: &str, participant: &str) {
        let Ok(slot) = self.slot(workflow_id) else { return };
        let mut workflow = slot.lock().await;
        if workflow.status.is_terminal() || !workflow.acknowledged.insert(participant.to_string()) {
            return;
        }
        workflow.unanswered.remove(participant);
        workflow.current_step += 1;
        workflow.updated_at = Utc::now();
        tracing::debug!(
            workflow = %workflow_id,
            %participant,
            step = workflow.current_step,
            "Participant acknowledged"
        );

        if workflow.all_acknowledged() {
            workflow.transition(WorkflowStatus::Running);
            tracing::info!(workflow = %workflow_id, "Workflow running");
            self.publish_status(&workflow);
        }
    }

    async fn flag_unanswered(&self, workflow_id: &str, participant: &str) {
        let Ok(slot) = self.slot(workflow_id) else { return };
        let mut workflow = slot.lock().await;
        if workflow.status.is_terminal() || workflow.acknowledged.contains(participant) {
            return;
        }
        tracing::warn!(
            workflow = %workflow_id,
            %participant,
            "Coordination request expired unanswered"
        );
        workflow.unanswered.insert(participant.to_string());
        workflow.updated_at = Utc::now();
    }

    async fn active_workflows_with(&self, agent_id: &str) -> Vec<String> {
        let mut ids = Vec::new();
        for slot in self.slots() {
            let w = slot.lock().await;
            if !w.status.is_terminal() && w.has_participant(agent_id) {
                ids.push(w.id.clone());
            }
        }
        ids
    }

    /// Map a failed message to `(workflow, participant)`.
    async fn workflow_of(&self, message: &Message) -> Option<(String, String)> {
        if let Some((_, r)) = self.coordination_index.remove(&message.id) {
            return Some((r.workflow_id, r.participant));
        }
        let workflow_id = message.payload.get("workflow_id")?.as_str()?;
        let target = message.target_agent.as_deref()?;
        let slot = self.slot(workflow_id).ok()?;
        let w = slot.lock().await;
        (!w.status.is_terminal() && w.has_participant(target))
            .then(|| (workflow_id.to_string(), target.to_string()))
    }

    /// Move to Failed and tell the remaining participants. No-op when terminal.
    async fn fail_internal(&self, workflow_id: &str, reason: &str, failed_participant: Option<&str>) {
        let Ok(slot) = self.slot(workflow_id) else { return };
        let recipients: Vec<String> = {
            let mut workflow = slot.lock().await;
            if workflow.status.is_terminal() {
                return;
            }
            workflow.failure_reason = Some(reason.to_string());
            workflow.transition(WorkflowStatus::Failed);
            tracing::warn!(workflow = %workflow_id, %reason, "Workflow failed");
            self.publish_status(&workflow);

            workflow
                .participants
                .iter()
                .filter(|p| Some(p.as_str()) != failed_participant)
                .cloned()
                .collect()
        };
        self.coordination_index.retain(|_, r| r.workflow_id != workflow_id);

        let notice = Message::new(
            EventType::WorkflowFailed,
            self.engine_id.as_str(),
            json!({
                "workflow_id": workflow_id,
                "reason": reason,
                "failed_participant": failed_participant,
            }),
        )
        .with_priority(Priority::new(self.config.coordination_priority as i64));
        self.bus.fan_out(notice, &recipients).await;
    }

    fn publish_status(&self, workflow: &Workflow) {
        self.bus.events().publish(BusEvent::WorkflowStatusChanged {
            workflow_id: workflow.id.clone(),
            status: workflow.status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryDeadLetters;
    use crate::config::BusConfig;
    use crate::events::{EventHub, EventReceiver};
    use crate::registry::{AgentRegistration, AgentRegistry, CapabilityTaxonomy};

    fn setup() -> (Arc<MessageBus>, WorkflowCoordinator, EventReceiver) {
        let registry = Arc::new(AgentRegistry::new(CapabilityTaxonomy::new()));
        for id in ["A", "B", "C"] {
            registry
                .register(AgentRegistration::new(id, &["ops"], 5))
                .unwrap();
        }
        let bus = Arc::new(MessageBus::new(
            registry,
            Arc::new(InMemoryDeadLetters::new()),
            EventHub::default(),
            BusConfig::default(),
        ));
        let events = bus.events().subscribe();
        let coordinator = WorkflowCoordinator::new(bus.clone(), WorkflowConfig::default(), "engine");
        (bus, coordinator, events)
    }

    async fn pump(coordinator: &WorkflowCoordinator, events: &mut EventReceiver) {
        for event in events.drain() {
            coordinator.handle_event(&event).await;
        }
    }

    async fn acknowledge(bus: &MessageBus, agent: &str) {
        let inbox = bus.receive(agent, 10);
        let request = inbox
            .iter()
            .find(|m| m.event_type == EventType::Coordination)
            .unwrap();
        assert_eq!(request.payload["action"], "join_workflow");
        let reply = request.reply(agent, EventType::TaskResponse, json!({"joined": true}));
        bus.send(reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_all_acknowledged_runs() {
        let (bus, coordinator, mut events) = setup();
        let wf = coordinator
            .start_workflow("W", vec!["A".into(), "B".into()], json!({"goal": "ship"}))
            .await
            .unwrap();
        assert_eq!(wf.status, WorkflowStatus::Coordinating);
        assert_eq!(bus.pending().len(), 2);

        acknowledge(&bus, "A").await;
        pump(&coordinator, &mut events).await;
        let w = coordinator.get("W").await.unwrap();
        assert_eq!(w.status, WorkflowStatus::Coordinating);
        assert_eq!(w.current_step, 1);

        acknowledge(&bus, "B").await;
        pump(&coordinator, &mut events).await;
        assert_eq!(coordinator.get("W").await.unwrap().status, WorkflowStatus::Running);

        let done = coordinator.complete_workflow("W").await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.terminated_at.is_some());
    }

    #[tokio::test]
    async fn test_unanswered_stays_coordinating() {
        let (bus, coordinator, mut events) = setup();
        coordinator
            .start_workflow("W", vec!["A".into(), "B".into()], json!({}))
            .await
            .unwrap();
        acknowledge(&bus, "A").await;
        pump(&coordinator, &mut events).await;

        let expired = bus.purge_expired_responses(Utc::now() + chrono::Duration::seconds(3601));
        assert_eq!(expired.len(), 1);
        assert!(bus.pending().is_empty());
        pump(&coordinator, &mut events).await;

        let w = coordinator.get("W").await.unwrap();
        assert_eq!(w.status, WorkflowStatus::Coordinating);
        assert!(w.unanswered.contains("B"));
    }

    #[tokio::test]
    async fn test_disconnect_fails_and_notifies() {
        let (bus, coordinator, mut events) = setup();
        coordinator
            .start_workflow("W", vec!["A".into(), "B".into(), "C".into()], json!({}))
            .await
            .unwrap();
        bus.receive("A", 10);

        coordinator
            .handle_event(&BusEvent::AgentStateChanged {
                agent_id: "B".to_string(),
                previous: AgentState::Idle,
                new_state: AgentState::Disconnected,
            })
            .await;

        let w = coordinator.get("W").await.unwrap();
        assert_eq!(w.status, WorkflowStatus::Failed);
        assert!(w.failure_reason.unwrap().contains("B"));

        let notices = bus.receive("A", 10);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].event_type, EventType::WorkflowFailed);
        assert!(bus
            .receive("B", 10)
            .iter()
            .all(|m| m.event_type != EventType::WorkflowFailed));
        assert!(events
            .drain()
            .iter()
            .any(|e| matches!(e, BusEvent::WorkflowStatusChanged { status: WorkflowStatus::Failed, .. })));
    }

    #[tokio::test]
    async fn test_rejects_bad_starts() {
        let (_bus, coordinator, _events) = setup();
        assert!(coordinator
            .start_workflow("W", vec!["ghost".into()], json!({}))
            .await
            .is_err());
        assert!(coordinator.start_workflow("W", vec![], json!({})).await.is_err());

        coordinator
            .start_workflow("W", vec!["A".into()], json!({}))
            .await
            .unwrap();
        assert!(coordinator
            .start_workflow("W", vec!["A".into()], json!({}))
            .await
            .is_err());
        assert!(coordinator.complete_workflow("W").await.is_err());
    }

    #[tokio::test]
    async fn test_fail_returns_failed_snapshot() {
        let (bus, coordinator, _events) = setup();
        coordinator
            .start_workflow("W", vec!["A".into(), "B".into()], json!({}))
            .await
            .unwrap();
        bus.receive("A", 10);

        let failed = coordinator.fail_workflow("W", "operator abort").await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("operator abort"));
        assert!(failed.terminated_at.is_some());
        assert!(coordinator.fail_workflow("W", "again").await.is_err());
    }

    #[tokio::test]
    async fn test_purge_force_fails_stale() {
        let (bus, coordinator, _events) = setup();
        coordinator
            .start_workflow("W", vec!["A".into()], json!({}))
            .await
            .unwrap();
        bus.receive("A", 10);

        assert!(coordinator.purge_expired(Utc::now()).await.is_empty());
        let purged = coordinator
            .purge_expired(Utc::now() + chrono::Duration::hours(25))
            .await;
        assert_eq!(purged, vec!["W"]);
        assert!(coordinator.get("W").await.is_none());

        let notice = bus.receive("A", 10);
        assert_eq!(notice[0].event_type, EventType::WorkflowFailed);
        assert!(notice[0].payload["reason"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_fails_workflow() {
        use crate::bus::transport::testing::RecordingConnection;
        use std::time::Duration;

        let (bus, coordinator, mut events) = setup();
        let conn = Arc::new(RecordingConnection::new("b-socket", u32::MAX));
        bus.attach_connection("B", conn.clone());

        coordinator
            .start_workflow("W", vec!["A".into(), "B".into()], json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        pump(&coordinator, &mut events).await;

        assert_eq!(conn.attempts(), 3);
        assert_eq!(bus.dead_letters().len(), 1);

        let w = coordinator.get("W").await.unwrap();
        assert_eq!(w.status, WorkflowStatus::Failed);
        assert!(w.failure_reason.unwrap().contains("'B'"));

        let inbox = bus.receive("A", 10);
        let notices: Vec<&Message> = inbox
            .iter()
            .filter(|m| m.event_type == EventType::WorkflowFailed)
            .collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].payload["failed_participant"], "B");
    }
}
