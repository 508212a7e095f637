//! Liveness sweep over registered agents.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::config::HeartbeatConfig;
use crate::events::BusEvent;
use crate::protocol::{AgentState, EventType, Message, Priority};

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    pub pinged: Vec<String>,
    pub disconnected: Vec<String>,
    pub recovered: Vec<String>,
}

pub struct HeartbeatMonitor {
    bus: Arc<MessageBus>,
    config: HeartbeatConfig,
    engine_id: String,
}

impl HeartbeatMonitor {
    pub fn new(bus: Arc<MessageBus>, config: HeartbeatConfig, engine_id: impl Into<String>) -> Self {
        Self {
            bus,
            config,
            engine_id: engine_id.into(),
        }
    }

    /// Audit every agent against `now`.
    ///
    /// Silent past the timeout: Disconnected, connection torn down, one
    /// `agent_state_changed` broadcast. Silent past the warning window: one
    /// low-priority heartbeat request per silence window. Disconnected but
    /// heard from again: back to Idle.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let timeout = chrono::Duration::seconds(self.config.timeout_secs as i64);
        let warn_after = chrono::Duration::seconds(self.config.warn_after_secs as i64);
        let registry = self.bus.registry().clone();
        let mut report = SweepReport::default();

        for agent in registry.list() {
            let silence = now - agent.last_heartbeat;

            if silence > timeout {
                if agent.state == AgentState::Disconnected {
                    continue;
                }
                let Ok(previous) = registry.set_state(&agent.id, AgentState::Disconnected) else {
                    continue;
                };
                // Lost a race with another transition.
                if previous == AgentState::Disconnected {
                    continue;
                }
                tracing::warn!(
                    agent = %agent.id,
                    silent_secs = silence.num_seconds(),
                    "Heartbeat timeout, marking disconnected"
                );
                self.bus.detach_connection(&agent.id);
                announce_state_change(&self.bus, &self.engine_id, &agent.id, previous, AgentState::Disconnected)
                    .await;
                report.disconnected.push(agent.id);
            } else if silence > warn_after {
                if agent.last_ping_at.is_some() || agent.state == AgentState::Disconnected {
                    continue;
                }
                let ping = Message::new(
                    EventType::Heartbeat,
                    self.engine_id.as_str(),
                    json!({ "silent_secs": silence.num_seconds() }),
                )
                .to(agent.id.as_str())
                .with_priority(Priority::LOW);

                match self.bus.send(ping).await {
                    Ok(_) => {
                        registry.mark_pinged(&agent.id, now);
                        tracing::debug!(agent = %agent.id, "Sent heartbeat request");
                        report.pinged.push(agent.id);
                    }
                    Err(e) => tracing::debug!(agent = %agent.id, "Heartbeat request failed: {}", e),
                }
            } else if agent.state == AgentState::Disconnected
                && recover(&self.bus, &self.engine_id, &agent.id).await
            {
                report.recovered.push(agent.id);
            }
        }

        if !report.disconnected.is_empty() || !report.pinged.is_empty() {
            tracing::debug!(?report, "Heartbeat sweep");
        }
        report
    }

    /// Run the sweep on the configured interval until cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = period.as_secs(), "Heartbeat monitor started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("Heartbeat monitor stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        self.sweep(Utc::now()).await;
                    }
                }
            }
        })
    }
}

/// Move a Disconnected agent back to Idle. Returns true if it moved.
pub async fn recover(bus: &MessageBus, engine_id: &str, agent_id: &str) -> bool {
    let registry = bus.registry();
    match registry.get(agent_id) {
        Some(agent) if agent.state == AgentState::Disconnected => {}
        _ => return false,
    }
    let Ok(previous) = registry.set_state(agent_id, AgentState::Idle) else {
        return false;
    };
    if previous != AgentState::Disconnected {
        return false;
    }
    tracing::info!(agent = %agent_id, "Agent reconnected");
    announce_state_change(bus, engine_id, agent_id, previous, AgentState::Idle).await;
    true
}

/// Publish a state change internally and broadcast it to other agents.
pub async fn announce_state_change(
    bus: &MessageBus,
    engine_id: &str,
    agent_id: &str,
    previous: AgentState,
    new_state: AgentState,
) {
    bus.events().publish(BusEvent::AgentStateChanged {
        agent_id: agent_id.to_string(),
        previous,
        new_state,
    });
    bus.broadcast(
        engine_id,
        EventType::StatusUpdate,
        json!({
            "event": "agent_state_changed",
            "agent_id": agent_id,
            "previous_state": previous,
            "new_state": new_state,
        }),
        &[agent_id.to_string()],
    )
    .await;
}
