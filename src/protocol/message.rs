//! The message record exchanged between agents and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{EventType, Priority};

/// A single message on the bus.
///
/// Messages are immutable once sent; a broadcast produces one fresh message
/// per recipient sharing a `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (ULID)
    #[serde(default = "generate_id")]
    pub id: String,
    pub event_type: EventType,
    pub source_agent: String,
    /// Recipient agent ID (None for broadcast)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Correlation ID for request/response chains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub requires_response: bool,
}

impl Message {
    /// Create an unaddressed message with normal priority.
    pub fn new(event_type: EventType, source_agent: impl Into<String>, payload: Value) -> Self {
        Self {
            id: generate_id(),
            event_type,
            source_agent: source_agent.into(),
            target_agent: None,
            payload,
            priority: Priority::default(),
            timestamp: Utc::now(),
            correlation_id: None,
            requires_response: false,
        }
    }

    /// Address to a single agent.
    pub fn to(mut self, agent_id: impl Into<String>) -> Self {
        self.target_agent = Some(agent_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark the message as expecting a correlated reply.
    pub fn requiring_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    /// Build the reply to this message: addressed back to the sender and
    /// correlated with this message's id.
    pub fn reply(&self, from_agent: impl Into<String>, event_type: EventType, payload: Value) -> Self {
        Self {
            id: generate_id(),
            event_type,
            source_agent: from_agent.into(),
            target_agent: Some(self.source_agent.clone()),
            payload,
            priority: self.priority,
            timestamp: Utc::now(),
            correlation_id: Some(self.id.clone()),
            requires_response: false,
        }
    }

    /// Copy of this message for one broadcast recipient: fresh id, same correlation.
    pub fn fork_for(&self, agent_id: &str) -> Self {
        Self {
            id: generate_id(),
            target_agent: Some(agent_id.to_string()),
            ..self.clone()
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_agent.is_none()
    }
}

pub fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::new(EventType::TaskRequest, "planner", json!({"task": "build"}))
            .to("coder")
            .with_priority(Priority::HIGH)
            .requiring_response();

        assert_eq!(msg.source_agent, "planner");
        assert_eq!(msg.target_agent.as_deref(), Some("coder"));
        assert_eq!(msg.priority, Priority::HIGH);
        assert!(msg.requires_response);
        assert!(!msg.id.is_empty());
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn test_reply_is_correlated() {
        let request = Message::new(EventType::Coordination, "engine", json!({})).to("coder");
        let reply = request.reply("coder", EventType::TaskResponse, json!({"ok": true}));

        assert_eq!(reply.correlation_id.as_deref(), Some(request.id.as_str()));
        assert_eq!(reply.target_agent.as_deref(), Some("engine"));
        assert_eq!(reply.source_agent, "coder");
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn test_wire_shape_defaults() {
        let msg: Message = serde_json::from_str(
            r#"{"event_type": "heartbeat", "source_agent": "coder", "priority": 2}"#,
        )
        .unwrap();

        assert_eq!(msg.event_type, EventType::Heartbeat);
        assert!(msg.target_agent.is_none());
        assert!(!msg.id.is_empty());
        assert_eq!(msg.priority.value(), 2);
        assert!(!msg.requires_response);
    }

    #[test]
    fn test_fork_keeps_correlation() {
        let base = Message::new(EventType::Broadcast, "engine", json!({"n": 1}))
            .with_correlation_id("corr-1");
        let a = base.fork_for("a");
        let b = base.fork_for("b");

        assert_ne!(a.id, b.id);
        assert_eq!(a.correlation_id, b.correlation_id);
        assert_eq!(b.target_agent.as_deref(), Some("b"));
    }
}
