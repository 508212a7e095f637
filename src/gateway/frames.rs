//! Wire frames: one JSON object per line, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::bus::SendOutcome;
use crate::engine::EngineStatus;
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::registry::AgentRegistration;
use crate::selector::SelectionRequest;

/// Client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    RegisterAgent(AgentRegistration),
    SendMessage { message: Message },
    GetStatus,
    Heartbeat { agent_id: String },
    SelectAgent(SelectionRequest),
    /// A remote worker's task result, feeding selection performance.
    ReportOutcome {
        agent_id: String,
        success: bool,
        completion_time_ms: u64,
        #[serde(default)]
        task_type: Option<String>,
    },
}

/// Server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionEstablished { connection_id: String },
    RegistrationSuccess { agent_id: String },
    SendResult { message_id: String, outcome: SendOutcome },
    StatusResponse { status: EngineStatus },
    Selection { agent_id: String },
    HeartbeatAck { agent_id: String },
    OutcomeRecorded { agent_id: String },
    NewMessage { message: Message },
    Error { kind: String, message: String },
}

impl ServerFrame {
    pub fn error(err: &Error) -> Self {
        ServerFrame::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Serialize a frame as one newline-terminated line.
pub fn encode<T: Serialize>(frame: &T) -> Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventType;
    use serde_json::json;

    #[test]
    fn test_register_frame_shape() {
        let frame: ClientFrame = decode(
            r#"{"type":"register_agent","agent_id":"A","capabilities":["backend"],"priority":8}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::RegisterAgent(reg) => {
                assert_eq!(reg.agent_id, "A");
                assert_eq!(reg.priority, 8);
                assert!(reg.subscriptions.is_empty());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_unit_and_error_frames() {
        assert!(matches!(
            decode::<ClientFrame>(r#"{"type":"get_status"}"#).unwrap(),
            ClientFrame::GetStatus
        ));

        let line = encode(&ServerFrame::Error {
            kind: "unknown_target".to_string(),
            message: "no such agent".to_string(),
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "unknown_target");
    }

    #[test]
    fn test_send_message_carries_wire_message() {
        let line = json!({
            "type": "send_message",
            "message": {
                "event_type": "task_request",
                "source_agent": "cli",
                "target_agent": "A",
                "payload": {"x": 1},
                "priority": 12
            }
        })
        .to_string();
        let ClientFrame::SendMessage { message } = decode(&line).unwrap() else {
            panic!("expected send_message");
        };
        assert_eq!(message.event_type, EventType::TaskRequest);
        assert_eq!(message.priority.value(), 10);
        assert!(!message.id.is_empty());
        assert!(!message.requires_response);
    }

    #[test]
    fn test_report_outcome_task_type_optional() {
        let frame: ClientFrame = decode(
            r#"{"type":"report_outcome","agent_id":"A","success":true,"completion_time_ms":1500}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::ReportOutcome {
                agent_id,
                success,
                completion_time_ms,
                task_type,
            } => {
                assert_eq!(agent_id, "A");
                assert!(success);
                assert_eq!(completion_time_ms, 1500);
                assert!(task_type.is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_json_error() {
        let err = decode::<ClientFrame>("not json").unwrap_err();
        assert_eq!(err.kind(), "json");
    }
}
