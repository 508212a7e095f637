//! In-process event hub.
//!
//! Components publish [`BusEvent`]s here instead of calling each other
//! directly: the bus reports responses and dead letters, the heartbeat
//! monitor reports state changes, and the workflow coordinator consumes
//! them. Backed by a tokio broadcast channel; slow receivers lag rather
//! than block publishers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::DeliveryErrorKind;
use crate::protocol::{AgentState, Message};
use crate::workflow::WorkflowStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    AgentRegistered {
        agent_id: String,
    },
    AgentUnregistered {
        agent_id: String,
    },
    AgentStateChanged {
        agent_id: String,
        previous: AgentState,
        new_state: AgentState,
    },
    /// A tracked request received its correlated reply.
    ResponseReceived {
        request: Message,
        response: Message,
    },
    /// A tracked request was purged without a reply.
    ResponseExpired {
        request: Message,
    },
    DeliveryFailed {
        message: Message,
        kind: DeliveryErrorKind,
    },
    DeadLettered {
        message: Message,
        attempts: u32,
    },
    WorkflowStatusChanged {
        workflow_id: String,
        status: WorkflowStatus,
    },
}

impl BusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::AgentRegistered { .. } => "agent_registered",
            BusEvent::AgentUnregistered { .. } => "agent_unregistered",
            BusEvent::AgentStateChanged { .. } => "agent_state_changed",
            BusEvent::ResponseReceived { .. } => "response_received",
            BusEvent::ResponseExpired { .. } => "response_expired",
            BusEvent::DeliveryFailed { .. } => "delivery_failed",
            BusEvent::DeadLettered { .. } => "dead_lettered",
            BusEvent::WorkflowStatusChanged { .. } => "workflow_status_changed",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventHubError {
    #[error("event hub closed")]
    Closed,
    #[error("receiver lagged by {0} events")]
    Lagged(u64),
}

#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<BusEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: BusEvent) {
        debug!(event = event.name(), "Publishing bus event");
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to bus event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<BusEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<BusEvent, EventHubError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventHubError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventHubError::Lagged(n)
            }
        })
    }

    /// Drain whatever is buffered without waiting.
    pub fn drain(&mut self) -> Vec<BusEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Event receiver lagged by {} events", n);
                }
                Err(_) => break,
            }
        }
        events
    }
}
