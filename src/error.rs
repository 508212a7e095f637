//! Error types for agentmesh.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("No eligible agent for task '{task_type}'")]
    NoCandidate { task_type: String },

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Workflow timed out: {0}")]
    WorkflowTimeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An error frame returned by a remote gateway.
    #[error("Gateway error ({kind}): {message}")]
    Gateway { kind: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short machine-readable kind, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Registration(_) => "registration",
            Error::Delivery(e) => e.kind.as_str(),
            Error::NoCandidate { .. } => "no_candidate",
            Error::Workflow(_) => "workflow",
            Error::WorkflowTimeout(_) => "workflow_timeout",
            Error::Transport(_) => "transport",
            Error::NotFound(_) => "not_found",
            Error::Gateway { .. } => "gateway",
            Error::Other(_) => "other",
        }
    }
}

/// Why a message could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryErrorKind {
    /// Target id is not registered. Never retried, never dead-lettered.
    UnknownTarget,
    /// A live transport write failed. Retried with backoff, then dead-lettered.
    TransientTransportFailure,
    /// No correlated response arrived in time (request/response helper only).
    ResponseTimeout,
}

impl DeliveryErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryErrorKind::UnknownTarget => "unknown_target",
            DeliveryErrorKind::TransientTransportFailure => "transient_transport_failure",
            DeliveryErrorKind::ResponseTimeout => "response_timeout",
        }
    }
}

impl fmt::Display for DeliveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} (message {message_id}, target {})", .target.as_deref().unwrap_or("<broadcast>"))]
pub struct DeliveryError {
    pub kind: DeliveryErrorKind,
    pub message_id: String,
    pub target: Option<String>,
}

impl DeliveryError {
    pub fn unknown_target(message_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::UnknownTarget,
            message_id: message_id.into(),
            target: Some(target.into()),
        }
    }

    pub fn response_timeout(message_id: impl Into<String>, target: Option<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::ResponseTimeout,
            message_id: message_id.into(),
            target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_display() {
        let err = DeliveryError::unknown_target("m1", "ghost");
        assert_eq!(
            err.to_string(),
            "unknown_target (message m1, target ghost)"
        );

        let wrapped: Error = err.into();
        assert_eq!(wrapped.kind(), "unknown_target");
    }
}
