//! Coordination protocol for agentmesh.
//!
//! This module defines the records every other component speaks:
//! - Messages with correlation IDs and bounded priorities
//! - Event types, including free-form custom events
//! - Per-agent priority mailboxes

pub mod mailbox;
pub mod message;
pub mod types;

pub use mailbox::{Mailbox, MailboxStats};
pub use message::{generate_id, Message};
pub use types::{AgentState, EventType, Priority};
