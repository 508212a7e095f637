//! Real-time transport: newline-delimited JSON frames over TCP.
//!
//! A socket that registers an agent becomes that agent's live connection
//! until it closes; queued messages are pumped over it.

pub mod client;
pub mod frames;
pub mod server;

pub use client::GatewayClient;
pub use frames::{ClientFrame, ServerFrame};
pub use server::{run_gateway, serve, SocketConnection};
