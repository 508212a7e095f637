//! Gateway client used by the CLI and by remote agents.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::bus::SendOutcome;
use crate::engine::EngineStatus;
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::registry::AgentRegistration;
use crate::selector::SelectionRequest;

use super::frames::{decode, encode, ClientFrame, ServerFrame};

pub struct GatewayClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    connection_id: String,
    /// Pushed messages that arrived while waiting for a reply.
    inbox: VecDeque<Message>,
}

impl GatewayClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read_half).lines(),
            writer,
            connection_id: String::new(),
            inbox: VecDeque::new(),
        };

        match client.next_frame().await? {
            ServerFrame::ConnectionEstablished { connection_id } => {
                tracing::debug!(%connection_id, "Connected to gateway at {}", addr);
                client.connection_id = connection_id;
                Ok(client)
            }
            other => Err(Error::Transport(format!("unexpected greeting: {:?}", other))),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn register(&mut self, registration: AgentRegistration) -> Result<String> {
        match self.call(ClientFrame::RegisterAgent(registration)).await? {
            ServerFrame::RegistrationSuccess { agent_id } => Ok(agent_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn send_message(&mut self, message: Message) -> Result<SendOutcome> {
        match self.call(ClientFrame::SendMessage { message }).await? {
            ServerFrame::SendResult { outcome, .. } => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&mut self) -> Result<EngineStatus> {
        match self.call(ClientFrame::GetStatus).await? {
            ServerFrame::StatusResponse { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn heartbeat(&mut self, agent_id: &str) -> Result<()> {
        let frame = ClientFrame::Heartbeat {
            agent_id: agent_id.to_string(),
        };
        match self.call(frame).await? {
            ServerFrame::HeartbeatAck { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn select(&mut self, request: SelectionRequest) -> Result<String> {
        match self.call(ClientFrame::SelectAgent(request)).await? {
            ServerFrame::Selection { agent_id } => Ok(agent_id),
            other => Err(unexpected(other)),
        }
    }

    /// Report how a task went so the engine can score the agent.
    pub async fn report_outcome(
        &mut self,
        agent_id: &str,
        success: bool,
        completion_time: Duration,
        task_type: Option<&str>,
    ) -> Result<()> {
        let frame = ClientFrame::ReportOutcome {
            agent_id: agent_id.to_string(),
            success,
            completion_time_ms: completion_time.as_millis() as u64,
            task_type: task_type.map(str::to_string),
        };
        match self.call(frame).await? {
            ServerFrame::OutcomeRecorded { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Wait for the next message pushed to this connection's agent.
    pub async fn next_message(&mut self) -> Result<Message> {
        if let Some(message) = self.inbox.pop_front() {
            return Ok(message);
        }
        loop {
            match self.next_frame().await? {
                ServerFrame::NewMessage { message } => return Ok(message),
                other => tracing::debug!("Ignoring unsolicited frame: {:?}", other),
            }
        }
    }

    /// Send one frame and wait for its reply, buffering pushed messages.
    async fn call(&mut self, frame: ClientFrame) -> Result<ServerFrame> {
        let line = encode(&frame)?;
        self.writer.write_all(line.as_bytes()).await?;

        loop {
            match self.next_frame().await? {
                ServerFrame::NewMessage { message } => self.inbox.push_back(message),
                ServerFrame::Error { kind, message } => return Err(Error::Gateway { kind, message }),
                reply => return Ok(reply),
            }
        }
    }

    async fn next_frame(&mut self) -> Result<ServerFrame> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode(&line),
                None => return Err(Error::Transport("gateway closed the connection".to_string())),
            }
        }
    }
}

fn unexpected(frame: ServerFrame) -> Error {
    Error::Transport(format!("unexpected reply: {:?}", frame))
}
