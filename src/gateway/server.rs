//! Gateway server: accepts TCP connections and speaks line-delimited frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{Connection, MessageBus, TransportError};
use crate::config::GatewayConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::protocol::{Mailbox, Message};

use super::frames::{decode, encode, ClientFrame, ServerFrame};

const OUTBOUND_BUFFER: usize = 64;
const PUMP_BATCH: usize = 16;
const PUMP_POLL: Duration = Duration::from_secs(1);

/// The write side of one accepted socket, usable as an agent's live transport.
pub struct SocketConnection {
    id: String,
    outbound: mpsc::Sender<String>,
    live: AtomicBool,
}

impl SocketConnection {
    fn new(id: String, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id,
            outbound,
            live: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Connection for SocketConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn push(&self, message: &Message) -> std::result::Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::new("connection closed"));
        }
        let line = encode(&ServerFrame::NewMessage {
            message: message.clone(),
        })
        .map_err(|e| TransportError::new(e.to_string()))?;
        self.outbound
            .send(line)
            .await
            .map_err(|_| TransportError::new("connection closed"))
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    fn close(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Bind the configured address and serve until cancelled.
pub async fn run_gateway(engine: Arc<Engine>, config: &GatewayConfig, token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(config.address()).await?;
    serve(engine, listener, token).await
}

pub async fn serve(engine: Arc<Engine>, listener: TcpListener, token: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("Gateway listening on {}", addr);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Gateway client connected");
                    tokio::spawn(handle_connection(engine.clone(), stream, token.child_token()));
                }
                Err(e) => tracing::warn!("Gateway accept failed: {}", e),
            }
        }
    }

    tracing::info!("Gateway stopped");
    Ok(())
}

/// The agent a socket registered, with its current transport and pump.
struct Attachment {
    agent_id: String,
    connection: Arc<SocketConnection>,
    pump: CancellationToken,
}

impl Attachment {
    fn start(
        engine: &Arc<Engine>,
        agent_id: String,
        connection_id: String,
        tx: &mpsc::Sender<String>,
        token: &CancellationToken,
    ) -> Self {
        let connection = Arc::new(SocketConnection::new(connection_id, tx.clone()));
        engine.bus().attach_connection(&agent_id, connection.clone());
        let pump_token = token.child_token();
        tokio::spawn(pump(
            engine.clone(),
            agent_id.clone(),
            connection.clone(),
            pump_token.clone(),
        ));
        Self {
            agent_id,
            connection,
            pump: pump_token,
        }
    }

    fn stop(self, engine: &Engine) {
        self.pump.cancel();
        self.connection.close();
        engine.bus().detach_connection_if(&self.agent_id, self.connection.id());
    }
}

async fn handle_connection(engine: Arc<Engine>, stream: TcpStream, token: CancellationToken) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    reply(
        &tx,
        &ServerFrame::ConnectionEstablished {
            connection_id: connection_id.clone(),
        },
    )
    .await;

    let mut attachment: Option<Attachment> = None;
    // Bumped per attachment so a rebuilt transport never reuses a closed id.
    let mut generation = 0u64;
    let mut attach = |agent_id: String| {
        generation += 1;
        let id = format!("{}/{}/{}", connection_id, agent_id, generation);
        Attachment::start(&engine, agent_id, id, &tx, &token)
    };

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(connection = %connection_id, "Gateway read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match decode::<ClientFrame>(&line) {
            Ok(frame) => frame,
            Err(e) => {
                reply(&tx, &ServerFrame::error(&e)).await;
                continue;
            }
        };

        let response = match frame {
            ClientFrame::RegisterAgent(registration) => {
                let agent_id = registration.agent_id.trim().to_string();
                match engine.register_agent(registration).await {
                    Ok(()) => {
                        match attachment.take() {
                            Some(current) if current.agent_id == agent_id && current.connection.is_live() => {
                                engine.bus().attach_connection(&agent_id, current.connection.clone());
                                attachment = Some(current);
                            }
                            previous => {
                                if let Some(previous) = previous {
                                    previous.stop(&engine);
                                }
                                attachment = Some(attach(agent_id.clone()));
                            }
                        }
                        ServerFrame::RegistrationSuccess { agent_id }
                    }
                    Err(e) => ServerFrame::error(&e),
                }
            }
            ClientFrame::SendMessage { message } => {
                let message_id = message.id.clone();
                match engine.send(message).await {
                    Ok(outcome) => ServerFrame::SendResult { message_id, outcome },
                    Err(e) => ServerFrame::error(&e),
                }
            }
            ClientFrame::GetStatus => ServerFrame::StatusResponse {
                status: engine.status().await,
            },
            ClientFrame::Heartbeat { agent_id } => match engine.heartbeat(&agent_id).await {
                Ok(()) => {
                    // A heartbeat on the registering socket after a liveness
                    // teardown brings the transport back.
                    let torn_down = attachment
                        .as_ref()
                        .is_some_and(|a| a.agent_id == agent_id && !a.connection.is_live());
                    if torn_down && !engine.bus().is_connected(&agent_id) {
                        if let Some(previous) = attachment.take() {
                            previous.stop(&engine);
                        }
                        tracing::info!(agent = %agent_id, connection = %connection_id, "Re-attaching recovered agent");
                        attachment = Some(attach(agent_id.clone()));
                    }
                    ServerFrame::HeartbeatAck { agent_id }
                }
                Err(e) => ServerFrame::error(&e),
            },
            ClientFrame::SelectAgent(request) => match engine.select_best(&request) {
                Ok(agent_id) => ServerFrame::Selection { agent_id },
                Err(e) => ServerFrame::error(&e),
            },
            ClientFrame::ReportOutcome {
                agent_id,
                success,
                completion_time_ms,
                task_type,
            } => {
                let elapsed = Duration::from_millis(completion_time_ms);
                match engine.record_outcome(&agent_id, success, elapsed, task_type.as_deref()) {
                    Ok(()) => ServerFrame::OutcomeRecorded { agent_id },
                    Err(e) => ServerFrame::error(&e),
                }
            }
        };
        reply(&tx, &response).await;
    }

    if let Some(attachment) = attachment {
        attachment.stop(&engine);
    }
    drop(tx);
    let _ = writer.await;
    tracing::debug!(connection = %connection_id, "Gateway client disconnected");
}

/// Forward queued mailbox messages over the connection while it is live.
async fn pump(engine: Arc<Engine>, agent_id: String, connection: Arc<SocketConnection>, token: CancellationToken) {
    let bus = engine.bus().clone();
    let mailbox = bus.mailbox(&agent_id);
    while connection.is_live() && !token.is_cancelled() {
        let batch = tokio::select! {
            _ = token.cancelled() => break,
            batch = mailbox.recv(PUMP_BATCH, PUMP_POLL) => batch,
        };
        forward(&bus, &mailbox, connection.as_ref(), &token, batch).await;
    }
    tracing::debug!(agent = %agent_id, connection = %connection.id(), "Pump stopped");
}

/// Deliver a popped batch. Once the connection is gone the rest goes back
/// to the mailbox for the next transport.
async fn forward(
    bus: &MessageBus,
    mailbox: &Mailbox,
    connection: &SocketConnection,
    token: &CancellationToken,
    batch: Vec<Message>,
) {
    for message in batch {
        if !connection.is_live() || token.is_cancelled() {
            mailbox.push(message);
            continue;
        }
        if let Err(e) = bus.deliver_via_transport(message).await {
            tracing::warn!(agent = %mailbox.agent_id(), "Pump delivery failed: {}", e);
        }
    }
}

async fn reply(tx: &mpsc::Sender<String>, frame: &ServerFrame) {
    match encode(frame) {
        Ok(line) => {
            let _ = tx.send(line).await;
        }
        Err(e) => tracing::error!("Failed to encode gateway frame: {}", e),
    }
}
