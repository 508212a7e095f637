//! CLI commands for agentmesh using clap.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{load_settings_from, load_settings_or_default, Settings};
use crate::engine::Engine;
use crate::gateway::{run_gateway, GatewayClient};
use crate::protocol::{EventType, Message, Priority};
use crate::selector::SelectionRequest;
use crate::web::run_web_server;

/// agentmesh - multi-agent coordination engine.
#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(version)]
#[command(about = "Coordinate capability-tagged agents over a prioritized message bus", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to ~/.agentmesh/settings.json)
    #[arg(long, global = true, env = "AGENTMESH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the engine with its gateway and admin API
    Serve {
        /// Do not start the HTTP admin API
        #[arg(long)]
        no_web: bool,
    },

    /// Show engine status
    Status,

    /// Send a message through a running engine
    Send {
        /// Target agent id (omit to publish to subscribers)
        #[arg(long)]
        target: Option<String>,

        /// Event type
        #[arg(long, default_value = "task_request")]
        event: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Priority 0-10
        #[arg(long, default_value_t = 5)]
        priority: i64,

        /// Source id stamped on the message
        #[arg(long, default_value = "cli")]
        source: String,
    },

    /// Ask a running engine which agent it would pick
    Select {
        /// Task type
        #[arg(long)]
        task: String,

        /// Required capability (repeatable)
        #[arg(long = "capability", short = 'c')]
        capabilities: Vec<String>,

        /// Agent ids to leave out (repeatable)
        #[arg(long)]
        exclude: Vec<String>,
    },
}

impl Commands {
    pub async fn run(&self, settings: Settings) -> Result<()> {
        match &self.command {
            Command::Serve { no_web } => cmd_serve(settings, *no_web).await,
            Command::Status => cmd_status(&settings).await,
            Command::Send {
                target,
                event,
                payload,
                priority,
                source,
            } => cmd_send(&settings, target.as_deref(), event, payload, *priority, source).await,
            Command::Select {
                task,
                capabilities,
                exclude,
            } => cmd_select(&settings, task, capabilities, exclude).await,
        }
    }

    /// Settings from `--config`, or the default location with defaults as fallback.
    pub fn settings(&self) -> Result<Settings> {
        match &self.config {
            Some(path) => load_settings_from(path)
                .with_context(|| format!("Failed to load settings from {}", path.display())),
            None => Ok(load_settings_or_default()),
        }
    }
}

// Command implementations

async fn cmd_serve(settings: Settings, no_web: bool) -> Result<()> {
    let engine = Arc::new(Engine::new(settings.clone())?);
    let token = CancellationToken::new();
    let mut handles = engine.start(token.clone());

    let gateway = {
        let engine = engine.clone();
        let config = settings.gateway.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = run_gateway(engine, &config, token).await {
                tracing::error!("Gateway error: {}", e);
            }
        })
    };
    handles.push(gateway);

    if settings.web.enabled && !no_web {
        let engine = engine.clone();
        let config = settings.web.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_web_server(engine, &config, token).await {
                tracing::error!("Web server error: {}", e);
            }
        }));
    }

    println!("agentmesh engine running");
    println!("  gateway: {}", settings.gateway.address());
    if settings.web.enabled && !no_web {
        println!("  web:     http://{}:{}", settings.web.host, settings.web.port);
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutting down");
    token.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn connect(settings: &Settings) -> Result<GatewayClient> {
    let addr = settings.gateway.address();
    GatewayClient::connect(&addr)
        .await
        .with_context(|| format!("Could not reach the engine at {} (is `agentmesh serve` running?)", addr))
}

async fn cmd_status(settings: &Settings) -> Result<()> {
    let mut client = connect(settings).await?;
    let status = client.status().await?;

    println!("Engine: {} ({})", status.engine_id, status.status);
    println!("  uptime:            {}s", status.uptime_secs);
    println!("  agents:            {}", status.registered_agents);
    println!("  live connections:  {}", status.live_connections);
    println!("  active workflows:  {}", status.active_workflows);
    println!("  queued messages:   {}", status.queued_messages);
    println!("  pending responses: {}", status.pending_responses);
    println!("  retrying:          {}", status.retrying_messages);
    println!("  dead letters:      {}", status.dead_letters);

    let stats = &status.message_stats;
    println!(
        "\nMessages: total={} delivered={} queued={} failed={} retries={} dead_lettered={}",
        stats.total_messages,
        stats.delivered,
        stats.queued,
        stats.failed_deliveries,
        stats.retries,
        stats.dead_lettered
    );
    Ok(())
}

async fn cmd_send(
    settings: &Settings,
    target: Option<&str>,
    event: &str,
    payload: &str,
    priority: i64,
    source: &str,
) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let mut message = Message::new(EventType::parse(event), source, payload).with_priority(Priority::new(priority));
    if let Some(target) = target {
        message = message.to(target);
    }
    let id = message.id.clone();

    let mut client = connect(settings).await?;
    let outcome = client.send_message(message).await?;
    println!("Message {} {:?}", id, outcome);
    Ok(())
}

async fn cmd_select(settings: &Settings, task: &str, capabilities: &[String], exclude: &[String]) -> Result<()> {
    let request = SelectionRequest {
        task_type: task.to_string(),
        required_capabilities: capabilities.to_vec(),
        exclude: exclude.to_vec(),
    };
    let mut client = connect(settings).await?;
    let agent_id = client.select(request).await?;
    println!("{}", agent_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send() {
        let cmd = Commands::try_parse_from([
            "agentmesh", "send", "--target", "A", "--event", "coordination", "--priority", "9",
        ])
        .unwrap();
        match cmd.command {
            Command::Send {
                target,
                event,
                priority,
                payload,
                ..
            } => {
                assert_eq!(target.as_deref(), Some("A"));
                assert_eq!(event, "coordination");
                assert_eq!(priority, 9);
                assert_eq!(payload, "{}");
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_parse_select_repeated_capability() {
        let cmd = Commands::try_parse_from([
            "agentmesh", "--config", "/tmp/s.json", "select", "--task", "api_build", "-c", "backend", "-c", "api",
        ])
        .unwrap();
        assert_eq!(cmd.config, Some(PathBuf::from("/tmp/s.json")));
        match cmd.command {
            Command::Select { capabilities, .. } => assert_eq!(capabilities, vec!["backend", "api"]),
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn test_missing_config_file_fails() {
        let cmd = Commands::try_parse_from(["agentmesh", "--config", "/nonexistent/agentmesh.json", "status"]).unwrap();
        assert!(cmd.settings().is_err());
    }
}
