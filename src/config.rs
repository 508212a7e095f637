//! Configuration loading for agentmesh.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::protocol::Priority;
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "AGENTMESH_HOME";

/// Get the agentmesh home directory (~/.agentmesh).
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentmesh"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.agentmesh/settings.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

/// Load settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let hb = &settings.heartbeat;
    if hb.warn_after_secs >= hb.timeout_secs {
        return Err(Error::Config(format!(
            "heartbeat.warn_after_secs ({}) must be below heartbeat.timeout_secs ({})",
            hb.warn_after_secs, hb.timeout_secs
        )));
    }
    if hb.sweep_interval_secs == 0 {
        return Err(Error::Config("heartbeat.sweep_interval_secs must be > 0".to_string()));
    }
    if settings.bus.max_delivery_attempts == 0 {
        return Err(Error::Config("bus.max_delivery_attempts must be >= 1".to_string()));
    }
    if settings.bus.immediate_priority_threshold > Priority::MAX.value() {
        return Err(Error::Config(format!(
            "bus.immediate_priority_threshold must be <= {}",
            Priority::MAX
        )));
    }
    let credit = settings.selector.partial_match_credit;
    if !(credit > 0.0 && credit <= 1.0) {
        return Err(Error::Config(
            "selector.partial_match_credit must be in (0, 1]".to_string(),
        ));
    }
    if settings.selector.history_limit == 0 || settings.selector.load_window == 0 {
        return Err(Error::Config(
            "selector.history_limit and selector.load_window must be > 0".to_string(),
        ));
    }
    Ok(())
}

/// Gateway (newline-delimited JSON over TCP) configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_gateway_port(),
        }
    }
}

impl GatewayConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// HTTP admin API configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_web_port(),
        }
    }
}

/// Message bus configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BusConfig {
    /// Messages strictly above this priority try a live connection first.
    #[serde(default = "default_immediate_threshold")]
    pub immediate_priority_threshold: u8,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_response_ttl_secs")]
    pub response_ttl_secs: u64,
    #[serde(default = "default_broadcast_priority")]
    pub broadcast_priority: u8,
    /// JSONL dead-letter file; in-memory store when unset.
    #[serde(default)]
    pub dead_letter_path: Option<PathBuf>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            immediate_priority_threshold: default_immediate_threshold(),
            max_delivery_attempts: default_max_delivery_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            response_ttl_secs: default_response_ttl_secs(),
            broadcast_priority: default_broadcast_priority(),
            dead_letter_path: None,
        }
    }
}

impl BusConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn response_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.response_ttl_secs as i64)
    }
}

/// Heartbeat monitor configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HeartbeatConfig {
    #[serde(default = "default_warn_after_secs")]
    pub warn_after_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            warn_after_secs: default_warn_after_secs(),
            timeout_secs: default_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Workflow coordinator configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_coordination_priority")]
    pub coordination_priority: u8,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_workflow_ttl_secs(),
            coordination_priority: default_coordination_priority(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Capability selector configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SelectorConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_load_window")]
    pub load_window: usize,
    #[serde(default = "default_partial_match_credit")]
    pub partial_match_credit: f64,
    #[serde(default = "default_retune_min_samples")]
    pub retune_min_samples: usize,
    /// Seconds between weight retunes driven by recorded outcomes. Zero disables.
    #[serde(default = "default_retune_interval_secs")]
    pub retune_interval_secs: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            load_window: default_load_window(),
            partial_match_credit: default_partial_match_credit(),
            retune_min_samples: default_retune_min_samples(),
            retune_interval_secs: default_retune_interval_secs(),
        }
    }
}

/// Log output configuration. `RUST_LOG` overrides `filter`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Directory for the daily log files (defaults to the platform data dir).
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Write the file log as JSON lines.
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_true")]
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            directory: None,
            json: false,
            console: true,
        }
    }
}

/// Execution pattern configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PatternConfig {
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    8765
}

fn default_web_port() -> u16 {
    3333
}

fn default_immediate_threshold() -> u8 {
    5
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_response_ttl_secs() -> u64 {
    3600
}

fn default_broadcast_priority() -> u8 {
    3
}

fn default_warn_after_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    15
}

fn default_workflow_ttl_secs() -> u64 {
    86_400
}

fn default_coordination_priority() -> u8 {
    8
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_history_limit() -> usize {
    1000
}

fn default_load_window() -> usize {
    50
}

fn default_partial_match_credit() -> f64 {
    0.7
}

fn default_retune_min_samples() -> usize {
    10
}

fn default_retune_interval_secs() -> u64 {
    300
}

fn default_log_filter() -> String {
    "info,agentmesh=debug".to_string()
}

fn default_response_timeout_secs() -> u64 {
    30
}

fn table(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect()
}

/// Default capability alias table.
pub fn default_taxonomy() -> HashMap<String, Vec<String>> {
    table(&[
        ("ui_design", &["frontend", "react", "design", "css"]),
        ("backend", &["api", "server", "database"]),
        ("frontend", &["ui", "react", "vue", "angular", "css"]),
        ("database", &["sql", "nosql", "storage", "data"]),
        ("deployment", &["deploy", "docker", "cloud", "devops"]),
        ("automation", &["script", "cli", "shell", "workflow"]),
    ])
}

/// Default archetype -> preferred task types table.
pub fn default_specializations() -> HashMap<String, Vec<String>> {
    table(&[
        ("cybershell", &["automation", "cli", "system_admin", "scripting"]),
        ("ui_designer", &["web_app", "mobile_app", "design", "frontend"]),
        ("dev_engine", &["project_setup", "architecture", "scaffolding"]),
        ("agent_maker", &["ai_development", "automation", "agent_creation"]),
        ("fullstack_dev", &["web_app", "mobile_app", "api", "full_development"]),
        ("backend_dev", &["api", "backend", "server", "database"]),
        ("frontend_dev", &["web_app", "mobile_app", "ui", "frontend"]),
        ("data_sync", &["database", "data_processing", "sync", "storage"]),
        ("github_agent", &["version_control", "ci_cd", "deployment", "collaboration"]),
        ("deploy_manager", &["deployment", "cloud", "devops", "infrastructure"]),
        ("web3_plugin", &["blockchain", "smart_contracts", "defi", "crypto"]),
        ("voice_agent", &["voice_processing", "speech", "audio", "nlp"]),
    ])
}

/// agentmesh settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub web: WebConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub patterns: PatternConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default = "default_taxonomy")]
    pub taxonomy: HashMap<String, Vec<String>>,

    #[serde(default = "default_specializations")]
    pub specializations: HashMap<String, Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            web: WebConfig::default(),
            bus: BusConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            workflow: WorkflowConfig::default(),
            selector: SelectorConfig::default(),
            patterns: PatternConfig::default(),
            logging: LoggingConfig::default(),
            taxonomy: default_taxonomy(),
            specializations: default_specializations(),
        }
    }
}
