use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub mcp: HashMap<String, McpServerConfig>,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Optional secondary endpoint used when the primary reports overload (5xx).
    pub secondary_base_url: Option<String>,
    pub secondary_api_key: Option<String>,
    pub secondary_model: Option<String>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "openai/gpt-4o".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

fn default_db_path() -> String {
    "her.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Floor between upcoming-jobs snapshots published to the KV store.
    #[serde(default = "default_state_min_publish_interval_secs")]
    pub state_min_publish_interval_secs: u64,
    /// Optional YAML overlay seeding initial tasks at boot.
    pub tasks_file: Option<String>,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lock_heartbeat_secs")]
    pub lock_heartbeat_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            worker_pool_size: default_worker_pool_size(),
            state_min_publish_interval_secs: default_state_min_publish_interval_secs(),
            tasks_file: None,
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_heartbeat_secs: default_lock_heartbeat_secs(),
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    1
}
fn default_worker_pool_size() -> usize {
    8
}
fn default_state_min_publish_interval_secs() -> u64 {
    10
}
fn default_lock_ttl_secs() -> u64 {
    30
}
fn default_lock_heartbeat_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct AutonomyConfig {
    /// Minimum classifier confidence required to leave chat mode.
    #[serde(default = "default_action_intent_threshold")]
    pub action_intent_threshold: f64,
    /// Upper bound on the debate step plan.
    #[serde(default = "default_autonomous_max_steps")]
    pub autonomous_max_steps: usize,
    #[serde(default = "default_step_deadline_secs")]
    pub step_deadline_secs: u64,
    #[serde(default = "default_quiet_hours_start")]
    pub quiet_hours_start: u32,
    #[serde(default = "default_quiet_hours_end")]
    pub quiet_hours_end: u32,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            action_intent_threshold: default_action_intent_threshold(),
            autonomous_max_steps: default_autonomous_max_steps(),
            step_deadline_secs: default_step_deadline_secs(),
            quiet_hours_start: default_quiet_hours_start(),
            quiet_hours_end: default_quiet_hours_end(),
        }
    }
}

fn default_action_intent_threshold() -> f64 {
    0.8
}
fn default_autonomous_max_steps() -> usize {
    16
}
fn default_step_deadline_secs() -> u64 {
    60
}
fn default_quiet_hours_start() -> u32 {
    22
}
fn default_quiet_hours_end() -> u32 {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Bounded buffer for decision/reinforcement event writers.
    #[serde(default = "default_event_queue_max_size")]
    pub event_queue_max_size: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout_secs(),
            http_retries: default_http_retries(),
            step_timeout_secs: default_step_timeout_secs(),
            event_queue_max_size: default_event_queue_max_size(),
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    12
}
fn default_http_retries() -> u32 {
    2
}
fn default_step_timeout_secs() -> u64 {
    30
}
fn default_event_queue_max_size() -> usize {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Working directory all sandbox commands run under.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            workspace_dir: default_workspace_dir(),
        }
    }
}

fn default_command_timeout_secs() -> u64 {
    60
}
fn default_max_output_bytes() -> usize {
    64 * 1024
}
fn default_workspace_dir() -> String {
    "/workspace".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MemoryConfig {
    /// Memory service endpoint. Absent means memory lookups resolve empty.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// When set, memory failures abort the request instead of degrading.
    #[serde(default)]
    pub strict_mode: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Values may reference host environment as `${NAME}`.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
}

fn default_start_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    #[serde(default)]
    pub admin_user_ids: Vec<String>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// Capacity of the outbound notification channel.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            admin_user_ids: Vec::new(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            default_timezone: default_timezone(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

fn default_rate_limit_per_minute() -> u32 {
    20
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_outbound_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [provider]
            api_key = "sk-test"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.tick_interval_secs, 1);
        assert_eq!(config.scheduler.worker_pool_size, 8);
        assert_eq!(config.scheduler.state_min_publish_interval_secs, 10);
        assert!((config.autonomy.action_intent_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.autonomy.autonomous_max_steps, 16);
        assert_eq!(config.workflow.http_timeout_secs, 12);
        assert_eq!(config.workflow.http_retries, 2);
        assert_eq!(config.workflow.event_queue_max_size, 5000);
        assert_eq!(config.sandbox.command_timeout_secs, 60);
        assert_eq!(config.memory.strict_mode, false);
        assert_eq!(config.transport.default_timezone, "UTC");
        assert!(config.mcp.is_empty());
    }

    #[test]
    fn mcp_servers_parse_with_env_placeholders() {
        let config: AppConfig = toml::from_str(
            r#"
            [provider]
            api_key = "sk-test"

            [mcp.github]
            command = "npx"
            args = ["-y", "@modelcontextprotocol/server-github"]
            start_timeout_secs = 30

            [mcp.github.env]
            GITHUB_TOKEN = "${GITHUB_TOKEN}"
            "#,
        )
        .unwrap();

        let github = config.mcp.get("github").unwrap();
        assert_eq!(github.command, "npx");
        assert_eq!(github.start_timeout_secs, 30);
        assert_eq!(github.env.get("GITHUB_TOKEN").unwrap(), "${GITHUB_TOKEN}");
    }
}
