//! Tool server lifecycle supervision.
//!
//! Each configured server walks a small FSM:
//! pending -> starting -> running, with failures landing in `failed` and
//! exhausted retries (or graceful shutdown) parking the server in `stopped`.
//! Boot is parallel across servers and one bad server never blocks the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::McpServerConfig;
use crate::events::EventLog;
use crate::mcp::McpClient;
use crate::types::{ServerStatus, ToolSchema};

/// Restarts allowed per unexpected-exit window before a server is parked.
const MAX_RESTARTS: usize = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(300);

static ENV_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"));

/// Point-in-time view of one supervised server, for status commands.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub status: ServerStatus,
    pub tool_names: Vec<String>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stderr_tail: String,
}

struct ServerEntry {
    config: McpServerConfig,
    status: ServerStatus,
    client: Option<Arc<McpClient>>,
    tools: Vec<ToolSchema>,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    restarts: Vec<Instant>,
}

impl ServerEntry {
    fn fail(&mut self, reason: String) {
        self.status = ServerStatus::Failed;
        self.last_error = Some(reason);
        self.tools.clear();
        self.client = None;
    }
}

pub struct ProcessSupervisor {
    servers: RwLock<HashMap<String, ServerEntry>>,
    events: EventLog,
    shutting_down: AtomicBool,
}

impl ProcessSupervisor {
    pub fn new(configs: HashMap<String, McpServerConfig>, events: EventLog) -> Arc<Self> {
        let servers = configs
            .into_iter()
            .map(|(name, config)| {
                let entry = ServerEntry {
                    config,
                    status: ServerStatus::Pending,
                    client: None,
                    tools: Vec::new(),
                    last_error: None,
                    started_at: None,
                    restarts: Vec::new(),
                };
                (name, entry)
            })
            .collect();

        Arc::new(Self {
            servers: RwLock::new(servers),
            events,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Start every configured server in parallel. Failures are isolated.
    pub async fn boot(self: &Arc<Self>) {
        let names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        let starts = names.into_iter().map(|name| {
            let supervisor = Arc::clone(self);
            async move { supervisor.start_server(&name).await }
        });
        futures::future::join_all(starts).await;
    }

    async fn start_server(self: &Arc<Self>, name: &str) {
        let config = {
            let mut servers = self.servers.write().await;
            let Some(entry) = servers.get_mut(name) else { return };
            entry.status = ServerStatus::Starting;
            entry.last_error = None;
            entry.config.clone()
        };

        let env = match resolve_env(&config.env) {
            Ok(env) => env,
            Err(var) => {
                let reason = format!("unresolved_env:{}", var);
                warn!(server = name, %reason, "Tool server env resolution failed");
                self.mark_failed(name, reason).await;
                return;
            }
        };

        let budget = Duration::from_secs(config.start_timeout_secs);
        let startup = async {
            let client = McpClient::spawn(name, &config.command, &config.args, &env).await?;
            let tools = client.list_tools().await?;
            Ok::<_, anyhow::Error>((client, tools))
        };

        match tokio::time::timeout(budget, startup).await {
            Err(_) => {
                warn!(server = name, budget_secs = config.start_timeout_secs, "Tool server startup timed out");
                self.mark_failed(name, "startup_timeout".to_string()).await;
            }
            Ok(Err(e)) => {
                warn!(server = name, error = %e, "Tool server failed to start");
                self.mark_failed(name, e.to_string()).await;
            }
            Ok(Ok((client, tool_defs))) => {
                let tools = parse_tool_schemas(name, &tool_defs);
                if tools.is_empty() {
                    client.shutdown().await;
                    self.mark_failed(name, "no_tools_advertised".to_string()).await;
                    return;
                }

                let client = Arc::new(client);
                {
                    let mut servers = self.servers.write().await;
                    if let Some(entry) = servers.get_mut(name) {
                        entry.status = ServerStatus::Running;
                        entry.client = Some(Arc::clone(&client));
                        entry.tools = tools.clone();
                        entry.started_at = Some(Utc::now());
                        entry.last_error = None;
                    }
                }
                info!(server = name, tools = tools.len(), "Tool server running");
                self.events.log(
                    "tool_server_status",
                    "supervisor",
                    "",
                    format!("Server '{}' running with {} tools", name, tools.len()),
                    serde_json::json!({ "server": name, "status": "running", "tools": tools.len() }),
                );
                self.watch_exit(name.to_string(), client);
            }
        }
    }

    /// Observe the subprocess exit and apply the retry policy. A watcher for
    /// a superseded client instance ignores the event.
    fn watch_exit(self: &Arc<Self>, name: String, client: Arc<McpClient>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut exit = client.exit_watch();
            while exit.borrow().is_none() {
                if exit.changed().await.is_err() {
                    return;
                }
            }
            let code = exit.borrow().unwrap_or(-1);
            supervisor.handle_exit(&name, &client, code).await;
        });
    }

    async fn handle_exit(self: &Arc<Self>, name: &str, exited: &Arc<McpClient>, code: i32) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let should_retry = {
            let mut servers = self.servers.write().await;
            let Some(entry) = servers.get_mut(name) else { return };
            let is_current = entry
                .client
                .as_ref()
                .map(|c| Arc::ptr_eq(c, exited))
                .unwrap_or(false);
            if !is_current {
                return;
            }

            entry.fail(format!("exit:{}", code));
            let now = Instant::now();
            entry.restarts.retain(|t| now.duration_since(*t) < RESTART_WINDOW);
            entry.restarts.push(now);

            if entry.restarts.len() <= MAX_RESTARTS {
                true
            } else {
                entry.status = ServerStatus::Stopped;
                entry.last_error = Some("retry_exhausted".to_string());
                false
            }
        };

        if should_retry {
            warn!(server = name, code, "Tool server exited unexpectedly, restarting");
            self.events.log(
                "tool_server_status",
                "supervisor",
                "",
                format!("Server '{}' exited (code {}), restarting", name, code),
                serde_json::json!({ "server": name, "status": "failed", "exit_code": code }),
            );
            self.start_server(name).await;
        } else {
            error!(server = name, "Tool server retry budget exhausted, parked");
            self.events.log(
                "tool_server_status",
                "supervisor",
                "",
                format!("Server '{}' parked after repeated crashes", name),
                serde_json::json!({ "server": name, "status": "stopped", "reason": "retry_exhausted" }),
            );
        }
    }

    async fn mark_failed(&self, name: &str, reason: String) {
        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(name) {
            entry.fail(reason.clone());
        }
        drop(servers);
        self.events.log(
            "tool_server_status",
            "supervisor",
            "",
            format!("Server '{}' failed: {}", name, reason),
            serde_json::json!({ "server": name, "status": "failed", "reason": reason }),
        );
    }

    /// Graceful stop of every server. Retries are suppressed from here on.
    pub async fn stop_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut servers = self.servers.write().await;
        for (name, entry) in servers.iter_mut() {
            if let Some(client) = entry.client.take() {
                info!(server = %name, "Stopping tool server");
                client.shutdown().await;
            }
            entry.status = ServerStatus::Stopped;
            entry.tools.clear();
        }
    }

    pub async fn status_snapshots(&self) -> Vec<ServerSnapshot> {
        let servers = self.servers.read().await;
        let mut rows: Vec<ServerSnapshot> = servers
            .iter()
            .map(|(name, entry)| ServerSnapshot {
                name: name.clone(),
                status: entry.status,
                tool_names: entry.tools.iter().map(|t| t.tool_name.clone()).collect(),
                last_error: entry.last_error.clone(),
                started_at: entry.started_at,
                stderr_tail: entry
                    .client
                    .as_ref()
                    .map(|c| c.stderr_tail())
                    .unwrap_or_default(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Every tool advertised by currently running servers.
    pub async fn running_tools(&self) -> Vec<ToolSchema> {
        let servers = self.servers.read().await;
        servers
            .values()
            .filter(|e| e.status == ServerStatus::Running)
            .flat_map(|e| e.tools.iter().cloned())
            .collect()
    }

    /// Schema for one (server, tool) pair when the server is running.
    pub async fn tool_schema(&self, server: &str, tool: &str) -> Option<ToolSchema> {
        let servers = self.servers.read().await;
        let entry = servers.get(server)?;
        if entry.status != ServerStatus::Running {
            return None;
        }
        entry.tools.iter().find(|t| t.tool_name == tool).cloned()
    }

    /// Client handle when the server is running.
    pub async fn client_for(&self, server: &str) -> Option<Arc<McpClient>> {
        let servers = self.servers.read().await;
        let entry = servers.get(server)?;
        if entry.status != ServerStatus::Running {
            return None;
        }
        entry.client.clone()
    }
}

/// Expand `${NAME}` placeholders from the host environment. The first
/// unresolvable variable aborts resolution so the server can be marked failed
/// instead of starting with a broken environment.
fn resolve_env(env: &HashMap<String, String>) -> Result<HashMap<String, String>, String> {
    let mut resolved = HashMap::new();
    for (key, raw) in env {
        let mut missing: Option<String> = None;
        let value = ENV_PLACEHOLDER.replace_all(raw, |caps: &regex::Captures| {
            let var = &caps[1];
            match std::env::var(var) {
                Ok(v) => v,
                Err(_) => {
                    missing.get_or_insert_with(|| var.to_string());
                    String::new()
                }
            }
        });
        if let Some(var) = missing {
            return Err(var);
        }
        resolved.insert(key.clone(), value.into_owned());
    }
    Ok(resolved)
}

fn parse_tool_schemas(server: &str, defs: &[Value]) -> Vec<ToolSchema> {
    defs.iter()
        .filter_map(|td| {
            let name = td.get("name").and_then(Value::as_str)?;
            Some(ToolSchema {
                server_name: server.to_string(),
                tool_name: name.to_string(),
                description: td
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                input_schema: td.get("inputSchema").cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    /// Shell one-liner that speaks just enough of the protocol for tests.
    /// Patterns match on the exact method key so the `notifications/initialized`
    /// line does not trigger a spurious response.
    fn stub_server_script() -> String {
        concat!(
            "while IFS= read -r line; do ",
            "case \"$line\" in ",
            "*'\"method\":\"initialize\"'*) echo '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"protocolVersion\":\"2025-03-26\"}}';; ",
            "*'\"method\":\"tools/list\"'*) echo '{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[{\"name\":\"echo\",\"description\":\"echo text\",\"inputSchema\":{\"type\":\"object\",\"properties\":{\"text\":{\"type\":\"string\"}},\"required\":[\"text\"]}}]}}';; ",
            "*'\"method\":\"tools/call\"'*) echo '{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]}}';; ",
            "esac; done",
        )
        .to_string()
    }

    fn stub_config(script: &str, start_timeout_secs: u64) -> McpServerConfig {
        McpServerConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.to_string()],
            env: HashMap::new(),
            start_timeout_secs,
        }
    }

    async fn event_log() -> EventLog {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let (log, _handle) = EventLog::spawn(store, 100);
        log
    }

    #[tokio::test]
    async fn healthy_server_reaches_running_with_tools() {
        let mut configs = HashMap::new();
        configs.insert("stub".to_string(), stub_config(&stub_server_script(), 10));
        let supervisor = ProcessSupervisor::new(configs, event_log().await);
        supervisor.boot().await;

        let snapshots = supervisor.status_snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].status, ServerStatus::Running);
        assert_eq!(snapshots[0].tool_names, vec!["echo".to_string()]);
        assert!(supervisor.tool_schema("stub", "echo").await.is_some());

        supervisor.stop_all().await;
        let snapshots = supervisor.status_snapshots().await;
        assert_eq!(snapshots[0].status, ServerStatus::Stopped);
        assert!(snapshots[0].tool_names.is_empty());
    }

    #[tokio::test]
    async fn hung_handshake_times_out_without_blocking_others() {
        let mut configs = HashMap::new();
        configs.insert("flaky".to_string(), stub_config("sleep 120", 1));
        configs.insert("stub".to_string(), stub_config(&stub_server_script(), 10));
        let supervisor = ProcessSupervisor::new(configs, event_log().await);
        supervisor.boot().await;

        let snapshots = supervisor.status_snapshots().await;
        let flaky = snapshots.iter().find(|s| s.name == "flaky").unwrap();
        assert_eq!(flaky.status, ServerStatus::Failed);
        assert_eq!(flaky.last_error.as_deref(), Some("startup_timeout"));
        assert!(flaky.tool_names.is_empty());

        let stub = snapshots.iter().find(|s| s.name == "stub").unwrap();
        assert_eq!(stub.status, ServerStatus::Running);

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn unresolved_env_placeholder_fails_the_server_not_the_boot() {
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "${HERCORE_TEST_UNSET_VAR}".to_string());
        let mut config = stub_config(&stub_server_script(), 10);
        config.env = env;

        let mut configs = HashMap::new();
        configs.insert("needs_env".to_string(), config);
        let supervisor = ProcessSupervisor::new(configs, event_log().await);
        supervisor.boot().await;

        let snapshots = supervisor.status_snapshots().await;
        assert_eq!(snapshots[0].status, ServerStatus::Failed);
        assert_eq!(
            snapshots[0].last_error.as_deref(),
            Some("unresolved_env:HERCORE_TEST_UNSET_VAR")
        );
    }

    #[tokio::test]
    async fn tools_are_empty_for_every_non_running_server() {
        let mut configs = HashMap::new();
        configs.insert("flaky".to_string(), stub_config("exit 3", 2));
        let supervisor = ProcessSupervisor::new(configs, event_log().await);
        supervisor.boot().await;

        for snapshot in supervisor.status_snapshots().await {
            if snapshot.status != ServerStatus::Running {
                assert!(snapshot.tool_names.is_empty());
            }
        }
        assert!(supervisor.running_tools().await.is_empty());
    }

    #[test]
    fn env_resolution_expands_and_reports_missing() {
        std::env::set_var("HERCORE_TEST_SET_VAR", "resolved");
        let mut env = HashMap::new();
        env.insert("A".to_string(), "${HERCORE_TEST_SET_VAR}".to_string());
        env.insert("B".to_string(), "literal".to_string());
        let resolved = resolve_env(&env).unwrap();
        assert_eq!(resolved.get("A").unwrap(), "resolved");
        assert_eq!(resolved.get("B").unwrap(), "literal");

        let mut bad = HashMap::new();
        bad.insert("C".to_string(), "prefix-${HERCORE_TEST_UNSET_VAR}".to_string());
        assert_eq!(resolve_env(&bad).unwrap_err(), "HERCORE_TEST_UNSET_VAR");
    }
}
