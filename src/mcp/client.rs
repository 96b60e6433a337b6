use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{info, warn};

/// Maximum size for a single JSON-RPC response line.
const MAX_RESPONSE_BYTES: usize = 512 * 1024;

/// Per-server stderr ring buffer, surfaced in status output.
pub const STDERR_RING_BYTES: usize = 8 * 1024;

/// Grace window between closing stdin and force-killing the subprocess.
const KILL_GRACE: Duration = Duration::from_secs(5);

const PROTOCOL_VERSION: &str = "2025-03-26";

/// Marker error for deadline expiry, so the router can classify timeouts
/// without string matching.
#[derive(Debug, thiserror::Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Environment passed through to tool-server subprocesses on top of the
/// values resolved from their config. Everything else is stripped.
const BASE_ENV_KEYS: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "SHELL", "TMPDIR",
    "NODE_PATH", "NPM_CONFIG_PREFIX",
];

/// Line-delimited JSON-RPC client over a tool server's stdio.
///
/// One in-flight request at a time per server: the rpc lock covers the full
/// write-then-read round trip, which is what gives callers FIFO ordering.
pub struct McpClient {
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
    rpc: Mutex<()>,
    next_id: AtomicU64,
    stderr_ring: Arc<StdMutex<VecDeque<u8>>>,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<i32>>,
    server_name: String,
}

impl McpClient {
    /// Spawn the server subprocess and complete the initialization handshake.
    /// `env` holds the already-resolved environment from the server spec.
    pub async fn spawn(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut base_env: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| BASE_ENV_KEYS.contains(&k.as_str()))
            .collect();
        for (k, v) in env {
            base_env.push((k.clone(), v.clone()));
        }

        let mut child = Command::new(command)
            .args(args)
            .env_clear()
            .envs(base_env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture server stdout"))?;

        // Capture stderr into a bounded ring so failures are inspectable
        // from status output without flooding the logs.
        let stderr_ring = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_RING_BYTES)));
        if let Some(stderr) = child.stderr.take() {
            let ring = Arc::clone(&stderr_ring);
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            let trimmed = line.trim_end();
                            if !trimmed.is_empty() {
                                warn!(server = %name, "{}", truncate(trimmed, 500));
                            }
                            let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
                            for byte in line.bytes() {
                                if ring.len() == STDERR_RING_BYTES {
                                    ring.pop_front();
                                }
                                ring.push_back(byte);
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        // The monitor task owns the child: it observes unexpected exits and
        // enforces the graceful-then-forceful stop sequence.
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        {
            let name = server_name.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code());
                        let _ = exit_tx.send(Some(code.unwrap_or(-1)));
                    }
                    _ = &mut kill_rx => {
                        // stdin is already closed; give the server the grace
                        // window to exit on its own before the hard kill.
                        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                            Ok(status) => {
                                let code = status.ok().and_then(|s| s.code());
                                let _ = exit_tx.send(Some(code.unwrap_or(0)));
                            }
                            Err(_) => {
                                warn!(server = %name, "Server ignored shutdown, killing");
                                let _ = child.kill().await;
                                let _ = exit_tx.send(Some(-9));
                            }
                        }
                    }
                }
            });
        }

        let client = Self {
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
            rpc: Mutex::new(()),
            next_id: AtomicU64::new(1),
            stderr_ring,
            kill_tx: StdMutex::new(Some(kill_tx)),
            exit_rx,
            server_name: server_name.to_string(),
        };

        client
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "hercore", "version": env!("CARGO_PKG_VERSION") }
                }),
            )
            .await?;
        client.notify("notifications/initialized", json!({})).await?;
        info!(server = server_name, "Tool server handshake completed");

        Ok(client)
    }

    /// One JSON-RPC round trip. The rpc lock serializes concurrent callers.
    pub async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let _guard = self.rpc.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write_message(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;
        self.read_response().await
    }

    /// Round trip with a deadline. On expiry a cancellation notification is
    /// sent so the server stops working on the request.
    pub async fn request_with_deadline(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> anyhow::Result<Value> {
        let _guard = self.rpc.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write_message(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;

        match tokio::time::timeout(deadline, self.read_response()).await {
            Ok(result) => result,
            Err(_) => {
                let _ = self
                    .write_message(json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/cancelled",
                        "params": { "requestId": id, "reason": "deadline exceeded" },
                    }))
                    .await;
                Err(anyhow::Error::new(DeadlineExceeded).context(format!(
                    "RPC '{}' on '{}' timed out after {:?}",
                    method, self.server_name, deadline
                )))
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.write_message(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    async fn write_message(&self, message: Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Server '{}' is shut down", self.server_name))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_response(&self) -> anyhow::Result<Value> {
        let mut line = String::new();
        {
            let mut stdout = self.stdout.lock().await;
            let read = stdout.read_line(&mut line).await?;
            if read == 0 {
                anyhow::bail!("Server '{}' closed stdout", self.server_name);
            }
        }
        if line.len() > MAX_RESPONSE_BYTES {
            anyhow::bail!(
                "Response from '{}' exceeded {} bytes",
                self.server_name,
                MAX_RESPONSE_BYTES
            );
        }
        let response: Value = serde_json::from_str(&line)?;
        if let Some(error) = response.get("error") {
            anyhow::bail!("Server '{}' returned error: {}", self.server_name, error);
        }
        Ok(response["result"].clone())
    }

    /// `tools/list` handshake result as raw definitions.
    pub async fn list_tools(&self) -> anyhow::Result<Vec<Value>> {
        let result = self.request("tools/list", json!({})).await?;
        Ok(result["tools"].as_array().cloned().unwrap_or_default())
    }

    /// `tools/call` with a deadline; renders content blocks to text.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: Duration,
    ) -> anyhow::Result<String> {
        let result = self
            .request_with_deadline(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                deadline,
            )
            .await?;
        render_tool_result(&result)
    }

    /// Exit code once the subprocess has terminated.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Watch channel that resolves when the subprocess exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Last 8 KiB of the server's stderr.
    pub fn stderr_tail(&self) -> String {
        let ring = self.stderr_ring.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&ring.iter().copied().collect::<Vec<u8>>()).into_owned()
    }

    /// Close stdin and let the monitor task walk the stop sequence.
    pub async fn shutdown(&self) {
        self.stdin.lock().await.take();
        if let Some(kill) = self.kill_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = kill.send(());
        }
    }
}

fn truncate(input: &str, max: usize) -> String {
    if input.len() <= max {
        input.to_string()
    } else {
        let cut = input
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}... [truncated]", &input[..cut])
    }
}

/// Flatten a tools/call result into plain text. Text blocks concatenate;
/// non-text blocks become placeholders; isError becomes an Err.
fn render_tool_result(result: &Value) -> anyhow::Result<String> {
    let mut rendered = Vec::new();
    if let Some(blocks) = result.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str).unwrap_or("text") {
                "text" => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        if !text.trim().is_empty() {
                            rendered.push(text.to_string());
                        }
                    }
                }
                other => rendered.push(format!("[{} content block]", other)),
            }
        }
    }
    if rendered.is_empty() {
        if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
            rendered.push(structured.to_string());
        }
    }

    let text = rendered.join("\n");
    let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
    if is_error {
        anyhow::bail!(
            "tool reported an error: {}",
            if text.trim().is_empty() { result.to_string() } else { text }
        );
    }
    if text.trim().is_empty() {
        Ok(result.to_string())
    } else {
        Ok(text)
    }
}
