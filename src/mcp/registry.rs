//! Capability router: maps a (server, tool, args) call onto a live
//! supervised server, after validating the args against the cached schema.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::mcp::client::DeadlineExceeded;
use crate::mcp::supervisor::ProcessSupervisor;
use crate::types::ToolSchema;

#[derive(Debug, thiserror::Error)]
pub enum ToolCallError {
    #[error("tool server '{0}' is not running")]
    Unavailable(String),
    #[error("invalid arguments for {server}.{tool}: {reason}")]
    InvalidArgs { server: String, tool: String, reason: String },
    #[error("call to {server}.{tool} timed out after {deadline:?}")]
    Timeout { server: String, tool: String, deadline: Duration },
    #[error("call to {server}.{tool} failed: {reason}")]
    Failed { server: String, tool: String, reason: String },
}

impl ToolCallError {
    /// Timeouts are the only failures worth one fresh-deadline retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolCallError::Timeout { .. })
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    supervisor: Arc<ProcessSupervisor>,
}

impl ToolRegistry {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }

    /// All tools currently advertised by running servers.
    pub async fn available_tools(&self) -> Vec<ToolSchema> {
        self.supervisor.running_tools().await
    }

    pub async fn find_tool(&self, server: &str, tool: &str) -> Option<ToolSchema> {
        self.supervisor.tool_schema(server, tool).await
    }

    /// Route one call. Calls on the same (server, tool) from one request are
    /// FIFO — the server's rpc channel is strictly ordered.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        args: &Value,
        deadline: Duration,
    ) -> Result<String, ToolCallError> {
        if deadline.is_zero() {
            return Err(ToolCallError::InvalidArgs {
                server: server.to_string(),
                tool: tool.to_string(),
                reason: "deadline must be positive".to_string(),
            });
        }
        let schema = self
            .supervisor
            .tool_schema(server, tool)
            .await
            .ok_or_else(|| ToolCallError::Unavailable(server.to_string()))?;

        validate_args(&schema.input_schema, args).map_err(|reason| ToolCallError::InvalidArgs {
            server: server.to_string(),
            tool: tool.to_string(),
            reason,
        })?;

        let client = self
            .supervisor
            .client_for(server)
            .await
            .ok_or_else(|| ToolCallError::Unavailable(server.to_string()))?;

        debug!(server, tool, "Routing tool call");
        client
            .call_tool(tool, args.clone(), deadline)
            .await
            .map_err(|e| {
                if e.chain().any(|cause| cause.is::<DeadlineExceeded>()) {
                    ToolCallError::Timeout {
                        server: server.to_string(),
                        tool: tool.to_string(),
                        deadline,
                    }
                } else {
                    ToolCallError::Failed {
                        server: server.to_string(),
                        tool: tool.to_string(),
                        reason: e.to_string(),
                    }
                }
            })
    }
}

/// Check `args` against a JSON-Schema-shaped tool input schema: required
/// keys present, declared property types respected, extras rejected when the
/// schema says so. Anything deeper is left to the server.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    let empty = Value::Object(serde_json::Map::new());
    let args = match args {
        Value::Null => &empty,
        other => other,
    };
    let Some(args_map) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_map.contains_key(key) {
                return Err(format!("missing required field '{}'", key));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, value) in args_map {
            match properties.get(key) {
                Some(spec) => {
                    if let Some(expected) = spec.get("type").and_then(Value::as_str) {
                        if !type_matches(expected, value) {
                            return Err(format!(
                                "field '{}' should be {}, got {}",
                                key,
                                expected,
                                json_type(value)
                            ));
                        }
                    }
                }
                None => {
                    let closed = schema
                        .get("additionalProperties")
                        .and_then(Value::as_bool)
                        .map(|allowed| !allowed)
                        .unwrap_or(false);
                    if closed {
                        return Err(format!("unexpected field '{}'", key));
                    }
                }
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
