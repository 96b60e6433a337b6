//! Workflow step execution: a mutable scope threaded through an ordered list
//! of pure steps, with guarded notifications and routed tool calls.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::WorkflowConfig;
use crate::mcp::ToolRegistry;
use crate::types::{Task, WorkflowStep};
use crate::workflow::expr;

static TEMPLATE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"));

/// Result of one workflow run. The caller owns persistence and delivery:
/// `state` replaces the task's persisted state, `notifications` go to the
/// outbound sink, `failed_step` feeds the failure budget.
#[derive(Debug, Default)]
pub struct WorkflowOutcome {
    pub notifications: Vec<String>,
    pub state: Map<String, Value>,
    pub outputs: Vec<String>,
    pub failed_step: Option<(usize, String)>,
}

pub struct WorkflowEngine {
    http: reqwest::Client,
    http_timeout: Duration,
    http_retries: u32,
    step_timeout: Duration,
    registry: Option<ToolRegistry>,
}

impl WorkflowEngine {
    pub fn new(config: &WorkflowConfig, registry: Option<ToolRegistry>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            http_timeout: Duration::from_secs(config.http_timeout_secs),
            http_retries: config.http_retries,
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            registry,
        })
    }

    /// Fetch the declared source and run the steps.
    pub async fn run(&self, task: &Task) -> WorkflowOutcome {
        let source = match task.source_url() {
            Some(url) => self.fetch_source(url).await,
            None => None,
        };
        self.run_with_source(task, source).await
    }

    /// Run the steps against an already-fetched source map. Split out so the
    /// scheduler tests can drive workflows without a network.
    pub async fn run_with_source(&self, task: &Task, source: Option<Value>) -> WorkflowOutcome {
        let mut outcome = WorkflowOutcome {
            state: task.state.clone(),
            ..Default::default()
        };

        // The expression scope: persisted state, the fetched source, ambient
        // clock, plus any names bound by earlier `set` steps.
        let mut scope = Map::new();
        scope.insert("state".into(), Value::Object(task.state.clone()));
        scope.insert("source".into(), source.unwrap_or(Value::Object(Map::new())));
        scope.insert("task_name".into(), Value::String(task.id.clone()));
        scope.insert("now_utc".into(), Value::String(chrono::Utc::now().to_rfc3339()));

        for (index, step) in task.steps.iter().enumerate() {
            let step_result =
                tokio::time::timeout(self.step_timeout, self.run_step(task, step, &mut scope, &mut outcome))
                    .await
                    .unwrap_or_else(|_| Err("step deadline exceeded".to_string()));

            match step_result {
                Ok(output) => outcome.outputs.push(output),
                Err(reason) => {
                    warn!(task = %task.id, step = index, %reason, "Workflow step failed");
                    outcome.failed_step = Some((index, reason));
                    break;
                }
            }
        }

        if let Some(Value::Object(state)) = scope.remove("state") {
            outcome.state = state;
        }
        outcome
    }

    async fn run_step(
        &self,
        task: &Task,
        step: &WorkflowStep,
        scope: &mut Map<String, Value>,
        outcome: &mut WorkflowOutcome,
    ) -> Result<String, String> {
        match step {
            WorkflowStep::Fetch => {
                let url = task
                    .source_url()
                    .ok_or_else(|| "fetch step without a declared source_url".to_string())?;
                let source = self
                    .fetch_source(url)
                    .await
                    .ok_or_else(|| format!("fetch failed for {}", url))?;
                scope.insert("source".into(), source);
                Ok("fetched".into())
            }
            WorkflowStep::Set { key, expr: expression } => {
                let value = expr::evaluate(expression, scope).map_err(|e| e.to_string())?;
                scope.insert(key.clone(), value);
                Ok(format!("set:{}", key))
            }
            WorkflowStep::SetState { key, expr: expression } => {
                let value = expr::evaluate(expression, scope).map_err(|e| e.to_string())?;
                match scope.get_mut("state") {
                    Some(Value::Object(state)) => {
                        state.insert(key.clone(), value);
                    }
                    _ => return Err("state map is missing from scope".to_string()),
                }
                Ok(format!("set_state:{}", key))
            }
            WorkflowStep::Notify { message, when } => {
                if self.guard_passes(when.as_deref(), scope)? {
                    let rendered = render_template(message, scope);
                    debug!(task = %task.id, "Workflow notification queued");
                    outcome.notifications.push(rendered);
                    Ok("notify_sent".into())
                } else {
                    Ok("notify_skipped".into())
                }
            }
            WorkflowStep::ToolCall { server, tool, args, target, when } => {
                if !self.guard_passes(when.as_deref(), scope)? {
                    return Ok("tool_call_skipped".into());
                }
                let registry = self
                    .registry
                    .as_ref()
                    .ok_or_else(|| "no tool registry available for tool_call".to_string())?;
                let result = registry
                    .call(server, tool, args, self.step_timeout)
                    .await
                    .map_err(|e| e.to_string())?;
                scope.insert(target.clone(), Value::String(result));
                Ok(format!("tool_call:{}.{}", server, tool))
            }
        }
    }

    fn guard_passes(
        &self,
        when: Option<&str>,
        scope: &Map<String, Value>,
    ) -> Result<bool, String> {
        match when {
            None => Ok(true),
            Some(guard) => {
                let value = expr::evaluate(guard, scope).map_err(|e| e.to_string())?;
                Ok(expr::truthy(&value))
            }
        }
    }

    /// GET the source with bounded retries. JSON bodies become the source
    /// map; anything else lands under the `text` key.
    async fn fetch_source(&self, url: &str) -> Option<Value> {
        let mut last_error = String::new();
        for attempt in 0..=self.http_retries {
            match self.http.get(url).timeout(self.http_timeout).send().await {
                Ok(response) if response.status().is_success() => {
                    let body = response.text().await.unwrap_or_default();
                    return Some(match serde_json::from_str::<Value>(&body) {
                        Ok(json) => json,
                        Err(_) => serde_json::json!({ "text": body }),
                    });
                }
                Ok(response) => {
                    last_error = format!("status {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            if attempt < self.http_retries {
                tokio::time::sleep(Duration::from_millis(250 * (attempt as u64 + 1))).await;
            }
        }
        warn!(url, error = %last_error, "Source fetch exhausted its retries");
        None
    }
}

/// Interpolate `{name}` placeholders from the scope. Unknown names stay
/// literal so a typo is visible in the delivered message.
pub fn render_template(template: &str, scope: &Map<String, Value>) -> String {
    TEMPLATE_VAR
        .replace_all(template, |caps: &regex::Captures| {
            match scope.get(&caps[1]) {
                Some(value) => expr::render_value(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskKind, TriggerSpec};
    use serde_json::json;

    fn workflow_task(steps: Vec<WorkflowStep>, state: Value) -> Task {
        let mut task = Task::new(
            "btc_rule",
            "user-1",
            TaskKind::Workflow,
            TriggerSpec::Interval { seconds: 300, anchor: None },
        );
        task.steps = steps;
        task.state = state.as_object().cloned().unwrap_or_default();
        task
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(&WorkflowConfig::default(), None).unwrap()
    }

    fn threshold_steps() -> Vec<WorkflowStep> {
        vec![
            WorkflowStep::Set {
                key: "price".into(),
                expr: "float(source[\"bitcoin\"][\"usd\"])".into(),
            },
            WorkflowStep::Notify {
                message: "BTC up >=2%, price={price}".into(),
                when: Some(
                    "state.get(\"last_price\") and ((price-float(state[\"last_price\"]))/float(state[\"last_price\"])*100)>=2"
                        .into(),
                ),
            },
            WorkflowStep::SetState { key: "last_price".into(), expr: "price".into() },
        ]
    }

    #[tokio::test]
    async fn threshold_workflow_notifies_exactly_once_across_two_fetches() {
        let engine = engine();

        // First run: baseline not recorded yet, no notification.
        let task = workflow_task(threshold_steps(), json!({}));
        let first = engine
            .run_with_source(&task, Some(json!({"bitcoin": {"usd": 50000.0}})))
            .await;
        assert!(first.failed_step.is_none());
        assert!(first.notifications.is_empty());
        assert_eq!(first.state.get("last_price"), Some(&json!(50000.0)));

        // Second run against the persisted state: +3% fires the alert.
        let task = workflow_task(threshold_steps(), Value::Object(first.state.clone()).clone());
        let second = engine
            .run_with_source(&task, Some(json!({"bitcoin": {"usd": 51500.0}})))
            .await;
        assert!(second.failed_step.is_none());
        assert_eq!(second.notifications, vec!["BTC up >=2%, price=51500.0".to_string()]);
        assert_eq!(second.state.get("last_price"), Some(&json!(51500.0)));
    }

    #[tokio::test]
    async fn set_binds_scope_and_set_state_persists() {
        let engine = engine();
        let task = workflow_task(
            vec![
                WorkflowStep::Set { key: "doubled".into(), expr: "source[\"n\"] * 2".into() },
                WorkflowStep::SetState { key: "kept".into(), expr: "doubled + 1".into() },
            ],
            json!({}),
        );
        let outcome = engine.run_with_source(&task, Some(json!({"n": 21}))).await;
        assert!(outcome.failed_step.is_none());
        // `set` bindings are transient, `set_state` survives the run.
        assert!(outcome.state.get("doubled").is_none());
        assert_eq!(outcome.state.get("kept"), Some(&json!(43)));
    }

    #[tokio::test]
    async fn failed_expression_stops_the_run_and_keeps_prior_state() {
        let engine = engine();
        let task = workflow_task(
            vec![
                WorkflowStep::SetState { key: "before".into(), expr: "1".into() },
                WorkflowStep::Set { key: "broken".into(), expr: "no_such_name + 1".into() },
                WorkflowStep::SetState { key: "after".into(), expr: "2".into() },
            ],
            json!({}),
        );
        let outcome = engine.run_with_source(&task, None).await;
        let (index, reason) = outcome.failed_step.unwrap();
        assert_eq!(index, 1);
        assert!(reason.contains("no_such_name"));
        assert_eq!(outcome.state.get("before"), Some(&json!(1)));
        assert!(outcome.state.get("after").is_none());
    }

    #[tokio::test]
    async fn tool_call_without_registry_fails_the_step() {
        let engine = engine();
        let task = workflow_task(
            vec![WorkflowStep::ToolCall {
                server: "github".into(),
                tool: "search".into(),
                args: json!({}),
                target: "result".into(),
                when: None,
            }],
            json!({}),
        );
        let outcome = engine.run_with_source(&task, None).await;
        assert!(outcome.failed_step.is_some());
    }

    #[test]
    fn template_rendering_keeps_unknown_names_literal() {
        let mut scope = Map::new();
        scope.insert("price".into(), json!(51500.0));
        scope.insert("symbol".into(), json!("BTC"));
        assert_eq!(
            render_template("{symbol} hit {price} ({unknown})", &scope),
            "BTC hit 51500.0 ({unknown})"
        );
    }
}
