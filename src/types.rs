use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a task fires. Exactly one trigger variant is set per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fixed interval anchored at task creation (or the given anchor).
    Interval {
        seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor: Option<DateTime<Utc>>,
    },
    /// 5-field cron expression evaluated in an IANA timezone.
    Cron { expr: String, timezone: String },
    /// Daily at a local wall-clock time ("HH:MM") in an IANA timezone.
    DailyAt { at: String, timezone: String },
    /// Fires once at an absolute instant, then the task is disabled.
    OneShot { at: DateTime<Utc> },
}

/// Task body classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Interval,
    Cron,
    OneShot,
    Reminder,
    Workflow,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Interval => "interval",
            TaskKind::Cron => "cron",
            TaskKind::OneShot => "one_shot",
            TaskKind::Reminder => "reminder",
            TaskKind::Workflow => "workflow",
        }
    }
}

/// One step of a workflow task, parsed into a closed tagged variant at the
/// boundary. Untyped step maps never travel past the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkflowStep {
    /// Re-fetch the task's declared `source_url` into the `source` map.
    Fetch,
    /// Evaluate `expr` and bind the result to a transient scope name.
    Set { key: String, expr: String },
    /// Evaluate `expr` and write the result into the persisted state map.
    SetState { key: String, expr: String },
    /// Deliver `message` (with `{name}` interpolation) when `when` is truthy.
    Notify {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
    },
    /// Invoke a tool through the capability router; result lands in scope under `target`.
    ToolCall {
        server: String,
        tool: String,
        #[serde(default)]
        args: Value,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
    },
}

/// A durable scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub owner_user: String,
    pub kind: TaskKind,
    pub trigger: TriggerSpec,
    pub enabled: bool,
    /// Opaque payload: reminder message, workflow source_url, chat routing.
    #[serde(default)]
    pub payload: serde_json::Map<String, Value>,
    /// Ordered steps for workflow tasks; empty otherwise.
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Persisted workflow state (survives across runs via set_state).
    #[serde(default)]
    pub state: serde_json::Map<String, Value>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    #[serde(default)]
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        owner_user: impl Into<String>,
        kind: TaskKind,
        trigger: TriggerSpec,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_user: owner_user.into(),
            kind,
            trigger,
            enabled: true,
            payload: serde_json::Map::new(),
            steps: Vec::new(),
            state: serde_json::Map::new(),
            last_run_at: None,
            next_run_at: None,
            last_result: None,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn source_url(&self) -> Option<&str> {
        self.payload.get("source_url").and_then(Value::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }
}

/// Lifecycle states of a supervised tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Pending,
    Starting,
    Running,
    Failed,
    Stopped,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Pending => "pending",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Failed => "failed",
            ServerStatus::Stopped => "stopped",
        }
    }
}

/// A tool advertised by a running server. `(server_name, tool_name)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Append-only operational event. Timestamps are monotone per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub user_id: String,
    pub source: String,
    pub summary: String,
    pub details: Value,
}

impl DecisionEvent {
    pub fn new(
        event_type: &str,
        source: &str,
        user_id: &str,
        summary: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            user_id: user_id.to_string(),
            source: source.to_string(),
            summary: summary.into(),
            details,
        }
    }
}

/// Outcome signal fed back into the autonomy profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinforcementEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    /// Total score in [-1.0, 1.0].
    pub score: f64,
    pub task_succeeded: bool,
    pub concise: bool,
    pub helpful: bool,
    pub emotionally_aligned: bool,
    pub reasoning: String,
}

/// Verifier verdict over a (possibly revised) plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierResult {
    Approve,
    Revise,
    Reject,
}

impl VerifierResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifierResult::Approve => "approve",
            VerifierResult::Revise => "revise",
            VerifierResult::Reject => "reject",
        }
    }
}

/// One proposed step of an autonomous plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanStep {
    ToolCall {
        server: String,
        tool: String,
        #[serde(default)]
        args: Value,
    },
    Reply { text: String },
    Done { result: String },
}

/// Full record of one debate: every action_request yields exactly one trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateTrace {
    pub request_id: String,
    pub plan_summary: String,
    pub plan_steps: Vec<PlanStep>,
    pub skeptic_notes: String,
    pub verifier_result: VerifierResult,
    pub final_actions: Vec<String>,
    pub elapsed_ms: u64,
    /// Streaming tool output captured during execution.
    #[serde(default)]
    pub logs: Vec<String>,
}

/// Per-user autonomy state. Scores stay clamped to [0.1, 1.0].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyProfile {
    pub user_id: String,
    pub engagement_score: f64,
    pub initiative_level: f64,
    pub last_proactive_at: Option<DateTime<Utc>>,
    pub messages_sent_today: u32,
    pub proactive_day: Option<NaiveDate>,
    pub error_count_today: u32,
    pub last_user_message_at: Option<DateTime<Utc>>,
}

impl AutonomyProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            engagement_score: 0.5,
            initiative_level: 0.5,
            last_proactive_at: None,
            messages_sent_today: 0,
            proactive_day: None,
            error_count_today: 0,
            last_user_message_at: None,
        }
    }

    /// Clamp both scores to the profile bounds.
    pub fn clamp(&mut self) {
        self.engagement_score = clamp_score(self.engagement_score);
        self.initiative_level = clamp_score(self.initiative_level);
    }
}

pub fn clamp_score(value: f64) -> f64 {
    value.clamp(0.1, 1.0)
}

/// Inbound user message handed over by the transport collaborator.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub language_hint: Option<String>,
}

/// Delivery mode for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Reply,
    Notification,
}

/// Outbound message for the transport collaborator, sent over the bounded
/// notification channel owned by the scheduler side.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub user_id: String,
    pub text: String,
    pub reply_mode: ReplyMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_spec_round_trips_through_serde() {
        let triggers = vec![
            TriggerSpec::Interval { seconds: 300, anchor: None },
            TriggerSpec::Cron { expr: "0 9 * * 1-5".into(), timezone: "UTC".into() },
            TriggerSpec::DailyAt { at: "09:00".into(), timezone: "Europe/Berlin".into() },
        ];
        for trigger in triggers {
            let json = serde_json::to_string(&trigger).unwrap();
            let back: TriggerSpec = serde_json::from_str(&json).unwrap();
            assert_eq!(back, trigger);
        }
    }

    #[test]
    fn workflow_step_parses_from_tagged_json() {
        let step: WorkflowStep = serde_json::from_value(serde_json::json!({
            "action": "set",
            "key": "price",
            "expr": "float(source[\"bitcoin\"][\"usd\"])"
        }))
        .unwrap();
        assert_eq!(
            step,
            WorkflowStep::Set {
                key: "price".into(),
                expr: "float(source[\"bitcoin\"][\"usd\"])".into()
            }
        );

        // Unknown actions are rejected at the boundary.
        let bad = serde_json::from_value::<WorkflowStep>(serde_json::json!({
            "action": "shell",
            "cmd": "rm -rf /"
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn clamp_score_enforces_profile_bounds() {
        assert_eq!(clamp_score(1.7), 1.0);
        assert_eq!(clamp_score(-0.3), 0.1);
        assert_eq!(clamp_score(0.55), 0.55);
    }
}
