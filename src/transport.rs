//! Channel boundary between the autonomy core and the chat transport.
//!
//! The transport collaborator (Telegram bot, API adapter) lives outside this
//! process's concerns: it pushes inbound events into a channel the core owns
//! the receiving end of, and consumes outbound messages from a bounded
//! channel the scheduler side owns. Neither side holds a reference into the
//! other's internals.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{CoreError, CoreResult};
use crate::scheduler::{build_trigger, is_valid_interval, ScheduleQualifiers};
use crate::types::{InboundMessage, OutboundMessage, Task, TaskKind, TriggerSpec, WorkflowStep};

/// Everything the transport can hand to the core.
#[derive(Debug)]
pub enum InboundEvent {
    /// Free-text user message, to be classified.
    Message(InboundMessage),
    /// Structured admin command, already parsed at the boundary.
    Admin { user_id: String, command: AdminCommand },
}

/// Closed admin command surface. Unknown commands never cross the boundary.
#[derive(Debug, PartialEq)]
pub enum AdminCommand {
    Status,
    ScheduleList,
    ScheduleRun { name: String },
    ScheduleAdd(Box<ScheduleAddArgs>),
    ScheduleSet { name: String, interval: String },
    ScheduleEnable { name: String },
    ScheduleDisable { name: String },
    ScheduleRemove { name: String },
    Mcp,
    Memories,
    Example,
    Reset,
}

/// Arguments of `/schedule add`, parsed into typed fields.
#[derive(Debug, Default, PartialEq)]
pub struct ScheduleAddArgs {
    pub name: String,
    pub kind: Option<String>,
    pub interval: String,
    pub at: Option<String>,
    pub timezone: Option<String>,
    pub message: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub weekdays: Vec<u8>,
}

impl ScheduleAddArgs {
    /// Materialize the draft into a validated task.
    pub fn into_task(self, owner_user: &str, default_timezone: &str) -> CoreResult<Task> {
        let qualifiers = ScheduleQualifiers {
            at: self.at,
            timezone: self.timezone,
            run_at: self.run_at,
            weekdays: self.weekdays,
        };
        let trigger = build_trigger(&self.interval, &qualifiers, default_timezone)?;

        let kind = match self.kind.as_deref() {
            Some("workflow") => TaskKind::Workflow,
            Some("reminder") => TaskKind::Reminder,
            Some("one_shot") => TaskKind::OneShot,
            Some(other) => {
                return Err(CoreError::domain(
                    "Task type must be reminder, workflow, or one_shot.",
                    format!("unknown task type '{}'", other),
                ))
            }
            None => match &trigger {
                TriggerSpec::OneShot { .. } => TaskKind::OneShot,
                TriggerSpec::Interval { .. } => TaskKind::Interval,
                _ => TaskKind::Cron,
            },
        };

        if kind == TaskKind::Workflow && self.steps.is_empty() {
            return Err(CoreError::domain(
                "Workflow tasks need at least one step.",
                "workflow task without steps",
            ));
        }

        let mut task = Task::new(self.name, owner_user, kind, trigger);
        if let Some(message) = self.message {
            task.payload.insert("message".into(), Value::String(message));
        }
        if let Some(source_url) = self.source_url {
            task.payload.insert("source_url".into(), Value::String(source_url));
        }
        task.steps = self.steps;
        Ok(task)
    }
}

/// Parse a slash command. `None` means the text is not a command at all and
/// should go to the classifier instead.
pub fn parse_admin_command(text: &str) -> Option<CoreResult<AdminCommand>> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let tokens = match shell_words::split(text) {
        Ok(tokens) => tokens,
        Err(e) => {
            return Some(Err(CoreError::domain(
                "That command has unbalanced quoting.",
                format!("admin command parse failed: {}", e),
            )))
        }
    };
    let mut tokens = tokens.into_iter();
    let head = tokens.next()?;

    let command = match head.as_str() {
        "/status" => Ok(AdminCommand::Status),
        "/mcp" => Ok(AdminCommand::Mcp),
        "/memories" => Ok(AdminCommand::Memories),
        "/example" => Ok(AdminCommand::Example),
        "/reset" => Ok(AdminCommand::Reset),
        "/schedule" => parse_schedule_command(tokens.collect()),
        _ => return None,
    };
    Some(command)
}

fn parse_schedule_command(tokens: Vec<String>) -> CoreResult<AdminCommand> {
    let usage = || {
        CoreError::domain(
            "Usage: /schedule list|run|add|set|enable|disable|remove ...",
            "malformed /schedule command",
        )
    };
    let mut tokens = tokens.into_iter();
    let action = tokens.next().ok_or_else(usage)?;

    match action.as_str() {
        "list" => Ok(AdminCommand::ScheduleList),
        "run" => Ok(AdminCommand::ScheduleRun { name: tokens.next().ok_or_else(usage)? }),
        "enable" => Ok(AdminCommand::ScheduleEnable { name: tokens.next().ok_or_else(usage)? }),
        "disable" => Ok(AdminCommand::ScheduleDisable { name: tokens.next().ok_or_else(usage)? }),
        "remove" => Ok(AdminCommand::ScheduleRemove { name: tokens.next().ok_or_else(usage)? }),
        "set" => {
            let name = tokens.next().ok_or_else(usage)?;
            let interval = tokens.next().ok_or_else(usage)?;
            if !is_valid_interval(&interval) {
                return Err(CoreError::domain(
                    "Use once, hourly, daily, weekly, or every_<N>_minutes|hours|days.",
                    format!("invalid interval '{}'", interval),
                ));
            }
            Ok(AdminCommand::ScheduleSet { name, interval })
        }
        "add" => parse_schedule_add(tokens.collect()),
        other => Err(CoreError::domain(
            format!("Unknown schedule action '{}'.", other),
            format!("unknown schedule action '{}'", other),
        )),
    }
}

/// `/schedule add <name> [type] <interval> key=value...`
/// Recognized keys are a closed set; anything else is rejected here.
fn parse_schedule_add(tokens: Vec<String>) -> CoreResult<AdminCommand> {
    let usage = || {
        CoreError::domain(
            "Usage: /schedule add <name> [reminder|workflow|one_shot] <interval> \
             [at=HH:MM] [timezone=...] [message=...] [run_at=...] [source_url=...] [steps_json=...]",
            "malformed /schedule add",
        )
    };

    let mut args = ScheduleAddArgs::default();
    let mut positional: Vec<String> = Vec::new();

    for token in tokens {
        match token.split_once('=') {
            Some((key, value)) => match key {
                "at" => args.at = Some(value.to_string()),
                "timezone" => args.timezone = Some(value.to_string()),
                "message" => args.message = Some(value.to_string()),
                "source_url" => args.source_url = Some(value.to_string()),
                "run_at" => {
                    let parsed = DateTime::parse_from_rfc3339(value).map_err(|e| {
                        CoreError::domain(
                            "run_at must be an RFC 3339 timestamp.",
                            format!("bad run_at '{}': {}", value, e),
                        )
                    })?;
                    args.run_at = Some(parsed.with_timezone(&Utc));
                }
                "weekdays" => {
                    for part in value.split(',').filter(|p| !p.is_empty()) {
                        let day: u8 = part.parse().map_err(|_| {
                            CoreError::domain(
                                "weekdays must be numbers 0-6 (Monday=0).",
                                format!("bad weekday '{}'", part),
                            )
                        })?;
                        args.weekdays.push(day);
                    }
                }
                "steps_json" => {
                    args.steps = serde_json::from_str(value).map_err(|e| {
                        CoreError::domain(
                            "steps_json must be a JSON array of workflow steps.",
                            format!("bad steps_json: {}", e),
                        )
                    })?;
                }
                other => {
                    return Err(CoreError::domain(
                        format!("Unknown option '{}'.", other),
                        format!("unknown schedule add option '{}'", other),
                    ))
                }
            },
            None => positional.push(token),
        }
    }

    let mut positional = positional.into_iter();
    args.name = positional.next().ok_or_else(usage)?;
    let second = positional.next().ok_or_else(usage)?;
    if matches!(second.as_str(), "reminder" | "workflow" | "one_shot" | "custom") {
        args.kind = Some(second);
        args.interval = positional.next().ok_or_else(usage)?;
    } else {
        args.interval = second;
    }
    if !is_valid_interval(&args.interval) {
        return Err(CoreError::domain(
            "Use once, hourly, daily, weekly, or every_<N>_minutes|hours|days.",
            format!("invalid interval '{}'", args.interval),
        ));
    }

    Ok(AdminCommand::ScheduleAdd(Box::new(args)))
}

/// Bounded outbound channel; the scheduler side owns the sender.
pub fn notification_channel(capacity: usize) -> (mpsc::Sender<OutboundMessage>, mpsc::Receiver<OutboundMessage>) {
    mpsc::channel(capacity.max(1))
}

/// Inbound event channel; the transport owns the sender.
pub fn inbound_channel(capacity: usize) -> (mpsc::Sender<InboundEvent>, mpsc::Receiver<InboundEvent>) {
    mpsc::channel(capacity.max(1))
}

/// Sliding-window per-user rate limiter for the public message path.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            window: Duration::from_secs(60),
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_allowed(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let entry = hits.entry(user_id.to_string()).or_default();
        while entry.front().map(|t| now.duration_since(*t) > self.window).unwrap_or(false) {
            entry.pop_front();
        }
        if entry.len() >= self.limit as usize {
            return false;
        }
        entry.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(parse_admin_command("remind me to stretch").is_none());
        assert!(parse_admin_command("/unknowncmd foo").is_none());
    }

    #[test]
    fn simple_commands_parse() {
        assert_eq!(parse_admin_command("/status").unwrap().unwrap(), AdminCommand::Status);
        assert_eq!(parse_admin_command("/mcp").unwrap().unwrap(), AdminCommand::Mcp);
        assert_eq!(
            parse_admin_command("/schedule list").unwrap().unwrap(),
            AdminCommand::ScheduleList
        );
        assert_eq!(
            parse_admin_command("/schedule run hydrate").unwrap().unwrap(),
            AdminCommand::ScheduleRun { name: "hydrate".into() }
        );
    }

    #[test]
    fn schedule_add_parses_the_reminder_shape() {
        let command = parse_admin_command(
            "/schedule add hydrate reminder daily at=09:00 timezone=UTC message='drink water'",
        )
        .unwrap()
        .unwrap();

        let AdminCommand::ScheduleAdd(args) = command else {
            panic!("expected ScheduleAdd");
        };
        assert_eq!(args.name, "hydrate");
        assert_eq!(args.kind.as_deref(), Some("reminder"));
        assert_eq!(args.interval, "daily");
        assert_eq!(args.at.as_deref(), Some("09:00"));
        assert_eq!(args.timezone.as_deref(), Some("UTC"));
        assert_eq!(args.message.as_deref(), Some("drink water"));

        let task = args.into_task("admin", "UTC").unwrap();
        assert_eq!(task.kind, TaskKind::Reminder);
        assert_eq!(
            task.trigger,
            TriggerSpec::DailyAt { at: "09:00".into(), timezone: "UTC".into() }
        );
        assert_eq!(task.message(), Some("drink water"));
    }

    #[test]
    fn schedule_add_accepts_workflow_steps() {
        let command = parse_admin_command(
            r#"/schedule add btc_rule workflow every_5_minutes source_url=https://example.com/api steps_json='[{"action":"set","key":"price","expr":"float(source[\"usd\"])"}]'"#,
        )
        .unwrap()
        .unwrap();

        let AdminCommand::ScheduleAdd(args) = command else {
            panic!("expected ScheduleAdd");
        };
        assert_eq!(args.steps.len(), 1);
        let task = args.into_task("admin", "UTC").unwrap();
        assert_eq!(task.kind, TaskKind::Workflow);
        assert_eq!(task.source_url(), Some("https://example.com/api"));
    }

    #[test]
    fn unknown_options_and_intervals_are_rejected() {
        assert!(parse_admin_command("/schedule add x daily frequency=lots")
            .unwrap()
            .is_err());
        assert!(parse_admin_command("/schedule add x sometimes").unwrap().is_err());
        assert!(parse_admin_command("/schedule set x sometimes").unwrap().is_err());

        // Workflow without steps parses but fails task materialization.
        let AdminCommand::ScheduleAdd(args) =
            parse_admin_command("/schedule add x workflow daily at=09:00").unwrap().unwrap()
        else {
            panic!("expected ScheduleAdd");
        };
        assert!(args.into_task("admin", "UTC").is_err());
    }

    #[test]
    fn rate_limiter_caps_the_window() {
        let limiter = RateLimiter::per_minute(3);
        assert!(limiter.is_allowed("u1"));
        assert!(limiter.is_allowed("u1"));
        assert!(limiter.is_allowed("u1"));
        assert!(!limiter.is_allowed("u1"));
        // Other users are unaffected.
        assert!(limiter.is_allowed("u2"));
    }
}
