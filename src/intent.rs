//! Intent classification and interpretation for inbound messages.
//!
//! Every free-text message is normalized to one of four intents: chat (the
//! default), a schedule query, a structured schedule-add draft, or an action
//! request. Cheap regex heuristics run first; the LLM interpreter only sees
//! messages the heuristics could not settle. Action requests additionally
//! carry a confidence score and only leave chat mode above the configured
//! threshold.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::events::EventLog;
use crate::providers::{ChatMessage, ModelProvider};
use crate::scheduler::{build_trigger, ScheduleQualifiers};
use crate::types::{InboundMessage, Task, TaskKind, TriggerSpec, WorkflowStep};

const INTERPRETER_DEADLINE: Duration = Duration::from_secs(20);

static GREETING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(hi|hey|hello|yo|sup|salam|سلام|привет|hola)\b[\s!,.?]*$").expect("static regex")
});
static ACTION_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(run|execute|check|scan|trace|test|install|download|fetch|deploy|restart|build|compile|measure|ping)\b")
        .expect("static regex")
});
static SCHEDULE_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(remind|reminder|schedule|every|daily|weekly|hourly|tomorrow|alert me|notify me)\b")
        .expect("static regex")
});
static EVERY_INTERVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bevery\s+(\d+)\s*(m|min|mins|minutes?|h|hr|hrs|hours?|d|days?)\b")
        .expect("static regex")
});
static IN_INTERVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:in|after)\s+(\d+)\s*(m|min|mins|minutes?|h|hr|hrs|hours?|d|days?)\b")
        .expect("static regex")
});
static AT_CLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bat\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").expect("static regex")
});
static WEEKDAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bevery\s+(monday|tuesday|wednesday|thursday|friday|saturday|sunday)s?\b")
        .expect("static regex")
});
static THRESHOLD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:when|if)\b.*\b(rises?|drops?|falls?)\b.*?(\d+(?:\.\d+)?)\s*%")
        .expect("static regex")
});
static TOOL_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(mtr|traceroute|dig|ping|nmap|curl|wget|df|uptime|openssl)\b").expect("static regex")
});

/// Schedule query shapes the transport can answer from scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleQuery {
    List,
    Next,
}

/// Normalized intent for one inbound message.
#[derive(Debug)]
pub enum Intent {
    Chat { text: String },
    ScheduleQuery { query: ScheduleQuery },
    ScheduleAdd { task: Box<Task>, confirmation: String },
    ActionRequest { goal_text: String, constraints: Vec<String> },
}

#[derive(Debug)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f64,
    pub language: String,
}

pub struct IntentClassifier {
    provider: Arc<dyn ModelProvider>,
    events: EventLog,
    action_threshold: f64,
    default_timezone: String,
}

impl IntentClassifier {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        events: EventLog,
        action_threshold: f64,
        default_timezone: String,
    ) -> Self {
        Self { provider, events, action_threshold, default_timezone }
    }

    /// Classify one message. `user_timezone` is the user's recorded timezone
    /// when known; otherwise the configured default applies.
    pub async fn classify(
        &self,
        message: &InboundMessage,
        user_timezone: Option<&str>,
    ) -> CoreResult<Classification> {
        let text = message.text.trim();
        let language = detect_language(text, message.language_hint.as_deref());
        let timezone = user_timezone.unwrap_or(&self.default_timezone).to_string();

        if text.is_empty() {
            return Ok(Classification {
                intent: Intent::Chat { text: String::new() },
                confidence: 1.0,
                language,
            });
        }

        if let Some(query) = parse_schedule_query(text) {
            return Ok(Classification {
                intent: Intent::ScheduleQuery { query },
                confidence: 0.9,
                language,
            });
        }

        if looks_like_scheduling(text) {
            if let Some((task, confirmation, tz_converted)) =
                self.extract_schedule(message, text, &timezone)?
            {
                if tz_converted {
                    self.events.log(
                        "timezone_conversion",
                        "intent",
                        &message.user_id,
                        format!("Resolved schedule time in {}", timezone),
                        serde_json::json!({ "timezone": timezone, "task": task.id }),
                    );
                }
                return Ok(Classification {
                    intent: Intent::ScheduleAdd { task: Box::new(task), confirmation },
                    confidence: 0.9,
                    language,
                });
            }
        }

        let action_confidence = action_confidence(text);
        if action_confidence >= self.action_threshold {
            return Ok(Classification {
                intent: Intent::ActionRequest {
                    goal_text: text.to_string(),
                    constraints: Vec::new(),
                },
                confidence: action_confidence,
                language,
            });
        }

        // Heuristics were inconclusive but the message smells like
        // scheduling or automation: let the interpreter decide.
        if SCHEDULE_WORD.is_match(text) || THRESHOLD.is_match(text) {
            if let Some(classification) =
                self.interpret_with_llm(message, text, &timezone, &language).await
            {
                return Ok(classification);
            }
        }

        Ok(Classification {
            intent: Intent::Chat { text: text.to_string() },
            confidence: 1.0 - action_confidence,
            language,
        })
    }

    /// Regex-driven schedule extraction, mirroring the shapes users actually
    /// type. Returns (task, confirmation, timezone_conversion_happened).
    fn extract_schedule(
        &self,
        message: &InboundMessage,
        text: &str,
        timezone: &str,
    ) -> CoreResult<Option<(Task, String, bool)>> {
        let lower = text.to_lowercase();
        let body = reminder_body(text);
        let user = message.user_id.as_str();

        // Threshold automation: "when BTC rises 2% from current price ..."
        if let Some(caps) = THRESHOLD.captures(text) {
            if let Some(task) = threshold_workflow(&lower, &caps, user) {
                let confirmation = format!(
                    "Watching for a {}% move; I'll alert you when it happens.",
                    &caps[2]
                );
                return Ok(Some((task, confirmation, false)));
            }
            return Ok(None);
        }

        // "in 15 minutes" one-shot.
        if let Some(caps) = IN_INTERVAL.captures(&lower) {
            let amount: i64 = caps[1].parse().unwrap_or(0);
            if amount > 0 {
                let delta = match unit_of(&caps[2]) {
                    "minutes" => ChronoDuration::minutes(amount),
                    "hours" => ChronoDuration::hours(amount),
                    _ => ChronoDuration::days(amount),
                };
                let at = message.timestamp + delta;
                let mut task = Task::new(
                    format!("once_{}_{}", slug(&body), at.timestamp()),
                    user,
                    TaskKind::OneShot,
                    TriggerSpec::OneShot { at },
                );
                task.payload.insert("message".into(), Value::String(body.clone()));
                task.next_run_at = Some(at);
                let confirmation = format!("Got it, I'll remind you in {} {}.", amount, unit_of(&caps[2]));
                return Ok(Some((task, confirmation, false)));
            }
        }

        // "every N minutes/hours/days" recurring reminder.
        if let Some(caps) = EVERY_INTERVAL.captures(&lower) {
            let amount: u64 = caps[1].parse().unwrap_or(0);
            if amount > 0 {
                let interval = format!("every_{}_{}", amount, unit_of(&caps[2]));
                let trigger = build_trigger(
                    &interval,
                    &ScheduleQualifiers::default(),
                    &self.default_timezone,
                )?;
                let mut task = Task::new(
                    format!("auto_{}_{}", slug(&body), user),
                    user,
                    TaskKind::Reminder,
                    trigger,
                );
                task.payload.insert("message".into(), Value::String(body.clone()));
                let confirmation =
                    format!("Got it, I'll remind you every {} {}.", amount, unit_of(&caps[2]));
                return Ok(Some((task, confirmation, false)));
            }
        }

        // Weekday / daily patterns with an optional at-time.
        let at = parse_at_clock(&lower)?;
        if let Some(caps) = WEEKDAY.captures(&lower) {
            let weekday = weekday_index(&caps[1]);
            let qualifiers = ScheduleQualifiers {
                at: Some(at.clone().unwrap_or_else(|| "09:00".to_string())),
                timezone: Some(timezone.to_string()),
                weekdays: vec![weekday],
                ..Default::default()
            };
            let trigger = build_trigger("weekly", &qualifiers, &self.default_timezone)?;
            let mut task = Task::new(
                format!("weekly_{}_{}", slug(&body), user),
                user,
                TaskKind::Reminder,
                trigger,
            );
            task.payload.insert("message".into(), Value::String(body.clone()));
            return Ok(Some((
                task,
                format!("Got it, I'll remind you every {}.", &caps[1].to_lowercase()),
                true,
            )));
        }

        if lower.contains("every day") || lower.contains("daily") {
            // Missing at-time defaults to a morning reminder; an unparseable
            // one already errored above.
            let at = at.unwrap_or_else(|| "09:00".to_string());
            let qualifiers = ScheduleQualifiers {
                at: Some(at.clone()),
                timezone: Some(timezone.to_string()),
                ..Default::default()
            };
            let trigger = build_trigger("daily", &qualifiers, &self.default_timezone)?;
            let mut task = Task::new(
                format!("daily_{}_{}", slug(&body), user),
                user,
                TaskKind::Reminder,
                trigger,
            );
            task.payload.insert("message".into(), Value::String(body.clone()));
            return Ok(Some((
                task,
                format!("Got it, I'll remind you every day at {} ({}).", at, timezone),
                true,
            )));
        }

        Ok(None)
    }

    /// LLM fallback: convert the message to a strict JSON envelope. Returns
    /// None when the model does not produce a usable envelope.
    async fn interpret_with_llm(
        &self,
        message: &InboundMessage,
        text: &str,
        timezone: &str,
        language: &str,
    ) -> Option<Classification> {
        let prompt = format!(
            "Interpret this user message for an automation assistant.\n\
             Current UTC time: {}\n\
             User timezone: {}\n\
             Return strict JSON only:\n\
             {{\n\
               \"intent\": \"schedule|action|none\",\n\
               \"confidence\": 0.0,\n\
               \"confirmation\": \"short confirmation in the user's language\",\n\
               \"task\": {{\n\
                 \"interval\": \"once|hourly|daily|weekly|every_<N>_minutes|every_<N>_hours|every_<N>_days\",\n\
                 \"run_at\": \"ISO8601, for once\",\n\
                 \"at\": \"HH:MM, optional\",\n\
                 \"timezone\": \"IANA, optional\",\n\
                 \"message\": \"reminder text\"\n\
               }}\n\
             }}\n\
             For non-scheduling messages set intent=none and omit task.\n\
             User message: {}",
            Utc::now().to_rfc3339(),
            timezone,
            text
        );

        let completion = self
            .provider
            .complete(
                &[
                    ChatMessage::system(
                        "You convert natural-language requests into strict JSON envelopes. JSON only, no markdown.",
                    ),
                    ChatMessage::user(prompt),
                ],
                0.0,
                512,
                INTERPRETER_DEADLINE,
            )
            .await
            .ok()?;

        let payload = extract_json_object(&completion.text)?;
        let intent = payload["intent"].as_str().unwrap_or("none");
        let confidence = payload["confidence"].as_f64().unwrap_or(0.5);
        debug!(intent, confidence, "Interpreter envelope received");

        match intent {
            "schedule" => {
                let spec = payload.get("task")?;
                let interval = spec["interval"].as_str()?;
                let qualifiers = ScheduleQualifiers {
                    at: spec["at"].as_str().map(|s| s.to_string()),
                    timezone: spec["timezone"]
                        .as_str()
                        .map(|s| s.to_string())
                        .or_else(|| Some(timezone.to_string())),
                    run_at: spec["run_at"]
                        .as_str()
                        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc)),
                    weekdays: Vec::new(),
                };
                let trigger =
                    build_trigger(interval, &qualifiers, &self.default_timezone).ok()?;
                let body = spec["message"].as_str().unwrap_or("Reminder").to_string();
                let kind = match &trigger {
                    TriggerSpec::OneShot { .. } => TaskKind::OneShot,
                    _ => TaskKind::Reminder,
                };
                let mut task = Task::new(
                    format!("nl_{}_{}", slug(&body), message.user_id),
                    &message.user_id,
                    kind,
                    trigger,
                );
                task.payload.insert("message".into(), Value::String(body));
                let confirmation = payload["confirmation"]
                    .as_str()
                    .unwrap_or("Scheduled.")
                    .to_string();
                Some(Classification {
                    intent: Intent::ScheduleAdd { task: Box::new(task), confirmation },
                    confidence,
                    language: language.to_string(),
                })
            }
            "action" if confidence >= self.action_threshold => Some(Classification {
                intent: Intent::ActionRequest {
                    goal_text: text.to_string(),
                    constraints: Vec::new(),
                },
                confidence,
                language: language.to_string(),
            }),
            _ => None,
        }
    }
}

fn ambiguous_intent() -> CoreError {
    CoreError::domain(
        "I couldn't pin down the time for that. Try something like 'every day at 09:00'.",
        "AmbiguousIntent: at-time missing or unresolvable",
    )
}

/// Heuristic action confidence, before the threshold gate.
pub fn action_confidence(text: &str) -> f64 {
    if GREETING.is_match(text) && !TOOL_WORD.is_match(text) {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let has_action_word = ACTION_WORD.is_match(text);
    let has_command_shape = lower.starts_with("run ")
        || lower.starts_with("execute ")
        || lower.starts_with("check ")
        || lower.starts_with("scan ")
        || lower.starts_with("test ")
        || lower.starts_with("trace ");
    if has_action_word && (has_command_shape || TOOL_WORD.is_match(text)) {
        0.95
    } else {
        0.1
    }
}

fn parse_schedule_query(text: &str) -> Option<ScheduleQuery> {
    let lower = text.trim().to_lowercase();
    let about_schedules = lower.contains("reminder") || lower.contains("schedule") || lower.contains("task");
    if !about_schedules {
        return None;
    }
    if lower.contains("list") || lower.contains("show") || lower.contains("what are") {
        return Some(ScheduleQuery::List);
    }
    if lower.contains("next") || lower.contains("upcoming") {
        return Some(ScheduleQuery::Next);
    }
    None
}

fn looks_like_scheduling(text: &str) -> bool {
    SCHEDULE_WORD.is_match(text) || IN_INTERVAL.is_match(text) || THRESHOLD.is_match(text)
}

fn unit_of(raw: &str) -> &'static str {
    let lower = raw.to_lowercase();
    if lower.starts_with('h') {
        "hours"
    } else if lower.starts_with('d') {
        "days"
    } else {
        "minutes"
    }
}

/// "HH(:MM)? (am|pm)?" to "HH:MM", erroring on out-of-range clock values in
/// clearly schedule-shaped text.
fn parse_at_clock(lower: &str) -> CoreResult<Option<String>> {
    let Some(caps) = AT_CLOCK.captures(lower) else {
        return Ok(None);
    };
    let mut hour: u32 = caps[1].parse().unwrap_or(99);
    let minute: u32 = caps.get(2).map(|m| m.as_str().parse().unwrap_or(99)).unwrap_or(0);
    match caps.get(3).map(|m| m.as_str().to_lowercase()) {
        Some(meridiem) if meridiem == "pm" && hour < 12 => hour += 12,
        Some(meridiem) if meridiem == "am" && hour == 12 => hour = 0,
        _ => {}
    }
    if hour > 23 || minute > 59 {
        return Err(ambiguous_intent());
    }
    Ok(Some(format!("{:02}:{:02}", hour, minute)))
}

fn weekday_index(name: &str) -> u8 {
    match name.to_lowercase().as_str() {
        "monday" => 0,
        "tuesday" => 1,
        "wednesday" => 2,
        "thursday" => 3,
        "friday" => 4,
        "saturday" => 5,
        _ => 6,
    }
}

/// Strip scheduling phrasing out of the message, keeping the thing to be
/// reminded about.
fn reminder_body(text: &str) -> String {
    static LEADING: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)^.*?\b(?:remind me to|remind me|remember to|notify me to|notify me|alert me to|alert me)\b")
            .expect("static regex")
    });
    static TIME_PHRASE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"(?i)\s*(?:(?:in|after)\s+\d+\s*(?:m|min|mins|minutes?|h|hr|hrs|hours?|d|days?)|every\s+\d+\s*(?:m|min|mins|minutes?|h|hr|hrs|hours?|d|days?)|every day|daily|weekly|hourly|every\s+(?:monday|tuesday|wednesday|thursday|friday|saturday|sunday)s?|at\s+\d{1,2}(?::\d{2})?\s*(?:am|pm)?)\b",
        )
        .expect("static regex")
    });
    let stripped = LEADING.replace(text, "");
    let stripped = TIME_PHRASE.replace_all(&stripped, " ");
    let body = stripped.trim().trim_matches(|c: char| c == '.' || c == ',').trim();
    let body = body.strip_prefix("to ").unwrap_or(body).trim();
    if body.is_empty() {
        "your reminder".to_string()
    } else {
        body.to_string()
    }
}

fn slug(text: &str) -> String {
    let mut slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    slug.truncate(24);
    slug.trim_matches('_').to_string()
}

/// Build the percent-change workflow for assets we know how to source.
fn threshold_workflow(lower: &str, caps: &regex::Captures, user: &str) -> Option<Task> {
    let (asset, key) = if lower.contains("btc") || lower.contains("bitcoin") {
        ("bitcoin", "btc")
    } else if lower.contains("eth") || lower.contains("ethereum") {
        ("ethereum", "eth")
    } else {
        return None;
    };
    let percent: f64 = caps[2].parse().ok()?;
    let direction = caps[1].to_lowercase();
    let rising = direction.starts_with("rise");

    let interval_seconds = EVERY_INTERVAL
        .captures(lower)
        .and_then(|c| {
            let n: u64 = c[1].parse().ok()?;
            Some(match unit_of(&c[2]) {
                "hours" => n * 3600,
                "days" => n * 86_400,
                _ => n * 60,
            })
        })
        .unwrap_or(300);

    let comparison = if rising {
        format!(
            "state.get(\"last_price\") and ((price-float(state[\"last_price\"]))/float(state[\"last_price\"])*100)>={}",
            percent
        )
    } else {
        format!(
            "state.get(\"last_price\") and ((float(state[\"last_price\"])-price)/float(state[\"last_price\"])*100)>={}",
            percent
        )
    };
    let message = format!(
        "{} {} >={}%, price={{price}}",
        asset.to_uppercase(),
        if rising { "up" } else { "down" },
        percent
    );

    let mut task = Task::new(
        format!("{}_rule_{}", key, user),
        user,
        TaskKind::Workflow,
        TriggerSpec::Interval { seconds: interval_seconds, anchor: None },
    );
    task.payload.insert(
        "source_url".into(),
        Value::String(format!(
            "https://api.coingecko.com/api/v3/simple/price?ids={}&vs_currencies=usd",
            asset
        )),
    );
    task.steps = vec![
        WorkflowStep::Set {
            key: "price".into(),
            expr: format!("float(source[\"{}\"][\"usd\"])", asset),
        },
        WorkflowStep::Notify { message, when: Some(comparison) },
        WorkflowStep::SetState { key: "last_price".into(), expr: "price".into() },
    ];
    Some(task)
}

/// Script-range language detection; good enough to pick a reply language
/// without a model round trip.
pub fn detect_language(text: &str, hint: Option<&str>) -> String {
    if let Some(hint) = hint {
        let hint = hint.trim().to_lowercase();
        if hint.len() == 2 {
            return hint;
        }
    }
    for c in text.chars() {
        let code = c as u32;
        if (0x0600..=0x06FF).contains(&code) {
            return "fa".to_string();
        }
        if (0x4E00..=0x9FFF).contains(&code) {
            return "zh".to_string();
        }
        if (0x3040..=0x30FF).contains(&code) {
            return "ja".to_string();
        }
        if (0xAC00..=0xD7AF).contains(&code) {
            return "ko".to_string();
        }
        if (0x0400..=0x04FF).contains(&code) {
            return "ru".to_string();
        }
    }
    if text.to_lowercase().chars().any(|c| "ñáéíóúü¿¡".contains(c)) {
        return "es".to_string();
    }
    "en".to_string()
}

/// Pull the first JSON object out of possibly chatty model output.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::ScriptedProvider;
    use crate::store::SqliteStore;

    async fn classifier(provider: ScriptedProvider) -> IntentClassifier {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let (events, _handle) = EventLog::spawn(store, 100);
        IntentClassifier::new(Arc::new(provider), events, 0.8, "UTC".to_string())
    }

    fn inbound(text: &str) -> InboundMessage {
        InboundMessage {
            user_id: "u1".into(),
            timestamp: Utc::now(),
            text: text.into(),
            language_hint: None,
        }
    }

    #[tokio::test]
    async fn relative_one_shot_is_extracted() {
        let classifier = classifier(ScriptedProvider::of_texts(&[])).await;
        let message = inbound("Remind me in 15 minutes to stretch");
        let t0 = message.timestamp;

        let result = classifier.classify(&message, None).await.unwrap();
        match result.intent {
            Intent::ScheduleAdd { task, .. } => {
                assert_eq!(task.kind, TaskKind::OneShot);
                assert!(task.enabled);
                assert_eq!(task.message(), Some("stretch"));
                match task.trigger {
                    TriggerSpec::OneShot { at } => {
                        assert_eq!(at, t0 + ChronoDuration::minutes(15));
                    }
                    other => panic!("expected one-shot trigger, got {:?}", other),
                }
            }
            other => panic!("expected ScheduleAdd, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn daily_reminder_with_time_and_timezone() {
        let classifier = classifier(ScriptedProvider::of_texts(&[])).await;
        let result = classifier
            .classify(&inbound("remind me every day at 9am to drink water"), Some("Europe/Berlin"))
            .await
            .unwrap();
        match result.intent {
            Intent::ScheduleAdd { task, .. } => {
                assert_eq!(
                    task.trigger,
                    TriggerSpec::DailyAt { at: "09:00".into(), timezone: "Europe/Berlin".into() }
                );
                assert_eq!(task.message(), Some("drink water"));
            }
            other => panic!("expected ScheduleAdd, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn threshold_automation_compiles_to_a_workflow() {
        let classifier = classifier(ScriptedProvider::of_texts(&[])).await;
        let result = classifier
            .classify(
                &inbound("Check BTC price every 5 minutes and notify me when it rises 2% from current price"),
                None,
            )
            .await
            .unwrap();
        match result.intent {
            Intent::ScheduleAdd { task, .. } => {
                assert_eq!(task.kind, TaskKind::Workflow);
                assert_eq!(
                    task.trigger,
                    TriggerSpec::Interval { seconds: 300, anchor: None }
                );
                assert!(task.source_url().unwrap().contains("bitcoin"));
                assert_eq!(task.steps.len(), 3);
            }
            other => panic!("expected workflow ScheduleAdd, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn low_confidence_action_words_stay_in_chat() {
        let classifier = classifier(ScriptedProvider::of_texts(&[])).await;
        // "check" alone, no command shape or tool word: 0.1 < 0.8.
        let result = classifier
            .classify(&inbound("can you double check something for me later?"), None)
            .await
            .unwrap();
        assert!(matches!(result.intent, Intent::Chat { .. }));

        let result = classifier.classify(&inbound("hello!"), None).await.unwrap();
        assert!(matches!(result.intent, Intent::Chat { .. }));
    }

    #[tokio::test]
    async fn explicit_commands_clear_the_action_threshold() {
        let classifier = classifier(ScriptedProvider::of_texts(&[])).await;
        let result = classifier
            .classify(&inbound("run traceroute to example.com and report the hops"), None)
            .await
            .unwrap();
        match result.intent {
            Intent::ActionRequest { goal_text, .. } => {
                assert!(goal_text.contains("traceroute"));
                assert!(result.confidence >= 0.8);
            }
            other => panic!("expected ActionRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn schedule_queries_are_recognized() {
        let classifier = classifier(ScriptedProvider::of_texts(&[])).await;
        let result = classifier.classify(&inbound("list my reminders"), None).await.unwrap();
        assert!(matches!(result.intent, Intent::ScheduleQuery { query: ScheduleQuery::List }));

        let result = classifier
            .classify(&inbound("what's the next scheduled task?"), None)
            .await
            .unwrap();
        assert!(matches!(result.intent, Intent::ScheduleQuery { query: ScheduleQuery::Next }));
    }

    #[tokio::test]
    async fn unparseable_clock_is_an_ambiguous_intent() {
        let classifier = classifier(ScriptedProvider::of_texts(&[])).await;
        let err = classifier
            .classify(&inbound("remind me every day at 25:00 to sleep"), None)
            .await
            .unwrap_err();
        assert!(err.operator_message.contains("AmbiguousIntent"));
    }

    #[test]
    fn language_detection_by_script() {
        assert_eq!(detect_language("سلام، خوبی؟", None), "fa");
        assert_eq!(detect_language("你好", None), "zh");
        assert_eq!(detect_language("Привет", None), "ru");
        assert_eq!(detect_language("hello there", None), "en");
        assert_eq!(detect_language("hola, ¿qué tal?", None), "es");
        assert_eq!(detect_language("whatever", Some("de")), "de");
    }

    #[test]
    fn reminder_body_strips_schedule_phrasing() {
        assert_eq!(reminder_body("Remind me in 15 minutes to stretch"), "stretch");
        assert_eq!(
            reminder_body("remind me to take my pills every day at 9am"),
            "take my pills"
        );
        assert_eq!(reminder_body("every 5m"), "your reminder");
    }

    #[test]
    fn json_extraction_tolerates_prose() {
        let raw = "Sure! Here's the envelope:\n{\"intent\": \"none\"}\nHope it helps.";
        assert_eq!(extract_json_object(raw).unwrap()["intent"], "none");
        assert!(extract_json_object("no json here").is_none());
    }
}
