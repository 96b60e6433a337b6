//! Composition root: builds every component in dependency order, wires the
//! channels between them, and runs the inbound dispatcher until shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::autonomy::AutonomyService;
use crate::config::AppConfig;
use crate::debate::DebateDispatcher;
use crate::events::{self, EventLog};
use crate::intent::{Classification, Intent, IntentClassifier, ScheduleQuery};
use crate::mcp::{ProcessSupervisor, ToolRegistry};
use crate::memory::{search_degraded, HttpMemoryStore, MemoryStore, NullMemoryStore};
use crate::providers::{ChatMessage, FailoverProvider, ModelProvider, OpenAiCompatibleProvider};
use crate::sandbox::SandboxExecutor;
use crate::scheduler::SchedulerEngine;
use crate::store::{keys, SqliteStore, Store};
use crate::transport::{
    inbound_channel, notification_channel, AdminCommand, InboundEvent, RateLimiter,
};
use crate::types::{InboundMessage, OutboundMessage, ReplyMode};
use crate::workflow::WorkflowEngine;

const CHAT_DEADLINE: Duration = Duration::from_secs(45);

/// Everything the dispatcher loop needs, built once at boot.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    events: EventLog,
    supervisor: Arc<ProcessSupervisor>,
    scheduler: Arc<SchedulerEngine>,
    classifier: IntentClassifier,
    debate: Arc<DebateDispatcher>,
    autonomy: Arc<AutonomyService>,
    memory: Arc<dyn MemoryStore>,
    provider: Arc<dyn ModelProvider>,
    outbound: mpsc::Sender<OutboundMessage>,
    rate_limiter: RateLimiter,
    admin_user_ids: Vec<String>,
    action_intent_threshold: f64,
    memory_strict_mode: bool,
    default_timezone: String,
}

impl Dispatcher {
    /// Consume inbound events until the channel closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundEvent>) {
        while let Some(event) = inbound.recv().await {
            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                match event {
                    InboundEvent::Message(message) => dispatcher.handle_message(message).await,
                    InboundEvent::Admin { user_id, command } => {
                        dispatcher.handle_admin(&user_id, command).await
                    }
                }
            });
        }
        info!("Inbound channel closed, dispatcher stopping");
    }

    async fn reply(&self, user_id: &str, text: impl Into<String>) {
        let message = OutboundMessage {
            user_id: user_id.to_string(),
            text: text.into(),
            reply_mode: ReplyMode::Reply,
        };
        if self.outbound.send(message).await.is_err() {
            warn!(user_id, "Outbound channel closed, dropping reply");
        }
    }

    /// Monotonic counters under `her:metrics:*`.
    async fn bump_metric(&self, name: &str, by: u64) {
        let key = keys::metric(name);
        let current = self
            .store
            .kv_get(&key)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let _ = self.store.kv_set(&key, &(current + by).to_string(), None).await;
    }

    async fn handle_message(&self, message: InboundMessage) {
        let user_id = message.user_id.clone();
        let is_admin = self.admin_user_ids.iter().any(|id| id == &user_id);
        self.bump_metric("messages", 1).await;

        if !is_admin && !self.rate_limiter.is_allowed(&user_id) {
            self.reply(&user_id, "Please slow down a bit.").await;
            return;
        }

        // Fold the message into the autonomy profile before anything else.
        if let Err(e) = self
            .autonomy
            .record_user_message(&user_id, &message.text, true, None)
            .await
        {
            warn!(user_id, error = %e, "Profile update failed");
        }

        // Remember the exchange in the per-user context ring.
        let context_entry = serde_json::json!({
            "role": "user",
            "message": message.text,
            "timestamp": message.timestamp.to_rfc3339(),
        });
        let _ = self
            .store
            .kv_lpush_trim(&keys::user_context(&user_id), &context_entry.to_string(), 50)
            .await;

        let classification = match self.classifier.classify(&message, None).await {
            Ok(classification) => classification,
            Err(e) => {
                self.reply(&user_id, e.user_message.clone()).await;
                self.events.log(
                    "intent_error",
                    "intent",
                    &user_id,
                    "Classification failed",
                    serde_json::json!({ "error": e.operator_message, "kind": e.kind.to_string() }),
                );
                return;
            }
        };

        self.dispatch(&user_id, &message, classification).await;
    }

    async fn dispatch(
        &self,
        user_id: &str,
        message: &InboundMessage,
        classification: Classification,
    ) {
        let language = classification.language.clone();
        match classification.intent {
            Intent::Chat { text } => {
                let reply = self.chat_reply(user_id, &text).await;
                self.reply(user_id, reply).await;
            }
            Intent::ScheduleQuery { query } => {
                let reply = self.schedule_query_reply(query).await;
                self.reply(user_id, reply).await;
            }
            Intent::ScheduleAdd { task, confirmation } => {
                match self.scheduler.add_task(*task).await {
                    Ok(_) => self.reply(user_id, confirmation).await,
                    Err(e) => self.reply(user_id, e.user_message.clone()).await,
                }
            }
            Intent::ActionRequest { goal_text, .. } => {
                // The classifier already gated on confidence; keep the
                // invariant locally too.
                if classification.confidence < self.action_intent_threshold {
                    let reply = self.chat_reply(user_id, &message.text).await;
                    self.reply(user_id, reply).await;
                    return;
                }
                let outcome = self.debate.handle(user_id, &goal_text, &language).await;
                self.reply(user_id, outcome.reply).await;
            }
        }
    }

    /// Plain conversational turn: recall relevant memories, answer, remember.
    async fn chat_reply(&self, user_id: &str, text: &str) -> String {
        let hits = match search_degraded(
            self.memory.as_ref(),
            user_id,
            text,
            5,
            self.memory_strict_mode,
        )
        .await
        {
            Ok(hits) => hits,
            Err(e) => return e.user_message,
        };

        let recall = if hits.is_empty() {
            String::new()
        } else {
            let lines: Vec<String> = hits.iter().map(|h| format!("- {}", h.text)).collect();
            format!("\nKnown about this user:\n{}", lines.join("\n"))
        };

        let result = self
            .provider
            .complete(
                &[
                    ChatMessage::system(format!(
                        "You are HER, a warm personal assistant. Reply in the user's language, concisely.{}",
                        recall
                    )),
                    ChatMessage::user(text),
                ],
                0.7,
                1024,
                CHAT_DEADLINE,
            )
            .await;

        match result {
            Ok(completion) => {
                self.bump_metric(
                    "tokens",
                    (completion.input_tokens + completion.output_tokens) as u64,
                )
                .await;
                let _ = self
                    .memory
                    .add(user_id, text, serde_json::json!({ "kind": "conversation" }))
                    .await;
                completion.text
            }
            Err(e) => {
                warn!(user_id, error = %e, "Chat completion failed");
                "I'm having trouble thinking right now. Give me a moment and try again.".to_string()
            }
        }
    }

    async fn schedule_query_reply(&self, query: ScheduleQuery) -> String {
        let tasks = match self.scheduler.list_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => return e.user_message,
        };
        let mut enabled: Vec<_> = tasks.iter().filter(|t| t.enabled).collect();
        enabled.sort_by_key(|t| t.next_run_at);

        match query {
            ScheduleQuery::Next => match enabled.first() {
                Some(task) => format!(
                    "Next up: '{}' at {}.",
                    task.id,
                    task.next_run_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "unscheduled".into())
                ),
                None => "Nothing is scheduled.".to_string(),
            },
            ScheduleQuery::List => {
                if enabled.is_empty() {
                    return "Nothing is scheduled.".to_string();
                }
                let lines: Vec<String> = enabled
                    .iter()
                    .map(|t| {
                        format!(
                            "- {} ({}) next {}",
                            t.id,
                            t.kind.as_str(),
                            t.next_run_at
                                .map(|n| n.to_rfc3339())
                                .unwrap_or_else(|| "unscheduled".into())
                        )
                    })
                    .collect();
                format!("Scheduled tasks:\n{}", lines.join("\n"))
            }
        }
    }

    async fn handle_admin(&self, user_id: &str, command: AdminCommand) {
        let reply = match command {
            AdminCommand::Status => self.status_reply().await,
            AdminCommand::ScheduleList => self.schedule_query_reply(ScheduleQuery::List).await,
            AdminCommand::ScheduleRun { name } => match self.scheduler.run_now(&name).await {
                Ok(true) => format!("Ran '{}'.", name),
                Ok(false) => format!("No task named '{}'.", name),
                Err(e) => e.user_message,
            },
            AdminCommand::ScheduleAdd(args) => match args.into_task(user_id, &self.default_timezone) {
                Ok(task) => match self.scheduler.add_task(task).await {
                    Ok(saved) => format!(
                        "Added '{}', first run {}.",
                        saved.id,
                        saved
                            .next_run_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "unscheduled".into())
                    ),
                    Err(e) => e.user_message,
                },
                Err(e) => e.user_message,
            },
            AdminCommand::ScheduleSet { name, interval } => {
                match self.reschedule(&name, &interval).await {
                    Ok(true) => format!("'{}' now runs {}.", name, interval.replace('_', " ")),
                    Ok(false) => format!("No task named '{}'.", name),
                    Err(e) => e.user_message,
                }
            }
            AdminCommand::ScheduleEnable { name } => {
                match self.scheduler.set_enabled(&name, true).await {
                    Ok(true) => format!("Enabled '{}'.", name),
                    Ok(false) => format!("No task named '{}'.", name),
                    Err(e) => e.user_message,
                }
            }
            AdminCommand::ScheduleDisable { name } => {
                match self.scheduler.set_enabled(&name, false).await {
                    Ok(true) => format!("Disabled '{}'.", name),
                    Ok(false) => format!("No task named '{}'.", name),
                    Err(e) => e.user_message,
                }
            }
            AdminCommand::ScheduleRemove { name } => match self.scheduler.remove_task(&name).await {
                Ok(()) => format!("Removed '{}'.", name),
                Err(e) => e.user_message,
            },
            AdminCommand::Mcp => self.mcp_reply().await,
            AdminCommand::Memories => self.memories_reply(user_id).await,
            AdminCommand::Example => EXAMPLES.to_string(),
            AdminCommand::Reset => {
                match self.store.kv_list_clear(&keys::user_context(user_id)).await {
                    Ok(()) => "Context cleared.".to_string(),
                    Err(e) => e.user_message,
                }
            }
        };
        self.reply(user_id, reply).await;
    }

    async fn status_reply(&self) -> String {
        let tasks = self.scheduler.list_tasks().await.unwrap_or_default();
        let enabled = tasks.iter().filter(|t| t.enabled).count();
        let servers = self.supervisor.status_snapshots().await;
        let running = servers
            .iter()
            .filter(|s| s.status == crate::types::ServerStatus::Running)
            .count();
        format!(
            "Scheduler: {} ({} tasks, {} enabled)\nTool servers: {}/{} running",
            if self.scheduler.holds_lock() { "active" } else { "standby" },
            tasks.len(),
            enabled,
            running,
            servers.len(),
        )
    }

    async fn mcp_reply(&self) -> String {
        let servers = self.supervisor.status_snapshots().await;
        if servers.is_empty() {
            return "No tool servers configured.".to_string();
        }
        let lines: Vec<String> = servers
            .iter()
            .map(|s| {
                let detail = match (&s.last_error, s.tool_names.len()) {
                    (Some(error), _) => error.clone(),
                    (None, n) => format!("{} tools", n),
                };
                format!("- {}: {} ({})", s.name, s.status.as_str(), detail)
            })
            .collect();
        lines.join("\n")
    }

    async fn memories_reply(&self, user_id: &str) -> String {
        match self.memory.search(user_id, "everything you remember", 10).await {
            Ok(hits) if hits.is_empty() => "No memories stored yet.".to_string(),
            Ok(mut hits) => {
                hits.sort_by(|a, b| b.score.total_cmp(&a.score));
                let lines: Vec<String> = hits.iter().map(|h| format!("- {}", h.text)).collect();
                format!("What I remember:\n{}", lines.join("\n"))
            }
            Err(_) => "The memory store is unreachable right now.".to_string(),
        }
    }

    async fn reschedule(&self, name: &str, interval: &str) -> crate::error::CoreResult<bool> {
        let Some(mut task) = self.store.load_task(name).await? else {
            return Ok(false);
        };
        task.trigger = crate::scheduler::build_trigger(
            interval,
            &crate::scheduler::ScheduleQualifiers::default(),
            &self.default_timezone,
        )?;
        task.next_run_at = crate::clock::next_fire(&task.trigger, crate::clock::now_utc())?;
        task.updated_at = crate::clock::now_utc();
        self.store.save_task(&task).await?;
        Ok(true)
    }
}

const EXAMPLES: &str = "Try:\n\
- Remind me in 20 minutes to stretch\n\
- /schedule add hydrate reminder daily at=09:00 timezone=UTC message='drink water'\n\
- Check BTC price every 5 minutes and notify me when it rises 2% from current price\n\
- run traceroute to example.com and summarize the hops\n\
- /mcp to see tool server status";

/// Build everything in dependency order and run until ctrl-c.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 1. Persistence gateway.
    let store: Arc<SqliteStore> = Arc::new(SqliteStore::new(&config.store.db_path).await?);
    let store_dyn: Arc<dyn Store> = store.clone();

    // 2. Event streams.
    let (events, events_handle) =
        EventLog::spawn(store_dyn.clone(), config.workflow.event_queue_max_size);

    // 3. Tool server supervision + capability routing.
    let supervisor = ProcessSupervisor::new(config.mcp.clone(), events.clone());
    supervisor.boot().await;
    let registry = ToolRegistry::new(Arc::clone(&supervisor));

    // Advertise what this deployment can actually do right now.
    let capabilities: Vec<String> = supervisor
        .running_tools()
        .await
        .iter()
        .map(|t| format!("{}.{}", t.server_name, t.tool_name))
        .collect();
    let snapshot = serde_json::json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sandbox": true,
        "tools": capabilities,
    });
    if let Err(e) = store_dyn
        .kv_set(keys::RUNTIME_CAPABILITIES, &snapshot.to_string(), None)
        .await
    {
        warn!(error = %e, "Failed to publish runtime capabilities");
    }

    // 4. LLM provider with optional failover.
    let primary = OpenAiCompatibleProvider::new(
        &config.provider.base_url,
        &config.provider.api_key,
        &config.provider.model,
    )
    .map_err(|e| anyhow::anyhow!(e))?;
    let secondary = match (&config.provider.secondary_base_url, &config.provider.secondary_api_key)
    {
        (Some(base_url), Some(api_key)) => Some(Box::new(
            OpenAiCompatibleProvider::new(
                base_url,
                api_key,
                config
                    .provider
                    .secondary_model
                    .as_deref()
                    .unwrap_or(&config.provider.model),
            )
            .map_err(|e| anyhow::anyhow!(e))?,
        ) as Box<dyn ModelProvider>),
        _ => None,
    };
    let provider: Arc<dyn ModelProvider> =
        Arc::new(FailoverProvider::new(Box::new(primary), secondary));

    // 5. Memory boundary.
    let memory: Arc<dyn MemoryStore> = match &config.memory.base_url {
        Some(base_url) => {
            Arc::new(HttpMemoryStore::new(base_url, config.memory.api_key.as_deref())?)
        }
        None => Arc::new(NullMemoryStore),
    };

    // 6. Scheduler with the workflow engine and outbound channel.
    let workflow = WorkflowEngine::new(&config.workflow, Some(registry.clone()))?;
    let (outbound_tx, mut outbound_rx) = notification_channel(config.transport.outbound_capacity);
    let scheduler = SchedulerEngine::new(
        store_dyn.clone(),
        events.clone(),
        workflow,
        outbound_tx.clone(),
        config.scheduler.clone(),
        config.transport.default_timezone.clone(),
    );
    if let Some(tasks_file) = &config.scheduler.tasks_file {
        if let Err(e) = scheduler.seed_from_yaml(Path::new(tasks_file)).await {
            error!(file = %tasks_file, error = %e, "Task seed overlay failed");
        }
    }

    // 7. Intent classification and the debate pipeline.
    let classifier = IntentClassifier::new(
        provider.clone(),
        events.clone(),
        config.autonomy.action_intent_threshold,
        config.transport.default_timezone.clone(),
    );
    let autonomy = AutonomyService::new(
        store_dyn.clone(),
        events.clone(),
        config.autonomy.quiet_hours_start,
        config.autonomy.quiet_hours_end,
    );
    let sandbox = Arc::new(SandboxExecutor::new(&config.sandbox));
    let debate = DebateDispatcher::new(
        provider.clone(),
        registry.clone(),
        sandbox,
        Arc::clone(&autonomy),
        events.clone(),
        store_dyn.clone(),
        config.autonomy.autonomous_max_steps,
        config.autonomy.step_deadline_secs,
        config.sandbox.workspace_dir.clone(),
    );

    // 8. Channels toward the transport collaborator. The sender half is what
    // a transport process attaches to; the binary alone keeps it idle.
    let (_inbound_tx, inbound_rx) = inbound_channel(256);

    let dispatcher = Arc::new(Dispatcher {
        store: store_dyn.clone(),
        events: events.clone(),
        supervisor: Arc::clone(&supervisor),
        scheduler: Arc::clone(&scheduler),
        classifier,
        debate,
        autonomy,
        memory,
        provider,
        outbound: outbound_tx,
        rate_limiter: RateLimiter::per_minute(config.transport.rate_limit_per_minute),
        admin_user_ids: config.transport.admin_user_ids.clone(),
        action_intent_threshold: config.autonomy.action_intent_threshold,
        memory_strict_mode: config.memory.strict_mode,
        default_timezone: config.transport.default_timezone.clone(),
    });

    // 9. Workers and the shutdown cascade.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = Arc::clone(&scheduler).spawn(shutdown_rx.clone());
    let proactive_handle = dispatcher.autonomy.spawn_proactive_loop(
        dispatcher.provider.clone(),
        dispatcher.outbound.clone(),
        config.transport.default_timezone.clone(),
        shutdown_rx,
    );
    let dispatcher_handle = tokio::spawn(Arc::clone(&dispatcher).run(inbound_rx));

    // Outbound messages go to the transport; until one is attached they are
    // mirrored into the per-user context ring and logged.
    let outbound_store = store_dyn.clone();
    let outbound_handle = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            info!(user_id = %message.user_id, "Outbound: {}", message.text);
            let entry = serde_json::json!({
                "role": "assistant",
                "message": message.text,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            let _ = outbound_store
                .kv_lpush_trim(&keys::user_context(&message.user_id), &entry.to_string(), 50)
                .await;
        }
    });

    info!("Autonomy core running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Cascade: stop firing, stop servers, drain event streams.
    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    let _ = proactive_handle.await;
    supervisor.stop_all().await;
    events::shutdown(events, events_handle).await;
    dispatcher_handle.abort();
    outbound_handle.abort();

    Ok(())
}
