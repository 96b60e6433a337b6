//! The debate pipeline gating autonomous actions: a Planner proposes steps,
//! a Skeptic critiques the proposal, a Verifier checks the surviving plan
//! against hard safety rules, and only then does anything execute. Every
//! action request produces exactly one DebateTrace in the decision stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::autonomy::AutonomyService;
use crate::events::EventLog;
use crate::intent::extract_json_object;
use crate::mcp::{validate_args, ToolRegistry};
use crate::providers::{ChatMessage, ModelProvider};
use crate::sandbox::SandboxExecutor;
use crate::store::{keys, Store};
use crate::types::{DebateTrace, PlanStep, ReinforcementEvent, ToolSchema, VerifierResult};

const LLM_DEADLINE: Duration = Duration::from_secs(45);
const TRANSLATE_DEADLINE: Duration = Duration::from_secs(10);

/// Command substrings that are never allowed to execute, regardless of what
/// the planner or skeptic concluded.
const DENYLIST: &[&str] = &["rm -rf", "mkfs", ":(){", "> /dev/"];

#[derive(Debug)]
pub struct DebateOutcome {
    pub reply: String,
    pub trace: DebateTrace,
}

#[derive(Debug, PartialEq)]
enum Verdict {
    Approve,
    Revise(String),
    Reject(String),
}

struct SkepticVerdict {
    approved: bool,
    notes: String,
}

pub struct DebateDispatcher {
    provider: Arc<dyn ModelProvider>,
    registry: ToolRegistry,
    sandbox: Arc<SandboxExecutor>,
    autonomy: Arc<AutonomyService>,
    events: EventLog,
    store: Arc<dyn Store>,
    max_steps: usize,
    step_deadline: Duration,
    workspace_dir: String,
}

impl DebateDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: ToolRegistry,
        sandbox: Arc<SandboxExecutor>,
        autonomy: Arc<AutonomyService>,
        events: EventLog,
        store: Arc<dyn Store>,
        max_steps: usize,
        step_deadline_secs: u64,
        workspace_dir: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            registry,
            sandbox,
            autonomy,
            events,
            store,
            max_steps: max_steps.max(1),
            step_deadline: Duration::from_secs(step_deadline_secs),
            workspace_dir,
        })
    }

    /// Run the full pipeline for one action request. Failures inside the
    /// pipeline become reject traces and apologies, never panics or Errs.
    pub async fn handle(&self, user_id: &str, goal_text: &str, language: &str) -> DebateOutcome {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        let tools = self.registry.available_tools().await;

        // 1. Plan.
        let (plan_summary, mut steps) = match self.plan(goal_text, &tools).await {
            Ok(plan) => plan,
            Err(reason) => {
                return self
                    .rejected(
                        user_id,
                        &request_id,
                        language,
                        String::new(),
                        Vec::new(),
                        String::new(),
                        format!("planner_failure:{}", reason),
                        started,
                    )
                    .await;
            }
        };

        // 2. Skeptic.
        let skeptic = self.skeptic(goal_text, &plan_summary, &steps).await;
        self.events.log(
            "internal_debate",
            "debate",
            user_id,
            format!("Planner/Skeptic decision for user {}", user_id),
            json!({
                "request_id": request_id,
                "plan_summary": plan_summary,
                "steps": steps.len(),
                "skeptic_approved": skeptic.approved,
                "skeptic_notes": skeptic.notes,
            }),
        );
        if !skeptic.approved {
            return self
                .rejected(
                    user_id,
                    &request_id,
                    language,
                    plan_summary,
                    steps,
                    skeptic.notes.clone(),
                    "skeptic_rejected".to_string(),
                    started,
                )
                .await;
        }

        // 3. Verify, with a single revise loop. Two consecutive
        // non-approvals reject the request.
        let mut verdict = self.verify_plan(&steps, &tools);
        self.log_verifier(user_id, &request_id, &verdict);
        if let Verdict::Revise(ref reasons) = verdict {
            match self.revise_plan(goal_text, &steps, reasons, &tools).await {
                Ok(revised) => {
                    steps = revised;
                    verdict = self.verify_plan(&steps, &tools);
                    self.log_verifier(user_id, &request_id, &verdict);
                }
                Err(reason) => {
                    verdict = Verdict::Reject(format!("revision_failed:{}", reason));
                    self.log_verifier(user_id, &request_id, &verdict);
                }
            }
        }
        let reject_reason = match verdict {
            Verdict::Approve => None,
            Verdict::Revise(reason) => Some(format!("revise_not_resolved:{}", reason)),
            Verdict::Reject(reason) => Some(reason),
        };
        if let Some(reason) = reject_reason {
            return self
                .rejected(
                    user_id,
                    &request_id,
                    language,
                    plan_summary,
                    steps,
                    skeptic.notes,
                    reason,
                    started,
                )
                .await;
        }

        // 4. Execute.
        let mut reply_parts: Vec<String> = Vec::new();
        let mut final_actions: Vec<String> = Vec::new();
        let mut logs: Vec<String> = Vec::new();
        let mut failed = false;

        for step in steps.iter().take(self.max_steps) {
            match step {
                PlanStep::Reply { text } => {
                    reply_parts.push(text.clone());
                    final_actions.push("reply".to_string());
                }
                PlanStep::Done { result } => {
                    if reply_parts.is_empty() && !result.trim().is_empty() {
                        reply_parts.push(result.clone());
                    }
                    final_actions.push("done".to_string());
                    break;
                }
                PlanStep::ToolCall { server, tool, args } => {
                    let action = format!("{}.{}", server, tool);
                    self.events.log(
                        "autonomous_step",
                        "debate",
                        user_id,
                        format!("Executing {}", action),
                        json!({ "request_id": request_id, "action": action, "args": args }),
                    );
                    match self.execute_tool_step(server, tool, args).await {
                        Ok(output) => {
                            logs.push(format!("{}: {}", action, output));
                            final_actions.push(action);
                        }
                        Err(reason) => {
                            warn!(user_id, action = %action, %reason, "Autonomous step failed");
                            reply_parts.push(reason);
                            final_actions.push(format!("failed:{}", action));
                            failed = true;
                            break;
                        }
                    }
                }
            }
        }

        let reply = if reply_parts.is_empty() {
            logs.last()
                .cloned()
                .unwrap_or_else(|| "Completed.".to_string())
        } else {
            reply_parts.join("\n")
        };
        let reply = self.render_in_language(&reply, language).await;

        let trace = DebateTrace {
            request_id: request_id.clone(),
            plan_summary,
            plan_steps: steps,
            skeptic_notes: skeptic.notes,
            verifier_result: VerifierResult::Approve,
            final_actions,
            elapsed_ms: started.elapsed().as_millis() as u64,
            logs,
        };
        self.emit_trace(user_id, &trace);

        // 5. Reinforce.
        self.reinforce(user_id, !failed, &reply).await;

        info!(user_id, request_id = %trace.request_id, failed, "Debate completed");
        DebateOutcome { reply, trace }
    }

    // ==================== Pipeline stages ====================

    /// Planner: stream a strict-JSON plan over the advertised tools.
    async fn plan(
        &self,
        goal_text: &str,
        tools: &[ToolSchema],
    ) -> Result<(String, Vec<PlanStep>), String> {
        let tool_lines: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}.{}: {}", t.server_name, t.tool_name, t.description))
            .collect();
        let prompt = format!(
            "Plan the execution of this request as strict JSON only:\n\
             {{\n\
               \"summary\": \"one line\",\n\
               \"steps\": [\n\
                 {{\"action\": \"tool_call\", \"server\": \"...\", \"tool\": \"...\", \"args\": {{}}}},\n\
                 {{\"action\": \"reply\", \"text\": \"...\"}},\n\
                 {{\"action\": \"done\", \"result\": \"short summary\"}}\n\
               ]\n\
             }}\n\
             Rules:\n\
             - At most {} steps, ending with a done step.\n\
             - Only these tools exist (plus sandbox.execute for shell commands):\n{}\n\
             - sandbox.execute args: {{\"command\": \"single shell command\"}}.\n\
             - Commands run inside {} and must stay there.\n\
             Request: {}",
            self.max_steps,
            if tool_lines.is_empty() { "(none)".to_string() } else { tool_lines.join("\n") },
            self.workspace_dir,
            goal_text
        );

        let sink = |_: &str| {};
        let completion = self
            .provider
            .complete_streaming(
                &[
                    ChatMessage::system("You are Planner. Safe tool planning, strict JSON only."),
                    ChatMessage::user(prompt),
                ],
                0.0,
                2048,
                LLM_DEADLINE,
                &sink,
            )
            .await
            .map_err(|e| e.to_string())?;

        let payload = extract_json_object(&completion.text)
            .ok_or_else(|| "planner returned no JSON object".to_string())?;
        parse_plan(&payload, self.max_steps)
    }

    async fn revise_plan(
        &self,
        goal_text: &str,
        steps: &[PlanStep],
        reasons: &str,
        _tools: &[ToolSchema],
    ) -> Result<Vec<PlanStep>, String> {
        let prompt = format!(
            "Your previous plan was rejected: {}\n\
             Previous steps: {}\n\
             Return a corrected plan as strict JSON with the same schema.\n\
             Request: {}",
            reasons,
            serde_json::to_string(steps).unwrap_or_default(),
            goal_text
        );
        let completion = self
            .provider
            .complete(
                &[
                    ChatMessage::system("You are Planner. Safe tool planning, strict JSON only."),
                    ChatMessage::user(prompt),
                ],
                0.0,
                2048,
                LLM_DEADLINE,
            )
            .await
            .map_err(|e| e.to_string())?;
        let payload = extract_json_object(&completion.text)
            .ok_or_else(|| "revision returned no JSON object".to_string())?;
        parse_plan(&payload, self.max_steps).map(|(_, steps)| steps)
    }

    /// Skeptic: LLM critique with a conservative non-LLM fallback.
    async fn skeptic(&self, goal_text: &str, summary: &str, steps: &[PlanStep]) -> SkepticVerdict {
        let prompt = format!(
            "Evaluate this plan for safety and hallucination risk.\n\
             Return strict JSON: {{\"approved\": bool, \"risk\": \"low|medium|high\", \"notes\": \"...\"}}\n\
             Rules: destructive filesystem operations outside the sandbox workspace are not\n\
             acceptable; network access requires the internet capability; keep cost bounded.\n\
             Request: {}\nPlan summary: {}\nSteps: {}",
            goal_text,
            summary,
            serde_json::to_string(steps).unwrap_or_default()
        );

        let response = self
            .provider
            .complete(
                &[
                    ChatMessage::system("You are Skeptic. Execution gating, strict JSON only."),
                    ChatMessage::user(prompt),
                ],
                0.0,
                512,
                LLM_DEADLINE,
            )
            .await;

        if let Ok(completion) = response {
            if let Some(payload) = extract_json_object(&completion.text) {
                let risk = payload["risk"].as_str().unwrap_or("medium").to_lowercase();
                let approved =
                    payload["approved"].as_bool().unwrap_or(false) && risk != "high";
                return SkepticVerdict {
                    approved,
                    notes: payload["notes"].as_str().unwrap_or("").to_string(),
                };
            }
        }

        // Fallback: only obviously vague requests are blocked.
        let too_vague = goal_text.trim().chars().count() < 6;
        SkepticVerdict {
            approved: !too_vague,
            notes: if too_vague {
                "Request is too vague for safe execution.".to_string()
            } else {
                "Approved with bounded sandbox execution.".to_string()
            },
        }
    }

    /// Verifier: non-LLM invariants over the plan. Deny-listed commands are
    /// rejected outright; fixable shape problems ask for one revision.
    fn verify_plan(&self, steps: &[PlanStep], tools: &[ToolSchema]) -> Verdict {
        if steps.is_empty() {
            return Verdict::Revise("plan has no steps".to_string());
        }
        if steps.len() > self.max_steps {
            return Verdict::Revise(format!("plan exceeds the {}-step budget", self.max_steps));
        }

        for step in steps {
            let PlanStep::ToolCall { server, tool, args } = step else { continue };

            if server == "sandbox" {
                if tool != "execute" {
                    return Verdict::Revise(format!("unknown sandbox tool '{}'", tool));
                }
                let Some(command) = args.get("command").and_then(Value::as_str) else {
                    return Verdict::Revise("sandbox.execute needs a string 'command'".to_string());
                };
                if let Some(reason) = check_command(command, &self.workspace_dir) {
                    return Verdict::Reject(reason);
                }
                continue;
            }

            let Some(schema) = tools
                .iter()
                .find(|t| t.server_name == *server && t.tool_name == *tool)
            else {
                return Verdict::Revise(format!("tool {}.{} is not advertised by any running server", server, tool));
            };
            if let Err(reason) = validate_args(&schema.input_schema, args) {
                return Verdict::Revise(format!("{}.{}: {}", server, tool, reason));
            }
        }

        Verdict::Approve
    }

    // ==================== Execution ====================

    async fn execute_tool_step(
        &self,
        server: &str,
        tool: &str,
        args: &Value,
    ) -> Result<String, String> {
        if server == "sandbox" {
            let command = args
                .get("command")
                .and_then(Value::as_str)
                .ok_or_else(|| "sandbox.execute needs a command".to_string())?;
            let outcome = self.sandbox.execute(command).await.map_err(|e| e.user_message.clone())?;

            let record = json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "command": command,
                "exit_code": outcome.exit_code,
                "timed_out": outcome.timed_out,
                "duration_ms": outcome.duration_ms,
            });
            if let Err(e) = self
                .store
                .kv_lpush_trim(keys::SANDBOX_EXECUTIONS, &record.to_string(), 100)
                .await
            {
                warn!(error = %e, "Failed to record sandbox execution");
            }

            if outcome.timed_out {
                return Err(format!("The command hit its {}s limit and was stopped.", self.step_deadline.as_secs()));
            }
            let mut rendered = outcome.stdout.trim_end().to_string();
            if !outcome.stderr.trim().is_empty() {
                rendered.push_str(&format!("\n[stderr] {}", outcome.stderr.trim_end()));
            }
            if rendered.trim().is_empty() {
                rendered = format!("(exit code {})", outcome.exit_code);
            }
            return Ok(rendered);
        }

        // Routed tool call; transient failures get one retry with a fresh
        // deadline.
        match self.registry.call(server, tool, args, self.step_deadline).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_transient() => self
                .registry
                .call(server, tool, args, self.step_deadline)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    // ==================== Bookkeeping ====================

    fn log_verifier(&self, user_id: &str, request_id: &str, verdict: &Verdict) {
        let (result, reason) = match verdict {
            Verdict::Approve => ("approve", String::new()),
            Verdict::Revise(reason) => ("revise", reason.clone()),
            Verdict::Reject(reason) => ("reject", reason.clone()),
        };
        self.events.log(
            "verifier_result",
            "debate",
            user_id,
            format!("Verifier: {}", result),
            json!({ "request_id": request_id, "result": result, "reason": reason }),
        );
    }

    fn emit_trace(&self, user_id: &str, trace: &DebateTrace) {
        self.events.log(
            "debate_trace",
            "debate",
            user_id,
            format!(
                "Debate {}: {}",
                trace.request_id,
                trace.verifier_result.as_str()
            ),
            serde_json::to_value(trace).unwrap_or(Value::Null),
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn rejected(
        &self,
        user_id: &str,
        request_id: &str,
        language: &str,
        plan_summary: String,
        steps: Vec<PlanStep>,
        skeptic_notes: String,
        reason: String,
        started: Instant,
    ) -> DebateOutcome {
        self.events.log(
            "verifier_result",
            "debate",
            user_id,
            "Verifier: reject",
            json!({ "request_id": request_id, "result": "reject", "reason": reason }),
        );

        let trace = DebateTrace {
            request_id: request_id.to_string(),
            plan_summary,
            plan_steps: steps,
            skeptic_notes,
            verifier_result: VerifierResult::Reject,
            final_actions: Vec::new(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            logs: Vec::new(),
        };
        self.emit_trace(user_id, &trace);
        self.reinforce(user_id, false, "").await;

        let reply = self
            .render_in_language(
                "I'm sorry, I can't run that safely, so I stopped before doing anything.",
                language,
            )
            .await;
        DebateOutcome { reply, trace }
    }

    async fn reinforce(&self, user_id: &str, success: bool, reply: &str) {
        let concise = reply.chars().count() < 600;
        let score = if success {
            (0.6_f64 + if concise { 0.2 } else { 0.0 }).min(1.0)
        } else {
            -0.4
        };
        let event = ReinforcementEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            user_id: user_id.to_string(),
            score,
            task_succeeded: success,
            concise,
            helpful: success,
            emotionally_aligned: false,
            reasoning: if success {
                "autonomous request completed".to_string()
            } else {
                "autonomous request rejected or failed".to_string()
            },
        };
        self.events.reinforcement(event.clone());
        if let Err(e) = self.autonomy.apply_reinforcement(&event).await {
            warn!(user_id, error = %e, "Failed to fold reinforcement into profile");
        }
    }

    /// Best-effort translation of the final reply into the user's language.
    async fn render_in_language(&self, text: &str, language: &str) -> String {
        if language == "en" || language.is_empty() || text.trim().is_empty() {
            return text.to_string();
        }
        let result = self
            .provider
            .complete(
                &[
                    ChatMessage::system("Translate the message. Return only the translation."),
                    ChatMessage::user(format!("Target language: {}\n{}", language, text)),
                ],
                0.0,
                512,
                TRANSLATE_DEADLINE,
            )
            .await;
        match result {
            Ok(completion) if !completion.text.trim().is_empty() => completion.text,
            _ => text.to_string(),
        }
    }
}

fn parse_plan(payload: &Value, max_steps: usize) -> Result<(String, Vec<PlanStep>), String> {
    let summary = payload["summary"].as_str().unwrap_or("").to_string();
    let raw_steps = payload["steps"]
        .as_array()
        .ok_or_else(|| "plan is missing its steps array".to_string())?;

    let mut steps = Vec::new();
    for raw in raw_steps.iter().take(max_steps) {
        let step: PlanStep = serde_json::from_value(raw.clone())
            .map_err(|e| format!("malformed plan step: {}", e))?;
        steps.push(step);
    }
    Ok((summary, steps))
}

/// Deny-list pass over one shell command. Returns the rejection reason for
/// anything that must never execute, even post-approval.
fn check_command(command: &str, workspace_dir: &str) -> Option<String> {
    let lower = command.to_lowercase();
    for pattern in DENYLIST {
        if lower.contains(pattern) {
            return Some(format!("denylist:{}", pattern));
        }
    }
    if command_words(command).any(|w| w == "eval" || w == "exec" || w == "sudo") {
        return Some("denylist:eval".to_string());
    }
    if has_unquoted_metachars(command) {
        return Some("denylist:shell metacharacters".to_string());
    }
    for token in shell_words::split(command).unwrap_or_default() {
        if token.starts_with('/') && !token.starts_with(workspace_dir) {
            return Some(format!("path_outside_workspace:{}", token));
        }
    }
    None
}

fn command_words(command: &str) -> impl Iterator<Item = &str> {
    command.split(|c: char| c.is_whitespace()).filter(|w| !w.is_empty())
}

/// Shell metacharacters outside single/double quotes.
fn has_unquoted_metachars(command: &str) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    let mut previous = '\0';
    for c in command.chars() {
        match c {
            '\'' if !in_double && previous != '\\' => in_single = !in_single,
            '"' if !in_single && previous != '\\' => in_double = !in_double,
            ';' | '&' | '|' | '`' | '>' | '<' if !in_single && !in_double => return true,
            '$' if !in_single && !in_double => return true,
            _ => {}
        }
        previous = c;
    }
    false
}
