//! Agent Runtime (§4.9).
//!
//! Generalizes the original gateway's `main.py::tool_loop` — a flat
//! tool-call retry loop — into a bounded plan/act/observe loop with typed,
//! replayable events. Each run alternates a tool-free "plan" call and a
//! tools-enabled "action" call against the same backend; when the action
//! carries tool calls they're executed through [`crate::tools::ToolBus`] and
//! fed back as `tool` messages, otherwise the action's content is the run's
//! final output. Heavy-tier runs (`tier >= 1`) are admission-shed against a
//! single process-wide [`Semaphore`] before the first upstream call, so a
//! burst of expensive agent runs can't starve the rest of the gateway.

use std::{collections::HashMap, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::{
    aliases::AliasRegistry,
    backends::BackendClient,
    config::{AgentConfig, Config, ToolLogMode},
    error::AppError,
    router::AppState,
    tools::ToolDeclaration,
};

/// `{name, model, tier, max_turns, tools_allowlist[]}` (§3 `AgentSpec`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSpec {
    pub name: String,
    /// An alias name, a `<backend>:<model>` pin, or a literal model routed to
    /// `router.default_backend` — resolved the same way the router resolves
    /// rules 2/3/4, just without the content-based heuristics (an agent spec
    /// names its model explicitly; it doesn't get classified per-turn).
    pub model: String,
    pub tier: u8,
    pub max_turns: u32,
    #[serde(default)]
    pub tools_allowlist: Vec<String>,
}

fn default_spec() -> AgentSpec {
    AgentSpec {
        name: "default".to_string(),
        model: "default".to_string(),
        tier: 0,
        max_turns: 4,
        tools_allowlist: Vec::new(),
    }
}

/// One typed step in a run's event log (§3 `AgentRun.events`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    RunStarted { ts: DateTime<Utc>, agent: String, input: String },
    Plan { ts: DateTime<Utc>, turn: u32, content: String },
    Action { ts: DateTime<Utc>, turn: u32, has_tool_calls: bool },
    Tool { ts: DateTime<Utc>, turn: u32, name: String, replay_id: String, ok: bool },
    Observation { ts: DateTime<Utc>, turn: u32, ok: bool, error: Option<String> },
    RunCompleted { ts: DateTime<Utc>, ok: bool, reason: Option<String> },
}

/// Full record of one run, persisted for replay (§4.9 "per-run files are the
/// source of truth").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunRecord {
    pub run_id: String,
    pub agent: String,
    pub input: String,
    pub events: Vec<AgentEvent>,
    pub ok: bool,
    pub output_text: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

pub struct AgentRuntime {
    config: AgentConfig,
    specs: HashMap<String, AgentSpec>,
    heavy_tier: Arc<Semaphore>,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig) -> Self {
        let mut specs = load_specs(&config).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load agent specs — continuing with the implicit default only");
            HashMap::new()
        });
        specs.entry("default".to_string()).or_insert_with(default_spec);
        let heavy_tier = Arc::new(Semaphore::new(config.heavy_tier_limit.max(1)));
        Self { config, specs, heavy_tier }
    }

    pub fn spec(&self, name: &str) -> Option<&AgentSpec> {
        self.specs.get(name)
    }

    /// Run `spec_name` against `input` to completion (or `max_turns`
    /// exhaustion), persisting the event log as it's built.
    pub async fn run(&self, state: &AppState, spec_name: &str, input: &str) -> Result<AgentRunRecord, AppError> {
        let spec = self.spec(spec_name).ok_or_else(|| AppError::NotFound(format!("unknown agent spec: {spec_name}")))?.clone();

        let _heavy_permit = if self.config.shed_heavy && spec.tier >= 1 {
            Some(
                self.heavy_tier
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| AppError::ShedHeavy)?,
            )
        } else {
            None
        };

        let config = state.config();
        let (backend_id, upstream_model) = resolve_model(&spec.model, &config, &state.aliases)
            .ok_or_else(|| AppError::BadRequest(format!("agent `{spec_name}` names an unresolvable model: {}", spec.model)))?;

        if !state.health.is_ready(&backend_id) {
            let health_error = state.health.status_for(&backend_id).and_then(|s| s.error);
            return Err(AppError::Unavailable { backend: backend_id.clone(), health_error });
        }
        let backend_cfg = config
            .backends
            .get(&backend_id)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("agent route decided to unknown backend `{backend_id}`")))?;
        let client = BackendClient::new(backend_cfg).map_err(AppError::Internal)?;

        let effective_tools: Vec<String> =
            spec.tools_allowlist.iter().filter(|t| state.tools.is_allowed(t)).cloned().collect();
        let declarations: Vec<ToolDeclaration> = state.tools.list_declarations(&effective_tools);

        let run_id = format!("run-{}", uuid::Uuid::new_v4().simple());
        let started_at = Utc::now();
        let mut events = vec![AgentEvent::RunStarted { ts: started_at, agent: spec_name.to_string(), input: input.to_string() }];
        let mut messages = vec![
            json!({"role": "system", "content": "You are a tool-using agent. Use tools when they help answer the user's request, otherwise answer directly."}),
            json!({"role": "user", "content": input}),
        ];

        let mut turn = 0u32;
        let (ok, output_text, reason) = loop {
            if turn >= spec.max_turns {
                break (false, None, Some("max_turns".to_string()));
            }

            let plan_body = json!({"model": upstream_model, "messages": messages, "stream": false});
            let plan = client.chat_completions(plan_body).await.map_err(classify_upstream_error)?;
            let plan_content = plan.pointer("/choices/0/message/content").and_then(Value::as_str).unwrap_or("").to_string();
            events.push(AgentEvent::Plan { ts: Utc::now(), turn, content: plan_content });

            let mut action_body = json!({"model": upstream_model, "messages": messages, "stream": false});
            if !declarations.is_empty() {
                action_body["tools"] = json!(declarations
                    .iter()
                    .map(|d| json!({"type": "function", "function": {"name": d.name, "description": d.description, "parameters": d.parameters}}))
                    .collect::<Vec<_>>());
            }
            let action = client.chat_completions(action_body).await.map_err(classify_upstream_error)?;
            let action_message = action.pointer("/choices/0/message").cloned().unwrap_or(json!({}));
            let tool_calls = action_message.get("tool_calls").and_then(Value::as_array).cloned().unwrap_or_default();
            events.push(AgentEvent::Action { ts: Utc::now(), turn, has_tool_calls: !tool_calls.is_empty() });

            if tool_calls.is_empty() {
                let content = action_message.get("content").and_then(Value::as_str).unwrap_or("").to_string();
                break (true, Some(content), None);
            }

            messages.push(action_message);
            for call in &tool_calls {
                let Some(name) = call.pointer("/function/name").and_then(Value::as_str) else { continue };
                let call_id = call.get("id").and_then(Value::as_str).unwrap_or("").to_string();

                if !effective_tools.iter().any(|t| t == name) {
                    events.push(AgentEvent::Observation { ts: Utc::now(), turn, ok: false, error: Some("tool_denied".to_string()) });
                    break;
                }

                let args: Value = call
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or(json!({}));
                let invocation = state.tools.invoke(name, args).await;
                events.push(AgentEvent::Tool {
                    ts: Utc::now(),
                    turn,
                    name: name.to_string(),
                    replay_id: invocation.replay_id.clone(),
                    ok: invocation.ok,
                });
                let tool_content = invocation.result.clone().unwrap_or_else(|| json!({"error": invocation.error_message}));
                messages.push(json!({"role": "tool", "tool_call_id": call_id, "name": name, "content": tool_content.to_string()}));
                events.push(AgentEvent::Observation { ts: Utc::now(), turn, ok: invocation.ok, error: invocation.error_message.clone() });
            }

            turn += 1;
        };

        let ended_at = Utc::now();
        events.push(AgentEvent::RunCompleted { ts: ended_at, ok, reason: reason.clone() });

        let record = AgentRunRecord {
            run_id,
            agent: spec_name.to_string(),
            input: input.to_string(),
            events,
            ok,
            output_text,
            started_at,
            ended_at: Some(ended_at),
        };

        self.persist(&record).await;
        Ok(record)
    }

    /// Persist the run record so `GET /v1/agent/replay/{run_id}` can serve it
    /// later — the per-run file is the source of truth (§4.9); the shared
    /// NDJSON stream (when `runs_log_mode` includes it) is an audit trail
    /// only, mirroring [`crate::tools::ToolBus`]'s own log split.
    async fn persist(&self, record: &AgentRunRecord) {
        let Some(dir) = &self.config.runs_log_dir else { return };
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            tracing::warn!(error = %e, dir, "failed to create agent runs log directory");
            return;
        }

        if matches!(self.config.runs_log_mode, ToolLogMode::PerInvocation | ToolLogMode::Both) {
            let path = Path::new(dir).join(format!("{}.json", record.run_id));
            match serde_json::to_vec_pretty(record) {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::write(&path, bytes).await {
                        tracing::warn!(error = %e, path = %path.display(), "failed to persist agent run record");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize agent run record"),
            }
        }

        if matches!(self.config.runs_log_mode, ToolLogMode::Ndjson | ToolLogMode::Both) {
            use tokio::io::AsyncWriteExt as _;
            let path = Path::new(dir).join("agent_runs.ndjson");
            let line = match serde_json::to_string(record) {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize agent run record for ndjson log");
                    return;
                }
            };
            let result = async {
                let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
                anyhow::Ok(())
            }
            .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, path = %path.display(), "failed to append agent run ndjson log");
            }
        }
    }

    /// Replay a persisted run by its id. Returns `None` when per-run files
    /// aren't enabled or the run predates/postdates the configured directory.
    pub async fn replay(&self, run_id: &str) -> Option<AgentRunRecord> {
        let dir = self.config.runs_log_dir.as_ref()?;
        let path = Path::new(dir).join(format!("{run_id}.json"));
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// Resolve an `AgentSpec.model` the way the router resolves an explicit
/// model field, minus the content-based heuristics (rules 5-8): alias first,
/// then `<backend>:<model>` pin, then a literal model against
/// `router.default_backend`.
fn resolve_model(model: &str, config: &Config, aliases: &AliasRegistry) -> Option<(String, String)> {
    let model = model.trim();
    if let Some(alias) = aliases.get(model) {
        return Some((alias.backend.clone(), alias.upstream_model.clone()));
    }
    if let Some((backend_part, model_part)) = model.split_once(':') {
        if let Some(backend_id) = config.resolve_backend_id(backend_part) {
            if !model_part.is_empty() {
                return Some((backend_id.to_string(), model_part.to_string()));
            }
        }
    }
    if model.is_empty() {
        return None;
    }
    let default_backend = &config.router.default_backend;
    config.backends.get(default_backend).map(|_| (default_backend.clone(), model.to_string()))
}

fn classify_upstream_error(e: anyhow::Error) -> AppError {
    let text = e.to_string();
    if text.contains("timeout") || text.contains("timed out") {
        AppError::UpstreamTimeout(text)
    } else {
        AppError::UpstreamError(text)
    }
}

fn load_specs(config: &AgentConfig) -> anyhow::Result<HashMap<String, AgentSpec>> {
    let Some(path) = &config.specs_path else {
        return Ok(HashMap::new());
    };
    let bytes = std::fs::read(path)?;
    let specs: Vec<AgentSpec> = serde_json::from_slice(&bytes)?;
    Ok(specs.into_iter().map(|s| (s.name.clone(), s)).collect())
}
