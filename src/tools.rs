//! Tool Bus (§4.8).
//!
//! A small, fixed set of safety-built-in tools (`shell`, `read_file`,
//! `write_file`, `http_fetch`, `git`) that an agent or a direct client can
//! invoke through a declared-schema contract. Every invocation is validated
//! against a hand-rolled minimal JSON-Schema subset (object/string/array,
//! `required`, `additionalProperties: false` — ported from
//! `_validate_against_schema` in the original gateway's `tools_bus.py`
//! rather than pulled in from a general-purpose schema crate, since the
//! supported shape is intentionally narrow and the original's behavior is
//! the contract clients were built against), hashed for replay auditing,
//! executed with output truncation, and logged to an append-only NDJSON
//! file that must never cause the request itself to fail.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::RwLock,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::config::ToolsConfig;

/// A tool's declared interface, as returned by `GET /v1/tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub description: String,
    pub parameters: Value,
}

fn default_version() -> String {
    "1".to_string()
}

/// Full record of one tool call, written to the audit log and returned from
/// `POST /v1/tools*`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub replay_id: String,
    pub request_hash: String,
    pub tool: String,
    pub version: String,
    pub args: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: f64,
    /// Process CPU time consumed by the invocation, when the runner measures
    /// it. Only the `shell` and `git` runners spawn a child process; neither
    /// currently samples `rusage`, so this is always `None` for now.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_ms: Option<f64>,
    /// Bytes read or written, when the runner tracks it (`read_file`,
    /// `write_file`, `http_fetch`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_bytes: Option<u64>,
    pub ts: chrono::DateTime<Utc>,
}

/// Names that are always declared, regardless of config — their schemas are
/// fixed; whether they're *callable* is gated separately by
/// [`ToolBus::is_allowed`].
pub const BUILTIN_TOOL_NAMES: [&str; 5] = ["shell", "read_file", "write_file", "http_fetch", "git"];

/// Bound on the in-memory replay index (`GET /v1/tools/replay/{replay_id}`) —
/// a ring buffer, same pattern as [`crate::traffic::TrafficLog`]. Older
/// invocations remain in the NDJSON audit log; they just fall out of the
/// fast-lookup window.
const REPLAY_CAPACITY: usize = 1000;

/// In-memory index over recent [`ToolInvocation`]s, keyed by `replay_id`.
/// The NDJSON log (`self.log`) is append-only and write-only from the
/// gateway's perspective; this index is what backs single-invocation lookup.
#[derive(Default)]
struct ReplayIndex {
    order: VecDeque<String>,
    by_id: HashMap<String, ToolInvocation>,
}

impl ReplayIndex {
    fn insert(&mut self, invocation: ToolInvocation) {
        if self.order.len() >= REPLAY_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.by_id.remove(&oldest);
            }
        }
        self.order.push_back(invocation.replay_id.clone());
        self.by_id.insert(invocation.replay_id.clone(), invocation);
    }
}

pub struct ToolBus {
    config: ToolsConfig,
    http: reqwest::Client,
    /// Externally declared tools loaded from `tools.registry_path`, keyed by
    /// name. These extend the set of tools clients can *discover*
    /// (`GET /v1/tools`); none of them have a builtin runner, so invoking one
    /// always fails with `not_executable` (§4.8 open question: the registry
    /// is a discovery/documentation surface, not a plugin-loading mechanism).
    registry: HashMap<String, ToolDeclaration>,
    replay_index: RwLock<ReplayIndex>,
}

impl ToolBus {
    pub fn new(config: ToolsConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_sec))
            .build()
            .expect("failed to build tool bus HTTP client");
        let registry = load_registry(&config).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load tool registry — continuing with builtins only");
            HashMap::new()
        });
        Self { config, http, registry, replay_index: RwLock::new(ReplayIndex::default()) }
    }

    /// Look up a past invocation by its `replay_id`. Only covers the most
    /// recent [`REPLAY_CAPACITY`] invocations since the process started;
    /// older ones survive only in the NDJSON audit log on disk.
    pub fn replay(&self, replay_id: &str) -> Option<ToolInvocation> {
        self.replay_index.read().ok()?.by_id.get(replay_id).cloned()
    }

    /// The effective allowlist: explicit `tools.allowlist` wins if non-empty,
    /// else it's derived from the per-tool `allow_*` feature toggles, plus
    /// every tool declared in the external registry.
    pub fn allowed_tool_names(&self) -> Vec<String> {
        let mut allowed = if !self.config.allowlist.is_empty() {
            self.config.allowlist.clone()
        } else {
            let mut allowed = Vec::new();
            if self.config.allow_shell {
                allowed.push("shell".to_string());
            }
            if self.config.allow_fs {
                allowed.push("read_file".to_string());
                if self.config.allow_fs_write {
                    allowed.push("write_file".to_string());
                }
            }
            if self.config.allow_http_fetch {
                allowed.push("http_fetch".to_string());
            }
            if self.config.allow_git {
                allowed.push("git".to_string());
            }
            allowed
        };
        for name in self.registry.keys() {
            if !allowed.contains(name) {
                allowed.push(name.clone());
            }
        }
        allowed
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed_tool_names().iter().any(|n| n == name)
    }

    /// Declared schemas for every allowed tool (`GET /v1/tools`), optionally
    /// intersected with a per-client `tools_allowlist`.
    pub fn list_declarations(&self, client_allowlist: &[String]) -> Vec<ToolDeclaration> {
        self.allowed_tool_names()
            .into_iter()
            .filter(|name| client_allowlist.is_empty() || client_allowlist.contains(name))
            .filter_map(|name| builtin_schema(&name).or_else(|| self.registry.get(&name).cloned()))
            .collect()
    }

    /// Validate, execute, hash, log, and return a full [`ToolInvocation`]
    /// record for one call. Never panics on tool failure — failures are
    /// captured in the record's `ok`/`error_*` fields so the caller (direct
    /// HTTP client or the agent runtime) always gets a well-formed response.
    pub async fn invoke(&self, name: &str, args: Value) -> ToolInvocation {
        let version = self.resolve_version(name);
        let request_hash = hash_request(name, &version, &args);
        let replay_id = format!("tool-{}", uuid::Uuid::new_v4().simple());
        let started = Instant::now();
        let ts = Utc::now();

        if !BUILTIN_TOOL_NAMES.contains(&name) {
            let outcome = if self.registry.contains_key(name) {
                Err(("not_executable".into(), format!("tool '{name}' is declared for discovery only and has no runner")))
            } else {
                Err(("unknown_tool".into(), format!("unknown tool: {name}")))
            };
            return self.finish(replay_id, request_hash, name, &version, args, started, ts, outcome).await;
        }
        if !self.is_allowed(name) {
            return self
                .finish(replay_id, request_hash, name, &version, args, started, ts, Err(("tool_not_allowed".into(), format!("tool not allowed: {name}"))))
                .await;
        }

        if let Some(schema) = builtin_schema(name) {
            let errors = validate_against_schema(&schema.parameters, &args);
            if !errors.is_empty() {
                return self
                    .finish(
                        replay_id,
                        request_hash,
                        name,
                        &version,
                        args,
                        started,
                        ts,
                        Err(("invalid_arguments".into(), errors.join("; "))),
                    )
                    .await;
            }
        }

        let outcome = match name {
            "shell" => self.run_shell(&args).await,
            "read_file" => self.run_read_file(&args).await,
            "write_file" => self.run_write_file(&args).await,
            "http_fetch" => self.run_http_fetch(&args).await,
            "git" => self.run_git(&args).await,
            _ => unreachable!("checked against BUILTIN_TOOL_NAMES above"),
        };

        self.finish(replay_id, request_hash, name, &version, args, started, ts, outcome).await
    }

    /// The declared version for `name` — from the built-in schema table or
    /// the external registry — falling back to [`default_version`] for an
    /// unknown tool so hashing/logging never panics on a bad name.
    fn resolve_version(&self, name: &str) -> String {
        builtin_schema(name)
            .map(|d| d.version)
            .or_else(|| self.registry.get(name).map(|d| d.version.clone()))
            .unwrap_or_else(default_version)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        replay_id: String,
        request_hash: String,
        name: &str,
        version: &str,
        args: Value,
        started: Instant,
        ts: chrono::DateTime<Utc>,
        outcome: Result<Value, (String, String)>,
    ) -> ToolInvocation {
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let invocation = match outcome {
            Ok(result) => {
                let io_bytes = serde_json::to_string(&result).ok().map(|s| s.len() as u64);
                ToolInvocation {
                    replay_id,
                    request_hash,
                    tool: name.to_string(),
                    version: version.to_string(),
                    args,
                    ok: true,
                    result: Some(result),
                    error_type: None,
                    error_message: None,
                    duration_ms,
                    cpu_ms: None,
                    io_bytes,
                    ts,
                }
            }
            Err((error_type, error_message)) => ToolInvocation {
                replay_id,
                request_hash,
                tool: name.to_string(),
                version: version.to_string(),
                args,
                ok: false,
                result: None,
                error_type: Some(error_type),
                error_message: Some(error_message),
                duration_ms,
                cpu_ms: None,
                io_bytes: None,
                ts,
            },
        };
        self.log(&invocation).await;
        if let Ok(mut index) = self.replay_index.write() {
            index.insert(invocation.clone());
        }
        invocation
    }

    /// Append one NDJSON line. Best-effort: a logging failure is traced and
    /// swallowed, never propagated to the caller.
    async fn log(&self, invocation: &ToolInvocation) {
        let path = &self.config.log_path;
        let line = match serde_json::to_string(&loggable(invocation, self.config.output_max_chars)) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize tool invocation for logging");
                return;
            }
        };
        if let Some(parent) = Path::new(path).parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %e, path, "failed to create tool log directory");
                return;
            }
        }
        let result = async {
            let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, path, "failed to append tool invocation log");
        }
    }

    async fn run_shell(&self, args: &Value) -> Result<Value, (String, String)> {
        if !self.config.allow_shell {
            return Err(("tool_disabled".into(), "shell tool disabled".into()));
        }
        let cmd = args.get("cmd").and_then(Value::as_str).filter(|s| !s.trim().is_empty());
        let Some(cmd) = cmd else {
            return Err(("invalid_arguments".into(), "cmd must be a non-empty string".into()));
        };
        if self.config.shell_allowed_cmds.is_empty() {
            return Err(("tool_not_configured".into(), "shell tool not configured (shell_allowed_cmds empty)".into()));
        }
        let parts = shell_words(cmd);
        let Some(exe) = parts.first() else {
            return Err(("invalid_arguments".into(), "cmd must be a non-empty string".into()));
        };
        if !self.config.shell_allowed_cmds.iter().any(|a| a == exe) {
            return Err(("command_not_allowed".into(), format!("command not allowed: {exe}")));
        }
        tokio::fs::create_dir_all(&self.config.shell_cwd).await.ok();
        run_process(&parts[0], &parts[1..], &self.config.shell_cwd, self.config.shell_timeout_sec).await
    }

    async fn run_git(&self, args: &Value) -> Result<Value, (String, String)> {
        if !self.config.allow_git {
            return Err(("tool_disabled".into(), "git tool disabled".into()));
        }
        const ALLOWED_SUBCOMMANDS: [&str; 6] = ["status", "diff", "log", "show", "rev-parse", "ls-files"];
        let argv: Vec<String> = args
            .get("args")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let Some(subcmd) = argv.first() else {
            return Err(("invalid_arguments".into(), "args must be a non-empty list of strings".into()));
        };
        if !ALLOWED_SUBCOMMANDS.contains(&subcmd.as_str()) {
            return Err(("command_not_allowed".into(), format!("git subcommand not allowed: {subcmd}")));
        }
        let cwd = if self.config.git_cwd.trim().is_empty() { &self.config.shell_cwd } else { &self.config.git_cwd };
        tokio::fs::create_dir_all(cwd).await.ok();
        run_process("git", &argv, cwd, self.config.git_timeout_sec).await
    }

    async fn run_read_file(&self, args: &Value) -> Result<Value, (String, String)> {
        if !self.config.allow_fs {
            return Err(("tool_disabled".into(), "fs tool disabled".into()));
        }
        let path = args.get("path").and_then(Value::as_str).filter(|s| !s.is_empty());
        let Some(path) = path else {
            return Err(("invalid_arguments".into(), "path must be a non-empty string".into()));
        };
        if self.config.fs_roots.is_empty() {
            return Err(("tool_not_configured".into(), "fs tool not configured (fs_roots empty)".into()));
        }
        let resolved = match resolve_within_roots(path, &self.config.fs_roots) {
            Some(p) => p,
            None => return Err(("path_denied".into(), "path outside allowed roots".into())),
        };
        let data = match tokio::fs::read(&resolved).await {
            Ok(d) => d,
            Err(e) => return Err(("io_error".into(), format!("{e}"))),
        };
        let max_bytes = self.config.fs_max_bytes;
        let truncated = data.len() > max_bytes;
        let slice = &data[..data.len().min(max_bytes)];
        let content = String::from_utf8_lossy(slice).into_owned();
        Ok(json!({"path": resolved.display().to_string(), "truncated": truncated, "content": content}))
    }

    async fn run_write_file(&self, args: &Value) -> Result<Value, (String, String)> {
        if !self.config.allow_fs {
            return Err(("tool_disabled".into(), "fs tool disabled".into()));
        }
        if !self.config.allow_fs_write {
            return Err(("tool_disabled".into(), "fs write disabled".into()));
        }
        let path = args.get("path").and_then(Value::as_str).filter(|s| !s.is_empty());
        let Some(path) = path else {
            return Err(("invalid_arguments".into(), "path must be a non-empty string".into()));
        };
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");
        if self.config.fs_roots.is_empty() {
            return Err(("tool_not_configured".into(), "fs tool not configured (fs_roots empty)".into()));
        }
        let resolved = match resolve_within_roots(path, &self.config.fs_roots) {
            Some(p) => p,
            None => return Err(("path_denied".into(), "path outside allowed roots".into())),
        };
        if content.len() > self.config.fs_max_bytes {
            return Err(("content_too_large".into(), format!("content too large (>{} bytes)", self.config.fs_max_bytes)));
        }
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => Ok(json!({"path": resolved.display().to_string()})),
            Err(e) => Err(("io_error".into(), format!("{e}"))),
        }
    }

    async fn run_http_fetch(&self, args: &Value) -> Result<Value, (String, String)> {
        if !self.config.allow_http_fetch {
            return Err(("tool_disabled".into(), "http_fetch tool disabled".into()));
        }
        let url = args.get("url").and_then(Value::as_str).filter(|s| !s.trim().is_empty());
        let Some(url_str) = url else {
            return Err(("invalid_arguments".into(), "url must be a non-empty string".into()));
        };
        let method = args.get("method").and_then(Value::as_str).unwrap_or("GET").to_uppercase();
        if method != "GET" {
            return Err(("invalid_arguments".into(), "only GET is supported".into()));
        }
        let parsed = match reqwest::Url::parse(url_str) {
            Ok(u) => u,
            Err(e) => return Err(("invalid_arguments".into(), format!("invalid url: {e}"))),
        };
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(("invalid_arguments".into(), "only http/https URLs are allowed".into()));
        }
        let host = parsed.host_str().unwrap_or("").to_lowercase();
        if host.is_empty() {
            return Err(("invalid_arguments".into(), "url must include a hostname".into()));
        }
        if !self.config.http_allowed_hosts.iter().any(|h| h.to_lowercase() == host) {
            return Err(("host_not_allowed".into(), format!("host not allowed: {host}")));
        }

        let mut request = self.http.get(parsed);
        if let Some(headers) = args.get("headers").and_then(Value::as_object) {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    request = request.header(k, v);
                } else {
                    return Err(("invalid_arguments".into(), "headers must be an object of string:string".into()));
                }
            }
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return Err(("upstream_error".into(), format!("{e}"))),
        };
        let status = response.status().as_u16();
        let content_type = response.headers().get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
        let max_bytes = self.config.http_max_bytes;
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return Err(("upstream_error".into(), format!("{e}"))),
        };
        let truncated = bytes.len() > max_bytes;
        let slice = &bytes[..bytes.len().min(max_bytes)];
        let body_text = std::str::from_utf8(slice).ok().map(str::to_string);
        let body_base64 = if body_text.is_none() {
            Some(base64_encode(slice))
        } else {
            None
        };
        Ok(json!({
            "status": status,
            "content_type": content_type,
            "truncated": truncated,
            "body_text": body_text,
            "body_base64": body_base64,
        }))
    }
}

/// Truncate to at most `loggable`'s own `output_max_chars` bytes (not
/// `ToolsConfig`), snapped to the nearest UTF-8 character boundary — see
/// DESIGN.md for why byte-bounded truncation was chosen over char counting.
fn loggable(invocation: &ToolInvocation, max_bytes: usize) -> Value {
    let mut value = serde_json::to_value(invocation).unwrap_or(Value::Null);
    if let Some(result) = value.get_mut("result") {
        truncate_strings_in_place(result, max_bytes);
    }
    if let Some(args) = value.get_mut("args") {
        truncate_strings_in_place(args, max_bytes);
    }
    value
}

fn truncate_strings_in_place(value: &mut Value, max_bytes: usize) {
    match value {
        Value::String(s) => {
            if let Some(truncated) = truncate_utf8(s, max_bytes) {
                *s = truncated;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| truncate_strings_in_place(v, max_bytes)),
        Value::Object(map) => map.values_mut().for_each(|v| truncate_strings_in_place(v, max_bytes)),
        _ => {}
    }
}

/// Truncate `s` to at most `max_bytes` bytes, snapping backward to the
/// nearest character boundary so the result is always valid UTF-8. Returns
/// `None` if no truncation is needed.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> Option<String> {
    if s.len() <= max_bytes {
        return None;
    }
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    Some(format!("{}…", &s[..cut]))
}

fn hash_request(name: &str, version: &str, args: &Value) -> String {
    // Canonical JSON: serde_json's BTreeMap-backed Value already serializes
    // object keys in sorted order when the `preserve_order` feature is off.
    let canonical = json!({"name": name, "version": version, "args": args});
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&canonical).unwrap_or_default());
    hex::encode(hasher.finalize())
}

fn builtin_schema(name: &str) -> Option<ToolDeclaration> {
    let (description, parameters) = match name {
        "shell" => (
            "Run a command locally (no shell interpolation).",
            json!({
                "type": "object",
                "properties": {"cmd": {"type": "string", "description": "Command string to execute."}},
                "required": ["cmd"],
                "additionalProperties": false,
            }),
        ),
        "read_file" => (
            "Read a local text file.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
                "additionalProperties": false,
            }),
        ),
        "write_file" => (
            "Write a local text file.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}, "content": {"type": "string"}},
                "required": ["path", "content"],
                "additionalProperties": false,
            }),
        ),
        "git" => (
            "Run a limited set of git subcommands in a configured repo directory.",
            json!({
                "type": "object",
                "properties": {"args": {"type": "array", "items": {"type": "string"}}},
                "required": ["args"],
                "additionalProperties": false,
            }),
        ),
        "http_fetch" => (
            "Fetch a URL via GET with a host allowlist and a response size limit.",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "method": {"type": "string"},
                    "headers": {"type": "object"},
                },
                "required": ["url"],
                "additionalProperties": false,
            }),
        ),
        _ => return None,
    };
    Some(ToolDeclaration {
        name: name.to_string(),
        version: default_version(),
        description: description.to_string(),
        parameters,
    })
}

/// Minimal JSON-Schema validator covering exactly the shapes the built-in
/// tools declare: object/properties/required/additionalProperties, and
/// string/array/object typed properties. Not a general-purpose validator —
/// ported behavior-for-behavior from `_validate_against_schema`.
pub fn validate_against_schema(schema: &Value, args: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(args_obj) = args.as_object() else {
        return vec!["arguments must be a JSON object".to_string()];
    };

    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return errors;
    }

    let props = schema.get("properties").and_then(Value::as_object).cloned().unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(key) {
                errors.push(format!("missing required field: {key}"));
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        let allowed: std::collections::HashSet<&str> = props.keys().map(String::as_str).collect();
        let mut extra: Vec<&str> = args_obj.keys().map(String::as_str).filter(|k| !allowed.contains(k)).collect();
        extra.sort();
        for key in extra {
            errors.push(format!("unexpected field: {key}"));
        }
    }

    for (key, sch) in &props {
        let Some(value) = args_obj.get(key) else { continue };
        let Some(ty) = sch.get("type").and_then(Value::as_str) else { continue };
        match ty {
            "string" => {
                if !value.is_string() {
                    errors.push(format!("{key} must be a string"));
                }
            }
            "array" => {
                let Some(items) = value.as_array() else {
                    errors.push(format!("{key} must be an array"));
                    continue;
                };
                if sch.get("items").and_then(|i| i.get("type")).and_then(Value::as_str) == Some("string")
                    && !items.iter().all(Value::is_string)
                {
                    errors.push(format!("{key} items must be strings"));
                }
            }
            "object" => {
                if !value.is_object() {
                    errors.push(format!("{key} must be an object"));
                }
            }
            _ => {}
        }
    }

    errors
}

/// Minimal `shlex`-style whitespace/quote-aware tokenizer. Ported from the
/// original's use of Python's `shlex.split`, good enough for the narrow
/// set of commands the shell tool actually forwards.
fn shell_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes: Option<char> = None;
    let mut has_current = false;

    for ch in input.chars() {
        match in_quotes {
            Some(q) if ch == q => in_quotes = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => {
                in_quotes = Some(ch);
                has_current = true;
            }
            None if ch.is_whitespace() => {
                if has_current {
                    words.push(std::mem::take(&mut current));
                    has_current = false;
                }
            }
            None => {
                current.push(ch);
                has_current = true;
            }
        }
    }
    if has_current {
        words.push(current);
    }
    words
}

async fn run_process(
    program: &str,
    args: &[String],
    cwd: &str,
    timeout_secs: u64,
) -> Result<Value, (String, String)> {
    let mut command = tokio::process::Command::new(program);
    command.args(args).current_dir(cwd).kill_on_drop(true);
    let child = command.output();

    match tokio::time::timeout(Duration::from_secs(timeout_secs), child).await {
        Ok(Ok(output)) => Ok(json!({
            "returncode": output.status.code().unwrap_or(-1),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        })),
        Ok(Err(e)) => Err(("spawn_error".into(), format!("{e}"))),
        Err(_) => Err(("timeout".into(), format!("timeout after {timeout_secs}s"))),
    }
}

/// Lexically resolve `.`/`..` components without touching the filesystem
/// (the path may not exist yet, e.g. `write_file`), so a `starts_with` check
/// against a configured root can't be defeated by an unresolved `..` — the
/// same class of guard `images.rs::get` applies to its content-addressed names.
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn resolve_within_roots(path: &str, roots: &[String]) -> Option<PathBuf> {
    let candidate = Path::new(path);
    let base = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        Path::new(&roots[0]).join(candidate)
    };
    let base = normalize_lexically(&base);
    for root in roots {
        let root_path = normalize_lexically(Path::new(root));
        if base.starts_with(&root_path) {
            return Some(base);
        }
    }
    None
}

fn base64_encode(bytes: &[u8]) -> String {
    const CHARS: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        out.push(CHARS[(b0 >> 2) as usize] as char);
        out.push(CHARS[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 { CHARS[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char } else { '=' });
        out.push(if chunk.len() > 2 { CHARS[(b2 & 0x3f) as usize] as char } else { '=' });
    }
    out
}

/// Load externally declared tools from `tools.registry_path` (§4.8). The
/// file is a JSON array of [`ToolDeclaration`]; when `registry_sha256` is
/// set, the raw file bytes must hash to it or the whole registry is
/// rejected. A missing `registry_path` is not an error — it just means no
/// external tools are declared.
fn load_registry(config: &ToolsConfig) -> anyhow::Result<HashMap<String, ToolDeclaration>> {
    let Some(path) = &config.registry_path else {
        return Ok(HashMap::new());
    };
    let bytes = std::fs::read(path).with_context(|| format!("reading tool registry {path}"))?;

    if let Some(expected) = &config.registry_sha256 {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            anyhow::bail!("tool registry {path} checksum mismatch: expected {expected}, got {actual}");
        }
    }

    let declarations: Vec<ToolDeclaration> =
        serde_json::from_slice(&bytes).with_context(|| format!("parsing tool registry {path}"))?;

    let mut registry = HashMap::new();
    for decl in declarations {
        if BUILTIN_TOOL_NAMES.contains(&decl.name.as_str()) {
            tracing::warn!(tool = %decl.name, "tool registry entry shadows a builtin name — ignoring");
            continue;
        }
        registry.insert(decl.name.clone(), decl);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools_config() -> ToolsConfig {
        ToolsConfig {
            allow_shell: true,
            allow_fs: true,
            allow_fs_write: true,
            allow_http_fetch: true,
            allow_git: true,
            shell_allowed_cmds: vec!["echo".to_string()],
            fs_roots: vec![std::env::temp_dir().to_string_lossy().into_owned()],
            log_path: std::env::temp_dir().join("gateway-tools-test.ndjson").to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn schema_validation_flags_missing_required_field() {
        let schema = json!({"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"], "additionalProperties": false});
        let errors = validate_against_schema(&schema, &json!({}));
        assert_eq!(errors, vec!["missing required field: path"]);
    }

    #[test]
    fn schema_validation_flags_unexpected_field() {
        let schema = json!({"type": "object", "properties": {"path": {"type": "string"}}, "additionalProperties": false});
        let errors = validate_against_schema(&schema, &json!({"path": "x", "extra": 1}));
        assert_eq!(errors, vec!["unexpected field: extra"]);
    }

    #[test]
    fn schema_validation_checks_string_type() {
        let schema = json!({"type": "object", "properties": {"path": {"type": "string"}}});
        let errors = validate_against_schema(&schema, &json!({"path": 5}));
        assert_eq!(errors, vec!["path must be a string"]);
    }

    #[test]
    fn schema_validation_checks_array_of_strings() {
        let schema = json!({"type": "object", "properties": {"args": {"type": "array", "items": {"type": "string"}}}});
        let errors = validate_against_schema(&schema, &json!({"args": ["a", 1]}));
        assert_eq!(errors, vec!["args items must be strings"]);
    }

    #[test]
    fn resolve_within_roots_accepts_plain_relative_path() {
        let roots = vec!["/data/workspace".to_string()];
        let resolved = resolve_within_roots("notes.txt", &roots).unwrap();
        assert_eq!(resolved, Path::new("/data/workspace/notes.txt"));
    }

    #[test]
    fn resolve_within_roots_rejects_dotdot_traversal_out_of_root() {
        let roots = vec!["/data/workspace".to_string()];
        assert!(resolve_within_roots("../../../etc/passwd", &roots).is_none());
    }

    #[test]
    fn resolve_within_roots_allows_dotdot_that_stays_inside_root() {
        let roots = vec!["/data/workspace".to_string()];
        let resolved = resolve_within_roots("sub/../notes.txt", &roots).unwrap();
        assert_eq!(resolved, Path::new("/data/workspace/notes.txt"));
    }

    #[test]
    fn resolve_within_roots_rejects_absolute_path_outside_any_root() {
        let roots = vec!["/data/workspace".to_string()];
        assert!(resolve_within_roots("/etc/passwd", &roots).is_none());
    }

    #[test]
    fn truncate_utf8_snaps_to_char_boundary() {
        let s = "héllo world";
        let truncated = truncate_utf8(s, 2).unwrap();
        assert!(truncated.is_char_boundary(truncated.len() - 1) || truncated.ends_with('…'));
    }

    #[test]
    fn truncate_utf8_returns_none_when_within_limit() {
        assert!(truncate_utf8("short", 100).is_none());
    }

    #[test]
    fn request_hash_is_stable_for_same_input() {
        let a = hash_request("shell", "1", &json!({"cmd": "echo hi"}));
        let b = hash_request("shell", "1", &json!({"cmd": "echo hi"}));
        assert_eq!(a, b);
    }

    #[test]
    fn request_hash_differs_for_different_args() {
        let a = hash_request("shell", "1", &json!({"cmd": "echo hi"}));
        let b = hash_request("shell", "1", &json!({"cmd": "echo bye"}));
        assert_ne!(a, b);
    }

    #[test]
    fn request_hash_differs_across_versions() {
        let a = hash_request("shell", "1", &json!({"cmd": "echo hi"}));
        let b = hash_request("shell", "2", &json!({"cmd": "echo hi"}));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let bus = ToolBus::new(tools_config());
        let result = bus.invoke("nonexistent", json!({})).await;
        assert!(!result.ok);
        assert_eq!(result.error_type.as_deref(), Some("unknown_tool"));
    }

    #[tokio::test]
    async fn disallowed_tool_is_rejected() {
        let mut cfg = tools_config();
        cfg.allow_git = false;
        let bus = ToolBus::new(cfg);
        let result = bus.invoke("git", json!({"args": ["status"]})).await;
        assert!(!result.ok);
        assert_eq!(result.error_type.as_deref(), Some("tool_not_allowed"));
    }

    #[tokio::test]
    async fn shell_runs_allowed_command() {
        let bus = ToolBus::new(tools_config());
        let result = bus.invoke("shell", json!({"cmd": "echo hi"})).await;
        assert!(result.ok, "{result:?}");
        assert!(result.result.unwrap()["stdout"].as_str().unwrap().contains("hi"));
    }

    #[tokio::test]
    async fn shell_rejects_command_not_in_allowlist() {
        let bus = ToolBus::new(tools_config());
        let result = bus.invoke("shell", json!({"cmd": "rm -rf /"})).await;
        assert!(!result.ok);
        assert_eq!(result.error_type.as_deref(), Some("command_not_allowed"));
    }

    #[tokio::test]
    async fn read_file_denies_path_outside_roots() {
        let bus = ToolBus::new(tools_config());
        let result = bus.invoke("read_file", json!({"path": "/etc/shadow"})).await;
        assert!(!result.ok);
        assert_eq!(result.error_type.as_deref(), Some("path_denied"));
    }

    #[tokio::test]
    async fn write_then_read_file_round_trips() {
        let bus = ToolBus::new(tools_config());
        let name = format!("gateway-tool-test-{}.txt", uuid::Uuid::new_v4());
        let path = std::env::temp_dir().join(&name);
        let write = bus.invoke("write_file", json!({"path": path.to_string_lossy(), "content": "hello"})).await;
        assert!(write.ok, "{write:?}");
        let read = bus.invoke("read_file", json!({"path": path.to_string_lossy()})).await;
        assert!(read.ok, "{read:?}");
        assert_eq!(read.result.unwrap()["content"], "hello");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn git_rejects_disallowed_subcommand() {
        let bus = ToolBus::new(tools_config());
        let result = bus.invoke("git", json!({"args": ["push"]})).await;
        assert!(!result.ok);
        assert_eq!(result.error_type.as_deref(), Some("command_not_allowed"));
    }

    #[tokio::test]
    async fn invalid_schema_arguments_are_rejected_before_execution() {
        let bus = ToolBus::new(tools_config());
        let result = bus.invoke("read_file", json!({})).await;
        assert!(!result.ok);
        assert_eq!(result.error_type.as_deref(), Some("invalid_arguments"));
    }

    #[tokio::test]
    async fn registry_tool_is_listed_but_not_executable() {
        let dir = std::env::temp_dir().join(format!("gateway-tool-registry-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("registry.json");
        tokio::fs::write(
            &path,
            json!([{"name": "search_docs", "description": "Search internal docs.", "parameters": {"type": "object"}}]).to_string(),
        )
        .await
        .unwrap();

        let mut cfg = tools_config();
        cfg.registry_path = Some(path.to_string_lossy().into_owned());
        let bus = ToolBus::new(cfg);

        assert!(bus.is_allowed("search_docs"));
        assert!(bus.list_declarations(&[]).iter().any(|d| d.name == "search_docs"));

        let result = bus.invoke("search_docs", json!({})).await;
        assert!(!result.ok);
        assert_eq!(result.error_type.as_deref(), Some("not_executable"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn registry_entry_shadowing_a_builtin_name_is_ignored() {
        let dir = std::env::temp_dir().join(format!("gateway-tool-registry-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("registry.json");
        tokio::fs::write(
            &path,
            json!([{"name": "shell", "description": "fake", "parameters": {"type": "object"}}]).to_string(),
        )
        .await
        .unwrap();

        let mut cfg = tools_config();
        cfg.registry_path = Some(path.to_string_lossy().into_owned());
        let bus = ToolBus::new(cfg);

        // The builtin "shell" schema, not the registry's shadowing entry, wins.
        let decl = bus.list_declarations(&[]).into_iter().find(|d| d.name == "shell").unwrap();
        assert_eq!(decl.description, "Run a command locally (no shell interpolation).");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn invoke_result_is_retrievable_by_replay_id() {
        let bus = ToolBus::new(tools_config());
        let first = bus.invoke("shell", json!({"cmd": "echo hi"})).await;
        let replayed = bus.replay(&first.replay_id).unwrap();
        assert_eq!(replayed.replay_id, first.replay_id);
        assert_eq!(replayed.result, first.result);
    }

    #[tokio::test]
    async fn replay_of_unknown_id_returns_none() {
        let bus = ToolBus::new(tools_config());
        assert!(bus.replay("tool-does-not-exist").is_none());
    }

    #[tokio::test]
    async fn allowed_tool_names_falls_back_to_feature_toggles_when_allowlist_empty() {
        let mut cfg = tools_config();
        cfg.allowlist = Vec::new();
        cfg.allow_git = false;
        let bus = ToolBus::new(cfg);
        let names = bus.allowed_tool_names();
        assert!(names.contains(&"shell".to_string()));
        assert!(!names.contains(&"git".to_string()));
    }
}
