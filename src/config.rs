//! Configuration types for the gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. `${VAR}` references inside
//! `base_url` are substituted from the process environment at load time, so
//! secrets never need to live in the file itself.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//!
//! [backends.gpu_heavy]
//! base_url = "http://127.0.0.1:11434"
//! provider = "ndjson"
//! capabilities = ["chat", "embeddings"]
//! default_model = "qwen2.5:32b"
//! fast_model = "qwen2.5:7b"
//! [backends.gpu_heavy.concurrency_limits]
//! chat = 4
//!
//! [router]
//! default_backend = "gpu_heavy"
//!
//! [aliases.coder]
//! backend = "gpu_heavy"
//! upstream_model = "deepseek-coder:33b"
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Which wire dialect a backend speaks.
///
/// The gateway normalizes all client-facing traffic to the OpenAI
/// chat-completions schema; each [`Provider`] variant maps to an adapter that
/// performs whatever request/response translation the dialect requires.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Standard OpenAI `/chat/completions` + `/embeddings` protocol.
    /// Also spoken by LM Studio, vLLM, LocalAI, and most cloud routers.
    #[default]
    OpenAI,
    /// NDJSON chat dialect (`POST {base}/api/chat`, one JSON object per line).
    /// Translated to the client SSE contract by the Streaming Translator.
    Ndjson,
    /// Anthropic Messages API (`/v1/messages`).
    /// Request and response shapes are translated to/from the OpenAI schema.
    Anthropic,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAI => "openai",
            Self::Ndjson => "ndjson",
            Self::Anthropic => "anthropic",
        })
    }
}

/// A request kind a backend can serve.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Embeddings,
    Images,
    Music,
    Tts,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Chat => "chat",
            Self::Embeddings => "embeddings",
            Self::Images => "images",
            Self::Music => "music",
            Self::Tts => "tts",
        })
    }
}

/// A per-client API key binding, loaded from `[[clients]]`.
///
/// The gateway reads the actual key value from the environment variable named
/// by `key_env` at startup. This keeps secrets out of the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Name of the environment variable whose value is this client's Bearer token.
    pub key_env: String,
    /// Comma-separated CIDR/IP list overriding the global `ip_allowlist` for this client.
    #[serde(default)]
    pub ip_allowlist: Option<String>,
    /// Tool names this client may invoke, intersected with the global allowlist.
    /// Empty means "no override" — the global allowlist applies unmodified.
    #[serde(default)]
    pub tools_allowlist: Vec<String>,
    /// Requests-per-minute override for this client. `None` uses the global limit.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub gateway: GatewayConfig,

    /// Named backends (Backend Registry, §C1).
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// Router policy knobs.
    #[serde(default)]
    pub router: RouterConfig,

    /// Explicit model aliases. Reserved names (`default`, `fast`, `coder`,
    /// `long`) are synthesized from `router.default_backend` when absent here
    /// — see [`crate::aliases::AliasRegistry::load`].
    #[serde(default)]
    pub aliases: HashMap<String, ModelAliasConfig>,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub images: ImagesConfig,

    /// Per-client API key → policy mappings.
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = toml::from_str(&content).context("parsing config TOML")?;
        for backend in config.backends.values_mut() {
            backend.base_url = substitute_env(&backend.base_url)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.backends.is_empty(), "at least one [backends.*] entry is required");

        for (id, backend) in &self.backends {
            anyhow::ensure!(
                !backend.capabilities.is_empty(),
                "backend `{id}` declares no capabilities"
            );
            for cap in &backend.capabilities {
                let limit = backend.concurrency_limits.get(cap).copied().unwrap_or(0);
                anyhow::ensure!(
                    limit >= 1,
                    "backend `{id}` capability `{cap}` needs concurrency_limits.{cap} >= 1"
                );
            }
        }

        anyhow::ensure!(
            self.backends.contains_key(&self.router.default_backend),
            "router.default_backend `{}` is not a known backend",
            self.router.default_backend
        );

        for (name, alias) in &self.aliases {
            anyhow::ensure!(
                self.backends.contains_key(&alias.backend),
                "alias `{name}` references unknown backend `{}`",
                alias.backend
            );
        }

        // Legacy aliases must resolve to exactly one backend.
        let mut seen_legacy: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for (id, backend) in &self.backends {
            for legacy in &backend.legacy_aliases {
                anyhow::ensure!(
                    seen_legacy.insert(legacy.as_str()),
                    "legacy alias `{legacy}` (on backend `{id}`) is claimed by more than one backend"
                );
            }
        }

        for client in &self.clients {
            anyhow::ensure!(!client.key_env.trim().is_empty(), "[[clients]] entry has empty key_env");
        }

        Ok(())
    }

    /// Resolve a backend id through legacy aliases to its canonical id.
    pub fn resolve_backend_id<'a>(&'a self, id_or_legacy: &'a str) -> Option<&'a str> {
        if self.backends.contains_key(id_or_legacy) {
            return self.backends.get_key_value(id_or_legacy).map(|(k, _)| k.as_str());
        }
        self.backends.iter().find_map(|(id, b)| {
            b.legacy_aliases
                .iter()
                .any(|a| a == id_or_legacy)
                .then_some(id.as_str())
        })
    }
}

/// Replace every `${VAR}` occurrence in `s` with the value of the matching
/// environment variable. Unset variables are left as empty strings — callers
/// that need a non-empty value (e.g. an API key) will fail later with a
/// clearer, handler-local error rather than a cryptic URL at startup.
fn substitute_env(s: &str) -> anyhow::Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            out.push_str(rest);
            return Ok(out);
        };
        out.push_str(&rest[..start]);
        let var_name = &rest[start + 2..start + end];
        out.push_str(&std::env::var(var_name).unwrap_or_default());
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Core gateway settings (§4.10 Request Plane, §6 Configuration surface).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the bearer-authenticated request plane (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for operator-only introspection (`/admin/*`); kept separate from
    /// the client port so it can be firewalled independently (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Number of recent requests to keep in the in-memory traffic log (default: 500).
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG`).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Environment variable holding a comma-separated list of accepted bearer
    /// tokens. Required — the gateway refuses to start without at least one
    /// resolvable token.
    pub bearer_tokens_env: String,

    /// Environment variable holding a JSON object `{token: {ip_allowlist?,
    /// tools_allowlist?, rate_limit_rpm?}}` of per-token policy overrides.
    #[serde(default)]
    pub token_policies_env: Option<String>,

    /// Global CIDR/IP allowlist (comma-separated). Empty disables the check.
    #[serde(default)]
    pub ip_allowlist: String,

    /// Maximum accepted request body size in bytes (413 above this).
    #[serde(default = "defaults::max_request_bytes")]
    pub max_request_bytes: usize,

    /// Maximum requests per minute per client IP (burst = ceil(rpm/2)).
    /// Leave unset (or 0) to disable.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// Environment variable whose value is the Bearer token required for the
    /// admin port. Leave unset to disable admin auth (firewall the port instead).
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Append-only JSONL request log path. Leave unset to disable.
    #[serde(default)]
    pub request_log_path: Option<String>,
}

/// A named backend (Backend Registry entry, §3/§4.1).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base URL, `${VAR}`-substituted at load time.
    pub base_url: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Environment variable name whose value is the API key.
    /// Leave unset for keyless local backends.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Non-stream request timeout in milliseconds (default: 600 000 — §4.6).
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Protocol dialect (default: OpenAI-compatible passthrough).
    #[serde(default)]
    pub provider: Provider,

    /// Request kinds this backend accepts. Must be non-empty.
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    /// Per-capability concurrency cap — each entry backs one Admission
    /// Controller semaphore. Every declared capability needs a cap >= 1.
    #[serde(default)]
    pub concurrency_limits: HashMap<Capability, usize>,

    /// Path appended to `base_url` for the liveness probe (default: `/`).
    #[serde(default = "defaults::liveness_path")]
    pub liveness_path: String,

    /// Path appended to `base_url` for the readiness probe, only checked
    /// after liveness succeeds (default: same as liveness).
    #[serde(default)]
    pub readiness_path: Option<String>,

    /// The "strong" model used when no alias applies but policy calls for
    /// the backend's best model (tool use, long context fallback, §4.5).
    pub default_model: String,

    /// The "fast" / cheap model used for the default routing policy tier.
    /// Falls back to `default_model` when unset.
    #[serde(default)]
    pub fast_model: Option<String>,

    /// Historical backend names that should resolve to this one.
    #[serde(default)]
    pub legacy_aliases: Vec<String>,

    /// Opaque payload-policy hints (per-capability size/format limits) — not
    /// interpreted by the core routing path, only forwarded to the domain
    /// handlers (images/music/tts) that need them.
    #[serde(default)]
    pub payload_policy: HashMap<String, serde_json::Value>,
}

impl BackendConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }

    pub fn readiness_path(&self) -> &str {
        self.readiness_path.as_deref().unwrap_or(&self.liveness_path)
    }

    pub fn fast_model(&self) -> &str {
        self.fast_model.as_deref().unwrap_or(&self.default_model)
    }

    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// Router policy knobs (§4.5).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Backend used when a request names no backend, alias, or pin.
    pub default_backend: String,

    /// Approximate character-size threshold above which the long-context
    /// policy kicks in (default: 40 000, §4.5 rule 7).
    #[serde(default = "defaults::long_context_chars_threshold")]
    pub long_context_chars_threshold: u64,

    /// Master switch for policy-based routing (rules 5-8). When `false`,
    /// requests are routed `direct:model` after alias/override/pin checks.
    #[serde(default = "defaults::enabled")]
    pub enable_policy: bool,

    /// Enables the coding-keyword classifier (rule 5). Independent of
    /// `enable_policy` so operators can disable just the heuristic.
    #[serde(default = "defaults::enabled")]
    pub enable_request_type: bool,

    /// Forward upstream `thinking`/reasoning snippets to clients during
    /// streaming. Off by default — see SPEC_FULL.md open-question log.
    #[serde(default)]
    pub stream_forward_thinking: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_backend: String::new(),
            long_context_chars_threshold: defaults::long_context_chars_threshold(),
            enable_policy: true,
            enable_request_type: true,
            stream_forward_thinking: false,
        }
    }
}

/// A declared model alias as it appears in `[aliases.*]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelAliasConfig {
    pub backend: String,
    pub upstream_model: String,
    #[serde(default)]
    pub context_window: Option<u64>,
    #[serde(default)]
    pub tools_allowed: Option<bool>,
    #[serde(default)]
    pub max_tokens_cap: Option<u64>,
    #[serde(default)]
    pub temperature_cap: Option<f64>,
}

/// Tool Bus configuration (§4.8, §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsConfig {
    /// Explicit allowlist. Union'd with feature-toggle-enabled built-ins to
    /// form the effective allowlist (§4.8).
    #[serde(default)]
    pub allowlist: Vec<String>,

    #[serde(default)]
    pub allow_shell: bool,
    #[serde(default)]
    pub allow_fs: bool,
    #[serde(default)]
    pub allow_fs_write: bool,
    #[serde(default)]
    pub allow_http_fetch: bool,
    #[serde(default)]
    pub allow_git: bool,

    #[serde(default = "defaults::tools_cwd")]
    pub shell_cwd: String,
    #[serde(default = "defaults::shell_timeout_sec")]
    pub shell_timeout_sec: u64,
    #[serde(default)]
    pub shell_allowed_cmds: Vec<String>,

    #[serde(default = "defaults::fs_roots")]
    pub fs_roots: Vec<String>,
    #[serde(default = "defaults::fs_max_bytes")]
    pub fs_max_bytes: usize,

    #[serde(default = "defaults::http_allowed_hosts")]
    pub http_allowed_hosts: Vec<String>,
    #[serde(default = "defaults::http_timeout_sec")]
    pub http_timeout_sec: u64,
    #[serde(default = "defaults::http_max_bytes")]
    pub http_max_bytes: usize,

    #[serde(default = "defaults::tools_cwd")]
    pub git_cwd: String,
    #[serde(default = "defaults::shell_timeout_sec")]
    pub git_timeout_sec: u64,

    /// Path to a JSON file of declared tools (`ToolDeclaration[]`).
    #[serde(default)]
    pub registry_path: Option<String>,
    /// Optional SHA-256 of the registry file, checked at load time.
    #[serde(default)]
    pub registry_sha256: Option<String>,

    #[serde(default)]
    pub log_mode: ToolLogMode,
    #[serde(default = "defaults::tool_log_path")]
    pub log_path: String,
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Max characters retained from stdout/stderr before truncation (§9 open
    /// question: resolved as char counts, mirroring the original's string
    /// slicing, with a UTF-8-boundary-safe cut).
    #[serde(default = "defaults::tool_output_max_chars")]
    pub output_max_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            allow_shell: false,
            allow_fs: false,
            allow_fs_write: false,
            allow_http_fetch: false,
            allow_git: false,
            shell_cwd: defaults::tools_cwd(),
            shell_timeout_sec: defaults::shell_timeout_sec(),
            shell_allowed_cmds: Vec::new(),
            fs_roots: defaults::fs_roots(),
            fs_max_bytes: defaults::fs_max_bytes(),
            http_allowed_hosts: defaults::http_allowed_hosts(),
            http_timeout_sec: defaults::http_timeout_sec(),
            http_max_bytes: defaults::http_max_bytes(),
            git_cwd: defaults::tools_cwd(),
            git_timeout_sec: defaults::shell_timeout_sec(),
            registry_path: None,
            registry_sha256: None,
            log_mode: ToolLogMode::default(),
            log_path: defaults::tool_log_path(),
            log_dir: None,
            output_max_chars: defaults::tool_output_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolLogMode {
    #[default]
    Ndjson,
    PerInvocation,
    Both,
}

/// Memory contract configuration (§4.12, external — consumed by core only).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::memory_db_path")]
    pub db_path: String,
    #[serde(default = "defaults::memory_top_k")]
    pub top_k: usize,
    #[serde(default = "defaults::memory_min_sim")]
    pub min_sim: f64,
    #[serde(default = "defaults::memory_max_age_sec")]
    pub max_age_sec: u64,
    #[serde(default = "defaults::memory_types_default")]
    pub types_default: Vec<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: defaults::memory_db_path(),
            top_k: defaults::memory_top_k(),
            min_sim: defaults::memory_min_sim(),
            max_age_sec: defaults::memory_max_age_sec(),
            types_default: defaults::memory_types_default(),
        }
    }
}

/// Agent Runtime configuration (§4.9, §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Path to a JSON file of `AgentSpec[]`. Unset means only an implicit
    /// default spec (tier 0, no tools) is available.
    #[serde(default)]
    pub specs_path: Option<String>,
    #[serde(default)]
    pub runs_log_mode: ToolLogMode,
    #[serde(default)]
    pub runs_log_dir: Option<String>,
    /// Maximum concurrent agent runs before new runs are rejected.
    #[serde(default = "defaults::agent_queue_max")]
    pub queue_max: usize,
    /// When true, tier >= 1 runs are admission-shed under the heavy-tier
    /// semaphore before the first upstream call (§4.9).
    #[serde(default = "defaults::enabled")]
    pub shed_heavy: bool,
    /// Size of the heavy-tier semaphore when `shed_heavy` is enabled.
    #[serde(default = "defaults::agent_heavy_tier_limit")]
    pub heavy_tier_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            specs_path: None,
            runs_log_mode: ToolLogMode::default(),
            runs_log_dir: None,
            queue_max: defaults::agent_queue_max(),
            shed_heavy: true,
            heavy_tier_limit: defaults::agent_heavy_tier_limit(),
        }
    }
}

/// Content-addressed generated-media store configuration (§4.10, images/music/tts).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImagesConfig {
    /// Directory generated files are written to. Created on demand.
    #[serde(default = "defaults::images_store_dir")]
    pub store_dir: String,
    /// Eviction TTL — files older than this are removed by the sweeper.
    #[serde(default = "defaults::images_ttl_sec")]
    pub ttl_sec: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self { store_dir: defaults::images_store_dir(), ttl_sec: defaults::images_ttl_sec() }
    }
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn traffic_log_capacity() -> usize { 500 }
    pub fn timeout_ms() -> u64 { 600_000 }
    pub fn max_request_bytes() -> usize { 25 * 1024 * 1024 }
    pub fn liveness_path() -> String { "/".to_string() }
    pub fn long_context_chars_threshold() -> u64 { 40_000 }
    pub fn enabled() -> bool { true }
    pub fn tools_cwd() -> String { "/var/lib/gateway/tools".to_string() }
    pub fn shell_timeout_sec() -> u64 { 20 }
    pub fn fs_roots() -> Vec<String> { vec!["/var/lib/gateway".to_string()] }
    pub fn fs_max_bytes() -> usize { 200_000 }
    pub fn http_allowed_hosts() -> Vec<String> { vec!["127.0.0.1".to_string(), "localhost".to_string()] }
    pub fn http_timeout_sec() -> u64 { 10 }
    pub fn http_max_bytes() -> usize { 200_000 }
    pub fn tool_log_path() -> String { "/var/lib/gateway/logs/tools.ndjson".to_string() }
    pub fn tool_output_max_chars() -> usize { 8_000 }
    pub fn memory_db_path() -> String { "/var/lib/gateway/data/memory.sqlite".to_string() }
    pub fn memory_top_k() -> usize { 6 }
    pub fn memory_min_sim() -> f64 { 0.25 }
    pub fn memory_max_age_sec() -> u64 { 60 * 60 * 24 * 30 }
    pub fn memory_types_default() -> Vec<String> {
        vec!["fact".to_string(), "preference".to_string(), "project".to_string()]
    }
    pub fn agent_queue_max() -> usize { 16 }
    pub fn agent_heavy_tier_limit() -> usize { 2 }
    pub fn images_store_dir() -> String { "/var/lib/gateway/data/images".to_string() }
    pub fn images_ttl_sec() -> u64 { 60 * 60 }
}
