//! Model Alias Registry (§4.4).
//!
//! Aliases map a short client-facing name (`"coder"`, `"long"`, or any
//! operator-declared name) to a concrete `(backend, upstream_model)` pair,
//! optionally capping `max_tokens`/`temperature` or advertising a
//! `context_window`. Four names are reserved and always resolvable even with
//! an empty `[aliases]` table: `default`, `fast`, `coder`, `long`. Reserved
//! aliases are synthesized from `RouterConfig.default_backend` unless the
//! operator overrides them explicitly.
//!
//! The registry is built once from [`Config`] and cached for the lifetime of
//! the process — unlike the rest of the config, it is *not* hot-reloaded,
//! since alias resolution is consulted on every routing decision and a
//! torn read during a config swap would be a correctness hazard for very
//! little operational benefit (operators restart the gateway to change
//! aliases, same as the teacher's model-alias behavior).

use std::collections::HashMap;

use crate::config::{Config, ModelAliasConfig};

/// A resolved model alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAlias {
    pub backend: String,
    pub upstream_model: String,
    pub context_window: Option<u64>,
    pub tools_allowed: Option<bool>,
    pub max_tokens_cap: Option<u64>,
    pub temperature_cap: Option<f64>,
}

impl From<&ModelAliasConfig> for ModelAlias {
    fn from(c: &ModelAliasConfig) -> Self {
        Self {
            backend: c.backend.clone(),
            upstream_model: c.upstream_model.clone(),
            context_window: c.context_window,
            tools_allowed: c.tools_allowed,
            max_tokens_cap: c.max_tokens_cap,
            temperature_cap: c.temperature_cap,
        }
    }
}

/// Names that always resolve, even with no `[aliases]` declared.
pub const RESERVED_ALIASES: [&str; 4] = ["default", "fast", "coder", "long"];

/// Process-wide alias table.
#[derive(Debug, Clone)]
pub struct AliasRegistry {
    aliases: HashMap<String, ModelAlias>,
}

impl AliasRegistry {
    /// Build the registry: reserved aliases first, then explicit `[aliases.*]`
    /// entries, which take precedence over a same-named reserved alias.
    pub fn load(config: &Config) -> anyhow::Result<Self> {
        let mut aliases = default_aliases(config)?;

        for (name, alias) in &config.aliases {
            aliases.insert(name.to_lowercase(), ModelAlias::from(alias));
        }

        Ok(Self { aliases })
    }

    /// Resolve an alias name to `(backend, upstream_model)`, ignoring the
    /// richer per-alias constraints. Returns `None` if `name` is not a
    /// known alias (callers then fall through to pin/direct-model handling).
    pub fn resolve(&self, name: &str) -> Option<(&str, &str)> {
        self.aliases
            .get(&name.to_lowercase())
            .map(|a| (a.backend.as_str(), a.upstream_model.as_str()))
    }

    /// Fetch the full alias record, including constraints.
    pub fn get(&self, name: &str) -> Option<&ModelAlias> {
        self.aliases.get(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.aliases.keys().map(|s| s.as_str())
    }
}

fn default_aliases(config: &Config) -> anyhow::Result<HashMap<String, ModelAlias>> {
    let router = &config.router;
    let default_backend_id = router.default_backend.as_str();
    let default_backend = config.backends.get(default_backend_id).ok_or_else(|| {
        anyhow::anyhow!("router.default_backend `{default_backend_id}` is not a known backend")
    })?;

    let mut aliases = HashMap::new();

    aliases.insert(
        "default".to_string(),
        ModelAlias {
            backend: default_backend_id.to_string(),
            upstream_model: default_backend.default_model.clone(),
            context_window: None,
            tools_allowed: Some(true),
            max_tokens_cap: None,
            temperature_cap: None,
        },
    );

    aliases.insert(
        "fast".to_string(),
        ModelAlias {
            backend: default_backend_id.to_string(),
            upstream_model: default_backend.fast_model().to_string(),
            context_window: None,
            tools_allowed: Some(false),
            max_tokens_cap: None,
            temperature_cap: None,
        },
    );

    // `coder`/`long` are not explicitly assigned a backend by RouterConfig —
    // generalizing the original's hardcoded ollama/mlx split, both default to
    // `default_backend` unless the operator declares `[aliases.coder]` /
    // `[aliases.long]` explicitly (see DESIGN.md).
    aliases.insert(
        "coder".to_string(),
        ModelAlias {
            backend: default_backend_id.to_string(),
            upstream_model: default_backend.default_model.clone(),
            context_window: None,
            tools_allowed: Some(true),
            max_tokens_cap: None,
            temperature_cap: None,
        },
    );

    aliases.insert(
        "long".to_string(),
        ModelAlias {
            backend: default_backend_id.to_string(),
            upstream_model: default_backend.default_model.clone(),
            context_window: Some(router.long_context_chars_threshold.saturating_mul(4)),
            tools_allowed: Some(false),
            max_tokens_cap: None,
            temperature_cap: None,
        },
    );

    Ok(aliases)
}
