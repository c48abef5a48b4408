//! Memory Contract (§4.12) — the trait surface `/v1/memory/*` is built on.
//!
//! This module defines the contract only: the request/response DTOs and the
//! [`MemoryStore`] trait a real implementation (vector index + SQLite, or
//! whatever a deployment chooses) must satisfy. [`NullMemoryStore`] is the
//! default wired in when `memory.enabled = false` — every operation succeeds
//! and returns nothing, so callers don't need to branch on whether memory is
//! configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One durable memory record as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub memory_type: String,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: u64,
    pub score: Option<f64>,
}

/// `/v1/memory/upsert` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertRequest {
    pub id: Option<String>,
    pub memory_type: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `/v1/memory/list` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ListRequest {
    pub memory_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `/v1/memory/search` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub memory_type: Option<String>,
    pub top_k: Option<usize>,
    pub min_sim: Option<f64>,
}

/// `/v1/memory/compact` request body — drops records older than `max_age_sec`
/// (falling back to the configured default when unset).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CompactRequest {
    pub max_age_sec: Option<u64>,
}

/// Outcome of a compaction pass.
#[derive(Debug, Clone, Serialize)]
pub struct CompactResult {
    pub removed: usize,
}

/// Durable memory storage contract. The gateway core depends only on this
/// trait — it has no knowledge of what backs it.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn upsert(&self, req: UpsertRequest) -> anyhow::Result<MemoryRecord>;
    async fn list(&self, req: ListRequest) -> anyhow::Result<Vec<MemoryRecord>>;
    async fn search(&self, req: SearchRequest) -> anyhow::Result<Vec<MemoryRecord>>;
    async fn compact(&self, req: CompactRequest) -> anyhow::Result<CompactResult>;
}

/// No-op implementation wired in when `memory.enabled = false` (the default
/// in `config.example.toml`). Every call succeeds; `upsert` hands back a
/// record that was never actually stored, so the write-then-read-back
/// pattern a client might try will not find it again.
pub struct NullMemoryStore;

#[async_trait]
impl MemoryStore for NullMemoryStore {
    async fn upsert(&self, req: UpsertRequest) -> anyhow::Result<MemoryRecord> {
        Ok(MemoryRecord {
            id: req.id.unwrap_or_default(),
            memory_type: req.memory_type,
            content: req.content,
            tags: req.tags,
            created_at: 0,
            score: None,
        })
    }

    async fn list(&self, _req: ListRequest) -> anyhow::Result<Vec<MemoryRecord>> {
        Ok(Vec::new())
    }

    async fn search(&self, _req: SearchRequest) -> anyhow::Result<Vec<MemoryRecord>> {
        Ok(Vec::new())
    }

    async fn compact(&self, _req: CompactRequest) -> anyhow::Result<CompactResult> {
        Ok(CompactResult { removed: 0 })
    }
}
