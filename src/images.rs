//! Content-addressed store for generated media (§6: images/music/TTS).
//!
//! Generated bytes are written under a SHA-256-derived filename
//! (`<hash>.<ext>`) so identical outputs dedupe naturally, and served back at
//! `/ui/images/{name}`. A background sweeper removes files older than the
//! configured TTL — this is a cache, not a durable archive; clients that need
//! the bytes long-term should save them elsewhere.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use sha2::{Digest, Sha256};

use crate::config::ImagesConfig;

/// Content-addressed file store backing `response_format=url` image/audio generations.
pub struct ImageStore {
    dir: PathBuf,
    ttl: Duration,
}

impl ImageStore {
    pub fn new(config: &ImagesConfig) -> Self {
        Self { dir: PathBuf::from(&config.store_dir), ttl: Duration::from_secs(config.ttl_sec) }
    }

    /// Persist `bytes` under a content-addressed name with the given extension
    /// (no leading dot, e.g. `"png"`). Returns the bare filename
    /// (`<hash>.<ext>`) to embed in a served URL.
    pub async fn put(&self, bytes: &[u8], ext: &str) -> anyhow::Result<String> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let token = hex::encode(hasher.finalize());
        let name = format!("{token}.{ext}");
        let path = self.dir.join(&name);
        // Already present under this content hash — nothing to write.
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::write(&path, bytes).await?;
        }
        Ok(name)
    }

    /// Read back a previously stored file by its content-addressed name.
    /// Rejects names containing path separators to prevent escaping `dir`.
    pub async fn get(&self, name: &str) -> Option<Vec<u8>> {
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return None;
        }
        tokio::fs::read(self.dir.join(name)).await.ok()
    }

    /// Remove every file older than the configured TTL. Best-effort: I/O
    /// errors are logged and otherwise ignored, matching the rest of the
    /// gateway's "logging never fails a request" policy.
    pub async fn sweep(&self) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, dir = %self.dir.display(), "image store sweep: failed to read directory");
                }
                return;
            }
        };

        let now = SystemTime::now();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if is_expired(&path, now, self.ttl).await {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(error = %e, path = %path.display(), "image store sweep: failed to remove expired file");
                }
            }
        }
    }

    /// Run [`Self::sweep`] on a fixed interval until the process exits.
    pub async fn run_forever(self: std::sync::Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}

async fn is_expired(path: &Path, now: SystemTime, ttl: Duration) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else { return false };
    let Ok(modified) = meta.modified() else { return false };
    now.duration_since(modified).map(|age| age > ttl).unwrap_or(false)
}
