//! Subdomain allocation, validation and the sticky `(apiKey, localPort) →
//! subdomain` cache (§4.3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "cosmic", "crimson", "curious", "daring", "eager", "fierce",
    "gentle", "golden", "happy", "hidden", "jolly", "lively", "lucky", "mellow", "mighty",
    "nimble", "noble", "playful", "quiet", "rapid", "silent", "silver", "sly", "solar", "spry",
    "steady", "swift", "tidy", "vivid", "wild", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "comet", "condor", "cricket", "current", "dolphin", "eagle",
    "ember", "falcon", "fox", "glacier", "harbor", "heron", "island", "jaguar", "kestrel",
    "lagoon", "lantern", "meadow", "otter", "panther", "quail", "raven", "reef", "river",
    "sparrow", "summit", "tiger", "valley", "willow", "wolf", "wren",
];

/// Debounce window before the cache file is rewritten after a `set` (§5).
const FLUSH_DEBOUNCE: Duration = Duration::from_secs(1);

/// Subdomains must match `^[a-z0-9-]+$` (§6).
pub fn is_valid_subdomain(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Generate a fresh `adjective-noun-hex4` subdomain. Collisions are not
/// checked here — the registry's uniqueness check is the authoritative guard
/// and the caller retries on the rare collision (§4.3).
pub fn allocate_subdomain() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    let suffix: u16 = rng.random_range(0..=0xffff);
    format!("{adjective}-{noun}-{suffix:04x}")
}

/// `sha256(apiKey)[0..8] || ":" || localPort`, the cache's key space (§6).
pub fn cache_key(api_key: &str, local_port: u16) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    let digest = hasher.finalize();
    let prefix = hex::encode(&digest[..4]);
    format!("{prefix}:{local_port}")
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    mappings: HashMap<String, String>,
}

struct Inner {
    path: PathBuf,
    mappings: RwLock<HashMap<String, String>>,
    pending_flush: Mutex<Option<JoinHandle<()>>>,
}

/// Process-wide, disk-backed `(apiKey, localPort) → subdomain` cache. Writes
/// are debounced 1s and temp-file-and-renamed to avoid partial JSON on crash
/// (§9 design note); `flush` forces an immediate write for shutdown.
#[derive(Clone)]
pub struct SubdomainCache {
    inner: Arc<Inner>,
}

impl SubdomainCache {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mappings = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<CacheFile>(&bytes)
                .map(|f| f.mappings)
                .unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(TunnelError::Io(e)),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                mappings: RwLock::new(mappings),
                pending_flush: Mutex::new(None),
            }),
        })
    }

    /// Look up the subdomain reserved for this cache key, if any.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.mappings.read().await.get(key).cloned()
    }

    /// True if some *other* cache key already owns `subdomain` (§4.3).
    pub async fn reserved_by_other(&self, key: &str, subdomain: &str) -> bool {
        self.inner
            .mappings
            .read()
            .await
            .iter()
            .any(|(k, v)| k != key && v == subdomain)
    }

    /// Record the mapping and schedule a debounced flush.
    pub async fn set(&self, key: String, subdomain: String) {
        {
            let mut mappings = self.inner.mappings.write().await;
            mappings.insert(key, subdomain);
        }
        self.schedule_flush().await;
    }

    async fn schedule_flush(&self) {
        let mut pending = self.inner.pending_flush.lock().await;
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let inner = self.inner.clone();
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            if let Err(e) = flush_inner(&inner).await {
                warn!("failed to flush subdomain cache: {e}");
            }
        }));
    }

    /// Force an immediate write, cancelling any pending debounced flush.
    /// Called on shutdown.
    pub async fn flush(&self) -> Result<()> {
        let mut pending = self.inner.pending_flush.lock().await;
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        flush_inner(&self.inner).await
    }
}

async fn flush_inner(inner: &Inner) -> Result<()> {
    let mappings = inner.mappings.read().await.clone();
    let contents = serde_json::to_vec_pretty(&CacheFile { mappings })?;
    write_atomic(&inner.path, &contents).await
}

/// Temp-file-and-rename so a crash mid-write never leaves partial JSON.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    debug!(path = %path.display(), "subdomain cache flushed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocator_matches_expected_format() {
        for _ in 0..100 {
            let s = allocate_subdomain();
            assert!(is_valid_subdomain(&s), "{s} should be valid");
            let parts: Vec<&str> = s.split('-').collect();
            assert_eq!(parts.len(), 3, "{s} should have three hyphen-separated parts");
            assert_eq!(parts[2].len(), 4);
            assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn validates_lowercase_alnum_and_hyphen_only() {
        assert!(is_valid_subdomain("brave-fox-abcd"));
        assert!(is_valid_subdomain("a1-2"));
        assert!(!is_valid_subdomain("Brave-Fox"));
        assert!(!is_valid_subdomain("has space"));
        assert!(!is_valid_subdomain("has_underscore"));
        assert!(!is_valid_subdomain(""));
    }

    #[test]
    fn cache_key_is_stable_and_scoped_by_port() {
        let k1 = cache_key("secret-key", 3000);
        let k2 = cache_key("secret-key", 3000);
        let k3 = cache_key("secret-key", 4000);
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert!(k1.ends_with(":3000"));
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_key() {
        let dir = tempdir().unwrap();
        let cache = SubdomainCache::load(dir.path().join("cache.json")).await.unwrap();
        assert_eq!(cache.get("unknown").await, None);
    }

    #[tokio::test]
    async fn set_then_get_round_trips_before_flush() {
        let dir = tempdir().unwrap();
        let cache = SubdomainCache::load(dir.path().join("cache.json")).await.unwrap();
        cache.set("key1".to_string(), "brave-fox-abcd".to_string()).await;
        assert_eq!(cache.get("key1").await.as_deref(), Some("brave-fox-abcd"));
    }

    #[tokio::test]
    async fn flush_persists_and_reload_recovers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = SubdomainCache::load(&path).await.unwrap();
        cache.set("key1".to_string(), "brave-fox-abcd".to_string()).await;
        cache.flush().await.unwrap();
        assert!(path.exists());

        let reloaded = SubdomainCache::load(&path).await.unwrap();
        assert_eq!(reloaded.get("key1").await.as_deref(), Some("brave-fox-abcd"));
    }

    #[tokio::test]
    async fn reserved_by_other_detects_conflicting_key() {
        let dir = tempdir().unwrap();
        let cache = SubdomainCache::load(dir.path().join("cache.json")).await.unwrap();
        cache.set("key1".to_string(), "brave-fox-abcd".to_string()).await;
        assert!(cache.reserved_by_other("key2", "brave-fox-abcd").await);
        assert!(!cache.reserved_by_other("key1", "brave-fox-abcd").await);
    }

    #[tokio::test]
    async fn load_missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let cache = SubdomainCache::load(dir.path().join("missing.json")).await.unwrap();
        assert_eq!(cache.get("anything").await, None);
    }
}
