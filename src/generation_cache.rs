//! Per-entity last-observed `.metadata.generation`, gating reconciliation on generation
//! movement.
//!
//! The cache key is the entity's opaque `uid`, never `namespace/name` — names get reused,
//! `uid`s don't. Entries have no TTL: once written, a generation is kept indefinitely unless
//! explicitly `remove`d by the dispatcher on a successful deletion.

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Async, concurrency-safe store of `uid -> last-observed generation`.
///
/// Implementations must tolerate cold reads (a missing key is the ordinary "never seen"
/// signal, not an error) and must be safe to call concurrently — the dispatcher relies on the
/// watch loop's sequential event processing for per-`uid` ordering, not on the cache itself.
#[async_trait]
pub trait GenerationCache: Send + Sync {
    /// Look up the last generation observed for `uid`, if any.
    async fn try_get(&self, uid: &str) -> Option<i64>;
    /// Record `generation` as the last-observed value for `uid`.
    async fn set(&self, uid: &str, generation: i64);
    /// Drop any cached generation for `uid`. Idempotent.
    async fn remove(&self, uid: &str);
}

/// A process-local generation cache: a `parking_lot`-guarded `hashbrown::HashMap`.
///
/// This is the core's default L1: cheap, exact, and gone on restart — which is fine, since the
/// dispatcher treats a cold read as "never reconciled" and simply reconciles once more.
#[derive(Default)]
pub struct LocalGenerationCache {
    entries: RwLock<HashMap<String, i64>>,
}

impl LocalGenerationCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GenerationCache for LocalGenerationCache {
    async fn try_get(&self, uid: &str) -> Option<i64> {
        self.entries.read().get(uid).copied()
    }

    async fn set(&self, uid: &str, generation: i64) {
        self.entries.write().insert(uid.to_string(), generation);
    }

    async fn remove(&self, uid: &str) {
        self.entries.write().remove(uid);
    }
}

/// Read-through, write-through combinator chaining an in-process L1 in front of an injected L2.
///
/// Modelled on the source's L1/L2 cache library: reads check L1 first and populate it from L2
/// on miss; writes and removals go to both layers. The L2 is any other [`GenerationCache`]
/// (e.g. an adapter over an external key-value store) — the core ships no concrete distributed
/// backend, only this combinator.
pub struct LayeredGenerationCache {
    l1: LocalGenerationCache,
    l2: Arc<dyn GenerationCache>,
    key_prefix: String,
}

impl LayeredGenerationCache {
    pub fn new(l2: Arc<dyn GenerationCache>, key_prefix: impl Into<String>) -> Self {
        Self {
            l1: LocalGenerationCache::new(),
            l2,
            key_prefix: key_prefix.into(),
        }
    }

    fn prefixed(&self, uid: &str) -> String {
        format!("{}{}", self.key_prefix, uid)
    }
}

#[async_trait]
impl GenerationCache for LayeredGenerationCache {
    async fn try_get(&self, uid: &str) -> Option<i64> {
        if let Some(gen) = self.l1.try_get(uid).await {
            return Some(gen);
        }
        let key = self.prefixed(uid);
        let gen = self.l2.try_get(&key).await?;
        self.l1.set(uid, gen).await;
        Some(gen)
    }

    async fn set(&self, uid: &str, generation: i64) {
        self.l1.set(uid, generation).await;
        self.l2.set(&self.prefixed(uid), generation).await;
    }

    async fn remove(&self, uid: &str) {
        self.l1.remove(uid).await;
        self.l2.remove(&self.prefixed(uid)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cold_read_is_none() {
        let cache = LocalGenerationCache::new();
        assert_eq!(cache.try_get("u1").await, None);
    }

    #[tokio::test]
    async fn set_then_get_then_remove() {
        let cache = LocalGenerationCache::new();
        cache.set("u1", 7).await;
        assert_eq!(cache.try_get("u1").await, Some(7));
        cache.remove("u1").await;
        assert_eq!(cache.try_get("u1").await, None);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let cache = LocalGenerationCache::new();
        cache.remove("missing").await;
        cache.remove("missing").await;
    }

    #[tokio::test]
    async fn layered_populates_l1_from_l2_on_miss() {
        let l2 = Arc::new(LocalGenerationCache::new());
        l2.set("prefix:u1", 3).await;
        let layered = LayeredGenerationCache::new(l2.clone(), "prefix:");
        assert_eq!(layered.try_get("u1").await, Some(3));
        // l1 was populated: direct l2 removal shouldn't affect the already-cached l1 copy
        l2.remove("prefix:u1").await;
        assert_eq!(layered.try_get("u1").await, Some(3));
    }

    #[tokio::test]
    async fn layered_write_through_hits_both_layers() {
        let l2 = Arc::new(LocalGenerationCache::new());
        let layered = LayeredGenerationCache::new(l2.clone(), "p:");
        layered.set("u2", 5).await;
        assert_eq!(l2.try_get("p:u2").await, Some(5));
        layered.remove("u2").await;
        assert_eq!(l2.try_get("p:u2").await, None);
    }
}
