//! Startup configuration accepted by the [`lifecycle`](crate::lifecycle) host.
//!
//! The core does not load this from the environment or a file — building an `OperatorConfig`
//! (env parsing, CLI flags, a config file, a DI container) is the embedding binary's job. We
//! just accept the finished struct, the same way `kube-runtime` accepts an already-built
//! `Api<K>`/`ListParams` rather than constructing its own client.

use std::{sync::Arc, time::Duration};

use crate::generation_cache::GenerationCache;

/// Options recognised by the core at startup.
#[derive(Clone)]
pub struct OperatorConfig {
    /// Restrict watches to a single namespace. `None` means all namespaces.
    pub namespace: Option<String>,
    /// Gate watch loops behind the [`leader`](crate::leader) gate.
    pub enable_leader_election: bool,
    /// Name of the `coordination.k8s.io/v1` `Lease` object used for leader election.
    /// Required when `enable_leader_election` is set.
    pub lease_name: Option<String>,
    /// How long a held lease remains valid without renewal.
    pub lease_duration: Duration,
    /// Add registered finalizer identifiers to `.metadata.finalizers` before reconciling a
    /// spec change, if they are not already present.
    pub auto_attach_finalizers: bool,
    /// Remove a finalizer's identifier from `.metadata.finalizers` after it reports success.
    pub auto_detach_finalizers: bool,
    /// Generation cache backing store configuration.
    pub cache: CacheConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            enable_leader_election: false,
            lease_name: None,
            lease_duration: Duration::from_secs(15),
            auto_attach_finalizers: true,
            auto_detach_finalizers: true,
            cache: CacheConfig::default(),
        }
    }
}

/// Configures the [`GenerationCache`](crate::generation_cache::GenerationCache) used by the
/// dispatcher.
///
/// Mirrors the source's `configureCache` hook: a key prefix for whichever backend is plugged
/// in, plus an optional L2 (distributed) cache that sits behind the in-process L1.
#[derive(Clone, Default)]
pub struct CacheConfig {
    /// Prefix applied to cache keys, useful when an L2 store is shared between operators.
    pub key_prefix: String,
    /// Optional distributed backend. When set, reads/writes are layered L1-then-L2,
    /// read-through and write-through (see [`crate::generation_cache::LayeredGenerationCache`]).
    pub l2: Option<Arc<dyn GenerationCache>>,
}
