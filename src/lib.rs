//! Runtime core for a Kubernetes operator framework.
//!
//! Wires together a watch loop, a reconciliation dispatcher, a generation cache, a timed
//! requeue queue, an optional leader-election gate, and a lifecycle host that starts and
//! stops one watcher per registered entity type. User code supplies a [`reconciler::Reconciler`]
//! (and any [`reconciler::Finalizer`]s) per entity type and a [`config::OperatorConfig`]; the
//! core owns everything from there.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod entity;
pub mod generation_cache;
pub mod leader;
pub mod lifecycle;
pub mod reconciler;
pub mod requeue_queue;
pub mod selector;
pub mod watcher;

pub use client::{ClientError, KubeClient, KubeClientFacade, RawWatchEvent};
pub use config::{CacheConfig, OperatorConfig};
pub use dispatcher::Dispatcher;
pub use entity::{EntityRef, KubeEntity};
pub use generation_cache::{GenerationCache, LayeredGenerationCache, LocalGenerationCache};
pub use leader::{LeaderGate, LeadershipState};
pub use lifecycle::{LifecycleHost, LifecycleHostBuilder};
pub use reconciler::{finalizer_identifier, Finalizer, Outcome, Reconciler, ReconciliationResult, TriggerSource};
pub use requeue_queue::{requeue_queue, RequeueEntry, RequeueKind, RequeueQueue, RequeueQueueHandle};
pub use selector::{LabelSelectorResolver, SelectorError, StaticSelector};
pub use watcher::WatchLoop;
