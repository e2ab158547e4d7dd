//! The external interfaces the dispatcher invokes: a per-entity-type [`Reconciler`] and any
//! number of named [`Finalizer`]s. Both are user-supplied; the core only calls them.

use crate::entity::KubeEntity;
use async_trait::async_trait;
use std::{fmt, time::Duration};
use tokio_util::sync::CancellationToken;

/// Where a dispatcher invocation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// The event came from the watch stream.
    ApiServer,
    /// The event came from the requeue queue.
    Operator,
}

/// The outcome of a single reconciler or finalizer invocation.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    /// `message` is logged verbatim; `cause` is an optional chained error for structured
    /// logging. A `Failure` never aborts the operator.
    Failure { message: String, cause: Option<String> },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Outcome::Failure {
            message: message.into(),
            cause: None,
        }
    }

    pub fn failure_with_cause(message: impl Into<String>, cause: impl fmt::Display) -> Self {
        Outcome::Failure {
            message: message.into(),
            cause: Some(cause.to_string()),
        }
    }
}

/// What a reconciler or finalizer returns: the outcome, plus an optional self-scheduled retry.
#[derive(Debug, Clone)]
pub struct ReconciliationResult {
    pub outcome: Outcome,
    pub requeue_after: Option<Duration>,
}

impl ReconciliationResult {
    pub fn success() -> Self {
        Self {
            outcome: Outcome::Success,
            requeue_after: None,
        }
    }

    pub fn success_requeue_after(delay: Duration) -> Self {
        Self {
            outcome: Outcome::Success,
            requeue_after: Some(delay),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::failure(message),
            requeue_after: None,
        }
    }

    pub fn failure_requeue_after(message: impl Into<String>, delay: Duration) -> Self {
        Self {
            outcome: Outcome::failure(message),
            requeue_after: Some(delay),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// User reconciliation logic for one entity type.
///
/// `reconcile` is invoked for created/modified events that pass the generation gate; `deleted`
/// is invoked for `Deleted` events. Both must be idempotent: the core is at-least-once, not
/// exactly-once, across operator restarts.
#[async_trait]
pub trait Reconciler<K: KubeEntity>: Send + Sync {
    async fn reconcile(&self, entity: &K, cancellation: &CancellationToken) -> ReconciliationResult;

    async fn deleted(&self, entity: &K, cancellation: &CancellationToken) -> ReconciliationResult;
}

/// A single named finalizer, looked up by its registration identifier.
#[async_trait]
pub trait Finalizer<K: KubeEntity>: Send + Sync {
    async fn finalize(&self, entity: &K, cancellation: &CancellationToken) -> ReconciliationResult;
}

/// Derives a Kubernetes finalizer identifier from a registration key:
///
/// `"{group}/{name}"`, lowercased, truncated to 63 characters; if `name` does not already end
/// with `finalizer` (case-insensitive), the suffix `finalizer` is appended before truncation.
pub fn finalizer_identifier(group: &str, name: &str) -> String {
    const MAX_LEN: usize = 63;
    let mut name = name.to_string();
    if !name.to_lowercase().ends_with("finalizer") {
        name.push_str("finalizer");
    }
    let mut id = format!("{group}/{name}").to_lowercase();
    if id.len() > MAX_LEN {
        id.truncate(MAX_LEN);
    }
    id
}
