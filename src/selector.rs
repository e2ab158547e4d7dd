//! Produces the label selector string applied to a watch subscription.
//!
//! Resolution happens once per (re)connect, so a resolver backed by e.g. a feature-flag
//! service or a ConfigMap can rotate the selector across reconnects without restarting the
//! watch loop itself.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to resolve label selector: {0}")]
pub struct SelectorError(pub String);

/// Resolves the label selector used on the watch. Errors propagate to the watch loop and
/// trigger reconnect backoff, same as any other watch-establishment failure.
#[async_trait]
pub trait LabelSelectorResolver: Send + Sync {
    async fn resolve(&self) -> Result<String, SelectorError>;
}

/// A resolver that always returns the same, fixed selector. The common case: most operators
/// watch a single static label selector (or none at all).
pub struct StaticSelector(String);

impl StaticSelector {
    pub fn new(selector: impl Into<String>) -> Self {
        Self(selector.into())
    }

    /// No selector: the watch matches every object of the type, within the configured namespace.
    pub fn none() -> Self {
        Self(String::new())
    }
}

#[async_trait]
impl LabelSelectorResolver for StaticSelector {
    async fn resolve(&self) -> Result<String, SelectorError> {
        Ok(self.0.clone())
    }
}
