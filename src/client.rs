//! The narrow interface the core uses against the API server: typed `watch`, `update`,
//! `get`. The Kubernetes REST/watch transport itself is out of scope — this module
//! defines the facade trait and ships exactly one concrete adapter, over `kube::Api`, which
//! performs no retry/backoff logic of its own. All of that stays in the watch loop and
//! dispatcher.

use crate::entity::KubeEntity;
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, WatchEvent as KubeWatchEvent, WatchParams},
    Client,
};
use thiserror::Error;

/// Mirrors `kube_runtime`'s own per-module `thiserror` error types (`watcher::Error`,
/// `finalizer::Error`, `lease::*Error`).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The API server responded with a structured error, carrying the HTTP status code 410
    /// Gone/504 Gateway Timeout watching relies on to classify reconnects.
    #[error("API server returned {code}: {message}")]
    Api { code: u16, message: String },
    /// A connection-level failure with no associated HTTP status (DNS, TLS, transport).
    #[error("client transport error: {0}")]
    Transport(#[from] kube::Error),
}

impl ClientError {
    /// HTTP status code, when the failure came back from the API server (e.g. 410 Gone, 504
    /// Gateway Timeout). `None` for connection-level failures.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Api { code, .. } => Some(*code),
            ClientError::Transport(kube::Error::Api(resp)) => Some(resp.code),
            ClientError::Transport(_) => None,
        }
    }
}

/// A single event off the watch stream, already untagged from `kube`'s representation into the
/// shape the dispatcher expects.
pub enum RawWatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Carries only a fresh resource version; never forwarded to user code.
    Bookmark { resource_version: String },
}

/// The Kubernetes Client Facade: `watch`, `update`, `get`, keyed on a single registered
/// entity type `K`.
#[async_trait]
pub trait KubeClient<K: KubeEntity>: Send + Sync {
    /// Opens a watch. `resource_version = None` means "start fresh" (full re-list semantics).
    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
        allow_bookmarks: bool,
    ) -> Result<BoxStream<'static, Result<RawWatchEvent<K>, ClientError>>, ClientError>;

    /// Persists `entity` (used for finalizer attach/detach edits).
    async fn update(&self, entity: &K) -> Result<K, ClientError>;

    /// Looks up a single object by name; `None` if it does not exist.
    async fn get(&self, name: &str, namespace: Option<&str>) -> Result<Option<K>, ClientError>;
}

/// The core's sole concrete [`KubeClient`]: a thin adapter over `kube::Api<K>`.
pub struct KubeClientFacade<K> {
    client: Client,
    _marker: std::marker::PhantomData<K>,
}

impl<K> KubeClientFacade<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _marker: std::marker::PhantomData,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<K>
    where
        K: kube::Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl<K: KubeEntity> KubeClient<K> for KubeClientFacade<K> {
    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
        allow_bookmarks: bool,
    ) -> Result<BoxStream<'static, Result<RawWatchEvent<K>, ClientError>>, ClientError> {
        let mut params = WatchParams::default();
        if allow_bookmarks {
            params = params.bookmarks();
        }
        if let Some(selector) = label_selector {
            if !selector.is_empty() {
                params = params.labels(selector);
            }
        }
        let rv = resource_version.unwrap_or("0");
        let stream = self.api(namespace).watch(&params, rv).await?;
        // kube's WatchEvent::Error carries an ErrorResponse inline rather than as a stream Err,
        // so it is translated into our Result<_, ClientError> shape explicitly here.
        let translated = stream.map(|item| match item {
            Ok(KubeWatchEvent::Added(obj)) => Ok(RawWatchEvent::Added(obj)),
            Ok(KubeWatchEvent::Modified(obj)) => Ok(RawWatchEvent::Modified(obj)),
            Ok(KubeWatchEvent::Deleted(obj)) => Ok(RawWatchEvent::Deleted(obj)),
            Ok(KubeWatchEvent::Bookmark(bm)) => Ok(RawWatchEvent::Bookmark {
                resource_version: bm.metadata.resource_version,
            }),
            Ok(KubeWatchEvent::Error(err)) => Err(ClientError::Api {
                code: err.code,
                message: err.message,
            }),
            Err(err) => Err(ClientError::from(err)),
        });
        Ok(translated.boxed())
    }

    async fn update(&self, entity: &K) -> Result<K, ClientError> {
        let namespace = entity.namespace();
        let name = entity.name_any();
        let patch = Patch::Merge(serde_json::json!({
            "metadata": { "finalizers": entity.finalizer_list() }
        }));
        let updated = self
            .api(namespace.as_deref())
            .patch(&name, &PatchParams::default(), &patch)
            .await?;
        Ok(updated)
    }

    async fn get(&self, name: &str, namespace: Option<&str>) -> Result<Option<K>, ClientError> {
        match self.api(namespace).get_opt(name).await {
            Ok(obj) => Ok(obj),
            Err(err) => Err(ClientError::from(err)),
        }
    }
}

/// Re-exported so callers constructing an initial watch don't need `kube::api::ListParams`
/// directly.
pub type ListOptions = ListParams;
