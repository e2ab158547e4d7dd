//! Maintains a single logical watch subscription for one entity type, reconnecting through
//! transient failures.
//!
//! Grounded on `kube_runtime::watcher`'s state machine, generalised: our state is just
//! `(current_resource_version, reconnect_attempts)` rather than a three-state enum, because
//! the core's client facade already hides the list-then-watch sequencing (`resource_version =
//! None` means "start fresh" on the facade side). Error classification (410/504/benign/
//! other) follows the same branches `kube_runtime::utils::stream_backoff::StreamBackoff`
//! separates out into its own combinator, inlined here since the watch loop is already the
//! single place that owns reconnect state.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::{
    client::{ClientError, KubeClient, RawWatchEvent},
    dispatcher::Dispatcher,
    entity::KubeEntity,
    reconciler::TriggerSource,
    requeue_queue::RequeueQueue,
    selector::LabelSelectorResolver,
};

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const MAX_JITTER_MILLIS: u64 = 1000;

/// Runs one entity type's watch loop until `cancellation` fires.
///
/// Owns no state beyond what a single invocation needs; callers (the lifecycle host) spawn
/// one of these per registered entity type and hold the task handle.
pub struct WatchLoop<K: KubeEntity> {
    client: Arc<dyn KubeClient<K>>,
    dispatcher: Arc<Dispatcher<K>>,
    selector: Arc<dyn LabelSelectorResolver>,
    namespace: Option<String>,
}

impl<K: KubeEntity> WatchLoop<K> {
    pub fn new(
        client: Arc<dyn KubeClient<K>>,
        dispatcher: Arc<Dispatcher<K>>,
        selector: Arc<dyn LabelSelectorResolver>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            client,
            dispatcher,
            selector,
            namespace,
        }
    }

    /// Drives the watch loop until `cancellation` is triggered, consuming requeue entries
    /// from `requeue` interleaved with watch events (requeues never block on a reconnect in
    /// progress: both are polled from the same select loop).
    pub async fn run(&self, requeue: &mut std::pin::Pin<&mut RequeueQueue<K>>, cancellation: &CancellationToken) {
        let mut current_resource_version: Option<String> = None;
        let mut reconnect_attempts: u32 = 0;

        loop {
            if cancellation.is_cancelled() {
                info!("watch loop cancelled, exiting");
                return;
            }

            let selector = match self.selector.resolve().await {
                Ok(selector) => selector,
                Err(err) => {
                    warn!(error = %err, "failed to resolve label selector, backing off");
                    if self.sleep_with_backoff(&mut reconnect_attempts, cancellation).await {
                        return;
                    }
                    continue;
                }
            };
            let selector = if selector.is_empty() { None } else { Some(selector) };

            let stream = match self
                .client
                .watch(self.namespace.as_deref(), current_resource_version.as_deref(), selector.as_deref(), true)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    let fatal = self.handle_establish_error(&err, &mut current_resource_version);
                    if !fatal && self.sleep_with_backoff(&mut reconnect_attempts, cancellation).await {
                        return;
                    }
                    continue;
                }
            };
            let mut stream = std::pin::pin!(stream);

            loop {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        info!("watch loop cancelled, exiting");
                        return;
                    }
                    due = requeue.as_mut().drain().next() => {
                        let Some(due) = due else { return };
                        let _ = self.dispatch_requeue(due, cancellation).await;
                    }
                    item = stream.next() => {
                        match item {
                            Some(Ok(event)) => {
                                // A bare bookmark only advances the cursor; it isn't evidence
                                // user-relevant data is flowing, so it doesn't reset the backoff
                                // counter the way a dispatched Added/Modified/Deleted does.
                                if !matches!(event, RawWatchEvent::Bookmark { .. }) {
                                    reconnect_attempts = 0;
                                }
                                if let Some(rv) = self.handle_event(event, cancellation).await {
                                    current_resource_version = Some(rv);
                                }
                            }
                            Some(Err(err)) => {
                                let fatal = self.handle_stream_error(&err, &mut current_resource_version);
                                if fatal {
                                    break;
                                }
                                if self.sleep_with_backoff(&mut reconnect_attempts, cancellation).await {
                                    return;
                                }
                                break;
                            }
                            None => {
                                // Stream ended benignly (e.g. read past end of stream); the outer
                                // loop reconnects using the resource version we already have.
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Processes one event. Returns the new cursor for `Bookmark` events; `None` otherwise
    /// (the dispatcher path updates `currentResourceVersion` implicitly via its own state, so
    /// only bookmarks need to flow back up here).
    async fn handle_event(&self, event: RawWatchEvent<K>, cancellation: &CancellationToken) -> Option<String> {
        match event {
            RawWatchEvent::Bookmark { resource_version } => {
                info!(resource_version, "received bookmark");
                Some(resource_version)
            }
            RawWatchEvent::Added(entity) => {
                let span = info_span!("watch_event", event_type = "Added");
                self.dispatcher
                    .reconcile_creation(entity, TriggerSource::ApiServer, cancellation)
                    .instrument(span)
                    .await;
                None
            }
            RawWatchEvent::Modified(entity) => {
                let span = info_span!("watch_event", event_type = "Modified");
                self.dispatcher
                    .reconcile_modification(entity, TriggerSource::ApiServer, cancellation)
                    .instrument(span)
                    .await;
                None
            }
            RawWatchEvent::Deleted(entity) => {
                let span = info_span!("watch_event", event_type = "Deleted");
                self.dispatcher
                    .reconcile_deletion(entity, TriggerSource::ApiServer, cancellation)
                    .instrument(span)
                    .await;
                None
            }
        }
    }

    async fn dispatch_requeue(
        &self,
        due: crate::requeue_queue::RequeueEntry<K>,
        cancellation: &CancellationToken,
    ) -> crate::reconciler::ReconciliationResult {
        let entity = (*due.entity).clone();
        match due.kind {
            crate::requeue_queue::RequeueKind::Added => {
                self.dispatcher.reconcile_creation(entity, TriggerSource::Operator, cancellation).await
            }
            crate::requeue_queue::RequeueKind::Modified => {
                self.dispatcher.reconcile_modification(entity, TriggerSource::Operator, cancellation).await
            }
            crate::requeue_queue::RequeueKind::Deleted => {
                self.dispatcher.reconcile_deletion(entity, TriggerSource::Operator, cancellation).await
            }
        }
    }

    /// Classifies a failure to establish the watch the same way [`Self::handle_stream_error`]
    /// classifies one encountered mid-stream: 410 resets the cursor, 504 is left untouched, and
    /// both reconnect immediately; anything else falls through to the caller's backoff sleep.
    /// Returns `true` when the caller should skip the backoff sleep.
    fn handle_establish_error(&self, err: &ClientError, current_resource_version: &mut Option<String>) -> bool {
        match err.status_code() {
            Some(410) => {
                warn!("watch establishment returned 410 Gone, resetting resource version cursor");
                *current_resource_version = None;
                true
            }
            Some(504) => {
                warn!("watch establishment returned 504 Gateway Timeout, reconnecting");
                true
            }
            _ => {
                warn!(error = %err, "failed to establish watch");
                false
            }
        }
    }

    /// Returns `true` when the inner consumption loop should simply break (reconnect without
    /// sleeping) rather than fall through to backoff sleep.
    fn handle_stream_error(&self, err: &ClientError, current_resource_version: &mut Option<String>) -> bool {
        match err.status_code() {
            Some(410) => {
                warn!("watch stream returned 410 Gone, resetting resource version cursor");
                *current_resource_version = None;
                true
            }
            Some(504) => {
                warn!("watch stream returned 504 Gateway Timeout, reconnecting");
                true
            }
            _ => {
                warn!(error = %err, "watch stream failed");
                false
            }
        }
    }

    /// Sleeps `2^clamp(attempts, 0, 5)` seconds plus up to a second of jitter, incrementing
    /// `attempts` first. Returns `true` if cancellation fired during the sleep (caller should
    /// exit), `false` if the sleep completed normally.
    async fn sleep_with_backoff(&self, attempts: &mut u32, cancellation: &CancellationToken) -> bool {
        *attempts = (*attempts + 1).min(MAX_RECONNECT_ATTEMPTS);
        let base = Duration::from_secs(1u64 << (*attempts).min(MAX_RECONNECT_ATTEMPTS));
        let jitter = Duration::from_millis(rand::rng().random_range(0..MAX_JITTER_MILLIS));
        let delay = base + jitter;
        tokio::select! {
            _ = cancellation.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::OperatorConfig, generation_cache::LocalGenerationCache, reconciler::{Reconciler, ReconciliationResult},
        requeue_queue::requeue_queue, selector::StaticSelector,
    };
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn entity(uid: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                name: Some("cm".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct ScriptedClient {
        events: Mutex<Vec<RawWatchEvent<ConfigMap>>>,
    }

    #[async_trait]
    impl KubeClient<ConfigMap> for ScriptedClient {
        async fn watch(
            &self,
            _namespace: Option<&str>,
            _resource_version: Option<&str>,
            _label_selector: Option<&str>,
            _allow_bookmarks: bool,
        ) -> Result<BoxStream<'static, Result<RawWatchEvent<ConfigMap>, ClientError>>, ClientError> {
            let events = std::mem::take(&mut *self.events.lock());
            // Never terminates: a real watch only ends on error or disconnect, both modelled
            // separately. A terminating stream here would make the loop reconnect in a tight
            // spin with nothing left to yield, starving the paused clock in tests.
            Ok(stream::iter(events.into_iter().map(Ok)).chain(stream::pending()).boxed())
        }

        async fn update(&self, entity: &ConfigMap) -> Result<ConfigMap, ClientError> {
            Ok(entity.clone())
        }

        async fn get(&self, _name: &str, _namespace: Option<&str>) -> Result<Option<ConfigMap>, ClientError> {
            Ok(None)
        }
    }

    struct CountingReconciler {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Reconciler<ConfigMap> for CountingReconciler {
        async fn reconcile(&self, _entity: &ConfigMap, _c: &CancellationToken) -> ReconciliationResult {
            *self.calls.lock() += 1;
            ReconciliationResult::success()
        }

        async fn deleted(&self, _entity: &ConfigMap, _c: &CancellationToken) -> ReconciliationResult {
            ReconciliationResult::success()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn processes_events_then_exits_on_cancellation() {
        let client: Arc<dyn KubeClient<ConfigMap>> = Arc::new(ScriptedClient {
            events: Mutex::new(vec![RawWatchEvent::Added(entity("u1"))]),
        });
        let reconciler = Arc::new(CountingReconciler { calls: Mutex::new(0) });
        let (handle, queue) = requeue_queue::<ConfigMap>();
        let mut queue = std::pin::pin!(queue);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(LocalGenerationCache::new()),
            handle,
            client.clone(),
            reconciler.clone(),
            HashMap::new(),
            &OperatorConfig::default(),
        ));
        let watch_loop = WatchLoop::new(client, dispatcher, Arc::new(StaticSelector::none()), None);
        let cancellation = CancellationToken::new();
        let canceller = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        watch_loop.run(&mut queue, &cancellation).await;
        assert_eq!(*reconciler.calls.lock(), 1);
    }

    /// A client that records the `resource_version` it was asked to watch from on every call:
    /// the first connect yields a bookmark advancing the cursor then ends benignly, the second
    /// connect yields a single 410, and every connect after that goes idle.
    struct GoneOnSecondConnectClient {
        seen_resource_versions: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl KubeClient<ConfigMap> for GoneOnSecondConnectClient {
        async fn watch(
            &self,
            _namespace: Option<&str>,
            resource_version: Option<&str>,
            _label_selector: Option<&str>,
            _allow_bookmarks: bool,
        ) -> Result<BoxStream<'static, Result<RawWatchEvent<ConfigMap>, ClientError>>, ClientError> {
            let mut seen = self.seen_resource_versions.lock();
            let call_number = seen.len();
            seen.push(resource_version.map(str::to_string));
            drop(seen);

            match call_number {
                0 => Ok(stream::once(async {
                    Ok(RawWatchEvent::Bookmark {
                        resource_version: "v123".to_string(),
                    })
                })
                .boxed()),
                1 => Ok(stream::once(async {
                    Err(ClientError::Api {
                        code: 410,
                        message: "Gone".to_string(),
                    })
                })
                .boxed()),
                _ => Ok(stream::pending().boxed()),
            }
        }

        async fn update(&self, entity: &ConfigMap) -> Result<ConfigMap, ClientError> {
            Ok(entity.clone())
        }

        async fn get(&self, _name: &str, _namespace: Option<&str>) -> Result<Option<ConfigMap>, ClientError> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn s4_410_gone_resets_cursor_and_reconnects_without_callbacks() {
        let concrete = Arc::new(GoneOnSecondConnectClient {
            seen_resource_versions: Mutex::new(Vec::new()),
        });
        let client: Arc<dyn KubeClient<ConfigMap>> = concrete.clone();
        let reconciler = Arc::new(CountingReconciler { calls: Mutex::new(0) });
        let (handle, queue) = requeue_queue::<ConfigMap>();
        let mut queue = std::pin::pin!(queue);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(LocalGenerationCache::new()),
            handle,
            client.clone(),
            reconciler.clone(),
            HashMap::new(),
            &OperatorConfig::default(),
        ));
        let watch_loop = WatchLoop::new(client, dispatcher, Arc::new(StaticSelector::none()), None);
        let cancellation = CancellationToken::new();
        let canceller = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        watch_loop.run(&mut queue, &cancellation).await;

        let seen = concrete.seen_resource_versions.lock();
        assert!(seen.len() >= 3, "expected two reconnects after the bookmark and the 410, got {seen:?}");
        assert_eq!(seen[0], None, "first connect has no cursor yet");
        assert_eq!(seen[1], Some("v123".to_string()), "bookmark must advance the cursor before the next connect");
        assert_eq!(seen[2], None, "410 must reset the cursor before reconnecting");
        drop(seen);
        assert_eq!(*reconciler.calls.lock(), 0, "neither a bookmark nor a 410 reaches the dispatcher");
    }
}
