//! Starts and stops one watch loop per registered entity type, optionally gated on leader
//! election.
//!
//! Each registered entity type is wrapped behind a type-erased [`RegisteredWatcher`] so the
//! host can hold a single homogeneous `Vec` across however many CRD types an embedding binary
//! registers — the same motivation as `kube_runtime::Controller`'s internal use of boxed
//! futures to run heterogeneous reconcilers side by side, generalised here to a trait object
//! since each entity type additionally needs its own persistent [`RequeueQueue`].

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    client::KubeClient,
    config::OperatorConfig,
    dispatcher::Dispatcher,
    entity::KubeEntity,
    generation_cache::GenerationCache,
    leader::{LeaderGate, LeadershipState},
    reconciler::{Finalizer, Reconciler},
    requeue_queue::{requeue_queue, RequeueQueue},
    selector::LabelSelectorResolver,
};

#[async_trait]
trait RegisteredWatcher: Send + Sync {
    async fn run(&self, cancellation: CancellationToken);
}

struct TypedWatcher<K: KubeEntity> {
    watch_loop: crate::watcher::WatchLoop<K>,
    queue: AsyncMutex<std::pin::Pin<Box<RequeueQueue<K>>>>,
}

#[async_trait]
impl<K: KubeEntity> RegisteredWatcher for TypedWatcher<K> {
    async fn run(&self, cancellation: CancellationToken) {
        let mut queue = self.queue.lock().await;
        let mut queue_ref = queue.as_mut();
        self.watch_loop.run(&mut queue_ref, &cancellation).await;
    }
}

/// Builder handed one entity-type registration at a time before [`LifecycleHost::start`].
pub struct LifecycleHostBuilder {
    config: OperatorConfig,
    watchers: Vec<Arc<dyn RegisteredWatcher>>,
    kube_client: Option<kube::Client>,
}

impl LifecycleHostBuilder {
    pub fn new(config: OperatorConfig) -> Self {
        Self {
            config,
            watchers: Vec::new(),
            kube_client: None,
        }
    }

    /// Required when `config.enable_leader_election` is set: the raw `kube::Client` the
    /// [`LeaderGate`] uses against the `Lease` API, independent of any registered entity
    /// type's [`KubeClient`] facade.
    pub fn with_kube_client(mut self, client: kube::Client) -> Self {
        self.kube_client = Some(client);
        self
    }

    /// Registers a watch loop for entity type `K`. Can be called once per distinct `K`.
    pub fn register<K: KubeEntity>(
        mut self,
        client: Arc<dyn KubeClient<K>>,
        reconciler: Arc<dyn Reconciler<K>>,
        finalizers: HashMap<String, Arc<dyn Finalizer<K>>>,
        selector: Arc<dyn LabelSelectorResolver>,
        cache: Arc<dyn GenerationCache>,
    ) -> Self {
        let (handle, queue) = requeue_queue::<K>();
        let dispatcher = Arc::new(Dispatcher::new(cache, handle, client.clone(), reconciler, finalizers, &self.config));
        let watch_loop = crate::watcher::WatchLoop::new(client, dispatcher, selector, self.config.namespace.clone());
        self.watchers.push(Arc::new(TypedWatcher {
            watch_loop,
            queue: AsyncMutex::new(Box::pin(queue)),
        }));
        self
    }

    pub fn build(self) -> LifecycleHost {
        LifecycleHost {
            config: self.config,
            watchers: self.watchers,
            kube_client: self.kube_client,
            cancellation: CancellationToken::new(),
            supervisor: AsyncMutex::new(None),
        }
    }
}

/// Owns the running state of every registered watch loop. `start` is non-blocking; `shutdown`
/// cancels, awaits completion, and is safe to call more than once.
pub struct LifecycleHost {
    config: OperatorConfig,
    watchers: Vec<Arc<dyn RegisteredWatcher>>,
    kube_client: Option<kube::Client>,
    cancellation: CancellationToken,
    supervisor: AsyncMutex<Option<JoinHandle<()>>>,
}

impl LifecycleHost {
    /// Launches the background supervisory task and returns immediately.
    pub async fn start(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            warn!("start called more than once, ignoring");
            return;
        }

        let watchers = self.watchers.clone();
        let cancellation = self.cancellation.clone();

        let handle = if self.config.enable_leader_election {
            let client = self
                .kube_client
                .clone()
                .expect("kube_client must be set when leader election is enabled");
            let lease_name = self
                .config
                .lease_name
                .clone()
                .expect("lease_name must be set when leader election is enabled");
            let namespace = self.config.namespace.clone().unwrap_or_else(|| "default".to_string());
            let identity = std::env::var("HOSTNAME").unwrap_or_else(|_| uuid_like_identity());
            let (gate, rx) = LeaderGate::new(client, namespace, lease_name, identity, self.config.lease_duration);
            let gate = Arc::new(gate);

            tokio::spawn(run_with_leader_election(gate, rx, watchers, cancellation))
        } else {
            tokio::spawn(run_unconditionally(watchers, cancellation))
        };

        *supervisor = Some(handle);
    }

    /// Cancels every running watch loop, drains any in-flight event, and releases resources.
    /// Idempotent: a second call is a no-op.
    pub async fn shutdown(&self) {
        self.cancellation.cancel();
        let mut supervisor = self.supervisor.lock().await;
        if let Some(handle) = supervisor.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "lifecycle supervisor task panicked during shutdown");
            }
        }
    }
}

async fn run_unconditionally(watchers: Vec<Arc<dyn RegisteredWatcher>>, cancellation: CancellationToken) {
    let handles: Vec<_> = watchers
        .into_iter()
        .map(|w| {
            let cancellation = cancellation.clone();
            tokio::spawn(async move { w.run(cancellation).await })
        })
        .collect();
    for handle in handles {
        let _ = handle.await;
    }
}

async fn run_with_leader_election(
    gate: Arc<LeaderGate>,
    leadership: tokio::sync::watch::Receiver<LeadershipState>,
    watchers: Vec<Arc<dyn RegisteredWatcher>>,
    cancellation: CancellationToken,
) {
    let gate_task = {
        let cancellation = cancellation.clone();
        tokio::spawn(async move { gate.run(&cancellation).await })
    };

    react_to_leadership(leadership, watchers, cancellation).await;

    let _ = gate_task.await;
}

/// Starts/stops the registered watchers in lockstep with `leadership` transitions, independent
/// of whatever drives the channel (the real [`LeaderGate`] in production, a bare `watch::Sender`
/// in tests). Returns once `cancellation` fires or the sender end of `leadership` is dropped.
async fn react_to_leadership(
    mut leadership: tokio::sync::watch::Receiver<LeadershipState>,
    watchers: Vec<Arc<dyn RegisteredWatcher>>,
    cancellation: CancellationToken,
) {
    let mut active: Option<(CancellationToken, Vec<JoinHandle<()>>)> = None;
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                if let Some((scope, handles)) = active.take() {
                    scope.cancel();
                    for handle in handles {
                        let _ = handle.await;
                    }
                }
                break;
            }
            changed = leadership.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *leadership.borrow_and_update();
                match state {
                    LeadershipState::Leader if active.is_none() => {
                        info!("acquired leadership, starting watch loops");
                        let scope = cancellation.child_token();
                        let handles = watchers
                            .iter()
                            .map(|w| {
                                let w = w.clone();
                                let scope = scope.clone();
                                tokio::spawn(async move { w.run(scope).await })
                            })
                            .collect();
                        active = Some((scope, handles));
                    }
                    LeadershipState::Follower => {
                        if let Some((scope, handles)) = active.take() {
                            info!("lost leadership, stopping watch loops");
                            scope.cancel();
                            for handle in handles {
                                let _ = handle.await;
                            }
                        }
                    }
                    LeadershipState::Leader => {}
                }
            }
        }
    }
}

/// Stand-in identity source when `HOSTNAME` is unset (e.g. outside a pod's container runtime).
/// Production deployments always set `HOSTNAME`; this only prevents a hard crash in unusual
/// environments.
fn uuid_like_identity() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    format!("operator-runtime-{nanos:x}")
}
