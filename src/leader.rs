//! Gates watch loop startup on holding a `coordination.k8s.io/v1` `Lease`.
//!
//! Grounded on `kube_runtime::lease::Elector`: the optimistic acquire/renew state machine
//! (`LeaseState::{Unheld,HeldByOther,HeldBySelf}`, renew at half the lease duration, treat an
//! expired holder as acquirable) is carried over unchanged. What changes is the driving loop:
//! `kube_runtime::lease::Elector` drives itself off a `watch_object` stream of the `Lease`
//! itself and a set of `future::select`-spliced timers; this gate instead polls on a fixed
//! interval and publishes the result on a `tokio::sync::watch` channel, since the rest of the
//! core already has a polling-free design everywhere else and a dedicated `Lease` watch stream
//! would be the only place needing one.

use std::time::Duration;

use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
    chrono::{DateTime, Utc},
};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    Client,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Published on the leadership channel so dependent watch loops know when to start and stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Follower,
    Leader,
}

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("failed to read lease: {0}")]
    Get(#[source] kube::Error),
    #[error("failed to persist lease: {0}")]
    Commit(#[source] kube::Error),
}

#[derive(Debug, PartialEq, Eq)]
enum LeaseState {
    Unheld,
    HeldByOther { holder: String, expires_at: DateTime<Utc> },
    HeldBySelf { renew_at: DateTime<Utc>, expires_at: DateTime<Utc> },
}

/// Polls a single `Lease` object, attempting acquisition/renewal, and republishes
/// [`LeadershipState`] on every observed transition.
pub struct LeaderGate {
    client: Client,
    namespace: String,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    state_tx: watch::Sender<LeadershipState>,
}

impl LeaderGate {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        lease_name: impl Into<String>,
        identity: impl Into<String>,
        lease_duration: Duration,
    ) -> (Self, watch::Receiver<LeadershipState>) {
        let (state_tx, state_rx) = watch::channel(LeadershipState::Follower);
        (
            Self {
                client,
                namespace: namespace.into(),
                lease_name: lease_name.into(),
                identity: identity.into(),
                lease_duration,
                state_tx,
            },
            state_rx,
        )
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Runs the acquire/renew loop until `cancellation` fires, at which point a held lease is
    /// released and [`LeadershipState::Follower`] is published one last time.
    pub async fn run(&self, cancellation: &CancellationToken) {
        let poll_interval = self.lease_duration / 2;
        loop {
            match self.try_acquire_or_renew().await {
                Ok(state) => {
                    let new_state = match state {
                        LeaseState::HeldBySelf { .. } => LeadershipState::Leader,
                        _ => LeadershipState::Follower,
                    };
                    if *self.state_tx.borrow() != new_state {
                        info!(?new_state, "leadership state changed");
                    }
                    let _ = self.state_tx.send(new_state);
                }
                Err(err) => {
                    warn!(error = %err, "leader election tick failed");
                    let _ = self.state_tx.send(LeadershipState::Follower);
                }
            }

            tokio::select! {
                _ = cancellation.cancelled() => {
                    self.release_on_shutdown().await;
                    let _ = self.state_tx.send(LeadershipState::Follower);
                    return;
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<LeaseState, LeaderError> {
        let api = self.api();
        let now = Utc::now();
        let existing = api.get_opt(&self.lease_name).await.map_err(LeaderError::Get)?;
        let mut lease = existing.unwrap_or_else(|| Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: None,
        });
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        let state = self.state(spec, now);

        if let LeaseState::HeldByOther { ref holder, expires_at } = state {
            if expires_at > now {
                debug!(%holder, %expires_at, "lease held by another instance, not yet expired");
                return Ok(state);
            }
        }

        if !matches!(state, LeaseState::HeldBySelf { .. }) {
            spec.holder_identity = Some(self.identity.clone());
            spec.acquire_time = Some(MicroTime(now));
            *spec.lease_transitions.get_or_insert(0) += 1;
        }
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(self.lease_duration.as_secs() as i32);

        let patch = Patch::Apply(&lease);
        let params = PatchParams::apply("operator-runtime-leader-gate").force();
        let committed = api
            .patch(&self.lease_name, &params, &patch)
            .await
            .map_err(LeaderError::Commit)?;
        let committed_spec = committed.spec.unwrap_or_default();
        Ok(self.state(&committed_spec, now))
    }

    async fn release_on_shutdown(&self) {
        if *self.state_tx.borrow() != LeadershipState::Leader {
            return;
        }
        let api = self.api();
        let now = Utc::now();
        if let Ok(Some(mut lease)) = api.get_opt(&self.lease_name).await {
            if let Some(spec) = lease.spec.as_mut() {
                if matches!(self.state(spec, now), LeaseState::HeldBySelf { .. }) {
                    spec.holder_identity = None;
                    spec.acquire_time = None;
                    spec.renew_time = None;
                    *spec.lease_transitions.get_or_insert(0) += 1;
                    let patch = Patch::Apply(&lease);
                    let params = PatchParams::apply("operator-runtime-leader-gate").force();
                    let _ = api.patch(&self.lease_name, &params, &patch).await;
                }
            }
        }
    }

    fn state(&self, lease: &LeaseSpec, now: DateTime<Utc>) -> LeaseState {
        let lease_duration = k8s_openapi::chrono::Duration::seconds(lease.lease_duration_seconds.unwrap_or(0).into());
        let last_renewal = lease.renew_time.as_ref().map_or(DateTime::<Utc>::MIN_UTC, |t| t.0);
        match &lease.holder_identity {
            None => LeaseState::Unheld,
            Some(holder) if holder == &self.identity => LeaseState::HeldBySelf {
                renew_at: last_renewal + lease_duration / 2,
                expires_at: last_renewal + lease_duration,
            },
            Some(holder) => LeaseState::HeldByOther {
                holder: holder.clone(),
                expires_at: last_renewal + lease_duration,
            },
        }
    }
}
