//! The structural contract the rest of the core uses to treat a Kubernetes object opaquely.
//!
//! The source this crate is modelled on constrains entities through a marker interface and
//! reaches for reflection to pull `uid`/`generation`/`finalizers` off of it. `kube`'s own
//! [`Resource`]/[`ResourceExt`] traits already expose exactly that shape, so [`KubeEntity`] is a
//! blanket trait over them rather than a hand-rolled accessor: any statically-typed CRD struct
//! (the common case — one Rust struct per registered `kind`) gets an implementation for free.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

/// A Kubernetes object as the dispatcher, watch loop and caches need to see it.
///
/// Implemented for any `K: Resource<DynamicType = ()> + ResourceExt + ...`, i.e. every
/// statically-typed, non-dynamic Kubernetes resource struct. The core never looks past these
/// fields; reconciler and finalizer bodies are free to work with the full `K`.
pub trait KubeEntity:
    Resource<DynamicType = ()>
    + ResourceExt
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + Unpin
    + 'static
{
    /// `.metadata.generation`, defaulting to `0` for objects that have never been persisted.
    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or(0)
    }

    /// `.metadata.generation` without a default applied, for call sites that need to pick
    /// their own fallback (the dispatcher uses `0` on create and `1` on modify).
    fn raw_generation(&self) -> Option<i64> {
        self.meta().generation
    }

    /// `.metadata.deletionTimestamp`, if the object is marked for deletion.
    fn deletion_timestamp(&self) -> Option<&Time> {
        self.meta().deletion_timestamp.as_ref()
    }

    /// `.metadata.uid`. Empty string for objects that have not yet been assigned one by the
    /// API server (should not occur for objects delivered over a watch).
    fn uid_or_empty(&self) -> String {
        ResourceExt::uid(self).unwrap_or_default()
    }

    /// `.metadata.finalizers`, in declaration order.
    fn finalizer_list(&self) -> &[String] {
        ResourceExt::finalizers(self)
    }

    /// `.metadata.resourceVersion`.
    fn resource_version_or_empty(&self) -> String {
        ResourceExt::resource_version(self).unwrap_or_default()
    }
}

impl<K> KubeEntity for K where
    K: Resource<DynamicType = ()>
        + ResourceExt
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + Unpin
        + 'static
{
}

/// A lightweight, typed-and-namespaced reference to an entity, used as a dispatcher/cache/queue
/// key without holding on to the whole object.
///
/// Grounded on `kube_runtime::reflector::ObjectRef`, simplified: the core only ever needs the
/// entity's `uid`, not full type erasure across dynamic kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub uid: String,
    pub name: String,
    pub namespace: Option<String>,
    pub kind: String,
}

impl EntityRef {
    pub fn from_entity<K: KubeEntity>(entity: &K) -> Self {
        Self {
            uid: entity.uid_or_empty(),
            name: entity.name_any(),
            namespace: entity.namespace(),
            kind: K::kind(&()).to_string(),
        }
    }
}
