//! Schedules delayed re-delivery of entities back through the dispatcher.
//!
//! Grounded directly on `kube-runtime::scheduler`: a `tokio_util::time::DelayQueue` holding the
//! due times, plus a `hashbrown::HashMap` tracking one entry per key so a second `enqueue` for
//! the same `uid` replaces rather than duplicates the first. Unlike the scheduler (which
//! dedupes an opaque `T: Hash + Eq`), our queue is keyed explicitly by `uid` so it can carry a
//! `requeue_kind` and the entity snapshot alongside it.
//!
//! The queue is split into a cheaply-cloneable [`RequeueQueueHandle`] (for `enqueue`/`remove`
//! callers — the watch loop and dispatcher) and a single-consumer [`RequeueQueue`] stream (for
//! `drain`, owned by exactly one task, mirroring the scheduler's `requests: R` / `Stream`
//! split).

use futures::{Stream, StreamExt};
use hashbrown::HashMap;
use std::{
    fmt::Debug,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::entity::KubeEntity;

/// Which dispatcher path re-delivery should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueKind {
    Added,
    Modified,
    Deleted,
}

/// A due requeue, as yielded by [`RequeueQueue::drain`].
#[derive(Debug, Clone)]
pub struct RequeueEntry<K> {
    pub entity: Arc<K>,
    pub kind: RequeueKind,
}

enum Command<K> {
    Enqueue {
        uid: String,
        kind: RequeueKind,
        entity: Arc<K>,
        delay: Duration,
    },
    Remove {
        uid: String,
    },
}

/// Cheaply-cloneable handle used to `enqueue`/`remove` pending requeues.
#[derive(Clone)]
pub struct RequeueQueueHandle<K> {
    commands: mpsc::UnboundedSender<Command<K>>,
}

impl<K: KubeEntity> RequeueQueueHandle<K> {
    /// Schedule `entity` for re-delivery at `now + delay`. Replaces any pending entry already
    /// queued for `entity`'s `uid`.
    pub fn enqueue(&self, entity: Arc<K>, kind: RequeueKind, delay: Duration) {
        let uid = entity.uid_or_empty();
        // Closed receiver means the queue has been disposed; enqueuing is then a silent no-op,
        // matching "cancellation during shutdown unwinds cleanly" rather than panicking.
        let _ = self.commands.send(Command::Enqueue {
            uid,
            kind,
            entity,
            delay,
        });
    }

    /// Drop any pending entry for `entity`'s `uid`. Idempotent.
    pub fn remove(&self, entity: &K) {
        let uid = entity.uid_or_empty();
        let _ = self.commands.send(Command::Remove { uid });
    }
}

struct ScheduledEntry<K> {
    queue_key: delay_queue::Key,
    kind: RequeueKind,
    entity: Arc<K>,
}

/// Single-consumer stream of due [`RequeueEntry`] values. Owned by the watch loop (or
/// lifecycle host) that feeds drained entries back into the dispatcher.
pub struct RequeueQueue<K> {
    queue: DelayQueue<String>,
    scheduled: HashMap<String, ScheduledEntry<K>>,
    commands: mpsc::UnboundedReceiver<Command<K>>,
}

/// Constructs a linked handle/queue pair. `enqueue`/`remove` on the handle feed the returned
/// queue, whose [`RequeueQueue::drain`] never terminates until every handle is dropped.
pub fn requeue_queue<K: KubeEntity>() -> (RequeueQueueHandle<K>, RequeueQueue<K>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RequeueQueueHandle { commands: tx },
        RequeueQueue {
            queue: DelayQueue::new(),
            scheduled: HashMap::new(),
            commands: rx,
        },
    )
}

impl<K> RequeueQueue<K> {
    fn apply_command(&mut self, command: Command<K>) {
        match command {
            Command::Enqueue {
                uid,
                kind,
                entity,
                delay,
            } => {
                // A fresh entry for an already-queued uid replaces it outright: the old
                // delay_queue::Key is invalidated by `reset` rather than leaving a stale slot.
                if let Some(existing) = self.scheduled.get_mut(&uid) {
                    self.queue.reset(&existing.queue_key, delay);
                    existing.kind = kind;
                    existing.entity = entity;
                } else {
                    let queue_key = self.queue.insert(uid.clone(), delay);
                    self.scheduled.insert(uid, ScheduledEntry { queue_key, kind, entity });
                }
            }
            Command::Remove { uid } => {
                if let Some(existing) = self.scheduled.remove(&uid) {
                    self.queue.remove(&existing.queue_key);
                }
            }
        }
    }

    /// An async sequence of entities whose delay has expired, oldest due time first.
    pub fn drain(self: Pin<&mut Self>) -> Drain<'_, K> {
        Drain { inner: self }
    }
}

/// Stream returned by [`RequeueQueue::drain`].
pub struct Drain<'a, K> {
    inner: Pin<&'a mut RequeueQueue<K>>,
}

impl<'a, K: Unpin> Stream for Drain<'a, K> {
    type Item = RequeueEntry<K>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.inner.as_mut().get_mut();
        loop {
            match Pin::new(&mut this.commands).poll_recv(cx) {
                Poll::Ready(Some(command)) => this.apply_command(command),
                Poll::Ready(None) if this.scheduled.is_empty() => return Poll::Ready(None),
                Poll::Ready(None) | Poll::Pending => break,
            }
        }

        match this.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let uid = expired.into_inner();
                let entry = this
                    .scheduled
                    .remove(&uid)
                    .expect("expired uid was popped from the queue but missing from the metadata map");
                Poll::Ready(Some(RequeueEntry {
                    entity: entry.entity,
                    kind: entry.kind,
                }))
            }
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

/// Due time helper: `Instant::now() + delay`, named so call sites read like `dueAt = now +
/// delay`.
pub fn due_at(delay: Duration) -> Instant {
    Instant::now() + delay
}
