use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;

/// The outcome of a [`Waiter`] that was never resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the pending request was dropped before it was resolved")]
pub struct Abandoned;

/// The callers waiting on one in-flight request.
struct PendingGroup<V> {
    waiters: Vec<(u64, oneshot::Sender<V>)>,
}

struct Groups<K, V> {
    pending: HashMap<K, PendingGroup<V>>,
    next_waiter: u64,
}

type SharedGroups<K, V> = Arc<Mutex<Groups<K, V>>>;

/// Deduplicates concurrent requests for the same key.
///
/// The first caller to [`join`](Self::join) a key becomes the *leader* and is responsible for
/// running the actual request and calling [`resolve`](Self::resolve) with its outcome. Every
/// caller that joins while the request is in flight only waits. Resolving delivers one clone of
/// the outcome to every waiter, the leader included, and forgets the key: the next caller starts
/// a new request.
///
/// The lock is only held while updating the bookkeeping, never while the request runs.
pub struct Coalescer<K, V> {
    groups: SharedGroups<K, V>,
}

impl<K, V> fmt::Debug for Coalescer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self
            .groups
            .try_lock()
            .map(|g| g.pending.len())
            .unwrap_or_default();
        f.debug_struct("Coalescer")
            .field("pending", &pending)
            .finish()
    }
}

impl<K: Eq + Hash, V> Default for Coalescer<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The result of [`Coalescer::join`].
#[derive(Debug)]
pub struct Joined<K: Eq + Hash, V> {
    /// Whether this caller has to run the request.
    pub is_leader: bool,
    /// Receives the outcome once the request is resolved.
    pub waiter: Waiter<K, V>,
}

impl<K: Eq + Hash, V> Coalescer<K, V> {
    /// Creates an empty coalescer.
    pub fn new() -> Self {
        Self {
            groups: Arc::new(Mutex::new(Groups {
                pending: HashMap::new(),
                next_waiter: 0,
            })),
        }
    }

    /// Registers interest in the request identified by `key`.
    ///
    /// Returns `is_leader = true` if no request for `key` was in flight. The leader has to run
    /// the request and [`resolve`](Self::resolve) it. All other callers must not run it and
    /// only await their [`Waiter`].
    pub fn join(&self, key: K) -> Joined<K, V>
    where
        K: Clone,
    {
        let (sender, receiver) = oneshot::channel();

        let mut groups = self.groups.lock().unwrap();
        let id = groups.next_waiter;
        groups.next_waiter += 1;

        let is_leader = match groups.pending.get_mut(&key) {
            Some(group) => {
                group.waiters.push((id, sender));
                tracing::trace!(waiters = group.waiters.len(), "Joined pending request");
                false
            }
            None => {
                groups.pending.insert(
                    key.clone(),
                    PendingGroup {
                        waiters: vec![(id, sender)],
                    },
                );
                true
            }
        };
        drop(groups);

        let waiter = Waiter {
            key,
            id,
            receiver,
            groups: Arc::downgrade(&self.groups),
            finished: false,
        };
        Joined { is_leader, waiter }
    }

    /// Resolves the request identified by `key`, delivering `outcome` to all its waiters.
    ///
    /// The key is removed atomically, so callers joining afterwards start a new request.
    /// Returns the number of waiters that received the outcome, or `None` if no request was
    /// pending for `key`. The latter means the coalescer is being misused and is logged as an
    /// error.
    pub fn resolve(&self, key: &K, outcome: V) -> Option<usize>
    where
        V: Clone,
    {
        let group = self.groups.lock().unwrap().pending.remove(key);
        let Some(group) = group else {
            tracing::error!("Resolved a request that was not pending");
            return None;
        };

        let mut waiters = group.waiters;
        let last = waiters.pop();

        // A waiter that went away in the meantime does not matter.
        let mut delivered = 0;
        for (_, sender) in waiters {
            if sender.send(outcome.clone()).is_ok() {
                delivered += 1;
            }
        }
        if let Some((_, sender)) = last {
            if sender.send(outcome).is_ok() {
                delivered += 1;
            }
        }

        tracing::trace!(delivered, "Resolved pending request");
        Some(delivered)
    }

    /// The number of requests currently in flight.
    pub fn pending_count(&self) -> usize {
        self.groups.lock().unwrap().pending.len()
    }

    /// The number of callers waiting on the request for `key`.
    pub fn waiter_count(&self, key: &K) -> usize {
        self.groups
            .lock()
            .unwrap()
            .pending
            .get(key)
            .map_or(0, |group| group.waiters.len())
    }
}

/// Receives the outcome of a coalesced request exactly once.
///
/// A `Waiter` is a [`Future`], and can also be waited on from synchronous code with
/// [`blocking_wait`](Self::blocking_wait). Dropping it before the request resolves removes it
/// from the request's delivery list without affecting the other waiters or the request itself.
#[must_use = "a waiter does nothing unless awaited"]
pub struct Waiter<K: Eq + Hash, V> {
    key: K,
    id: u64,
    receiver: oneshot::Receiver<V>,
    groups: Weak<Mutex<Groups<K, V>>>,
    finished: bool,
}

impl<K: Eq + Hash + fmt::Debug, V> fmt::Debug for Waiter<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<K: Eq + Hash, V> Waiter<K, V> {
    /// The key of the request this waiter waits on.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Blocks the current thread until the outcome arrives.
    ///
    /// # Panics
    ///
    /// Panics when called within an asynchronous execution context.
    pub fn blocking_wait(mut self) -> Result<V, Abandoned> {
        let (_, closed) = oneshot::channel();
        let receiver = std::mem::replace(&mut self.receiver, closed);
        self.finished = true;
        receiver.blocking_recv().map_err(|_| Abandoned)
    }
}

impl<K: Eq + Hash + Unpin, V> Future for Waiter<K, V> {
    type Output = Result<V, Abandoned>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = std::task::ready!(Pin::new(&mut this.receiver).poll(cx));
        this.finished = true;
        Poll::Ready(result.map_err(|_| Abandoned))
    }
}

impl<K: Eq + Hash, V> Drop for Waiter<K, V> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // The coalescer is gone, and with it all the pending groups.
        let Some(groups) = self.groups.upgrade() else {
            return;
        };
        let mut groups = groups.lock().unwrap();
        if let Some(group) = groups.pending.get_mut(&self.key) {
            group.waiters.retain(|(id, _)| *id != self.id);
        }
    }
}
