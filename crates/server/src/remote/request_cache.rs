//! Time-bounded request de-duplication.
//!
//! The first `fetch` for a key inserts a pending entry and sends exactly one
//! request. Every later `fetch` for that key inside the window gets the same
//! pending handle (or, once a reply landed, the reply itself). When the
//! window elapses the entry is dropped, so the next `fetch` sends afresh:
//! a lost request is retried, never waited on forever.
//!
//! A reply of `None` ("the peer has nothing for this key") is a resolution,
//! distinct from timing out.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Default window for chunk and container requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
enum Slot<V> {
    Waiting,
    Done(Option<V>),
}

struct Entry<V> {
    created: Instant,
    slot: watch::Sender<Slot<V>>,
}

/// Result of a fetch.
pub enum Fetch<V> {
    /// A reply already arrived in this window.
    Ready(Option<V>),
    /// A request is outstanding.
    Pending(Pending<V>),
}

impl<V> Fetch<V> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Outcome of waiting on a [`Pending`] handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<V> {
    Resolved(Option<V>),
    TimedOut,
}

/// Handle to an outstanding request. Cheap to clone; every clone observes
/// the same resolution.
#[derive(Clone)]
pub struct Pending<V> {
    rx: watch::Receiver<Slot<V>>,
    deadline: Instant,
}

impl<V: Clone> Pending<V> {
    /// The reply, if it has arrived.
    pub fn try_get(&self) -> Option<Option<V>> {
        match &*self.rx.borrow() {
            Slot::Done(value) => Some(value.clone()),
            Slot::Waiting => None,
        }
    }

    /// Wait for the reply, but no longer than the request's window.
    pub async fn wait(mut self) -> WaitOutcome<V> {
        let deadline = tokio::time::Instant::from_std(self.deadline);
        let resolved = tokio::time::timeout_at(
            deadline,
            self.rx.wait_for(|slot| matches!(slot, Slot::Done(_))),
        )
        .await;
        match resolved {
            Ok(Ok(slot)) => match &*slot {
                Slot::Done(value) => WaitOutcome::Resolved(value.clone()),
                Slot::Waiting => WaitOutcome::TimedOut,
            },
            // Deadline passed, or the entry was purged.
            Ok(Err(_)) | Err(_) => WaitOutcome::TimedOut,
        }
    }
}

pub struct RequestCache<K, V> {
    timeout: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> RequestCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Look `key` up, calling `send` only when no live entry exists. `send`
    /// runs at most once per key per window and never under the cache lock.
    pub fn fetch_with(&self, key: &K, send: impl FnOnce(&K)) -> Fetch<V> {
        let now = Instant::now();
        let pending = {
            let mut entries = self.entries.lock().expect("request cache poisoned");
            if let Some(entry) = entries.get(key) {
                if now.duration_since(entry.created) < self.timeout {
                    return match &*entry.slot.borrow() {
                        Slot::Done(value) => Fetch::Ready(value.clone()),
                        Slot::Waiting => Fetch::Pending(Pending {
                            rx: entry.slot.subscribe(),
                            deadline: entry.created + self.timeout,
                        }),
                    };
                }
                entries.remove(key);
            }

            let (slot, rx) = watch::channel(Slot::Waiting);
            entries.insert(key.clone(), Entry { created: now, slot });
            Pending {
                rx,
                deadline: now + self.timeout,
            }
        };
        send(key);
        Fetch::Pending(pending)
    }

    /// Resolve the live pending entry for `key`. Returns `false` (and drops
    /// the value) when there is none: the reply is late, duplicated or
    /// unsolicited.
    pub fn complete(&self, key: &K, value: Option<V>) -> bool {
        self.complete_with(key, || value)
    }

    /// Like [`complete`](Self::complete), but only builds the value when a
    /// live pending entry is there to take it.
    pub fn complete_with(&self, key: &K, make: impl FnOnce() -> Option<V>) -> bool {
        let mut entries = self.entries.lock().expect("request cache poisoned");
        let Some(entry) = entries.get(key) else {
            return false;
        };
        if entry.created.elapsed() >= self.timeout {
            entries.remove(key);
            return false;
        }
        if matches!(*entry.slot.borrow(), Slot::Done(_)) {
            return false;
        }
        entry.slot.send_replace(Slot::Done(make()));
        true
    }

    /// Whether a request for `key` is outstanding right now.
    pub fn is_pending(&self, key: &K) -> bool {
        let entries = self.entries.lock().expect("request cache poisoned");
        entries.get(key).is_some_and(|e| {
            e.created.elapsed() < self.timeout && matches!(*e.slot.borrow(), Slot::Waiting)
        })
    }

    /// Drop expired entries. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("request cache poisoned");
        let before = entries.len();
        entries.retain(|_, e| e.created.elapsed() < self.timeout);
        before - entries.len()
    }

    /// Forget `key` immediately, resolved or not.
    pub fn invalidate(&self, key: &K) {
        self.entries
            .lock()
            .expect("request cache poisoned")
            .remove(key);
    }

    /// Live entries (pending or resolved), expired ones excluded.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().expect("request cache poisoned");
        entries
            .values()
            .filter(|e| e.created.elapsed() < self.timeout)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries held in memory, expired ones included.
    pub fn tracked(&self) -> usize {
        self.entries.lock().expect("request cache poisoned").len()
    }
}
