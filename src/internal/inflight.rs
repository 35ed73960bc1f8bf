//! In-flight construction tracking.
//!
//! Every instance cache (the process-wide singleton cache and each session's
//! request cache) is paired with a registry-wide [`Ledger`] that records which
//! resolution currently builds which name and which resolutions are parked
//! waiting for one. Concurrent first resolutions of the same name therefore
//! share a single factory invocation, and a waiter that would end up waiting
//! on itself through other tasks is refused instead of hanging.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::descriptors::AnyArc;

/// Identity of one `get` call that builds (or waits for) an instance.
pub(crate) type ClaimId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SlotKey {
    cache: u64,
    name: String,
}

/// Name → instance map; entries are never evicted or replaced.
pub(crate) struct InstanceCache {
    id: u64,
    ready: Mutex<HashMap<String, AnyArc>>,
}

impl InstanceCache {
    pub(crate) fn new() -> Self {
        Self {
            id: next_id(),
            ready: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<AnyArc> {
        self.ready.lock().get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.ready.lock().contains_key(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.ready.lock().len()
    }

    fn key(&self, name: &str) -> SlotKey {
        SlotKey {
            cache: self.id,
            name: name.to_string(),
        }
    }
}

struct Building {
    owner: ClaimId,
    notify: Arc<Notify>,
}

struct Waiting {
    ancestors: Vec<ClaimId>,
    on: SlotKey,
}

#[derive(Default)]
pub(crate) struct Ledger {
    building: HashMap<SlotKey, Building>,
    waiting: HashMap<ClaimId, Waiting>,
}

impl Ledger {
    /// Walks the wait-for graph from `owner`: the claims waiting underneath
    /// it, what they wait on, who builds that, and so on. Reaching one of the
    /// caller's ancestors means waiting would never finish.
    fn would_deadlock(&self, ancestors: &[ClaimId], owner: ClaimId) -> bool {
        let mut frontier = vec![owner];
        let mut seen = HashSet::new();
        while let Some(claim) = frontier.pop() {
            if !seen.insert(claim) {
                continue;
            }
            if ancestors.contains(&claim) {
                return true;
            }
            for waiting in self.waiting.values() {
                if waiting.ancestors.contains(&claim) {
                    if let Some(building) = self.building.get(&waiting.on) {
                        frontier.push(building.owner);
                    }
                }
            }
        }
        false
    }
}

/// Outcome of trying to claim a name in a cache.
pub(crate) enum Claim {
    /// Already built
    Ready(AnyArc),
    /// Caller must build it and call [`BuildGuard::finish`]
    Build(BuildGuard),
    /// Someone else is building it; wait for `notify` then retry
    Wait {
        notify: Arc<Notify>,
        guard: WaitGuard,
    },
    /// Waiting would close a cycle through other tasks
    Deadlock,
}

#[derive(Clone, Default)]
pub(crate) struct InFlight {
    ledger: Arc<Mutex<Ledger>>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn claim(
        &self,
        cache: &Arc<InstanceCache>,
        name: &str,
        me: ClaimId,
        ancestors: &[ClaimId],
    ) -> Claim {
        if let Some(value) = cache.get(name) {
            return Claim::Ready(value);
        }

        let key = cache.key(name);
        let mut ledger = self.ledger.lock();
        // Builders publish under the ledger lock, so this re-check is exact.
        if let Some(value) = cache.get(name) {
            return Claim::Ready(value);
        }

        let (owner, notify) = match ledger.building.get(&key) {
            Some(building) => (building.owner, Arc::clone(&building.notify)),
            None => {
                ledger.building.insert(
                    key.clone(),
                    Building {
                        owner: me,
                        notify: Arc::new(Notify::new()),
                    },
                );
                return Claim::Build(BuildGuard {
                    ledger: Arc::clone(&self.ledger),
                    cache: Arc::clone(cache),
                    key,
                    owner: me,
                    finished: false,
                });
            }
        };

        if ledger.would_deadlock(ancestors, owner) {
            return Claim::Deadlock;
        }

        ledger.waiting.insert(
            me,
            Waiting {
                ancestors: ancestors.to_vec(),
                on: key.clone(),
            },
        );
        Claim::Wait {
            notify,
            guard: WaitGuard {
                ledger: Arc::clone(&self.ledger),
                me,
                key,
                owner,
            },
        }
    }

    /// Number of constructions currently in progress, across all caches.
    pub(crate) fn building_count(&self) -> usize {
        self.ledger.lock().building.len()
    }

    /// Number of resolutions parked on someone else's construction.
    pub(crate) fn waiting_count(&self) -> usize {
        self.ledger.lock().waiting.len()
    }
}

/// Exclusive right to build one name in one cache.
///
/// Dropping it without [`finish`](Self::finish) (factory error, or the
/// resolving future being dropped) releases the claim and wakes waiters so
/// one of them can retry.
pub(crate) struct BuildGuard {
    ledger: Arc<Mutex<Ledger>>,
    cache: Arc<InstanceCache>,
    key: SlotKey,
    owner: ClaimId,
    finished: bool,
}

impl BuildGuard {
    pub(crate) fn finish(mut self, value: AnyArc) -> AnyArc {
        let (stored, notify) = {
            let mut ledger = self.ledger.lock();
            let stored = {
                let mut ready = self.cache.ready.lock();
                Arc::clone(ready.entry(self.key.name.clone()).or_insert(value))
            };
            (stored, self.release(&mut ledger))
        };
        self.finished = true;
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        stored
    }

    fn release(&self, ledger: &mut Ledger) -> Option<Arc<Notify>> {
        match ledger.building.get(&self.key) {
            Some(building) if building.owner == self.owner => {
                ledger.building.remove(&self.key).map(|building| building.notify)
            }
            _ => None,
        }
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let notify = {
            let mut ledger = self.ledger.lock();
            self.release(&mut ledger)
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

/// Registration of a parked resolution; removed from the ledger on drop.
pub(crate) struct WaitGuard {
    ledger: Arc<Mutex<Ledger>>,
    me: ClaimId,
    key: SlotKey,
    owner: ClaimId,
}

impl WaitGuard {
    /// True while the construction this guard waits on is still running.
    pub(crate) fn still_building(&self) -> bool {
        self.ledger
            .lock()
            .building
            .get(&self.key)
            .map_or(false, |building| building.owner == self.owner)
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.ledger.lock().waiting.remove(&self.me);
    }
}
