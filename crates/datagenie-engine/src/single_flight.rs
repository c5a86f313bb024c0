//! At most one in-flight computation per key
//!
//! The first caller for a key becomes the leader and its future is wrapped in
//! a [`Shared`]; later callers for the same key await a clone of it. The map
//! only keeps a weak handle and a waiter count, so when every waiter has gone
//! away the slot is released and the inner future is dropped with the last
//! clone.

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

type Flight<V> = Shared<BoxFuture<'static, V>>;

struct Slot<V: Clone> {
    id: u64,
    handle: WeakShared<BoxFuture<'static, V>>,
    waiters: usize,
}

pub struct SingleFlight<K, V>
where
    V: Clone,
{
    inflight: Mutex<HashMap<K, Slot<V>>>,
    next_id: AtomicU64,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `start()` unless a computation for `key` is already in flight, in
    /// which case its result is awaited instead. Returns the value and whether
    /// this caller started the computation.
    pub async fn run<F>(&self, key: K, start: F) -> (V, bool)
    where
        F: FnOnce() -> BoxFuture<'static, V>,
    {
        let (flight, id, leader) = self.join_or_start(&key, start);

        let mut guard = SlotGuard {
            owner: self,
            key,
            id,
            completed: false,
        };

        let value = flight.await;
        guard.completed = true;
        (value, leader)
    }

    /// Number of keys with a live computation
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .values()
            .filter(|slot| slot.handle.upgrade().is_some())
            .count()
    }

    fn join_or_start<F>(&self, key: &K, start: F) -> (Flight<V>, u64, bool)
    where
        F: FnOnce() -> BoxFuture<'static, V>,
    {
        let mut inflight = self.inflight.lock();

        if let Some(slot) = inflight.get_mut(key) {
            if let Some(flight) = slot.handle.upgrade() {
                slot.waiters += 1;
                return (flight, slot.id, false);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flight = start().shared();
        if let Some(handle) = flight.downgrade() {
            inflight.insert(
                key.clone(),
                Slot {
                    id,
                    handle,
                    waiters: 1,
                },
            );
        }
        (flight, id, true)
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the slot once its computation finished or the last waiter dropped out
struct SlotGuard<'a, K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    owner: &'a SingleFlight<K, V>,
    key: K,
    id: u64,
    completed: bool,
}

impl<K, V> Drop for SlotGuard<'_, K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn drop(&mut self) {
        let mut inflight = self.owner.inflight.lock();
        let release = match inflight.get_mut(&self.key) {
            Some(slot) if slot.id == self.id => {
                slot.waiters = slot.waiters.saturating_sub(1);
                self.completed || slot.waiters == 0
            }
            _ => false,
        };
        if release {
            inflight.remove(&self.key);
        }
    }
}
