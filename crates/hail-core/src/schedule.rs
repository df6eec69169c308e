//! Schedule store for bid expiry timers.
//!
//! Each negotiation key maps to at most one entry. An entry is first
//! [reserved](ScheduleStore::reserve), before the slow gateway call that
//! decides whether a timer is needed, and later [armed](ScheduleStore::arm)
//! with the abort handle of its timer task. Entries carry a generation number;
//! arming and firing only act for the generation they were reserved with.
//! Cancellation removes reserved and armed entries alike, so a reservation
//! cancelled mid-call can never be armed. A firing timer claims its entry with
//! [`ScheduleStore::complete`], which removes it under the same shard lock as
//! every cancellation path. Whichever side removes the entry first wins.

use crate::message::ConnectionId;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Entries older than this are evicted by the sweep.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Identity of one bidding round.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NegotiationKey {
    pub request_id: String,
    pub driver_id: String,
    pub customer_id: String,
}

impl NegotiationKey {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        driver_id: impl Into<String>,
        customer_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            driver_id: driver_id.into(),
            customer_id: customer_id.into(),
        }
    }
}

impl fmt::Display for NegotiationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.request_id, self.driver_id, self.customer_id
        )
    }
}

/// Identifies one reservation; handed to the timer callback armed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub key: NegotiationKey,
    pub generation: u64,
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    owner: ConnectionId,
    created_at: Instant,
    /// `None` while the entry is only reserved.
    timer: Option<AbortHandle>,
}

impl Entry {
    fn cancel(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

/// Concurrent map from negotiation key to reserved or armed timer.
#[derive(Debug, Default)]
pub struct ScheduleStore {
    entries: DashMap<NegotiationKey, Entry>,
    next_generation: AtomicU64,
}

impl ScheduleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `key` for `owner`, replacing any entry for the same key.
    ///
    /// A superseded entry's timer is aborted under the key's shard lock, so
    /// concurrent callers converge on one entry: the last one to take the
    /// lock. Only the returned ticket can [arm](Self::arm) the reservation.
    pub fn reserve(&self, key: NegotiationKey, owner: ConnectionId) -> Ticket {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.entries.insert(
            key.clone(),
            Entry {
                generation,
                owner,
                created_at: Instant::now(),
                timer: None,
            },
        );
        if let Some(previous) = previous {
            debug!(key = %key, "Superseding scheduled entry");
            previous.cancel();
        }

        trace!(key = %key, generation, "Entry reserved");
        Ticket { key, generation }
    }

    /// Arm the timer for a reservation.
    ///
    /// Returns `false` without spawning anything when the reservation was
    /// cancelled, superseded or already armed. The check and the spawn happen
    /// under the key's shard lock.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F, Fut>(&self, ticket: &Ticket, delay: Duration, on_fire: F) -> bool
    where
        F: FnOnce(Ticket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(mut entry) = self.entries.get_mut(&ticket.key) else {
            trace!(key = %ticket.key, "Reservation gone before arming");
            return false;
        };
        if entry.generation != ticket.generation || entry.timer.is_some() {
            trace!(key = %ticket.key, generation = ticket.generation, "Reservation superseded before arming");
            return false;
        }

        let fire_ticket = ticket.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(fire_ticket).await;
        });
        entry.timer = Some(task.abort_handle());

        trace!(key = %ticket.key, generation = ticket.generation, ?delay, "Timer armed");
        true
    }

    /// Drop a reservation that will not be armed.
    ///
    /// Leaves the entry alone if it has since been superseded.
    pub fn release(&self, ticket: &Ticket) -> bool {
        self.entries
            .remove_if(&ticket.key, |_, e| e.generation == ticket.generation)
            .map(|(_, entry)| entry.cancel())
            .is_some()
    }

    /// Whether the entry `ticket` was reserved for is still live.
    #[must_use]
    pub fn is_live(&self, ticket: &Ticket) -> bool {
        self.entries
            .get(&ticket.key)
            .is_some_and(|e| e.generation == ticket.generation)
    }

    /// Claim the entry for a firing timer.
    ///
    /// Returns `false` if the entry was cancelled or superseded; the caller
    /// must then not act.
    pub fn complete(&self, ticket: &Ticket) -> bool {
        let removed = self
            .entries
            .remove_if(&ticket.key, |_, e| e.generation == ticket.generation)
            .is_some();
        if !removed {
            trace!(key = %ticket.key, generation = ticket.generation, "Timer lost race with cancellation");
        }
        removed
    }

    /// Cancel and remove the entry for `key`.
    pub fn cancel(&self, key: &NegotiationKey) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.cancel();
                debug!(key = %key, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every entry owned by `owner`.
    pub fn cancel_owned(&self, owner: &ConnectionId) -> Vec<NegotiationKey> {
        self.cancel_where(|_, e| &e.owner == owner)
    }

    /// Cancel every entry on `request_id`, whichever driver placed it.
    pub fn cancel_request(&self, request_id: &str) -> Vec<NegotiationKey> {
        self.cancel_where(|k, _| k.request_id == request_id)
    }

    /// Evict entries created more than `max_age` ago.
    pub fn sweep(&self, max_age: Duration) -> Vec<NegotiationKey> {
        let evicted = self.cancel_where(|_, e| e.created_at.elapsed() > max_age);
        debug!(evicted = evicted.len(), remaining = self.len(), "Swept schedule store");
        evicted
    }

    fn cancel_where(
        &self,
        mut predicate: impl FnMut(&NegotiationKey, &Entry) -> bool,
    ) -> Vec<NegotiationKey> {
        let mut removed = Vec::new();
        self.entries.retain(|key, entry| {
            if predicate(key, entry) {
                entry.cancel();
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    #[must_use]
    pub fn contains(&self, key: &NegotiationKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of live entries owned by `owner`.
    #[must_use]
    pub fn owned_by(&self, owner: &ConnectionId) -> usize {
        self.entries.iter().filter(|e| &e.owner == owner).count()
    }

    /// Number of live entries on `request_id`.
    #[must_use]
    pub fn on_request(&self, request_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.key().request_id == request_id)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for ScheduleStore {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn key(request: &str, driver: &str) -> NegotiationKey {
        NegotiationKey::new(request, driver, "c1")
    }

    fn counting(
        store: &Arc<ScheduleStore>,
        fired: &Arc<AtomicUsize>,
    ) -> impl FnOnce(Ticket) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        let store = Arc::clone(store);
        let fired = Arc::clone(fired);
        move |ticket| {
            Box::pin(async move {
                if store.complete(&ticket) {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            })
        }
    }

    fn armed(
        store: &Arc<ScheduleStore>,
        key: NegotiationKey,
        owner: &str,
        delay: Duration,
        fired: &Arc<AtomicUsize>,
    ) -> Ticket {
        let ticket = store.reserve(key, owner.into());
        assert!(store.arm(&ticket, delay, counting(store, fired)));
        ticket
    }

    #[test]
    fn test_key_display() {
        assert_eq!(NegotiationKey::new("9", "4", "2").to_string(), "9_4_2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_and_removes_entry() {
        let store = Arc::new(ScheduleStore::new());
        let fired = Arc::new(AtomicUsize::new(0));

        armed(&store, key("r1", "d1"), "conn", Duration::from_secs(5), &fired);
        assert!(store.contains(&key("r1", "d1")));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_supersedes_previous_timer() {
        let store = Arc::new(ScheduleStore::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let first = armed(&store, key("r1", "d1"), "conn", Duration::from_secs(5), &fired);
        let second = armed(&store, key("r1", "d1"), "conn", Duration::from_secs(10), &fired);

        assert_eq!(store.len(), 1);
        assert!(!store.is_live(&first));
        assert!(store.is_live(&second));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_arms_leave_one_timer() {
        let store = Arc::new(ScheduleStore::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..16u64 {
            let store = Arc::clone(&store);
            let callback = counting(&store, &fired);
            tasks.push(tokio::spawn(async move {
                let ticket = store.reserve(key("r1", "d1"), "conn".into());
                tokio::task::yield_now().await;
                store.arm(&ticket, Duration::from_secs(30 + i), callback)
            }));
        }
        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap() {
                successes += 1;
            }
        }

        assert!(successes >= 1);
        assert_eq!(store.len(), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let store = Arc::new(ScheduleStore::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let ticket = armed(&store, key("r1", "d1"), "conn", Duration::from_secs(5), &fired);
        assert!(store.cancel(&key("r1", "d1")));
        assert!(!store.cancel(&key("r1", "d1")));
        assert!(!store.complete(&ticket));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_reservation_cannot_be_armed() {
        let store = Arc::new(ScheduleStore::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let by_request = store.reserve(key("r1", "d1"), "a".into());
        let by_owner = store.reserve(key("r2", "d1"), "b".into());
        assert_eq!(store.len(), 2);

        assert_eq!(store.cancel_request("r1"), vec![key("r1", "d1")]);
        assert_eq!(store.cancel_owned(&"b".into()), vec![key("r2", "d1")]);

        let delay = Duration::from_secs(5);
        assert!(!store.arm(&by_request, delay, counting(&store, &fired)));
        assert!(!store.arm(&by_owner, delay, counting(&store, &fired)));
        assert!(store.is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_arms_once() {
        let store = Arc::new(ScheduleStore::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let ticket = store.reserve(key("r1", "d1"), "conn".into());
        assert!(store.arm(&ticket, Duration::from_secs(5), counting(&store, &fired)));
        assert!(!store.arm(&ticket, Duration::from_secs(5), counting(&store, &fired)));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_ignores_superseded_ticket() {
        let store = Arc::new(ScheduleStore::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let stale = store.reserve(key("r1", "d1"), "conn".into());
        let current = armed(&store, key("r1", "d1"), "conn", Duration::from_secs(5), &fired);

        assert!(!store.release(&stale));
        assert!(store.is_live(&current));

        assert!(store.release(&current));
        assert!(store.is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_owned_only_touches_owner() {
        let store = Arc::new(ScheduleStore::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let owners = ["a", "b", "c"];

        for (i, owner) in owners.iter().enumerate() {
            for driver in ["d1", "d2"] {
                armed(
                    &store,
                    key(&format!("r{i}"), driver),
                    owner,
                    Duration::from_secs(60),
                    &fired,
                );
            }
        }

        let removed = store.cancel_owned(&"b".into());
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|k| k.request_id == "r1"));
        assert_eq!(store.owned_by(&"a".into()), 2);
        assert_eq!(store.owned_by(&"c".into()), 2);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_aged_entries() {
        let store = Arc::new(ScheduleStore::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_secs(2 * 60 * 60);

        armed(&store, key("old", "d1"), "conn", delay, &fired);
        tokio::time::advance(Duration::from_secs(61 * 60)).await;
        armed(&store, key("new", "d1"), "conn", delay, &fired);

        let evicted = store.sweep(DEFAULT_MAX_AGE);
        assert_eq!(evicted, vec![key("old", "d1")]);
        assert!(store.contains(&key("new", "d1")));

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
