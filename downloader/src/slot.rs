use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;

/// Per-domain admission state: a concurrency gate plus delay pacing.
///
/// The delay applies between *consecutive dispatches*, not between a
/// response and the next request; `await_turn` holds the pacing lock
/// across its sleep so dispatches through one slot are strictly spaced.
pub struct Slot {
    key: String,
    concurrency: Arc<Semaphore>,
    configured_concurrency: usize,
    delay: f64,
    randomize_delay: bool,
    last_dispatch: Mutex<Option<Instant>>,
    /// For GC: when this slot last dispatched anything
    last_active: Mutex<Option<Instant>>,
}

impl Slot {
    pub fn new(key: String, concurrency: usize, delay: f64, randomize_delay: bool) -> Self {
        Self {
            key,
            concurrency: Arc::new(Semaphore::new(concurrency)),
            configured_concurrency: concurrency,
            delay,
            randomize_delay,
            last_dispatch: Mutex::new(None),
            last_active: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The delay before the next dispatch: uniform in [0.5·D, 1.5·D] when
    /// randomized, exactly D otherwise.
    fn next_delay(&self) -> Duration {
        if self.delay <= 0.0 {
            return Duration::ZERO;
        }
        let secs = if self.randomize_delay {
            rand::thread_rng().gen_range(0.5 * self.delay..=1.5 * self.delay)
        } else {
            self.delay
        };
        Duration::from_secs_f64(secs)
    }

    /// Acquire a concurrency permit for this slot.
    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.concurrency
            .clone()
            .acquire_owned()
            .await
            .expect("slot semaphore is never closed")
    }

    /// Wait until this slot's delay since the previous dispatch has
    /// elapsed, then mark the dispatch. Callers are serialized, so two
    /// concurrent dispatches cannot share one delay window.
    pub async fn await_turn(&self) {
        let mut last = self.last_dispatch.lock().await;
        if let Some(previous) = *last {
            let delay = self.next_delay();
            let elapsed = previous.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed).await;
            }
        }
        let now = Instant::now();
        *last = Some(now);
        *self.last_active.lock().await = Some(now);
    }

    /// Whether this slot has been idle for at least `age` and holds all
    /// its permits (no request in flight).
    pub async fn evictable(&self, age: Duration) -> bool {
        if self.concurrency.available_permits() < self.max_permits() {
            return false;
        }
        match *self.last_active.lock().await {
            Some(t) => t.elapsed() >= age,
            None => true,
        }
    }

    fn max_permits(&self) -> usize {
        // Semaphore::new was called with the configured concurrency and
        // permits are only held by in-flight requests
        self.configured_concurrency
    }
}

/// Lazily creates and evicts per-domain slots.
pub struct SlotManager {
    slots: DashMap<String, Arc<Slot>>,
    concurrency: usize,
    delay: f64,
    randomize_delay: bool,
}

impl SlotManager {
    pub fn new(concurrency: usize, delay: f64, randomize_delay: bool) -> Self {
        Self {
            slots: DashMap::new(),
            concurrency,
            delay,
            randomize_delay,
        }
    }

    /// Get or create the slot for a key.
    pub fn slot(&self, key: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(key) {
            return slot.clone();
        }
        let slot = Arc::new(Slot::new(
            key.to_string(),
            self.concurrency,
            self.delay,
            self.randomize_delay,
        ));
        self.slots.insert(key.to_string(), slot.clone());
        slot
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop slots idle for at least `age`. Returns how many were evicted.
    pub async fn evict_idle(&self, age: Duration) -> usize {
        let mut evicted = Vec::new();
        for entry in self.slots.iter() {
            if entry.value().evictable(age).await {
                evicted.push(entry.key().clone());
            }
        }
        for key in &evicted {
            self.slots.remove(key);
        }
        evicted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consecutive_dispatches_are_spaced_by_the_delay() {
        let slot = Slot::new("example.com".into(), 1, 0.05, false);

        slot.await_turn().await;
        let first = Instant::now();
        slot.await_turn().await;
        let gap = first.elapsed();

        assert!(gap >= Duration::from_millis(50), "gap was {:?}", gap);
    }

    #[tokio::test]
    async fn zero_delay_does_not_wait() {
        let slot = Slot::new("example.com".into(), 1, 0.0, true);

        slot.await_turn().await;
        let start = Instant::now();
        slot.await_turn().await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn randomized_delay_stays_in_half_to_three_halves() {
        let slot = Slot::new("example.com".into(), 1, 0.2, true);
        for _ in 0..200 {
            let delay = slot.next_delay();
            assert!(delay >= Duration::from_millis(100), "delay was {:?}", delay);
            assert!(delay <= Duration::from_millis(300), "delay was {:?}", delay);
        }
    }

    #[tokio::test]
    async fn permits_bound_per_slot_concurrency() {
        let slot = Arc::new(Slot::new("example.com".into(), 2, 0.0, false));

        let first = slot.acquire().await;
        let _second = slot.acquire().await;
        assert_eq!(slot.concurrency.available_permits(), 0);

        drop(first);
        assert_eq!(slot.concurrency.available_permits(), 1);
    }

    #[tokio::test]
    async fn manager_reuses_and_evicts_slots() {
        let manager = SlotManager::new(2, 0.0, false);

        let a = manager.slot("a.example.com");
        let again = manager.slot("a.example.com");
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(manager.len(), 1);

        a.await_turn().await;
        // Not yet old enough
        assert_eq!(manager.evict_idle(Duration::from_secs(60)).await, 0);
        // Old enough once the age threshold is zero
        assert_eq!(manager.evict_idle(Duration::ZERO).await, 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn slots_with_requests_in_flight_are_not_evicted() {
        let manager = SlotManager::new(1, 0.0, false);
        let slot = manager.slot("busy.example.com");

        let _permit = slot.acquire().await;
        assert_eq!(manager.evict_idle(Duration::ZERO).await, 0);
        assert_eq!(manager.len(), 1);
    }
}
