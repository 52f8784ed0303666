//! Ready-resource pool
//!
//! The behind-peer keeps a FIFO of warm data resources waiting for a
//! DISPATCH; the front-peer keeps the mirror FIFO of accepted data
//! connections waiting for a user session. Correlation between the two
//! relies on both sides consuming in arrival order.
//!
//! Refill policy (behind-peer):
//! - Normal: hold exactly the configured target.
//! - Aggressive: ≥ 2 consumptions within 100 ms arm a 2× target that
//!   decays back to normal after 5 s without consumption.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Consumption burst window arming aggressive mode
const BURST_WINDOW: Duration = Duration::from_millis(100);

/// Idle period after which the aggressive boost decays
const BOOST_DECAY: Duration = Duration::from_secs(5);

/// A bounded FIFO of ready resources.
///
/// Producers (the refill worker) block only on "pool is at max"; consumers
/// (dispatch) block only on "pool is empty".
pub struct ResourcePool<T> {
    queue: Mutex<PoolState<T>>,
    /// Signalled when a resource is pushed
    available: Notify,
    /// Signalled when a resource is consumed
    consumed: Notify,
    target: AtomicUsize,
    aggressive: bool,
}

struct PoolState<T> {
    ready: VecDeque<T>,
    last_consumed: Option<Instant>,
    /// Consumptions inside the current burst window
    burst: usize,
    boosted_at: Option<Instant>,
}

impl<T> ResourcePool<T> {
    pub fn new(target: usize, aggressive: bool) -> Self {
        Self {
            queue: Mutex::new(PoolState {
                ready: VecDeque::new(),
                last_consumed: None,
                burst: 0,
                boosted_at: None,
            }),
            available: Notify::new(),
            consumed: Notify::new(),
            target: AtomicUsize::new(target),
            aggressive,
        }
    }

    /// Base target, updated live by the tuner
    pub fn set_target(&self, target: usize) {
        self.target.store(target.max(1), Ordering::Relaxed);
    }

    pub fn base_target(&self) -> usize {
        self.target.load(Ordering::Relaxed)
    }

    /// Effective target including an armed aggressive boost
    pub fn current_target(&self) -> usize {
        let base = self.base_target();
        if !self.aggressive {
            return base;
        }
        let state = self.queue.lock().unwrap();
        match state.boosted_at {
            Some(at) if at.elapsed() < BOOST_DECAY => base * 2,
            _ => base,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many resources the refill worker should open right now
    pub fn deficit(&self) -> usize {
        self.current_target().saturating_sub(self.len())
    }

    /// Add a ready resource
    pub fn push(&self, resource: T) {
        self.queue.lock().unwrap().ready.push_back(resource);
        self.notify_available();
    }

    /// Pop the oldest ready resource without waiting
    pub fn try_acquire(&self) -> Option<T> {
        let mut state = self.queue.lock().unwrap();
        let resource = state.ready.pop_front()?;
        self.note_consumption(&mut state);
        drop(state);
        self.consumed.notify_waiters();
        Some(resource)
    }

    /// Pop the oldest ready resource, waiting up to `timeout`.
    ///
    /// `None` means pool starvation: the caller drops the session.
    pub async fn acquire(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(resource) = self.try_acquire() {
                return Some(resource);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let notified = self.available.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return self.try_acquire(),
            }
        }
    }

    /// Wait until a consumption happens (refill trigger)
    pub async fn consumption(&self) {
        self.consumed.notified().await;
    }

    /// Drop every pooled resource (control channel reset)
    pub fn drain(&self) {
        let mut state = self.queue.lock().unwrap();
        state.ready.clear();
        state.burst = 0;
        state.boosted_at = None;
    }

    fn notify_available(&self) {
        self.available.notify_waiters();
        self.available.notify_one();
    }

    fn note_consumption(&self, state: &mut PoolState<T>) {
        let now = Instant::now();
        if self.aggressive {
            match state.last_consumed {
                Some(prev) if now.duration_since(prev) <= BURST_WINDOW => {
                    state.burst += 1;
                    if state.burst >= 2 {
                        state.boosted_at = Some(now);
                    }
                }
                _ => state.burst = 1,
            }
            // Any consumption keeps an armed boost alive
            if state.boosted_at.is_some() {
                state.boosted_at = Some(now);
            }
        }
        state.last_consumed = Some(now);
    }
}

impl<T> ResourcePool<(u32, T)> {
    /// Insert by ascending sequence number.
    ///
    /// Announcement frames can be processed out of arrival order under
    /// concurrent accepts; sorting by the peer-assigned sequence keeps both
    /// FIFOs consistent.
    pub fn push_sorted(&self, seq: u32, resource: T) {
        let mut state = self.queue.lock().unwrap();
        let idx = state.ready.partition_point(|(s, _)| *s <= seq);
        state.ready.insert(idx, (seq, resource));
        drop(state);
        self.notify_available();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let pool: ResourcePool<u32> = ResourcePool::new(4, false);
        pool.push(1);
        pool.push(2);
        pool.push(3);

        assert_eq!(pool.try_acquire(), Some(1));
        assert_eq!(pool.try_acquire(), Some(2));
        assert_eq!(pool.try_acquire(), Some(3));
        assert_eq!(pool.try_acquire(), None);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_push() {
        let pool: std::sync::Arc<ResourcePool<u32>> =
            std::sync::Arc::new(ResourcePool::new(1, false));

        let waiter = {
            let pool = std::sync::Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.push(7);

        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_starved() {
        let pool: ResourcePool<u32> = ResourcePool::new(1, false);
        let got = pool.acquire(Duration::from_millis(50)).await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_aggressive_boost_on_burst() {
        let pool: ResourcePool<u32> = ResourcePool::new(4, true);
        assert_eq!(pool.current_target(), 4);

        pool.push(1);
        pool.push(2);
        pool.try_acquire();
        pool.try_acquire();

        // Two consumptions inside the burst window double the target
        assert_eq!(pool.current_target(), 8);
        assert_eq!(pool.deficit(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boost_decays_after_idle() {
        let pool: ResourcePool<u32> = ResourcePool::new(2, true);
        pool.push(1);
        pool.push(2);
        pool.try_acquire();
        pool.try_acquire();
        assert_eq!(pool.current_target(), 4);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(pool.current_target(), 2);
    }

    #[tokio::test]
    async fn test_sorted_insert_restores_sequence() {
        let pool: ResourcePool<(u32, &str)> = ResourcePool::new(4, false);
        pool.push_sorted(2, "b");
        pool.push_sorted(1, "a");
        pool.push_sorted(3, "c");

        assert_eq!(pool.try_acquire(), Some((1, "a")));
        assert_eq!(pool.try_acquire(), Some((2, "b")));
        assert_eq!(pool.try_acquire(), Some((3, "c")));
    }

    #[tokio::test]
    async fn test_drain_empties_pool() {
        let pool: ResourcePool<u32> = ResourcePool::new(4, true);
        pool.push(1);
        pool.push(2);
        pool.drain();
        assert!(pool.is_empty());
        assert_eq!(pool.current_target(), 4);
    }
}
