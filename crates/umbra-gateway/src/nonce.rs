//! Nonce store (§4.3).
//!
//! In-memory map `nonce → firstSeen`, per node (not global — cross-node
//! replay is bounded by token scope and sticky routing, and tolerable
//! because the downstream effect is idempotent under `messageId`).
//! Guarded by a single mutex; GC is amortised on insert.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Abstracts "now" so replay-window behavior is testable without sleeping
/// real wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

pub struct NonceStore<C: Clock = SystemClock> {
    seen: Mutex<HashMap<String, Instant>>,
    replay_window: Duration,
    retain: Duration,
    clock: C,
}

impl NonceStore<SystemClock> {
    pub fn new(replay_window: Duration, retain: Duration) -> Self {
        Self::with_clock(replay_window, retain, SystemClock)
    }
}

impl<C: Clock> NonceStore<C> {
    pub fn with_clock(replay_window: Duration, retain: Duration, clock: C) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            replay_window,
            retain,
            clock,
        }
    }

    /// Check a nonce and record it if fresh. Returns `true` if this is the
    /// first time the nonce has been seen (accept), `false` if it's a
    /// replay (reject) — rejection holds for as long as the entry survives
    /// GC (`retain`), not just the initial `replay_window`; the window is
    /// a minimum replay-rejection guarantee, not a reuse grace period.
    ///
    /// GC of entries older than `retain` runs on every call, amortised.
    pub fn check_and_insert(&self, nonce: &str) -> bool {
        let now = self.clock.now();
        let mut seen = self.seen.lock().expect("nonce store mutex poisoned");

        seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.retain);

        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_owned(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Clone)]
    struct FakeClock(Arc<StdMutex<Instant>>);

    impl FakeClock {
        fn new() -> Self {
            Self(Arc::new(StdMutex::new(Instant::now())))
        }

        fn advance(&self, d: Duration) {
            *self.0.lock().unwrap() += d;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.0.lock().unwrap()
        }
    }

    #[test]
    fn first_use_is_accepted() {
        let store = NonceStore::with_clock(Duration::from_secs(5), Duration::from_secs(600), FakeClock::new());
        assert!(store.check_and_insert("abc123"));
    }

    #[test]
    fn replay_within_window_is_rejected() {
        let store = NonceStore::with_clock(Duration::from_secs(5), Duration::from_secs(600), FakeClock::new());
        assert!(store.check_and_insert("abc123"));
        assert!(!store.check_and_insert("abc123"));
    }

    #[test]
    fn reuse_after_replay_window_but_before_retain_is_still_rejected() {
        let clock = FakeClock::new();
        let store = NonceStore::with_clock(Duration::from_secs(5), Duration::from_secs(600), clock.clone());
        assert!(store.check_and_insert("abc123"));
        clock.advance(Duration::from_secs(10));
        assert!(!store.check_and_insert("abc123"));
    }

    #[test]
    fn gc_evicts_entries_past_retain() {
        let clock = FakeClock::new();
        let store = NonceStore::with_clock(Duration::from_secs(5), Duration::from_secs(600), clock.clone());
        store.check_and_insert("old-nonce");
        clock.advance(Duration::from_secs(601));
        assert!(store.check_and_insert("old-nonce"));
    }
}
