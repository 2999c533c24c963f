//
// service/throttle.rs
//
// Injected clock and keyed debounce table
//

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Time source for debounce deadlines
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// The tokio clock; follows paused time in tests
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeClock;

impl Clock for RuntimeClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Pending operations keyed by what they act on.
///
/// Scheduling a key that is already pending pushes its deadline back, so a
/// burst of N requests for one key runs once, `delay` after the last one.
#[derive(Debug)]
pub struct ThrottledOperations<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone + Ord> ThrottledOperations<K> {
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }

    /// Returns true when an earlier pending request was replaced
    pub fn schedule(&mut self, key: K, now: Instant, delay: Duration) -> bool {
        self.deadlines.insert(key, now + delay).is_some()
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    /// Remove and return every key whose deadline has passed, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*deadline, key.clone()))
            .collect();
        due.sort();
        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl<K: Eq + Hash + Clone + Ord> Default for ThrottledOperations<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(250);

    #[test]
    fn test_burst_runs_once_after_last_request() {
        let clock = ManualClock::new();
        let mut ops = ThrottledOperations::new();

        assert!(!ops.schedule("a", clock.now(), DELAY));
        for _ in 0..5 {
            clock.advance(Duration::from_millis(100));
            assert!(ops.schedule("a", clock.now(), DELAY));
        }
        clock.advance(Duration::from_millis(249));
        assert!(ops.take_due(clock.now()).is_empty());
        clock.advance(Duration::from_millis(1));
        assert_eq!(ops.take_due(clock.now()), vec!["a"]);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_due_order_and_next_deadline() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut ops = ThrottledOperations::new();
        ops.schedule(2, start, Duration::from_millis(50));
        ops.schedule(1, start, Duration::from_millis(80));
        ops.schedule(3, start, Duration::from_millis(500));

        assert_eq!(ops.next_deadline(), Some(start + Duration::from_millis(50)));
        clock.advance(Duration::from_millis(100));
        assert_eq!(ops.take_due(clock.now()), vec![2, 1]);
        assert!(ops.cancel(&3));
        assert_eq!(ops.next_deadline(), None);
    }
}
