//! Sliding window call counter

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Records event timestamps and answers how many happened recently
///
/// Old entries are pruned on every update, so memory use is bounded by the
/// retention window.
#[derive(Debug)]
pub struct TimedCounter {
    retention: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl TimedCounter {
    /// Create a counter that retains events for the given window
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one event at the current time
    pub fn increase(&self) {
        let now = Instant::now();
        let mut events = self.events.lock().unwrap();
        events.push_back(now);
        while events
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.retention)
        {
            events.pop_front();
        }
    }

    /// Number of events recorded within the last `window`
    pub fn count_in_last(&self, window: Duration) -> usize {
        let now = Instant::now();
        let events = self.events.lock().unwrap();
        events
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= window)
            .count()
    }

    /// Total number of retained events
    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl Default for TimedCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}
