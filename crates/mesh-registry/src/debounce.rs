//! Keyed debouncing of background work

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runs an action after a delay, collapsing repeated triggers per key
///
/// Each call bumps a per-key generation. The action only runs when its
/// generation is still current after the delay, so a burst of triggers
/// results in a single run.
#[derive(Debug, Clone, Default)]
pub struct Debouncer {
    generations: Arc<Mutex<HashMap<String, u64>>>,
}

impl Debouncer {
    /// Create a debouncer with no pending actions
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run after `delay`, superseding any pending
    /// action for the same key
    pub fn debounce<F, Fut>(&self, key: &str, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let generation = {
            let mut generations = self.generations.lock().unwrap();
            let entry = generations.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let generations = self.generations.clone();
        let key = key.to_string();
        smol::spawn(async move {
            smol::Timer::after(delay).await;
            let current = generations.lock().unwrap().get(&key).copied();
            if current == Some(generation) {
                action().await;
            }
        })
        .detach();
    }

    /// Drop any pending action for the key
    pub fn cancel(&self, key: &str) {
        if let Some(entry) = self.generations.lock().unwrap().get_mut(key) {
            *entry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[smol_potat::test]
    async fn collapses_repeated_triggers() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let runs = runs.clone();
            debouncer.debounce("key", Duration::from_millis(30), move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        smol::Timer::after(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[smol_potat::test]
    async fn cancel_prevents_run() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            debouncer.debounce("key", Duration::from_millis(30), move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        debouncer.cancel("key");
        smol::Timer::after(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[smol_potat::test]
    async fn independent_keys_both_run() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let runs = runs.clone();
            debouncer.debounce(key, Duration::from_millis(10), move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        smol::Timer::after(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
