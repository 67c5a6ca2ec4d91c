//! In-process event source
//!
//! A small publish/subscribe facility keyed by [`EventName`]. Subscribers are
//! called synchronously, in subscription order, on the emitting task. The
//! emitter also keeps the ground-truth number of times each name fired.

use crate::models::EventName;
use crate::stats::EventStatistics;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Callback invoked once per emitted event
pub type Subscriber = Arc<dyn Fn() + Send + Sync>;

/// Publish/subscribe hub for named events
#[derive(Default)]
pub struct EventEmitter {
    subscribers: DashMap<EventName, Vec<Subscriber>>,
    fired: EventStatistics,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            fired: EventStatistics::new(),
        }
    }

    /// Register a callback for `name`; several callbacks per name are allowed
    pub fn subscribe<F>(&self, name: EventName, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribers
            .entry(name)
            .or_default()
            .push(Arc::new(callback));
        debug!(event = %name, "Subscriber registered");
    }

    /// Fire `name` once, calling every subscriber before returning
    pub fn emit(&self, name: EventName) {
        self.fired.increment(name);

        // Clone out of the map so callbacks never run under a shard lock
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .get(&name)
            .map(|subs| subs.clone())
            .unwrap_or_default();

        for subscriber in subscribers {
            subscriber();
        }
    }

    /// How many times `name` has fired
    pub fn fired(&self, name: EventName) -> u64 {
        self.fired.get(name)
    }

    /// Number of callbacks registered for `name`
    pub fn subscriber_count(&self, name: EventName) -> usize {
        self.subscribers.get(&name).map(|subs| subs.len()).unwrap_or(0)
    }
}

/// Fire `total` events of `name`, pausing a random `[0, max_delay]` between each
pub fn trigger_randomly(
    emitter: Arc<EventEmitter>,
    name: EventName,
    total: u64,
    max_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let max_ms = max_delay.as_millis() as u64;

        for _ in 0..total {
            // ThreadRng is !Send, keep it out of the await
            let delay_ms = if max_ms == 0 {
                0
            } else {
                rand::thread_rng().gen_range(0..=max_ms)
            };
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            emitter.emit(name);
        }

        info!(event = %name, total = total, "Event source finished firing");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_emit_without_subscribers_counts_fired() {
        let emitter = EventEmitter::new();
        emitter.emit(EventName::A);
        emitter.emit(EventName::A);

        assert_eq!(emitter.fired(EventName::A), 2);
        assert_eq!(emitter.fired(EventName::B), 0);
    }

    #[test]
    fn test_multiple_subscribers_per_name() {
        let emitter = EventEmitter::new();
        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));

        let f = first.clone();
        emitter.subscribe(EventName::A, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = second.clone();
        emitter.subscribe(EventName::A, move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(EventName::A);
        emitter.emit(EventName::B);

        assert_eq!(emitter.subscriber_count(EventName::A), 2);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribers_run_in_order() {
        let emitter = EventEmitter::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            emitter.subscribe(EventName::B, move || log.lock().unwrap().push(i));
        }

        emitter.emit(EventName::B);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_randomly_fires_exact_total() {
        let emitter = Arc::new(EventEmitter::new());
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        emitter.subscribe(EventName::A, move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        trigger_randomly(emitter.clone(), EventName::A, 25, Duration::from_millis(20))
            .await
            .unwrap();

        assert_eq!(emitter.fired(EventName::A), 25);
        assert_eq!(seen.load(Ordering::SeqCst), 25);
        assert_eq!(emitter.fired(EventName::B), 0);
    }
}
