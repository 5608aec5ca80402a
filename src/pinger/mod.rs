//! Periodic refresh — keeps a resource warm and pushes each value to a handler.
//!
//! A [`Pinger`] wraps a coordinator handle plus one value handler. Each tick
//! performs a conditional read of the configured resource and invokes the
//! handler with whatever value came back, so the handler sees both cache hits
//! and refreshed values. Construct one through
//! [`Recache::create_pinger`](crate::Recache::create_pinger).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::cache::{Query, Recache};

type ValueHandler = Arc<dyn Fn(Option<Value>) + Send + Sync + 'static>;

/// Periodic-refresh helper bound to one coordinator.
///
/// At most one periodic loop runs per pinger; [`start`](Self::start) replaces
/// any previous loop and [`stop`](Self::stop) (or drop) cancels it. One-shot
/// refreshes via [`ping`](Self::ping) work independently of the loop.
pub struct Pinger {
    coordinator: Recache,
    handler: ValueHandler,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Pinger {
    pub(crate) fn new<F>(coordinator: Recache, handler: F) -> Self
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        Self {
            coordinator,
            handler: Arc::new(handler),
            task: Mutex::new(None),
        }
    }

    /// One-shot refresh: read the resource now, hand the best available value
    /// to the handler, and return it.
    pub fn ping(&self, pathname: &str, query: Option<&Query>) -> Option<Value> {
        let value = self.coordinator.get(pathname, query);
        (self.handler)(value.clone());
        value
    }

    /// Start pinging `pathname` every `every`, replacing any running loop.
    ///
    /// The first tick fires after one full interval. Requires a current Tokio
    /// runtime.
    pub fn start(&self, pathname: impl Into<String>, query: Option<Query>, every: Duration) {
        self.stop();

        let coordinator = self.coordinator.clone();
        let handler = Arc::clone(&self.handler);
        let pathname = pathname.into();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            // The immediate first tick of `interval` is skipped.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                tracing::trace!(%pathname, "periodic refresh tick");
                let value = coordinator.get(&pathname, query.as_ref());
                handler(value);
            }
        });

        *self.lock_task() = Some(handle);
    }

    /// Cancel the periodic loop, if one is running.
    pub fn stop(&self) {
        if let Some(handle) = self.lock_task().take() {
            handle.abort();
        }
    }

    /// Returns `true` while a periodic loop is running.
    pub fn is_running(&self) -> bool {
        self.lock_task()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Pinger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pinger")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestOptions;
    use crate::middleware;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── One-shot ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ping_hands_current_value_to_handler() {
        let store = Recache::builder().use_fn(middleware::memory_fn()).build();
        store
            .put("status", json!("up"), RequestOptions::new())
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let pinger = store.create_pinger(move |value| {
            *sink.lock().unwrap() = value;
        });

        assert_eq!(pinger.ping("status", None), Some(json!("up")));
        assert_eq!(*seen.lock().unwrap(), Some(json!("up")));
    }

    #[tokio::test]
    async fn ping_reports_absence_for_unloaded_resource() {
        let store = Recache::builder().build();
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&calls);
        let pinger = store.create_pinger(move |value| {
            assert!(value.is_none());
            sink.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(pinger.ping("missing", None), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ── Periodic loop ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn periodic_loop_ticks_until_stopped() {
        let store = Recache::builder().use_fn(middleware::memory_fn()).build();
        store
            .put("status", json!("up"), RequestOptions::new())
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&calls);
        let pinger = store.create_pinger(move |_value| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        pinger.start("status", None, Duration::from_millis(10));
        assert!(pinger.is_running());
        tokio::time::sleep(Duration::from_millis(45)).await;
        pinger.stop();
        assert!(!pinger.is_running());

        let ticked = calls.load(Ordering::SeqCst);
        assert!(ticked >= 2, "expected at least two ticks, saw {ticked}");

        // No more ticks after stop.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), ticked);
    }

    #[tokio::test]
    async fn restart_replaces_previous_loop() {
        let store = Recache::builder().use_fn(middleware::memory_fn()).build();
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&calls);
        let pinger = store.create_pinger(move |_value| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        pinger.start("a", None, Duration::from_secs(3600));
        pinger.start("b", None, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;
        pinger.stop();

        // Only the second loop's interval could have ticked.
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn drop_cancels_loop() {
        let store = Recache::builder().use_fn(middleware::memory_fn()).build();
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&calls);
        {
            let pinger = store.create_pinger(move |_value| {
                sink.fetch_add(1, Ordering::SeqCst);
            });
            pinger.start("status", None, Duration::from_millis(5));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Dropped before any tick could fire, or at most cut short immediately.
        let after_drop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_drop);
    }
}
