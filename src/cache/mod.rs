//! Cache coordinator — owns cache state and drives the pipeline per request.
//!
//! [`Recache`] is the crate's central type: a cheap-to-clone handle over one
//! coordinator instance owning the cache map, the staleness timestamps, the
//! in-flight request table, the observer list, and the debounced-notification
//! handle. Distinct instances are fully independent.
//!
//! Per key, staleness moves through four states:
//!
//! ```text
//! Unloaded ──read──▶ Loading ──settle──▶ Fresh ──invalidate──▶ Stale ──read──▶ Loading
//! ```
//!
//! A write never passes its own key through `Loading`; settling a write drops
//! the staleness timestamp for the written url and every key it prefixes, so
//! the next read refetches. Values are retained across invalidation — only
//! the timestamps go.
//!
//! Concurrency model: all state lives behind one mutex taken only for short
//! synchronous sections, never across an `.await`. Handlers run outside the
//! lock and may re-enter the coordinator through the context back-reference.
//! Pending requests and the debounce timer are driven eagerly by spawned
//! tasks, so fire-and-forget refreshes complete without anyone awaiting them;
//! this requires a Tokio runtime context for any operation that does not
//! settle synchronously (and for change notification).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;

use crate::context::{Context, Method, NOT_MODIFIED, RequestData, RequestOptions};
use crate::eventual::{Error, Eventual};
use crate::pipeline::{Next, Pipeline, Route};
use crate::pinger::Pinger;

/// Deterministically ordered query parameters; serialization order is the
/// B-tree key order, so equal queries always produce equal cache keys.
pub type Query = BTreeMap<String, String>;

/// Default debounce window for change notification.
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

// Settlement of one in-flight read, shareable across coalesced callers.
type SharedLoad = Shared<BoxFuture<'static, Result<Option<Value>, Error>>>;

// Pending debounced-notification handle; completes once listeners have run.
type SharedNotify = Shared<BoxFuture<'static, ()>>;

type Listener = Arc<dyn Fn() + Send + Sync + 'static>;

/// Compute the canonical resource identifier: pathname plus a
/// deterministically serialized query string.
///
/// # Examples
///
/// ```
/// use recache::{Query, canonical_url};
///
/// let mut query = Query::new();
/// query.insert("page".into(), "2".into());
/// query.insert("filter".into(), "open".into());
/// assert_eq!(canonical_url("issues", Some(&query)), "issues?filter=open&page=2");
/// assert_eq!(canonical_url("issues", None), "issues");
/// ```
pub fn canonical_url(pathname: &str, query: Option<&Query>) -> String {
    match query {
        Some(query) if !query.is_empty() => {
            let serialized = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(query.iter())
                .finish();
            format!("{pathname}?{serialized}")
        }
        _ => pathname.to_owned(),
    }
}

/// Result of a conditional read.
#[derive(Debug)]
pub struct PingOutcome {
    /// Best value available right now: the refreshed value when the reload
    /// settled synchronously, otherwise whatever the cache held.
    pub value: Option<Value>,
    /// The in-flight refresh, present when a reload was initiated but did not
    /// settle fulfilled synchronously. Await it to observe the update (or the
    /// failure).
    pub refresh: Option<Eventual<Option<Value>>>,
}

// Mutable coordinator state. Mutated only at well-defined points between
// suspension points, under the single mutex.
struct State {
    caches: HashMap<String, Value>,
    modifieds: HashMap<String, DateTime<Utc>>,
    inflight: HashMap<String, SharedLoad>,
    notify: Option<SharedNotify>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

struct Inner {
    state: Mutex<State>,
    pipeline: Pipeline,
    debounce: Duration,
}

/// Builder for a [`Recache`] coordinator.
///
/// Handlers are registered here and frozen at [`build`](Self::build); the
/// ordered insertion sequence determines dispatch priority. Seeded cache
/// entries are treated as fresh as of construction time.
pub struct RecacheBuilder {
    pipeline: Pipeline,
    seeds: HashMap<String, Value>,
    debounce: Duration,
}

impl RecacheBuilder {
    fn new() -> Self {
        Self {
            pipeline: Pipeline::new(),
            seeds: HashMap::new(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Append a plain function handler to the pipeline.
    pub fn use_fn<F>(mut self, handler: F) -> Self
    where
        F: Fn(Context, Next) -> Eventual<Context> + Send + Sync + 'static,
    {
        self.pipeline.use_fn(handler);
        self
    }

    /// Append a route-scoped method table to the pipeline.
    pub fn use_route(mut self, route: Route) -> Self {
        self.pipeline.use_route(route);
        self
    }

    /// Seed a cache entry, fresh as of construction.
    pub fn seed(mut self, url: impl Into<String>, value: Value) -> Self {
        self.seeds.insert(url.into(), value);
        self
    }

    /// Override the change-notification debounce window.
    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    /// Freeze the pipeline and produce the coordinator.
    pub fn build(self) -> Recache {
        let now = Utc::now();
        let modifieds = self.seeds.keys().map(|url| (url.clone(), now)).collect();
        Recache {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    caches: self.seeds,
                    modifieds,
                    inflight: HashMap::new(),
                    notify: None,
                    listeners: Vec::new(),
                    next_listener_id: 0,
                }),
                pipeline: self.pipeline,
                debounce: self.debounce,
            }),
        }
    }
}

/// The cache coordinator.
///
/// Reads go through [`ping`](Self::ping) / [`get`](Self::get) /
/// [`load`](Self::load); writes through [`put`](Self::put) /
/// [`post`](Self::post). Every operation dispatches a [`Context`] through the
/// frozen pipeline and interprets the settled context according to its method.
///
/// Every operation that mutates cache state schedules the debounced change
/// notification on the current Tokio runtime and panics when called outside
/// one; only pure inspection ([`peek`](Self::peek), [`modified`](Self::modified))
/// and reads answered entirely from fresh cache are runtime-free.
///
/// # Examples
///
/// ```rust,no_run
/// use recache::{Recache, middleware};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), recache::Error> {
///     let store = Recache::builder().use_fn(middleware::memory_fn()).build();
///
///     assert_eq!(store.get("memory/me", None), None);
///     store.put("memory/me", json!("Data"), Default::default()).await?;
///     assert_eq!(store.get("memory/me", None), Some(json!("Data")));
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Recache {
    inner: Arc<Inner>,
}

impl Recache {
    /// Start building a coordinator.
    pub fn builder() -> RecacheBuilder {
        RecacheBuilder::new()
    }

    // Poison-tolerant lock: state mutations are small enough that a panicked
    // holder leaves nothing half-updated worth refusing over.
    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Conditional read.
    ///
    /// Computes the canonical url and reloads when no staleness timestamp
    /// exists or the cached timestamp predates `if_modified_since`. The load
    /// carries the greater of the two candidate instants as its
    /// conditional-fetch marker. If the reload settles fulfilled
    /// synchronously, the refreshed value is returned; otherwise the caller
    /// gets the currently cached value (possibly absent) together with the
    /// in-flight [`Eventual`] to await.
    pub fn ping(
        &self,
        pathname: &str,
        query: Option<&Query>,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> PingOutcome {
        let url = canonical_url(pathname, query);
        let (cached, modified) = {
            let state = self.state();
            (
                state.caches.get(&url).cloned(),
                state.modifieds.get(&url).copied(),
            )
        };

        let needs_reload = match (modified, if_modified_since) {
            (None, _) => true,
            (Some(timestamp), Some(bound)) => timestamp < bound,
            (Some(_), None) => false,
        };
        if !needs_reload {
            return PingOutcome {
                value: cached,
                refresh: None,
            };
        }

        let mut options = RequestOptions::new();
        if let Some(marker) = match (modified, if_modified_since) {
            (Some(timestamp), Some(bound)) => Some(timestamp.max(bound)),
            (timestamp, bound) => timestamp.or(bound),
        } {
            options = options.if_modified_since(marker);
        }

        let result = self.load(&url, options);
        if result.is_fulfilled() {
            let value = result.into_ready().and_then(Result::ok).flatten();
            return PingOutcome {
                value,
                refresh: None,
            };
        }

        PingOutcome {
            value: cached,
            refresh: Some(result),
        }
    }

    /// Synchronous convenience read: the best value available right now.
    ///
    /// A stale or unloaded key still triggers a background refresh; callers
    /// that need to observe the refresh use [`ping`](Self::ping) or
    /// [`load`](Self::load) instead.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime when the key needs a refresh, because
    /// absorbing the result schedules the debounced change notification.
    pub fn get(&self, pathname: &str, query: Option<&Query>) -> Option<Value> {
        self.ping(pathname, query, None).value
    }

    /// Read `url` through the pipeline with request coalescing.
    ///
    /// Returns the existing in-flight settlement when one exists; otherwise
    /// reserves the url's in-flight slot and runs a new read request. The
    /// check and the reservation happen under a single lock acquisition, so
    /// concurrent loads of the same url from any thread share exactly one
    /// pipeline execution. A request that settles synchronously releases the
    /// slot before returning; a pending request is driven to completion by a
    /// spawned task (a Tokio runtime must be current) and releases the slot
    /// on settlement — success or failure — before any waiter observes
    /// completion, so a failed read can simply be retried.
    pub fn load(&self, url: &str, options: RequestOptions) -> Eventual<Option<Value>> {
        let (tx, rx) = oneshot::channel::<Result<Option<Value>, Error>>();
        let slot: SharedLoad = async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::handler("request dropped before settling")),
            }
        }
        .boxed()
        .shared();

        {
            let mut state = self.state();
            if let Some(existing) = state.inflight.get(url) {
                tracing::debug!(%url, "read coalesced onto in-flight request");
                return Eventual::from_future(existing.clone());
            }
            state.inflight.insert(url.to_owned(), slot.clone());
        }

        match self.request(RequestData::read(url, options)) {
            Eventual::Ready(result) => {
                self.state().inflight.remove(url);
                // Anyone who coalesced during the synchronous run still gets
                // the outcome through the slot.
                let _ = tx.send(result.clone());
                Eventual::Ready(result)
            }
            Eventual::Pending(pending) => {
                let this = self.clone();
                let key = url.to_owned();
                tokio::spawn(async move {
                    let outcome = pending.await;
                    this.state().inflight.remove(&key);
                    let _ = tx.send(outcome);
                });
                Eventual::from_future(slot)
            }
        }
    }

    /// Update `url` with `input` (write-through). Requires a current Tokio
    /// runtime; see [`Recache`].
    pub fn put(&self, url: &str, input: Value, options: RequestOptions) -> Eventual<Option<Value>> {
        self.write(Method::Put, url, input, options)
    }

    /// Create `url` with `input` (write-through). Requires a current Tokio
    /// runtime; see [`Recache`].
    pub fn post(
        &self,
        url: &str,
        input: Value,
        options: RequestOptions,
    ) -> Eventual<Option<Value>> {
        self.write(Method::Post, url, input, options)
    }

    fn write(
        &self,
        method: Method,
        url: &str,
        input: Value,
        options: RequestOptions,
    ) -> Eventual<Option<Value>> {
        match self.request(RequestData::write(method, url, input, options)) {
            ready @ Eventual::Ready(_) => ready,
            // Writes are driven eagerly too, but never coalesced: they are not
            // reads and do not enter the in-flight table.
            Eventual::Pending(pending) => {
                let settled: SharedLoad = pending.shared();
                tokio::spawn(settled.clone().map(|_| ()));
                Eventual::from_future(settled)
            }
        }
    }

    /// Dispatch raw request data through the pipeline and interpret the
    /// settled context by method.
    ///
    /// Reads bump the url's staleness timestamp; a [`NOT_MODIFIED`] status
    /// reuses the cached value, any other outcome replaces it with the
    /// returned body. Writes invalidate the written url and every key it
    /// prefixes. Both paths schedule a debounced change notification and
    /// yield the response body; pipeline rejections propagate untouched.
    pub fn request(&self, data: RequestData) -> Eventual<Option<Value>> {
        let ctx = Context::new(self.clone(), data);
        let this = self.clone();
        self.inner
            .pipeline
            .run(ctx)
            .and_then(move |ctx| Eventual::ok(this.absorb(ctx)))
    }

    // Interpret a settled context: the single point where pipeline results
    // become cache state.
    fn absorb(&self, mut ctx: Context) -> Option<Value> {
        let url = ctx.url().to_owned();
        let method = ctx.method();
        let status = ctx.status();
        let body = ctx.take_body();

        let value = {
            let mut state = self.state();
            state.modifieds.insert(url.clone(), Utc::now());

            if method.is_read() {
                if status == Some(NOT_MODIFIED) {
                    tracing::trace!(%url, "not modified, reusing cached value");
                    state.caches.get(&url).cloned()
                } else {
                    match body {
                        Some(value) => {
                            tracing::trace!(%url, "cache refreshed");
                            state.caches.insert(url, value.clone());
                            Some(value)
                        }
                        None => {
                            // Absence is cached as fresh: the timestamp above
                            // keeps the next read from refetching.
                            state.caches.remove(&url);
                            None
                        }
                    }
                }
            } else {
                let dropped = invalidate_locked(&mut state, &url);
                tracing::debug!(%url, dropped, "write settled, staleness dropped");
                body
            }
        };

        self.schedule_change();
        value
    }

    /// Drop the staleness timestamp for every cache key equal to or prefixed
    /// by `prefix`, forcing the next read of those keys to refetch. Stored
    /// values are retained. Returns the number of keys invalidated.
    pub fn invalidate(&self, prefix: &str) -> usize {
        invalidate_locked(&mut self.state(), prefix)
    }

    /// Directly set a cache value and mark it fresh, then schedule a change
    /// notification. This is the write path used by adapters.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime: the change notification needs the
    /// runtime's timer for its debounce window.
    pub fn cache(&self, url: impl Into<String>, body: Value) {
        let url = url.into();
        {
            let mut state = self.state();
            state.caches.insert(url.clone(), body);
            state.modifieds.insert(url, Utc::now());
        }
        self.schedule_change();
    }

    /// Current cached value for `url`, without touching staleness or
    /// triggering a load.
    pub fn peek(&self, url: &str) -> Option<Value> {
        self.state().caches.get(url).cloned()
    }

    /// Staleness timestamp for `url`; absent means unloaded or invalidated.
    pub fn modified(&self, url: &str) -> Option<DateTime<Utc>> {
        self.state().modifieds.get(url).copied()
    }

    /// Settles once there are no in-flight requests and no pending change
    /// notification.
    ///
    /// Re-checks recursively after each quiet point, because continuations of
    /// settling requests may start new ones. A rejected in-flight request
    /// encountered along the way is propagated to the caller rather than
    /// masked — `wait()` settling fulfilled means quiet, not success of every
    /// individual request, but a failure it had to wait on is surfaced.
    pub fn wait(&self) -> Eventual<()> {
        let (inflight, notify) = {
            let state = self.state();
            (
                state.inflight.values().cloned().collect::<Vec<_>>(),
                state.notify.clone(),
            )
        };

        if inflight.is_empty() && notify.is_none() {
            return Eventual::ok(());
        }

        let this = self.clone();
        Eventual::from_future(async move {
            for request in inflight {
                request.await?;
            }
            if let Some(notify) = notify {
                notify.await;
            }
            this.wait().await
        })
    }

    /// Register a change observer; returns a disposer that removes it.
    ///
    /// Observers fire once per debounce window, after the window elapses.
    pub fn on_change<F>(&self, listener: F) -> impl FnOnce() + Send + Sync + 'static
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.state();
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            state.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state.listeners.retain(|(listener_id, _)| *listener_id != id);
            }
        }
    }

    /// Hand a periodic-refresh helper a handle to this coordinator.
    pub fn create_pinger<F>(&self, handler: F) -> Pinger
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        Pinger::new(self.clone(), handler)
    }

    // First mutation in a window starts the timer; later mutations are
    // absorbed. Elapse clears the handle before emitting, so a mutation
    // arriving afterwards starts a fresh window.
    fn schedule_change(&self) {
        let mut state = self.state();
        if state.notify.is_some() {
            return;
        }

        let this = self.clone();
        let window = self.inner.debounce;
        let notify: SharedNotify = async move {
            tokio::time::sleep(window).await;
            let listeners: Vec<Listener> = {
                let mut state = this.state();
                state.notify = None;
                state
                    .listeners
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect()
            };
            tracing::trace!(listeners = listeners.len(), "emitting change notification");
            for listener in &listeners {
                listener();
            }
        }
        .boxed()
        .shared();

        state.notify = Some(notify.clone());
        drop(state);
        tokio::spawn(notify);
    }
}

impl fmt::Debug for Recache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Recache")
            .field("cached", &state.caches.len())
            .field("fresh", &state.modifieds.len())
            .field("inflight", &state.inflight.len())
            .finish_non_exhaustive()
    }
}

fn invalidate_locked(state: &mut State, prefix: &str) -> usize {
    let before = state.modifieds.len();
    state.modifieds.retain(|key, _| !key.starts_with(prefix));
    before - state.modifieds.len()
}
