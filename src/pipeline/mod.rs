//! Middleware pipeline — ordered, onion-style handler composition.
//!
//! A [`Pipeline`] holds an ordered registry of handlers. Each entry is either
//! a plain function or a [`Route`] — a path pattern with a per-method handler
//! table. [`Pipeline::run`] dispatches a [`Context`] from the front of the
//! registry; every handler receives the context together with a [`Next`]
//! cursor and decides whether to continue the chain, short-circuit, or
//! decorate the result on the way back out.
//!
//! Two properties drive the design:
//!
//! - **Synchronous settlement.** Handlers return [`Eventual`], not a boxed
//!   future, so a chain in which every step settles synchronously produces a
//!   `Ready` result that callers can inspect without suspending. This is what
//!   makes zero-latency cache reads possible.
//! - **At-most-once continuation.** [`Next::run`] consumes the cursor, so a
//!   handler cannot invoke the rest of the chain twice.
//!
//! Chain exhaustion is not an error: a request no handler claims passes
//! through with its context unmodified.

use std::sync::Arc;

use crate::context::{Context, Method};
use crate::eventual::Eventual;
use crate::route::{Pattern, PatternError};

/// A type-erased, reference-counted pipeline handler.
///
/// Handlers receive ownership of the [`Context`] and a [`Next`] cursor and
/// return an [`Eventual`] of the (possibly mutated) context. Returning without
/// calling [`Next::run`] terminates the chain; handlers signal failure with
/// [`Eventual::err`].
pub type Handler = Arc<dyn Fn(Context, Next) -> Eventual<Context> + Send + Sync + 'static>;

// A registry entry, resolved once at dispatch time by explicit variant
// inspection.
enum Registered {
    Func(Handler),
    Route(Route),
}

/// A route-scoped method table: a path pattern plus per-method handlers and an
/// optional generic fallback.
///
/// When the pattern does not match the request path, or no handler applies to
/// the request method, the entry is skipped transparently and dispatch moves
/// on to the next registry entry.
///
/// # Examples
///
/// ```
/// use recache::{Eventual, Route};
///
/// let route = Route::new("user/:id")?
///     .get(|mut ctx, _next| {
///         let id = ctx.params().get("id").unwrap_or("").to_owned();
///         ctx.set_body(serde_json::json!(format!("get {id}")));
///         Eventual::ok(ctx)
///     });
/// # Ok::<(), recache::PatternError>(())
/// ```
pub struct Route {
    pattern: Pattern,
    get: Option<Handler>,
    put: Option<Handler>,
    post: Option<Handler>,
    any: Option<Handler>,
}

impl Route {
    /// Compile `pattern` into an empty method table.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] for malformed patterns — a configuration
    /// error surfaced at registration, never at dispatch.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        Ok(Self {
            pattern: Pattern::parse(pattern)?,
            get: None,
            put: None,
            post: None,
            any: None,
        })
    }

    /// Handler for read requests.
    pub fn get<F>(mut self, handler: F) -> Self
    where
        F: Fn(Context, Next) -> Eventual<Context> + Send + Sync + 'static,
    {
        self.get = Some(Arc::new(handler));
        self
    }

    /// Handler for update requests.
    pub fn put<F>(mut self, handler: F) -> Self
    where
        F: Fn(Context, Next) -> Eventual<Context> + Send + Sync + 'static,
    {
        self.put = Some(Arc::new(handler));
        self
    }

    /// Handler for create requests.
    pub fn post<F>(mut self, handler: F) -> Self
    where
        F: Fn(Context, Next) -> Eventual<Context> + Send + Sync + 'static,
    {
        self.post = Some(Arc::new(handler));
        self
    }

    /// Generic fallback used when no method-specific handler is registered.
    pub fn any<F>(mut self, handler: F) -> Self
    where
        F: Fn(Context, Next) -> Eventual<Context> + Send + Sync + 'static,
    {
        self.any = Some(Arc::new(handler));
        self
    }

    // Method-specific handler first, generic fallback second.
    fn select(&self, method: Method) -> Option<&Handler> {
        let specific = match method {
            Method::Get => self.get.as_ref(),
            Method::Put => self.put.as_ref(),
            Method::Post => self.post.as_ref(),
        };
        specific.or(self.any.as_ref())
    }
}

/// Cursor into the remaining handler chain for a single request.
///
/// Passed to every handler; calling [`run`](Self::run) advances past the
/// current handler and dispatches the rest of the chain. `Next` is consumed by
/// `run`, so the continuation can be invoked at most once per handler.
pub struct Next {
    entries: Vec<Arc<Registered>>,
    index: usize,
}

impl Next {
    fn new(entries: Vec<Arc<Registered>>) -> Self {
        Self { entries, index: 0 }
    }

    /// Dispatch the remainder of the chain with `ctx`.
    ///
    /// Route entries whose pattern or method does not apply are skipped
    /// without observable effect. When the chain is exhausted the context is
    /// returned unchanged — absence of a matching handler is not an error.
    pub fn run(mut self, mut ctx: Context) -> Eventual<Context> {
        while self.index < self.entries.len() {
            let entry = Arc::clone(&self.entries[self.index]);
            self.index += 1;

            match &*entry {
                Registered::Func(handler) => return handler(ctx, self),
                Registered::Route(route) => {
                    let Some(params) = route.pattern.matches(ctx.pathname()) else {
                        tracing::trace!(
                            pattern = route.pattern.as_str(),
                            path = ctx.pathname(),
                            "route pattern skipped"
                        );
                        continue;
                    };
                    let Some(handler) = route.select(ctx.method()) else {
                        continue;
                    };
                    let handler = Arc::clone(handler);
                    ctx.set_params(params);
                    return handler(ctx, self);
                }
            }
        }

        Eventual::ok(ctx)
    }
}

/// Ordered, registration-time-mutable handler registry.
///
/// Handlers are appended with [`use_fn`](Self::use_fn) /
/// [`use_route`](Self::use_route) while the pipeline is being assembled and
/// are immutable once the owning coordinator is built. Relative order across
/// repeated registrations is preserved and determines dispatch priority.
#[derive(Default)]
pub struct Pipeline {
    entries: Vec<Arc<Registered>>,
}

impl Pipeline {
    /// An empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plain function handler.
    pub fn use_fn<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Next) -> Eventual<Context> + Send + Sync + 'static,
    {
        self.entries
            .push(Arc::new(Registered::Func(Arc::new(handler))));
        self
    }

    /// Append a route-scoped method table.
    pub fn use_route(&mut self, route: Route) -> &mut Self {
        self.entries.push(Arc::new(Registered::Route(route)));
        self
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispatch `ctx` through the registry starting at index 0.
    ///
    /// Returns `Ready` when every invoked handler settled synchronously; a
    /// handler failure aborts the remaining chain and surfaces as a rejected
    /// [`Eventual`].
    pub fn run(&self, ctx: Context) -> Eventual<Context> {
        Next::new(self.entries.clone()).run(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Recache;
    use crate::context::{Method, RequestData, RequestOptions};
    use crate::eventual::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx_for(method: Method, url: &str) -> Context {
        let coordinator = Recache::builder().build();
        let data = match method {
            Method::Get => RequestData::read(url, RequestOptions::new()),
            other => RequestData::write(other, url, json!(null), RequestOptions::new()),
        };
        Context::new(coordinator, data)
    }

    // ── Dispatch basics ───────────────────────────────────────────────────────

    #[test]
    fn empty_pipeline_passes_context_through() {
        let pipeline = Pipeline::new();
        let result = pipeline.run(ctx_for(Method::Get, "anything"));
        assert!(result.is_fulfilled());
        let ctx = result.into_ready().unwrap().unwrap();
        assert!(ctx.body().is_none());
    }

    #[test]
    fn sync_chain_settles_ready() {
        let mut pipeline = Pipeline::new();
        pipeline.use_fn(|mut ctx, _next| {
            ctx.set_body(json!("value"));
            Eventual::ok(ctx)
        });
        let result = pipeline.run(ctx_for(Method::Get, "a"));
        assert!(result.is_ready());
        let ctx = result.into_ready().unwrap().unwrap();
        assert_eq!(ctx.body(), Some(&json!("value")));
    }

    #[test]
    fn handler_without_next_terminates_chain() {
        static REACHED: AtomicUsize = AtomicUsize::new(0);
        let mut pipeline = Pipeline::new();
        pipeline.use_fn(|ctx, _next| Eventual::ok(ctx));
        pipeline.use_fn(|ctx, _next| {
            REACHED.fetch_add(1, Ordering::SeqCst);
            Eventual::ok(ctx)
        });
        let result = pipeline.run(ctx_for(Method::Get, "a"));
        assert!(result.is_fulfilled());
        assert_eq!(REACHED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn registration_order_is_dispatch_order() {
        let mut pipeline = Pipeline::new();
        pipeline.use_fn(|ctx, next| {
            next.run(ctx).and_then(|mut ctx| {
                let so_far = ctx.body().cloned().unwrap_or(json!(""));
                ctx.set_body(json!(format!("{} World", so_far.as_str().unwrap_or(""))));
                Eventual::ok(ctx)
            })
        });
        pipeline.use_fn(|mut ctx, _next| {
            ctx.set_body(json!("Hello"));
            Eventual::ok(ctx)
        });
        let ctx = pipeline
            .run(ctx_for(Method::Get, "a"))
            .into_ready()
            .unwrap()
            .unwrap();
        assert_eq!(ctx.body(), Some(&json!("Hello World")));
    }

    // ── Route entries ─────────────────────────────────────────────────────────

    #[test]
    fn route_table_dispatches_by_method_and_populates_params() {
        let mut pipeline = Pipeline::new();
        pipeline.use_route(
            Route::new("user/:id")
                .unwrap()
                .get(|mut ctx, _next| {
                    let id = ctx.params().get("id").unwrap_or("").to_owned();
                    ctx.set_body(json!(format!("get {id}")));
                    Eventual::ok(ctx)
                })
                .put(|mut ctx, _next| {
                    let id = ctx.params().get("id").unwrap_or("").to_owned();
                    ctx.set_body(json!(format!("put {id}")));
                    Eventual::ok(ctx)
                }),
        );

        let get = pipeline
            .run(ctx_for(Method::Get, "user/123"))
            .into_ready()
            .unwrap()
            .unwrap();
        assert_eq!(get.body(), Some(&json!("get 123")));

        let put = pipeline
            .run(ctx_for(Method::Put, "user/123"))
            .into_ready()
            .unwrap()
            .unwrap();
        assert_eq!(put.body(), Some(&json!("put 123")));
    }

    #[test]
    fn non_matching_route_is_skipped() {
        let mut pipeline = Pipeline::new();
        pipeline.use_route(Route::new("lesson").unwrap().get(|ctx, next| {
            next.run(ctx).and_then(|mut ctx| {
                let body = ctx.body().cloned().unwrap_or(json!(""));
                ctx.set_body(json!(format!("{} World", body.as_str().unwrap_or(""))));
                Eventual::ok(ctx)
            })
        }));
        pipeline.use_route(Route::new("not-found/:key").unwrap().get(|mut ctx, _next| {
            ctx.set_status(404);
            Eventual::ok(ctx)
        }));
        pipeline.use_fn(|mut ctx, _next| {
            ctx.set_body(json!("Hello"));
            Eventual::ok(ctx)
        });

        let lesson = pipeline
            .run(ctx_for(Method::Get, "lesson"))
            .into_ready()
            .unwrap()
            .unwrap();
        assert_eq!(lesson.body(), Some(&json!("Hello World")));

        let not_found = pipeline
            .run(ctx_for(Method::Get, "not-found/123"))
            .into_ready()
            .unwrap()
            .unwrap();
        assert_eq!(not_found.status(), Some(404));
        assert!(not_found.body().is_none());

        let other = pipeline
            .run(ctx_for(Method::Get, "lesson/bD0n20Wn"))
            .into_ready()
            .unwrap()
            .unwrap();
        assert_eq!(other.body(), Some(&json!("Hello")));
    }

    #[test]
    fn method_without_handler_skips_to_next_entry() {
        let mut pipeline = Pipeline::new();
        pipeline.use_route(Route::new("item/:id").unwrap().put(|mut ctx, _next| {
            ctx.set_body(json!("stored"));
            Eventual::ok(ctx)
        }));
        pipeline.use_fn(|mut ctx, _next| {
            ctx.set_body(json!("fallthrough"));
            Eventual::ok(ctx)
        });

        let ctx = pipeline
            .run(ctx_for(Method::Get, "item/1"))
            .into_ready()
            .unwrap()
            .unwrap();
        assert_eq!(ctx.body(), Some(&json!("fallthrough")));
    }

    #[test]
    fn any_fallback_covers_unlisted_methods() {
        let mut pipeline = Pipeline::new();
        pipeline.use_route(Route::new("kv/:key+").unwrap().any(|mut ctx, _next| {
            ctx.set_body(json!(ctx.method().as_str()));
            Eventual::ok(ctx)
        }));

        let ctx = pipeline
            .run(ctx_for(Method::Post, "kv/a/b"))
            .into_ready()
            .unwrap()
            .unwrap();
        assert_eq!(ctx.body(), Some(&json!("POST")));
    }

    // ── Failure and async paths ───────────────────────────────────────────────

    #[test]
    fn handler_failure_aborts_chain() {
        static AFTER: AtomicUsize = AtomicUsize::new(0);
        let mut pipeline = Pipeline::new();
        pipeline.use_fn(|_ctx, _next| Eventual::err(Error::handler("backend down")));
        pipeline.use_fn(|ctx, _next| {
            AFTER.fetch_add(1, Ordering::SeqCst);
            Eventual::ok(ctx)
        });

        let result = pipeline.run(ctx_for(Method::Get, "a"));
        assert!(matches!(result.into_ready(), Some(Err(Error::Handler(_)))));
        assert_eq!(AFTER.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn async_handler_goes_pending_then_settles() {
        let mut pipeline = Pipeline::new();
        pipeline.use_fn(|mut ctx, _next| {
            Eventual::from_future(async move {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                ctx.set_body(json!("fetched"));
                Ok(ctx)
            })
        });

        let result = pipeline.run(ctx_for(Method::Get, "a"));
        assert!(!result.is_ready());
        let ctx = result.await.unwrap();
        assert_eq!(ctx.body(), Some(&json!("fetched")));
    }

    #[tokio::test]
    async fn onion_decoration_works_across_await() {
        let mut pipeline = Pipeline::new();
        pipeline.use_fn(|ctx, next| {
            next.run(ctx).and_then(|mut ctx| {
                let body = ctx.body().cloned().unwrap_or(json!(""));
                ctx.set_body(json!(format!("[{}]", body.as_str().unwrap_or(""))));
                Eventual::ok(ctx)
            })
        });
        pipeline.use_fn(|mut ctx, _next| {
            Eventual::from_future(async move {
                ctx.set_body(json!("inner"));
                Ok(ctx)
            })
        });

        let ctx = pipeline.run(ctx_for(Method::Get, "a")).await.unwrap();
        assert_eq!(ctx.body(), Some(&json!("[inner]")));
    }
}
