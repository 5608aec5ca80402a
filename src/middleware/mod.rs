//! Built-in adapters — handlers that serve requests out of coordinator state.
//!
//! Two flavors of the same in-memory backend are provided:
//!
//! - [`memory_fn`] — a plain function handler that catches every request.
//! - [`memory_store`] — the route-table flavor, mounted under a pattern so it
//!   can coexist with other routes in one pipeline. Its read side answers
//!   [`NOT_MODIFIED`] instead of echoing the value, exercising the
//!   cached-value-reuse path.
//!
//! Both settle synchronously, which keeps reads through them zero-latency.

use crate::context::{Context, NOT_MODIFIED};
use crate::eventual::Eventual;
use crate::pipeline::{Next, Route};
use crate::route::PatternError;

/// In-memory backend as a catch-all function handler.
///
/// Reads answer with the coordinator's currently cached value for the request
/// url (absent stays absent). Writes store the request input directly into the
/// cache and echo it as the response body. Never calls through to later
/// handlers.
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
///     store.put("notes/1", json!("first"), Default::default()).await?;
///     assert_eq!(store.get("notes/1", None), Some(json!("first")));
///     Ok(())
/// }
/// ```
pub fn memory_fn() -> impl Fn(Context, Next) -> Eventual<Context> + Send + Sync + 'static {
    |mut ctx: Context, _next: Next| {
        if ctx.method().is_read() {
            if let Some(value) = ctx.coordinator().peek(ctx.url()) {
                ctx.set_body(value);
            }
        } else if let Some(input) = ctx.take_input() {
            ctx.coordinator().cache(ctx.url().to_owned(), input.clone());
            ctx.set_body(input);
        }
        Eventual::ok(ctx)
    }
}

/// In-memory backend as a route, mounted under `pattern`.
///
/// The read side stores nothing and sets [`NOT_MODIFIED`], so the coordinator
/// keeps whatever value the write side put there. The write side caches the
/// input under the full request url and echoes it.
///
/// # Errors
///
/// Propagates [`PatternError`] when `pattern` does not compile.
pub fn memory_store(pattern: &str) -> Result<Route, PatternError> {
    fn read(mut ctx: Context, _next: Next) -> Eventual<Context> {
        // The coordinator re-reads its own cache on 304; nothing to do here.
        ctx.set_status(NOT_MODIFIED);
        Eventual::ok(ctx)
    }

    fn write(mut ctx: Context, _next: Next) -> Eventual<Context> {
        if let Some(input) = ctx.take_input() {
            ctx.coordinator().cache(ctx.url().to_owned(), input.clone());
            ctx.set_body(input);
        }
        Eventual::ok(ctx)
    }

    Ok(Route::new(pattern)?.get(read).put(write).post(write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Recache;
    use crate::context::RequestOptions;
    use serde_json::json;

    // ── memory_fn ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn memory_fn_serves_reads_from_cache() {
        let store = Recache::builder().use_fn(memory_fn()).build();
        store.cache("k", json!(1));
        store.invalidate("k");
        assert_eq!(store.get("k", None), Some(json!(1)));
    }

    #[tokio::test]
    async fn memory_fn_write_echoes_and_stores() {
        let store = Recache::builder().use_fn(memory_fn()).build();
        let echoed = store
            .post("k", json!({"a": 1}), RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(echoed, Some(json!({"a": 1})));
        assert_eq!(store.peek("k"), Some(json!({"a": 1})));
    }

    // ── memory_store ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn memory_store_roundtrip_through_not_modified() {
        let store = Recache::builder()
            .use_route(memory_store(":key+").unwrap())
            .build();

        assert_eq!(store.get("memory/me", None), None);
        store
            .put("memory/me", json!("Data"), RequestOptions::new())
            .await
            .unwrap();
        // The read side answers 304; the coordinator reuses the written value.
        assert_eq!(store.get("memory/me", None), Some(json!("Data")));
    }

    #[tokio::test]
    async fn memory_store_under_prefix_leaves_other_paths_alone() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = std::sync::Arc::clone(&calls);
        let store = Recache::builder()
            .use_route(memory_store("memory/:key+").unwrap())
            .use_fn(move |mut ctx, _next| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                ctx.set_body(json!("fallback"));
                Eventual::ok(ctx)
            })
            .build();

        store
            .put("memory/me", json!("Data"), RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(store.get("memory/me", None), Some(json!("Data")));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        assert_eq!(store.get("other/path", None), Some(json!("fallback")));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
