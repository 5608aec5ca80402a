//! # recache
//!
//! A client-side data-synchronization layer: a composable middleware pipeline
//! in front of a cache coordinator that coalesces requests, tracks staleness,
//! and debounces change notification.
//!
//! Reads that can be answered from warm cache settle synchronously with no
//! executor round-trip; anything that needs real I/O degrades to an ordinary
//! future. One [`Recache`] instance owns one cache, one pipeline, and one
//! observer list; instances are fully independent.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use recache::{Recache, middleware};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Recache::builder()
//!         .use_route(middleware::memory_store(":key+")?)
//!         .build();
//!
//!     store.put("memory/me", json!({"name": "Ada"}), Default::default()).await?;
//!     assert_eq!(store.get("memory/me", None), Some(json!({"name": "Ada"})));
//!
//!     let _dispose = store.on_change(|| println!("something changed"));
//!     store.invalidate("memory");
//!     store.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod eventual;
pub mod middleware;
pub mod pinger;
pub mod pipeline;
pub mod route;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{PingOutcome, Query, Recache, RecacheBuilder, canonical_url};
pub use context::{
    Context, Method, NOT_MODIFIED, Params, RequestData, RequestOptions, UnknownMethod,
};
pub use eventual::{Error, Eventual};
pub use pinger::Pinger;
pub use pipeline::{Handler, Next, Pipeline, Route};
pub use route::{Pattern, PatternError};
