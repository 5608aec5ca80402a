//! In-memory store walkthrough: write, read back, invalidate, and observe
//! change notifications.
//!
//! Run with: `cargo run --example memory`
//! Set `RUST_LOG=recache=trace` to watch the coordinator's dispatch decisions.

use recache::{Recache, middleware};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "recache=debug".into()),
        )
        .init();

    let store = Recache::builder()
        .use_route(middleware::memory_store(":key+")?)
        .build();

    let dispose = store.on_change(|| tracing::info!("store changed"));

    store
        .put("memory/me", json!({"name": "Ada"}), Default::default())
        .await?;
    tracing::info!(value = ?store.get("memory/me", None), "read back");

    store.invalidate("memory");
    tracing::info!(value = ?store.get("memory/me", None), "after invalidation");

    store.wait().await?;
    dispose();
    Ok(())
}
