//! Read-only stats endpoint scraped by the zeroscaler.
//!
//! Serves `{proxyID, requestCount}` on a separate port so scraping never
//! competes with (or counts as) application traffic. Doubles as the
//! sidecar's health surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use osiris_core::ProxyStats;

/// Shared state for the stats handlers.
#[derive(Clone)]
pub struct StatsState {
    /// Process-stable identifier reported with every scrape.
    pub proxy_id: String,
    /// The same atomic the proxy increments.
    pub request_count: Arc<AtomicU64>,
}

/// Build the stats router.
pub fn stats_router(state: StatsState) -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve the stats router until the shutdown signal fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: StatsState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "stats endpoint listening");
    axum::serve(listener, stats_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn stats(State(state): State<StatsState>) -> Json<ProxyStats> {
    Json(ProxyStats {
        proxy_id: state.proxy_id.clone(),
        request_count: state.request_count.load(Ordering::SeqCst),
    })
}

async fn healthz() -> &'static str {
    "ok"
}
