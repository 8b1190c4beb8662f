#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::info;

pub mod config;
pub mod server;

pub use config::Config;
pub use server::{AppState, build_router};

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "easel gateway listening"
    );
    let state = AppState::new(config);
    spawn_idle_eviction(&state);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Periodic sweep that drops bridges nobody has touched for the
/// configured idle window. Sessions with an attached client are never
/// swept.
fn spawn_idle_eviction(state: &AppState) {
    let sessions = Arc::clone(state.sessions());
    let max_idle = state.config().session_idle_evict();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = sessions.evict_idle(max_idle);
            if evicted > 0 {
                info!(evicted, "idle session sweep");
            }
        }
    });
}
