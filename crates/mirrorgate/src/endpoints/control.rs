use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use chrono::Local;

use super::{ResponseError, ServerState};

/// How long in-flight requests may take to complete after `/!exit`.
const GRACE_PERIOD: Duration = Duration::from_secs(10);

fn confirmation(message: &str) -> String {
    format!("{message} ({})", Local::now().format("%d/%b/%Y:%H:%M:%S %z"))
}

pub async fn reload(State(state): State<ServerState>) -> Result<String, ResponseError> {
    state
        .service
        .reload()
        .context("reloading the configuration failed, keeping the previous one")?;
    Ok(confirmation("Reload succeeded."))
}

pub async fn clear(State(state): State<ServerState>) -> String {
    state.service.clear_cache();
    confirmation("Cache clear succeeded.")
}

pub async fn exit(State(state): State<ServerState>) -> String {
    tracing::info!("Shutdown requested");
    state.shutdown.graceful_shutdown(Some(GRACE_PERIOD));
    confirmation("Shutting down.")
}
