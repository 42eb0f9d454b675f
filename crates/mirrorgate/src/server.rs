use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use mirrorgate_service::config::Config;
use mirrorgate_service::metric;
use mirrorgate_service::service::EdgeService;

use crate::endpoints::{self, ServerState};

/// Starts the background workers and the HTTP server based on the loaded config.
///
/// Returns once the server was shut down via `/!exit` or a termination signal, after all
/// background workers have finished.
pub fn run(config_path: Option<PathBuf>, config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let io_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("mirrorgate-io")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("mirrorgate-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;

    let service = EdgeService::create(config_path, config, io_pool.handle())
        .context("failed to create the edge service")?;
    let state = ServerState {
        service: Arc::new(service),
        shutdown: axum_server::Handle::new(),
    };

    let app = endpoints::create_app(state.clone());
    let server = axum_server::bind(socket)
        .handle(state.shutdown.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    tracing::info!("Starting HTTP server on {}", socket);

    let result = web_pool.block_on(async {
        tokio::spawn(shutdown_on_signal(state.shutdown.clone()));
        server.await
    });

    web_pool.block_on(state.service.shutdown());
    result.context("HTTP server failed")?;
    tracing::info!("System shutdown complete");

    Ok(())
}

/// Shuts the server down gracefully on `SIGINT` (Ctrl+C).
async fn shutdown_on_signal(handle: axum_server::Handle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received interrupt, shutting down");
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        }
        Err(error) => {
            let error: &dyn std::error::Error = &error;
            tracing::error!(error, "Failed to listen for the interrupt signal");
        }
    }
}
