//! tc-server: HTTP boundary of the transcoding service.
//!
//! A thin Axum adapter over [`tc_jobs::JobCoordinator`]: it parses requests,
//! hands them to the descriptor builder and coordinator, and maps outcomes
//! onto HTTP responses. Shutdown stops intake, cancels in-flight jobs and
//! drains open connections.

pub mod context;
pub mod error;
pub mod middleware;
pub mod router;
pub mod routes;

use std::net::SocketAddr;

use tc_av::ToolRegistry;
use tc_core::config::Config;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;

/// Start the transcoding server.
///
/// Validates the configuration, discovers ffmpeg, binds the listener and
/// serves until SIGINT/SIGTERM.
pub async fn start(config: Config) -> tc_core::Result<()> {
    config.check()?;
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    let tools = ToolRegistry::discover(&config.tools);
    for info in tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::debug!("Tool not found: {}", info.name);
        }
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| tc_core::Error::Internal(format!("Invalid server address: {e}")))?;

    let ctx = AppContext::new(config, tools)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| tc_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;
    tracing::info!(
        "Starting server on {addr} ({} slots, queue {})",
        ctx.config.jobs.max_concurrent_jobs,
        ctx.config.jobs.max_queue_length
    );

    serve(ctx, listener, CancellationToken::new()).await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Serve `ctx` on `listener` until a shutdown signal arrives or `cancel`
/// fires. Running jobs are cancelled before connections are drained.
pub async fn serve(
    ctx: AppContext,
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
) -> tc_core::Result<()> {
    let coordinator = ctx.coordinator.clone();
    let app = router::build_router(ctx);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(cancel).await;
            coordinator.shutdown().await;
        })
        .await
        .map_err(|e| tc_core::Error::Internal(format!("Server error: {e}")))
}

/// Wait for a shutdown signal (SIGINT or SIGTERM) or cancellation.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
