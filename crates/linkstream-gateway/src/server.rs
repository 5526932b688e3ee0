//! Server startup and lifecycle

use crate::{routes, AppState, GatewayConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Run the gateway server
pub async fn run_server(config: GatewayConfig) -> anyhow::Result<()> {
    run_server_with_shutdown(config, shutdown_signal()).await
}

/// Run server with graceful shutdown
pub async fn run_server_with_shutdown(
    config: GatewayConfig,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    // Create application state
    let state = Arc::new(AppState::new(config.clone()).await?);

    // Bind to address
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;

    info!("🚀 Linkstream Gateway listening on http://{}", addr);
    let base_url = config.base_url();
    for file in &state.seeded {
        info!("🔗 {}{}", base_url, file.path());
    }

    serve(listener, state, shutdown_signal).await
}

/// Serve `state` on an already bound listener until `shutdown_signal` fires.
///
/// Queued requests are rejected and every upstream connection is dropped on
/// shutdown.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let drain = state.admission.spawn_drain();
    let app = routes::create_router(Arc::clone(&state));

    let admission = Arc::clone(&state.admission);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal.await;
        info!("Shutdown requested, rejecting queued requests");
        admission.shutdown();
    })
    .await?;

    state.admission.shutdown();
    state.pool.shutdown();
    drain.await?;

    info!("👋 Gateway shutdown complete");

    Ok(())
}

/// Resolves on Ctrl-C (and SIGTERM on unix)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
