//! MetaMCP server library.
//!
//! Provides a reusable serve function for the binary and for tests.

#![deny(missing_docs)]

mod health;

use std::{net::SocketAddr, sync::Arc};

use axum::{Router, routing::get};
use config::Config;
use mcp::GatewayContext;
use storage::Storage;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// Configuration for serving MetaMCP.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to.
    pub listen_address: SocketAddr,
    /// The deserialized MetaMCP TOML configuration.
    pub config: Config,
    /// The persistence port namespaces and servers are read from.
    pub storage: Arc<dyn Storage>,
}

/// Starts and runs the MetaMCP server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        storage,
    }: ServeConfig,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let context = GatewayContext::new(&config, storage)?;

    let mut app = Router::new();

    if config.server.health.enabled {
        app = app.route(
            config.server.health.path.as_ref(),
            get(health::health).with_state(context.clone()),
        );
    }

    let gateway_router = mcp::router(context, &config.gateway, shutdown.clone()).await?;
    app = app.merge(gateway_router.layer(CorsLayer::permissive()));

    let listener = TcpListener::bind(&listen_address).await?;
    log::info!("MetaMCP listening on {listen_address}");

    let shutdown_signal = shutdown.clone();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown().await;
            shutdown_signal.cancel();
        })
        .await?;

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => log::error!("Failed to install SIGTERM handler: {e}"),
            }
        };

        tokio::select! {
            () = ctrl_c => {},
            () = terminate => {},
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;

    log::info!("Shutdown signal received, draining sessions");
}
