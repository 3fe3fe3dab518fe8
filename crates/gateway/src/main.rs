//! Gateway service entry point.
//!
//! Per-client WebSocket fan-out proxy for the upstream trading service.

use anyhow::Result;
use exchange::AssetRegistry;
use gateway::{create_router, AppState, SessionIndex};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Upstream trading WebSocket endpoint.
const DEFAULT_UPSTREAM_URL: &str = "wss://iqoption.com/echo/websocket";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting trading proxy gateway");

    // Read configuration from environment
    let port: u16 = env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .expect("PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9104".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let upstream_url =
        env::var("UPSTREAM_WS_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string());
    let assets_file = env::var("ASSETS_FILE").ok();

    info!("Configuration:");
    info!("  PORT: {}", port);
    info!("  METRICS_PORT: {}", metrics_port);
    info!("  UPSTREAM_WS_URL: {}", upstream_url);
    info!("  ASSETS_FILE: {}", assets_file.as_deref().unwrap_or("(built-in table)"));

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    // Build the asset registry: built-in table, optionally extended from file
    let mut assets = AssetRegistry::with_defaults();
    if let Some(path) = &assets_file {
        let raw = std::fs::read_to_string(path)?;
        let table: HashMap<String, u32> = serde_json::from_str(&raw)?;
        info!("Loaded {} instruments from {}", table.len(), path);
        assets.extend(table);
    }
    info!("Asset registry holds {} instruments", assets.len());

    // Create application state
    let state = Arc::new(AppState {
        index: Arc::new(SessionIndex::new()),
        assets: Arc::new(assets),
        upstream_url,
    });

    // Create HTTP router
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
