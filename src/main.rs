//! Depth Sync - Order Book Service
//!
//! Maintains synchronized order books for the configured symbols and
//! publishes derived depth views to other system components.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::sync::{watch, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use depth_sync::{
    AppState, Config, DerivedBookView, OrderBookManager, Publisher, RestSnapshotClient,
    WebSocketManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Depth Sync");

    let config = Arc::new(Config::load()?);
    info!(symbols = ?config.symbols, "Configuration loaded");

    let source = Arc::new(RestSnapshotClient::new(&config.rest_endpoint)?);
    let feed = Arc::new(WebSocketManager::new(
        &config.ws_endpoint,
        config.reconnect_delay_ms,
    ));
    let mut manager = OrderBookManager::new(source, feed, config.subscription_settings());

    // Initialize publisher for IPC
    let publisher = Arc::new(Publisher::new(&config.ipc_socket_path).await?);

    let mut forwarders = Vec::with_capacity(config.symbols.len());
    for symbol in &config.symbols {
        let views = manager.subscribe(symbol).views();
        forwarders.push(tokio::spawn(forward_views(views, publisher.clone())));
    }

    let state = Arc::new(AppState {
        manager: Arc::new(RwLock::new(manager)),
        publisher,
        config: config.clone(),
    });

    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    state.manager.write().await.shutdown().await;
    for forwarder in forwarders {
        let _ = forwarder.await;
    }

    info!("Depth Sync stopped");
    Ok(())
}

/// Publish every view a subscription emits until it shuts down
async fn forward_views(
    mut views: watch::Receiver<Option<DerivedBookView>>,
    publisher: Arc<Publisher>,
) {
    while views.changed().await.is_ok() {
        let view = views.borrow_and_update().clone();
        if let Some(view) = view {
            if let Err(e) = publisher.publish(&view).await {
                warn!(symbol = %view.symbol, error = %e, "Failed to publish view");
            }
        }
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let manager = state.manager.read().await;
    let symbols: serde_json::Map<String, serde_json::Value> = manager
        .statuses()
        .into_iter()
        .map(|(symbol, status)| {
            let book_healthy = manager
                .handle(&symbol)
                .and_then(|handle| handle.latest_view())
                .is_some_and(|view| view.metrics.is_healthy());
            let entry = serde_json::json!({ "status": status, "book_healthy": book_healthy });
            (symbol, entry)
        })
        .collect();
    let status = if manager.all_synced() { "healthy" } else { "syncing" };

    Json(serde_json::json!({
        "status": status,
        "component": "depth-sync",
        "symbols": symbols,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics() -> Result<String, (StatusCode, String)> {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
