//! Edge Agent
//!
//! Local HTTP agent that gives on-device callers a resilient path to the
//! upstream API:
//! 1. Loads the session from disk (or bootstraps it from EDGE_REFRESH_TOKEN)
//! 2. Probes upstream reachability and feeds the connectivity signal
//! 3. Forwards local calls through the resilient client (auth, refresh, retry,
//!    offline queue)
//! 4. Exposes session login/logout, health and Prometheus metrics

mod config;
mod forward;
mod metrics;
mod probe;
mod session;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use resilient_client::{Client, ConnectivityMonitor, WatchConnectivity};
use session_auth::{Credential, CredentialStore, FileCredentialStore, HttpRefreshTransport};
use transport::HttpTransport;

use crate::config::Config;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    client: Client,
    connectivity: Arc<WatchConnectivity>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrently handled requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/session",
            post(session::login_handler).delete(session::logout_handler),
        )
        .fallback(forward_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting edge-agent");

    // Install before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.agent.listen_addr,
        base_url = %config.client.base_url,
        probe_addr = %config.connectivity.probe_addr,
        "configuration loaded"
    );

    let http = reqwest::Client::new();
    let store = Arc::new(
        FileCredentialStore::load(config.auth.credentials_path.clone())
            .await
            .context("failed to load credential store")?,
    );
    let refresh = Arc::new(HttpRefreshTransport::new(
        http.clone(),
        config.auth.token_endpoint.clone(),
        config.auth.client_id.clone(),
    ));
    let transport = Arc::new(HttpTransport::new(http, config.client.base_url.clone()));

    let probe_timeout = Duration::from_millis(config.connectivity.probe_timeout_ms);
    let online = probe::probe(&config.connectivity.probe_addr, probe_timeout).await;
    metrics::set_upstream_connected(online);
    let connectivity = Arc::new(WatchConnectivity::new(online));
    info!(connected = online, "initial connectivity probe");

    let client = Client::builder(transport, store.clone(), refresh, connectivity.clone())
        .config(config.client.clone())
        .on_session_expired(|| warn!("session expired, a new login is required"))
        .build();

    if let Some(token) = &config.bootstrap_refresh_token {
        if store.get().await.is_none() {
            bootstrap_session(&client, token.expose()).await;
        }
    }

    let probe_task = probe::spawn_probe_task(
        connectivity.clone(),
        config.connectivity.probe_addr.clone(),
        Duration::from_secs(config.connectivity.probe_interval_secs),
        probe_timeout,
    );
    let reconnect_task = client.spawn_reconnect_listener();
    let refresh_task = client.spawn_refresh_task();

    let app_state = AppState {
        client: client.clone(),
        connectivity,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.agent.max_connections);

    let listen_addr = config.agent.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain deadline starts at the signal, not at server start: notify the
    // server to stop accepting, then race its drain against DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let stats = client.stats();
            warn!(
                offline_queue_size = stats.offline_queue_size,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    probe_task.abort();
    reconnect_task.abort();
    refresh_task.abort();

    info!("shutdown complete");
    Ok(())
}

/// Start a session from a refresh token alone.
///
/// The placeholder access token is never sent: the immediate refresh replaces
/// it, and a failed refresh ends the session through the normal hook.
async fn bootstrap_session(client: &Client, refresh_token: &str) {
    if let Err(e) = client.login(Credential::new("", refresh_token, 0)).await {
        error!(error = %e, "failed to store bootstrap credential");
        return;
    }
    match client.refresher().refresh().await {
        Ok(credential) => info!(expires_at = credential.expires_at, "session bootstrapped"),
        Err(e) => warn!(error = %e, "bootstrap refresh failed"),
    }
}

/// Health: connectivity, client stats and uptime. 503 while offline.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let connected = state.connectivity.is_connected();
    let stats = state.client.stats();
    let status_code = if connected {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": if connected { "healthy" } else { "offline" },
        "connected": connected,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "stats": stats,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all: everything that is not an agent route goes upstream.
async fn forward_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    forward::forward_request(&state.client, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
