//! HTTP server setup and configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;

use super::{auth, handlers};
use crate::config::{Config, ConfigError};
use crate::dispatch::Dispatcher;
use crate::models::ModelCatalog;
use crate::pool::ProxyPool;
use crate::upstream::UpstreamClient;

/// Largest audio upload accepted for transcription.
const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

/// How long the model catalog waits for the first usable proxies.
const FIRST_POOL_WAIT: Duration = Duration::from_secs(300);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<ProxyPool>,
    pub dispatcher: Dispatcher,
    pub upstream: Arc<UpstreamClient>,
    pub models: Arc<ModelCatalog>,
    /// Bounds concurrent chat completions; exhausted means 429.
    pub chat_permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: Config, pool: Arc<ProxyPool>) -> Result<Self, ConfigError> {
        let upstream = Arc::new(UpstreamClient::new(
            &config.upstream,
            config.pool.probe_connect_timeout(),
        )?);
        let dispatcher = Dispatcher::new(Arc::clone(&pool));
        let models = Arc::new(ModelCatalog::new(
            &config,
            dispatcher.clone(),
            Arc::clone(&upstream),
        ));
        let chat_permits = Arc::new(Semaphore::new(config.server.max_concurrent_chats));

        Ok(Self {
            config: Arc::new(config),
            pool,
            dispatcher,
            upstream,
            models,
            chat_permits,
        })
    }
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route(
            "/v1/audio/transcriptions",
            post(handlers::transcriptions).layer(DefaultBodyLimit::max(MAX_AUDIO_BYTES)),
        )
        .route("/v1/models", get(handlers::list_models))
        .route("/models", get(handlers::list_models))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .merge(api)
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(middleware::from_fn(auth::assign_request_id))
        .layer(TraceLayer::new_for_http())
}

/// Start the background refreshers: proxies right away, models once the
/// first proxies are available.
pub fn spawn_refreshers(state: &AppState) {
    state
        .pool
        .spawn_refresher(state.config.pool.refresh_interval());

    let pool = Arc::clone(&state.pool);
    let models = Arc::clone(&state.models);
    let every = state.config.models.refresh_interval();
    tokio::spawn(async move {
        pool.wait_replenished(FIRST_POOL_WAIT).await;
        models.spawn_refresher(every);
    });
}

/// Run the HTTP server until Ctrl+C or SIGTERM.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    let pool = Arc::new(ProxyPool::from_config(&config)?);
    let state = AppState::new(config, pool)?;
    spawn_refreshers(&state);

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting proxyrelay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
