mod codec;
mod compose;
mod config;
mod error;
mod gemini;
mod mask;
mod models;
mod orchestrator;
mod retry;
mod routes;
mod session;
mod styles;
#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::gemini::GeminiClient;
use crate::orchestrator::Orchestrator;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env()?;
    tracing::info!(
        image_model = %config.gemini.image_model,
        text_model = %config.gemini.text_model,
        max_attempts = config.retry.max_attempts,
        max_upload_bytes = config.max_upload_bytes,
        "Using API key: {}...",
        config.gemini.api_key.chars().take(6).collect::<String>()
    );

    let gemini = GeminiClient::new(&config.gemini).context("building Gemini client")?;
    let state = AppState {
        store: Arc::default(),
        orchestrator: Arc::new(Orchestrator::new(Arc::new(gemini), config.retry.clone())),
        max_upload_bytes: config.max_upload_bytes,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(session::sweep_idle(
        state.store.clone(),
        config.session_idle_ttl,
        session::SWEEP_INTERVAL,
        shutdown.clone(),
    ));

    let app = routes::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state, shutdown))
        .await
        .context("server error")?;
    Ok(())
}

/// Waits for Ctrl-C, then stops the sweeper and cancels every in-flight generation.
async fn shutdown_signal(state: AppState, shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
    shutdown.cancel();
    for session in state.store.read().values() {
        session.shutdown();
    }
}
