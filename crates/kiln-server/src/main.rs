//! Kiln Server - OpenAI- and Ollama-compatible HTTP API for local GGUF models

use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use kiln_core::catalog::remote::{RemoteCatalog, DEFAULT_ENDPOINT};
use kiln_core::engine::candle::CandleEngineSettings;
use kiln_core::engine::CandleEngineFactory;
use kiln_core::{BackendSelector, CompletionDispatcher, EngineRegistry, KilnConfig, LocalCatalog};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_server=debug,kiln_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kiln Server");

    // Load configuration
    let config = KilnConfig::from_env()?;
    info!("Models directory: {:?}", config.models_dir);

    // Backend selection happens once; the selector owns the loaded library
    // and must outlive the server.
    info!("Native loader: {}", config.backend.loader);
    let selector = BackendSelector::for_settings(&config.backend);
    let backend = selector.configure(&config.backend).await.clone();

    let factory = Arc::new(CandleEngineFactory::new(CandleEngineSettings {
        tokenizer_path: config.tokenizer_path.clone(),
        generation: config.generation.clone(),
    }));
    let registry = EngineRegistry::new(backend, factory);
    let catalog = Arc::new(LocalCatalog::new(&config.models_dir));
    let dispatcher = CompletionDispatcher::new(catalog, registry, config.generation.clone());

    let remote_endpoint =
        std::env::var("KILN_HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
    let remote = RemoteCatalog::new(remote_endpoint)?;

    let state = AppState::new(dispatcher, remote);
    info!(
        "Gateway initialized (max {} concurrent requests, {}s timeout)",
        state.request_semaphore.available_permits(),
        state.request_timeout_secs
    );

    // Build router
    let app = api::create_router(state.clone());

    // Start server
    let host = std::env::var("KILN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = match std::env::var("KILN_PORT") {
        Ok(raw) => match raw.parse::<u16>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid KILN_PORT='{}', falling back to 8080", raw);
                8080
            }
        },
        Err(_) => 8080,
    };
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready. Press Ctrl+C to stop.");
    server.await?;

    // In-flight requests have drained; release model memory.
    state.dispatcher.registry().dispose_all().await;
    drop(selector);
    info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}
