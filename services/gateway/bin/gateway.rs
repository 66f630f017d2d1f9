//! Main Entrypoint for the Parley Gateway
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging and the token refresh loops.
//! 3. Wiring the shared services (synthesis, chat, recognition) into the
//!    session registry and connection pool.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use parley_core::chat::{ChatClient, OpenAICompatibleChatClient};
use parley_gateway::{
    config::Config,
    detectors,
    pool::ConnectionPool,
    registry::Registry,
    router::create_router,
    session::SessionDeps,
    state::AppState,
    stt::WsRecognizerFactory,
    synthesis::TtsSynthesisService,
    tokens::TokenCache,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Token refresh loops ---
    let tokens = TokenCache::new(config.clone());
    tokens.spawn_refresh_tasks();

    // --- 4. Shared services ---
    let synthesis = Arc::new(TtsSynthesisService::new(
        config.speech_region.clone(),
        tokens.clone(),
    ));

    let mut openai_config = OpenAIConfig::new().with_api_key(config.openai_api_key.clone());
    if let Some(base) = &config.openai_api_base {
        openai_config = openai_config.with_api_base(base.clone());
    }
    let chat: Arc<dyn ChatClient> = Arc::new(OpenAICompatibleChatClient::new(
        openai_config,
        config.chat_model.clone(),
    ));

    let recognizers = Arc::new(WsRecognizerFactory {
        region: config.speech_region.clone(),
        key: config.speech_key.clone(),
    });

    let pool = Arc::new(ConnectionPool::new(
        synthesis.clone(),
        config.pool_capacity,
        config.pool_stale_after,
        config.negotiation_timeout,
    ));

    let registry = Arc::new(Registry::new(SessionDeps {
        pool: pool.clone(),
        synthesis,
        chat,
        recognizers,
        config: config.clone(),
    }));

    let app_state = Arc::new(AppState {
        registry,
        pool,
        tokens,
        config: config.clone(),
    });

    // --- 5. Background detectors ---
    detectors::spawn_all(app_state.clone());

    // --- 6. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 7. Start Server ---
    info!(
        model = %config.chat_model,
        speech_region = %config.speech_region,
        bind_address = %config.bind_address,
        "Gateway configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
