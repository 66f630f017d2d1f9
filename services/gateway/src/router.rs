//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the gateway, including
//! the REST API, the websocket push channel, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ClearHistoryPayload, CreateClientResponse, ErrorResponse, ReleaseClientPayload,
        StatusResponse,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::create_client,
        handlers::get_status,
        handlers::connect_avatar,
        handlers::disconnect_avatar,
        handlers::connect_stt,
        handlers::disconnect_stt,
        handlers::speak,
        handlers::stop_speaking,
        handlers::chat,
        handlers::continue_speaking,
        handlers::clear_history,
        handlers::release_client,
    ),
    components(
        schemas(CreateClientResponse, StatusResponse, ClearHistoryPayload, ReleaseClientPayload, ErrorResponse)
    ),
    tags(
        (name = "Parley Gateway", description = "Session lifecycle management for real-time avatar conversations")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/api/clients", post(handlers::create_client))
        .route("/api/status", get(handlers::get_status))
        .route("/api/connectAvatar", post(handlers::connect_avatar))
        .route("/api/disconnectAvatar", post(handlers::disconnect_avatar))
        .route("/api/connectSTT", post(handlers::connect_stt))
        .route("/api/disconnectSTT", post(handlers::disconnect_stt))
        .route("/api/speak", post(handlers::speak))
        .route("/api/stopSpeaking", post(handlers::stop_speaking))
        .route("/api/chat", post(handlers::chat))
        .route(
            "/api/chat/continueSpeaking",
            post(handlers::continue_speaking),
        )
        .route("/api/chat/clearHistory", post(handlers::clear_history))
        .route("/api/releaseClient", post(handlers::release_client))
        .route("/ws", get(ws_handler))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Merge the stateful routes with the stateless Swagger UI.
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
