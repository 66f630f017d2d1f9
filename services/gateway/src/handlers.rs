//! Axum Handlers for the REST API
//!
//! The REST surface drives the session lifecycle: client creation, avatar
//! connect/disconnect, recognizer control, chat turns and teardown. Handlers
//! never touch session state directly — every operation round-trips through
//! the session's event channel. `utoipa` doc comments generate the OpenAPI
//! documentation.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::error;
use uuid::Uuid;

use crate::{
    models::{
        AvatarParams, ClearHistoryPayload, CreateClientResponse, ErrorResponse,
        ReleaseClientPayload, StatusResponse,
    },
    registry::SessionHandle,
    session::events::SessionEvent,
    state::AppState,
    synthesis::SessionParams,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    header(headers, name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Resolves the session addressed by the `ClientId` header.
async fn session_from_headers(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Arc<SessionHandle>, ApiError> {
    let raw = header(headers, "ClientId")
        .ok_or_else(|| ApiError::BadRequest("ClientId header is required".to_string()))?;
    let client_id = Uuid::parse_str(raw)
        .map_err(|_| ApiError::BadRequest(format!("'{raw}' is not a valid client id")))?;
    state
        .registry
        .get(client_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Client '{client_id}' not found")))
}

/// Create a new client session.
#[utoipa::path(
    post,
    path = "/api/clients",
    responses(
        (status = 201, description = "Client session created", body = CreateClientResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn create_client(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let handle = state.registry.create().await;
    (
        StatusCode::CREATED,
        Json(CreateClientResponse {
            client_id: handle.client_id,
            created_at: chrono::Utc::now(),
        }),
    )
}

/// Get the status snapshot of a client session.
#[utoipa::path(
    get,
    path = "/api/status",
    responses(
        (status = 200, description = "Session status", body = StatusResponse),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    params(
        ("ClientId" = String, Header, description = "The client session id")
    )
)]
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    let handle = session_from_headers(&state, &headers).await?;
    let snapshot = handle
        .query()
        .await
        .ok_or_else(|| ApiError::NotFound("Session is no longer running".to_string()))?;
    Ok(Json(StatusResponse::from(&snapshot)))
}

/// Connect (or reconnect) the avatar media channel.
///
/// The request body is the browser's local SDP; avatar appearance and voice
/// are supplied as headers. The response body is the remote SDP.
#[utoipa::path(
    post,
    path = "/api/connectAvatar",
    request_body = String,
    responses(
        (status = 200, description = "Avatar connected; body is the remote SDP", body = String),
        (status = 400, description = "Connect failed", body = ErrorResponse),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    params(
        ("ClientId" = String, Header, description = "The client session id"),
        ("AvatarCharacter" = String, Header, description = "Avatar character name"),
        ("AvatarStyle" = String, Header, description = "Avatar style name")
    )
)]
pub async fn connect_avatar(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<String, ApiError> {
    let handle = session_from_headers(&state, &headers).await?;

    let params = SessionParams {
        client_sdp: body,
        avatar: AvatarParams {
            character: header(&headers, "AvatarCharacter")
                .unwrap_or("lisa")
                .to_string(),
            style: header(&headers, "AvatarStyle")
                .unwrap_or("casual-sitting")
                .to_string(),
            background_color: header(&headers, "BackgroundColor")
                .unwrap_or("#FFFFFFFF")
                .to_string(),
            background_image_url: header(&headers, "BackgroundImageUrl").map(str::to_string),
            is_custom_avatar: header_flag(&headers, "IsCustomAvatar"),
            transparent_background: header_flag(&headers, "TransparentBackground"),
            video_crop: header_flag(&headers, "VideoCrop"),
            tts_voice: header(&headers, "TtsVoice").map(str::to_string),
            personal_voice_speaker_profile_id: header(&headers, "PersonalVoiceSpeakerProfileId")
                .map(str::to_string),
        },
    };

    let (reply, rx) = oneshot::channel();
    handle
        .send(SessionEvent::Start {
            params: Box::new(params),
            reply,
        })
        .await?;
    let remote_sdp = rx
        .await
        .map_err(|_| ApiError::NotFound("Session is no longer running".to_string()))?
        .map_err(|e| ApiError::BadRequest(format!("Avatar connection failed: {e}")))?;
    Ok(remote_sdp)
}

/// Disconnect the avatar media channel, keeping the session alive.
#[utoipa::path(
    post,
    path = "/api/disconnectAvatar",
    responses(
        (status = 200, description = "Avatar disconnected"),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    params(("ClientId" = String, Header, description = "The client session id"))
)]
pub async fn disconnect_avatar(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<&'static str, ApiError> {
    let handle = session_from_headers(&state, &headers).await?;
    let (reply, rx) = oneshot::channel();
    handle
        .send(SessionEvent::DisconnectAvatar { reply })
        .await?;
    let _ = rx.await;
    Ok("Disconnected avatar")
}

/// Arm the speech recognizer for this session.
#[utoipa::path(
    post,
    path = "/api/connectSTT",
    responses(
        (status = 200, description = "Recognizer armed"),
        (status = 400, description = "Recognizer failed to start", body = ErrorResponse),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    params(
        ("ClientId" = String, Header, description = "The client session id"),
        ("SystemPrompt" = Option<String>, Header, description = "System prompt for recognized queries")
    )
)]
pub async fn connect_stt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<&'static str, ApiError> {
    let handle = session_from_headers(&state, &headers).await?;
    let (reply, rx) = oneshot::channel();
    handle
        .send(SessionEvent::ConnectRecognizer {
            system_prompt: header(&headers, "SystemPrompt").map(str::to_string),
            reply,
        })
        .await?;
    rx.await
        .map_err(|_| ApiError::NotFound("Session is no longer running".to_string()))?
        .map_err(|e| ApiError::BadRequest(format!("STT connection failed: {e}")))?;
    Ok("STT connected")
}

/// Disarm the speech recognizer.
#[utoipa::path(
    post,
    path = "/api/disconnectSTT",
    responses(
        (status = 200, description = "Recognizer closed"),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    params(("ClientId" = String, Header, description = "The client session id"))
)]
pub async fn disconnect_stt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<&'static str, ApiError> {
    let handle = session_from_headers(&state, &headers).await?;
    let (reply, rx) = oneshot::channel();
    handle
        .send(SessionEvent::DisconnectRecognizer { reply })
        .await?;
    let _ = rx.await;
    Ok("STT Disconnected.")
}

/// Speak a raw SSML document through the avatar.
#[utoipa::path(
    post,
    path = "/api/speak",
    request_body = String,
    responses(
        (status = 200, description = "Spoken; body is the synthesis result id", body = String),
        (status = 400, description = "Speak failed", body = ErrorResponse),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    params(("ClientId" = String, Header, description = "The client session id"))
)]
pub async fn speak(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<String, ApiError> {
    let handle = session_from_headers(&state, &headers).await?;
    let (reply, rx) = oneshot::channel();
    handle
        .send(SessionEvent::SpeakSsml { ssml: body, reply })
        .await?;
    rx.await
        .map_err(|_| ApiError::NotFound("Session is no longer running".to_string()))?
        .map_err(|e| ApiError::BadRequest(format!("Speak failed: {e}")))
}

/// Interrupt the avatar and clear the speak queue.
#[utoipa::path(
    post,
    path = "/api/stopSpeaking",
    responses(
        (status = 200, description = "Speaking stopped"),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    params(("ClientId" = String, Header, description = "The client session id"))
)]
pub async fn stop_speaking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<&'static str, ApiError> {
    let handle = session_from_headers(&state, &headers).await?;
    handle.send(SessionEvent::StopSpeaking).await?;
    Ok("Speaking stopped.")
}

/// Submit a chat turn. The streamed response arrives on the push channel.
#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = String,
    responses(
        (status = 202, description = "Turn accepted; response streams over the push channel"),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    params(
        ("ClientId" = String, Header, description = "The client session id"),
        ("SystemPrompt" = Option<String>, Header, description = "System prompt override")
    )
)]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let handle = session_from_headers(&state, &headers).await?;
    handle
        .send(SessionEvent::UserQuery {
            text: body,
            system_prompt: header(&headers, "SystemPrompt").map(str::to_string),
        })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// Resume speaking after a reconnect, repeating the interrupted sentence.
#[utoipa::path(
    post,
    path = "/api/chat/continueSpeaking",
    responses(
        (status = 200, description = "Request sent"),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    params(("ClientId" = String, Header, description = "The client session id"))
)]
pub async fn continue_speaking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<&'static str, ApiError> {
    let handle = session_from_headers(&state, &headers).await?;
    handle.send(SessionEvent::ContinueSpeaking).await?;
    Ok("Request sent.")
}

/// Clear the conversation history.
#[utoipa::path(
    post,
    path = "/api/chat/clearHistory",
    request_body = ClearHistoryPayload,
    responses(
        (status = 200, description = "History cleared"),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    params(("ClientId" = String, Header, description = "The client session id"))
)]
pub async fn clear_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Option<Json<ClearHistoryPayload>>,
) -> Result<&'static str, ApiError> {
    let handle = session_from_headers(&state, &headers).await?;
    let system_prompt = payload.and_then(|Json(p)| p.system_prompt);
    handle
        .send(SessionEvent::ClearHistory { system_prompt })
        .await?;
    Ok("Chat history cleared.")
}

/// Release a client session and all of its resources.
#[utoipa::path(
    post,
    path = "/api/releaseClient",
    request_body = ReleaseClientPayload,
    responses(
        (status = 200, description = "Client released"),
        (status = 404, description = "Client not found", body = ErrorResponse)
    )
)]
pub async fn release_client(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReleaseClientPayload>,
) -> Result<&'static str, ApiError> {
    if state.registry.remove(payload.client_id).await {
        Ok("Client context released.")
    } else {
        Err(ApiError::NotFound(format!(
            "Client '{}' not found",
            payload.client_id
        )))
    }
}
