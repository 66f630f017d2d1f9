//! REST API Models
//!
//! Payload and response types for the session management REST surface, with
//! `utoipa` schemas for the generated OpenAPI documentation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Returned when a new client session is created.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct CreateClientResponse {
    #[schema(value_type = String, format = Uuid)]
    pub client_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Structural snapshot of one client session.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Whether the synthesis-service link is currently open.
    pub speech_synthesizer_connected: bool,
    /// Current lifecycle state name.
    #[schema(example = "avatar_ready")]
    pub state: String,
    /// Whether a recovery sequence is in flight.
    pub reconnecting: bool,
    /// Whether the avatar is speaking right now.
    pub is_speaking: bool,
    /// Seconds since the last client interaction.
    pub idle_seconds: u64,
}

/// Parameters for binding an avatar media connection, supplied as headers on
/// `POST /api/connectAvatar` alongside the raw SDP body.
#[derive(Debug, Clone, Default)]
pub struct AvatarParams {
    pub character: String,
    pub style: String,
    pub background_color: String,
    pub background_image_url: Option<String>,
    pub is_custom_avatar: bool,
    pub transparent_background: bool,
    pub video_crop: bool,
    pub tts_voice: Option<String>,
    pub personal_voice_speaker_profile_id: Option<String>,
}

/// Body for `POST /api/releaseClient`.
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseClientPayload {
    #[schema(value_type = String, format = Uuid)]
    pub client_id: Uuid,
}

/// Body for chat-history initialization endpoints.
#[derive(Deserialize, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClearHistoryPayload {
    pub system_prompt: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_response_uses_camel_case() {
        let status = StatusResponse {
            speech_synthesizer_connected: true,
            state: "avatar_ready".into(),
            reconnecting: false,
            is_speaking: false,
            idle_seconds: 12,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"speechSynthesizerConnected\":true"));
        assert!(json.contains("\"idleSeconds\":12"));
    }

    #[test]
    fn release_payload_parses_client_id() {
        let payload: ReleaseClientPayload = serde_json::from_str(
            r#"{"clientId":"550e8400-e29b-41d4-a716-446655440000"}"#,
        )
        .unwrap();
        assert_eq!(
            payload.client_id,
            Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()
        );
    }

    #[test]
    fn release_payload_requires_client_id() {
        let result: Result<ReleaseClientPayload, _> = serde_json::from_str("{}");
        assert!(result.is_err());
    }
}
