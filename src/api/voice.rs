//! Voice API endpoints for inspecting clients and making announcements

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::voice::{Announcement, SessionSnapshot};

/// Build voice router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/clients", get(clients))
        .route("/capabilities", get(capabilities))
        .route("/announce", post(announce))
        .with_state(state)
}

/// Connected clients response
#[derive(Debug, Serialize)]
pub struct ClientsResponse {
    pub count: usize,
    pub clients: Vec<SessionSnapshot>,
    pub turn_in_progress: bool,
}

/// List connected clients and their states
async fn clients(State(state): State<Arc<ApiState>>) -> Json<ClientsResponse> {
    let clients = state.connections.snapshot();
    Json(ClientsResponse {
        count: clients.len(),
        clients,
        turn_in_progress: state.orchestrator.turn_in_progress(),
    })
}

/// Voice capabilities response
#[derive(Debug, Serialize)]
pub struct VoiceCapabilities {
    pub stt_available: bool,
    pub tts_available: bool,
    pub tts_provider: String,
    pub tts_providers: Vec<&'static str>,
    pub conversation_mode: bool,
}

/// Get voice capabilities
async fn capabilities(State(state): State<Arc<ApiState>>) -> Json<VoiceCapabilities> {
    let settings = state.settings.voice_settings();
    let tts_available =
        settings.tts.enabled && state.tts_providers.contains(&settings.tts.provider.as_str());
    Json(VoiceCapabilities {
        stt_available: state.stt_available,
        tts_available,
        tts_provider: settings.tts.provider,
        tts_providers: state.tts_providers.clone(),
        conversation_mode: settings.conversation_mode,
    })
}

/// Announcement request
#[derive(Debug, Deserialize)]
pub struct AnnounceRequest {
    pub text: String,
}

/// Announcement response
#[derive(Debug, Serialize)]
pub struct AnnounceResponse {
    pub delivered_to: usize,
    /// Interrupted by a barge-in before it finished
    pub cancelled: bool,
}

/// Speak `text` on every connected client
async fn announce(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<AnnounceRequest>,
) -> Result<Json<AnnounceResponse>, VoiceError> {
    let text = request.text.trim();
    if text.is_empty() {
        return Err(VoiceError::BadRequest("Empty text"));
    }

    let announcement = state
        .orchestrator
        .announce(text)
        .await
        .map_err(|e| VoiceError::SynthesisFailed(e.to_string()))?;
    if announcement == Announcement::Unavailable {
        return Err(VoiceError::NotConfigured("TTS disabled or provider unavailable"));
    }

    Ok(Json(AnnounceResponse {
        delivered_to: state.connections.len(),
        cancelled: announcement == Announcement::Cancelled,
    }))
}

/// Voice API errors
#[derive(Debug)]
pub enum VoiceError {
    NotConfigured(&'static str),
    BadRequest(&'static str),
    SynthesisFailed(String),
}

impl IntoResponse for VoiceError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: ErrorBody,
        }

        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code, message) = match self {
            Self::NotConfigured(msg) => (StatusCode::SERVICE_UNAVAILABLE, "not_configured", msg.to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.to_string()),
            Self::SynthesisFailed(msg) => (StatusCode::BAD_GATEWAY, "synthesis_failed", msg),
        };

        (status, Json(ErrorResponse { error: ErrorBody { code, message } })).into_response()
    }
}
