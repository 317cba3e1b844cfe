//! API layer -- axum routes, handlers, and middleware.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::helper::HelperError;
use crate::orchestrator::OrchestratorError;
use crate::settings::SettingsError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// Error body shared by every handler: `{ "status": "error", "message" }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "status": "error", "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::NoDeviceSelected
            | OrchestratorError::NoSaveDirectory
            | OrchestratorError::Params(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::TestNotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Aborted => StatusCode::CONFLICT,
            OrchestratorError::Launch(_)
            | OrchestratorError::EarlyFailure(_)
            | OrchestratorError::ExitedBeforeRunning { .. } => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<HelperError> for ApiError {
    fn from(err: HelperError) -> Self {
        let status = match &err {
            HelperError::NoDeviceSelected => StatusCode::BAD_REQUEST,
            HelperError::Launch(_) | HelperError::Failed { .. } | HelperError::Discovery { .. } => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<SettingsError> for ApiError {
    fn from(err: SettingsError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}
