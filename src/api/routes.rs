//! API route definitions.

use std::convert::Infallible;
use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::state::AppState;
use super::ApiError;
use crate::devices::Device;
use crate::orchestrator::TestParams;
use crate::settings::TestTemplate;

type ApiResult = Result<Json<Value>, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/devices/discover", get(discover_devices))
        .route(
            "/devices/selected",
            get(selected_device).put(select_device).delete(clear_device),
        )
        .route("/devices/command", post(send_command))
        .route("/settings", get(settings))
        .route("/settings/save-directory", put(set_save_directory))
        .route("/settings/tests", get(test_templates).put(save_test_templates))
        .route("/tests", post(start_test).get(list_tests))
        .route("/tests/{id}", get(get_test).delete(stop_test))
        .route("/tests/completed/{id}", delete(discard_completed))
        .route("/events", get(events))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    subnet: String,
}

async fn discover_devices(
    State(state): State<AppState>,
    Query(query): Query<DiscoverQuery>,
) -> ApiResult {
    let devices = state.helper.discover(&query.subnet).await?;
    Ok(Json(json!({ "data": devices, "meta": { "total": devices.len() } })))
}

async fn selected_device(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.devices.selected_device().await }))
}

async fn select_device(State(state): State<AppState>, Json(device): Json<Device>) -> Json<Value> {
    state.devices.set_selected_device(device.clone()).await;
    Json(json!({ "data": device }))
}

async fn clear_device(State(state): State<AppState>) -> Json<Value> {
    state.devices.clear().await;
    Json(json!({ "data": null }))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

async fn send_command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> ApiResult {
    let response = state.helper.send_command(&request.command).await?;
    Ok(Json(json!({
        "data": { "command": request.command, "response": response }
    })))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

async fn settings(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.settings.snapshot().await }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveDirectoryRequest {
    save_directory: Option<PathBuf>,
}

async fn set_save_directory(
    State(state): State<AppState>,
    Json(request): Json<SaveDirectoryRequest>,
) -> ApiResult {
    state
        .settings
        .set_save_directory(request.save_directory)
        .await?;
    Ok(Json(json!({ "data": state.settings.snapshot().await })))
}

async fn test_templates(State(state): State<AppState>) -> Json<Value> {
    let tests = state.settings.tests().await;
    Json(json!({ "data": tests, "meta": { "total": tests.len() } }))
}

async fn save_test_templates(
    State(state): State<AppState>,
    Json(tests): Json<Vec<TestTemplate>>,
) -> ApiResult {
    let total = tests.len();
    state.settings.save_tests(tests).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Saved {} tests.", total)
    })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

async fn start_test(State(state): State<AppState>, Json(params): Json<TestParams>) -> ApiResult {
    let record = state.orchestrator.start_test(params).await?;
    Ok(Json(json!(record)))
}

async fn list_tests(State(state): State<AppState>) -> Json<Value> {
    let ongoing = state.orchestrator.ongoing().await;
    let completed = state.orchestrator.completed().await;
    Json(json!({
        "data": { "ongoing": ongoing, "completed": completed },
        "meta": { "ongoing": ongoing.len(), "completed": completed.len() }
    }))
}

async fn get_test(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.orchestrator.get(&id).await {
        Some(record) => Ok(Json(json!({ "data": record }))),
        None => Err(ApiError::not_found(format!("Test with ID {} not found", id))),
    }
}

async fn stop_test(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.orchestrator.stop_test(&id).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Test {} stopped.", id)
    })))
}

async fn discard_completed(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    if !state.orchestrator.discard_completed(&id).await {
        return Err(ApiError::not_found(format!(
            "Completed test with ID {} not found",
            id
        )));
    }
    Ok(Json(json!({
        "status": "success",
        "message": format!("Test {} removed.", id)
    })))
}

/// Completion events as server-sent events named `test-completed`.
async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.orchestrator.subscribe();
    let closed = state.orchestrator.closed();

    let stream = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(completion) => match Event::default().event("test-completed").json_data(&completion) {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(e) => warn!(test_id = %completion.test_id, error = %e, "failed to encode completion event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, completions dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    // Open streams would otherwise hold graceful shutdown forever.
    Sse::new(stream.take_until(closed)).keep_alive(KeepAlive::default())
}
