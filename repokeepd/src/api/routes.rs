use std::sync::Arc;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use shared::protocol::{HEALTH_PATH, RECORDS_PATH, SHUTDOWN_PATH};
use shared::types::{HealthResponse, HealthStatus, Record, RecordKind};
use tokio_util::sync::CancellationToken;
use crate::api::error::ApiError;
use crate::store::RecordStore;

const MAX_NAME_LEN: usize = 128;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    /// Cancelled once shutdown has begun; health then reports not-serving
    pub shutdown: CancellationToken,
    pub pid: i64,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(&format!("{}/:kind", RECORDS_PATH), get(list_records))
        .route(
            &format!("{}/:kind/:name", RECORDS_PATH),
            get(get_record).put(put_record).delete(delete_record),
        )
        .route(SHUTDOWN_PATH, post(request_shutdown))
        .with_state(state)
}

fn parse_kind(kind: &str) -> Result<RecordKind, ApiError> {
    kind.parse().map_err(ApiError::InvalidArgument)
}

fn validate_name(name: &str) -> Result<(), ApiError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::InvalidArgument(format!(
            "invalid record name '{}': use up to {} letters, digits, '-', '_' or '.'",
            name, MAX_NAME_LEN
        )))
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        let body = HealthResponse {
            status: HealthStatus::NotServing,
            pid: Some(state.pid),
            started_at: Some(state.started_at),
        };
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body));
    }

    let body = HealthResponse {
        status: HealthStatus::Serving,
        pid: Some(state.pid),
        started_at: Some(state.started_at),
    };
    (StatusCode::OK, Json(body))
}

async fn list_records(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Vec<Record>>, ApiError> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.store.list(kind).await?))
}

async fn get_record(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Json<Record>, ApiError> {
    let kind = parse_kind(&kind)?;
    validate_name(&name)?;

    state
        .store
        .get(kind, &name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("{} '{}' not found", kind, name)))
}

async fn put_record(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Record>, ApiError> {
    let kind = parse_kind(&kind)?;
    validate_name(&name)?;

    let data: serde_json::Value = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidArgument(format!("request body is not valid JSON: {}", e)))?
    };

    Ok(Json(state.store.put(kind, &name, data).await?))
}

async fn delete_record(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let kind = parse_kind(&kind)?;
    validate_name(&name)?;

    if state.store.delete(kind, &name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("{} '{}' not found", kind, name)))
    }
}

async fn request_shutdown(State(state): State<AppState>) -> StatusCode {
    tracing::info!("Shutdown requested by client");
    state.shutdown.cancel();
    StatusCode::ACCEPTED
}
