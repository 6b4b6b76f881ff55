//! HTTP request handlers.

use std::any::Any;

use super::AppState;
use crate::db::format_timestamp;
use crate::service::QueryError;

use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

// ============================================================================
// Errors
// ============================================================================

fn status_for(err: &QueryError) -> StatusCode {
    match err {
        QueryError::Validation(_) | QueryError::InvalidService(_) | QueryError::InvalidQuery(_) => {
            StatusCode::BAD_REQUEST
        }
        QueryError::NotFound(_) => StatusCode::NOT_FOUND,
        // `kind` tells the three store outcomes apart
        QueryError::StoreUnavailable(_)
        | QueryError::StoreIndeterminate(_)
        | QueryError::StoreWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
        QueryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl From<QueryRejection> for QueryError {
    fn from(rejection: QueryRejection) -> Self {
        QueryError::InvalidQuery(rejection.body_text())
    }
}

impl From<PathRejection> for QueryError {
    fn from(rejection: PathRejection) -> Self {
        QueryError::Validation(rejection.body_text())
    }
}

impl From<BytesRejection> for QueryError {
    fn from(rejection: BytesRejection) -> Self {
        QueryError::Validation(rejection.body_text())
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::warn!("Request failed with {}: {}", status, self);
        }
        (status, Json(json!({"error": self.to_string(), "kind": self.kind()}))).into_response()
    }
}

pub async fn handle_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Endpoint not found", "kind": "not_found"})),
    )
}

pub async fn handle_method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({"error": "Method not allowed", "kind": "method_not_allowed"})),
    )
}

pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!("Handler panicked: {}", detail);

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Internal server error", "kind": "internal"})),
    )
        .into_response()
}

// ============================================================================
// Index
// ============================================================================

pub async fn handle_index(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "service": "HealthTrail",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /add": "Record an observation",
            "GET /healthcheck": "Probe every service and the application",
            "GET /healthcheck/{service_name}": "Probe one service",
            "GET /history": "Stored observations, newest first (service_name, size)",
            "GET /latest/{service_name}": "Most recent stored observation for a service",
        },
        "valid_services": state.service.engine().valid_services(),
    }))
}

// ============================================================================
// API: Ingest
// ============================================================================

pub async fn handle_add(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<impl IntoResponse, QueryError> {
    let body = body?;
    let payload: Option<Value> = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(
            serde_json::from_slice(&body)
                .map_err(|e| QueryError::Validation(format!("Invalid JSON: {}", e)))?,
        )
    };

    let outcome = state.service.ingest(payload.as_ref()).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Data added successfully",
            "elasticsearch_id": outcome.id,
            "data": outcome.record,
        })),
    ))
}

// ============================================================================
// API: Health checks
// ============================================================================

pub async fn handle_healthcheck_all(State(state): State<AppState>) -> Result<impl IntoResponse, QueryError> {
    let report = state.service.health_check_all().await?;

    let mut body = Map::new();
    body.insert(
        format!("{}_status", state.service.engine().aggregate_name()),
        json!(report.aggregate),
    );
    body.insert("services".to_string(), json!(report.services));
    body.insert("timestamp".to_string(), json!(format_timestamp(&report.timestamp)));

    Ok(Json(Value::Object(body)))
}

pub async fn handle_healthcheck_one(
    State(state): State<AppState>,
    service_name: Result<Path<String>, PathRejection>,
) -> Result<impl IntoResponse, QueryError> {
    let Path(service_name) = service_name?;
    let report = state.service.health_check_one(&service_name).await?;

    Ok(Json(json!({
        "service_name": report.service_name,
        "status": report.status,
        "timestamp": format_timestamp(&report.timestamp),
    })))
}

// ============================================================================
// API: Stored observations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub service_name: Option<String>,
    pub size: Option<String>,
}

pub async fn handle_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<impl IntoResponse, QueryError> {
    let Query(query) = query?;
    let page = state
        .service
        .get_history(query.service_name.as_deref(), query.size.as_deref())
        .await?;
    Ok(Json(page))
}

pub async fn handle_latest(
    State(state): State<AppState>,
    service_name: Result<Path<String>, PathRejection>,
) -> Result<impl IntoResponse, QueryError> {
    let Path(service_name) = service_name?;
    let latest = state.service.latest(&service_name).await?;
    Ok(Json(latest))
}
