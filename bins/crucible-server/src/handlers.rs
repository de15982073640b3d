// HTTP route handlers for the Crucible API

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crucible_common::types::{validate_submission, Language};

use crate::store::JobStore;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub job_token: String,
    pub expires_at: String,
}

/// POST /api/jobs - create a job record and issue its one-time token
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateJobRequest>,
) -> impl IntoResponse {
    let Some(language) = Language::from_str(&payload.language) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("unsupported language: {}", payload.language)
            })),
        )
            .into_response();
    };

    let filename = payload
        .filename
        .unwrap_or_else(|| language.default_filename());

    if let Err(e) = validate_submission(&payload.code, &filename, state.settings.max_code_bytes) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    match state.store.create(&payload.code, language, &filename).await {
        Ok(created) => {
            info!(
                job_id = %created.job_id,
                language = %language,
                code_size = payload.code.len(),
                "Job created"
            );
            (
                StatusCode::CREATED,
                Json(CreateJobResponse {
                    job_id: created.job_id.to_string(),
                    job_token: created.token,
                    expires_at: created.expires_at,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to create job");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "failed to create job" })),
            )
                .into_response()
        }
    }
}

/// GET /api/jobs/{job_id} - query a job record
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let Ok(job_id) = Uuid::parse_str(&job_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid job id format" })),
        )
            .into_response();
    };

    match state.store.get(job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "job_id": job_id.to_string(),
                "error": "job not found or expired"
            })),
        )
            .into_response(),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to fetch job");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "failed to query job" })),
            )
                .into_response()
        }
    }
}

/// GET /healthz - liveness check
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
