//! HTTP handlers. Each one parses the request, calls into [`GuardService`]
//! and renders either the result or an [`ApiError`].

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;

use super::envelope::ApiError;
use crate::service::{DeleteOutcome, GuardService, IngestRequest, IngestResponse, LatestAnalysis};

const DEFAULT_USER_ID: u64 = 1;

fn join_error(e: JoinError) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.to_string())
}

// ============================================================================
// Predict
// ============================================================================

/// POST /predict - multipart `file`, `rpm`, optional `user_id`
pub async fn predict(
    State(service): State<GuardService>,
    mut multipart: Multipart,
) -> Result<Json<IngestResponse>, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut rpm: Option<String> = None;
    let mut user_id = DEFAULT_USER_ID;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Could not read file: {e}")))?;
                file = Some((filename, bytes.to_vec()));
            }
            "rpm" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Could not read rpm: {e}")))?;
                rpm = Some(text.trim().to_string());
            }
            "user_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Could not read user_id: {e}")))?;
                user_id = text
                    .trim()
                    .parse()
                    .map_err(|_| ApiError::bad_request("user_id must be an integer"))?;
            }
            _ => {}
        }
    }

    let (filename, bytes) = file.ok_or_else(|| ApiError::bad_request("Missing 'file' field"))?;
    let rpm = rpm.ok_or_else(|| ApiError::bad_request("Missing 'rpm' field"))?;

    let response = service
        .ingest(IngestRequest {
            rpm,
            user_id,
            filename,
            bytes,
        })
        .await?;
    Ok(Json(response))
}

// ============================================================================
// Monitoring
// ============================================================================

/// GET /api/monitoring/latest-analysis
pub async fn latest_analysis(
    State(service): State<GuardService>,
) -> Result<Json<LatestAnalysis>, ApiError> {
    let analysis = tokio::task::spawn_blocking(move || service.latest_analysis())
        .await
        .map_err(join_error)??;
    Ok(Json(analysis))
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub sha256: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub status: &'static str,
    pub message: String,
    #[serde(flatten)]
    pub outcome: DeleteOutcome,
}

/// DELETE /monitoring/delete-anomaly?sha256=...
pub async fn delete_anomaly(
    State(service): State<GuardService>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let outcome = tokio::task::spawn_blocking(move || service.delete_sample(&query.sha256))
        .await
        .map_err(join_error)??;
    Ok(Json(DeleteResponse {
        status: "success",
        message: format!("Deleted {} sample(s)", outcome.deleted),
        outcome,
    }))
}

// ============================================================================
// Retrain
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RetrainAccepted {
    pub status: &'static str,
    pub rpm: String,
}

/// POST /api/retrain/:rpm - start a retrain outside the automatic triggers
pub async fn trigger_retrain(
    State(service): State<GuardService>,
    Path(rpm): Path<String>,
) -> Result<(StatusCode, Json<RetrainAccepted>), ApiError> {
    service.request_retrain(&rpm)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RetrainAccepted {
            status: "accepted",
            rpm,
        }),
    ))
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RpmHealth {
    pub rpm: String,
    pub model_loaded: bool,
    pub version: Option<String>,
    pub threshold: Option<f64>,
    pub validated_samples: u64,
    pub retraining: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub rpms: Vec<RpmHealth>,
}

/// GET /health
pub async fn health(State(service): State<GuardService>) -> Json<HealthResponse> {
    let rpms = service
        .config()
        .rpm
        .operating_points
        .iter()
        .map(|rpm| {
            let slot = service.registry().slot(rpm);
            let bundle = slot.bundle();
            RpmHealth {
                rpm: rpm.clone(),
                model_loaded: bundle.is_some(),
                version: bundle.as_ref().map(|b| b.version().to_string()),
                threshold: bundle.as_ref().map(|b| b.threshold_value()),
                validated_samples: slot.count(),
                retraining: slot.is_retraining(),
            }
        })
        .collect();

    Json(HealthResponse { status: "ok", rpms })
}
