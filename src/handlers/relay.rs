//! HTTP handlers for the relay trigger surface

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::error;

use crate::models::transfer::{
    ErrorResponse, OperationKind, RelayDisputeSettleRequest, RelayJobStartRequest,
    RelayMilestoneLockRequest, RelayPaymentReleaseRequest, TransferStatus,
    TransferStatusResponse, TriggerResponse,
};
use crate::services::relay::RelayError;
use crate::AppState;

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn error_body(message: impl Into<String>) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: message.into(),
    })
}

/// Trigger failures before any work happens are the caller's fault;
/// everything downstream is ours
fn map_relay_error(e: RelayError) -> HandlerError {
    match e {
        RelayError::ChainResolution(inner) => {
            (StatusCode::UNPROCESSABLE_ENTITY, error_body(inner.to_string()))
        }
        other => {
            error!(error = %other, "Relay trigger failed");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(other.to_string()))
        }
    }
}

fn trigger_status(response: &TriggerResponse) -> StatusCode {
    if response.state == "accepted" {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    }
}

pub async fn relay_job_start(
    State(state): State<AppState>,
    Json(payload): Json<RelayJobStartRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>), HandlerError> {
    let response = state
        .relay
        .trigger_job_start(&payload.job_reference, &payload.source_tx_hash)
        .await
        .map_err(map_relay_error)?;
    Ok((trigger_status(&response), Json(response)))
}

pub async fn relay_payment_release(
    State(state): State<AppState>,
    Json(payload): Json<RelayPaymentReleaseRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>), HandlerError> {
    let response = state
        .relay
        .trigger_payment_release(&payload.job_reference, payload.source_tx_hash.as_deref())
        .await
        .map_err(map_relay_error)?;
    Ok((trigger_status(&response), Json(response)))
}

pub async fn relay_milestone_lock(
    State(state): State<AppState>,
    Json(payload): Json<RelayMilestoneLockRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>), HandlerError> {
    let response = state
        .relay
        .trigger_milestone_lock(&payload.job_reference, &payload.source_tx_hash)
        .await
        .map_err(map_relay_error)?;
    Ok((trigger_status(&response), Json(response)))
}

pub async fn relay_dispute_settle(
    State(state): State<AppState>,
    Json(payload): Json<RelayDisputeSettleRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>), HandlerError> {
    let response = state
        .relay
        .trigger_dispute_settle(
            &payload.dispute_reference,
            &payload.job_reference,
            &payload.source_tx_hash,
        )
        .await
        .map_err(map_relay_error)?;
    Ok((trigger_status(&response), Json(response)))
}

fn reject_unless_failed(record: &crate::entities::transfers::Model) -> Result<(), HandlerError> {
    if record.status != TransferStatus::Failed.to_string() {
        return Err((
            StatusCode::CONFLICT,
            error_body(format!(
                "Transfer for {} is {}, only failed transfers can be retried",
                record.job_reference, record.status
            )),
        ));
    }
    Ok(())
}

pub async fn transfer_status(
    State(state): State<AppState>,
    Path((operation, job_reference)): Path<(String, String)>,
) -> Result<Json<TransferStatusResponse>, HandlerError> {
    let operation: OperationKind = operation
        .parse()
        .map_err(|e: String| (StatusCode::BAD_REQUEST, error_body(e)))?;

    let record = state
        .relay
        .status(&job_reference, operation)
        .await
        .map_err(map_relay_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                error_body(format!(
                    "No {} transfer recorded for {}",
                    operation, job_reference
                )),
            )
        })?;

    Ok(Json(TransferStatusResponse::from(record)))
}

/// Status lookup by source transaction hash, the operation key for
/// milestone locks (the job-scoped route only sees a job's newest record)
pub async fn transfer_status_by_tx(
    State(state): State<AppState>,
    Path(source_tx_hash): Path<String>,
) -> Result<Json<TransferStatusResponse>, HandlerError> {
    let record = state
        .relay
        .status_by_source_tx(&source_tx_hash)
        .await
        .map_err(map_relay_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                error_body(format!(
                    "No transfer recorded for source tx {}",
                    source_tx_hash
                )),
            )
        })?;

    Ok(Json(TransferStatusResponse::from(record)))
}

/// Manual retry of a failed transfer, bypassing the recovery scheduler's
/// backoff window (but not its state rules)
pub async fn retry_transfer(
    State(state): State<AppState>,
    Path((operation, job_reference)): Path<(String, String)>,
) -> Result<(StatusCode, Json<TriggerResponse>), HandlerError> {
    let operation: OperationKind = operation
        .parse()
        .map_err(|e: String| (StatusCode::BAD_REQUEST, error_body(e)))?;

    let record = state
        .relay
        .status(&job_reference, operation)
        .await
        .map_err(map_relay_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                error_body(format!(
                    "No {} transfer recorded for {}",
                    operation, job_reference
                )),
            )
        })?;

    reject_unless_failed(&record)?;

    let response = state
        .relay
        .retry_record(record)
        .await
        .map_err(map_relay_error)?;
    Ok((trigger_status(&response), Json(response)))
}

/// Manual retry keyed by source transaction hash, for milestone locks
/// older than a job's newest record
pub async fn retry_transfer_by_tx(
    State(state): State<AppState>,
    Path(source_tx_hash): Path<String>,
) -> Result<(StatusCode, Json<TriggerResponse>), HandlerError> {
    let record = state
        .relay
        .status_by_source_tx(&source_tx_hash)
        .await
        .map_err(map_relay_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                error_body(format!(
                    "No transfer recorded for source tx {}",
                    source_tx_hash
                )),
            )
        })?;

    reject_unless_failed(&record)?;

    let response = state
        .relay
        .retry_record(record)
        .await
        .map_err(map_relay_error)?;
    Ok((trigger_status(&response), Json(response)))
}

pub async fn health(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    state.db.ping().await.map_err(|e| {
        error!(error = %e, "Health check failed, database unreachable");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body(format!("Database unreachable: {}", e)),
        )
    })?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}
