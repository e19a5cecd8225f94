//! Transfer types and status enums for cross-chain relay tracking

use serde::{Deserialize, Serialize};

/// Sentinel stored in `completion_tx_hash` when the destination contract
/// reported the transfer's nonce as already consumed, i.e. the bridge (or a
/// previous attempt) completed the mint before we did.
pub const COMPLETED_BY_BRIDGE: &str = "completed_by_bridge";

/// Advisory progress tags written to the `step` column. Not used for
/// control flow decisions.
pub mod steps {
    pub const INITIATED: &str = "initiated";
    pub const WATCHING_EVENT: &str = "watching_event";
    pub const POLLING_ATTESTATION: &str = "polling_attestation";
    pub const EXECUTING_RECEIVE: &str = "executing_receive";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

/// Relay operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    JobStart,
    PaymentRelease,
    MilestoneLock,
    DisputeSettle,
}

impl OperationKind {
    /// Single-shot operations admit at most one pending/completed record
    /// per `(job_reference, operation)`. Milestone locks recur per job and
    /// are keyed by source transaction hash instead.
    pub fn is_single_shot(&self) -> bool {
        !matches!(self, OperationKind::MilestoneLock)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::JobStart => write!(f, "job_start"),
            OperationKind::PaymentRelease => write!(f, "payment_release"),
            OperationKind::MilestoneLock => write!(f, "milestone_lock"),
            OperationKind::DisputeSettle => write!(f, "dispute_settle"),
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "job_start" => Ok(OperationKind::JobStart),
            "payment_release" => Ok(OperationKind::PaymentRelease),
            "milestone_lock" => Ok(OperationKind::MilestoneLock),
            "dispute_settle" => Ok(OperationKind::DisputeSettle),
            _ => Err(format!("Unknown operation kind: {}", s)),
        }
    }
}

/// Terminal and non-terminal transfer states
///
/// pending → completed or pending → failed only; failed → pending is
/// permitted solely via an explicit retry, which increments `retry_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Pending => write!(f, "pending"),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TransferStatus::Pending),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            _ => Err(format!("Unknown transfer status: {}", s)),
        }
    }
}

/// Request to relay a job start (source tx hash always known)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayJobStartRequest {
    pub job_reference: String,
    pub source_tx_hash: String,
}

/// Request to relay a payment release; without a source tx hash the relayer
/// first watches the job-board contract for the release event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPaymentReleaseRequest {
    pub job_reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_tx_hash: Option<String>,
}

/// Request to relay a milestone lock (keyed by source tx hash)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMilestoneLockRequest {
    pub job_reference: String,
    pub source_tx_hash: String,
}

/// Request to relay a dispute settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayDisputeSettleRequest {
    pub dispute_reference: String,
    pub job_reference: String,
    pub source_tx_hash: String,
}

/// Answer to a trigger: either a new pipeline was started or one is
/// already in flight for the same key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub job_reference: String,
    pub operation: OperationKind,
    pub state: String,
}

impl TriggerResponse {
    pub fn accepted(job_reference: &str, operation: OperationKind) -> Self {
        Self {
            job_reference: job_reference.to_string(),
            operation,
            state: "accepted".to_string(),
        }
    }

    pub fn already_processing(job_reference: &str, operation: OperationKind) -> Self {
        Self {
            job_reference: job_reference.to_string(),
            operation,
            state: "already_processing".to_string(),
        }
    }
}

/// Response for transfer status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStatusResponse {
    pub job_reference: String,
    pub operation: String,
    pub status: String,
    pub step: String,
    pub last_error: Option<String>,
    pub completion_tx_hash: Option<String>,
    pub retry_count: i32,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl From<crate::entities::transfers::Model> for TransferStatusResponse {
    fn from(model: crate::entities::transfers::Model) -> Self {
        Self {
            job_reference: model.job_reference,
            operation: model.operation,
            status: model.status,
            step: model.step,
            last_error: model.last_error,
            completion_tx_hash: model.completion_tx_hash,
            retry_count: model.retry_count,
            created_at: model.created_at.to_rfc3339(),
            updated_at: model.updated_at.to_rfc3339(),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

/// Generic error body for handler responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_operation_kind_round_trip() {
        for kind in [
            OperationKind::JobStart,
            OperationKind::PaymentRelease,
            OperationKind::MilestoneLock,
            OperationKind::DisputeSettle,
        ] {
            let parsed = OperationKind::from_str(&kind.to_string()).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_operation_kind_rejects_unknown() {
        assert!(OperationKind::from_str("refund").is_err());
    }

    #[test]
    fn test_milestone_lock_is_not_single_shot() {
        assert!(OperationKind::JobStart.is_single_shot());
        assert!(OperationKind::PaymentRelease.is_single_shot());
        assert!(OperationKind::DisputeSettle.is_single_shot());
        assert!(!OperationKind::MilestoneLock.is_single_shot());
    }

    #[test]
    fn test_transfer_status_round_trip() {
        for status in [
            TransferStatus::Pending,
            TransferStatus::Completed,
            TransferStatus::Failed,
        ] {
            let parsed = TransferStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
    }
}
