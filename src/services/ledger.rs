//! Transfer ledger: durable record store for relay attempts
//!
//! Every relay attempt is one `transfers` row. The ledger owns the rows and
//! the key semantics; serialization of writes to a single row is the flow
//! controller's job via its dedup guard, not the ledger's.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, Order, QueryFilter, QueryOrder,
    Set,
};

use crate::entities::transfers::{self, Model};
use crate::entities::prelude::Transfers;
use crate::models::transfer::{steps, OperationKind, TransferStatus};

/// Error types for ledger operations
#[derive(Debug)]
pub enum LedgerError {
    /// A pending or completed record already exists for the relevant key
    DuplicateTransfer(String),
    NotFound(i32),
    Database(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::DuplicateTransfer(key) => {
                write!(f, "Transfer already recorded for {}", key)
            }
            LedgerError::NotFound(id) => write!(f, "Transfer {} not found", id),
            LedgerError::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Fields required to open a new transfer record
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub operation: OperationKind,
    pub job_reference: String,
    pub dispute_reference: Option<String>,
    pub source_tx_hash: Option<String>,
    pub source_chain_name: String,
    pub source_domain: i32,
}

/// Partial update merged into an existing record. Unset fields are left
/// untouched; `updated_at` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct TransferPatch {
    pub status: Option<TransferStatus>,
    pub step: Option<String>,
    /// Outer None leaves the column alone, inner None clears it
    pub last_error: Option<Option<String>>,
    pub retry_count: Option<i32>,
    pub source_tx_hash: Option<String>,
    pub attestation_message: Option<String>,
    pub attestation_signature: Option<String>,
    pub completion_tx_hash: Option<String>,
}

/// Merge a patch into a model. Setting a completed status also stamps
/// `completed_at`; nothing else may set it.
pub fn apply_patch(model: &mut Model, patch: TransferPatch) {
    let now = Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap());

    if let Some(status) = patch.status {
        model.status = status.to_string();
        if status == TransferStatus::Completed {
            model.completed_at = Some(now);
        }
    }
    if let Some(step) = patch.step {
        model.step = step;
    }
    if let Some(last_error) = patch.last_error {
        model.last_error = last_error;
    }
    if let Some(retry_count) = patch.retry_count {
        model.retry_count = retry_count;
    }
    if let Some(source_tx_hash) = patch.source_tx_hash {
        // Immutable once set
        if model.source_tx_hash.is_none() {
            model.source_tx_hash = Some(source_tx_hash);
        }
    }
    if let Some(message) = patch.attestation_message {
        if model.attestation_message.is_none() {
            model.attestation_message = Some(message);
        }
    }
    if let Some(signature) = patch.attestation_signature {
        if model.attestation_signature.is_none() {
            model.attestation_signature = Some(signature);
        }
    }
    if let Some(completion) = patch.completion_tx_hash {
        model.completion_tx_hash = Some(completion);
    }

    model.updated_at = now;
}

/// Storage seam for the transfer ledger so flow tests can run against an
/// in-memory implementation
#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn create(&self, new: NewTransfer) -> Result<Model, LedgerError>;
    async fn update(&self, id: i32, patch: TransferPatch) -> Result<Model, LedgerError>;
    async fn get(
        &self,
        job_reference: &str,
        operation: OperationKind,
    ) -> Result<Option<Model>, LedgerError>;
    async fn get_by_source_tx(&self, source_tx_hash: &str)
        -> Result<Option<Model>, LedgerError>;
    async fn list_by_status(&self, status: TransferStatus) -> Result<Vec<Model>, LedgerError>;
}

/// SeaORM-backed ledger
#[derive(Clone)]
pub struct SqlTransferStore {
    db: DatabaseConnection,
}

impl SqlTransferStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TransferStore for SqlTransferStore {
    async fn create(&self, new: NewTransfer) -> Result<Model, LedgerError> {
        // Milestone locks recur per job and are keyed by source tx hash;
        // everything else is single-shot per (job_reference, operation).
        if let Some(tx_hash) = &new.source_tx_hash {
            let existing = Transfers::find()
                .filter(transfers::Column::SourceTxHash.eq(tx_hash))
                .one(&self.db)
                .await
                .map_err(|e| LedgerError::Database(e.to_string()))?;
            if existing.is_some() {
                return Err(LedgerError::DuplicateTransfer(format!(
                    "source tx {}",
                    tx_hash
                )));
            }
        }

        if new.operation.is_single_shot() {
            let in_flight = Transfers::find()
                .filter(transfers::Column::JobReference.eq(&new.job_reference))
                .filter(transfers::Column::Operation.eq(new.operation.to_string()))
                .filter(
                    transfers::Column::Status.is_in(vec![
                        TransferStatus::Pending.to_string(),
                        TransferStatus::Completed.to_string(),
                    ]),
                )
                .one(&self.db)
                .await
                .map_err(|e| LedgerError::Database(e.to_string()))?;
            if in_flight.is_some() {
                return Err(LedgerError::DuplicateTransfer(format!(
                    "{} {}",
                    new.job_reference, new.operation
                )));
            }
        }

        let now = Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap());
        let record = transfers::ActiveModel {
            operation: Set(new.operation.to_string()),
            job_reference: Set(new.job_reference),
            dispute_reference: Set(new.dispute_reference),
            source_tx_hash: Set(new.source_tx_hash),
            source_chain_name: Set(new.source_chain_name),
            source_domain: Set(new.source_domain),
            status: Set(TransferStatus::Pending.to_string()),
            step: Set(steps::INITIATED.to_string()),
            retry_count: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        record
            .insert(&self.db)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))
    }

    async fn update(&self, id: i32, patch: TransferPatch) -> Result<Model, LedgerError> {
        let mut model = Transfers::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))?
            .ok_or(LedgerError::NotFound(id))?;

        apply_patch(&mut model, patch);

        let active = transfers::ActiveModel {
            id: Set(model.id),
            operation: Set(model.operation.clone()),
            job_reference: Set(model.job_reference.clone()),
            dispute_reference: Set(model.dispute_reference.clone()),
            source_tx_hash: Set(model.source_tx_hash.clone()),
            source_chain_name: Set(model.source_chain_name.clone()),
            source_domain: Set(model.source_domain),
            status: Set(model.status.clone()),
            step: Set(model.step.clone()),
            last_error: Set(model.last_error.clone()),
            retry_count: Set(model.retry_count),
            attestation_message: Set(model.attestation_message.clone()),
            attestation_signature: Set(model.attestation_signature.clone()),
            completion_tx_hash: Set(model.completion_tx_hash.clone()),
            created_at: Set(model.created_at),
            updated_at: Set(model.updated_at),
            completed_at: Set(model.completed_at),
        };

        active
            .update(&self.db)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))
    }

    async fn get(
        &self,
        job_reference: &str,
        operation: OperationKind,
    ) -> Result<Option<Model>, LedgerError> {
        Transfers::find()
            .filter(transfers::Column::JobReference.eq(job_reference))
            .filter(transfers::Column::Operation.eq(operation.to_string()))
            .order_by(transfers::Column::Id, Order::Desc)
            .one(&self.db)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))
    }

    async fn get_by_source_tx(
        &self,
        source_tx_hash: &str,
    ) -> Result<Option<Model>, LedgerError> {
        Transfers::find()
            .filter(transfers::Column::SourceTxHash.eq(source_tx_hash))
            .one(&self.db)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))
    }

    async fn list_by_status(&self, status: TransferStatus) -> Result<Vec<Model>, LedgerError> {
        Transfers::find()
            .filter(transfers::Column::Status.eq(status.to_string()))
            .order_by(transfers::Column::Id, Order::Asc)
            .all(&self.db)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))
    }
}
