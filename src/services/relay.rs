//! Relay flow controller
//!
//! Sequences watcher → attestation poller → executor for each operation
//! kind, writing a ledger update after every step transition. Owns the
//! in-process dedup registry (one active pipeline per operation key) and a
//! status cache backed by the ledger so lookups survive restarts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::entities::transfers::Model;
use crate::models::transfer::{
    steps, OperationKind, TransferStatus, TriggerResponse, COMPLETED_BY_BRIDGE,
};
use crate::services::attestation::{Attestation, AttestationError, AttestationSource};
use crate::services::chains::{self, ChainInfo, ChainResolutionError};
use crate::services::event_watcher::{EventSource, WatcherError};
use crate::services::executor::{ExecutorError, ReceiveSubmitter};
use crate::services::ledger::{LedgerError, NewTransfer, TransferPatch, TransferStore};

/// Signature of the job-board event announcing an on-chain payment
/// release; watched when a release trigger arrives without a source tx
const PAYMENT_RELEASED_EVENT: &str = "PaymentReleased(uint256,address,uint256)";

const DEFAULT_EVENT_WATCH_TIMEOUT_SECS: u64 = 600;
const DEFAULT_ATTESTATION_TIMEOUT_SECS: u64 = 1_200;

/// Error types for relay orchestration
#[derive(Debug)]
pub enum RelayError {
    ChainResolution(ChainResolutionError),
    Ledger(LedgerError),
    EventWatch(WatcherError),
    Attestation(AttestationError),
    Execution(ExecutorError),
    /// A persisted record violates an invariant (e.g. unknown operation)
    Inconsistent(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::ChainResolution(e) => write!(f, "{}", e),
            RelayError::Ledger(e) => write!(f, "{}", e),
            RelayError::EventWatch(e) => write!(f, "{}", e),
            RelayError::Attestation(e) => write!(f, "{}", e),
            RelayError::Execution(e) => write!(f, "{}", e),
            RelayError::Inconsistent(msg) => write!(f, "Inconsistent record: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<ChainResolutionError> for RelayError {
    fn from(e: ChainResolutionError) -> Self {
        RelayError::ChainResolution(e)
    }
}

impl From<LedgerError> for RelayError {
    fn from(e: LedgerError) -> Self {
        RelayError::Ledger(e)
    }
}

impl From<WatcherError> for RelayError {
    fn from(e: WatcherError) -> Self {
        RelayError::EventWatch(e)
    }
}

impl From<AttestationError> for RelayError {
    fn from(e: AttestationError) -> Self {
        RelayError::Attestation(e)
    }
}

impl From<ExecutorError> for RelayError {
    fn from(e: ExecutorError) -> Self {
        RelayError::Execution(e)
    }
}

/// Relay configuration resolved at startup
#[derive(Clone)]
pub struct RelayConfig {
    /// Chain every relay lands on
    pub destination: &'static ChainInfo,
    pub event_watch_timeout: Duration,
    pub attestation_timeout: Duration,
}

impl RelayConfig {
    /// Destination from RELAY_NATIVE_CHAIN_TAG (falling back to the
    /// default native chain), default timeouts
    pub fn from_env() -> Result<Self, ChainResolutionError> {
        let tag = match std::env::var("RELAY_NATIVE_CHAIN_TAG") {
            Ok(raw) => raw
                .parse::<u32>()
                .map_err(|_| ChainResolutionError::MalformedTag(raw))?,
            Err(_) => chains::DEFAULT_NATIVE_CHAIN_TAG,
        };
        let destination = chains::by_tag(tag).ok_or(ChainResolutionError::UnknownTag(tag))?;
        if destination.transfer_domain.is_none() {
            return Err(ChainResolutionError::NoTransferDomain(destination.name));
        }

        Ok(Self {
            destination,
            event_watch_timeout: Duration::from_secs(DEFAULT_EVENT_WATCH_TIMEOUT_SECS),
            attestation_timeout: Duration::from_secs(DEFAULT_ATTESTATION_TIMEOUT_SECS),
        })
    }
}

/// One active pipeline per operation key; milestone locks key on the
/// source transaction because the same job locks many milestones
fn dedup_key(
    operation: OperationKind,
    job_reference: &str,
    source_tx_hash: Option<&str>,
) -> String {
    match (operation, source_tx_hash) {
        (OperationKind::MilestoneLock, Some(tx_hash)) => {
            format!("{}:{}", operation, tx_hash)
        }
        _ => format!("{}:{}", operation, job_reference),
    }
}

/// Membership in the active-key registry, released on drop so a pipeline
/// exit on any path (success, failure, panic) frees its key
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.key);
    }
}

/// Flow controller for cross-chain transfer relays
#[derive(Clone)]
pub struct RelayService {
    store: Arc<dyn TransferStore>,
    watcher: Arc<dyn EventSource>,
    attestation: Arc<dyn AttestationSource>,
    executor: Arc<dyn ReceiveSubmitter>,
    active: Arc<Mutex<HashSet<String>>>,
    status_cache: Cache<String, Model>,
    config: RelayConfig,
}

impl RelayService {
    pub fn new(
        store: Arc<dyn TransferStore>,
        watcher: Arc<dyn EventSource>,
        attestation: Arc<dyn AttestationSource>,
        executor: Arc<dyn ReceiveSubmitter>,
        config: RelayConfig,
    ) -> Self {
        let status_cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(3600))
            .build();

        Self {
            store,
            watcher,
            attestation,
            executor,
            active: Arc::new(Mutex::new(HashSet::new())),
            status_cache,
            config,
        }
    }

    fn try_acquire(&self, key: &str) -> Option<ActiveGuard> {
        if self.active.lock().insert(key.to_string()) {
            Some(ActiveGuard {
                active: self.active.clone(),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    /// Relay a job start; the source transaction hash is always supplied
    pub async fn trigger_job_start(
        &self,
        job_reference: &str,
        source_tx_hash: &str,
    ) -> Result<TriggerResponse, RelayError> {
        self.trigger(
            OperationKind::JobStart,
            job_reference,
            Some(source_tx_hash),
            None,
        )
        .await
    }

    /// Relay a payment release; without a source transaction hash the
    /// pipeline first watches the job board for the release event
    pub async fn trigger_payment_release(
        &self,
        job_reference: &str,
        source_tx_hash: Option<&str>,
    ) -> Result<TriggerResponse, RelayError> {
        self.trigger(
            OperationKind::PaymentRelease,
            job_reference,
            source_tx_hash,
            None,
        )
        .await
    }

    /// Relay a milestone lock, keyed by its source transaction hash
    pub async fn trigger_milestone_lock(
        &self,
        job_reference: &str,
        source_tx_hash: &str,
    ) -> Result<TriggerResponse, RelayError> {
        self.trigger(
            OperationKind::MilestoneLock,
            job_reference,
            Some(source_tx_hash),
            None,
        )
        .await
    }

    /// Relay a dispute settlement
    pub async fn trigger_dispute_settle(
        &self,
        dispute_reference: &str,
        job_reference: &str,
        source_tx_hash: &str,
    ) -> Result<TriggerResponse, RelayError> {
        self.trigger(
            OperationKind::DisputeSettle,
            job_reference,
            Some(source_tx_hash),
            Some(dispute_reference),
        )
        .await
    }

    /// Common trigger path: resolve the source chain before any side
    /// effect, admit one pipeline per key, open the ledger record, then
    /// drive the pipeline in a supervised background task
    async fn trigger(
        &self,
        operation: OperationKind,
        job_reference: &str,
        source_tx_hash: Option<&str>,
        dispute_reference: Option<&str>,
    ) -> Result<TriggerResponse, RelayError> {
        let chain = chains::resolve(job_reference)?;
        let source_domain = chain
            .transfer_domain
            .ok_or(ChainResolutionError::NoTransferDomain(chain.name))?;

        let key = dedup_key(operation, job_reference, source_tx_hash);
        let guard = match self.try_acquire(&key) {
            Some(guard) => guard,
            None => {
                info!(key = %key, "Trigger ignored, pipeline already active");
                return Ok(TriggerResponse::already_processing(
                    job_reference,
                    operation,
                ));
            }
        };

        let record = match self
            .store
            .create(NewTransfer {
                operation,
                job_reference: job_reference.to_string(),
                dispute_reference: dispute_reference.map(str::to_string),
                source_tx_hash: source_tx_hash.map(str::to_string),
                source_chain_name: chain.name.to_string(),
                source_domain: source_domain as i32,
            })
            .await
        {
            Ok(record) => record,
            Err(LedgerError::DuplicateTransfer(key)) => {
                info!(key = %key, "Trigger ignored, transfer already recorded");
                return Ok(TriggerResponse::already_processing(
                    job_reference,
                    operation,
                ));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            id = record.id,
            operation = %operation,
            job_reference = %job_reference,
            source_chain = %chain.name,
            source_domain = source_domain,
            "Relay pipeline starting"
        );

        self.spawn_pipeline(record, guard);
        Ok(TriggerResponse::accepted(job_reference, operation))
    }

    /// Re-drive a persisted record that was left pending (crash recovery).
    /// Does not touch `retry_count`.
    pub async fn resume(&self, record: Model) -> Result<TriggerResponse, RelayError> {
        let operation: OperationKind = record
            .operation
            .parse()
            .map_err(RelayError::Inconsistent)?;
        let key = dedup_key(operation, &record.job_reference, record.source_tx_hash.as_deref());

        let guard = match self.try_acquire(&key) {
            Some(guard) => guard,
            None => {
                return Ok(TriggerResponse::already_processing(
                    &record.job_reference,
                    operation,
                ))
            }
        };

        info!(
            id = record.id,
            operation = %operation,
            job_reference = %record.job_reference,
            step = %record.step,
            "Resuming pending relay"
        );

        let job_reference = record.job_reference.clone();
        self.spawn_pipeline(record, guard);
        Ok(TriggerResponse::accepted(&job_reference, operation))
    }

    /// Explicit retry of a failed record: flips it back to pending,
    /// increments `retry_count`, and re-drives it. The only permitted
    /// failed → pending transition.
    pub async fn retry_record(&self, record: Model) -> Result<TriggerResponse, RelayError> {
        let operation: OperationKind = record
            .operation
            .parse()
            .map_err(RelayError::Inconsistent)?;

        if record.status != TransferStatus::Failed.to_string() {
            return Err(RelayError::Inconsistent(format!(
                "retry requested for transfer {} with status {}",
                record.id, record.status
            )));
        }

        let key = dedup_key(operation, &record.job_reference, record.source_tx_hash.as_deref());
        let guard = match self.try_acquire(&key) {
            Some(guard) => guard,
            None => {
                return Ok(TriggerResponse::already_processing(
                    &record.job_reference,
                    operation,
                ))
            }
        };

        let record = self
            .persist(
                record.id,
                TransferPatch {
                    status: Some(TransferStatus::Pending),
                    step: Some(steps::INITIATED.to_string()),
                    retry_count: Some(record.retry_count + 1),
                    // A retried transfer must not keep reporting the
                    // failure it is retrying
                    last_error: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            id = record.id,
            retry_count = record.retry_count,
            job_reference = %record.job_reference,
            "Retrying failed relay"
        );

        let job_reference = record.job_reference.clone();
        self.spawn_pipeline(record, guard);
        Ok(TriggerResponse::accepted(&job_reference, operation))
    }

    /// Current status for an operation key: in-memory cache first, ledger
    /// fallback so the answer survives restarts
    pub async fn status(
        &self,
        job_reference: &str,
        operation: OperationKind,
    ) -> Result<Option<Model>, RelayError> {
        let key = format!("{}:{}", operation, job_reference);
        if let Some(cached) = self.status_cache.get(&key).await {
            return Ok(Some(cached));
        }

        let record = self.store.get(job_reference, operation).await?;
        if let Some(model) = &record {
            self.status_cache.insert(key, model.clone()).await;
        }
        Ok(record)
    }

    /// Status lookup by source transaction hash, the operation key for
    /// milestone locks. Job-scoped lookups only see the newest record for
    /// a job, so older milestone locks are reachable through this path.
    pub async fn status_by_source_tx(
        &self,
        source_tx_hash: &str,
    ) -> Result<Option<Model>, RelayError> {
        Ok(self.store.get_by_source_tx(source_tx_hash).await?)
    }

    /// Ledger update that also refreshes the status cache
    async fn persist(&self, id: i32, patch: TransferPatch) -> Result<Model, RelayError> {
        let model = self.store.update(id, patch).await?;
        let operation: OperationKind = model
            .operation
            .parse()
            .map_err(RelayError::Inconsistent)?;
        let key = format!("{}:{}", operation, model.job_reference);
        self.status_cache.insert(key, model.clone()).await;
        Ok(model)
    }

    fn spawn_pipeline(&self, record: Model, guard: ActiveGuard) {
        let service = self.clone();
        tokio::spawn(async move {
            // Holds the dedup key until the pipeline exits
            let _guard = guard;
            let id = record.id;
            let job_reference = record.job_reference.clone();
            if let Err(e) = service.run_to_terminal(record).await {
                error!(
                    id = id,
                    job_reference = %job_reference,
                    error = %e,
                    "Relay pipeline failed"
                );
            }
        });
    }

    /// Drive a record to a terminal state, recording failures in the
    /// ledger before propagating them
    async fn run_to_terminal(&self, record: Model) -> Result<Model, RelayError> {
        let id = record.id;
        match self.drive(record).await {
            Ok(record) => Ok(record),
            Err(e) => {
                let patch = TransferPatch {
                    status: Some(TransferStatus::Failed),
                    step: Some(steps::FAILED.to_string()),
                    last_error: Some(Some(e.to_string())),
                    ..Default::default()
                };
                if let Err(update_err) = self.persist(id, patch).await {
                    error!(
                        id = id,
                        error = %update_err,
                        "Failed to record relay failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// The pipeline proper. Each phase is skipped when the record's
    /// durable fields already prove it happened, which is what makes
    /// crash recovery a plain re-drive.
    async fn drive(&self, mut record: Model) -> Result<Model, RelayError> {
        let source_chain = chains::resolve(&record.job_reference)?;

        if record.source_tx_hash.is_none() {
            record = self
                .persist(
                    record.id,
                    TransferPatch {
                        step: Some(steps::WATCHING_EVENT.to_string()),
                        ..Default::default()
                    },
                )
                .await?;

            let tx_hash = self
                .watcher
                .wait_for_event(
                    source_chain,
                    PAYMENT_RELEASED_EVENT,
                    &record.job_reference,
                    self.config.event_watch_timeout,
                )
                .await?;

            record = self
                .persist(
                    record.id,
                    TransferPatch {
                        source_tx_hash: Some(tx_hash),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let source_tx_hash = record.source_tx_hash.clone().ok_or_else(|| {
            RelayError::Inconsistent(format!("transfer {} has no source tx hash", record.id))
        })?;

        if record.attestation_message.is_none() {
            record = self
                .persist(
                    record.id,
                    TransferPatch {
                        step: Some(steps::POLLING_ATTESTATION.to_string()),
                        ..Default::default()
                    },
                )
                .await?;

            let attestation = self
                .attestation
                .poll_attestation(
                    &source_tx_hash,
                    record.source_domain as u32,
                    self.config.attestation_timeout,
                )
                .await?;

            record = self
                .persist(
                    record.id,
                    TransferPatch {
                        attestation_message: Some(attestation.message),
                        attestation_signature: Some(attestation.signature),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let (message, signature) = match (
            record.attestation_message.clone(),
            record.attestation_signature.clone(),
        ) {
            (Some(message), Some(signature)) => (message, signature),
            _ => {
                return Err(RelayError::Inconsistent(format!(
                    "transfer {} has a partial attestation",
                    record.id
                )))
            }
        };

        record = self
            .persist(
                record.id,
                TransferPatch {
                    step: Some(steps::EXECUTING_RECEIVE.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let attestation = Attestation {
            message,
            signature,
            mint_recipient: None,
            amount: None,
        };

        let outcome = self
            .executor
            .submit(self.config.destination, &attestation)
            .await?;

        let completion_tx_hash = if outcome.already_completed {
            warn!(
                id = record.id,
                job_reference = %record.job_reference,
                "Transfer already completed by the bridge"
            );
            COMPLETED_BY_BRIDGE.to_string()
        } else {
            outcome.tx_hash.ok_or_else(|| {
                RelayError::Inconsistent("submission returned neither hash nor completion".into())
            })?
        };

        let record = self
            .persist(
                record.id,
                TransferPatch {
                    status: Some(TransferStatus::Completed),
                    step: Some(steps::COMPLETED.to_string()),
                    completion_tx_hash: Some(completion_tx_hash.clone()),
                    last_error: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            id = record.id,
            job_reference = %record.job_reference,
            completion_tx_hash = %completion_tx_hash,
            "Relay complete"
        );

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::attestation::AttestationError;
    use crate::services::executor::SubmitOutcome;
    use crate::services::ledger::testing::InMemoryTransferStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockWatcher {
        result: Option<String>,
    }

    #[async_trait]
    impl EventSource for MockWatcher {
        async fn wait_for_event(
            &self,
            _chain: &ChainInfo,
            event_signature: &str,
            job_reference: &str,
            _timeout: Duration,
        ) -> Result<String, WatcherError> {
            match &self.result {
                Some(tx_hash) => Ok(tx_hash.clone()),
                None => Err(WatcherError::EventTimeout(format!(
                    "No {} event for {}",
                    event_signature, job_reference
                ))),
            }
        }
    }

    /// Simulates an authority that needs `rounds` internal poll rounds
    /// before the attestation turns complete
    struct MockAttestation {
        rounds: u32,
        rounds_spent: AtomicU32,
    }

    impl MockAttestation {
        fn completing_after(rounds: u32) -> Self {
            Self {
                rounds,
                rounds_spent: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AttestationSource for MockAttestation {
        async fn poll_attestation(
            &self,
            source_tx_hash: &str,
            _source_domain: u32,
            _timeout: Duration,
        ) -> Result<Attestation, AttestationError> {
            self.rounds_spent.fetch_add(self.rounds, Ordering::SeqCst);
            Ok(Attestation {
                message: format!("0xaa{}", source_tx_hash.trim_start_matches("0x")),
                signature: "0xbb".to_string(),
                mint_recipient: None,
                amount: None,
            })
        }
    }

    /// Tracks consumed attestation messages the way the destination
    /// contract's replay protection does
    struct MockExecutor {
        outcome: Mutex<HashSet<String>>,
        mode: ExecMode,
    }

    enum ExecMode {
        Succeed,
        NonceAlreadyUsed,
        Reject,
    }

    impl MockExecutor {
        fn new(mode: ExecMode) -> Self {
            Self {
                outcome: Mutex::new(HashSet::new()),
                mode,
            }
        }
    }

    #[async_trait]
    impl ReceiveSubmitter for MockExecutor {
        async fn submit(
            &self,
            _destination: &ChainInfo,
            attestation: &Attestation,
        ) -> Result<SubmitOutcome, ExecutorError> {
            match self.mode {
                ExecMode::NonceAlreadyUsed => Ok(SubmitOutcome::already_completed()),
                ExecMode::Reject => Err(ExecutorError::TransactionRejected(
                    "execution reverted: transfer paused".to_string(),
                )),
                ExecMode::Succeed => {
                    // Second submission of the same proof hits replay
                    // protection, never a second completion
                    if !self.outcome.lock().insert(attestation.message.clone()) {
                        return Ok(SubmitOutcome::already_completed());
                    }
                    Ok(SubmitOutcome::submitted("0xde57".to_string()))
                }
            }
        }
    }

    /// Watcher parked until released, for observing in-flight pipelines
    struct BlockingWatcher {
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl EventSource for BlockingWatcher {
        async fn wait_for_event(
            &self,
            _chain: &ChainInfo,
            _event_signature: &str,
            _job_reference: &str,
            _timeout: Duration,
        ) -> Result<String, WatcherError> {
            self.release.notified().await;
            Ok("0xblocked".to_string())
        }
    }

    /// Attestation source parked until released
    struct BlockingAttestation {
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl AttestationSource for BlockingAttestation {
        async fn poll_attestation(
            &self,
            source_tx_hash: &str,
            _source_domain: u32,
            _timeout: Duration,
        ) -> Result<Attestation, AttestationError> {
            self.release.notified().await;
            Ok(Attestation {
                message: format!("0xaa{}", source_tx_hash.trim_start_matches("0x")),
                signature: "0xbb".to_string(),
                mint_recipient: None,
                amount: None,
            })
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            destination: chains::by_tag(chains::DEFAULT_NATIVE_CHAIN_TAG).unwrap(),
            event_watch_timeout: Duration::from_secs(1),
            attestation_timeout: Duration::from_secs(1),
        }
    }

    fn service_with(
        store: Arc<InMemoryTransferStore>,
        watcher: MockWatcher,
        attestation: MockAttestation,
        executor: MockExecutor,
    ) -> RelayService {
        RelayService::new(
            store,
            Arc::new(watcher),
            Arc::new(attestation),
            Arc::new(executor),
            config(),
        )
    }

    async fn wait_for_terminal(
        store: &InMemoryTransferStore,
        job_reference: &str,
        operation: OperationKind,
    ) -> Model {
        for _ in 0..200 {
            if let Some(record) = store.get(job_reference, operation).await.unwrap() {
                if record.status != TransferStatus::Pending.to_string() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transfer for {} never reached a terminal state", job_reference);
    }

    #[tokio::test]
    async fn test_unresolvable_chain_creates_no_record() {
        let store = Arc::new(InMemoryTransferStore::new());
        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Succeed),
        );

        let result = service.trigger_job_start("99999-1", "0xabc").await;
        assert!(matches!(result, Err(RelayError::ChainResolution(_))));
        assert_eq!(store.len(), 0);

        let result = service.trigger_job_start("no-tag-here", "0xabc").await;
        assert!(matches!(result, Err(RelayError::ChainResolution(_))));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_job_start_completes_end_to_end() {
        let store = Arc::new(InMemoryTransferStore::new());
        let attestation = Arc::new(MockAttestation::completing_after(2));
        let service = RelayService::new(
            store.clone(),
            Arc::new(MockWatcher { result: None }),
            attestation.clone(),
            Arc::new(MockExecutor::new(ExecMode::Succeed)),
            config(),
        );

        let response = service.trigger_job_start("40161-4", "0xsrc").await.unwrap();
        assert_eq!(response.state, "accepted");

        let record = wait_for_terminal(&store, "40161-4", OperationKind::JobStart).await;
        assert_eq!(record.status, "completed");
        assert_eq!(record.step, steps::COMPLETED);
        assert_eq!(record.source_domain, 0);
        assert_eq!(record.source_chain_name, "Ethereum Sepolia");
        assert_eq!(record.completion_tx_hash.as_deref(), Some("0xde57"));
        assert!(record.attestation_message.is_some());
        assert!(record.attestation_signature.is_some());
        assert!(record.completed_at.is_some());
        assert!(record.completed_at.unwrap() >= record.created_at);
        assert_eq!(attestation.rounds_spent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_nonce_already_used_resolves_to_completed_sentinel() {
        let store = Arc::new(InMemoryTransferStore::new());
        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(2),
            MockExecutor::new(ExecMode::NonceAlreadyUsed),
        );

        service.trigger_job_start("40161-4", "0xsrc").await.unwrap();

        let record = wait_for_terminal(&store, "40161-4", OperationKind::JobStart).await;
        assert_eq!(record.status, "completed");
        assert_eq!(record.completion_tx_hash.as_deref(), Some(COMPLETED_BY_BRIDGE));
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_same_attestation_submitted_twice_never_completes_twice() {
        let executor = MockExecutor::new(ExecMode::Succeed);
        let attestation = Attestation {
            message: "0xaa01".to_string(),
            signature: "0xbb".to_string(),
            mint_recipient: None,
            amount: None,
        };
        let destination = chains::by_tag(chains::DEFAULT_NATIVE_CHAIN_TAG).unwrap();

        let first = executor.submit(destination, &attestation).await.unwrap();
        assert!(!first.already_completed);
        assert!(first.tx_hash.is_some());

        let second = executor.submit(destination, &attestation).await.unwrap();
        assert!(second.already_completed);
        assert!(second.tx_hash.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_trigger_answers_already_processing() {
        let store = Arc::new(InMemoryTransferStore::new());
        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Succeed),
        );

        let first = service.trigger_job_start("40161-7", "0xaaa1").await.unwrap();
        assert_eq!(first.state, "accepted");

        // Completed by the time the duplicate arrives: the ledger-level
        // single-shot check still answers already_processing
        wait_for_terminal(&store, "40161-7", OperationKind::JobStart).await;
        let second = service.trigger_job_start("40161-7", "0xaaa2").await.unwrap();
        assert_eq!(second.state, "already_processing");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_trigger_answers_already_processing() {
        let store = Arc::new(InMemoryTransferStore::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let service = RelayService::new(
            store.clone(),
            Arc::new(BlockingWatcher {
                release: release.clone(),
            }),
            Arc::new(MockAttestation::completing_after(1)),
            Arc::new(MockExecutor::new(ExecMode::Succeed)),
            config(),
        );

        let first = service
            .trigger_payment_release("40161-61", None)
            .await
            .unwrap();
        assert_eq!(first.state, "accepted");

        // First pipeline is parked in the watcher phase: the in-memory
        // guard, not the ledger, must turn the duplicate away
        let second = service
            .trigger_payment_release("40161-61", None)
            .await
            .unwrap();
        assert_eq!(second.state, "already_processing");
        assert_eq!(store.len(), 1);

        release.notify_one();
        let record =
            wait_for_terminal(&store, "40161-61", OperationKind::PaymentRelease).await;
        assert_eq!(record.status, "completed");
        assert_eq!(record.source_tx_hash.as_deref(), Some("0xblocked"));
    }

    #[tokio::test]
    async fn test_milestone_locks_key_on_source_tx() {
        let store = Arc::new(InMemoryTransferStore::new());
        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Succeed),
        );

        let first = service
            .trigger_milestone_lock("40161-9", "0xlock1")
            .await
            .unwrap();
        let second = service
            .trigger_milestone_lock("40161-9", "0xlock2")
            .await
            .unwrap();
        assert_eq!(first.state, "accepted");
        assert_eq!(second.state, "accepted");

        for _ in 0..200 {
            if store.count_terminal() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.len(), 2);

        // Same source tx again is a duplicate
        let repeat = service
            .trigger_milestone_lock("40161-9", "0xlock1")
            .await
            .unwrap();
        assert_eq!(repeat.state, "already_processing");
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_status_by_source_tx_reaches_each_milestone_lock() {
        let store = Arc::new(InMemoryTransferStore::new());
        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Succeed),
        );

        service
            .trigger_milestone_lock("40161-15", "0xlock1")
            .await
            .unwrap();
        service
            .trigger_milestone_lock("40161-15", "0xlock2")
            .await
            .unwrap();
        for _ in 0..200 {
            if store.count_terminal() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The job-scoped lookup only sees the newest record; each lock
        // stays reachable by its source tx hash, persisted attestation
        // included
        let first = service
            .status_by_source_tx("0xlock1")
            .await
            .unwrap()
            .unwrap();
        let second = service
            .status_by_source_tx("0xlock2")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.status, "completed");
        assert_eq!(second.status, "completed");
        assert_eq!(first.attestation_message.as_deref(), Some("0xaalock1"));
        assert_eq!(second.attestation_message.as_deref(), Some("0xaalock2"));

        assert!(service
            .status_by_source_tx("0xunknown")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_payment_release_without_hash_runs_watcher_first() {
        let store = Arc::new(InMemoryTransferStore::new());
        let service = service_with(
            store.clone(),
            MockWatcher {
                result: Some("0xevent".to_string()),
            },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Succeed),
        );

        service
            .trigger_payment_release("40161-11", None)
            .await
            .unwrap();

        let record =
            wait_for_terminal(&store, "40161-11", OperationKind::PaymentRelease).await;
        assert_eq!(record.status, "completed");
        assert_eq!(record.source_tx_hash.as_deref(), Some("0xevent"));
    }

    #[tokio::test]
    async fn test_event_timeout_marks_record_failed() {
        let store = Arc::new(InMemoryTransferStore::new());
        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Succeed),
        );

        service
            .trigger_payment_release("40161-12", None)
            .await
            .unwrap();

        let record =
            wait_for_terminal(&store, "40161-12", OperationKind::PaymentRelease).await;
        assert_eq!(record.status, "failed");
        assert_eq!(record.step, steps::FAILED);
        assert!(record
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("Event timeout"));
        assert!(record.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_rejection_preserves_reason_in_last_error() {
        let store = Arc::new(InMemoryTransferStore::new());
        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Reject),
        );

        service.trigger_job_start("40161-13", "0xsrc13").await.unwrap();

        let record = wait_for_terminal(&store, "40161-13", OperationKind::JobStart).await;
        assert_eq!(record.status, "failed");
        assert!(record
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("transfer paused"));
    }

    #[tokio::test]
    async fn test_dispute_settle_carries_dispute_reference() {
        let store = Arc::new(InMemoryTransferStore::new());
        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Succeed),
        );

        service
            .trigger_dispute_settle("disp-77", "40245-3", "0xsrc77")
            .await
            .unwrap();

        let record = wait_for_terminal(&store, "40245-3", OperationKind::DisputeSettle).await;
        assert_eq!(record.status, "completed");
        assert_eq!(record.dispute_reference.as_deref(), Some("disp-77"));
        assert_eq!(record.source_domain, 6);
    }

    #[tokio::test]
    async fn test_status_falls_back_to_ledger() {
        let store = Arc::new(InMemoryTransferStore::new());
        let record = store
            .create(NewTransfer {
                operation: OperationKind::JobStart,
                job_reference: "40161-21".to_string(),
                dispute_reference: None,
                source_tx_hash: Some("0xpersisted".to_string()),
                source_chain_name: "Ethereum Sepolia".to_string(),
                source_domain: 0,
            })
            .await
            .unwrap();

        // Fresh service, empty cache: simulates a process restart
        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Succeed),
        );

        let found = service
            .status("40161-21", OperationKind::JobStart)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(found.source_tx_hash.as_deref(), Some("0xpersisted"));
    }

    #[tokio::test]
    async fn test_retry_flips_failed_to_pending_and_increments() {
        let store = Arc::new(InMemoryTransferStore::new());
        let record = store
            .create(NewTransfer {
                operation: OperationKind::JobStart,
                job_reference: "40161-31".to_string(),
                dispute_reference: None,
                source_tx_hash: Some("0xsrc31".to_string()),
                source_chain_name: "Ethereum Sepolia".to_string(),
                source_domain: 0,
            })
            .await
            .unwrap();
        let record = store
            .update(
                record.id,
                TransferPatch {
                    status: Some(TransferStatus::Failed),
                    last_error: Some(Some("boom".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Succeed),
        );

        let response = service.retry_record(record).await.unwrap();
        assert_eq!(response.state, "accepted");

        let record = wait_for_terminal(&store, "40161-31", OperationKind::JobStart).await;
        assert_eq!(record.status, "completed");
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_clears_previous_failure_while_in_flight() {
        let store = Arc::new(InMemoryTransferStore::new());
        let record = store
            .create(NewTransfer {
                operation: OperationKind::JobStart,
                job_reference: "40161-35".to_string(),
                dispute_reference: None,
                source_tx_hash: Some("0xsrc35".to_string()),
                source_chain_name: "Ethereum Sepolia".to_string(),
                source_domain: 0,
            })
            .await
            .unwrap();
        let record = store
            .update(
                record.id,
                TransferPatch {
                    status: Some(TransferStatus::Failed),
                    last_error: Some(Some("attestation timeout".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let release = Arc::new(tokio::sync::Notify::new());
        let service = RelayService::new(
            store.clone(),
            Arc::new(MockWatcher { result: None }),
            Arc::new(BlockingAttestation {
                release: release.clone(),
            }),
            Arc::new(MockExecutor::new(ExecMode::Succeed)),
            config(),
        );

        service.retry_record(record).await.unwrap();

        // With the pipeline parked mid-poll, the record must not keep
        // reporting the failure it is retrying
        let in_flight = store
            .get("40161-35", OperationKind::JobStart)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_flight.status, "pending");
        assert_eq!(in_flight.retry_count, 1);
        assert!(in_flight.last_error.is_none());

        release.notify_one();
        let record = wait_for_terminal(&store, "40161-35", OperationKind::JobStart).await;
        assert_eq!(record.status, "completed");
    }

    #[tokio::test]
    async fn test_retry_rejected_for_non_failed_record() {
        let store = Arc::new(InMemoryTransferStore::new());
        let record = store
            .create(NewTransfer {
                operation: OperationKind::JobStart,
                job_reference: "40161-41".to_string(),
                dispute_reference: None,
                source_tx_hash: Some("0xsrc41".to_string()),
                source_chain_name: "Ethereum Sepolia".to_string(),
                source_domain: 0,
            })
            .await
            .unwrap();

        let service = service_with(
            store.clone(),
            MockWatcher { result: None },
            MockAttestation::completing_after(1),
            MockExecutor::new(ExecMode::Succeed),
        );

        assert!(matches!(
            service.retry_record(record).await,
            Err(RelayError::Inconsistent(_))
        ));
    }
}
