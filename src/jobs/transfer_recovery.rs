//! Recovery scheduler
//!
//! Periodic sweep over the ledger that resumes pending transfers orphaned
//! by a crash and retries failed ones under an exponential backoff, up to
//! a retry ceiling. Runs one pass at startup so recovery does not wait for
//! the first interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::entities::transfers::Model;
use crate::models::transfer::TransferStatus;
use crate::services::ledger::TransferStore;
use crate::services::relay::RelayService;

/// Failed transfers past this many attempts need manual intervention
pub const MAX_RETRY_ATTEMPTS: i32 = 20;

const RECOVERY_INTERVAL_SECS: u64 = 120;
const RETRY_BACKOFF_BASE_SECS: i64 = 30;
const RETRY_BACKOFF_CAP_SECS: i64 = 3_600;

/// Pending records untouched for this long are treated as orphaned by a
/// previous process and resumed
const STALE_PENDING_SECS: i64 = 900;

/// Exponential backoff, capped: 30s, 60s, 120s, ... up to an hour
pub fn backoff_secs(retry_count: i32) -> i64 {
    let exp = retry_count.clamp(0, 10) as u32;
    (RETRY_BACKOFF_BASE_SECS << exp).min(RETRY_BACKOFF_CAP_SECS)
}

/// A failed record is retried once it is below the ceiling and its
/// backoff window has elapsed since the last update
pub fn eligible_for_retry(record: &Model) -> bool {
    if record.status != TransferStatus::Failed.to_string() {
        return false;
    }
    if record.retry_count >= MAX_RETRY_ATTEMPTS {
        return false;
    }
    let elapsed = Utc::now()
        .signed_duration_since(record.updated_at)
        .num_seconds();
    elapsed >= backoff_secs(record.retry_count)
}

pub fn is_stale_pending(record: &Model) -> bool {
    if record.status != TransferStatus::Pending.to_string() {
        return false;
    }
    let elapsed = Utc::now()
        .signed_duration_since(record.updated_at)
        .num_seconds();
    elapsed >= STALE_PENDING_SECS
}

/// Spawn the recovery loop. The returned handle is detached; the loop
/// runs for the lifetime of the process.
pub fn start_transfer_recovery_job(store: Arc<dyn TransferStore>, relay: RelayService) {
    tokio::spawn(async move {
        info!("Starting transfer recovery job");
        let mut interval = tokio::time::interval(Duration::from_secs(RECOVERY_INTERVAL_SECS));
        loop {
            // First tick fires immediately: the startup recovery pass
            interval.tick().await;
            if let Err(e) = run_recovery_pass(store.as_ref(), &relay).await {
                error!(error = %e, "Recovery pass failed");
            }
        }
    });
}

pub async fn run_recovery_pass(
    store: &dyn TransferStore,
    relay: &RelayService,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for record in store.list_by_status(TransferStatus::Pending).await? {
        if !is_stale_pending(&record) {
            continue;
        }
        let id = record.id;
        let job_reference = record.job_reference.clone();
        match relay.resume(record).await {
            Ok(response) if response.state == "accepted" => {
                info!(id = id, job_reference = %job_reference, "Resumed orphaned transfer");
            }
            Ok(_) => {}
            Err(e) => {
                error!(id = id, job_reference = %job_reference, error = %e, "Resume failed");
            }
        }
    }

    for record in store.list_by_status(TransferStatus::Failed).await? {
        if record.retry_count >= MAX_RETRY_ATTEMPTS {
            error!(
                id = record.id,
                job_reference = %record.job_reference,
                retry_count = record.retry_count,
                last_error = record.last_error.as_deref().unwrap_or(""),
                "Transfer exhausted its retries and needs manual intervention"
            );
            continue;
        }
        if !eligible_for_retry(&record) {
            continue;
        }
        let id = record.id;
        let job_reference = record.job_reference.clone();
        let retry_count = record.retry_count;
        match relay.retry_record(record).await {
            Ok(response) if response.state == "accepted" => {
                info!(
                    id = id,
                    job_reference = %job_reference,
                    attempt = retry_count + 1,
                    "Retrying failed transfer"
                );
            }
            Ok(_) => {
                warn!(id = id, job_reference = %job_reference, "Retry skipped, pipeline active");
            }
            Err(e) => {
                error!(id = id, job_reference = %job_reference, error = %e, "Retry failed");
            }
        }
    }

    Ok(())
}
