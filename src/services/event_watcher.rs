//! Event watcher for source-chain job events
//!
//! Watches a job-board contract for a named event carrying a given job
//! sequence as its first indexed topic and returns the transaction hash of
//! the first new occurrence. Chain data providers cap how many blocks a
//! single log query may span, so rounds page through bounded chunks behind
//! a resumable cursor. Transaction hashes already handed to a caller in
//! this process's lifetime are never returned again: the same job can emit
//! the same named event repeatedly (successive milestone payments).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::{
    eips::BlockNumberOrTag,
    primitives::{keccak256, B256, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::Filter,
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::services::chains::{self, ChainInfo};

/// Maximum block span per log query (providers reject wider ranges)
const QUERY_CHUNK_BLOCKS: u64 = 5_000;

/// How far behind the current head a fresh watch starts, to tolerate the
/// watcher coming up after the source event was emitted
const START_LOOKBACK_BLOCKS: u64 = 1_000;

/// Pause between polling rounds once the cursor has caught up
const ROUND_INTERVAL_SECS: u64 = 10;

/// Longer pause after a provider error before the round is retried
const ERROR_BACKOFF_SECS: u64 = 30;

/// Error types for event watching
#[derive(Debug)]
pub enum WatcherError {
    /// No matching event appeared before the timeout elapsed
    EventTimeout(String),
    InvalidConfig(String),
    MalformedReference(String),
}

impl std::fmt::Display for WatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatcherError::EventTimeout(msg) => write!(f, "Event timeout: {}", msg),
            WatcherError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            WatcherError::MalformedReference(msg) => {
                write!(f, "Malformed job reference: {}", msg)
            }
        }
    }
}

impl std::error::Error for WatcherError {}

/// Seam for the flow controller so tests can substitute a mock
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait for the first new `event_signature` occurrence on `chain`'s
    /// job board matching `job_reference`, returning its transaction hash
    async fn wait_for_event(
        &self,
        chain: &ChainInfo,
        event_signature: &str,
        job_reference: &str,
        timeout: Duration,
    ) -> Result<String, WatcherError>;
}

/// Log-scanning event watcher
pub struct EventWatcher {
    /// Transaction hashes already returned in this process's lifetime
    seen: Arc<Mutex<HashSet<String>>>,
}

impl EventWatcher {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Record a hash as consumed; returns false if it was already known
    fn mark_seen(&self, tx_hash: &str) -> bool {
        self.seen.lock().insert(tx_hash.to_string())
    }

    fn build_provider(chain: &ChainInfo) -> Result<RootProvider<Http<Client>>, WatcherError> {
        let rpc_url = std::env::var(chain.rpc_url_env).map_err(|_| {
            WatcherError::InvalidConfig(format!("{} not configured", chain.rpc_url_env))
        })?;
        let provider = ProviderBuilder::new().on_http(rpc_url.parse().map_err(|e| {
            WatcherError::InvalidConfig(format!("Invalid RPC URL for {}: {}", chain.name, e))
        })?);
        Ok(provider)
    }
}

impl Default for EventWatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Upper bound of the next chunked query starting at `cursor`
fn chunk_end(cursor: u64, head: u64) -> u64 {
    head.min(cursor + QUERY_CHUNK_BLOCKS - 1)
}

#[async_trait]
impl EventSource for EventWatcher {
    async fn wait_for_event(
        &self,
        chain: &ChainInfo,
        event_signature: &str,
        job_reference: &str,
        timeout: Duration,
    ) -> Result<String, WatcherError> {
        let (_tag, job_seq) = chains::parse_job_reference(job_reference)
            .map_err(|e| WatcherError::MalformedReference(e.to_string()))?;

        let provider = Self::build_provider(chain)?;
        let job_board: alloy::primitives::Address = chain.job_board.parse().map_err(|e| {
            WatcherError::InvalidConfig(format!("Invalid job board address: {}", e))
        })?;

        let topic0 = keccak256(event_signature.as_bytes());
        let job_topic = B256::from(U256::from(job_seq));

        debug!(
            chain = %chain.name,
            event = %event_signature,
            job_reference = %job_reference,
            timeout_secs = timeout.as_secs(),
            "Watching for job event"
        );

        let start = std::time::Instant::now();
        let mut cursor: Option<u64> = None;

        while start.elapsed() < timeout {
            let head = match provider.get_block_number().await {
                Ok(head) => head,
                Err(e) => {
                    warn!(chain = %chain.name, error = %e, "Block height query failed, backing off");
                    tokio::time::sleep(Duration::from_secs(ERROR_BACKOFF_SECS)).await;
                    continue;
                }
            };

            let mut from = cursor.unwrap_or_else(|| head.saturating_sub(START_LOOKBACK_BLOCKS));

            while from <= head {
                let to = chunk_end(from, head);
                let filter = Filter::new()
                    .address(job_board)
                    .event_signature(topic0)
                    .from_block(BlockNumberOrTag::Number(from))
                    .to_block(BlockNumberOrTag::Number(to));

                let logs = match provider.get_logs(&filter).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        warn!(
                            chain = %chain.name,
                            from_block = from,
                            to_block = to,
                            error = %e,
                            "Log query failed, backing off without advancing cursor"
                        );
                        tokio::time::sleep(Duration::from_secs(ERROR_BACKOFF_SECS)).await;
                        break;
                    }
                };

                for log in &logs {
                    let topics = log.topics();
                    let tx_hash = log
                        .transaction_hash
                        .map(|h| format!("{:?}", h))
                        .unwrap_or_default();

                    // Observe every same-named event for diagnosis; only
                    // the job filter decides a match.
                    debug!(
                        chain = %chain.name,
                        event = %event_signature,
                        tx_hash = %tx_hash,
                        topics = topics.len(),
                        "Observed job-board event"
                    );

                    if topics.len() < 2 || topics[1] != job_topic {
                        continue;
                    }
                    if tx_hash.is_empty() {
                        continue;
                    }
                    if !self.mark_seen(&tx_hash) {
                        debug!(tx_hash = %tx_hash, "Skipping already-consumed event");
                        continue;
                    }

                    debug!(
                        job_reference = %job_reference,
                        tx_hash = %tx_hash,
                        block = from,
                        "Matched job event"
                    );
                    return Ok(tx_hash);
                }

                from = to + 1;
                cursor = Some(from);
            }

            tokio::time::sleep(Duration::from_secs(ROUND_INTERVAL_SECS)).await;
        }

        Err(WatcherError::EventTimeout(format!(
            "No {} event for {} within {}s",
            event_signature,
            job_reference,
            timeout.as_secs()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_end_caps_at_head() {
        assert_eq!(chunk_end(100, 120), 120);
    }

    #[test]
    fn test_chunk_end_respects_chunk_width() {
        assert_eq!(chunk_end(100, 1_000_000), 100 + QUERY_CHUNK_BLOCKS - 1);
    }

    #[test]
    fn test_mark_seen_dedupes_within_process_lifetime() {
        let watcher = EventWatcher::new();
        assert!(watcher.mark_seen("0xaaa"));
        assert!(!watcher.mark_seen("0xaaa"));
        assert!(watcher.mark_seen("0xbbb"));
    }

    #[test]
    fn test_job_topic_encoding() {
        let topic = B256::from(U256::from(4u64));
        assert_eq!(topic.0[31], 4);
        assert!(topic.0[..31].iter().all(|b| *b == 0));
    }
}
