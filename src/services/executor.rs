//! Destination-chain transaction executor
//!
//! Submits a complete attestation to the receiving contract of the
//! destination chain, using the call shape that chain's directory entry
//! prescribes. The relay runs a single shared funding signer, so
//! submissions targeting the same chain serialize their nonce acquisition
//! behind a per-chain lock (each chain tracks its own account-nonce
//! sequence independently).
//!
//! Idempotency rule: a rejection stating the proof's nonce was already
//! used is not a failure. It means the bridge network or a previous
//! attempt already completed the transfer, and the outcome reports
//! `already_completed` with no transaction hash.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::{
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes, U256},
    providers::{Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    sol,
    sol_types::SolCall,
};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::services::attestation::Attestation;
use crate::services::chains::{self, ChainInfo, ReceiveStrategy};

/// Fallback gas limit when estimation itself fails
const DEFAULT_GAS_LIMIT: u64 = 300_000;

/// Revert reason the receiving contract emits for a consumed nonce. Only
/// this exact phrase signals an already-completed transfer; other reasons
/// with similar wording are real failures.
const NONCE_ALREADY_USED: &str = "nonce already used";

sol! {
    interface IMessageTransmitter {
        function receiveMessage(bytes calldata message, bytes calldata attestation) external returns (bool);
    }

    interface IEscrowGateway {
        function relayReceive(bytes calldata attestation, bytes calldata message) external;
    }
}

/// Result of a submission attempt
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// Destination-chain transaction hash; None when the transfer was
    /// already completed by another actor
    pub tx_hash: Option<String>,
    pub already_completed: bool,
}

impl SubmitOutcome {
    pub fn submitted(tx_hash: String) -> Self {
        Self {
            tx_hash: Some(tx_hash),
            already_completed: false,
        }
    }

    pub fn already_completed() -> Self {
        Self {
            tx_hash: None,
            already_completed: true,
        }
    }
}

/// Error types for receive execution
#[derive(Debug)]
pub enum ExecutorError {
    /// The funding account cannot cover the estimated fee; recoverable
    /// only after external funding
    InsufficientBalance {
        chain: &'static str,
        needed: U256,
        available: U256,
    },
    /// Real on-chain rejection with the underlying reason preserved
    TransactionRejected(String),
    ProviderError(String),
    InvalidAttestation(String),
    InvalidConfig(String),
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorError::InsufficientBalance {
                chain,
                needed,
                available,
            } => write!(
                f,
                "Insufficient balance on {}: need {} wei, have {} wei",
                chain, needed, available
            ),
            ExecutorError::TransactionRejected(msg) => {
                write!(f, "Transaction rejected: {}", msg)
            }
            ExecutorError::ProviderError(msg) => write!(f, "Provider error: {}", msg),
            ExecutorError::InvalidAttestation(msg) => write!(f, "Invalid attestation: {}", msg),
            ExecutorError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// Seam for the flow controller so tests can substitute a mock
#[async_trait]
pub trait ReceiveSubmitter: Send + Sync {
    async fn submit(
        &self,
        destination: &ChainInfo,
        attestation: &Attestation,
    ) -> Result<SubmitOutcome, ExecutorError>;
}

/// True only for the canonical consumed-nonce revert
fn is_nonce_already_used(reason: &str) -> bool {
    reason.to_lowercase().contains(NONCE_ALREADY_USED)
}

/// Estimated gas plus a 20% safety margin
fn with_safety_margin(gas: u64) -> u64 {
    gas * 120 / 100
}

/// Worst-case fee for a submission
fn fee_budget(gas_limit: u64, gas_price: u128) -> U256 {
    U256::from(gas_limit) * U256::from(gas_price)
}

fn decode_payload(label: &str, payload_hex: &str) -> Result<Bytes, ExecutorError> {
    hex::decode(payload_hex.trim_start_matches("0x"))
        .map(Bytes::from)
        .map_err(|e| ExecutorError::InvalidAttestation(format!("{} is not hex: {}", label, e)))
}

/// Build the receive calldata in the shape the destination chain expects
fn encode_receive_calldata(
    strategy: ReceiveStrategy,
    message: Bytes,
    attestation: Bytes,
) -> Vec<u8> {
    match strategy {
        ReceiveStrategy::MessageTransmitter => IMessageTransmitter::receiveMessageCall {
            message,
            attestation,
        }
        .abi_encode(),
        ReceiveStrategy::EscrowGateway => IEscrowGateway::relayReceiveCall {
            attestation,
            message,
        }
        .abi_encode(),
    }
}

/// Alloy-backed executor around the shared funding signer
pub struct ReceiveExecutor {
    wallet: EthereumWallet,
    signer_address: Address,
    /// One submission lock per destination chain
    chain_locks: HashMap<u32, Arc<Mutex<()>>>,
}

impl ReceiveExecutor {
    pub fn new(private_key: &str) -> Result<Self, ExecutorError> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| ExecutorError::InvalidConfig(format!("Invalid private key: {}", e)))?;
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let chain_locks = chains::all()
            .iter()
            .map(|c| (c.tag, Arc::new(Mutex::new(()))))
            .collect();

        info!(signer = %signer_address, "ReceiveExecutor initialized");

        Ok(Self {
            wallet,
            signer_address,
            chain_locks,
        })
    }
}

#[async_trait]
impl ReceiveSubmitter for ReceiveExecutor {
    async fn submit(
        &self,
        destination: &ChainInfo,
        attestation: &Attestation,
    ) -> Result<SubmitOutcome, ExecutorError> {
        let message = decode_payload("message", &attestation.message)?;
        let signature = decode_payload("signature", &attestation.signature)?;

        let receive_contract: Address = destination.receive_contract.parse().map_err(|e| {
            ExecutorError::InvalidConfig(format!(
                "Invalid receive contract for {}: {}",
                destination.name, e
            ))
        })?;

        let rpc_url = std::env::var(destination.rpc_url_env).map_err(|_| {
            ExecutorError::InvalidConfig(format!("{} not configured", destination.rpc_url_env))
        })?;
        let url = rpc_url
            .parse()
            .map_err(|e| ExecutorError::InvalidConfig(format!("Invalid RPC URL: {}", e)))?;

        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet.clone())
            .on_http(url);

        let calldata =
            encode_receive_calldata(destination.receive_strategy, message, signature);
        let tx = TransactionRequest::default()
            .with_from(self.signer_address)
            .with_to(receive_contract)
            .with_input(calldata);

        // Gas estimation with a safety margin; the consumed-nonce revert
        // already shows up here when another actor finished the transfer.
        let gas_limit = match provider.estimate_gas(&tx).await {
            Ok(gas) => with_safety_margin(gas),
            Err(e) => {
                let reason = e.to_string();
                if is_nonce_already_used(&reason) {
                    info!(
                        chain = %destination.name,
                        "Receive already completed by the bridge (estimation revert)"
                    );
                    return Ok(SubmitOutcome::already_completed());
                }
                warn!(
                    chain = %destination.name,
                    error = %reason,
                    fallback = DEFAULT_GAS_LIMIT,
                    "Gas estimation failed, using fallback"
                );
                DEFAULT_GAS_LIMIT
            }
        };

        let gas_price = provider
            .get_gas_price()
            .await
            .map_err(|e| ExecutorError::ProviderError(format!("Gas price query failed: {}", e)))?;

        let needed = fee_budget(gas_limit, gas_price);
        let available = provider
            .get_balance(self.signer_address)
            .await
            .map_err(|e| ExecutorError::ProviderError(format!("Balance query failed: {}", e)))?;

        if available < needed {
            error!(
                chain = %destination.name,
                signer = %self.signer_address,
                needed = %needed,
                available = %available,
                "Funding account cannot cover gas, refusing to submit"
            );
            return Err(ExecutorError::InsufficientBalance {
                chain: destination.name,
                needed,
                available,
            });
        }

        let tx = tx.with_gas_limit(gas_limit);

        // Serialize nonce acquisition per destination chain; the lock is
        // held until the receipt resolves because a submitted transaction
        // cannot be abandoned.
        let lock = self
            .chain_locks
            .get(&destination.tag)
            .cloned()
            .unwrap_or_default();
        let _guard = lock.lock().await;

        debug!(
            chain = %destination.name,
            contract = %receive_contract,
            gas_limit = gas_limit,
            "Submitting receive transaction"
        );

        let pending_tx = match provider.send_transaction(tx).await {
            Ok(pending) => pending,
            Err(e) => {
                let reason = e.to_string();
                if is_nonce_already_used(&reason) {
                    info!(
                        chain = %destination.name,
                        "Receive already completed by the bridge (send revert)"
                    );
                    return Ok(SubmitOutcome::already_completed());
                }
                return Err(ExecutorError::TransactionRejected(reason));
            }
        };

        let tx_hash = format!("{:?}", pending_tx.tx_hash());
        info!(chain = %destination.name, tx_hash = %tx_hash, "Receive submitted, awaiting receipt");

        let receipt = pending_tx
            .get_receipt()
            .await
            .map_err(|e| ExecutorError::ProviderError(format!("Receipt failed: {}", e)))?;

        if !receipt.status() {
            return Err(ExecutorError::TransactionRejected(format!(
                "Receive transaction {} reverted",
                tx_hash
            )));
        }

        info!(chain = %destination.name, tx_hash = %tx_hash, "Receive confirmed");
        Ok(SubmitOutcome::submitted(tx_hash))
    }
}
