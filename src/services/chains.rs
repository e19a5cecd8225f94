//! Chain directory for job reference resolution
//!
//! Job references embed the tag of the chain they originate from
//! (e.g. "40161-4" is job 4 on Ethereum Sepolia). This module maps that tag
//! to a chain identity, its transfer domain at the attestation authority,
//! and the contract addresses the relayer needs on that chain. Pure lookup,
//! no I/O, no mutable state.

/// Which call shape the executor uses to deliver an attestation on a chain.
///
/// Most chains expose the generic message-receiving contract; the native
/// chain routes the same proof through the escrow gateway, which uses a
/// different calldata layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStrategy {
    MessageTransmitter,
    EscrowGateway,
}

/// Static chain metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainInfo {
    /// Tag embedded in job references
    pub tag: u32,
    pub name: &'static str,
    pub chain_id: u64,
    /// Domain identifying this chain to the attestation authority; chains
    /// without one cannot take part in a relay
    pub transfer_domain: Option<u32>,
    /// Environment variable holding this chain's RPC URL
    pub rpc_url_env: &'static str,
    /// Contract the executor submits attestations to on this chain
    pub receive_contract: &'static str,
    /// Job-board escrow contract watched for job events on this chain
    pub job_board: &'static str,
    pub receive_strategy: ReceiveStrategy,
}

/// Tag of the chain hosting the canonical escrow contracts; relays land
/// here unless RELAY_NATIVE_CHAIN_TAG overrides it
pub const DEFAULT_NATIVE_CHAIN_TAG: u32 = 40231;

/// Generic message-receiving contract, deployed at the same address on
/// every supported testnet
const MESSAGE_TRANSMITTER: &str = "0x7865fAfC2db2093669d92c0F33AeEF291086BEFD";

/// Escrow gateway on the native chain (wraps receiveMessage with escrow
/// bookkeeping)
const ESCROW_GATEWAY: &str = "0x9eD0E1b6c815CcCd8e01d1B4E01f54b527Add39B";

static CHAINS: &[ChainInfo] = &[
    ChainInfo {
        tag: 40161,
        name: "Ethereum Sepolia",
        chain_id: 11155111,
        transfer_domain: Some(0),
        rpc_url_env: "SEPOLIA_RPC_URL",
        receive_contract: MESSAGE_TRANSMITTER,
        job_board: "0x3C44cDDdB6a900FA2B585dD299E03D12fa4293bc",
        receive_strategy: ReceiveStrategy::MessageTransmitter,
    },
    ChainInfo {
        tag: 40232,
        name: "OP Sepolia",
        chain_id: 11155420,
        transfer_domain: Some(2),
        rpc_url_env: "OP_SEPOLIA_RPC_URL",
        receive_contract: MESSAGE_TRANSMITTER,
        job_board: "0x90F79bf6EB2c4f870365E785982E1f101E93b906",
        receive_strategy: ReceiveStrategy::MessageTransmitter,
    },
    ChainInfo {
        tag: 40231,
        name: "Arbitrum Sepolia",
        chain_id: 421614,
        transfer_domain: Some(3),
        rpc_url_env: "ARB_SEPOLIA_RPC_URL",
        receive_contract: ESCROW_GATEWAY,
        job_board: "0x15d34AAf54267DB7D7c367839AAf71A00a2C6A65",
        receive_strategy: ReceiveStrategy::EscrowGateway,
    },
    ChainInfo {
        tag: 40245,
        name: "Base Sepolia",
        chain_id: 84532,
        transfer_domain: Some(6),
        rpc_url_env: "BASE_SEPOLIA_RPC_URL",
        receive_contract: MESSAGE_TRANSMITTER,
        job_board: "0x9965507D1a55bcC2695C58ba16FB37d819B0A4dc",
        receive_strategy: ReceiveStrategy::MessageTransmitter,
    },
    // Supported for job browsing but not enrolled with the attestation
    // authority; relays from here must fail at resolution time
    ChainInfo {
        tag: 40217,
        name: "Holesky",
        chain_id: 17000,
        transfer_domain: None,
        rpc_url_env: "HOLESKY_RPC_URL",
        receive_contract: MESSAGE_TRANSMITTER,
        job_board: "0x976EA74026E726554dB657fA54763abd0C3a0aa9",
        receive_strategy: ReceiveStrategy::MessageTransmitter,
    },
];

/// Error types for chain resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainResolutionError {
    MissingTag(String),
    MalformedTag(String),
    UnknownTag(u32),
    NoTransferDomain(&'static str),
}

impl std::fmt::Display for ChainResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainResolutionError::MissingTag(job_ref) => {
                write!(f, "Job reference '{}' has no chain tag", job_ref)
            }
            ChainResolutionError::MalformedTag(job_ref) => {
                write!(f, "Job reference '{}' has a malformed chain tag", job_ref)
            }
            ChainResolutionError::UnknownTag(tag) => {
                write!(f, "Unknown chain tag: {}", tag)
            }
            ChainResolutionError::NoTransferDomain(name) => {
                write!(f, "Chain '{}' has no configured transfer domain", name)
            }
        }
    }
}

impl std::error::Error for ChainResolutionError {}

/// Split a job reference into its chain tag and job sequence number
pub fn parse_job_reference(job_reference: &str) -> Result<(u32, u64), ChainResolutionError> {
    let (tag_part, seq_part) = job_reference
        .split_once('-')
        .ok_or_else(|| ChainResolutionError::MissingTag(job_reference.to_string()))?;

    let tag = tag_part
        .parse::<u32>()
        .map_err(|_| ChainResolutionError::MalformedTag(job_reference.to_string()))?;
    let seq = seq_part
        .parse::<u64>()
        .map_err(|_| ChainResolutionError::MalformedTag(job_reference.to_string()))?;

    Ok((tag, seq))
}

/// Every chain the relayer knows about
pub fn all() -> &'static [ChainInfo] {
    CHAINS
}

/// Look up a chain by its job-reference tag
pub fn by_tag(tag: u32) -> Option<&'static ChainInfo> {
    CHAINS.iter().find(|c| c.tag == tag)
}

/// Look up a chain by its transfer domain (diagnostics)
pub fn by_domain(domain: u32) -> Option<&'static ChainInfo> {
    CHAINS.iter().find(|c| c.transfer_domain == Some(domain))
}

/// Resolve a job reference to its source chain
///
/// Fails when the tag is absent, malformed, unknown, or maps to a chain
/// that has no transfer domain. Callers must not start a relay whose
/// destination cannot be determined, so no silent default exists.
pub fn resolve(job_reference: &str) -> Result<&'static ChainInfo, ChainResolutionError> {
    let (tag, _seq) = parse_job_reference(job_reference)?;
    let chain = by_tag(tag).ok_or(ChainResolutionError::UnknownTag(tag))?;

    if chain.transfer_domain.is_none() {
        return Err(ChainResolutionError::NoTransferDomain(chain.name));
    }

    Ok(chain)
}
