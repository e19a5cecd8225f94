//! Attestation authority polling
//!
//! Given a source transaction hash and the source chain's transfer domain,
//! polls the authority's lookup endpoint until it returns a message whose
//! status is "complete", then hands back the opaque message/signature pair.
//! Non-complete statuses and transient HTTP failures are not errors; they
//! just schedule another attempt. All durable state lives in the caller's
//! ledger, this component keeps none.

use std::time::Duration;

use alloy::primitives::U256;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Fixed poll interval between lookup attempts
const POLL_INTERVAL_SECS: u64 = 10;

/// Widened interval after a transient HTTP failure
const ERROR_BACKOFF_SECS: u64 = 30;

/// Attempt budget; whichever of this and the wall-clock timeout trips
/// first ends the poll
const MAX_ATTEMPTS: u32 = 120;

/// Byte layout of an attested burn message: fixed header, then the burn
/// body with the mint recipient and amount at known offsets
const MESSAGE_HEADER_LEN: usize = 116;
const RECIPIENT_OFFSET: usize = MESSAGE_HEADER_LEN + 36;
const AMOUNT_OFFSET: usize = MESSAGE_HEADER_LEN + 68;

/// A complete attestation as returned by the authority
#[derive(Debug, Clone)]
pub struct Attestation {
    /// Opaque message payload (0x-prefixed hex)
    pub message: String,
    /// Authority signature over the message (0x-prefixed hex)
    pub signature: String,
    /// Best-effort decoded mint recipient, when the message parses
    pub mint_recipient: Option<String>,
    /// Best-effort decoded transfer amount (decimal string)
    pub amount: Option<String>,
}

/// Error types for attestation polling
#[derive(Debug)]
pub enum AttestationError {
    /// Attempt budget or wall-clock timeout exhausted without a complete
    /// attestation
    Timeout(String),
    InvalidConfig(String),
}

impl std::fmt::Display for AttestationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttestationError::Timeout(msg) => write!(f, "Attestation timeout: {}", msg),
            AttestationError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for AttestationError {}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    messages: Vec<LookupMessage>,
}

#[derive(Debug, Deserialize)]
struct LookupMessage {
    #[serde(default)]
    status: String,
    message: Option<String>,
    attestation: Option<String>,
}

/// Seam for the flow controller so tests can substitute a mock
#[async_trait]
pub trait AttestationSource: Send + Sync {
    async fn poll_attestation(
        &self,
        source_tx_hash: &str,
        source_domain: u32,
        timeout: Duration,
    ) -> Result<Attestation, AttestationError>;
}

/// HTTP client for the attestation authority
#[derive(Clone)]
pub struct AttestationService {
    client: Client,
    base_url: String,
}

impl AttestationService {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn lookup_url(&self, source_domain: u32, source_tx_hash: &str) -> String {
        format!(
            "{}/v1/messages/{}/{}",
            self.base_url, source_domain, source_tx_hash
        )
    }
}

fn is_complete(status: &str) -> bool {
    status.eq_ignore_ascii_case("complete")
}

/// Best-effort decode of recipient and amount from an attested burn
/// message. Returns None when the payload does not parse; callers treat
/// the metadata as advisory only.
fn decode_burn_message(message_hex: &str) -> Option<(String, String)> {
    let bytes = hex::decode(message_hex.trim_start_matches("0x")).ok()?;
    if bytes.len() < AMOUNT_OFFSET + 32 {
        return None;
    }

    // Recipient is a 32-byte word with the address right-aligned
    let recipient_word = &bytes[RECIPIENT_OFFSET..RECIPIENT_OFFSET + 32];
    let recipient = format!("0x{}", hex::encode(&recipient_word[12..]));

    let amount_word: [u8; 32] = bytes[AMOUNT_OFFSET..AMOUNT_OFFSET + 32].try_into().ok()?;
    let amount = U256::from_be_bytes(amount_word).to_string();

    Some((recipient, amount))
}

#[async_trait]
impl AttestationSource for AttestationService {
    async fn poll_attestation(
        &self,
        source_tx_hash: &str,
        source_domain: u32,
        timeout: Duration,
    ) -> Result<Attestation, AttestationError> {
        let url = self.lookup_url(source_domain, source_tx_hash);
        let start = std::time::Instant::now();
        let mut attempts = 0u32;

        info!(
            source_tx_hash = %source_tx_hash,
            source_domain = source_domain,
            timeout_secs = timeout.as_secs(),
            "Polling attestation authority"
        );

        while attempts < MAX_ATTEMPTS && start.elapsed() < timeout {
            attempts += 1;

            let response = match self.client.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(
                        attempt = attempts,
                        error = %e,
                        "Attestation lookup failed, widening interval"
                    );
                    tokio::time::sleep(Duration::from_secs(ERROR_BACKOFF_SECS)).await;
                    continue;
                }
            };

            // 404 simply means the authority has not seen the burn yet
            if !response.status().is_success() {
                debug!(
                    attempt = attempts,
                    status = %response.status(),
                    "Attestation not available yet"
                );
                tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
                continue;
            }

            let body: LookupResponse = match response.json().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Malformed attestation response");
                    tokio::time::sleep(Duration::from_secs(ERROR_BACKOFF_SECS)).await;
                    continue;
                }
            };

            for msg in &body.messages {
                if !is_complete(&msg.status) {
                    debug!(
                        attempt = attempts,
                        status = %msg.status,
                        "Attestation still in progress"
                    );
                    continue;
                }
                let (message, signature) = match (&msg.message, &msg.attestation) {
                    (Some(message), Some(signature)) => (message.clone(), signature.clone()),
                    _ => continue,
                };

                let decoded = decode_burn_message(&message);
                info!(
                    source_tx_hash = %source_tx_hash,
                    attempts = attempts,
                    decoded = decoded.is_some(),
                    "Attestation complete"
                );

                let (mint_recipient, amount) = match decoded {
                    Some((recipient, amount)) => (Some(recipient), Some(amount)),
                    None => (None, None),
                };
                return Ok(Attestation {
                    message,
                    signature,
                    mint_recipient,
                    amount,
                });
            }

            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
        }

        Err(AttestationError::Timeout(format!(
            "No complete attestation for {} on domain {} after {} attempts / {}s",
            source_tx_hash,
            source_domain,
            attempts,
            start.elapsed().as_secs()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burn_message(recipient: [u8; 20], amount: u64) -> String {
        let mut bytes = vec![0u8; MESSAGE_HEADER_LEN + 132];
        bytes[RECIPIENT_OFFSET + 12..RECIPIENT_OFFSET + 32].copy_from_slice(&recipient);
        let amount_word = U256::from(amount).to_be_bytes::<32>();
        bytes[AMOUNT_OFFSET..AMOUNT_OFFSET + 32].copy_from_slice(&amount_word);
        format!("0x{}", hex::encode(bytes))
    }

    #[test]
    fn test_decode_burn_message() {
        let recipient = [0x11u8; 20];
        let (decoded_recipient, decoded_amount) =
            decode_burn_message(&burn_message(recipient, 2_500_000)).unwrap();
        assert_eq!(decoded_recipient, format!("0x{}", hex::encode(recipient)));
        assert_eq!(decoded_amount, "2500000");
    }

    #[test]
    fn test_decode_rejects_short_payload() {
        assert!(decode_burn_message("0x0102").is_none());
        assert!(decode_burn_message("not-hex").is_none());
    }

    #[test]
    fn test_status_matching() {
        assert!(is_complete("complete"));
        assert!(is_complete("COMPLETE"));
        assert!(!is_complete("pending_confirmations"));
        assert!(!is_complete(""));
    }

    #[tokio::test]
    async fn test_poll_stops_at_the_wall_clock_bound() {
        // Closed port; the deadline must trip before any lookup lands
        let service = AttestationService::new("http://127.0.0.1:9".to_string());
        let result = service
            .poll_attestation("0xabc", 0, Duration::ZERO)
            .await;
        match result {
            Err(AttestationError::Timeout(msg)) => {
                assert!(msg.contains("0xabc"));
                assert!(msg.contains("domain 0"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_url_shape() {
        let service = AttestationService::new("https://attest.example.com/".to_string());
        assert_eq!(
            service.lookup_url(0, "0xabc"),
            "https://attest.example.com/v1/messages/0/0xabc"
        );
    }
}
