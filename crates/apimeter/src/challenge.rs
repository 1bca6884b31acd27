//! One-time nonce challenges proving wallet control.
//!
//! A caller requests a challenge, signs its canonical text with the wallet
//! key, and presents the signature with every subsequent operation. A
//! challenge is consumable at most once and only before its expiry; a retry
//! with the byte-identical signature that consumed it is an idempotent
//! success so clients can safely resubmit.

use alloy::primitives::{Address, FixedBytes};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::GateConfig;
use crate::signing;
use crate::MeterError;

/// Helper to get the current unix timestamp safely.
/// On clock error, returns u64::MAX so expiry checks fail closed: every
/// outstanding challenge reads as expired and verification is refused.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_else(|_| {
            tracing::error!("system clock before UNIX epoch — refusing all challenges");
            u64::MAX
        })
}

/// An issued nonce challenge bound to a single wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceChallenge {
    pub wallet: Address,
    pub nonce: FixedBytes<32>,
    pub issued_at: u64,
    pub expires_at: u64,
    pub consumed: bool,
    /// Normalized hex of the signature that consumed this challenge.
    /// Present only after consumption; drives idempotent retry matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    consumed_sig: Option<String>,
}

/// In-memory challenge store backed by DashMap.
///
/// One challenge per wallet: issuing a new one supersedes the previous, so
/// only the most recently issued unconsumed, unexpired challenge ever
/// verifies. Memory stays bounded by the number of distinct wallets.
pub struct ChallengeStore {
    challenges: DashMap<Address, NonceChallenge>,
    ttl_secs: u64,
    domain: String,
}

impl ChallengeStore {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            challenges: DashMap::new(),
            ttl_secs: config.nonce_ttl_secs,
            domain: config.challenge_domain.clone(),
        }
    }

    /// Issue a fresh challenge for `wallet`, superseding any previous one.
    pub fn issue(&self, wallet: Address) -> NonceChallenge {
        let now = unix_now();
        let challenge = NonceChallenge {
            wallet,
            nonce: signing::random_nonce(),
            issued_at: now,
            expires_at: now.saturating_add(self.ttl_secs),
            consumed: false,
            consumed_sig: None,
        };
        self.challenges.insert(wallet, challenge.clone());
        tracing::info!(wallet = %wallet, expires_at = challenge.expires_at, "nonce challenge issued");
        challenge
    }

    /// The canonical text a wallet must sign for the given challenge.
    pub fn challenge_text(&self, challenge: &NonceChallenge) -> String {
        signing::challenge_text(&self.domain, challenge.wallet, challenge.nonce)
    }

    /// Verify a signature over the wallet's outstanding challenge, consuming
    /// it on first success.
    ///
    /// Failure modes (all `AuthenticationFailed`, none mutate state):
    /// no outstanding challenge, expired challenge, signer mismatch, or a
    /// consumed challenge presented with any signature other than the one
    /// that consumed it.
    pub fn verify(&self, wallet: Address, signature_hex: &str) -> Result<(), MeterError> {
        let mut entry = self.challenges.get_mut(&wallet).ok_or_else(|| {
            MeterError::AuthenticationFailed(format!("no outstanding challenge for {wallet}"))
        })?;

        let now = unix_now();
        if now >= entry.expires_at {
            tracing::warn!(wallet = %wallet, "expired challenge presented");
            return Err(MeterError::AuthenticationFailed(
                "challenge expired".to_string(),
            ));
        }

        let normalized = normalize_sig(signature_hex);

        if entry.consumed {
            // Idempotent retry: the exact signature that consumed this
            // challenge stays acceptable until the challenge itself expires.
            if entry.consumed_sig.as_deref() == Some(normalized.as_str()) {
                return Ok(());
            }
            tracing::warn!(wallet = %wallet, "consumed challenge replayed with a different signature");
            return Err(MeterError::AuthenticationFailed(
                "challenge already consumed".to_string(),
            ));
        }

        let text = signing::challenge_text(&self.domain, wallet, entry.nonce);
        let recovered = signing::recover_signer(&text, signature_hex)?;
        if recovered != wallet {
            tracing::warn!(wallet = %wallet, recovered = %recovered, "challenge signer mismatch");
            return Err(MeterError::AuthenticationFailed(
                "signature does not match wallet".to_string(),
            ));
        }

        entry.consumed = true;
        entry.consumed_sig = Some(normalized);
        tracing::info!(wallet = %wallet, "wallet proof verified");
        Ok(())
    }

    /// Purge expired challenges. Returns the number purged.
    pub fn purge_expired(&self) -> usize {
        let now = unix_now();
        let before = self.challenges.len();
        self.challenges.retain(|_, c| now < c.expires_at);
        before - self.challenges.len()
    }
}

/// Lowercase and 0x-prefix a hex signature so retry matching is not
/// sensitive to cosmetic differences.
fn normalize_sig(signature_hex: &str) -> String {
    let stripped = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    format!("0x{}", stripped.to_ascii_lowercase())
}
