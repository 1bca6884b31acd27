//! Strongly-typed request/response contracts for transport embedders.
//!
//! The gate itself takes and returns these shapes; how they travel (headers
//! vs body, routes, framing) is the transport layer's concern. Proofs can be
//! carried opaquely as base64-encoded JSON via [`encode_proof`] /
//! [`decode_proof`].

use alloy::primitives::{Address, FixedBytes};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::registry::ApiId;
use crate::settlement::SettlementId;
use crate::MeterError;

/// A caller's claim of wallet control: the wallet address and a signature
/// over the wallet's outstanding challenge text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletProof {
    pub wallet: Address,
    pub signature: String,
}

/// Base64-encode a wallet proof for an opaque transport header.
pub fn encode_proof(proof: &WalletProof) -> Result<String, MeterError> {
    let json = serde_json::to_vec(proof)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(&json))
}

/// Decode a wallet proof produced by [`encode_proof`].
pub fn decode_proof(encoded: &str) -> Result<WalletProof, MeterError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| MeterError::ValidationError(format!("invalid proof encoding: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Response to an issue-nonce request: the challenge plus the exact text the
/// wallet must sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceGrant {
    pub wallet: Address,
    pub nonce: FixedBytes<32>,
    pub issued_at: u64,
    pub expires_at: u64,
    pub challenge: String,
}

/// Register-api request body. Price arrives signed so that a negative value
/// is rejected here instead of wrapping at the type boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterApiRequest {
    pub name: String,
    pub price_per_request: i64,
}

impl RegisterApiRequest {
    /// Validate the price shape, returning it in the smallest currency unit.
    pub fn validated_price(&self) -> Result<u64, MeterError> {
        u64::try_from(self.price_per_request).map_err(|_| {
            MeterError::ValidationError(format!(
                "price per request must be non-negative, got {}",
                self.price_per_request
            ))
        })
    }
}

/// Everything the external submitter needs to build the settlement
/// transaction, returned by prepare-settlement alongside the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementPayload {
    pub settlement_id: SettlementId,
    pub api_id: ApiId,
    pub payer: Address,
    pub api_owner: Address,
    /// The pair's request count at snapshot time.
    pub request_count: u64,
    pub amount: u64,
}
