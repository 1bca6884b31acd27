//! EIP-191 personal-message signing, signature recovery, and nonce generation.
//!
//! Provides functions for:
//! - Building the canonical challenge text ([`challenge_text`])
//! - Recovering the signer of a challenge with EIP-2 malleability protection
//!   ([`recover_signer`])
//! - Generating cryptographically secure random nonces ([`random_nonce`])
//! - Encoding signatures to hex ([`encode_signature_hex`])

use alloy::primitives::{eip191_hash_message, Address, FixedBytes, Signature, U256};

use crate::MeterError;

/// Build the canonical challenge text for a wallet and nonce.
///
/// The text is fully deterministic given `(domain, wallet, nonce)` so the
/// verifier can reconstruct it without storing anything beyond the nonce.
pub fn challenge_text(domain: &str, wallet: Address, nonce: FixedBytes<32>) -> String {
    format!(
        "{domain} wants you to verify wallet ownership:\n{wallet}\n\nNonce: {nonce}",
    )
}

/// secp256k1 curve order N / 2 — signatures with s > this are malleable (EIP-2).
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Recover the address that signed `text` as an EIP-191 personal message.
/// Rejects malformed hex, wrong-length signatures, and high-s signatures.
pub fn recover_signer(text: &str, signature_hex: &str) -> Result<Address, MeterError> {
    let stripped = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    let bytes = alloy::hex::decode(stripped)
        .map_err(|e| MeterError::AuthenticationFailed(format!("invalid hex signature: {e}")))?;

    if bytes.len() != 65 {
        return Err(MeterError::AuthenticationFailed(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }

    let sig = Signature::from_raw(&bytes)
        .map_err(|e| MeterError::AuthenticationFailed(format!("invalid signature: {e}")))?;

    // Reject high-s signatures (EIP-2 malleability protection). Without this
    // a flipped-s copy of a consumed signature would not be byte-identical
    // yet still recover the same signer.
    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(MeterError::AuthenticationFailed(
            "high-s signature rejected (EIP-2 malleability)".to_string(),
        ));
    }

    let hash = eip191_hash_message(text.as_bytes());
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| MeterError::AuthenticationFailed(format!("recovery failed: {e}")))
}

/// Generate a random 32-byte nonce (keccak256 of 32 random bytes).
/// Uses `rand::fill` which delegates to the OS CSPRNG (cryptographically secure).
pub fn random_nonce() -> FixedBytes<32> {
    use alloy::primitives::keccak256;
    let mut bytes = [0u8; 32];
    rand::fill(&mut bytes); // CSPRNG via ThreadRng -> OsRng
    keccak256(bytes)
}

/// Encode a Signature to a hex string with 0x prefix (65 bytes -> 0x + 130 hex).
pub fn encode_signature_hex(sig: &Signature) -> String {
    format!("0x{}", alloy::hex::encode(sig.as_bytes()))
}
