//! Composition root: wallet-proof verification in front of every operation.
//!
//! The gate owns the challenge store, registry, ledger, and settlement
//! coordinator, and re-verifies a fresh `(wallet, signature)` proof on each
//! authenticated call — the stateless alternative to server-side sessions.
//! A transport layer maps its requests onto these methods one-to-one.

use std::sync::Arc;

use alloy::primitives::Address;

use crate::challenge::{ChallengeStore, NonceChallenge};
use crate::config::GateConfig;
use crate::ledger::{UsageLedger, UsageRecord};
use crate::registry::{ApiId, ApiRegistration, ApiRegistry};
use crate::settlement::{SettlementCoordinator, SettlementId, SettlementRecord};
use crate::wire::{NonceGrant, RegisterApiRequest, SettlementPayload, WalletProof};
use crate::MeterError;

/// Process-wide coordinator for the metering core. Create once at startup
/// and share behind an `Arc`; all methods take `&self`.
pub struct SessionGate {
    challenges: ChallengeStore,
    registry: Arc<ApiRegistry>,
    ledger: Arc<UsageLedger>,
    settlements: SettlementCoordinator,
}

impl SessionGate {
    pub fn new(config: GateConfig) -> Self {
        let registry = Arc::new(ApiRegistry::new());
        let ledger = Arc::new(UsageLedger::new(Arc::clone(&registry)));
        let settlements = SettlementCoordinator::new(Arc::clone(&ledger), &config);
        Self {
            challenges: ChallengeStore::new(&config),
            registry,
            ledger,
            settlements,
        }
    }

    /// Issue a nonce challenge for `wallet`, returning the text to sign.
    pub fn issue_nonce(&self, wallet: Address) -> NonceGrant {
        let challenge = self.challenges.issue(wallet);
        let text = self.challenges.challenge_text(&challenge);
        grant(challenge, text)
    }

    /// Verify a wallet proof without performing any further operation.
    pub fn authenticate(&self, proof: &WalletProof) -> Result<(), MeterError> {
        self.challenges.verify(proof.wallet, &proof.signature)
    }

    /// Register a priced API owned by the proven wallet.
    pub fn register_api(
        &self,
        proof: &WalletProof,
        request: &RegisterApiRequest,
    ) -> Result<ApiRegistration, MeterError> {
        self.authenticate(proof)?;
        let price = request.validated_price()?;
        self.registry.register(proof.wallet, &request.name, price)
    }

    /// All registered APIs, visible to any proven caller.
    pub fn list_available_apis(
        &self,
        proof: &WalletProof,
    ) -> Result<Vec<ApiRegistration>, MeterError> {
        self.authenticate(proof)?;
        Ok(self.registry.list_available())
    }

    /// APIs owned by the proven wallet.
    pub fn list_my_apis(&self, proof: &WalletProof) -> Result<Vec<ApiRegistration>, MeterError> {
        self.authenticate(proof)?;
        Ok(self.registry.list_by_owner(proof.wallet))
    }

    /// Record one invocation of `api_id` by the proven caller.
    pub fn log_usage(
        &self,
        proof: &WalletProof,
        api_id: ApiId,
    ) -> Result<UsageRecord, MeterError> {
        self.authenticate(proof)?;
        self.ledger.record_invocation(api_id, proof.wallet)
    }

    /// The proven caller's usage aggregate for `api_id` (zeroed if none).
    pub fn get_usage(&self, proof: &WalletProof, api_id: ApiId) -> Result<UsageRecord, MeterError> {
        self.authenticate(proof)?;
        Ok(self.ledger.get_usage(api_id, proof.wallet))
    }

    /// Snapshot `payer`'s pending balance for `api_id` into a Prepared
    /// settlement, returning the record and the externally-submittable
    /// payload. The proven wallet must be the payer or the API owner.
    pub fn prepare_settlement(
        &self,
        proof: &WalletProof,
        api_id: ApiId,
        payer: Address,
    ) -> Result<(SettlementRecord, SettlementPayload), MeterError> {
        self.authenticate(proof)?;
        let api = self.registry.resolve(api_id)?;
        authorize_party(proof.wallet, payer, api.owner)?;

        let record = self.settlements.prepare(api_id, payer)?;
        let usage = self.ledger.get_usage(api_id, payer);
        let payload = SettlementPayload {
            settlement_id: record.id,
            api_id,
            payer,
            api_owner: api.owner,
            request_count: usage.request_count,
            amount: record.amount,
        };
        Ok((record, payload))
    }

    /// Confirm a Prepared settlement against an external transaction. The
    /// proven wallet must be the settlement's payer or the API owner.
    pub fn confirm_settlement(
        &self,
        proof: &WalletProof,
        settlement_id: SettlementId,
        transaction_ref: &str,
    ) -> Result<SettlementRecord, MeterError> {
        self.authenticate(proof)?;
        let record = self
            .settlements
            .record(settlement_id)
            .ok_or_else(|| MeterError::NotFound(format!("unknown settlement {settlement_id}")))?;
        let api = self.registry.resolve(record.api_id)?;
        authorize_party(proof.wallet, record.caller, api.owner)?;

        self.settlements.confirm(settlement_id, transaction_ref)
    }

    /// Lazily drop expired challenges and expire stale Prepared settlements.
    /// Safe to call from any periodic task; returns (challenges, settlements)
    /// swept.
    pub fn sweep_expired(&self) -> (usize, usize) {
        (
            self.challenges.purge_expired(),
            self.settlements.sweep_expired(),
        )
    }

    pub fn registry(&self) -> &ApiRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn settlements(&self) -> &SettlementCoordinator {
        &self.settlements
    }
}

fn grant(challenge: NonceChallenge, text: String) -> NonceGrant {
    NonceGrant {
        wallet: challenge.wallet,
        nonce: challenge.nonce,
        issued_at: challenge.issued_at,
        expires_at: challenge.expires_at,
        challenge: text,
    }
}

/// A settlement may be driven by the payer or the API owner; any other
/// proven wallet is acting for a pair it cannot speak for.
fn authorize_party(actor: Address, payer: Address, owner: Address) -> Result<(), MeterError> {
    if actor == payer || actor == owner {
        return Ok(());
    }
    tracing::warn!(actor = %actor, payer = %payer, owner = %owner, "settlement attempted by an unrelated wallet");
    Err(MeterError::AuthenticationFailed(
        "wallet is neither the payer nor the api owner".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    fn gate() -> SessionGate {
        SessionGate::new(GateConfig::default())
    }

    fn proof(gate: &SessionGate, signer: &PrivateKeySigner) -> WalletProof {
        let grant = gate.issue_nonce(signer.address());
        let sig = signer.sign_message_sync(grant.challenge.as_bytes()).unwrap();
        WalletProof {
            wallet: signer.address(),
            signature: crate::signing::encode_signature_hex(&sig),
        }
    }

    fn register(gate: &SessionGate, owner: &PrivateKeySigner, price: i64) -> ApiRegistration {
        let request = RegisterApiRequest {
            name: "Weather".to_string(),
            price_per_request: price,
        };
        gate.register_api(&proof(gate, owner), &request).unwrap()
    }

    #[test]
    fn test_unproven_wallet_is_rejected_everywhere() {
        let gate = gate();
        let stranger = WalletProof {
            wallet: Address::new([7; 20]),
            signature: "0x00".to_string(),
        };
        assert!(matches!(
            gate.list_available_apis(&stranger),
            Err(MeterError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            gate.log_usage(&stranger, ApiId(1)),
            Err(MeterError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_register_and_list() {
        let gate = gate();
        let owner = PrivateKeySigner::random();
        let api = register(&gate, &owner, 100);

        let listed = gate.list_available_apis(&proof(&gate, &owner)).unwrap();
        assert_eq!(listed, vec![api.clone()]);
        let mine = gate.list_my_apis(&proof(&gate, &owner)).unwrap();
        assert_eq!(mine, vec![api]);
    }

    #[test]
    fn test_register_negative_price_rejected() {
        let gate = gate();
        let owner = PrivateKeySigner::random();
        let request = RegisterApiRequest {
            name: "Weather".to_string(),
            price_per_request: -100,
        };
        assert!(matches!(
            gate.register_api(&proof(&gate, &owner), &request),
            Err(MeterError::ValidationError(_))
        ));
    }

    #[test]
    fn test_log_usage_requires_known_api() {
        let gate = gate();
        let caller = PrivateKeySigner::random();
        assert!(matches!(
            gate.log_usage(&proof(&gate, &caller), ApiId(42)),
            Err(MeterError::NotFound(_))
        ));
    }

    #[test]
    fn test_payer_settles_own_usage() {
        let gate = gate();
        let owner = PrivateKeySigner::random();
        let payer = PrivateKeySigner::random();
        let api = register(&gate, &owner, 100);

        gate.log_usage(&proof(&gate, &payer), api.id).unwrap();

        let (record, payload) = gate
            .prepare_settlement(&proof(&gate, &payer), api.id, payer.address())
            .unwrap();
        assert_eq!(payload.amount, 100);
        assert_eq!(payload.api_owner, owner.address());
        assert_eq!(payload.request_count, 1);

        let confirmed = gate
            .confirm_settlement(&proof(&gate, &payer), record.id, "0xfeed")
            .unwrap();
        assert_eq!(confirmed.transaction_ref.as_deref(), Some("0xfeed"));
    }

    #[test]
    fn test_owner_may_drive_payer_settlement() {
        let gate = gate();
        let owner = PrivateKeySigner::random();
        let payer = PrivateKeySigner::random();
        let api = register(&gate, &owner, 50);

        gate.log_usage(&proof(&gate, &payer), api.id).unwrap();

        let (record, _payload) = gate
            .prepare_settlement(&proof(&gate, &owner), api.id, payer.address())
            .unwrap();
        assert!(gate
            .confirm_settlement(&proof(&gate, &owner), record.id, "0xbeef")
            .is_ok());
    }

    #[test]
    fn test_unrelated_wallet_cannot_settle() {
        let gate = gate();
        let owner = PrivateKeySigner::random();
        let payer = PrivateKeySigner::random();
        let stranger = PrivateKeySigner::random();
        let api = register(&gate, &owner, 50);

        gate.log_usage(&proof(&gate, &payer), api.id).unwrap();

        assert!(matches!(
            gate.prepare_settlement(&proof(&gate, &stranger), api.id, payer.address()),
            Err(MeterError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_get_usage_zeroed_before_first_call() {
        let gate = gate();
        let owner = PrivateKeySigner::random();
        let caller = PrivateKeySigner::random();
        let api = register(&gate, &owner, 100);

        let usage = gate.get_usage(&proof(&gate, &caller), api.id).unwrap();
        assert_eq!(usage, UsageRecord::default());
    }
}
