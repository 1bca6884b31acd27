//! End-to-end flow through the session gate: wallet proof, registration,
//! metered usage, and two-phase settlement.

use std::sync::Arc;
use std::thread;

use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;

use apimeter::{
    signing, ApiRegistry, GateConfig, MeterError, RegisterApiRequest, SessionGate,
    SettlementStatus, UsageLedger, WalletProof,
};

fn proof(gate: &SessionGate, signer: &PrivateKeySigner) -> WalletProof {
    let grant = gate.issue_nonce(signer.address());
    let sig = signer.sign_message_sync(grant.challenge.as_bytes()).unwrap();
    WalletProof {
        wallet: signer.address(),
        signature: signing::encode_signature_hex(&sig),
    }
}

#[test]
fn test_full_metering_and_settlement_scenario() {
    let gate = SessionGate::new(GateConfig::default());
    let owner = PrivateKeySigner::random();
    let caller = PrivateKeySigner::random();

    // Register "Weather" at price 100
    let api = gate
        .register_api(
            &proof(&gate, &owner),
            &RegisterApiRequest {
                name: "Weather".to_string(),
                price_per_request: 100,
            },
        )
        .unwrap();

    // Caller invokes twice
    gate.log_usage(&proof(&gate, &caller), api.id).unwrap();
    gate.log_usage(&proof(&gate, &caller), api.id).unwrap();

    let usage = gate.get_usage(&proof(&gate, &caller), api.id).unwrap();
    assert_eq!(usage.request_count, 2);
    assert_eq!(usage.pending_amount, 200);
    assert_eq!(usage.total_amount, 200);

    // Prepare snapshots the balance without clearing it
    let (record, payload) = gate
        .prepare_settlement(&proof(&gate, &caller), api.id, caller.address())
        .unwrap();
    assert_eq!(record.amount, 200);
    assert_eq!(record.status, SettlementStatus::Prepared);
    assert_eq!(payload.amount, 200);
    assert_eq!(payload.request_count, 2);
    assert_eq!(payload.api_owner, owner.address());

    // A second prepare before confirmation conflicts
    assert!(matches!(
        gate.prepare_settlement(&proof(&gate, &caller), api.id, caller.address()),
        Err(MeterError::Conflict(_))
    ));

    // Confirmation pays down the pending balance, lifetime total stays
    let confirmed = gate
        .confirm_settlement(&proof(&gate, &caller), record.id, "0xabc123")
        .unwrap();
    assert_eq!(confirmed.status, SettlementStatus::Confirmed);

    let usage = gate.get_usage(&proof(&gate, &caller), api.id).unwrap();
    assert_eq!(usage.pending_amount, 0);
    assert_eq!(usage.total_amount, 200);

    // Re-confirming with the same transaction is a no-op success
    let again = gate
        .confirm_settlement(&proof(&gate, &caller), record.id, "0xabc123")
        .unwrap();
    assert_eq!(again, confirmed);
    let usage = gate.get_usage(&proof(&gate, &caller), api.id).unwrap();
    assert_eq!(usage.pending_amount, 0);
}

#[test]
fn test_prepare_with_no_usage_is_nothing_to_settle() {
    let gate = SessionGate::new(GateConfig::default());
    let owner = PrivateKeySigner::random();
    let caller = PrivateKeySigner::random();

    let api = gate
        .register_api(
            &proof(&gate, &owner),
            &RegisterApiRequest {
                name: "Weather".to_string(),
                price_per_request: 100,
            },
        )
        .unwrap();

    assert!(matches!(
        gate.prepare_settlement(&proof(&gate, &caller), api.id, caller.address()),
        Err(MeterError::NothingToSettle)
    ));
    assert!(gate.settlements().active_for(api.id, caller.address()).is_none());
}

#[test]
fn test_stale_proof_never_authenticates() {
    let gate = SessionGate::new(GateConfig::default().with_nonce_ttl(0));
    let caller = PrivateKeySigner::random();

    // The challenge expires immediately; even a correct signature is dead
    let p = proof(&gate, &caller);
    assert!(matches!(
        gate.list_available_apis(&p),
        Err(MeterError::AuthenticationFailed(_))
    ));
}

#[test]
fn test_interleaved_invocations_accrue_exactly() {
    let registry = Arc::new(ApiRegistry::new());
    let api = registry
        .register(alloy::primitives::Address::new([1; 20]), "bulk", 7)
        .unwrap();
    let ledger = Arc::new(UsageLedger::new(registry));
    let caller = alloy::primitives::Address::new([2; 20]);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let ledger = Arc::clone(&ledger);
        handles.push(thread::spawn(move || {
            for _ in 0..500 {
                ledger.record_invocation(api.id, caller).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let usage = ledger.get_usage(api.id, caller);
    assert_eq!(usage.request_count, 2000);
    assert_eq!(usage.total_amount, 2000 * 7);
    assert_eq!(usage.pending_amount, 2000 * 7);
}

#[test]
fn test_concurrent_prepare_has_exactly_one_winner() {
    let gate = Arc::new(SessionGate::new(GateConfig::default()));
    let owner = PrivateKeySigner::random();
    let caller = PrivateKeySigner::random();

    let api = gate
        .register_api(
            &proof(&gate, &owner),
            &RegisterApiRequest {
                name: "contended".to_string(),
                price_per_request: 10,
            },
        )
        .unwrap();
    gate.log_usage(&proof(&gate, &caller), api.id).unwrap();

    let payer = caller.address();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let gate = Arc::clone(&gate);
        handles.push(thread::spawn(move || {
            gate.settlements().prepare(api.id, payer).is_ok()
        }));
    }
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(wins, 1);
}
