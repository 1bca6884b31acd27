//! Wallet-gated API metering and settlement core.
//!
//! Lets a party register a priced API, lets wallet-identified callers invoke
//! it, accrues the balance owed per (api, caller) pair, and reconciles that
//! balance through a two-phase settlement confirmed by an external ledger
//! transaction. Transport framing, UI, and transaction broadcast live
//! outside this crate.
//!
//! # Components
//!
//! - [`ChallengeStore`] — one-time nonce challenges proving wallet control
//! - [`ApiRegistry`] — registered APIs (owner, name, unit price)
//! - [`UsageLedger`] — per-pair usage accrual
//! - [`SettlementCoordinator`] — prepare/confirm/expire settlement lifecycle
//! - [`SessionGate`] — composition root verifying a wallet proof per request
//!
//! # Quick example
//!
//! ```
//! use alloy::signers::{local::PrivateKeySigner, SignerSync};
//! use apimeter::{GateConfig, RegisterApiRequest, SessionGate, WalletProof};
//!
//! let gate = SessionGate::new(GateConfig::default());
//! let signer = PrivateKeySigner::random();
//!
//! // Prove wallet control: sign the issued challenge text.
//! let grant = gate.issue_nonce(signer.address());
//! let sig = signer.sign_message_sync(grant.challenge.as_bytes()).unwrap();
//! let proof = WalletProof {
//!     wallet: signer.address(),
//!     signature: apimeter::signing::encode_signature_hex(&sig),
//! };
//!
//! let api = gate
//!     .register_api(&proof, &RegisterApiRequest {
//!         name: "Weather".into(),
//!         price_per_request: 100,
//!     })
//!     .unwrap();
//! assert_eq!(api.price_per_request, 100);
//! ```

pub mod challenge;
pub mod config;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod registry;
pub mod settlement;
pub mod signing;
pub mod wire;

pub use challenge::{ChallengeStore, NonceChallenge};
pub use config::GateConfig;
pub use error::MeterError;
pub use gate::SessionGate;
pub use ledger::{UsageLedger, UsageRecord};
pub use registry::{ApiId, ApiRegistration, ApiRegistry};
pub use settlement::{
    SettlementCoordinator, SettlementId, SettlementRecord, SettlementStatus,
};
pub use wire::{
    decode_proof, encode_proof, NonceGrant, RegisterApiRequest, SettlementPayload, WalletProof,
};
