//! Two-phase settlement of accrued usage.
//!
//! `prepare` snapshots a pair's pending balance into an immutable record and
//! hands it out for external transaction construction; `confirm` is the
//! single point at which the balance is considered paid and the ledger is
//! debited. At most one non-terminal record may exist per (api, caller)
//! pair, which is what prevents the same balance settling twice. The
//! pending balance is earmarked, not cleared, at prepare time: invocations
//! during the Prepared window keep accruing and survive the confirm debit.

use std::sync::Arc;

use alloy::primitives::{Address, FixedBytes};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::challenge::unix_now;
use crate::config::GateConfig;
use crate::ledger::UsageLedger;
use crate::registry::ApiId;
use crate::signing;
use crate::MeterError;

/// Unique identifier of a settlement record (32 random bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettlementId(pub FixedBytes<32>);

impl std::fmt::Display for SettlementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement lifecycle.
///
/// `Pending` and `Prepared` are non-terminal and block further `prepare`
/// calls for the same pair; `Confirmed`, `Failed`, and `Expired` release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettlementStatus {
    Pending,
    Prepared,
    Confirmed,
    Failed,
    Expired,
}

impl SettlementStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed | Self::Expired)
    }
}

/// A snapshot of a pair's pending balance awaiting external confirmation.
/// Immutable after creation except for status, confirmation time, and the
/// confirming transaction reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub id: SettlementId,
    pub api_id: ApiId,
    pub caller: Address,
    /// Pending balance at snapshot time; always positive.
    pub amount: u64,
    pub status: SettlementStatus,
    pub prepared_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_ref: Option<String>,
}

/// Coordinates settlement records against the usage ledger.
///
/// Per-pair mutual exclusion comes from the active-index DashMap entry;
/// per-record mutual exclusion from the record map's exclusive references.
pub struct SettlementCoordinator {
    ledger: Arc<UsageLedger>,
    records: DashMap<SettlementId, SettlementRecord>,
    /// Non-terminal settlement per pair. Entries may briefly go stale after
    /// a record turns terminal; every reader revalidates against the record.
    active: DashMap<(ApiId, Address), SettlementId>,
    window_secs: u64,
}

impl SettlementCoordinator {
    pub fn new(ledger: Arc<UsageLedger>, config: &GateConfig) -> Self {
        Self {
            ledger,
            records: DashMap::new(),
            active: DashMap::new(),
            window_secs: config.settlement_window_secs,
        }
    }

    /// Snapshot the pair's pending balance into a new Prepared settlement.
    ///
    /// Fails with `Conflict` while a non-terminal settlement exists for the
    /// pair (a stale Prepared one is lazily expired first) and with
    /// `NothingToSettle` when nothing has accrued. The ledger's pending
    /// balance is left untouched.
    pub fn prepare(
        &self,
        api_id: ApiId,
        caller: Address,
    ) -> Result<SettlementRecord, MeterError> {
        let now = unix_now();
        // The active entry is held across the whole decision, so concurrent
        // prepares for one pair serialize and only one can win.
        match self.active.entry((api_id, caller)) {
            Entry::Occupied(mut occupied) => {
                let existing = *occupied.get();
                if self.pair_blocked(existing, now) {
                    return Err(MeterError::Conflict(format!(
                        "settlement {existing} is still open for this pair"
                    )));
                }
                let record = self.open_settlement(api_id, caller, now)?;
                occupied.insert(record.id);
                Ok(record)
            }
            Entry::Vacant(vacant) => {
                let record = self.open_settlement(api_id, caller, now)?;
                vacant.insert(record.id);
                Ok(record)
            }
        }
    }

    /// Whether the indexed settlement still blocks its pair, expiring a
    /// stale Prepared record on the way.
    fn pair_blocked(&self, existing: SettlementId, now: u64) -> bool {
        match self.records.get_mut(&existing) {
            Some(mut rec) => {
                if rec.status == SettlementStatus::Prepared && self.stale(&rec, now) {
                    rec.status = SettlementStatus::Expired;
                    tracing::info!(settlement = %existing, "stale prepared settlement expired");
                    return false;
                }
                !rec.status.is_terminal()
            }
            None => {
                tracing::error!(
                    settlement = %existing,
                    "active index points at a missing settlement record"
                );
                false
            }
        }
    }

    fn stale(&self, record: &SettlementRecord, now: u64) -> bool {
        now >= record.prepared_at.saturating_add(self.window_secs)
    }

    /// Create and store a Prepared record for the pair's current balance.
    /// Creates nothing when the balance is zero.
    fn open_settlement(
        &self,
        api_id: ApiId,
        caller: Address,
        now: u64,
    ) -> Result<SettlementRecord, MeterError> {
        let pending = self.ledger.get_usage(api_id, caller).pending_amount;
        if pending == 0 {
            return Err(MeterError::NothingToSettle);
        }

        // Records begin Pending and are promoted once the snapshot is fixed.
        let mut record = SettlementRecord {
            id: SettlementId(signing::random_nonce()),
            api_id,
            caller,
            amount: pending,
            status: SettlementStatus::Pending,
            prepared_at: now,
            confirmed_at: None,
            transaction_ref: None,
        };
        record.status = SettlementStatus::Prepared;
        self.records.insert(record.id, record.clone());

        tracing::info!(
            settlement = %record.id,
            api_id = %api_id,
            caller = %caller,
            amount = pending,
            "settlement prepared"
        );
        Ok(record)
    }

    /// Confirm a Prepared settlement against an external transaction,
    /// debiting the pair's pending balance by the snapshot amount.
    ///
    /// Idempotent: re-confirming a Confirmed record with the same reference
    /// returns it unchanged; a different reference is a `Conflict`. A debit
    /// that would underflow fails closed with `Inconsistent` and leaves the
    /// record Prepared.
    pub fn confirm(
        &self,
        id: SettlementId,
        transaction_ref: &str,
    ) -> Result<SettlementRecord, MeterError> {
        validate_transaction_ref(transaction_ref)?;
        let now = unix_now();

        let (out, pair) = {
            let mut rec = self
                .records
                .get_mut(&id)
                .ok_or_else(|| MeterError::NotFound(format!("unknown settlement {id}")))?;

            match rec.status {
                SettlementStatus::Confirmed => {
                    return if rec.transaction_ref.as_deref() == Some(transaction_ref) {
                        Ok(rec.clone())
                    } else {
                        Err(MeterError::Conflict(
                            "settlement already confirmed with a different transaction"
                                .to_string(),
                        ))
                    };
                }
                SettlementStatus::Prepared => {}
                other => {
                    return Err(MeterError::InvalidState(format!(
                        "settlement is {other:?}, expected Prepared"
                    )))
                }
            }

            if self.stale(&rec, now) {
                rec.status = SettlementStatus::Expired;
                let pair = (rec.api_id, rec.caller);
                drop(rec);
                self.release_pair(pair, id);
                tracing::warn!(settlement = %id, "confirmation arrived after the window");
                return Err(MeterError::InvalidState(
                    "settlement expired before confirmation".to_string(),
                ));
            }

            // Debit before flipping status: on an inconsistent ledger the
            // record stays Prepared and the failure surfaces to the operator.
            self.ledger.debit_settled(rec.api_id, rec.caller, rec.amount)?;

            rec.status = SettlementStatus::Confirmed;
            rec.confirmed_at = Some(now);
            rec.transaction_ref = Some(transaction_ref.to_string());
            (rec.clone(), (rec.api_id, rec.caller))
        };

        self.release_pair(pair, id);
        tracing::info!(
            settlement = %id,
            amount = out.amount,
            tx = %transaction_ref,
            "settlement confirmed"
        );
        Ok(out)
    }

    /// Mark a non-terminal settlement as Failed, releasing its pair.
    pub fn fail(&self, id: SettlementId, reason: &str) -> Result<SettlementRecord, MeterError> {
        let (out, pair) = {
            let mut rec = self
                .records
                .get_mut(&id)
                .ok_or_else(|| MeterError::NotFound(format!("unknown settlement {id}")))?;
            if rec.status.is_terminal() {
                return Err(MeterError::InvalidState(format!(
                    "settlement is already {:?}",
                    rec.status
                )));
            }
            rec.status = SettlementStatus::Failed;
            tracing::warn!(settlement = %id, reason, "settlement failed");
            (rec.clone(), (rec.api_id, rec.caller))
        };
        self.release_pair(pair, id);
        Ok(out)
    }

    /// Expire a Prepared settlement past its confirmation window, releasing
    /// the pair without touching the ledger.
    pub fn expire(&self, id: SettlementId) -> Result<SettlementRecord, MeterError> {
        let now = unix_now();
        let (out, pair) = {
            let mut rec = self
                .records
                .get_mut(&id)
                .ok_or_else(|| MeterError::NotFound(format!("unknown settlement {id}")))?;
            if rec.status != SettlementStatus::Prepared {
                return Err(MeterError::InvalidState(format!(
                    "settlement is {:?}, expected Prepared",
                    rec.status
                )));
            }
            if !self.stale(&rec, now) {
                return Err(MeterError::InvalidState(
                    "settlement is still inside its confirmation window".to_string(),
                ));
            }
            rec.status = SettlementStatus::Expired;
            tracing::info!(settlement = %id, "settlement expired");
            (rec.clone(), (rec.api_id, rec.caller))
        };
        self.release_pair(pair, id);
        Ok(out)
    }

    /// Expire every stale Prepared settlement. Returns the number expired.
    pub fn sweep_expired(&self) -> usize {
        let now = unix_now();
        let stale: Vec<SettlementId> = self
            .records
            .iter()
            .filter(|e| e.status == SettlementStatus::Prepared && self.stale(e.value(), now))
            .map(|e| e.id)
            .collect();

        // Re-checked under the exclusive reference inside expire(); a record
        // confirmed between the scan and here is simply skipped.
        stale.into_iter().filter(|id| self.expire(*id).is_ok()).count()
    }

    /// Look up a settlement record by id.
    pub fn record(&self, id: SettlementId) -> Option<SettlementRecord> {
        self.records.get(&id).map(|e| e.value().clone())
    }

    /// The pair's open (non-terminal, unexpired) settlement, if any.
    pub fn active_for(&self, api_id: ApiId, caller: Address) -> Option<SettlementRecord> {
        let id = *self.active.get(&(api_id, caller))?;
        let rec = self.records.get(&id)?.clone();
        let now = unix_now();
        match rec.status {
            SettlementStatus::Prepared if self.stale(&rec, now) => None,
            status if !status.is_terminal() => Some(rec),
            _ => None,
        }
    }

    /// Drop the pair's active-index entry if it still points at `id`.
    fn release_pair(&self, pair: (ApiId, Address), id: SettlementId) {
        self.active.remove_if(&pair, |_, v| *v == id);
    }
}

/// Shape check for an external transaction reference: 0x-prefixed hex.
pub fn validate_transaction_ref(transaction_ref: &str) -> Result<(), MeterError> {
    let hex = transaction_ref
        .strip_prefix("0x")
        .ok_or_else(|| MeterError::ValidationError(
            "transaction reference must be 0x-prefixed hex".to_string(),
        ))?;
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MeterError::ValidationError(
            "transaction reference must be 0x-prefixed hex".to_string(),
        ));
    }
    Ok(())
}
