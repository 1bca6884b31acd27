//! Per-(api, caller) usage accrual.
//!
//! Every authorized invocation accrues `price_per_request` into the pair's
//! pending and lifetime totals. Mutations happen under the pair's exclusive
//! DashMap entry, so concurrent invocations for the same pair serialize and
//! never lose updates. `pending_amount` only ever decreases through
//! [`UsageLedger::debit_settled`], driven by a confirmed settlement.

use std::sync::Arc;

use alloy::primitives::Address;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::registry::{ApiId, ApiRegistry};
use crate::MeterError;

/// Aggregated usage for one (api, caller) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub request_count: u64,
    /// Amount accrued since the last confirmed settlement.
    pub pending_amount: u64,
    /// Lifetime accrued amount; never decreases.
    pub total_amount: u64,
    /// Bumped on every mutation of this record.
    pub version: u64,
}

/// Key identifying a usage aggregate.
pub type PairKey = (ApiId, Address);

/// In-memory usage ledger.
pub struct UsageLedger {
    registry: Arc<ApiRegistry>,
    usage: DashMap<PairKey, UsageRecord>,
}

impl UsageLedger {
    pub fn new(registry: Arc<ApiRegistry>) -> Self {
        Self {
            registry,
            usage: DashMap::new(),
        }
    }

    /// Record one invocation of `api_id` by `caller`, accruing its price.
    ///
    /// Fails with `NotFound` for an unknown api and `Inconsistent` if a
    /// counter would overflow (the record is left untouched in that case).
    pub fn record_invocation(
        &self,
        api_id: ApiId,
        caller: Address,
    ) -> Result<UsageRecord, MeterError> {
        let api = self.registry.resolve(api_id)?;
        let price = api.price_per_request;

        let mut entry = self.usage.entry((api_id, caller)).or_default();

        // Compute every new counter before writing any of them, so an
        // overflow leaves the record unchanged.
        let request_count = entry
            .request_count
            .checked_add(1)
            .ok_or_else(|| overflow(api_id, caller))?;
        let pending_amount = entry
            .pending_amount
            .checked_add(price)
            .ok_or_else(|| overflow(api_id, caller))?;
        let total_amount = entry
            .total_amount
            .checked_add(price)
            .ok_or_else(|| overflow(api_id, caller))?;

        entry.request_count = request_count;
        entry.pending_amount = pending_amount;
        entry.total_amount = total_amount;
        entry.version += 1;

        tracing::info!(
            api_id = %api_id,
            caller = %caller,
            price,
            pending = entry.pending_amount,
            "invocation recorded"
        );
        Ok(entry.clone())
    }

    /// Current aggregate for a pair; a zeroed record if it never transacted.
    pub fn get_usage(&self, api_id: ApiId, caller: Address) -> UsageRecord {
        self.usage
            .get(&(api_id, caller))
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Debit a confirmed settlement amount from the pair's pending balance.
    ///
    /// Called only by the settlement coordinator. Fails closed with
    /// `Inconsistent` if the pair has no record or the debit would drive
    /// `pending_amount` negative — both signal a broken invariant, never a
    /// condition to paper over.
    pub(crate) fn debit_settled(
        &self,
        api_id: ApiId,
        caller: Address,
        amount: u64,
    ) -> Result<UsageRecord, MeterError> {
        let mut entry = self.usage.get_mut(&(api_id, caller)).ok_or_else(|| {
            MeterError::Inconsistent(format!(
                "settlement debit for pair ({api_id}, {caller}) with no usage record"
            ))
        })?;

        let pending_amount = entry.pending_amount.checked_sub(amount).ok_or_else(|| {
            tracing::error!(
                api_id = %api_id,
                caller = %caller,
                pending = entry.pending_amount,
                amount,
                "settlement debit would drive pending balance negative"
            );
            MeterError::Inconsistent(format!(
                "pending balance {} below settled amount {amount}",
                entry.pending_amount
            ))
        })?;

        entry.pending_amount = pending_amount;
        entry.version += 1;
        Ok(entry.clone())
    }
}

fn overflow(api_id: ApiId, caller: Address) -> MeterError {
    tracing::error!(api_id = %api_id, caller = %caller, "usage counter overflow");
    MeterError::Inconsistent(format!("usage counter overflow for ({api_id}, {caller})"))
}
