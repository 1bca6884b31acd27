//! Registered APIs: owner, name, and unit price.

use std::sync::atomic::{AtomicU64, Ordering};

use alloy::primitives::Address;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::MeterError;

/// Unique identifier of a registered API. Allocated once, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiId(pub u64);

impl std::fmt::Display for ApiId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A priced API registered by a wallet-identified owner.
/// Immutable once created; the registry never deletes entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRegistration {
    pub id: ApiId,
    pub owner: Address,
    pub name: String,
    /// Price per invocation in the smallest currency unit.
    pub price_per_request: u64,
}

/// In-memory API registry. Id allocation is an atomic counter, so concurrent
/// registrations never collide.
pub struct ApiRegistry {
    apis: DashMap<ApiId, ApiRegistration>,
    next_id: AtomicU64,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self {
            apis: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new API. Fails with `ValidationError` on a blank name.
    pub fn register(
        &self,
        owner: Address,
        name: &str,
        price_per_request: u64,
    ) -> Result<ApiRegistration, MeterError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MeterError::ValidationError(
                "api name must not be empty".to_string(),
            ));
        }

        let id = ApiId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registration = ApiRegistration {
            id,
            owner,
            name: name.to_string(),
            price_per_request,
        };
        self.apis.insert(id, registration.clone());
        tracing::info!(
            api_id = %id,
            owner = %owner,
            name = %registration.name,
            price = price_per_request,
            "api registered"
        );
        Ok(registration)
    }

    /// All registered APIs in id order.
    pub fn list_available(&self) -> Vec<ApiRegistration> {
        let mut apis: Vec<_> = self.apis.iter().map(|e| e.value().clone()).collect();
        apis.sort_by_key(|a| a.id);
        apis
    }

    /// APIs registered by `owner`, in id order.
    pub fn list_by_owner(&self, owner: Address) -> Vec<ApiRegistration> {
        let mut apis: Vec<_> = self
            .apis
            .iter()
            .filter(|e| e.value().owner == owner)
            .map(|e| e.value().clone())
            .collect();
        apis.sort_by_key(|a| a.id);
        apis
    }

    /// Resolve a registration by id.
    pub fn resolve(&self, api_id: ApiId) -> Result<ApiRegistration, MeterError> {
        self.apis
            .get(&api_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| MeterError::NotFound(format!("unknown api {api_id}")))
    }
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self::new()
    }
}
