/// Default lifetime of an issued nonce challenge, in seconds.
pub const NONCE_TTL_SECS: u64 = 300;

/// Default window a Prepared settlement may await external confirmation.
pub const SETTLEMENT_WINDOW_SECS: u64 = 86_400;

/// Domain tag embedded in the canonical challenge text.
pub const CHALLENGE_DOMAIN: &str = "apimeter";

/// Runtime gate configuration. Decouples the components from compile-time
/// constants so embedders can tighten or relax the expiry discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// Seconds before an unconsumed nonce challenge expires.
    pub nonce_ttl_secs: u64,
    /// Seconds a Prepared settlement may wait for confirmation before it is
    /// considered stale and eligible for expiry.
    pub settlement_window_secs: u64,
    /// Domain tag bound into every challenge text.
    pub challenge_domain: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            nonce_ttl_secs: NONCE_TTL_SECS,
            settlement_window_secs: SETTLEMENT_WINDOW_SECS,
            challenge_domain: CHALLENGE_DOMAIN.to_string(),
        }
    }
}

impl GateConfig {
    pub fn with_nonce_ttl(mut self, secs: u64) -> Self {
        self.nonce_ttl_secs = secs;
        self
    }

    pub fn with_settlement_window(mut self, secs: u64) -> Self {
        self.settlement_window_secs = secs;
        self
    }

    pub fn with_challenge_domain(mut self, domain: impl Into<String>) -> Self {
        self.challenge_domain = domain.into();
        self
    }
}
