//! Lifecycle counters
//!
//! Recorded through the `metrics` facade; the binary decides whether a
//! recorder is installed and where the rendered text goes.
//!
//! - `token_probe_total` (counter): label `outcome`
//! - `token_tier_attempts_total` (counter): labels `tier`, `outcome`
//! - `token_manual_reauthorization_total` (counter)
//! - `authenticated_calls_total` (counter): label `outcome`

/// One step of the refresh cascade, as it appears in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Tier 1: downstream refresh-token grant
    DownstreamRefresh,
    /// Tier 2: token issuance with the bridge credential
    BridgeIssue,
    /// Tier 3: OAuth refresh of the bridge credential
    OAuthBridgeRefresh,
    /// Tier 4: nothing left to try
    Terminal,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Tier::DownstreamRefresh => "downstream_refresh",
            Tier::BridgeIssue => "bridge_issue",
            Tier::OAuthBridgeRefresh => "oauth_bridge_refresh",
            Tier::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

pub(crate) fn record_probe(outcome: &'static str) {
    metrics::counter!("token_probe_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_tier(tier: Tier, outcome: &'static str) {
    metrics::counter!("token_tier_attempts_total", "tier" => tier.label(), "outcome" => outcome)
        .increment(1);
}

pub(crate) fn record_manual_reauthorization() {
    metrics::counter!("token_manual_reauthorization_total").increment(1);
}

pub(crate) fn record_call(outcome: &'static str) {
    metrics::counter!("authenticated_calls_total", "outcome" => outcome).increment(1);
}
