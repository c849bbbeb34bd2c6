//! Rule Synchronizer
//!
//! Translates "address X is in tier T" into packet filter rules. Each limited
//! address owns exactly one ordered pair in the chain: a hashlimit ACCEPT
//! followed by a DROP. Every rule mentioning the address is considered ours,
//! so leftovers from crashed or half-failed operations are swept up by the
//! next install or removal.

use crate::config::TierPolicy;
use crate::firewall::{EngineOp, FirewallEngine, FirewallRule, IpFamily};
use crate::{RateLimitError, Result, Tier};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keeps the packet filter in line with classification decisions
pub struct RuleSynchronizer {
    engine: Arc<dyn FirewallEngine>,
    protocol: String,
}

impl RuleSynchronizer {
    pub fn new(engine: Arc<dyn FirewallEngine>, protocol: impl Into<String>) -> Self {
        Self {
            engine,
            protocol: protocol.into(),
        }
    }

    /// Replace whatever rules `address` has with the throttle pair for `tier`.
    ///
    /// A failed cleanup does not stop the new pair from being appended; the
    /// cleanup error is returned once the pair is in place.
    pub async fn install_tier(&self, address: IpAddr, tier: Tier, policy: &TierPolicy) -> Result<()> {
        let cleanup = self.remove_all(address).await.err();
        if let Some(e) = &cleanup {
            warn!(address = %address, tier = %tier, error = %e, "Stale rules left in place, installing anyway");
        }

        let throttle = FirewallRule::throttle(
            address,
            &self.protocol,
            policy.rate,
            policy.burst,
            tier.label_for(&address),
        );
        // DROP must come after the throttle: the chain is evaluated top-down.
        let fallback = FirewallRule::drop(address, &self.protocol);

        for rule in [&throttle, &fallback] {
            if let Err(source) = self.engine.append_rule(rule).await {
                let appended = RateLimitError::Firewall {
                    address,
                    operation: EngineOp::Append,
                    source,
                };
                return Err(cleanup.unwrap_or(appended));
            }
        }

        info!(
            address = %address,
            tier = %tier,
            rate = policy.rate,
            burst = policy.burst,
            "Installed throttle rules"
        );
        cleanup.map_or(Ok(()), Err)
    }

    /// Delete every rule that mentions `address`. Returns how many were removed.
    pub async fn remove_all(&self, address: IpAddr) -> Result<usize> {
        let family = IpFamily::of(&address);
        let listed = self
            .engine
            .list_rules(family)
            .await
            .map_err(|source| RateLimitError::Firewall {
                address,
                operation: EngineOp::List,
                source,
            })?;

        let mut indices: Vec<u32> = listed
            .iter()
            .filter(|rule| rule.mentions(&address))
            .map(|rule| rule.index)
            .collect();

        if indices.is_empty() {
            info!(address = %address, "No rules found");
            return Ok(0);
        }

        // Highest index first, the engine renumbers everything below a deleted rule.
        indices.sort_unstable_by(|a, b| b.cmp(a));
        for index in &indices {
            debug!(address = %address, index, "Deleting rule");
            self.engine
                .delete_rule(family, *index)
                .await
                .map_err(|source| RateLimitError::Firewall {
                    address,
                    operation: EngineOp::Delete,
                    source,
                })?;
        }

        info!(address = %address, removed = indices.len(), "Removed rules");
        Ok(indices.len())
    }
}
