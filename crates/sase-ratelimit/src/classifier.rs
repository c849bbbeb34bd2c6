//! Classification State Machine
//!
//! Per address: benign (no entry) → suspicious | malicious → benign.
//! Moving between the two limiting tiers is a migration: the old rules and
//! entry are removed and the new tier is instated with a fresh timestamp.
//!
//! Every operation runs its load → decide → firewall → save sequence under
//! one process-wide lock and starts with an expiry pass, so no caller ever
//! sees an entry that has outlived its tier's timeout.

use crate::clock::Clock;
use crate::config::TierPolicies;
use crate::store::{Entry, EntryMap, EntryStore};
use crate::sync::RuleSynchronizer;
use crate::{RateLimitError, Result, Tier};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Acknowledgement of a successful classification
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub address: IpAddr,
    pub tier: Tier,
    /// Tier the address migrated from, if any
    pub previous: Option<Tier>,
    pub classified_at: f64,
}

impl Classified {
    pub fn message(&self) -> String {
        format!("{} added to queue '{}'", self.address, self.tier)
    }
}

/// Outcome of one expiry pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Entries removed along with their rules
    pub expired: Vec<IpAddr>,
    /// Entries kept because their rules could not be removed
    pub failed: Vec<(IpAddr, String)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.failed.is_empty()
    }
}

/// Outcome of reinstalling rules for persisted entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub restored: usize,
    pub failed: usize,
}

/// Owns classification transitions and their side effects
pub struct Classifier {
    store: Arc<dyn EntryStore>,
    rules: RuleSynchronizer,
    policies: TierPolicies,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl Classifier {
    pub fn new(
        store: Arc<dyn EntryStore>,
        rules: RuleSynchronizer,
        policies: TierPolicies,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            rules,
            policies,
            clock,
            lock: Mutex::new(()),
        }
    }

    /// Put `address` into `tier`, migrating it out of its current tier if needed.
    pub async fn classify(&self, address: IpAddr, tier: Tier) -> Result<Classified> {
        let _guard = self.lock.lock().await;
        // Expiry failures are already logged by the pass itself
        let (mut entries, _) = self.expire_locked().await?;

        let mut deferred = None;
        let previous = match entries.get(&address) {
            Some(current) if current.queue == tier => {
                return Err(RateLimitError::DuplicateClassification { address, tier });
            }
            Some(current) => {
                let from = current.queue;
                info!(address = %address, from = %from, to = %tier, "Migrating between queues");
                if let Err(e) = self.rules.remove_all(address).await {
                    warn!(address = %address, error = %e, "Failed to clear previous queue rules, continuing");
                    deferred = Some(e);
                }
                entries.remove(&address);
                Some(from)
            }
            None => None,
        };

        let classified_at = self.clock.now();
        entries.insert(address, Entry::new(tier, classified_at));

        let installed = self
            .rules
            .install_tier(address, tier, self.policies.get(tier))
            .await;

        // Persisted regardless of the firewall outcome.
        self.store.save(&entries).await?;

        if let Err(e) = installed {
            error!(address = %address, tier = %tier, error = %e, "Rule installation failed");
            return Err(deferred.unwrap_or(e));
        }
        if let Some(e) = deferred {
            return Err(e);
        }

        info!(address = %address, tier = %tier, "Address limited");
        Ok(Classified {
            address,
            tier,
            previous,
            classified_at,
        })
    }

    /// Lift the limit on `address`.
    pub async fn remove(&self, address: IpAddr) -> Result<Entry> {
        let _guard = self.lock.lock().await;
        // Expiry failures are already logged by the pass itself
        let (mut entries, _) = self.expire_locked().await?;

        let Some(entry) = entries.get(&address).copied() else {
            return Err(RateLimitError::NotClassified(address));
        };

        self.rules.remove_all(address).await?;
        entries.remove(&address);
        self.store.save(&entries).await?;

        info!(address = %address, tier = %entry.queue, "Limit removed");
        Ok(entry)
    }

    /// Current mapping, after expiring whatever has timed out.
    pub async fn list(&self) -> Result<EntryMap> {
        let _guard = self.lock.lock().await;
        let (entries, _) = self.expire_locked().await?;
        Ok(entries)
    }

    /// Run one expiry pass.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let _guard = self.lock.lock().await;
        let (_, report) = self.expire_locked().await?;
        Ok(report)
    }

    /// Reinstall the rules of every persisted entry.
    ///
    /// Used at startup: the kernel forgets its rules on reboot while the store
    /// does not.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.lock.lock().await;
        let (entries, _) = self.expire_locked().await?;

        let mut report = ReconcileReport::default();
        for (address, entry) in &entries {
            match self
                .rules
                .install_tier(*address, entry.queue, self.policies.get(entry.queue))
                .await
            {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    warn!(address = %address, tier = %entry.queue, error = %e, "Failed to restore rules");
                    report.failed += 1;
                }
            }
        }

        info!(restored = report.restored, failed = report.failed, "Reconciled firewall with store");
        Ok(report)
    }

    /// Expire timed-out entries. Caller must hold `self.lock`.
    async fn expire_locked(&self) -> Result<(EntryMap, SweepReport)> {
        let mut entries = self.store.load().await?;
        let now = self.clock.now();

        let overdue: Vec<(IpAddr, Tier)> = entries
            .iter()
            .filter(|(_, entry)| entry.age(now) > self.policies.get(entry.queue).timeout_secs as f64)
            .map(|(address, entry)| (*address, entry.queue))
            .collect();

        let mut report = SweepReport::default();
        for (address, tier) in overdue {
            match self.rules.remove_all(address).await {
                Ok(_) => {
                    entries.remove(&address);
                    info!(address = %address, tier = %tier, "Expired");
                    report.expired.push(address);
                }
                Err(e) => {
                    // Kept so the next pass retries.
                    warn!(address = %address, tier = %tier, error = %e, "Failed to expire");
                    report.failed.push((address, e.to_string()));
                }
            }
        }

        if !report.expired.is_empty() {
            self.store.save(&entries).await?;
        }

        Ok((entries, report))
    }
}
