//! Expiry Sweeper
//!
//! Background task that expires timed-out entries on a fixed interval. Its
//! failures have no caller to go to, so they are logged and the pass is
//! retried on the next tick.

use crate::classifier::{Classifier, SweepReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodic expiry task
pub struct ExpirySweeper {
    classifier: Arc<Classifier>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(classifier: Arc<Classifier>, interval: Duration) -> Self {
        Self {
            classifier,
            interval,
        }
    }

    /// Spawn onto the runtime; stops once `shutdown` turns true or its sender drops
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Sweep every interval until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs_f64(), "Starting expiry sweeper");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Expiry sweeper stopped");
    }

    /// One pass; never fails
    pub async fn sweep_once(&self) -> Option<SweepReport> {
        tracing::debug!("Sweeping expired entries");

        match self.classifier.sweep().await {
            Ok(report) => {
                for (address, reason) in &report.failed {
                    tracing::warn!(address = %address, error = %reason, "Expired entry could not be removed, will retry");
                }
                if !report.is_empty() {
                    tracing::info!(
                        expired = report.expired.len(),
                        failed = report.failed.len(),
                        "Expiry sweep complete"
                    );
                }
                Some(report)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Expiry sweep failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{TierPolicies, TierPolicy};
    use crate::firewall::MemoryEngine;
    use crate::store::InMemoryStore;
    use crate::sync::RuleSynchronizer;
    use crate::Tier;
    use std::net::IpAddr;

    fn setup() -> (Arc<InMemoryStore>, Arc<MemoryEngine>, Arc<ManualClock>, Arc<Classifier>) {
        let store = Arc::new(InMemoryStore::new());
        let engine = Arc::new(MemoryEngine::new());
        let clock = Arc::new(ManualClock::new(1_000.0));
        let policy = TierPolicy {
            rate: 5,
            burst: 5,
            timeout_secs: 10,
        };
        let classifier = Arc::new(Classifier::new(
            store.clone(),
            RuleSynchronizer::new(engine.clone(), "tcp"),
            TierPolicies {
                suspicious: policy,
                malicious: policy,
            },
            clock.clone(),
        ));
        (store, engine, clock, classifier)
    }

    #[tokio::test]
    async fn test_sweep_once_reports() {
        let (store, _engine, clock, classifier) = setup();
        let a: IpAddr = "10.0.0.5".parse().unwrap();
        classifier.classify(a, Tier::Suspicious).await.unwrap();

        let sweeper = ExpirySweeper::new(classifier, Duration::from_secs(30));
        assert_eq!(sweeper.sweep_once().await, Some(SweepReport::default()));

        clock.advance(11.0);
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.expired, vec![a]);
        assert!(store.snapshot().is_empty());

        store.set_failing(true);
        assert_eq!(sweeper.sweep_once().await, None);
    }

    #[tokio::test]
    async fn test_background_sweep_and_shutdown() {
        let (store, engine, clock, classifier) = setup();
        let a: IpAddr = "10.0.0.5".parse().unwrap();
        classifier.classify(a, Tier::Malicious).await.unwrap();
        clock.advance(11.0);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = ExpirySweeper::new(classifier, Duration::from_millis(20)).spawn(shutdown_rx);

        let mut expired = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.snapshot().is_empty() {
                expired = true;
                break;
            }
        }
        assert!(expired);
        assert!(engine.rules_for(&a).is_empty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_sender_dropped() {
        let (_store, _engine, _clock, classifier) = setup();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = ExpirySweeper::new(classifier, Duration::from_secs(60)).spawn(shutdown_rx);

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
