//! OpenSASE Rate Limiter
//!
//! Classifies source addresses into throttling tiers and keeps the packet
//! filter in lockstep with that classification, expiring entries once they
//! have spent their tier's timeout.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       OPENSASE RATE LIMITER                             │
//! │                                                                         │
//! │   POST/DELETE/GET /limit                     every sweep_interval       │
//! │  ┌──────────────────────┐                  ┌──────────────────────┐    │
//! │  │       HTTP API       │                  │    EXPIRY SWEEPER    │    │
//! │  └──────────┬───────────┘                  └──────────┬───────────┘    │
//! │             │                                         │                │
//! │  ┌──────────▼─────────────────────────────────────────▼───────────┐    │
//! │  │                 CLASSIFICATION STATE MACHINE                    │    │
//! │  │      benign ⇄ suspicious ⇄ malicious  (one global lock)         │    │
//! │  └──────────┬─────────────────────────────────────────┬───────────┘    │
//! │             │                                         │                │
//! │  ┌──────────▼───────────┐                  ┌──────────▼───────────┐    │
//! │  │     ENTRY STORE      │                  │   RULE SYNCHRONIZER  │    │
//! │  │  limited_ips.json    │                  │  hashlimit + DROP    │    │
//! │  └──────────────────────┘                  └──────────┬───────────┘    │
//! │                                                       │                │
//! │                                            ┌──────────▼───────────┐    │
//! │                                            │ iptables / ip6tables │    │
//! │                                            └──────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod api;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod firewall;
pub mod store;
pub mod sweeper;
pub mod sync;
pub mod tier;

use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

pub use classifier::{Classified, Classifier, ReconcileReport, SweepReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RateLimitConfig, TierPolicies, TierPolicy};
pub use firewall::{EngineError, EngineOp, FirewallEngine, IptablesEngine, MemoryEngine};
pub use store::{Entry, EntryMap, EntryStore, InMemoryStore, JsonFileStore};
pub use sweeper::ExpirySweeper;
pub use sync::RuleSynchronizer;
pub use tier::Tier;

/// Rate limiter error types
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid queue: {0}")]
    InvalidTier(String),

    #[error("invalid request body: {0}")]
    InvalidRequest(String),

    #[error("{address} is already limited in queue '{tier}'")]
    DuplicateClassification { address: IpAddr, tier: Tier },

    #[error("{0} is not limited")]
    NotClassified(IpAddr),

    #[error("firewall {operation} failed for {address}: {source}")]
    Firewall {
        address: IpAddr,
        operation: EngineOp,
        source: EngineError,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),
}

/// Result type for the rate limiter
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Rate limiter service: classifier, sweeper and HTTP API wired together
pub struct RateLimitService {
    /// Configuration
    pub config: Arc<RateLimitConfig>,
    /// Classification state machine
    pub classifier: Arc<Classifier>,
    shutdown_tx: watch::Sender<bool>,
}

impl RateLimitService {
    /// Build the service from configuration: JSON file store and the configured engine
    pub async fn new(config: RateLimitConfig) -> Result<Self> {
        let store = Arc::new(JsonFileStore::open(&config.store_path).await?);
        let engine = firewall::build_engine(&config.firewall);
        Ok(Self::with_parts(config, store, engine, Arc::new(SystemClock)))
    }

    /// Build the service from explicit collaborators
    pub fn with_parts(
        config: RateLimitConfig,
        store: Arc<dyn EntryStore>,
        engine: Arc<dyn FirewallEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rules = RuleSynchronizer::new(engine, config.firewall.protocol.clone());
        let classifier = Arc::new(Classifier::new(store, rules, config.tiers, clock));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config: Arc::new(config),
            classifier,
            shutdown_tx,
        }
    }

    /// Bring the firewall in line with the persisted entries
    pub async fn init(&self) -> Result<ReconcileReport> {
        tracing::info!("Reconciling firewall rules with entry store...");
        self.classifier.reconcile().await
    }

    /// HTTP router for this service
    pub fn router(&self) -> axum::Router {
        api::router(self.classifier.clone())
    }

    /// Serve the API and run the sweeper until a shutdown signal arrives
    pub async fn run(&self) -> Result<()> {
        let sweeper = ExpirySweeper::new(self.classifier.clone(), self.config.sweep_interval())
            .spawn(self.shutdown_tx.subscribe());

        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| RateLimitError::Network(e.to_string()))?;
        tracing::info!("Rate limiter API listening on {}", self.config.listen_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => {},
                    _ = shutdown_rx.wait_for(|stop| *stop) => {},
                }
            })
            .await
            .map_err(|e| RateLimitError::Network(e.to_string()));

        self.shutdown();
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "Expiry sweeper task ended abnormally");
        }

        tracing::info!("Rate limiter stopped");
        served
    }

    /// Ask `run` to stop
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
