//! Packet Filter Adapter
//!
//! Narrow interface over the packet filter: list a chain, append a rule,
//! delete a rule by index. Everything above this module is unaware of how
//! the engine is driven.

pub mod iptables;
pub mod memory;

pub use iptables::IptablesEngine;
pub use memory::MemoryEngine;

use crate::config::{FirewallBackend, FirewallConfig};
use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Engine invocation failure
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("failed to run `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("`{command}` failed ({status}): {stderr}")]
    Exit {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
}

/// Engine primitive, used to name what failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    List,
    Append,
    Delete,
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineOp::List => "list",
            EngineOp::Append => "append",
            EngineOp::Delete => "delete",
        })
    }
}

/// Address family; each family has its own chain and rule numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

/// A rule this service creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// Matched source address
    pub source: IpAddr,
    /// Matched transport protocol
    pub protocol: String,
    /// What the rule does with a match
    pub action: RuleAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    /// Accept while under `rate`/`burst`, tracked in hashlimit table `label`
    Throttle { rate: u32, burst: u32, label: String },
    /// Drop everything that reaches it
    Drop,
}

impl FirewallRule {
    pub fn throttle(source: IpAddr, protocol: &str, rate: u32, burst: u32, label: String) -> Self {
        Self {
            source,
            protocol: protocol.to_string(),
            action: RuleAction::Throttle { rate, burst, label },
        }
    }

    pub fn drop(source: IpAddr, protocol: &str) -> Self {
        Self {
            source,
            protocol: protocol.to_string(),
            action: RuleAction::Drop,
        }
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.source)
    }
}

/// One line of a chain listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedRule {
    /// 1-based position in the chain
    pub index: u32,
    /// Raw listing text
    pub line: String,
}

impl ListedRule {
    /// Whether the rule references `address` as a whole field.
    ///
    /// Host masks are accepted so `10.0.0.5/32` matches but `10.0.0.50` does not.
    pub fn mentions(&self, address: &IpAddr) -> bool {
        let plain = address.to_string();
        let host_mask = match address {
            IpAddr::V4(_) => format!("{}/32", plain),
            IpAddr::V6(_) => format!("{}/128", plain),
        };
        self.line
            .split_whitespace()
            .any(|field| field == plain || field == host_mask)
    }
}

/// Parse `iptables -L <chain> -n --line-numbers` output.
///
/// Header lines are skipped; only lines starting with a rule number count.
pub fn parse_listing(output: &str) -> Vec<ListedRule> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let index = line.split_whitespace().next()?.parse::<u32>().ok()?;
            Some(ListedRule {
                index,
                line: line.to_string(),
            })
        })
        .collect()
}

/// Packet filter engine interface (abstracted for testing)
#[async_trait]
pub trait FirewallEngine: Send + Sync {
    /// List the traversal chain with per-rule indices
    async fn list_rules(&self, family: IpFamily) -> Result<Vec<ListedRule>, EngineError>;

    /// Append a rule to the end of the chain
    async fn append_rule(&self, rule: &FirewallRule) -> Result<(), EngineError>;

    /// Delete the rule at `index`; later rules shift up by one
    async fn delete_rule(&self, family: IpFamily, index: u32) -> Result<(), EngineError>;
}

/// Build the configured engine
pub fn build_engine(config: &FirewallConfig) -> Arc<dyn FirewallEngine> {
    match config.backend {
        FirewallBackend::Iptables => Arc::new(IptablesEngine::new(config)),
        FirewallBackend::Memory => {
            tracing::warn!("Using in-memory firewall backend, no kernel rules will be written");
            Arc::new(MemoryEngine::new())
        }
    }
}
