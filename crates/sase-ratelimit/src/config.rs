//! Rate Limiter Configuration

use crate::{RateLimitError, Tier};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/opensase/ratelimit.json";

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Per-tier throttle and expiry policy
    pub tiers: TierPolicies,
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Entry store location
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Expiry sweep interval
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Packet filter settings
    #[serde(default)]
    pub firewall: FirewallConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".into()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/opensase/limited_ips.json")
}

fn default_sweep_interval() -> u64 {
    30
}

impl RateLimitConfig {
    /// Build a config with default ambient settings around the given tiers
    pub fn new(tiers: TierPolicies) -> Self {
        Self {
            tiers,
            listen_addr: default_listen_addr(),
            store_path: default_store_path(),
            sweep_interval_secs: default_sweep_interval(),
            firewall: FirewallConfig::default(),
        }
    }

    /// Load from file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RateLimitError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RateLimitError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Parse from a JSON document and validate
    pub fn from_json(content: &str) -> Result<Self, RateLimitError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| RateLimitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would produce unusable rules or a stuck sweeper
    pub fn validate(&self) -> Result<(), RateLimitError> {
        for tier in Tier::ALL {
            let policy = self.tiers.get(tier);
            if policy.rate == 0 || policy.burst == 0 {
                return Err(RateLimitError::Config(format!(
                    "tier {}: rate and burst must be positive",
                    tier
                )));
            }
            if policy.timeout_secs == 0 {
                return Err(RateLimitError::Config(format!(
                    "tier {}: timeout_secs must be positive",
                    tier
                )));
            }
        }
        if self.sweep_interval_secs == 0 {
            return Err(RateLimitError::Config(
                "sweep_interval_secs must be positive".into(),
            ));
        }
        if self.firewall.command_timeout_secs == 0 {
            return Err(RateLimitError::Config(
                "firewall.command_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Expiry sweep interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Throttle and expiry policy for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Accepted packets per second
    pub rate: u32,
    /// Burst allowance
    pub burst: u32,
    /// Seconds an address stays in the tier before expiring
    pub timeout_secs: u64,
}

/// Policies for both limiting tiers; both are required
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicies {
    pub suspicious: TierPolicy,
    pub malicious: TierPolicy,
}

impl TierPolicies {
    /// Policy for a tier
    pub fn get(&self, tier: Tier) -> &TierPolicy {
        match tier {
            Tier::Suspicious => &self.suspicious,
            Tier::Malicious => &self.malicious,
        }
    }
}

/// Packet filter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Which engine to drive
    pub backend: FirewallBackend,
    /// Traversal chain the rules are appended to
    pub chain: String,
    /// Transport protocol the rules match
    pub protocol: String,
    /// IPv4 control command
    pub iptables_bin: String,
    /// IPv6 control command
    pub ip6tables_bin: String,
    /// Upper bound for a single command invocation
    pub command_timeout_secs: u64,
    /// Pass `-w` so concurrent xtables users queue instead of failing
    pub wait_for_lock: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: FirewallBackend::Iptables,
            chain: "FORWARD".into(),
            protocol: "tcp".into(),
            iptables_bin: "iptables".into(),
            ip6tables_bin: "ip6tables".into(),
            command_timeout_secs: 5,
            wait_for_lock: true,
        }
    }
}

impl FirewallConfig {
    /// Command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    /// iptables / ip6tables via subprocess
    Iptables,
    /// In-process rule table, nothing touches the kernel
    Memory,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "tiers": {
            "suspicious": { "rate": 10, "burst": 20, "timeout_secs": 600 },
            "malicious": { "rate": 1, "burst": 2, "timeout_secs": 3600 }
        }
    }"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = RateLimitConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.tiers.get(Tier::Suspicious).rate, 10);
        assert_eq!(config.tiers.get(Tier::Malicious).timeout_secs, 3600);
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.firewall.chain, "FORWARD");
        assert_eq!(config.firewall.protocol, "tcp");
        assert_eq!(config.firewall.backend, FirewallBackend::Iptables);
    }

    #[test]
    fn test_missing_tier_fails() {
        let json = r#"{
            "tiers": {
                "suspicious": { "rate": 10, "burst": 20, "timeout_secs": 600 }
            }
        }"#;
        assert!(matches!(
            RateLimitConfig::from_json(json),
            Err(RateLimitError::Config(_))
        ));
    }

    #[test]
    fn test_missing_timeout_fails() {
        let json = r#"{
            "tiers": {
                "suspicious": { "rate": 10, "burst": 20 },
                "malicious": { "rate": 1, "burst": 2, "timeout_secs": 3600 }
            }
        }"#;
        assert!(RateLimitConfig::from_json(json).is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        let json = MINIMAL.replace("\"rate\": 1,", "\"rate\": 0,");
        assert!(RateLimitConfig::from_json(&json).is_err());

        let json = MINIMAL.replace("\"timeout_secs\": 600", "\"timeout_secs\": 0");
        assert!(RateLimitConfig::from_json(&json).is_err());
    }

    #[test]
    fn test_firewall_overrides() {
        let json = r#"{
            "tiers": {
                "suspicious": { "rate": 10, "burst": 20, "timeout_secs": 600 },
                "malicious": { "rate": 1, "burst": 2, "timeout_secs": 3600 }
            },
            "sweep_interval_secs": 5,
            "firewall": { "backend": "memory", "chain": "RATELIMIT" }
        }"#;
        let config = RateLimitConfig::from_json(json).unwrap();
        assert_eq!(config.sweep_interval_secs, 5);
        assert_eq!(config.firewall.backend, FirewallBackend::Memory);
        assert_eq!(config.firewall.chain, "RATELIMIT");
        assert_eq!(config.firewall.protocol, "tcp");
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config =
            RateLimitConfig::from_json(include_str!("../../../deploy/ratelimit.json")).unwrap();
        assert_eq!(config.tiers.get(Tier::Malicious).rate, 5);
        assert!(config.firewall.wait_for_lock);
    }

    #[test]
    fn test_load_missing_file() {
        let err = RateLimitConfig::load("/nonexistent/ratelimit.json").unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)));
    }
}
