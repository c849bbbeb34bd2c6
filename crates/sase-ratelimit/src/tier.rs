//! Rate-limit tiers

use crate::RateLimitError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use utoipa::ToSchema;

/// Classification tier of a limited source.
///
/// `benign` is deliberately not a variant: an address that is not limited
/// simply has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Throttled with the suspicious policy
    Suspicious,
    /// Throttled with the malicious policy
    Malicious,
}

impl Tier {
    /// All limiting tiers
    pub const ALL: [Tier; 2] = [Tier::Suspicious, Tier::Malicious];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Suspicious => "suspicious",
            Tier::Malicious => "malicious",
        }
    }

    /// Hashlimit table name for an address in this tier.
    pub fn label_for(&self, address: &IpAddr) -> String {
        let token: String = address
            .to_string()
            .chars()
            .map(|c| if c == '.' || c == ':' { '_' } else { c })
            .collect();
        format!("{}_{}", self.as_str(), token)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suspicious" => Ok(Tier::Suspicious),
            "malicious" => Ok(Tier::Malicious),
            "benign" => Err(RateLimitError::InvalidTier(
                "benign is not a limiting tier; use DELETE to lift a limit".into(),
            )),
            other => Err(RateLimitError::InvalidTier(format!(
                "unknown tier '{}', expected suspicious or malicious",
                other
            ))),
        }
    }
}

/// Parse and canonicalize an address literal.
pub fn parse_address(raw: &str) -> Result<IpAddr, RateLimitError> {
    raw.trim()
        .parse::<IpAddr>()
        .map_err(|_| RateLimitError::InvalidAddress(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tiers() {
        assert_eq!("suspicious".parse::<Tier>().unwrap(), Tier::Suspicious);
        assert_eq!("malicious".parse::<Tier>().unwrap(), Tier::Malicious);
        assert!(matches!(
            "benign".parse::<Tier>(),
            Err(RateLimitError::InvalidTier(_))
        ));
        assert!(matches!(
            "Malicious".parse::<Tier>(),
            Err(RateLimitError::InvalidTier(_))
        ));
    }

    #[test]
    fn test_label() {
        let v4: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(Tier::Suspicious.label_for(&v4), "suspicious_10_0_0_5");

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(Tier::Malicious.label_for(&v6), "malicious_2001_db8__1");
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address(" 10.0.0.5 ").unwrap().to_string(), "10.0.0.5");
        assert_eq!(
            parse_address("2001:0db8:0000::0001").unwrap().to_string(),
            "2001:db8::1"
        );
        assert!(matches!(
            parse_address("10.0.0.256"),
            Err(RateLimitError::InvalidAddress(_))
        ));
        assert!(parse_address("not-an-ip").is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Tier::Malicious).unwrap(), "\"malicious\"");
        let tier: Tier = serde_json::from_str("\"suspicious\"").unwrap();
        assert_eq!(tier, Tier::Suspicious);
    }
}
