//! In-memory packet filter
//!
//! Keeps one ordered chain per address family and renumbers after deletes,
//! the same way the kernel does. Listings use the `iptables -n` column
//! layout so the synchronizer's matching is exercised end to end.

use super::{parse_listing, EngineError, EngineOp, FirewallEngine, FirewallRule, IpFamily, ListedRule, RuleAction};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;

#[derive(Default)]
struct Chains {
    v4: Vec<FirewallRule>,
    v6: Vec<FirewallRule>,
}

impl Chains {
    fn get(&self, family: IpFamily) -> &Vec<FirewallRule> {
        match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        }
    }

    fn get_mut(&mut self, family: IpFamily) -> &mut Vec<FirewallRule> {
        match family {
            IpFamily::V4 => &mut self.v4,
            IpFamily::V6 => &mut self.v6,
        }
    }
}

/// In-memory engine (for development and testing)
#[derive(Default)]
pub struct MemoryEngine {
    chains: Mutex<Chains>,
    failing: Mutex<HashSet<EngineOp>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` fail until cleared
    pub fn fail_on(&self, op: EngineOp) {
        self.failing.lock().insert(op);
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Rules of one family in chain order
    pub fn rules(&self, family: IpFamily) -> Vec<FirewallRule> {
        self.chains.lock().get(family).clone()
    }

    /// Rules whose source is `address`, in chain order
    pub fn rules_for(&self, address: &IpAddr) -> Vec<FirewallRule> {
        self.chains
            .lock()
            .get(IpFamily::of(address))
            .iter()
            .filter(|r| r.source == *address)
            .cloned()
            .collect()
    }

    /// Drop every rule, as after a reboot
    pub fn flush(&self) {
        let mut chains = self.chains.lock();
        chains.v4.clear();
        chains.v6.clear();
    }

    fn check(&self, op: EngineOp, command: String) -> Result<(), EngineError> {
        if self.failing.lock().contains(&op) {
            return Err(EngineError::Exit {
                command,
                status: "exit status: 1".into(),
                stderr: "injected failure".into(),
            });
        }
        Ok(())
    }
}

fn render(index: usize, rule: &FirewallRule) -> String {
    let any = match rule.family() {
        IpFamily::V4 => "0.0.0.0/0",
        IpFamily::V6 => "::/0",
    };
    match &rule.action {
        RuleAction::Throttle { rate, burst, label } => format!(
            "{:<4} {:<10} {:<4} --  {:<20} {:<20} limit: avg {}/sec burst {} mode srcip name {}",
            index, "ACCEPT", rule.protocol, rule.source, any, rate, burst, label
        ),
        RuleAction::Drop => format!(
            "{:<4} {:<10} {:<4} --  {:<20} {:<20}",
            index, "DROP", rule.protocol, rule.source, any
        ),
    }
}

#[async_trait]
impl FirewallEngine for MemoryEngine {
    async fn list_rules(&self, family: IpFamily) -> Result<Vec<ListedRule>, EngineError> {
        self.check(EngineOp::List, format!("list {:?}", family))?;

        let chains = self.chains.lock();
        let listing: Vec<String> = chains
            .get(family)
            .iter()
            .enumerate()
            .map(|(i, rule)| render(i + 1, rule))
            .collect();
        Ok(parse_listing(&listing.join("\n")))
    }

    async fn append_rule(&self, rule: &FirewallRule) -> Result<(), EngineError> {
        self.check(EngineOp::Append, format!("append {}", rule.source))?;
        self.chains.lock().get_mut(rule.family()).push(rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, family: IpFamily, index: u32) -> Result<(), EngineError> {
        let command = format!("delete {:?} {}", family, index);
        self.check(EngineOp::Delete, command.clone())?;

        let mut chains = self.chains.lock();
        let chain = chains.get_mut(family);
        let position = index as usize;
        if position == 0 || position > chain.len() {
            return Err(EngineError::Exit {
                command,
                status: "exit status: 1".into(),
                stderr: "Index of deletion too big.".into(),
            });
        }
        chain.remove(position - 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_listing_round_trips_through_parser() {
        let engine = MemoryEngine::new();
        let a = addr("10.0.0.5");
        engine
            .append_rule(&FirewallRule::throttle(a, "tcp", 10, 20, "suspicious_10_0_0_5".into()))
            .await
            .unwrap();
        engine.append_rule(&FirewallRule::drop(a, "tcp")).await.unwrap();

        let listed = engine.list_rules(IpFamily::V4).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].index, 1);
        assert_eq!(listed[1].index, 2);
        assert!(listed.iter().all(|r| r.mentions(&a)));
        assert!(listed[0].line.contains("name suspicious_10_0_0_5"));
    }

    #[tokio::test]
    async fn test_delete_renumbers() {
        let engine = MemoryEngine::new();
        for s in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            engine.append_rule(&FirewallRule::drop(addr(s), "tcp")).await.unwrap();
        }

        engine.delete_rule(IpFamily::V4, 1).await.unwrap();
        let listed = engine.list_rules(IpFamily::V4).await.unwrap();
        assert_eq!(listed[0].index, 1);
        assert!(listed[0].mentions(&addr("10.0.0.2")));

        assert!(engine.delete_rule(IpFamily::V4, 3).await.is_err());
        assert!(engine.delete_rule(IpFamily::V4, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_families_are_separate_chains() {
        let engine = MemoryEngine::new();
        engine.append_rule(&FirewallRule::drop(addr("10.0.0.1"), "tcp")).await.unwrap();
        engine.append_rule(&FirewallRule::drop(addr("2001:db8::1"), "tcp")).await.unwrap();

        assert_eq!(engine.list_rules(IpFamily::V4).await.unwrap().len(), 1);
        let v6 = engine.list_rules(IpFamily::V6).await.unwrap();
        assert_eq!(v6.len(), 1);
        assert!(v6[0].mentions(&addr("2001:db8::1")));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let engine = MemoryEngine::new();
        engine.fail_on(EngineOp::Append);
        assert!(engine
            .append_rule(&FirewallRule::drop(addr("10.0.0.1"), "tcp"))
            .await
            .is_err());
        assert!(engine.list_rules(IpFamily::V4).await.is_ok());

        engine.clear_failures();
        assert!(engine
            .append_rule(&FirewallRule::drop(addr("10.0.0.1"), "tcp"))
            .await
            .is_ok());
    }
}
