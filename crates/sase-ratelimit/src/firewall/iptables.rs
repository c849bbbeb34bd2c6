//! iptables / ip6tables backend

use super::{parse_listing, EngineError, FirewallEngine, FirewallRule, IpFamily, ListedRule, RuleAction};
use crate::config::FirewallConfig;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

/// Drives the kernel packet filter through the iptables CLI
pub struct IptablesEngine {
    iptables_bin: String,
    ip6tables_bin: String,
    chain: String,
    timeout: Duration,
    wait_for_lock: bool,
}

impl IptablesEngine {
    pub fn new(config: &FirewallConfig) -> Self {
        Self {
            iptables_bin: config.iptables_bin.clone(),
            ip6tables_bin: config.ip6tables_bin.clone(),
            chain: config.chain.clone(),
            timeout: config.command_timeout(),
            wait_for_lock: config.wait_for_lock,
        }
    }

    fn binary(&self, family: IpFamily) -> &str {
        match family {
            IpFamily::V4 => &self.iptables_bin,
            IpFamily::V6 => &self.ip6tables_bin,
        }
    }

    fn command_args(&self, tail: &[&str]) -> Vec<String> {
        let mut args = Vec::with_capacity(tail.len() + 1);
        if self.wait_for_lock {
            args.push("-w".to_string());
        }
        args.extend(tail.iter().map(|s| s.to_string()));
        args
    }

    fn list_args(&self) -> Vec<String> {
        self.command_args(&["-L", self.chain.as_str(), "-n", "--line-numbers"])
    }

    fn append_args(&self, rule: &FirewallRule) -> Vec<String> {
        let source = rule.source.to_string();
        let (limit, burst) = match &rule.action {
            RuleAction::Throttle { rate, burst, .. } => (format!("{}/sec", rate), burst.to_string()),
            RuleAction::Drop => (String::new(), String::new()),
        };

        let mut tail: Vec<&str> = vec![
            "-A",
            self.chain.as_str(),
            "-s",
            source.as_str(),
            "-p",
            rule.protocol.as_str(),
        ];
        match &rule.action {
            RuleAction::Throttle { label, .. } => tail.extend([
                "-m",
                "hashlimit",
                "--hashlimit",
                limit.as_str(),
                "--hashlimit-burst",
                burst.as_str(),
                "--hashlimit-mode",
                "srcip",
                "--hashlimit-name",
                label.as_str(),
                "-j",
                "ACCEPT",
            ]),
            RuleAction::Drop => tail.extend(["-j", "DROP"]),
        }

        self.command_args(&tail)
    }

    fn delete_args(&self, index: u32) -> Vec<String> {
        let index = index.to_string();
        self.command_args(&["-D", self.chain.as_str(), index.as_str()])
    }

    async fn run(&self, family: IpFamily, args: Vec<String>) -> Result<String, EngineError> {
        let binary = self.binary(family);
        let command = format!("{} {}", binary, args.join(" "));
        tracing::debug!(command = %command, "Running packet filter command");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(binary).args(&args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| EngineError::Timeout {
            command: command.clone(),
            secs: self.timeout.as_secs(),
        })?
        .map_err(|e| EngineError::Spawn {
            command: command.clone(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(EngineError::Exit {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl FirewallEngine for IptablesEngine {
    async fn list_rules(&self, family: IpFamily) -> Result<Vec<ListedRule>, EngineError> {
        let stdout = self.run(family, self.list_args()).await?;
        Ok(parse_listing(&stdout))
    }

    async fn append_rule(&self, rule: &FirewallRule) -> Result<(), EngineError> {
        self.run(rule.family(), self.append_args(rule)).await.map(|_| ())
    }

    async fn delete_rule(&self, family: IpFamily, index: u32) -> Result<(), EngineError> {
        self.run(family, self.delete_args(index)).await.map(|_| ())
    }
}
