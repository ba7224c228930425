//! Firewall (iptables) management tasks

use std::fmt;

use super::Task;
use crate::error::Result;
use crate::exec::{Executor, succeeded};

/// Transport protocol for a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// An INPUT accept rule for new connections on a port or range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowPort {
    /// Port or range (e.g., "6443", "30000:32767")
    pub port: String,
    pub protocol: Protocol,
}

impl AllowPort {
    /// Create a new rule
    pub fn new(port: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            port: port.into(),
            protocol,
        }
    }

    /// Shorthand for a TCP rule
    pub fn tcp(port: impl Into<String>) -> Self {
        Self::new(port, Protocol::Tcp)
    }

    /// Shorthand for a UDP rule
    pub fn udp(port: impl Into<String>) -> Self {
        Self::new(port, Protocol::Udp)
    }

    fn op(&self, action: &str) -> String {
        format!("Firewall.{action}.{}/{}", self.port, self.protocol)
    }

    fn rule_args<'a>(&'a self, action: &'a str, proto: &'a str) -> Vec<&'a str> {
        vec![
            action, "INPUT", "-p", proto, "-m", "state", "--state", "NEW", "-m", proto, "--dport",
            &self.port, "-j", "ACCEPT",
        ]
    }

    fn exists(&self, exec: &dyn Executor) -> Result<bool> {
        let proto = self.protocol.to_string();
        succeeded(exec.probe(&self.op("Check"), "iptables", &self.rule_args("-C", &proto)))
    }

    fn add(&self, exec: &dyn Executor) -> Result<()> {
        let proto = self.protocol.to_string();
        exec.run(&self.op("Allow"), "iptables", &self.rule_args("-A", &proto))?;
        Ok(())
    }
}

impl fmt::Display for AllowPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Ensure a set of ports is open and the ruleset saved
#[derive(Debug, Clone, Default)]
pub struct EnsureFirewall {
    /// Rules to apply
    pub rules: Vec<AllowPort>,
}

impl EnsureFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule
    pub fn allow(mut self, rule: AllowPort) -> Self {
        self.rules.push(rule);
        self
    }

    /// Ports a Kubernetes node needs for the control plane, CNI and node ports
    pub fn kubernetes_node() -> Self {
        [
            "80", "443", "2376", "2379", "2380", "6443", "9099", "9345", "10250", "10254",
            "30000:32767",
        ]
        .into_iter()
        .map(AllowPort::tcp)
        .chain(["8472", "30000:32767"].into_iter().map(AllowPort::udp))
        .fold(Self::new(), Self::allow)
    }
}

impl Task for EnsureFirewall {
    fn description(&self) -> &str {
        "Configure firewall"
    }

    fn is_satisfied(&self, exec: &dyn Executor) -> Result<bool> {
        for rule in &self.rules {
            if !rule.exists(exec)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply(&self, exec: &dyn Executor) -> Result<()> {
        for rule in &self.rules {
            if rule.exists(exec)? {
                tracing::debug!(%rule, "rule already present");
                continue;
            }
            rule.add(exec)?;
            tracing::info!(%rule, "opened port");
        }
        exec.run("Firewall.Save", "iptables-save", &[])?;
        Ok(())
    }
}
