use std::net::Ipv4Addr;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::Command;

const IPTABLES_BIN: &str = "iptables";

/// nat chain pairing packet marks with their SNAT source.
const MASQUERADE_CHAIN: &str = "OVSDN-MASQUERADE";
/// filter chain rejecting new inbound connections to hosted egress IPs.
const FIREWALL_CHAIN: &str = "OVSDN-FIREWALL-ALLOW";

#[derive(Debug, Error)]
pub enum IptablesError {
    #[error("Couldn't run iptables! {}", .0)]
    Spawn(std::io::Error),
    #[error("iptables [{}] failed: {}", .0, .1)]
    CommandFailed(String, String),
}

/// The packet-filter rules backing locally hosted egress IPs.
#[async_trait]
pub trait EgressIptables: Send + Sync {
    /// Installs the rules steering traffic marked with `mark` out via
    /// `egress_ip`.
    async fn add_egress_ip_rules(&self, egress_ip: Ipv4Addr, mark: &str)
        -> Result<(), IptablesError>;

    async fn delete_egress_ip_rules(
        &self,
        egress_ip: Ipv4Addr,
        mark: &str,
    ) -> Result<(), IptablesError>;

    /// Reinstates every known egress rule after the rule set may have been
    /// modified behind our back.
    async fn sync_egress_ip_rules(&self) -> Result<(), IptablesError>;
}

/// Drives the `iptables` binary directly, remembering the rules it installed
/// so they can be replayed on a sync.
pub struct CommandIptables {
    rules: Mutex<Vec<(Ipv4Addr, String)>>,
}

impl CommandIptables {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
        }
    }
}

fn egress_ip_rules(egress_ip: Ipv4Addr, mark: &str) -> [(&'static str, &'static str, Vec<String>); 2] {
    [
        (
            "nat",
            MASQUERADE_CHAIN,
            vec![
                "-m".to_owned(),
                "mark".to_owned(),
                "--mark".to_owned(),
                mark.to_owned(),
                "-j".to_owned(),
                "SNAT".to_owned(),
                "--to-source".to_owned(),
                egress_ip.to_string(),
            ],
        ),
        (
            "filter",
            FIREWALL_CHAIN,
            vec![
                "-d".to_owned(),
                format!("{egress_ip}/32"),
                "-m".to_owned(),
                "conntrack".to_owned(),
                "--ctstate".to_owned(),
                "NEW".to_owned(),
                "-j".to_owned(),
                "REJECT".to_owned(),
            ],
        ),
    ]
}

async fn run_iptables(args: &[String]) -> Result<bool, IptablesError> {
    let output = Command::new(IPTABLES_BIN)
        .args(args)
        .output()
        .await
        .map_err(IptablesError::Spawn)?;
    if output.status.success() {
        Ok(true)
    } else {
        Ok(false)
    }
}

async fn run_iptables_checked(args: Vec<String>) -> Result<(), IptablesError> {
    let output = Command::new(IPTABLES_BIN)
        .args(&args)
        .output()
        .await
        .map_err(IptablesError::Spawn)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(IptablesError::CommandFailed(
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

fn rule_args(action: &str, table: &str, chain: &str, rule: &[String]) -> Vec<String> {
    let mut args = vec![
        "-t".to_owned(),
        table.to_owned(),
        action.to_owned(),
        chain.to_owned(),
    ];
    args.extend_from_slice(rule);
    args
}

async fn ensure_rule(table: &str, chain: &str, rule: &[String]) -> Result<(), IptablesError> {
    if run_iptables(&rule_args("-C", table, chain, rule)).await? {
        return Ok(());
    }
    run_iptables_checked(rule_args("-A", table, chain, rule)).await
}

async fn ensure_chain(table: &str, chain: &str) -> Result<(), IptablesError> {
    if run_iptables(&["-t".to_owned(), table.to_owned(), "-N".to_owned(), chain.to_owned()]).await?
    {
        return Ok(());
    }
    // chain already existing is the common case
    Ok(())
}

#[async_trait]
impl EgressIptables for CommandIptables {
    async fn add_egress_ip_rules(
        &self,
        egress_ip: Ipv4Addr,
        mark: &str,
    ) -> Result<(), IptablesError> {
        {
            let mut rules = self.rules.lock();
            if !rules.iter().any(|(ip, _)| *ip == egress_ip) {
                rules.push((egress_ip, mark.to_owned()));
            }
        }
        for (table, chain, rule) in egress_ip_rules(egress_ip, mark) {
            ensure_chain(table, chain).await?;
            ensure_rule(table, chain, &rule).await?;
        }
        Ok(())
    }

    async fn delete_egress_ip_rules(
        &self,
        egress_ip: Ipv4Addr,
        mark: &str,
    ) -> Result<(), IptablesError> {
        self.rules.lock().retain(|(ip, _)| *ip != egress_ip);
        for (table, chain, rule) in egress_ip_rules(egress_ip, mark) {
            if !run_iptables(&rule_args("-D", table, chain, &rule)).await? {
                debug!("Egress rule for {egress_ip} was already gone from {chain}");
            }
        }
        Ok(())
    }

    async fn sync_egress_ip_rules(&self) -> Result<(), IptablesError> {
        let rules: Vec<(Ipv4Addr, String)> = self.rules.lock().clone();
        for (egress_ip, mark) in rules {
            for (table, chain, rule) in egress_ip_rules(egress_ip, &mark) {
                ensure_chain(table, chain).await?;
                ensure_rule(table, chain, &rule).await?;
            }
        }
        Ok(())
    }
}
