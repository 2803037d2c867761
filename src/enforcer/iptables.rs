//! iptables backend: one `-d <block> -j DROP` rule per CIDR block.
//!
//! iptables has no interval sets, so desired members are the CIDR cover of
//! each range and every member maps to exactly one rule. The rules live in a
//! dedicated chain (per family, `iptables` and `ip6tables`) jumped to from
//! the configured hook chain.

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    ip6tables_path, iptables_path, members_from_ranges, run_blocking, FirewallBackend,
    FirewallElement, FirewallStats, MemberSet, SyncPlan, SyncReport,
};
use crate::address::Family;
use crate::aggregator::DisjointRangeSet;
use crate::cmd_abstraction::{args_to_strings, CommandExecutor, CommandOutput, RealCommandExecutor};
use crate::config::IptablesConfig;
use crate::error::AutobanError;
use crate::range::IpRange;
use crate::signal::ShutdownToken;

pub struct IptablesBackend<E: CommandExecutor = RealCommandExecutor> {
    executor: Arc<E>,
    config: IptablesConfig,
    shutdown: ShutdownToken,
}

fn tool(family: Family) -> &'static str {
    match family {
        Family::V4 => iptables_path(),
        Family::V6 => ip6tables_path(),
    }
}

impl<E: CommandExecutor + 'static> IptablesBackend<E> {
    pub fn new(executor: Arc<E>, config: IptablesConfig) -> Self {
        Self {
            executor,
            config,
            shutdown: ShutdownToken::new(),
        }
    }

    pub fn with_shutdown(mut self, token: ShutdownToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Runs the family's tool with `-w` so we wait for the xtables lock.
    async fn run(&self, family: Family, args: &[&str]) -> Result<CommandOutput> {
        let mut full = vec!["-w"];
        full.extend_from_slice(args);
        run_blocking(&self.executor, tool(family), args_to_strings(&full), None).await
    }

    async fn chain_exists(&self, family: Family) -> Result<bool> {
        Ok(self.run(family, &["-S", &self.config.chain]).await?.success)
    }

    async fn ensure_family(&self, family: Family) -> Result<()> {
        let chain = &self.config.chain;
        let hook = &self.config.hook_chain;

        if !self.chain_exists(family).await? {
            self.run(family, &["-N", chain])
                .await?
                .into_stdout(tool(family))
                .map_err(|e| AutobanError::KernelApply(e.to_string()))?;
            debug!("Created {} chain {}", family, chain);
        }

        let hooked = self.run(family, &["-C", hook, "-j", chain]).await?.success;
        if !hooked {
            self.run(family, &["-A", hook, "-j", chain])
                .await?
                .into_stdout(tool(family))
                .map_err(|e| AutobanError::KernelApply(e.to_string()))?;
            debug!("Hooked {} chain {} from {}", family, chain, hook);
        }
        Ok(())
    }

    async fn rule(&self, op: &str, block: &IpNet) -> Result<()> {
        let family = IpRange::from(*block).family();
        let target = block.to_string();
        self.run(family, &[op, &self.config.chain, "-d", &target, "-j", "DROP"])
            .await?
            .into_stdout(tool(family))
            .map_err(|e| AutobanError::KernelApply(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl<E: CommandExecutor + 'static> FirewallBackend for IptablesBackend<E> {
    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn ensure_ready(&self) -> Result<()> {
        for family in [Family::V4, Family::V6] {
            self.ensure_family(family).await?;
        }
        info!(
            "Initialized iptables chain {} (hooked from {})",
            self.config.chain, self.config.hook_chain
        );
        Ok(())
    }

    async fn live_members(&self) -> Result<MemberSet> {
        let mut members = MemberSet::new();
        for family in [Family::V4, Family::V6] {
            let output = self.run(family, &["-S", &self.config.chain]).await?;
            if !output.success {
                if output.stderr.contains("No chain") {
                    continue;
                }
                return Err(AutobanError::KernelQuery(format!(
                    "{} -S {} failed: {}",
                    tool(family),
                    self.config.chain,
                    output.stderr.trim()
                ))
                .into());
            }
            for block in parse_rule_listing(&output.stdout, &self.config.chain) {
                let el = FirewallElement::from_range(&IpRange::from(block));
                members.insert(el.key(), el);
            }
        }
        Ok(members)
    }

    /// One member per CIDR block of the cover.
    fn desired_members(&self, set: &DisjointRangeSet) -> MemberSet {
        let blocks: Vec<IpRange> = set
            .without_reserved()
            .to_cidr_blocks()
            .into_iter()
            .map(IpRange::from)
            .collect();
        members_from_ranges(blocks.iter())
    }

    async fn apply(&self, plan: &SyncPlan) -> Result<SyncReport> {
        let mut report = SyncReport {
            unchanged: plan.unchanged,
            ..Default::default()
        };

        let ops = plan
            .deletions
            .iter()
            .map(|el| ("-D", el))
            .chain(plan.additions.iter().map(|el| ("-A", el)));

        for (op, el) in ops {
            if self.shutdown.is_cancelled() {
                report.skipped += 1;
                continue;
            }
            let mut ok = true;
            for block in el.to_range().to_cidr_blocks() {
                if let Err(e) = self.rule(op, &block).await {
                    warn!("iptables {} {} failed: {}", op, block, e);
                    ok = false;
                }
            }
            match (ok, op) {
                (false, _) => report.failed += 1,
                (true, "-D") => report.deleted += 1,
                (true, _) => report.added += 1,
            }
        }
        Ok(report)
    }

    async fn remove(&self) -> Result<()> {
        let chain = &self.config.chain;
        for family in [Family::V4, Family::V6] {
            if !self.chain_exists(family).await? {
                continue;
            }
            // The jump may already be gone
            let _ = self.run(family, &["-D", &self.config.hook_chain, "-j", chain]).await?;
            for op in ["-F", "-X"] {
                self.run(family, &[op, chain])
                    .await?
                    .into_stdout(tool(family))
                    .map_err(|e| AutobanError::KernelApply(e.to_string()))?;
            }
            info!("Removed {} chain {}", tool(family), chain);
        }
        Ok(())
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(self.chain_exists(Family::V4).await? && self.chain_exists(Family::V6).await?)
    }

    async fn stats(&self) -> Result<FirewallStats> {
        let mut stats = FirewallStats::default();
        for family in [Family::V4, Family::V6] {
            let output = self
                .run(family, &["-L", &self.config.chain, "-v", "-n", "-x"])
                .await?;
            if output.success {
                let counted = parse_counters(&output.stdout);
                stats.packets_blocked += counted.packets_blocked;
                stats.bytes_blocked += counted.bytes_blocked;
            }
        }
        Ok(stats)
    }
}

/// Destination blocks of `-A <chain> -d <block> -j DROP` lines in `-S` output.
fn parse_rule_listing(output: &str, chain: &str) -> Vec<IpNet> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                ["-A", c, "-d", dest, "-j", "DROP"] if *c == chain => match dest.parse::<IpNet>() {
                    Ok(net) => Some(net.trunc()),
                    Err(_) => {
                        warn!("Ignoring rule with unparsable destination: {}", line);
                        None
                    }
                },
                _ => None,
            }
        })
        .collect()
}

/// Sum the pkts/bytes columns of DROP rules in `-L -v -n -x` output.
fn parse_counters(output: &str) -> FirewallStats {
    let mut stats = FirewallStats::default();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let [pkts, bytes, "DROP", ..] = fields.as_slice() {
            stats.packets_blocked += pkts.parse::<u64>().unwrap_or(0);
            stats.bytes_blocked += bytes.parse::<u64>().unwrap_or(0);
        }
    }
    stats
}
