//! nftables backend: one `inet` table holding an interval set per family.
//!
//! Live state is read with `nft -j` and parsed from JSON. Mutations are
//! submitted as `nft -f -` scripts, which the kernel commits as a single
//! transaction.

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    nft_path, run_blocking, FirewallBackend, FirewallElement, FirewallStats, MemberSet, SyncPlan,
    SyncReport,
};
use crate::address::{AddrExt, Family};
use crate::cmd_abstraction::{args_to_strings, CommandExecutor, RealCommandExecutor};
use crate::config::{NftablesConfig, Verdict};
use crate::error::AutobanError;
use crate::range::{Entry, IpRange};
use crate::signal::ShutdownToken;

/// What `nft -j list table` told us about our table.
#[derive(Debug, Default)]
struct TableSnapshot {
    chains: BTreeSet<String>,
    sets: BTreeMap<String, Vec<IpRange>>,
    /// Set names referenced (`@name`) by any rule in the table
    referenced_sets: BTreeSet<String>,
    stats: FirewallStats,
}

pub struct NftablesBackend<E: CommandExecutor = RealCommandExecutor> {
    executor: Arc<E>,
    config: NftablesConfig,
    verdict: Verdict,
    shutdown: ShutdownToken,
}

impl<E: CommandExecutor + 'static> NftablesBackend<E> {
    pub fn new(executor: Arc<E>, config: NftablesConfig, verdict: Verdict) -> Self {
        Self {
            executor,
            config,
            verdict,
            shutdown: ShutdownToken::new(),
        }
    }

    /// Stop per-element fallback application once `token` is cancelled.
    pub fn with_shutdown(mut self, token: ShutdownToken) -> Self {
        self.shutdown = token;
        self
    }

    fn set_name(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.config.set_v4,
            Family::V6 => &self.config.set_v6,
        }
    }

    fn table_spec(&self) -> String {
        format!("inet {}", self.config.table)
    }

    /// `None` when the table does not exist.
    async fn query_table(&self) -> Result<Option<TableSnapshot>> {
        let args = args_to_strings(&["-j", "list", "table", "inet", &self.config.table]);
        let output = run_blocking(&self.executor, nft_path(), args, None)
            .await
            .map_err(|e| AutobanError::KernelQuery(e.to_string()))?;

        if !output.success {
            if output.stderr.contains("No such file or directory") {
                return Ok(None);
            }
            return Err(AutobanError::KernelQuery(format!(
                "nft list table {} failed: {}",
                self.table_spec(),
                output.stderr.trim()
            ))
            .into());
        }

        parse_table_json(&output.stdout).map(Some)
    }

    /// Script creating whatever part of the infrastructure is missing.
    fn ensure_script(&self, snapshot: Option<&TableSnapshot>) -> String {
        let table = self.table_spec();
        let chain = &self.config.chain;
        let mut script = String::new();

        if snapshot.is_none() {
            script.push_str(&format!("add table {}\n", table));
        }
        if !snapshot.is_some_and(|s| s.chains.contains(chain)) {
            script.push_str(&format!(
                "add chain {} {} {{ type filter hook prerouting priority filter; policy accept; }}\n",
                table, chain
            ));
        }

        for family in [Family::V4, Family::V6] {
            let set = self.set_name(family);
            if !snapshot.is_some_and(|s| s.sets.contains_key(set)) {
                script.push_str(&format!(
                    "add set {} {} {{ type {}; flags interval; auto-merge; counter; }}\n",
                    table,
                    set,
                    set_type(family)
                ));
            }
            if !snapshot.is_some_and(|s| s.referenced_sets.contains(set)) {
                let verdict = verdict_text(self.verdict, family);
                for field in ["saddr", "daddr"] {
                    script.push_str(&format!(
                        "add rule {} {} {} {} @{} counter {}\n",
                        table,
                        chain,
                        payload_protocol(family),
                        field,
                        set,
                        verdict
                    ));
                }
            }
        }
        script
    }

    /// All deletions, then all additions, as one transaction.
    fn batch_script(&self, plan: &SyncPlan) -> String {
        let mut script = String::new();
        for (verb, elements) in [("delete", &plan.deletions), ("add", &plan.additions)] {
            for family in [Family::V4, Family::V6] {
                let items: Vec<String> = elements
                    .iter()
                    .filter(|el| el.family == family)
                    .map(element_text)
                    .collect();
                if !items.is_empty() {
                    script.push_str(&format!(
                        "{} element {} {} {{ {} }}\n",
                        verb,
                        self.table_spec(),
                        self.set_name(family),
                        items.join(", ")
                    ));
                }
            }
        }
        script
    }

    fn element_script(&self, verb: &str, el: &FirewallElement) -> String {
        format!(
            "{} element {} {} {{ {} }}\n",
            verb,
            self.table_spec(),
            self.set_name(el.family),
            element_text(el)
        )
    }

    async fn exec_script(&self, script: String) -> Result<()> {
        debug!("Executing nft script:\n{}", script);
        let args = args_to_strings(&["-f", "-"]);
        let output = run_blocking(&self.executor, nft_path(), args, Some(script)).await?;
        if !output.success {
            return Err(AutobanError::KernelApply(format!("nft failed: {}", output.stderr.trim())).into());
        }
        Ok(())
    }

    /// Re-submit each element on its own after a rejected batch.
    async fn apply_individually(&self, plan: &SyncPlan, report: &mut SyncReport) {
        let ops = plan
            .deletions
            .iter()
            .map(|el| ("delete", el))
            .chain(plan.additions.iter().map(|el| ("add", el)));

        for (verb, el) in ops {
            if self.shutdown.is_cancelled() {
                report.skipped += 1;
                continue;
            }
            match self.exec_script(self.element_script(verb, el)).await {
                Ok(()) if verb == "delete" => report.deleted += 1,
                Ok(()) => report.added += 1,
                Err(e) => {
                    warn!("Failed to {} element {}: {}", verb, element_text(el), e);
                    report.failed += 1;
                }
            }
        }
    }
}

#[async_trait]
impl<E: CommandExecutor + 'static> FirewallBackend for NftablesBackend<E> {
    fn name(&self) -> &'static str {
        "nftables"
    }

    async fn ensure_ready(&self) -> Result<()> {
        let snapshot = self.query_table().await?;
        let script = self.ensure_script(snapshot.as_ref());
        if script.is_empty() {
            debug!("nftables table {} already complete", self.table_spec());
            return Ok(());
        }
        self.exec_script(script).await?;
        info!(
            "Initialized nftables table {} (chain {}, sets {}/{})",
            self.table_spec(),
            self.config.chain,
            self.config.set_v4,
            self.config.set_v6
        );
        Ok(())
    }

    async fn live_members(&self) -> Result<MemberSet> {
        let Some(snapshot) = self.query_table().await? else {
            return Ok(MemberSet::new());
        };

        let mut members = MemberSet::new();
        for family in [Family::V4, Family::V6] {
            let Some(ranges) = snapshot.sets.get(self.set_name(family)) else {
                continue;
            };
            for range in ranges {
                if range.family() != family {
                    warn!("Ignoring {} member {} of set {}", range.family(), range, self.set_name(family));
                    continue;
                }
                let el = FirewallElement::from_range(range);
                members.insert(el.key(), el);
            }
        }
        Ok(members)
    }

    async fn apply(&self, plan: &SyncPlan) -> Result<SyncReport> {
        let mut report = SyncReport {
            unchanged: plan.unchanged,
            ..Default::default()
        };
        if plan.is_empty() {
            return Ok(report);
        }

        match self.exec_script(self.batch_script(plan)).await {
            Ok(()) => {
                report.deleted = plan.deletions.len();
                report.added = plan.additions.len();
            }
            Err(e) => {
                warn!("Batch update rejected ({}), retrying element by element", e);
                self.apply_individually(plan, &mut report).await;
            }
        }
        Ok(report)
    }

    async fn remove(&self) -> Result<()> {
        if self.query_table().await?.is_none() {
            debug!("nftables table {} not present", self.table_spec());
            return Ok(());
        }
        self.exec_script(format!("delete table {}\n", self.table_spec())).await?;
        info!("Removed nftables table {}", self.table_spec());
        Ok(())
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(self.query_table().await?.is_some_and(|s| {
            s.chains.contains(&self.config.chain)
                && s.sets.contains_key(&self.config.set_v4)
                && s.sets.contains_key(&self.config.set_v6)
        }))
    }

    async fn stats(&self) -> Result<FirewallStats> {
        Ok(self.query_table().await?.map(|s| s.stats).unwrap_or_default())
    }
}

fn set_type(family: Family) -> &'static str {
    match family {
        Family::V4 => "ipv4_addr",
        Family::V6 => "ipv6_addr",
    }
}

fn payload_protocol(family: Family) -> &'static str {
    match family {
        Family::V4 => "ip",
        Family::V6 => "ip6",
    }
}

fn verdict_text(verdict: Verdict, family: Family) -> &'static str {
    match (verdict, family) {
        (Verdict::Drop, _) => "drop",
        (Verdict::Reject, Family::V4) => "reject with icmp type net-unreachable",
        (Verdict::Reject, Family::V6) => "reject with icmpv6 type no-route",
    }
}

/// nft element syntax: a bare address or `start-end`.
fn element_text(el: &FirewallElement) -> String {
    let range = el.to_range();
    if range.is_single() {
        range.start().to_string()
    } else {
        range.to_string()
    }
}

fn parse_table_json(json: &str) -> Result<TableSnapshot> {
    let root: Value = serde_json::from_str(json)
        .map_err(|e| AutobanError::KernelQuery(format!("invalid nft JSON output: {}", e)))?;
    let objects = root
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| AutobanError::KernelQuery("nft JSON output lacks the nftables array".into()))?;

    let mut snapshot = TableSnapshot::default();
    for object in objects {
        if let Some(chain) = object.get("chain") {
            if let Some(name) = chain.get("name").and_then(Value::as_str) {
                snapshot.chains.insert(name.to_string());
            }
        } else if let Some(set) = object.get("set") {
            let Some(name) = set.get("name").and_then(Value::as_str) else {
                continue;
            };
            let members = set
                .get("elem")
                .and_then(Value::as_array)
                .map(|elems| {
                    elems
                        .iter()
                        .filter_map(|v| {
                            let parsed = parse_element(v);
                            if parsed.is_none() {
                                warn!("Unrecognized element in set {}: {}", name, v);
                            }
                            parsed
                        })
                        .collect()
                })
                .unwrap_or_default();
            snapshot.sets.insert(name.to_string(), members);
        } else if let Some(expr) = object.get("rule").and_then(|r| r.get("expr")) {
            collect_rule_info(expr, &mut snapshot);
        }
    }
    Ok(snapshot)
}

/// One set element: `"1.2.3.4"`, `{"prefix": ..}`, `{"range": [a, b]}`, or
/// the `{"elem": {"val": ..}}` wrapper used when elements carry counters.
fn parse_element(value: &Value) -> Option<IpRange> {
    match value {
        Value::String(s) => s.parse::<Entry>().ok().map(|e| e.as_range()),
        Value::Object(map) => {
            if let Some(inner) = map.get("elem") {
                return parse_element(inner.get("val")?);
            }
            if let Some(prefix) = map.get("prefix") {
                let addr: IpAddr = prefix.get("addr")?.as_str()?.parse().ok()?;
                let len = u8::try_from(prefix.get("len")?.as_u64()?).ok()?;
                return IpNet::new(addr, len).ok().map(|net| IpRange::from(net.trunc()));
            }
            if let Some(bounds) = map.get("range").and_then(Value::as_array) {
                let [low, high] = bounds.as_slice() else {
                    return None;
                };
                let start = parse_element(low)?.start();
                let end = parse_element(high)?.end();
                if start.family() != end.family() {
                    return None;
                }
                return IpRange::new(start, end).ok();
            }
            None
        }
        _ => None,
    }
}

/// Walk a rule's expression tree for `@set` references and counters.
fn collect_rule_info(value: &Value, snapshot: &mut TableSnapshot) {
    match value {
        Value::String(s) => {
            if let Some(set) = s.strip_prefix('@') {
                snapshot.referenced_sets.insert(set.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_rule_info(v, snapshot)),
        Value::Object(map) => {
            if let Some(counter) = map.get("counter") {
                snapshot.stats.packets_blocked += counter.get("packets").and_then(Value::as_u64).unwrap_or(0);
                snapshot.stats.bytes_blocked += counter.get("bytes").and_then(Value::as_u64).unwrap_or(0);
            }
            map.values().for_each(|v| collect_rule_info(v, snapshot));
        }
        _ => {}
    }
}
