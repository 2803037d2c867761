//! Firewall enforcement backends and the set synchronizer.
//!
//! A backend exposes the live members of its kernel sets keyed by
//! [`RangeKey`]. Each cycle the desired members are derived from a
//! [`DisjointRangeSet`], diffed against the live members, and only the
//! difference is applied.

mod iptables;
mod nftables;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

pub use iptables::IptablesBackend;
pub use nftables::NftablesBackend;

use crate::address::{AddrExt, Family};
use crate::aggregator::DisjointRangeSet;
use crate::cmd_abstraction::{args_to_strings, CommandExecutor, CommandOutput, RealCommandExecutor};
use crate::config::{Backend, Config};
use crate::error::AutobanError;
use crate::range::IpRange;
use crate::signal::ShutdownToken;

/// Exclusive upper bound of a kernel interval.
///
/// The successor of the all-ones address does not exist, so an interval that
/// runs to the top of its address space carries [`UpperBound::EndOfSpace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpperBound {
    Before(IpAddr),
    EndOfSpace,
}

/// Identity of a set member for diffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RangeKey {
    pub start: IpAddr,
    pub end: UpperBound,
}

/// One interval member of a kernel set: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirewallElement {
    pub start: IpAddr,
    pub end: UpperBound,
    pub family: Family,
}

impl FirewallElement {
    pub fn from_range(range: &IpRange) -> Self {
        let end = match range.end().successor() {
            Some(next) => UpperBound::Before(next),
            None => UpperBound::EndOfSpace,
        };
        Self {
            start: range.start(),
            end,
            family: range.family(),
        }
    }

    pub fn key(&self) -> RangeKey {
        RangeKey {
            start: self.start,
            end: self.end,
        }
    }

    /// The inclusive range this element blocks.
    pub fn to_range(&self) -> IpRange {
        let last = match self.end {
            UpperBound::Before(end) => end.predecessor().unwrap_or(self.start),
            UpperBound::EndOfSpace => self.family.last(),
        };
        IpRange::new(self.start, last).unwrap_or_else(|_| IpRange::single(self.start))
    }
}

/// Set members keyed by interval identity, ordered for stable output.
pub type MemberSet = BTreeMap<RangeKey, FirewallElement>;

/// Build a member set from ranges.
pub fn members_from_ranges<'a, I>(ranges: I) -> MemberSet
where
    I: IntoIterator<Item = &'a IpRange>,
{
    ranges
        .into_iter()
        .map(FirewallElement::from_range)
        .map(|el| (el.key(), el))
        .collect()
}

/// Desired interval members: one per disjoint range, reserved space clipped out.
pub fn interval_members(set: &DisjointRangeSet) -> MemberSet {
    members_from_ranges(set.without_reserved().iter())
}

/// Incremental changes that turn the live members into the desired ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub additions: Vec<FirewallElement>,
    pub deletions: Vec<FirewallElement>,
    /// Members present on both sides
    pub unchanged: usize,
}

impl SyncPlan {
    /// Diff by [`RangeKey`]. A member whose boundaries changed shows up as one
    /// deletion plus one addition.
    pub fn diff(live: &MemberSet, desired: &MemberSet) -> Self {
        let deletions = live
            .iter()
            .filter(|(key, _)| !desired.contains_key(key))
            .map(|(_, el)| *el)
            .collect();
        let additions = desired
            .iter()
            .filter(|(key, _)| !live.contains_key(key))
            .map(|(_, el)| *el)
            .collect();
        let unchanged = desired.keys().filter(|key| live.contains_key(key)).count();
        Self {
            additions,
            deletions,
            unchanged,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }

    /// Apply the plan to an in-memory member set (deletions first).
    pub fn apply_to(&self, members: &mut MemberSet) {
        for el in &self.deletions {
            members.remove(&el.key());
        }
        for el in &self.additions {
            members.insert(el.key(), *el);
        }
    }
}

/// Outcome of applying a [`SyncPlan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub deleted: usize,
    pub failed: usize,
    pub unchanged: usize,
    /// Elements not attempted because shutdown was requested
    pub skipped: usize,
}

/// Counters read back from the enforcing rules.
#[derive(Debug, Default, Clone)]
pub struct FirewallStats {
    pub packets_blocked: u64,
    pub bytes_blocked: u64,
}

/// A kernel enforcement mechanism that can be reconciled incrementally.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create whatever table, chain, sets, and rules are missing.
    /// Idempotent; safe to run every cycle.
    async fn ensure_ready(&self) -> Result<()>;

    /// Live members of the enforcing sets. Fails with
    /// [`AutobanError::KernelQuery`] when the kernel state cannot be read.
    async fn live_members(&self) -> Result<MemberSet>;

    /// Members this backend wants for `set`.
    fn desired_members(&self, set: &DisjointRangeSet) -> MemberSet {
        interval_members(set)
    }

    /// Apply deletions then additions, best effort.
    async fn apply(&self, plan: &SyncPlan) -> Result<SyncReport>;

    /// Remove everything this backend created.
    async fn remove(&self) -> Result<()>;

    /// Whether the enforcing structures currently exist.
    async fn is_active(&self) -> Result<bool>;

    async fn stats(&self) -> Result<FirewallStats>;

    async fn entry_count(&self) -> Result<usize> {
        Ok(self.live_members().await?.len())
    }
}

/// Detect an available backend, preferring nftables.
pub fn detect_backend<E: CommandExecutor>(executor: &E) -> Result<Backend> {
    let version = args_to_strings(&["--version"]);
    if executor.execute(nft_path(), &version).map(|o| o.success).unwrap_or(false) {
        return Ok(Backend::Nftables);
    }
    if executor.execute(iptables_path(), &version).map(|o| o.success).unwrap_or(false) {
        return Ok(Backend::Iptables);
    }
    Err(AutobanError::BackendNotAvailable("nft or iptables required".into()).into())
}

/// Create the configured backend. `shutdown` interrupts element-by-element
/// application between two elements.
pub fn create_backend(config: &Config, shutdown: ShutdownToken) -> Result<Arc<dyn FirewallBackend>> {
    let executor = Arc::new(RealCommandExecutor::new());
    let actual = match config.backend {
        Backend::Auto => detect_backend(executor.as_ref())?,
        other => other,
    };

    let backend: Arc<dyn FirewallBackend> = match actual {
        Backend::Iptables => Arc::new(
            IptablesBackend::new(executor, config.iptables.clone()).with_shutdown(shutdown),
        ),
        _ => Arc::new(
            NftablesBackend::new(executor, config.nftables.clone(), config.verdict)
                .with_shutdown(shutdown),
        ),
    };
    debug!("Using {} backend", backend.name());
    Ok(backend)
}

/// Run a tool on the blocking pool so kernel round-trips never stall the
/// async workers.
pub(crate) async fn run_blocking<E>(
    executor: &Arc<E>,
    program: &'static str,
    args: Vec<String>,
    stdin: Option<String>,
) -> Result<CommandOutput>
where
    E: CommandExecutor + 'static,
{
    let executor = Arc::clone(executor);
    tokio::task::spawn_blocking(move || match stdin {
        Some(input) => executor.execute_with_stdin(program, &args, &input),
        None => executor.execute(program, &args),
    })
    .await?
}

pub fn nft_path() -> &'static str {
    crate::cmd_abstraction::resolve_program("nft", &["/usr/sbin/nft", "/sbin/nft"])
}

pub fn iptables_path() -> &'static str {
    crate::cmd_abstraction::resolve_program("iptables", &["/usr/sbin/iptables", "/sbin/iptables"])
}

pub fn ip6tables_path() -> &'static str {
    crate::cmd_abstraction::resolve_program(
        "ip6tables",
        &["/usr/sbin/ip6tables", "/sbin/ip6tables"],
    )
}

/// Fail unless running with an effective uid of 0.
///
/// CAP_NET_ADMIN alone would be enough for the kernel, but checking the uid
/// covers the usual sudo/systemd setups.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(AutobanError::Permission(
            "modifying firewall sets requires root (or CAP_NET_ADMIN)".into(),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
pub mod mock {
    //! In-memory backend used by cycle tests.

    use super::*;
    use std::sync::Mutex;

    pub struct MockBackend {
        pub members: Mutex<MemberSet>,
        pub active: Mutex<bool>,
        pub ensure_calls: Mutex<usize>,
        pub fail_queries: Mutex<bool>,
        pub applied_plans: Mutex<Vec<SyncPlan>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self {
                members: Mutex::new(MemberSet::new()),
                active: Mutex::new(false),
                ensure_calls: Mutex::new(0),
                fail_queries: Mutex::new(false),
                applied_plans: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FirewallBackend for MockBackend {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn ensure_ready(&self) -> Result<()> {
            *self.ensure_calls.lock().unwrap() += 1;
            *self.active.lock().unwrap() = true;
            Ok(())
        }

        async fn live_members(&self) -> Result<MemberSet> {
            if *self.fail_queries.lock().unwrap() {
                return Err(AutobanError::KernelQuery("mock listing failed".into()).into());
            }
            Ok(self.members.lock().unwrap().clone())
        }

        async fn apply(&self, plan: &SyncPlan) -> Result<SyncReport> {
            plan.apply_to(&mut self.members.lock().unwrap());
            self.applied_plans.lock().unwrap().push(plan.clone());
            Ok(SyncReport {
                added: plan.additions.len(),
                deleted: plan.deletions.len(),
                unchanged: plan.unchanged,
                ..Default::default()
            })
        }

        async fn remove(&self) -> Result<()> {
            self.members.lock().unwrap().clear();
            *self.active.lock().unwrap() = false;
            Ok(())
        }

        async fn is_active(&self) -> Result<bool> {
            Ok(*self.active.lock().unwrap())
        }

        async fn stats(&self) -> Result<FirewallStats> {
            Ok(FirewallStats::default())
        }
    }
}
