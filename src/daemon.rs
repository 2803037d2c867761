//! The synchronization cycle and the long-running loops driving it.
//!
//! One cycle: collect tokens from every source, merge them, make sure the
//! kernel structures exist, read the live members once, diff, and apply the
//! difference. The sync loop runs cycles back to back on a timer, never
//! overlapping. The feed loop refreshes the [`FeedCache`] on its own timer;
//! the two only share the cache's atomically swapped snapshot.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::{merge_tokens, DisjointRangeSet};
use crate::enforcer::{FirewallBackend, SyncPlan, SyncReport};
use crate::fetcher::{FeedCache, FeedFetcher};
use crate::signal::ShutdownToken;
use crate::sources::{collect_tokens, EntrySource};
use crate::utils::format_count;

/// State carried from one cycle to the next.
#[derive(Debug, Default)]
pub struct SyncContext {
    /// Kernel table, chain, sets and rules were created or verified
    pub initialized: bool,
    pub cycles: u64,
    pub last_report: Option<SyncReport>,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// What one cycle computed and, unless it was a dry run, what it applied.
#[derive(Debug)]
pub struct CycleOutcome {
    pub desired: DisjointRangeSet,
    pub plan: SyncPlan,
    pub report: Option<SyncReport>,
}

/// Run one synchronization cycle.
///
/// A failure to read live kernel state aborts the cycle before anything is
/// applied and clears `ctx.initialized`, so the next cycle re-creates
/// whatever went missing. `dry_run` computes the plan without touching the
/// kernel beyond reading it.
pub async fn run_cycle(
    ctx: &mut SyncContext,
    sources: &[Arc<dyn EntrySource>],
    backend: &dyn FirewallBackend,
    dry_run: bool,
) -> Result<CycleOutcome> {
    ctx.cycles += 1;

    let tokens = collect_tokens(sources).await;
    let desired = merge_tokens(&tokens);
    debug!(
        "Cycle {}: {} tokens merged into {} ranges",
        ctx.cycles,
        tokens.len(),
        desired.len()
    );

    if !dry_run {
        if let Err(e) = ensure_infrastructure(ctx, backend).await {
            ctx.initialized = false;
            return Err(e);
        }
    }

    let live = match backend.live_members().await {
        Ok(live) => live,
        Err(e) => {
            ctx.initialized = false;
            return Err(e);
        }
    };

    let plan = SyncPlan::diff(&live, &backend.desired_members(&desired));
    if dry_run {
        return Ok(CycleOutcome {
            desired,
            plan,
            report: None,
        });
    }

    let report = backend.apply(&plan).await?;
    if report.failed > 0 || report.skipped > 0 {
        warn!(
            added = report.added,
            deleted = report.deleted,
            unchanged = report.unchanged,
            failed = report.failed,
            skipped = report.skipped,
            "Partial sync via {}",
            backend.name()
        );
    } else {
        info!(
            added = report.added,
            deleted = report.deleted,
            "Sync via {} complete, {} members unchanged",
            backend.name(),
            format_count(report.unchanged)
        );
    }
    ctx.last_report = Some(report.clone());

    Ok(CycleOutcome {
        desired,
        plan,
        report: Some(report),
    })
}

/// Create-if-absent on the first cycle, and again whenever the table vanished.
async fn ensure_infrastructure(ctx: &mut SyncContext, backend: &dyn FirewallBackend) -> Result<()> {
    if ctx.initialized {
        if backend.is_active().await? {
            return Ok(());
        }
        warn!("{} structures disappeared, re-creating them", backend.name());
    }
    backend.ensure_ready().await?;
    ctx.initialized = true;
    Ok(())
}

/// Feed refresh wiring for the daemon.
pub struct FeedTask {
    pub cache: Arc<FeedCache>,
    pub fetcher: FeedFetcher,
    pub urls: Vec<String>,
    pub period: Duration,
}

impl FeedTask {
    /// Download every feed once. Failures keep the cached data.
    pub async fn refresh_once(&self) {
        match self.cache.refresh(&self.fetcher, &self.urls).await {
            Ok(n) => debug!("Refreshed {}/{} feeds", n, self.urls.len()),
            Err(e) => warn!("Feed refresh failed, keeping cached data: {:#}", e),
        }
    }

    /// Refresh every `period`, starting one period from now, until shutdown.
    /// The caller does the initial refresh before the first sync cycle.
    pub async fn run(self, shutdown: ShutdownToken) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_once().await,
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Feed refresh loop stopped");
    }
}

/// Run cycles every `period` until shutdown. Cycle errors are logged and
/// retried on the next tick.
pub async fn sync_loop(
    sources: Vec<Arc<dyn EntrySource>>,
    backend: Arc<dyn FirewallBackend>,
    period: Duration,
    shutdown: ShutdownToken,
) -> SyncContext {
    let mut ctx = SyncContext::new();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_cycle(&mut ctx, &sources, backend.as_ref(), false).await {
                    error!("Sync cycle {} failed: {:#}", ctx.cycles, e);
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!("Sync loop stopped after {} cycles", ctx.cycles);
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::mock::MockBackend;
    use crate::enforcer::interval_members;
    use crate::sources::StaticSource;

    fn static_sources(tokens: &[&str]) -> Vec<Arc<dyn EntrySource>> {
        vec![Arc::new(StaticSource::new(
            tokens.iter().map(|s| s.to_string()).collect(),
        ))]
    }

    #[tokio::test]
    async fn test_first_cycle_initializes_and_adds() {
        let backend = MockBackend::new();
        let mut ctx = SyncContext::new();
        let sources = static_sources(&["10.0.0.5", "8.8.8.8", "8.8.8.9", "2001:db8::1"]);

        let outcome = run_cycle(&mut ctx, &sources, &backend, false).await.unwrap();
        assert!(ctx.initialized);
        assert_eq!(*backend.ensure_calls.lock().unwrap(), 1);
        // 10.0.0.5 is private and never enforced
        assert_eq!(outcome.plan.additions.len(), 2);
        assert_eq!(outcome.report.unwrap().added, 2);
        assert_eq!(ctx.cycles, 1);
    }

    #[tokio::test]
    async fn test_second_cycle_is_noop() {
        let backend = MockBackend::new();
        let mut ctx = SyncContext::new();
        let sources = static_sources(&["8.8.8.8", "1.1.1.0/24"]);

        run_cycle(&mut ctx, &sources, &backend, false).await.unwrap();
        let outcome = run_cycle(&mut ctx, &sources, &backend, false).await.unwrap();
        assert!(outcome.plan.is_empty());
        assert_eq!(outcome.plan.unchanged, 2);
        assert_eq!(*backend.ensure_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_boundary_change_is_one_delete_one_add() {
        let backend = MockBackend::new();
        let mut ctx = SyncContext::new();

        run_cycle(&mut ctx, &static_sources(&["20.0.0.0/24"]), &backend, false)
            .await
            .unwrap();
        let outcome = run_cycle(&mut ctx, &static_sources(&["20.0.0.0/25"]), &backend, false)
            .await
            .unwrap();
        let report = outcome.report.unwrap();
        assert_eq!((report.added, report.deleted), (1, 1));
        assert_eq!(
            *backend.members.lock().unwrap(),
            interval_members(&merge_tokens(["20.0.0.0/25"]))
        );
    }

    #[tokio::test]
    async fn test_query_failure_aborts_and_resets() {
        let backend = MockBackend::new();
        let mut ctx = SyncContext::new();
        let sources = static_sources(&["8.8.8.8"]);
        run_cycle(&mut ctx, &sources, &backend, false).await.unwrap();

        *backend.fail_queries.lock().unwrap() = true;
        assert!(run_cycle(&mut ctx, &sources, &backend, false).await.is_err());
        assert!(!ctx.initialized);
        assert_eq!(backend.applied_plans.lock().unwrap().len(), 1);

        // Next tick recovers and re-runs the create step
        *backend.fail_queries.lock().unwrap() = false;
        run_cycle(&mut ctx, &sources, &backend, false).await.unwrap();
        assert!(ctx.initialized);
        assert_eq!(*backend.ensure_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_vanished_table_is_recreated() {
        let backend = MockBackend::new();
        let mut ctx = SyncContext::new();
        let sources = static_sources(&["8.8.8.8"]);
        run_cycle(&mut ctx, &sources, &backend, false).await.unwrap();

        // Administrator flushed the ruleset
        backend.remove().await.unwrap();
        let outcome = run_cycle(&mut ctx, &sources, &backend, false).await.unwrap();
        assert_eq!(*backend.ensure_calls.lock().unwrap(), 2);
        assert_eq!(outcome.plan.additions.len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let backend = MockBackend::new();
        let mut ctx = SyncContext::new();
        let outcome = run_cycle(&mut ctx, &static_sources(&["8.8.8.8"]), &backend, true)
            .await
            .unwrap();
        assert_eq!(outcome.plan.additions.len(), 1);
        assert!(outcome.report.is_none());
        assert!(!ctx.initialized);
        assert_eq!(*backend.ensure_calls.lock().unwrap(), 0);
        assert!(backend.members.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_sources_remove_everything() {
        let backend = MockBackend::new();
        let mut ctx = SyncContext::new();
        run_cycle(&mut ctx, &static_sources(&["8.8.8.8", "9.9.9.9"]), &backend, false)
            .await
            .unwrap();
        let outcome = run_cycle(&mut ctx, &[], &backend, false).await.unwrap();
        assert_eq!(outcome.report.unwrap().deleted, 2);
        assert!(backend.members.lock().unwrap().is_empty());
    }

    fn assert_send<T: Send>(_: &T) {}

    fn feed_task(cache: Arc<FeedCache>, period: Duration) -> FeedTask {
        FeedTask {
            cache,
            fetcher: FeedFetcher::new().unwrap(),
            urls: Vec::new(),
            period,
        }
    }

    #[tokio::test]
    async fn test_feed_task_future_is_send() {
        let task = feed_task(Arc::new(FeedCache::new()), Duration::from_secs(60));
        let fut = task.run(ShutdownToken::new());
        assert_send(&fut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_task_waits_one_period_before_refreshing() {
        let cache = Arc::new(FeedCache::new());
        let shutdown = ShutdownToken::new();
        let handle = tokio::spawn(feed_task(cache.clone(), Duration::from_secs(60)).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(cache.snapshot().fetched_at.is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(cache.snapshot().fetched_at.is_some());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_once_swaps_snapshot() {
        let cache = Arc::new(FeedCache::new());
        feed_task(cache.clone(), Duration::from_secs(60)).refresh_once().await;
        assert!(cache.snapshot().fetched_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_loop_stops_on_shutdown() {
        let backend: Arc<MockBackend> = Arc::new(MockBackend::new());
        let shutdown = ShutdownToken::new();
        let handle = tokio::spawn(sync_loop(
            static_sources(&["8.8.8.8"]),
            backend.clone(),
            Duration::from_secs(60),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        let ctx = handle.await.unwrap();
        // Ticks at 0s, 60s, 120s
        assert_eq!(ctx.cycles, 3);
        assert_eq!(backend.members.lock().unwrap().len(), 1);
    }
}
