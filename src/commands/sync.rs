//! One-shot synchronization command.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use crate::commands::{feed_cache, load_config};
use crate::daemon::{run_cycle, CycleOutcome, SyncContext};
use crate::enforcer::{check_root, create_backend, SyncPlan};
use crate::fetcher::FeedFetcher;
use crate::lock::LockGuard;
use crate::signal::{install_signal_handlers, ShutdownToken};
use crate::sources::sources_from_config;
use crate::utils::format_count;

/// Run the sync command
pub async fn run(dry_run: bool, config_path: &Path) -> Result<()> {
    if !dry_run {
        check_root()?;
    }
    let config = load_config(config_path)?;
    let _lock = if dry_run {
        None
    } else {
        Some(LockGuard::acquire(&config.lock_file)?)
    };

    let shutdown = ShutdownToken::new();
    install_signal_handlers(shutdown.clone());

    // A dry run reads the cache file but never rewrites it
    let feed = feed_cache(&config, !dry_run);
    if let Some(cache) = &feed {
        let fetcher = FeedFetcher::new()?;
        if let Err(e) = cache.refresh(&fetcher, &config.feed.urls).await {
            warn!("Feed refresh failed, using cached data: {:#}", e);
        }
    }

    let sources = sources_from_config(&config, feed);
    if sources.is_empty() {
        warn!("No sources configured; every enforced entry will be removed");
    }

    let backend = create_backend(&config, shutdown)?;
    let mut ctx = SyncContext::new();
    let outcome = run_cycle(&mut ctx, &sources, backend.as_ref(), dry_run).await?;

    if dry_run {
        print_plan(&outcome.plan);
    } else {
        print_summary(&outcome);
    }
    Ok(())
}

fn print_plan(plan: &SyncPlan) {
    println!();
    println!("[DRY-RUN] Planned changes:");
    for el in &plan.deletions {
        println!("  - {}", el.to_range());
    }
    for el in &plan.additions {
        println!("  + {}", el.to_range());
    }
    println!(
        "{} to delete, {} to add, {} unchanged",
        plan.deletions.len(),
        plan.additions.len(),
        format_count(plan.unchanged)
    );
}

fn print_summary(outcome: &CycleOutcome) {
    let Some(report) = &outcome.report else {
        return;
    };
    info!(
        "{} ranges covering {} addresses desired",
        format_count(outcome.desired.len()),
        outcome.desired.address_count()
    );
    let status = if report.failed == 0 { "[OK]" } else { "[WARN]" };
    println!(
        "{} {} added, {} deleted, {} unchanged, {} failed",
        status, report.added, report.deleted, report.unchanged, report.failed
    );
}
