//! Daemon command: periodic synchronization until SIGINT/SIGTERM.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::commands::{feed_cache, load_config};
use crate::daemon::{sync_loop, FeedTask};
use crate::enforcer::{check_root, create_backend};
use crate::fetcher::FeedFetcher;
use crate::lock::LockGuard;
use crate::signal::{install_signal_handlers, ShutdownToken};
use crate::sources::sources_from_config;

/// Run the daemon
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;
    let config = load_config(config_path)?;
    let _lock = LockGuard::acquire(&config.lock_file)?;

    let shutdown = ShutdownToken::new();
    install_signal_handlers(shutdown.clone());

    let feed = feed_cache(&config, true);
    let feed_handle = match &feed {
        Some(cache) => {
            let task = FeedTask {
                cache: cache.clone(),
                fetcher: FeedFetcher::new()?,
                urls: config.feed.urls.clone(),
                period: config.feed_refresh_period(),
            };
            // The first sync cycle sees fresh feed data
            task.refresh_once().await;
            Some(tokio::spawn(task.run(shutdown.clone())))
        }
        None => None,
    };

    let sources = sources_from_config(&config, feed);
    let backend = create_backend(&config, shutdown.clone())?;
    info!(
        "autoban started: {} sources, {} backend, syncing every {}",
        sources.len(),
        backend.name(),
        config.sync_interval
    );

    let ctx = sync_loop(sources, backend, config.sync_period(), shutdown).await;

    if let Some(handle) = feed_handle {
        handle.await?;
    }
    info!("autoban stopped after {} cycles", ctx.cycles);
    Ok(())
}
