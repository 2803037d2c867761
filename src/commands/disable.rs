//! Disable command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::commands::load_config;
use crate::enforcer::{check_root, create_backend};
use crate::lock::LockGuard;
use crate::signal::ShutdownToken;

/// Run the disable command
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;
    let config = load_config(config_path)?;
    let _lock = LockGuard::acquire(&config.lock_file)?;

    info!("Removing autoban firewall structures...");
    let backend = create_backend(&config, ShutdownToken::new())?;
    backend.remove().await?;

    println!("[OK] autoban disabled ({} structures removed, config preserved)", backend.name());
    Ok(())
}
