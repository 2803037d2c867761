//! Where the addresses to block come from.
//!
//! Each source yields raw entry tokens; parsing and merging happen later in
//! the cycle so that one malformed token only costs that token.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::fetcher::FeedCache;
use crate::range::tokens_from_text;

#[async_trait]
pub trait EntrySource: Send + Sync {
    fn name(&self) -> String;

    /// Current tokens of this source.
    async fn entries(&self) -> Result<Vec<String>>;
}

/// Token file maintained by another process (one entry per line).
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EntrySource for FileSource {
    fn name(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn entries(&self) -> Result<Vec<String>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        Ok(tokens_from_text(&content))
    }
}

/// Entries listed in the configuration.
pub struct StaticSource {
    entries: Vec<String>,
}

impl StaticSource {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl EntrySource for StaticSource {
    fn name(&self) -> String {
        "static entries".to_string()
    }

    async fn entries(&self) -> Result<Vec<String>> {
        Ok(self.entries.clone())
    }
}

#[async_trait]
impl EntrySource for FeedCache {
    fn name(&self) -> String {
        "feed cache".to_string()
    }

    async fn entries(&self) -> Result<Vec<String>> {
        Ok(self.snapshot().entries().cloned().collect())
    }
}

/// Sources described by `config`, plus the feed cache when the feed is enabled.
pub fn sources_from_config(config: &Config, feed: Option<Arc<FeedCache>>) -> Vec<Arc<dyn EntrySource>> {
    let mut sources: Vec<Arc<dyn EntrySource>> = Vec::new();
    if !config.sources.entries.is_empty() {
        sources.push(Arc::new(StaticSource::new(config.sources.entries.clone())));
    }
    for path in &config.sources.files {
        sources.push(Arc::new(FileSource::new(path.clone())));
    }
    if let Some(cache) = feed {
        sources.push(cache);
    }
    sources
}

/// Concatenate the tokens of every source. A failing source is logged and
/// skipped for this cycle.
pub async fn collect_tokens(sources: &[Arc<dyn EntrySource>]) -> Vec<String> {
    let mut tokens = Vec::new();
    for source in sources {
        match source.entries().await {
            Ok(entries) => {
                debug!("{} yielded {} tokens", source.name(), entries.len());
                tokens.extend(entries);
            }
            Err(e) => warn!("Skipping {} this cycle: {:#}", source.name(), e),
        }
    }
    tokens
}
