//! Reputation feed download and last-known-good cache.
//!
//! [`FeedFetcher`] downloads the configured lists. [`FeedCache`] keeps the
//! tokens of the last successful download of each list behind an
//! [`ArcSwap`], so the sync cycle always reads a complete snapshot and a
//! failed refresh never throws away data that was already fetched.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::AutobanError;
use crate::range::tokens_from_text;
use crate::utils::{format_count, retry_with_backoff, write_atomic};

const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 2000;

/// Maximum size of one feed (P2P-format lists run to a few tens of MB)
const MAX_FEED_SIZE: usize = 64 * 1024 * 1024;

/// Maximum concurrent HTTP requests
const MAX_CONCURRENT_REQUESTS: usize = 4;

/// HTTP client for fetching feeds
#[derive(Clone)]
pub struct FeedFetcher {
    client: Client,
    max_size: usize,
    retry_delay: Duration,
}

impl FeedFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .user_agent(format!("autoban/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            max_size: MAX_FEED_SIZE,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Override the per-feed size limit.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Fetch one feed and extract its entry tokens.
    pub async fn fetch(&self, url: &str) -> Result<Vec<String>> {
        let body = retry_with_backoff(MAX_RETRIES, self.retry_delay, || self.fetch_once(url))
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;
        let tokens = tokens_from_text(&body);
        info!("Fetched {} - {} entries", url, format_count(tokens.len()));
        Ok(tokens)
    }

    /// Fetch several feeds concurrently; one result per URL, in completion order.
    pub async fn fetch_all(&self, urls: &[String]) -> Vec<(String, Result<Vec<String>>)> {
        // Owned futures keep the returned future Send for tokio::spawn
        let fetches: Vec<BoxFuture<'static, (String, Result<Vec<String>>)>> = urls
            .iter()
            .cloned()
            .map(|url| {
                let fetcher = self.clone();
                async move {
                    let result = fetcher.fetch(&url).await;
                    (url, result)
                }
                .boxed()
            })
            .collect();
        stream::iter(fetches)
            .buffer_unordered(MAX_CONCURRENT_REQUESTS)
            .collect()
            .await
    }

    async fn fetch_once(&self, url: &str) -> Result<String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AutobanError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AutobanError::Network(format!("HTTP {} from {}", response.status(), url)).into());
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_size {
                anyhow::bail!("Response too large: {} bytes (max: {} bytes)", length, self.max_size);
            }
        }

        // Content-Length can be absent or wrong, so enforce the limit while reading
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AutobanError::Network(e.to_string()))?
        {
            if body.len() + chunk.len() > self.max_size {
                anyhow::bail!("Downloaded content exceeds {} bytes", self.max_size);
            }
            body.extend_from_slice(&chunk);
        }

        debug!("Downloaded {} bytes from {}", body.len(), url);
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Tokens of every feed as of its last successful download.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    /// Feed URL to tokens
    pub sources: BTreeMap<String, Vec<String>>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl FeedSnapshot {
    pub fn entries(&self) -> impl Iterator<Item = &String> {
        self.sources.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.sources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Atomically swapped feed snapshot, optionally persisted to disk.
pub struct FeedCache {
    current: ArcSwap<FeedSnapshot>,
    cache_path: Option<PathBuf>,
}

impl FeedCache {
    /// In-memory cache starting empty.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(FeedSnapshot::default()),
            cache_path: None,
        }
    }

    /// Cache persisted at `path`, seeded from it when it can be read.
    pub fn persistent(path: &Path) -> Self {
        Self {
            current: ArcSwap::from_pointee(seed_snapshot(path)),
            cache_path: Some(path.to_path_buf()),
        }
    }

    /// Cache seeded from `path` that never writes back to it.
    pub fn read_only(path: &Path) -> Self {
        Self {
            current: ArcSwap::from_pointee(seed_snapshot(path)),
            cache_path: None,
        }
    }

    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        self.current.load_full()
    }

    /// Fold fetch results into a new snapshot.
    ///
    /// Feeds that failed keep their previous tokens; feeds no longer in
    /// `urls` are dropped. Nothing is swapped when every fetch failed.
    /// Returns the number of feeds refreshed.
    pub fn apply_results(
        &self,
        urls: &[String],
        results: Vec<(String, Result<Vec<String>>)>,
    ) -> Result<usize> {
        let previous = self.snapshot();
        let mut sources: BTreeMap<String, Vec<String>> = previous
            .sources
            .iter()
            .filter(|(url, _)| urls.contains(url))
            .map(|(url, tokens)| (url.clone(), tokens.clone()))
            .collect();

        let mut refreshed = 0usize;
        let mut last_error = None;
        for (url, result) in results {
            match result {
                Ok(tokens) => {
                    sources.insert(url, tokens);
                    refreshed += 1;
                }
                Err(e) => {
                    warn!("Keeping previous data for {}: {:#}", url, e);
                    last_error = Some(e);
                }
            }
        }

        if refreshed == 0 {
            if let Some(e) = last_error {
                return Err(AutobanError::Network(format!("feed refresh failed: {:#}", e)).into());
            }
        }

        let snapshot = FeedSnapshot {
            sources,
            fetched_at: Some(Utc::now()),
        };
        if let Some(path) = &self.cache_path {
            if let Err(e) = persist_snapshot(path, &snapshot) {
                warn!("Failed to persist feed cache {:?}: {:#}", path, e);
            }
        }
        info!("Feed snapshot now holds {} entries", format_count(snapshot.len()));
        self.current.store(Arc::new(snapshot));
        Ok(refreshed)
    }

    /// Download every feed and swap in the result.
    pub async fn refresh(&self, fetcher: &FeedFetcher, urls: &[String]) -> Result<usize> {
        let results = fetcher.fetch_all(urls).await;
        self.apply_results(urls, results)
    }
}

impl Default for FeedCache {
    fn default() -> Self {
        Self::new()
    }
}

fn seed_snapshot(path: &Path) -> FeedSnapshot {
    match load_snapshot(path) {
        Ok(Some(snapshot)) => {
            info!("Loaded {} cached feed entries from {:?}", snapshot.len(), path);
            snapshot
        }
        Ok(None) => FeedSnapshot::default(),
        Err(e) => {
            warn!("Ignoring unreadable feed cache {:?}: {:#}", path, e);
            FeedSnapshot::default()
        }
    }
}

fn load_snapshot(path: &Path) -> Result<Option<FeedSnapshot>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
    };
    let snapshot = serde_json::from_str(&content).context("Failed to parse feed cache")?;
    Ok(Some(snapshot))
}

fn persist_snapshot(path: &Path, snapshot: &FeedSnapshot) -> Result<()> {
    let content = serde_json::to_vec(snapshot).context("Failed to serialize feed cache")?;
    write_atomic(path, &content)
}
