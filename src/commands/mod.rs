//! CLI command implementations.

pub mod disable;
pub mod merge;
pub mod run;
pub mod status;
pub mod sync;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::fetcher::FeedCache;

/// Load the config, falling back to defaults when the file does not exist.
pub fn load_config(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        Config::load(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))
    } else {
        debug!("No config at {:?}, using defaults", config_path);
        Ok(Config::default())
    }
}

/// Feed cache for `config`, restored from disk, when the feed is enabled.
/// Refreshes are written back only when `persist` is set.
pub(crate) fn feed_cache(config: &Config, persist: bool) -> Option<Arc<FeedCache>> {
    config.feed.enabled.then(|| {
        let path = &config.feed.cache_path;
        Arc::new(if persist {
            FeedCache::persistent(path)
        } else {
            FeedCache::read_only(path)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_config_reports_path_on_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "backend: [unclosed").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("bad.yaml"));
    }

    #[test]
    fn test_feed_cache_only_when_enabled() {
        let mut config = Config::default();
        assert!(feed_cache(&config, true).is_none());

        let dir = tempdir().unwrap();
        config.feed.enabled = true;
        config.feed.cache_path = dir.path().join("feed.json");
        let cache = feed_cache(&config, true).unwrap();
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn test_feed_cache_without_persist_keeps_file() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.feed.enabled = true;
        config.feed.cache_path = dir.path().join("feed.json");
        let urls = vec!["https://a.example/list".to_string()];

        feed_cache(&config, true)
            .unwrap()
            .apply_results(&urls, vec![(urls[0].clone(), Ok(vec!["1.1.1.1".to_string()]))])
            .unwrap();
        let on_disk = std::fs::read(&config.feed.cache_path).unwrap();

        let cache = feed_cache(&config, false).unwrap();
        assert_eq!(cache.snapshot().len(), 1);
        cache
            .apply_results(&urls, vec![(urls[0].clone(), Ok(vec!["2.2.2.2".to_string()]))])
            .unwrap();
        assert_eq!(std::fs::read(&config.feed.cache_path).unwrap(), on_disk);
    }
}
