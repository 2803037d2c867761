//! Configuration management for autoban.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AutobanError;
use crate::utils::write_atomic;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/autoban/config.yaml";

/// Interval validation (e.g., "30s", "1m", "4h", "1d").
/// Requires ASCII-only input so slicing off the suffix is always on a char boundary.
pub fn is_valid_interval(interval: &str) -> bool {
    parse_interval(interval).is_some()
}

/// Convert an interval string into a [`Duration`]. Zero intervals are rejected.
pub fn parse_interval(interval: &str) -> Option<Duration> {
    if !interval.is_ascii() || interval.len() < 2 {
        return None;
    }
    let (num_part, suffix) = interval.split_at(interval.len() - 1);
    let n: u64 = num_part.parse().ok().filter(|n| *n > 0)?;
    let secs = match suffix {
        "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3600)?,
        "d" => n.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// nft object names end up inside nft scripts, so only a safe alphabet is allowed.
fn is_valid_object_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Firewall backend (auto, nftables, iptables)
    pub backend: Backend,

    /// What matching packets get (reject, drop)
    pub verdict: Verdict,

    /// Time between synchronization cycles
    pub sync_interval: String,

    pub nftables: NftablesConfig,

    pub iptables: IptablesConfig,

    /// Where the addresses to block come from
    pub sources: SourcesConfig,

    /// Externally published reputation feed
    pub feed: FeedConfig,

    /// Advisory lock shared by the daemon and one-shot syncs
    pub lock_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            verdict: Verdict::Reject,
            sync_interval: "1m".to_string(),
            nftables: NftablesConfig::default(),
            iptables: IptablesConfig::default(),
            sources: SourcesConfig::default(),
            feed: FeedConfig::default(),
            lock_file: PathBuf::from("/run/autoban.lock"),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(AutobanError::Config(msg).into()) };

        if !is_valid_interval(&self.sync_interval) {
            return invalid(format!(
                "Invalid sync_interval '{}'. Use format like '30s', '1m', '4h'",
                self.sync_interval
            ));
        }

        let names = [
            ("nftables.table", &self.nftables.table),
            ("nftables.chain", &self.nftables.chain),
            ("nftables.set_v4", &self.nftables.set_v4),
            ("nftables.set_v6", &self.nftables.set_v6),
            ("iptables.chain", &self.iptables.chain),
            ("iptables.hook_chain", &self.iptables.hook_chain),
        ];
        for (key, name) in names {
            if !is_valid_object_name(name) {
                return invalid(format!(
                    "Invalid {} '{}'. Only letters, digits, '_' and '-' are allowed",
                    key, name
                ));
            }
        }
        if self.nftables.set_v4 == self.nftables.set_v6 {
            return invalid("nftables.set_v4 and nftables.set_v6 must differ".to_string());
        }

        if self.feed.enabled {
            if self.feed.urls.is_empty() {
                return invalid("feed is enabled but feed.urls is empty".to_string());
            }
            if !is_valid_interval(&self.feed.refresh_interval) {
                return invalid(format!(
                    "Invalid feed.refresh_interval '{}'. Use format like '30m', '1d'",
                    self.feed.refresh_interval
                ));
            }
        }
        for url in &self.feed.urls {
            if !url.starts_with("https://") {
                return invalid(format!("Feed URL must use HTTPS: {}", url));
            }
        }

        Ok(())
    }

    /// Save configuration to YAML file atomically
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        write_atomic(path.as_ref(), content.as_bytes())
            .with_context(|| format!("Failed to save config file: {:?}", path.as_ref()))
    }

    pub fn sync_period(&self) -> Duration {
        parse_interval(&self.sync_interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn feed_refresh_period(&self) -> Duration {
        parse_interval(&self.feed.refresh_interval).unwrap_or(Duration::from_secs(86_400))
    }

    /// Generate default config with comments
    pub fn generate_default_yaml() -> String {
        include_str!("../templates/config.yaml").to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Auto-detect backend (checks nftables first, then iptables)
    #[default]
    Auto,
    /// Interval sets in an nftables table
    Nftables,
    /// One DROP rule per CIDR block
    Iptables,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// ICMP unreachable back to the sender
    #[default]
    Reject,
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NftablesConfig {
    /// Table name (family `inet`)
    pub table: String,
    pub chain: String,
    pub set_v4: String,
    pub set_v6: String,
}

impl Default for NftablesConfig {
    fn default() -> Self {
        Self {
            table: "autoban".to_string(),
            chain: "prerouting".to_string(),
            set_v4: "ip4set".to_string(),
            set_v6: "ip6set".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IptablesConfig {
    /// Dedicated chain holding the DROP rules
    pub chain: String,
    /// Built-in chain that jumps to `chain`
    pub hook_chain: String,
}

impl Default for IptablesConfig {
    fn default() -> Self {
        Self {
            chain: "autoban".to_string(),
            hook_chain: "OUTPUT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourcesConfig {
    /// Token files (one entry per line, `#` comments allowed)
    pub files: Vec<PathBuf>,
    /// Entries listed inline
    pub entries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeedConfig {
    pub enabled: bool,
    pub urls: Vec<String>,
    pub refresh_interval: String,
    /// Last-known-good snapshot, reloaded at start-up
    pub cache_path: PathBuf,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            urls: Vec::new(),
            refresh_interval: "1d".to_string(),
            cache_path: PathBuf::from("/var/lib/autoban/feed.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend, Backend::Auto);
        assert_eq!(config.verdict, Verdict::Reject);
        assert_eq!(config.nftables.table, "autoban");
        assert_eq!(config.iptables.hook_chain, "OUTPUT");
        assert!(!config.feed.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_template_parses() {
        let yaml = Config::generate_default_yaml();
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.nftables, NftablesConfig::default());
    }

    #[test]
    fn test_valid_interval() {
        assert!(is_valid_interval("4h"));
        assert!(is_valid_interval("30m"));
        assert!(is_valid_interval("1d"));
        assert!(is_valid_interval("60s"));

        assert!(!is_valid_interval(""));
        assert!(!is_valid_interval("h"));
        assert!(!is_valid_interval("4"));
        assert!(!is_valid_interval("4x"));
        assert!(!is_valid_interval("0m"));
        assert!(!is_valid_interval("-1m"));
        assert!(!is_valid_interval("４h"));
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_interval("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_interval("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_interval("99999999999999999999d"), None);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
backend: iptables
verdict: drop
nftables:
  table: blocker
sources:
  entries: ["1.2.3.4", "5.6.7.0/24"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.backend, Backend::Iptables);
        assert_eq!(config.verdict, Verdict::Drop);
        assert_eq!(config.nftables.table, "blocker");
        assert_eq!(config.nftables.set_v4, "ip4set");
        assert_eq!(config.sources.entries.len(), 2);
        assert_eq!(config.sync_interval, "1m");
    }

    #[test]
    fn test_validation_rejects_unsafe_names() {
        let mut config = Config::default();
        config.nftables.table = "autoban; flush ruleset".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("nftables.table"));

        let mut config = Config::default();
        config.iptables.chain = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_same_set_names() {
        let mut config = Config::default();
        config.nftables.set_v6 = config.nftables.set_v4.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_http_feed_rejected() {
        let mut config = Config::default();
        config.feed.enabled = true;
        config.feed.urls = vec!["http://example.com/list.p2p".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("HTTPS"));
    }

    #[test]
    fn test_validation_enabled_feed_needs_urls() {
        let mut config = Config::default();
        config.feed.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_interval() {
        let mut config = Config::default();
        config.sync_interval = "often".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AutobanError>(),
            Some(AutobanError::Config(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.backend = Backend::Nftables;
        config.sources.files = vec![PathBuf::from("/var/lib/autoban/banned.txt")];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/autoban.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_periods() {
        let mut config = Config::default();
        config.sync_interval = "5m".to_string();
        config.feed.refresh_interval = "12h".to_string();
        assert_eq!(config.sync_period(), Duration::from_secs(300));
        assert_eq!(config.feed_refresh_period(), Duration::from_secs(43_200));
    }
}
