//! # autoban - kernel firewall sets kept in sync with a block-list
//!
//! autoban turns a collection of addresses, CIDR blocks and explicit ranges
//! into the minimal set of disjoint ranges, and reconciles that set against
//! the interval sets of a kernel firewall by adding and deleting only what
//! changed since the last cycle.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        autoban                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: run, sync, merge, status, disable          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Sources                                                    │
//! │    ├── Static entries and token files                       │
//! │    └── Feed cache (reqwest + arc-swap snapshot)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Range algebra                                              │
//! │    ├── Parser: address | CIDR | start-end                   │
//! │    ├── Merge engine: disjoint, maximal ranges               │
//! │    └── CIDR cover: minimal block list per range             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Synchronizer (FirewallBackend trait)                       │
//! │    ├── NftablesBackend: interval sets, batched nft -f       │
//! │    └── IptablesBackend: one DROP rule per cover block       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```
//! use autoban::aggregator::merge_tokens;
//!
//! let merged = merge_tokens(["10.0.0.5", "10.0.0.1-10.0.0.3", "10.0.0.4/32"]);
//! assert_eq!(merged.len(), 1);
//!
//! let blocks: Vec<String> = merged.to_cidr_blocks().iter().map(|b| b.to_string()).collect();
//! assert_eq!(blocks, ["10.0.0.1/32", "10.0.0.2/31", "10.0.0.4/31"]);
//! ```
//!
//! ```no_run
//! use autoban::config::Config;
//! use autoban::daemon::{run_cycle, SyncContext};
//! use autoban::enforcer::{check_root, create_backend};
//! use autoban::signal::ShutdownToken;
//! use autoban::sources::sources_from_config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     check_root()?;
//!     let config = Config::load("/etc/autoban/config.yaml")?;
//!     let sources = sources_from_config(&config, None);
//!     let backend = create_backend(&config, ShutdownToken::new())?;
//!
//!     let mut ctx = SyncContext::new();
//!     let outcome = run_cycle(&mut ctx, &sources, backend.as_ref(), false).await?;
//!     println!("{:?}", outcome.report);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`address`] - Address arithmetic (successor, predecessor, bit views)
//! - [`range`] - Ranges, entries, parsing and the CIDR cover
//! - [`aggregator`] - Merge engine and reserved-range exclusion
//! - [`enforcer`] - Firewall backends, member sets and the diff
//! - [`daemon`] - Synchronization cycle and periodic loops
//! - [`sources`] - Where entries come from
//! - [`fetcher`] - Reputation feed download and cache
//! - [`config`] - Configuration parsing and validation
//! - [`lock`] - File locking for concurrent execution prevention
//! - [`signal`] - Graceful shutdown signal handling

pub mod address;
pub mod aggregator;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod enforcer;
pub mod error;
pub mod fetcher;
pub mod lock;
pub mod range;
pub mod signal;
pub mod sources;
pub mod utils;

pub use aggregator::DisjointRangeSet;
pub use config::Config;
pub use error::{AutobanError, RangeError};
pub use range::{Entry, IpRange};
