//! Merge command implementation.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;
use tracing::info;

use crate::aggregator::merge_tokens;
use crate::range::tokens_from_text;
use crate::utils::format_count;

/// Merge every entry of `content`, rendering either disjoint ranges or
/// their CIDR cover, one per line.
pub fn merge_text(content: &str, cidr: bool) -> Vec<String> {
    let merged = merge_tokens(tokens_from_text(content));
    if cidr {
        merged.to_cidr_blocks().iter().map(|b| b.to_string()).collect()
    } else {
        merged
            .iter()
            .map(|r| {
                if r.is_single() {
                    r.start().to_string()
                } else {
                    r.to_string()
                }
            })
            .collect()
    }
}

/// Run the merge command
pub async fn run(file: Option<&Path>, cidr: bool) -> Result<()> {
    let content = match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let lines = merge_text(&content, cidr);
    info!("{} {}", format_count(lines.len()), if cidr { "blocks" } else { "ranges" });
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}
