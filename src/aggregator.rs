//! Range merging for block-lists.
//!
//! Turns an arbitrary batch of entries into a [`DisjointRangeSet`]: ranges
//! sorted by `(family, start)` with no two ranges overlapping or touching.

use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::address::{AddrExt, Family};
use crate::range::{Entry, IpRange};

/// Private-use and loopback blocks that are never enforced. The IPv4 blocks
/// are also reserved in their IPv4-mapped IPv6 form.
const RESERVED_BLOCKS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "fc00::/7",
    "::1/128",
];

/// Sorted, non-overlapping, non-adjacent ranges, IPv4 before IPv6.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisjointRangeSet {
    ranges: Vec<IpRange>,
}

impl DisjointRangeSet {
    /// Merge an unordered batch of ranges.
    ///
    /// Ranges are stable-sorted by start (which orders by family first), then
    /// folded into an accumulator. A range whose start is at most one past
    /// the accumulator's end extends it; an accumulator ending on the
    /// all-ones address absorbs every later range of its family.
    pub fn merge<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = IpRange>,
    {
        let mut sorted: Vec<IpRange> = ranges.into_iter().collect();
        sorted.sort_by_key(|r| r.start());

        let mut iter = sorted.into_iter();
        let Some(mut current) = iter.next() else {
            return Self::default();
        };

        let mut merged = Vec::new();
        for next in iter {
            if next.family() != current.family() {
                merged.push(current);
                current = next;
                continue;
            }

            let touches = match current.end().successor() {
                Some(after_end) => next.start() <= after_end,
                None => true,
            };

            if touches {
                if next.end() > current.end() {
                    current = current.extended_to(next.end());
                }
            } else {
                merged.push(current);
                current = next;
            }
        }
        merged.push(current);

        Self { ranges: merged }
    }

    pub fn from_entries(entries: &[Entry]) -> Self {
        Self::merge(entries.iter().map(Entry::as_range))
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpRange> {
        self.ranges.iter()
    }

    pub fn family(&self, family: Family) -> impl Iterator<Item = &IpRange> {
        self.ranges.iter().filter(move |r| r.family() == family)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// CIDR cover of every range, in range order.
    pub fn to_cidr_blocks(&self) -> Vec<IpNet> {
        self.ranges.iter().flat_map(IpRange::to_cidr_blocks).collect()
    }

    /// Total number of addresses covered (saturating).
    pub fn address_count(&self) -> u128 {
        self.ranges
            .iter()
            .fold(0u128, |acc, r| acc.saturating_add(r.address_count()))
    }

    /// Clip every reserved block out of the set.
    ///
    /// A range overlapping or touching a reserved block keeps only its
    /// public parts, so merging a public entry with private or loopback
    /// space never puts that space under enforcement.
    pub fn without_reserved(&self) -> Self {
        let mut ranges = Vec::with_capacity(self.ranges.len());
        for range in &self.ranges {
            let mut parts = vec![*range];
            for reserved in reserved_ranges() {
                parts = parts.iter().flat_map(|p| p.subtract(reserved)).collect();
            }
            if parts.as_slice() != [*range] {
                debug!("Clipped reserved space out of {}", range);
            }
            ranges.extend(parts);
        }
        Self { ranges }
    }

    /// True if `addr` falls inside one of the ranges.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        let idx = self.ranges.partition_point(|r| r.end() < *addr);
        self.ranges.get(idx).is_some_and(|r| r.contains(addr))
    }
}

impl<'a> IntoIterator for &'a DisjointRangeSet {
    type Item = &'a IpRange;
    type IntoIter = std::slice::Iter<'a, IpRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

fn reserved_ranges() -> &'static [IpRange] {
    static RESERVED: OnceLock<Vec<IpRange>> = OnceLock::new();
    RESERVED.get_or_init(|| {
        let blocks: Vec<IpRange> = RESERVED_BLOCKS
            .iter()
            .filter_map(|s| s.parse::<IpNet>().ok())
            .map(IpRange::from)
            .collect();
        // IPv4 blocks again in their ::ffff:a.b.c.d form
        let mapped: Vec<IpRange> = blocks
            .iter()
            .filter_map(|r| match (r.start(), r.end()) {
                (IpAddr::V4(start), IpAddr::V4(end)) => IpRange::new(
                    IpAddr::V6(start.to_ipv6_mapped()),
                    IpAddr::V6(end.to_ipv6_mapped()),
                )
                .ok(),
                _ => None,
            })
            .collect();
        blocks.into_iter().chain(mapped).collect()
    })
}

/// True if `range` lies entirely within a private-use or loopback block
/// (IPv4-mapped forms included).
pub fn is_reserved(range: &IpRange) -> bool {
    reserved_ranges().iter().any(|r| r.contains_range(range))
}

/// Parse a batch of tokens, logging and discarding malformed ones.
pub fn parse_entries<I, S>(tokens: I) -> Vec<Entry>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut rejected = 0usize;
    let entries: Vec<Entry> = tokens
        .into_iter()
        .filter_map(|token| match token.as_ref().parse::<Entry>() {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Dropping entry {:?}: {}", token.as_ref(), e);
                rejected += 1;
                None
            }
        })
        .collect();
    if rejected > 0 {
        debug!("Parsed {} entries, rejected {}", entries.len(), rejected);
    }
    entries
}

/// Parse and merge a batch of tokens in one step.
pub fn merge_tokens<I, S>(tokens: I) -> DisjointRangeSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    DisjointRangeSet::from_entries(&parse_entries(tokens))
}
