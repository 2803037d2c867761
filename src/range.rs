//! Ranges, CIDR blocks, and the textual entry forms they are parsed from.
//!
//! Three textual forms are accepted for a block-list entry:
//!
//! ```text
//! 10.0.0.5                  single address
//! 10.0.0.0/24               CIDR block
//! 10.0.0.1-10.0.0.3         explicit range (inclusive)
//! ```
//!
//! All of them are represented by [`Entry`], which exposes the same four
//! conversions regardless of form: single address, CIDR blocks, range and
//! text.

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::address::{from_bits, AddrExt, Family};
use crate::error::RangeError;

/// Inclusive address range `[start, end]` within one family.
///
/// Invariant: `start` and `end` share a family and `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpRange {
    start: IpAddr,
    end: IpAddr,
}

impl IpRange {
    /// Create a range, checking the family and ordering invariants.
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self, RangeError> {
        if start.family() != end.family() {
            return Err(RangeError::FamilyMismatch(format!("{}-{}", start, end)));
        }
        if start > end {
            return Err(RangeError::Inverted(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    /// Range holding exactly one address.
    pub fn single(addr: IpAddr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    /// The whole address space of a family.
    pub fn full(family: Family) -> Self {
        Self {
            start: family.first(),
            end: family.last(),
        }
    }

    /// Same start, later end. `end` must be in the same family and not
    /// before the current end.
    pub(crate) fn extended_to(self, end: IpAddr) -> Self {
        debug_assert!(end.family() == self.family() && end >= self.end);
        Self {
            start: self.start,
            end,
        }
    }

    pub fn start(&self) -> IpAddr {
        self.start
    }

    pub fn end(&self) -> IpAddr {
        self.end
    }

    pub fn family(&self) -> Family {
        self.start.family()
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// True if every address of `other` is also in `self`.
    pub fn contains_range(&self, other: &IpRange) -> bool {
        self.family() == other.family() && self.start <= other.start && other.end <= self.end
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.family() == addr.family() && self.start <= *addr && *addr <= self.end
    }

    /// The parts of `self` outside `other`: zero, one or two ranges, in order.
    pub fn subtract(&self, other: &IpRange) -> Vec<IpRange> {
        if self.family() != other.family() || other.end < self.start || other.start > self.end {
            return vec![*self];
        }

        let mut parts = Vec::with_capacity(2);
        if other.start > self.start {
            if let Some(before) = other.start.predecessor() {
                parts.push(Self {
                    start: self.start,
                    end: before,
                });
            }
        }
        if other.end < self.end {
            if let Some(after) = other.end.successor() {
                parts.push(Self {
                    start: after,
                    end: self.end,
                });
            }
        }
        parts
    }

    /// Number of addresses in the range, saturating at `u128::MAX` for the
    /// full IPv6 space.
    pub fn address_count(&self) -> u128 {
        (self.end.to_bits() - self.start.to_bits()).saturating_add(1)
    }

    /// Minimal ordered list of canonical CIDR blocks whose union is exactly
    /// this range.
    ///
    /// Each step takes the largest block that is both aligned at the current
    /// start and does not run past `end`. The loop ends when a block's last
    /// address equals `end`, so a range ending at the top of the address
    /// space terminates without ever computing a successor of `end`.
    pub fn to_cidr_blocks(&self) -> Vec<IpNet> {
        let family = self.family();
        let width = family.bits();
        let end = self.end.to_bits();
        let mut blocks = Vec::new();
        let mut start = self.start;

        loop {
            let s = start.to_bits();
            let align_bits = start.trailing_zero_bits();
            // Highest bit where `s` and `end + 1` differ bounds the block size.
            // Past the top of the space `end + 1` would be 2^width, which
            // differs from `s` at bit `width`.
            let span_bits = match self.end.successor() {
                Some(next) => 127 - (next.to_bits() ^ s).leading_zeros(),
                None => width,
            };
            let host_bits = align_bits.min(span_bits);
            let prefix = (width - host_bits) as u8;
            blocks.push(block(start, prefix));

            let last = if host_bits >= 128 {
                u128::MAX
            } else {
                s | ((1u128 << host_bits) - 1)
            };
            if last >= end {
                debug_assert_eq!(last, end);
                return blocks;
            }
            start = from_bits(family, last + 1);
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl From<IpNet> for IpRange {
    fn from(net: IpNet) -> Self {
        Self {
            start: net.network(),
            end: net.broadcast(),
        }
    }
}

impl From<IpAddr> for IpRange {
    fn from(addr: IpAddr) -> Self {
        Self::single(addr)
    }
}

/// Build a CIDR block from an address already aligned to `prefix`.
fn block(addr: IpAddr, prefix: u8) -> IpNet {
    // prefix is derived from the family width, so it is always in range
    IpNet::new(addr, prefix)
        .unwrap_or_else(|_| unreachable!("prefix /{} out of range for {}", prefix, addr))
}

/// One block-list entry in any of its three textual forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entry {
    Single(IpAddr),
    Block(IpNet),
    Range(IpRange),
}

impl Entry {
    /// The address, if this entry denotes exactly one address.
    pub fn as_single_address(&self) -> Option<IpAddr> {
        match self {
            Entry::Single(addr) => Some(*addr),
            Entry::Block(net) if net.prefix_len() == net.max_prefix_len() => Some(net.network()),
            Entry::Block(_) => None,
            Entry::Range(range) if range.is_single() => Some(range.start()),
            Entry::Range(_) => None,
        }
    }

    /// Canonical CIDR blocks covering exactly this entry.
    pub fn as_cidr_blocks(&self) -> Vec<IpNet> {
        match self {
            Entry::Single(addr) => vec![IpNet::from(*addr)],
            Entry::Block(net) => vec![*net],
            Entry::Range(range) => range.to_cidr_blocks(),
        }
    }

    pub fn as_range(&self) -> IpRange {
        match self {
            Entry::Single(addr) => IpRange::single(*addr),
            Entry::Block(net) => IpRange::from(*net),
            Entry::Range(range) => *range,
        }
    }

    pub fn family(&self) -> Family {
        self.as_range().family()
    }

    /// Collapse an entry that denotes one address into [`Entry::Single`].
    pub fn single_or_self(self) -> Entry {
        match self.as_single_address() {
            Some(addr) => Entry::Single(addr),
            None => self,
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Single(addr) => write!(f, "{}", addr),
            Entry::Block(net) => write!(f, "{}", net),
            Entry::Range(range) => write!(f, "{}", range),
        }
    }
}

impl FromStr for Entry {
    type Err = RangeError;

    /// Parse a token: a `/` means CIDR, otherwise a bare address, otherwise
    /// a `-` separated range.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(RangeError::Empty);
        }

        if text.contains('/') {
            return text
                .parse::<IpNet>()
                .map(|net| Entry::Block(net.trunc()))
                .map_err(|_| RangeError::InvalidCidr(text.to_string()));
        }

        if let Ok(addr) = text.parse::<IpAddr>() {
            return Ok(Entry::Single(addr));
        }

        if let Some((start, end)) = text.split_once('-') {
            let start: IpAddr = start
                .trim()
                .parse()
                .map_err(|_| RangeError::InvalidRange(text.to_string()))?;
            let end: IpAddr = end
                .trim()
                .parse()
                .map_err(|_| RangeError::InvalidRange(text.to_string()))?;
            return IpRange::new(start, end).map(Entry::Range);
        }

        Err(RangeError::InvalidAddress(text.to_string()))
    }
}

/// Target form for [`convert_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// One range per entry.
    Range,
    /// One CIDR block per covering block of each entry.
    Cidr,
}

/// Convert every entry to a single target form.
pub fn convert_batch(entries: &[Entry], kind: OutputKind) -> Vec<Entry> {
    match kind {
        OutputKind::Range => entries.iter().map(|e| Entry::Range(e.as_range())).collect(),
        OutputKind::Cidr => entries
            .iter()
            .flat_map(|e| e.as_cidr_blocks())
            .map(Entry::Block)
            .collect(),
    }
}

/// Pull the entry token out of one line of a block-list file.
///
/// Blank lines and `#` comments yield `None`. Lines in the P2P
/// `label:start-end` format yield their range part.
pub fn extract_token(line: &str) -> Option<&str> {
    let line = match line.split_once('#') {
        Some((before, _)) => before,
        None => line,
    }
    .trim();
    if line.is_empty() {
        return None;
    }
    if line.parse::<Entry>().is_ok() {
        return Some(line);
    }
    if let Some((_, tail)) = line.rsplit_once(':') {
        if tail.parse::<Entry>().is_ok() {
            return Some(tail.trim());
        }
    }
    Some(line)
}

/// All entry tokens of a block-list file, in file order.
pub fn tokens_from_text(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(extract_token)
        .map(str::to_string)
        .collect()
}
