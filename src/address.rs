//! Address arithmetic for the range algebra.
//!
//! Addresses are plain [`IpAddr`] values. The standard ordering of `IpAddr`
//! already matches what the merge engine needs: every IPv4 address sorts
//! before every IPv6 address, and within a family the order is unsigned
//! big-endian byte order.
//!
//! Stepping past either end of an address space is never silent:
//! [`AddrExt::successor`] returns `None` at the all-ones address and
//! [`AddrExt::predecessor`] returns `None` at the all-zeros address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::RangeError;

/// Address family of an address, range, or kernel set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Width of the address space in bits.
    pub fn bits(self) -> u32 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// Largest integer value an address of this family can hold.
    pub fn max_bits(self) -> u128 {
        match self {
            Family::V4 => u32::MAX as u128,
            Family::V6 => u128::MAX,
        }
    }

    /// The all-zeros address.
    pub fn first(self) -> IpAddr {
        from_bits(self, 0)
    }

    /// The all-ones address.
    pub fn last(self) -> IpAddr {
        from_bits(self, self.max_bits())
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => f.write_str("ipv4"),
            Family::V6 => f.write_str("ipv6"),
        }
    }
}

/// Arithmetic helpers on [`IpAddr`].
pub trait AddrExt {
    fn family(&self) -> Family;

    /// Address as an unsigned integer (IPv4 occupies the low 32 bits).
    fn to_bits(&self) -> u128;

    /// Next address, or `None` when `self` is the top of its address space.
    fn successor(&self) -> Option<IpAddr>;

    /// Previous address, or `None` when `self` is the bottom of its address space.
    fn predecessor(&self) -> Option<IpAddr>;

    /// Number of trailing zero bits, capped at the family width.
    fn trailing_zero_bits(&self) -> u32;
}

impl AddrExt for IpAddr {
    fn family(&self) -> Family {
        match self {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn to_bits(&self) -> u128 {
        match self {
            IpAddr::V4(v4) => u32::from(*v4) as u128,
            IpAddr::V6(v6) => u128::from(*v6),
        }
    }

    fn successor(&self) -> Option<IpAddr> {
        let family = self.family();
        let bits = self.to_bits();
        if bits == family.max_bits() {
            return None;
        }
        Some(from_bits(family, bits + 1))
    }

    fn predecessor(&self) -> Option<IpAddr> {
        let bits = self.to_bits();
        if bits == 0 {
            return None;
        }
        Some(from_bits(self.family(), bits - 1))
    }

    fn trailing_zero_bits(&self) -> u32 {
        self.to_bits().trailing_zeros().min(self.family().bits())
    }
}

/// Build an address of `family` from its integer value.
///
/// Bits above the family width are discarded.
pub fn from_bits(family: Family, bits: u128) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

/// Build an address from raw network-order bytes; the length picks the family.
pub fn from_bytes(bytes: &[u8]) -> Result<IpAddr, RangeError> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    Err(RangeError::InvalidLength(bytes.len()))
}

/// Raw network-order bytes of an address (4 or 16 of them).
pub fn to_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}
