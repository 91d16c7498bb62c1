// Copyright 2022 Oxide Computer Company

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// An IPv6 prefix of up to 128 bits. IPv4 prefixes are carried in their
/// v4-mapped form (`::ffff:a.b.c.d`) with the length shifted by 96.
///
/// A `Prefix` is always canonical: bits past `len` are zero. Two prefixes
/// compare equal iff they cover exactly the same address range.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Prefix {
    addr: Ipv6Addr,
    len: u8,
}

fn mask(len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        u128::MAX << (128 - len as u32)
    }
}

impl Prefix {
    pub const ROOT: Prefix = Prefix {
        addr: Ipv6Addr::UNSPECIFIED,
        len: 0,
    };

    /// Builds a canonical prefix, zeroing bits past `len`. Lengths above
    /// 128 are clamped.
    pub fn new(addr: Ipv6Addr, len: u8) -> Self {
        let len = len.min(128);
        Self::from_bits(u128::from(addr), len)
    }

    pub fn from_bits(bits: u128, len: u8) -> Self {
        let len = len.min(128);
        Prefix {
            addr: Ipv6Addr::from(bits & mask(len)),
            len,
        }
    }

    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn bits(&self) -> u128 {
        u128::from(self.addr)
    }

    /// Number of leading bits shared with `other`, capped at both lengths.
    pub fn common_len(&self, other: &Prefix) -> u8 {
        let diff = (self.bits() ^ other.bits()).leading_zeros() as u8;
        diff.min(self.len).min(other.len)
    }

    /// True iff `other` is equal to or falls within this prefix.
    pub fn contains(&self, other: &Prefix) -> bool {
        self.len <= other.len && (self.bits() ^ other.bits()) & mask(self.len) == 0
    }

    /// True iff either prefix contains the other.
    pub fn overlaps(&self, other: &Prefix) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Bit at position `i`, 0 being the most significant.
    pub fn bit(&self, i: u8) -> bool {
        debug_assert!(i < 128);
        self.bits() >> (127 - i as u32) & 1 == 1
    }

    /// The sub-prefix one bit longer, extended with `bit`.
    pub fn child(&self, bit: bool) -> Prefix {
        debug_assert!(self.len < 128);
        let bits = if bit {
            self.bits() | 1u128 << (127 - self.len as u32)
        } else {
            self.bits()
        };
        Prefix::from_bits(bits, self.len + 1)
    }

    /// The enclosing prefix of the given (shorter or equal) length.
    pub fn truncate(&self, len: u8) -> Prefix {
        debug_assert!(len <= self.len);
        Prefix::from_bits(self.bits(), len)
    }

    /// A prefix of the given (longer) length that keeps this prefix's bits
    /// and takes the rest from `bits`.
    pub fn fill(&self, bits: u128, len: u8) -> Prefix {
        debug_assert!(len >= self.len);
        let keep = if self.len == 0 {
            0
        } else {
            u128::MAX << (128 - self.len as u32)
        };
        Prefix::from_bits((self.bits() & keep) | (bits & !keep), len)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len >= 96 {
            if let Some(v4) = self.addr.to_ipv4_mapped() {
                return write!(f, "{}/{}", v4, self.len - 96);
            }
        }
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bad = || Error::InvalidPrefix(s.to_string());
        let (addr, len) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l.parse::<u8>().map_err(|_| bad())?)),
            None => (s, None),
        };
        if addr.contains('.') {
            let v4: Ipv4Addr = addr.parse().map_err(|_| bad())?;
            let len = len.unwrap_or(32);
            if len > 32 {
                return Err(bad());
            }
            Ok(Prefix::new(v4.to_ipv6_mapped(), len + 96))
        } else {
            let v6: Ipv6Addr = addr.parse().map_err(|_| bad())?;
            let len = len.unwrap_or(128);
            if len > 128 {
                return Err(bad());
            }
            Ok(Prefix::new(v6, len))
        }
    }
}
