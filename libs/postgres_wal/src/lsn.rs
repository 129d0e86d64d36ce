use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A Postgres LSN (Log Sequence Number), a monotonic byte position in the WAL
/// stream of one instance.
///
/// The canonical text form is two hex halves separated by a slash, e.g.
/// `9/E40000C8`. Numeric ordering of the inner `u64` is equivalent to
/// lexicographic ordering of the zero-padded text form.
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Lsn(pub u64);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("could not parse LSN: {0:?}")]
pub struct LsnParseError(String);

impl Lsn {
    /// 0/0, used by Postgres to mean "no position".
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    /// Subtract a number of bytes, returning None on underflow.
    pub fn checked_sub<T: Into<u64>>(self, other: T) -> Option<Lsn> {
        self.0.checked_sub(other.into()).map(Lsn)
    }

    /// The WAL segment this position falls into, for the given segment size.
    pub fn segment_number(self, seg_size: u64) -> u64 {
        self.0 / seg_size
    }

    /// Byte offset within the containing WAL segment.
    pub fn segment_offset(self, seg_size: u64) -> u64 {
        self.0 % seg_size
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, other: u64) -> Self::Output {
        // Panic on overflow like the built-in integer addition would.
        Lsn(self.0.checked_add(other).expect("LSN overflow"))
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, other: u64) {
        *self = *self + other;
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    /// Parse the `HI/LO` text form. Each half must be at most 8 hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or_else(|| LsnParseError(s.into()))?;
        if hi.is_empty() || hi.len() > 8 || lo.is_empty() || lo.len() > 8 {
            return Err(LsnParseError(s.into()));
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError(s.into()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError(s.into()))?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

// LSNs travel through manifests and receipts in their text form, not as bare
// integers, so the JSON stays readable next to what Postgres itself prints.
impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let lsn: Lsn = "9/E40000C8".parse().unwrap();
        assert_eq!(lsn, Lsn(0x9_E400_00C8));
        assert_eq!(lsn.to_string(), "9/E40000C8");

        let zero: Lsn = "0/0".parse().unwrap();
        assert_eq!(zero, Lsn::INVALID);
        assert!(!zero.is_valid());

        // Lower-case and padded input is accepted.
        assert_eq!("0000000a/00000001".parse::<Lsn>().unwrap(), Lsn(0xA_0000_0001));
        assert_eq!("ffffffff/ffffffff".parse::<Lsn>().unwrap(), Lsn(u64::MAX));
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "9", "9/", "/C8", "9/E40000C8Z", "123456789/0", "9/123456789"] {
            assert!(bad.parse::<Lsn>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn ordering_matches_byte_position() {
        let a: Lsn = "9/E40000C8".parse().unwrap();
        let b: Lsn = "9/EC0000C8".parse().unwrap();
        let c: Lsn = "A/0".parse().unwrap();
        assert!(a < b && b < c);
        assert_eq!(b.checked_sub(a).unwrap(), Lsn(0x0800_0000));
        assert_eq!(a.checked_sub(c), None);
    }

    #[test]
    fn segment_math() {
        let seg = 64 * 1024 * 1024;
        let lsn: Lsn = "9/E40000C8".parse().unwrap();
        assert_eq!(lsn.segment_number(seg), 633);
        assert_eq!(lsn.segment_offset(seg), 0xC8);

        // A position exactly on a segment boundary belongs to the segment
        // that starts there.
        let boundary = Lsn(633 * seg);
        assert_eq!(boundary.segment_number(seg), 633);
        assert_eq!(boundary.segment_offset(seg), 0);
    }

    #[test]
    fn serde_as_text() {
        let lsn: Lsn = "1/2000028".parse().unwrap();
        assert_eq!(serde_json::to_string(&lsn).unwrap(), "\"1/2000028\"");
        let back: Lsn = serde_json::from_str("\"1/2000028\"").unwrap();
        assert_eq!(back, lsn);
    }
}
