use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A position in the server's write-ahead log.
///
/// Positions are totally ordered; the textual form is the server's
/// `XXXXXXXX/XXXXXXXX` hexadecimal notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn parse(s: &str) -> Result<Lsn> {
        let invalid = || Error::Config(format!("invalid LSN: {}", s));

        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u64::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| invalid())?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(invalid());
        }

        Ok(Lsn((hi << 32) | lo))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Lsn::parse(s)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Lsn::parse(&s).map_err(serde::de::Error::custom)
    }
}
