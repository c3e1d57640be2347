//! Log sequence numbers.
//!
//! An LSN is the position of a change in the source's write-ahead log and the
//! global ordering key across shapes. The source reports LSNs as decimal
//! strings; they are parsed into a 64-bit integer and never routed through
//! floating point.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A log sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// The zero LSN, used for snapshot rows that carry no `lsn` header.
    pub const ZERO: Lsn = Lsn(0);

    /// Creates an LSN from its integer value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the integer value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Parses a decimal LSN string.
    ///
    /// Only ASCII digits are accepted: no sign, no whitespace, no exponent.
    pub fn parse(field: &'static str, text: &str) -> ProtocolResult<Self> {
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::invalid_lsn(field, text));
        }
        text.parse::<u64>()
            .map(Lsn)
            .map_err(|_| ProtocolError::invalid_lsn(field, text))
    }

    /// Three-way comparison.
    pub fn compare(a: Lsn, b: Lsn) -> Ordering {
        a.0.cmp(&b.0)
    }

    /// Largest of the given LSNs, `None` for an empty input.
    pub fn max_of<I: IntoIterator<Item = Lsn>>(lsns: I) -> Option<Lsn> {
        lsns.into_iter().max()
    }

    /// Smallest of the given LSNs, `None` for an empty input.
    pub fn min_of<I: IntoIterator<Item = Lsn>>(lsns: I) -> Option<Lsn> {
        lsns.into_iter().min()
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Lsn {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lsn::parse("lsn", s)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A per-shape LSN watermark that starts below every real LSN.
///
/// `Unset` orders before every `At(_)`, so `max`/`min` over marks behave as if
/// the sentinel were negative infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LsnMark {
    /// Nothing observed yet.
    #[default]
    Unset,
    /// Highest LSN observed so far.
    At(Lsn),
}

impl LsnMark {
    /// Returns the LSN, if any has been observed.
    pub fn lsn(&self) -> Option<Lsn> {
        match self {
            LsnMark::Unset => None,
            LsnMark::At(lsn) => Some(*lsn),
        }
    }

    /// Returns true if no LSN has been observed.
    pub fn is_unset(&self) -> bool {
        matches!(self, LsnMark::Unset)
    }

    /// Raises the mark to `candidate` if it is higher.
    ///
    /// Returns true if the mark moved. The mark never moves backwards.
    pub fn advance(&mut self, candidate: Lsn) -> bool {
        let next = LsnMark::At(candidate);
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    /// Returns true if `lsn` is at or below this mark.
    pub fn covers(&self, lsn: Lsn) -> bool {
        match self {
            LsnMark::Unset => false,
            LsnMark::At(mark) => lsn <= *mark,
        }
    }

    /// Three-way comparison.
    pub fn compare(a: LsnMark, b: LsnMark) -> Ordering {
        a.cmp(&b)
    }

    /// Largest of the given marks, `None` for an empty input.
    pub fn max_of<I: IntoIterator<Item = LsnMark>>(marks: I) -> Option<LsnMark> {
        marks.into_iter().max()
    }

    /// Smallest of the given marks, `None` for an empty input.
    pub fn min_of<I: IntoIterator<Item = LsnMark>>(marks: I) -> Option<LsnMark> {
        marks.into_iter().min()
    }
}

impl fmt::Display for LsnMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LsnMark::Unset => write!(f, "-"),
            LsnMark::At(lsn) => write!(f, "{lsn}"),
        }
    }
}

impl From<Lsn> for LsnMark {
    fn from(lsn: Lsn) -> Self {
        LsnMark::At(lsn)
    }
}
