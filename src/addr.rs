//! # Address Module
//!
//! Target addresses are kept as [`u64`] regardless of the host pointer width, since a 64-bit
//! host may be looking at a 32-bit process.

use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::Word;

/// An address in the address space of the debugged process
#[derive(Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Addr(u64);

impl Addr {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }
    pub fn u64(&self) -> u64 {
        self.0
    }
    pub fn usize(&self) -> usize {
        self.0 as usize
    }

    /// Rounds down to the nearest multiple of `alignment`
    ///
    /// An alignment of zero leaves the address untouched.
    #[must_use]
    pub fn align_down(self, alignment: u64) -> Self {
        if alignment == 0 {
            return self;
        }
        match self.0 % alignment {
            0 => self,
            rem => Self(self.0 - rem),
        }
    }

    /// Applies a signed displacement, `None` if it leaves the 64-bit range
    pub fn checked_offset(self, delta: i64) -> Option<Self> {
        self.0.checked_add_signed(delta).map(Self)
    }

    /// Distance from `base` to `self`, `None` if `self` lies below `base`
    pub fn offset_from(self, base: Addr) -> Option<usize> {
        self.0
            .checked_sub(base.0)
            .and_then(|d| usize::try_from(d).ok())
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", { self.0 })
    }
}

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl std::fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<usize> for Addr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs as u64)
    }
}

impl Add<u64> for Addr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<usize> for Addr {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs as u64
    }
}

impl Sub for Addr {
    type Output = u64;
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Sub<usize> for Addr {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs as u64)
    }
}

impl SubAssign<usize> for Addr {
    fn sub_assign(&mut self, rhs: usize) {
        self.0 -= rhs as u64
    }
}

impl From<usize> for Addr {
    fn from(value: usize) -> Self {
        Addr(value as u64)
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Addr(value)
    }
}

impl From<Word> for Addr {
    fn from(value: Word) -> Self {
        Addr(value as u64)
    }
}

impl From<Addr> for u64 {
    fn from(value: Addr) -> Self {
        value.0
    }
}

impl From<Addr> for Word {
    fn from(value: Addr) -> Self {
        value.0 as Word
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_addr_arithmetic() {
        let a = Addr::from(100usize);
        let b = Addr::from(50usize);
        assert_eq!(a - b, 50);
        assert_eq!((a + 8usize).u64(), 108);
        assert_eq!((a - 4usize).u64(), 96);
    }

    #[test]
    fn test_addr_conversions() {
        let a = Addr::from(0x1234usize);
        assert_eq!(a.u64(), 0x1234u64);
        assert_eq!(format!("{}", a), "0x0000000000001234");
        assert_eq!(format!("{:x}", a), "1234");
    }

    #[test]
    fn test_align_down() {
        assert_eq!(
            Addr::new(0x7ffe_0000).align_down(32),
            Addr::new(0x7ffe_0000)
        );
        assert_eq!(
            Addr::new(0x7ffe_001f).align_down(32),
            Addr::new(0x7ffe_0000)
        );
        assert_eq!(
            Addr::new(0x7ffe_0021).align_down(32),
            Addr::new(0x7ffe_0020)
        );
        assert_eq!(Addr::new(0x13).align_down(0), Addr::new(0x13));
    }

    #[test]
    fn test_align_down_is_idempotent() {
        for raw in [0u64, 1, 31, 32, 33, 0x7fff_ffff_e123, u64::MAX] {
            let once = Addr::new(raw).align_down(32);
            assert_eq!(once.align_down(32), once);
            assert_eq!(once.u64() % 32, 0);
            assert!(raw - once.u64() < 32);
        }
    }

    #[test]
    fn test_checked_offset() {
        assert_eq!(
            Addr::new(0x2000).checked_offset(-0x20),
            Some(Addr::new(0x1fe0))
        );
        assert_eq!(Addr::new(0x10).checked_offset(-0x20), None);
        assert_eq!(Addr::new(u64::MAX).checked_offset(1), None);
        assert_eq!(Addr::new(0x40).offset_from(Addr::new(0x20)), Some(0x20));
        assert_eq!(Addr::new(0x10).offset_from(Addr::new(0x20)), None);
    }
}
