//! # Breakpoint Module
//!
//! Software breakpoints: the first byte of the instruction is swapped for `int3` and restored
//! on disable.

use nix::unistd::Pid;
use tracing::trace;

use crate::addr::Addr;
use crate::errors::{LiveError, Result};
use crate::{mem_read_word, mem_write_word, Word};

pub const INT3_BYTE: u8 = 0xcc;
pub const WORD_MASK: Word = 0xff;
pub const WORD_MASK_INV: Word = !WORD_MASK;

/// Replaces the lowest byte of `word`, which is the byte at the word's address
#[inline]
pub(crate) fn patch_low_byte(word: Word, byte: u8) -> Word {
    (word & WORD_MASK_INV) | Word::from(byte)
}

#[inline]
pub(crate) fn low_byte(word: Word) -> u8 {
    (word & WORD_MASK) as u8
}

#[derive(Debug, Clone, Hash)]
pub struct Breakpoint {
    addr: Addr,
    pid: Pid,
    saved_data: Option<u8>,
}

impl Breakpoint {
    pub fn new(pid: Pid, addr: Addr) -> Self {
        Self {
            pid,
            addr,
            saved_data: None,
        }
    }

    /// An enabled breakpoint whose original byte is already known
    #[cfg(test)]
    pub(crate) fn armed(pid: Pid, addr: Addr, saved: u8) -> Self {
        Self {
            pid,
            addr,
            saved_data: Some(saved),
        }
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.saved_data.is_some()
    }

    /// The original byte under the `int3`, if enabled
    pub fn saved_data(&self) -> Option<u8> {
        self.saved_data
    }

    pub fn enable(&mut self) -> Result<()> {
        if self.is_enabled() {
            return Err(LiveError::BreakpointIsAlreadyEnabled);
        }

        let data_word: Word = mem_read_word(self.pid, self.addr)?;
        trace!("original word at {}: {data_word:016x}", self.addr);
        self.saved_data = Some(low_byte(data_word));
        mem_write_word(self.pid, self.addr, patch_low_byte(data_word, INT3_BYTE))?;

        Ok(())
    }

    pub fn disable(&mut self) -> Result<()> {
        let Some(saved) = self.saved_data else {
            return Err(LiveError::BreakpointIsAlreadyDisabled);
        };

        let data_word: Word = mem_read_word(self.pid, self.addr)?;
        trace!("restoring {saved:02x} at {}", self.addr);
        mem_write_word(self.pid, self.addr, patch_low_byte(data_word, saved))?;
        self.saved_data = None;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_minus_one_has_this_representaiton() {
        assert_eq!(
            &(-1i64).to_le_bytes(),
            &[0xffu8, 0xffu8, 0xffu8, 0xffu8, 0xffu8, 0xffu8, 0xffu8, 0xffu8,]
        )
    }

    #[test]
    fn test_patch_keeps_the_rest_of_the_word() {
        let word: Word = 0x1122_3344_5566_7755;
        let patched = patch_low_byte(word, INT3_BYTE);
        assert_eq!(patched, 0x1122_3344_5566_77cc);
        assert_eq!(low_byte(word), 0x55);
        assert_eq!(patch_low_byte(patched, low_byte(word)), word);

        // the sign bit must survive as well
        let negative: Word = -2;
        assert_eq!(low_byte(patch_low_byte(negative, INT3_BYTE)), INT3_BYTE);
        assert_eq!(patch_low_byte(negative, 0xfe), negative);
    }
}
