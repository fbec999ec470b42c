//! # Memory Window Module
//!
//! A [`MemoryWindow`] is a named, contiguous copy of target memory (for example `stack` or
//! `bss`). Highlights point into a window; they are only ever created for spans that lie fully
//! inside the copied bytes.

use std::fmt::{self, Display};

use serde::Serialize;

use crate::addr::Addr;
use crate::errors::{LiveError, Result};

/// A named region of target memory and its contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryWindow {
    name: String,
    base: Addr,
    bytes: Vec<u8>,
}

/// What a highlighted span of a [`MemoryWindow`] stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightRole {
    StackPointer,
    FramePointer,
    InstructionPointer,
    ReturnAddress,
}

/// A span inside a [`MemoryWindow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Highlight {
    pub role: HighlightRole,
    pub addr: Addr,
    /// Width in bytes
    pub width: usize,
}

impl MemoryWindow {
    /// Builds a window from the bytes fetched at `base`
    ///
    /// # Errors
    ///
    /// Fails with [`LiveError::ReadFailure`] if fewer than `expected_len` bytes were fetched,
    /// and with [`LiveError::NoMemoryRegion`] if the window would reach past `max_address`.
    pub fn new(
        name: impl Into<String>,
        base: Addr,
        bytes: Vec<u8>,
        expected_len: usize,
        max_address: u64,
    ) -> Result<Self> {
        let name = name.into();
        if bytes.len() != expected_len {
            return Err(LiveError::ReadFailure {
                addr: base,
                wanted: expected_len,
                got: bytes.len(),
            });
        }
        let last = base.u64().checked_add(bytes.len().saturating_sub(1) as u64);
        if !bytes.is_empty() && last.map_or(true, |last| last > max_address) {
            return Err(LiveError::NoMemoryRegion(name));
        }
        Ok(Self { name, base, bytes })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Addr {
        self.base
    }

    /// First address after the window
    pub fn end(&self) -> Addr {
        self.base + self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of `addr` into the window if `width` bytes starting there are inside of it
    pub fn offset_of(&self, addr: Addr, width: usize) -> Option<usize> {
        let offset = addr.offset_from(self.base)?;
        let end = offset.checked_add(width)?;
        (end <= self.bytes.len()).then_some(offset)
    }

    /// The bytes of a span, `None` if any of it is outside the window
    pub fn slice(&self, addr: Addr, width: usize) -> Option<&[u8]> {
        let offset = self.offset_of(addr, width)?;
        Some(&self.bytes[offset..offset + width])
    }

    /// Reads a little endian pointer of `width` bytes
    pub fn read_pointer(&self, addr: Addr, width: usize) -> Option<u64> {
        if width > 8 {
            return None;
        }
        let raw = self.slice(addr, width)?;
        let mut buf = [0u8; 8];
        buf[..width].copy_from_slice(raw);
        Some(u64::from_le_bytes(buf))
    }

    /// A [`Highlight`] for the span, `None` if it does not fit into the window
    pub fn highlight(&self, role: HighlightRole, addr: Addr, width: usize) -> Option<Highlight> {
        self.offset_of(addr, width)
            .map(|_| Highlight { role, addr, width })
    }
}

impl Display for MemoryWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {} - {}", self.name, self.base, self.end())?;
        for (row, chunk) in self.bytes.chunks(16).enumerate() {
            write!(f, "{}  ", self.base + row * 16)?;
            for byte in chunk {
                write!(f, "{byte:02x} ")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
