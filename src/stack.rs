//! # Stack Window Module
//!
//! Keeps the displayed stack window stable across a session.
//!
//! The low end of the window is a watermark: the lowest stack pointer seen so far, rounded down
//! to a fixed alignment. It only ever moves down, so the byte columns of the display do not
//! shift while the stack pointer goes up and down between cycles. The window reaches from the
//! watermark up to the end of the stack mapping.

use serde::Serialize;
use tracing::{debug, warn};

use crate::addr::Addr;

/// The watermark alignment used when nothing else is configured
pub const DEFAULT_ALIGNMENT: u64 = 32;

/// Lowest aligned stack pointer of the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StackWatermark(Option<Addr>);

impl StackWatermark {
    pub fn get(&self) -> Option<Addr> {
        self.0
    }
}

/// The span `[base, end)` to fetch and display as the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowSpan {
    pub base: Addr,
    pub end: Addr,
}

impl WindowSpan {
    pub fn len(&self) -> usize {
        (self.end - self.base) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.base >= self.end
    }
}

#[derive(Debug, Clone)]
pub struct StackWindowManager {
    alignment: u64,
    watermark: StackWatermark,
}

impl Default for StackWindowManager {
    fn default() -> Self {
        Self::new(DEFAULT_ALIGNMENT)
    }
}

impl StackWindowManager {
    pub fn new(alignment: u64) -> Self {
        Self {
            alignment,
            watermark: StackWatermark::default(),
        }
    }

    pub fn watermark(&self) -> StackWatermark {
        self.watermark
    }

    /// Start over for a new process
    pub fn reset(&mut self) {
        debug!("resetting the stack watermark");
        self.watermark = StackWatermark::default();
    }

    /// Lowers the watermark for the current stack pointer and returns the window to fetch
    ///
    /// `low` and `high` are the bounds of the stack mapping. A stack pointer below the mapping
    /// (for example after a stack pivot) is clamped to `low`, so the window never leaves the
    /// mapping. Returns `None` if the resulting window would be empty.
    pub fn update(&mut self, stack_pointer: Addr, low: Addr, high: Addr) -> Option<WindowSpan> {
        let sp = if stack_pointer < low {
            warn!("stack pointer {stack_pointer} is below the stack mapping at {low}");
            low
        } else {
            stack_pointer
        };
        let candidate = match self.watermark.0 {
            Some(current) => sp.min(current),
            None => sp,
        };
        let floor = low.align_down(self.alignment);
        let aligned = candidate.align_down(self.alignment).max(floor);
        self.watermark = StackWatermark(Some(aligned));

        let span = WindowSpan {
            base: aligned,
            end: high,
        };
        if span.is_empty() {
            debug!("stack window {aligned}..{high} is empty");
            return None;
        }
        Some(span)
    }
}
