//! # Execution Location Classifier
//!
//! Tells whether the instruction pointer is inside the stack window, that is whether code is
//! executing from the stack.
//!
//! When execution moves onto the stack, the freshly fetched window is mirrored into an
//! attached [`AnalysisSurface`] once, and a function is requested at the instruction pointer.
//! Leaving the stack and coming back mirrors again: the surface then holds overlapping copies.
//! That is left to the surface.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::addr::Addr;
use crate::arch::ArchInfo;
use crate::surface::AnalysisSurface;
use crate::window::MemoryWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    InWindow,
    OutOfWindow,
}

/// Result of one classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub location: Location,
    /// This classification is a transition from out-of-window to in-window
    pub entered: bool,
    /// The window was mirrored into the secondary surface
    pub mirrored: bool,
}

#[derive(Default)]
pub struct ExecutionClassifier {
    executing_on_stack: bool,
    surface: Option<Box<dyn AnalysisSurface>>,
}

impl std::fmt::Debug for ExecutionClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionClassifier")
            .field("executing_on_stack", &self.executing_on_stack)
            .field("surface", &self.surface.is_some())
            .finish()
    }
}

/// `true` if `watermark < ip <= high`
#[inline]
pub fn in_window(ip: Addr, watermark: Addr, high: Addr) -> bool {
    watermark < ip && ip <= high
}

impl ExecutionClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_secondary_surface(&mut self, surface: Box<dyn AnalysisSurface>) {
        info!("attached a secondary analysis surface");
        self.surface = Some(surface);
    }

    pub fn surface(&self) -> Option<&dyn AnalysisSurface> {
        self.surface.as_deref()
    }

    pub fn is_executing_on_stack(&self) -> bool {
        self.executing_on_stack
    }

    pub fn reset(&mut self) {
        self.executing_on_stack = false;
    }

    /// Classifies `ip` against the fetched stack `window`
    pub fn classify(&mut self, ip: Addr, window: &MemoryWindow, arch: &ArchInfo) -> Classification {
        if !in_window(ip, window.base(), window.end()) {
            if self.executing_on_stack {
                debug!("execution left the stack at {ip}");
            }
            self.executing_on_stack = false;
            return Classification {
                location: Location::OutOfWindow,
                entered: false,
                mirrored: false,
            };
        }

        let entered = !self.executing_on_stack;
        self.executing_on_stack = true;
        let mut mirrored = false;
        if entered {
            info!("executing on the stack at {ip}");
            if let Some(surface) = self.surface.as_mut() {
                mirrored = true;
                if let Err(e) = surface.write(window.base(), window.bytes()) {
                    warn!("could not mirror the stack into the analysis surface: {e}");
                } else if let Err(e) = surface.add_function(ip, arch) {
                    warn!("could not recognize a function at {ip}: {e}");
                }
            }
        }

        Classification {
            location: Location::InWindow,
            entered,
            mirrored,
        }
    }
}
