//! # User Interface Module
//!
//! The [`Presenter`] trait is everything the refresh cycle shows to the user, and [`Action`] is
//! everything the user can ask for. Two front ends exist: an interactive command line
//! ([`cli`]) and a line based JSON interface ([`json`]).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::addr::Addr;
use crate::backtrace::CallFrame;
use crate::client::ExecOp;
use crate::diagnostic::Diagnostic;
use crate::registers::RegisterView;
use crate::window::{Highlight, MemoryWindow};

#[cfg(feature = "cli")]
pub mod cli;
pub mod json;

/// Requests from the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Control execution, then refresh
    Exec(ExecOp),
    SetBreakpoint(Addr),
    SetTty(PathBuf),
    SetArguments(Vec<String>),
    /// Refresh without touching execution
    Refresh,
    /// Check whether a deferred refresh can run now
    Poll,
    Quit,
}

/// Receives the results of a refresh cycle
pub trait Presenter {
    fn update_registers(&mut self, view: &RegisterView);
    /// Replaces the contents of the named window
    fn update_memory(&mut self, window: &MemoryWindow);
    /// Marks a span of the named window, the span always lies inside the window
    fn highlight(&mut self, region: &str, highlight: Highlight);
    /// All memory windows of this cycle are updated
    fn redraw(&mut self) {}
    fn update_frames(&mut self, frames: &[CallFrame]);
    /// The value found at the estimated return address location
    fn update_return_address(&mut self, value: Addr);
    fn diagnostic(&mut self, diagnostic: &Diagnostic);
    /// The target is probably waiting for input in its terminal
    fn focus_terminal(&mut self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_action_json() {
        let a: Action = serde_json::from_str(r#"{"exec": "step_over"}"#).unwrap();
        assert_eq!(a, Action::Exec(ExecOp::StepOver));
        let a: Action = serde_json::from_str(r#"{"set_breakpoint": 4198694}"#).unwrap();
        assert_eq!(a, Action::SetBreakpoint(Addr::new(4198694)));
        let a: Action = serde_json::from_str(r#""refresh""#).unwrap();
        assert_eq!(a, Action::Refresh);
    }
}
