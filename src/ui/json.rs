use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use super::{Action, Presenter};
use crate::addr::Addr;
use crate::backtrace::CallFrame;
use crate::diagnostic::Diagnostic;
use crate::errors::Result;
use crate::registers::RegisterView;
use crate::window::{Highlight, MemoryWindow};

/// One line of input for the JSON interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub action: Action,
}

impl Input {
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Writes every event as a single line of JSON
pub struct JsonPresenter<W: Write> {
    out: W,
}

impl<W: Write> JsonPresenter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, value: serde_json::Value) {
        if let Err(e) = writeln!(self.out, "{value}").and_then(|_| self.out.flush()) {
            error!("could not write the json output: {e}");
        }
    }
}

impl<W: Write> Presenter for JsonPresenter<W> {
    fn update_registers(&mut self, view: &RegisterView) {
        self.emit(json!({ "registers": view }));
    }

    fn update_memory(&mut self, window: &MemoryWindow) {
        self.emit(json!({ "memory": window }));
    }

    fn highlight(&mut self, region: &str, highlight: Highlight) {
        self.emit(json!({ "highlight": { "region": region, "span": highlight } }));
    }

    fn redraw(&mut self) {
        self.emit(json!({ "redraw": null }));
    }

    fn update_frames(&mut self, frames: &[CallFrame]) {
        self.emit(json!({ "backtrace": frames }));
    }

    fn update_return_address(&mut self, value: Addr) {
        self.emit(json!({ "return_address": value }));
    }

    fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        self.emit(json!({
            "diagnostic": diagnostic,
            "severity": diagnostic.severity(),
            "message": diagnostic.to_string(),
        }));
    }

    fn focus_terminal(&mut self) {
        self.emit(json!({ "focus_terminal": true }));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::ExecOp;
    use crate::window::HighlightRole;

    fn lines(p: JsonPresenter<Vec<u8>>) -> Vec<serde_json::Value> {
        String::from_utf8(p.into_inner())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_events_are_lines() {
        let mut p = JsonPresenter::new(Vec::new());
        p.update_return_address(Addr::new(0x401000));
        p.highlight(
            "stack",
            Highlight {
                role: HighlightRole::ReturnAddress,
                addr: Addr::new(0x1fe0),
                width: 8,
            },
        );
        p.diagnostic(&Diagnostic::TargetBusy);

        let out = lines(p);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["return_address"], 0x401000);
        assert_eq!(out[1]["highlight"]["region"], "stack");
        assert_eq!(out[1]["highlight"]["span"]["role"], "return_address");
        assert_eq!(out[2]["diagnostic"]["kind"], "target_busy");
        assert_eq!(out[2]["severity"], "info");
    }

    #[test]
    fn test_parse_input() {
        let input = Input::parse(r#"{"action": {"exec": "continue"}}"#).unwrap();
        assert_eq!(input.action, Action::Exec(ExecOp::Continue));
        assert!(Input::parse("{}").is_err());
    }
}
