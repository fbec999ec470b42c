use std::collections::BTreeMap;
use std::path::PathBuf;

use dialoguer::BasicHistory;
use tracing::{error, info, warn};

use super::{Action, Presenter};
use crate::addr::Addr;
use crate::backtrace::CallFrame;
use crate::client::ExecOp;
use crate::diagnostic::{Diagnostic, Severity};
use crate::errors::{LiveError, Result};
use crate::registers::{RegisterRow, RegisterView};
use crate::window::{Highlight, HighlightRole, MemoryWindow};

/// Rows of 16 bytes shown per memory window
const DEFAULT_ROWS: usize = 16;

pub struct CliUi {
    history: BasicHistory,
}

impl CliUi {
    pub fn build() -> Result<Self> {
        Ok(CliUi {
            history: BasicHistory::new().max_entries(50).no_duplicates(true),
        })
    }

    /// Prompts until a line parses into an [`Action`]
    pub fn next_action(&mut self) -> Result<Action> {
        loop {
            let line: String = dialoguer::Input::new()
                .with_prompt("ss")
                .allow_empty(true)
                .history_with(&mut self.history)
                .interact_text()?;
            let Some(words) = shlex::split(&line) else {
                error!("could not split the command line");
                continue;
            };
            match parse_command(&words) {
                Ok(action) => return Ok(action),
                Err(e) => {
                    error!("{e}");
                    print_help();
                }
            }
        }
    }
}

pub fn parse_addr(raw: &str) -> Result<Addr> {
    let value = match raw.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => raw.parse::<u64>()?,
    };
    Ok(Addr::from(value))
}

/// Turns the words of a command line into an [`Action`]
///
/// An empty line polls the target.
pub fn parse_command(words: &[String]) -> Result<Action> {
    let Some(cmd) = words.first() else {
        return Ok(Action::Poll);
    };
    let rest = &words[1..];
    let action = match cmd.as_str() {
        "run" | "r" => Action::Exec(ExecOp::Run),
        "si" | "stepi" | "step" | "s" => Action::Exec(ExecOp::StepInto),
        "ni" | "nexti" | "next" | "n" => Action::Exec(ExecOp::StepOver),
        "finish" | "fin" => Action::Exec(ExecOp::StepOut),
        "cont" | "continue" | "c" => Action::Exec(ExecOp::Continue),
        "kill" | "k" => Action::Exec(ExecOp::Kill),
        "break" | "bp" | "b" => match rest.first() {
            Some(raw) => Action::SetBreakpoint(parse_addr(raw)?),
            None => return Err(LiveError::ParseCommand("break needs an address".to_string())),
        },
        "tty" => match rest.first() {
            Some(path) => Action::SetTty(PathBuf::from(path)),
            None => return Err(LiveError::ParseCommand("tty needs a path".to_string())),
        },
        "args" => Action::SetArguments(rest.to_vec()),
        "refresh" | "show" => Action::Refresh,
        "quit" | "q" | "exit" => Action::Quit,
        other => return Err(LiveError::ParseCommand(format!("unknown command '{other}'"))),
    };
    Ok(action)
}

fn print_help() {
    println!(
        "commands: run | si | ni | finish | cont | kill | break <addr> | tty <path> | args <..> | refresh | quit"
    );
}

/// Prints the live view to stdout
#[derive(Debug, Default)]
pub struct CliPresenter {
    rows: usize,
    windows: BTreeMap<String, (MemoryWindow, Vec<Highlight>)>,
}

impl CliPresenter {
    pub fn new() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            windows: BTreeMap::new(),
        }
    }

    fn print_window(&self, window: &MemoryWindow, highlights: &[Highlight]) {
        println!("[{}] {} - {}", window.name(), window.base(), window.end());
        // start at the row of the stack pointer if there is one
        let anchor = highlights
            .iter()
            .find(|h| h.role == HighlightRole::StackPointer)
            .map(|h| h.addr)
            .unwrap_or(window.base());
        let first_row = anchor.offset_from(window.base()).unwrap_or(0) / 16;
        for (row, chunk) in window
            .bytes()
            .chunks(16)
            .enumerate()
            .skip(first_row)
            .take(self.rows)
        {
            let row_addr = window.base() + row * 16;
            let mut line = format!("{row_addr}  ");
            for byte in chunk {
                line.push_str(&format!("{byte:02x} "));
            }
            let tags: Vec<&str> = highlights
                .iter()
                .filter(|h| h.addr.offset_from(row_addr).is_some_and(|o| o < 16))
                .map(|h| role_tag(h.role))
                .collect();
            if !tags.is_empty() {
                line.push_str(&format!(" <- {}", tags.join(",")));
            }
            println!("{line}");
        }
    }
}

fn role_tag(role: HighlightRole) -> &'static str {
    match role {
        HighlightRole::StackPointer => "sp",
        HighlightRole::FramePointer => "fp",
        HighlightRole::InstructionPointer => "ip",
        HighlightRole::ReturnAddress => "ret",
    }
}

impl Presenter for CliPresenter {
    fn update_registers(&mut self, view: &RegisterView) {
        for row in &view.rows {
            println!("{}", register_line(row));
        }
    }

    fn update_memory(&mut self, window: &MemoryWindow) {
        self.windows
            .insert(window.name().to_string(), (window.clone(), Vec::new()));
    }

    fn highlight(&mut self, region: &str, highlight: Highlight) {
        if let Some((_, highlights)) = self.windows.get_mut(region) {
            highlights.push(highlight);
        }
        if highlight.role == HighlightRole::ReturnAddress {
            println!("return address stored at {}", highlight.addr);
        }
    }

    fn redraw(&mut self) {
        for (window, highlights) in self.windows.values() {
            self.print_window(window, highlights);
        }
    }

    fn update_frames(&mut self, frames: &[CallFrame]) {
        for frame in frames {
            println!("{frame}");
        }
    }

    fn update_return_address(&mut self, value: Addr) {
        println!("returns to {value}");
    }

    fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        match diagnostic.severity() {
            Severity::Info => info!("{diagnostic}"),
            Severity::Warning => warn!("{diagnostic}"),
            Severity::Alert => error!("{diagnostic}"),
        }
    }

    fn focus_terminal(&mut self) {
        println!("the program may be waiting for input in its terminal");
    }
}

/// Name, value, a `*` if it changed and the word it points to, if known
fn register_line(row: &RegisterRow) -> String {
    let width = (row.bits / 4) as usize;
    let mut line = format!("{:<8}{:#0w$x}", row.name, row.value, w = width + 2);
    if row.changed {
        line.push_str(" *");
    }
    if let Some(word) = row.deref {
        line.push_str(&format!(" -> {word:#x}"));
    }
    line
}

#[cfg(test)]
mod test {
    use super::*;

    fn words(line: &str) -> Vec<String> {
        shlex::split(line).unwrap()
    }

    #[test]
    fn test_parse_exec() {
        assert_eq!(
            parse_command(&words("si")).unwrap(),
            Action::Exec(ExecOp::StepInto)
        );
        assert_eq!(
            parse_command(&words("finish")).unwrap(),
            Action::Exec(ExecOp::StepOut)
        );
        assert_eq!(parse_command(&[]).unwrap(), Action::Poll);
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(
            parse_command(&words("b 0x401126")).unwrap(),
            Action::SetBreakpoint(Addr::new(0x401126))
        );
        assert_eq!(
            parse_command(&words("break 4198694")).unwrap(),
            Action::SetBreakpoint(Addr::new(4198694))
        );
        assert_eq!(
            parse_command(&words("args -v 'two words'")).unwrap(),
            Action::SetArguments(vec!["-v".to_string(), "two words".to_string()])
        );
        assert!(matches!(
            parse_command(&words("break")),
            Err(LiveError::ParseCommand(_))
        ));
        assert!(matches!(parse_command(&words("b zz")), Err(LiveError::ParseInt(_))));
        assert!(parse_command(&words("frobnicate")).is_err());
    }

    #[test]
    fn test_register_line() {
        let mut row = RegisterRow {
            name: "rsp".to_string(),
            value: 0x7ffe_8f20,
            bits: 64,
            changed: false,
            deref: Some(0x40_1234),
        };
        assert_eq!(
            register_line(&row),
            "rsp     0x000000007ffe8f20 -> 0x401234"
        );
        row.deref = None;
        row.changed = true;
        assert_eq!(register_line(&row), "rsp     0x000000007ffe8f20 *");
    }
}
