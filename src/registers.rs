//! # Registers Module
//!
//! Register snapshots as reported by the live backend, and the view that is rendered from them.

use serde::Serialize;
use tracing::error;

use crate::addr::Addr;
use crate::arch::ArchInfo;
use crate::errors::{LiveError, Result};
use crate::window::MemoryWindow;

/// The register state of the target at one point in time
///
/// Values keep the order in which the backend reported them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RegisterSnapshot {
    bits: u32,
    values: Vec<(String, u64)>,
}

impl RegisterSnapshot {
    pub fn new(bits: u32) -> Self {
        Self {
            bits,
            values: Vec::new(),
        }
    }

    /// Sets a register, replacing an earlier value of the same name
    pub fn insert(&mut self, name: impl Into<String>, value: u64) {
        let name = name.into();
        let value = match self.bits {
            64 => value,
            b => value & ((1u64 << b) - 1),
        };
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        let (_, value) = self.values.iter().find(|(n, _)| n == name)?;
        Some(*value)
    }

    /// Like [`Self::get`], but a missing register is an error
    pub fn require(&self, name: &str) -> Result<Addr> {
        self.get(name)
            .map(Addr::from)
            .ok_or_else(|| LiveError::MissingRegister(name.to_string()))
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(n, v)| (n.as_str(), *v))
    }
}

/// A single rendered register line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterRow {
    pub name: String,
    pub value: u64,
    pub bits: u32,
    /// The value differs from the previous cycle
    pub changed: bool,
    /// The pointer sized word the value points to, if that word was fetched this cycle
    pub deref: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RegisterView {
    pub rows: Vec<RegisterRow>,
}

impl RegisterView {
    /// Looks up what every register points to in the memory windows of this cycle
    ///
    /// A register that points outside of all windows keeps no dereference.
    pub fn resolve_derefs(&mut self, windows: &[MemoryWindow], pointer_width: usize) {
        for row in &mut self.rows {
            let target = Addr::from(row.value);
            row.deref = windows
                .iter()
                .find_map(|w| w.read_pointer(target, pointer_width));
        }
    }
}

/// Remembers the previous snapshot to flag registers that changed between cycles
#[derive(Debug, Clone, Default)]
pub struct RegisterTracker {
    previous: Option<RegisterSnapshot>,
}

impl RegisterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the last snapshot, used when a new process starts
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn render(&mut self, snapshot: &RegisterSnapshot, arch: &ArchInfo) -> RegisterView {
        let mut rows = Vec::with_capacity(arch.registers.len());
        for name in &arch.registers {
            let Some(value) = snapshot.get(name) else {
                error!("the backend did not return a register called {name}");
                continue;
            };
            let changed = self
                .previous
                .as_ref()
                .and_then(|p| p.get(name))
                .is_some_and(|old| old != value);
            rows.push(RegisterRow {
                name: name.clone(),
                value,
                bits: snapshot.bits(),
                changed,
                deref: None,
            });
        }
        self.previous = Some(snapshot.clone());
        RegisterView { rows }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn snapshot(pairs: &[(&str, u64)]) -> RegisterSnapshot {
        let mut s = RegisterSnapshot::new(64);
        for (n, v) in pairs {
            s.insert(*n, *v);
        }
        s
    }

    #[test]
    fn test_snapshot_lookup() {
        let s = snapshot(&[("rip", 0x401000), ("rsp", 0x7ffe_0000)]);
        assert_eq!(s.get("rip"), Some(0x401000));
        assert_eq!(s.require("rsp").unwrap(), Addr::new(0x7ffe_0000));
        assert!(matches!(
            s.require("rbp"),
            Err(LiveError::MissingRegister(name)) if name == "rbp"
        ));
    }

    #[test]
    fn test_snapshot_truncates_to_width() {
        let mut s = RegisterSnapshot::new(32);
        s.insert("eax", 0x1_2345_6789);
        assert_eq!(s.get("eax"), Some(0x2345_6789));
        s.insert("eax", 7);
        assert_eq!(s.iter().count(), 1);
    }

    #[test]
    fn test_changed_flags() {
        let arch = ArchInfo::x86_64();
        let mut tracker = RegisterTracker::new();
        let first = tracker.render(&snapshot(&[("rip", 1), ("rflags", 2), ("rax", 3)]), &arch);
        assert!(first.rows.iter().all(|r| !r.changed));
        assert_eq!(first.rows[0].name, "rip");

        let second = tracker.render(&snapshot(&[("rip", 5), ("rflags", 2), ("rax", 3)]), &arch);
        let changed: Vec<&str> = second
            .rows
            .iter()
            .filter(|r| r.changed)
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(changed, vec!["rip"]);

        tracker.reset();
        let third = tracker.render(&snapshot(&[("rip", 9)]), &arch);
        assert!(!third.rows[0].changed);
        assert_eq!(third.rows.len(), 1);
    }

    #[test]
    fn test_derefs_come_from_windows() {
        let arch = ArchInfo::x86_64();
        let mut stack = vec![0u8; 0x40];
        stack[0x10..0x18].copy_from_slice(&0x40_1234u64.to_le_bytes());
        let window = MemoryWindow::new(
            "stack",
            Addr::new(0x7ffe_0000),
            stack,
            0x40,
            arch.max_address(),
        )
        .unwrap();

        let mut view = RegisterTracker::new().render(
            &snapshot(&[("rip", 0x40_1000), ("rsp", 0x7ffe_0010)]),
            &arch,
        );
        view.resolve_derefs(&[window], arch.pointer_width);

        let deref_of = |name: &str| view.rows.iter().find(|r| r.name == name).unwrap().deref;
        assert_eq!(deref_of("rsp"), Some(0x40_1234));
        assert_eq!(deref_of("rip"), None);
        let json = serde_json::to_string(&view).unwrap();
        assert!(json.contains("\"deref\":4198964"));
    }
}
