//! Scripted stand-ins for the collaborators of the live engine, shared by the unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::addr::Addr;
use crate::analysis::{ControlFlowFile, FunctionInfo, ReturnSite, StaticModel};
use crate::arch::ArchInfo;
use crate::backtrace::CallFrame;
use crate::client::{ExecOp, LiveBackend};
use crate::diagnostic::Diagnostic;
use crate::errors::{LiveError, Result};
use crate::memorymap::{MemoryPermissions, MemoryRegion, ProcessLocator, ProcessMemoryMap};
use crate::registers::{RegisterSnapshot, RegisterView};
use crate::surface::AnalysisSurface;
use crate::ui::Presenter;
use crate::window::{Highlight, MemoryWindow};

pub(crate) const STACK_LOW: Addr = Addr::new(0x7ffe_0000);
pub(crate) const STACK_HIGH: Addr = Addr::new(0x7fff_1000);

/// A backend that answers from scripted queues and records what it was asked
#[derive(Debug, Default)]
pub(crate) struct FakeBackend {
    pub connect_answers: VecDeque<Result<bool>>,
    pub connect_calls: usize,
    pub sync_answers: VecDeque<Result<bool>>,
    /// Answer once the scripted register answers are used up
    pub registers: RegisterSnapshot,
    pub register_answers: VecDeque<Result<RegisterSnapshot>>,
    pub register_calls: usize,
    pub memory: Vec<(Addr, Vec<u8>)>,
    /// Returned by the next memory request only
    pub memory_error: Option<LiveError>,
    pub memory_requests: Vec<(Addr, usize)>,
    pub backtrace: Vec<CallFrame>,
    pub breakpoints: Vec<Addr>,
    pub ops: Vec<ExecOp>,
    pub tty: Option<PathBuf>,
    pub arguments: Vec<String>,
}

impl FakeBackend {
    /// A backend stopped in a frame with the given registers
    pub fn stopped_at(ip: u64, sp: u64, fp: u64) -> Self {
        Self {
            registers: snapshot(ip, sp, fp),
            ..Default::default()
        }
    }

    /// Places `bytes` at `addr` in the fake address space
    pub fn map(&mut self, addr: Addr, bytes: Vec<u8>) {
        self.memory.push((addr, bytes));
    }

    /// Maps a zeroed stack with one pointer sized `value` stored at `slot`
    pub fn with_stack_word(mut self, slot: Addr, value: u64) -> Self {
        let mut stack = vec![0u8; (STACK_HIGH - STACK_LOW) as usize];
        if let Some(offset) = slot.offset_from(STACK_LOW) {
            stack[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }
        self.map(STACK_LOW, stack);
        self
    }
}

pub(crate) fn snapshot(ip: u64, sp: u64, fp: u64) -> RegisterSnapshot {
    let mut regs = RegisterSnapshot::new(64);
    regs.insert("rip", ip);
    regs.insert("rsp", sp);
    regs.insert("rbp", fp);
    regs.insert("rflags", 0x246);
    regs
}

impl LiveBackend for FakeBackend {
    fn connect(&mut self) -> Result<bool> {
        self.connect_calls += 1;
        self.connect_answers.pop_front().unwrap_or(Ok(true))
    }

    fn sync(&mut self) -> Result<bool> {
        self.sync_answers.pop_front().unwrap_or(Ok(true))
    }

    fn get_registers(&mut self) -> Result<RegisterSnapshot> {
        self.register_calls += 1;
        self.register_answers
            .pop_front()
            .unwrap_or_else(|| Ok(self.registers.clone()))
    }

    fn get_memory(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        self.memory_requests.push((addr, len));
        if let Some(e) = self.memory_error.take() {
            return Err(e);
        }
        for (base, bytes) in self.memory.iter().rev() {
            if let Some(offset) = addr.offset_from(*base) {
                if offset + len <= bytes.len() {
                    return Ok(bytes[offset..offset + len].to_vec());
                }
            }
        }
        Ok(vec![0; len])
    }

    fn get_backtrace(&mut self) -> Result<Vec<CallFrame>> {
        Ok(self.backtrace.clone())
    }

    fn set_breakpoint(&mut self, addr: Addr) -> Result<()> {
        self.breakpoints.push(addr);
        Ok(())
    }

    fn execute(&mut self, op: ExecOp) -> Result<()> {
        self.ops.push(op);
        Ok(())
    }

    fn set_tty(&mut self, tty: &Path) -> Result<()> {
        self.tty = Some(tty.to_owned());
        Ok(())
    }

    fn set_arguments(&mut self, args: &[String]) -> Result<()> {
        self.arguments = args.to_vec();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct SurfaceLog {
    pub writes: Vec<(Addr, usize)>,
    pub functions: Vec<Addr>,
}

/// An [`AnalysisSurface`] that only remembers the calls it got
pub(crate) struct RecordingSurface {
    log: Rc<RefCell<SurfaceLog>>,
}

impl RecordingSurface {
    pub fn new() -> (Self, Rc<RefCell<SurfaceLog>>) {
        let log = Rc::new(RefCell::new(SurfaceLog::default()));
        (Self { log: log.clone() }, log)
    }
}

impl AnalysisSurface for RecordingSurface {
    fn write(&mut self, addr: Addr, bytes: &[u8]) -> Result<()> {
        self.log.borrow_mut().writes.push((addr, bytes.len()));
        Ok(())
    }

    fn add_function(&mut self, entry: Addr, _arch: &ArchInfo) -> Result<()> {
        self.log.borrow_mut().functions.push(entry);
        Ok(())
    }
}

/// A [`ProcessLocator`] that knows a single process
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeLocator {
    pub name: String,
    pub map: Option<ProcessMemoryMap>,
}

impl FakeLocator {
    /// A process called `name` with a stack at [`STACK_LOW`]..[`STACK_HIGH`]
    pub fn with_stack(name: &str) -> Self {
        Self {
            name: name.to_string(),
            map: Some(ProcessMemoryMap::from_regions(
                1337,
                vec![
                    region(0x40_0000, 0x40_2000, Some(&format!("/opt/{name}"))),
                    region(STACK_LOW.u64(), STACK_HIGH.u64(), Some("[stack]")),
                ],
            )),
        }
    }
}

impl ProcessLocator for FakeLocator {
    fn memory_map(&self, process_name: &str) -> Result<Option<ProcessMemoryMap>> {
        if process_name != self.name {
            return Ok(None);
        }
        Ok(self.map.clone())
    }
}

pub(crate) fn region(start: u64, end: u64, path: Option<&str>) -> MemoryRegion {
    MemoryRegion {
        start_address: Addr::new(start),
        end_address: Addr::new(end),
        size: (end - start) as usize,
        permissions: MemoryPermissions {
            read: true,
            write: true,
            execute: false,
            shared: false,
            private: true,
        },
        offset: 0,
        path: path.map(str::to_string),
    }
}

/// A [`Presenter`] that keeps everything it is shown
#[derive(Debug, Default)]
pub(crate) struct RecordingPresenter {
    pub registers: Vec<RegisterView>,
    pub memory: Vec<MemoryWindow>,
    pub highlights: Vec<(String, Highlight)>,
    pub redraws: usize,
    pub frames: Vec<Vec<CallFrame>>,
    pub return_addresses: Vec<Addr>,
    pub diagnostics: Vec<Diagnostic>,
    pub focus_requests: usize,
}

impl Presenter for RecordingPresenter {
    fn update_registers(&mut self, view: &RegisterView) {
        self.registers.push(view.clone());
    }

    fn update_memory(&mut self, window: &MemoryWindow) {
        self.memory.push(window.clone());
    }

    fn highlight(&mut self, region: &str, highlight: Highlight) {
        self.highlights.push((region.to_string(), highlight));
    }

    fn redraw(&mut self) {
        self.redraws += 1;
    }

    fn update_frames(&mut self, frames: &[CallFrame]) {
        self.frames.push(frames.to_vec());
    }

    fn update_return_address(&mut self, value: Addr) {
        self.return_addresses.push(value);
    }

    fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        self.diagnostics.push(diagnostic.clone());
    }

    fn focus_terminal(&mut self) {
        self.focus_requests += 1;
    }
}

/// A static model of the binary `target` with the given functions
pub(crate) fn model(functions: Vec<FunctionInfo>) -> StaticModel {
    let flow = ControlFlowFile {
        arch: Some("x86_64".to_string()),
        functions,
    };
    // control flow only models are never relocated
    StaticModel::from_control_flow("/opt/target", flow).expect("valid control flow")
}

pub(crate) fn function(name: &str, start: u64, end: u64, sites: Vec<ReturnSite>) -> FunctionInfo {
    FunctionInfo {
        name: name.to_string(),
        start: Addr::new(start),
        end: Addr::new(end),
        return_sites: sites,
    }
}

pub(crate) fn fp_site(address: u64, frame_offset: i64) -> ReturnSite {
    ReturnSite {
        address: Addr::new(address),
        frame_offset: Some(frame_offset),
        stack_delta: None,
    }
}
