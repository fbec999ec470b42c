//! # Debuggee Module
//!
//! A process traced with [ptrace](nix::sys::ptrace), its breakpoints and its run state.
//!
//! The tracer never blocks on a running process for long. After resuming it, [`Debuggee`]
//! polls `waitpid` until the process stops again or the settle time runs out. A process that
//! keeps running is most likely waiting for input, and every request that needs a stopped
//! process fails with [`LiveError::Busy`] until it stops.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use nix::libc::user_regs_struct;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::addr::Addr;
use crate::breakpoint::{Breakpoint, INT3_BYTE};
use crate::disassemble::decode_one;
use crate::errors::{LiveError, Result};
use crate::registers::RegisterSnapshot;
use crate::{mem_read, mem_read_word};

/// Longest x86 instruction
const MAX_INSTRUCTION_LEN: usize = 15;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running,
    Exited,
}

pub struct Debuggee {
    pid: Pid,
    state: ProcessState,
    breakpoints: HashMap<Addr, Breakpoint>,
    /// Breakpoint that only exists to stop a step over or step out
    temporary: Option<Addr>,
    /// A signal that stopped the process and is delivered when it resumes
    pending_signal: Option<Signal>,
    /// Where a position independent executable was loaded, relative to its link address
    load_bias: u64,
}

/// Builds a snapshot with the register names of the x86_64 [`ArchInfo`](crate::arch::ArchInfo)
pub fn snapshot_from_regs(regs: &user_regs_struct) -> RegisterSnapshot {
    let mut s = RegisterSnapshot::new(64);
    for (name, value) in [
        ("rip", regs.rip),
        ("rflags", regs.eflags),
        ("rax", regs.rax),
        ("rbx", regs.rbx),
        ("rcx", regs.rcx),
        ("rdx", regs.rdx),
        ("rsi", regs.rsi),
        ("rdi", regs.rdi),
        ("rbp", regs.rbp),
        ("rsp", regs.rsp),
        ("r8", regs.r8),
        ("r9", regs.r9),
        ("r10", regs.r10),
        ("r11", regs.r11),
        ("r12", regs.r12),
        ("r13", regs.r13),
        ("r14", regs.r14),
        ("r15", regs.r15),
        ("cs", regs.cs),
        ("ss", regs.ss),
        ("ds", regs.ds),
        ("es", regs.es),
        ("fs", regs.fs),
        ("gs", regs.gs),
        ("fs_base", regs.fs_base),
        ("gs_base", regs.gs_base),
    ] {
        s.insert(name, value);
    }
    s
}

/// Replaces the `int3` bytes of enabled breakpoints inside `data` with the original bytes
pub(crate) fn unpatch_breakpoints<'a>(
    data: &mut [u8],
    base: Addr,
    breakpoints: impl IntoIterator<Item = &'a Breakpoint>,
) {
    for bp in breakpoints {
        let Some(saved) = bp.saved_data() else {
            continue;
        };
        if let Some(offset) = bp.addr().offset_from(base).filter(|o| *o < data.len()) {
            if data[offset] == INT3_BYTE {
                data[offset] = saved;
            }
        }
    }
}

impl Debuggee {
    /// Wraps a freshly started process that is stopped at its first instruction
    pub(crate) fn new(pid: Pid, load_bias: u64) -> Self {
        Self {
            pid,
            state: ProcessState::Stopped,
            breakpoints: HashMap::new(),
            temporary: None,
            pending_signal: None,
            load_bias,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    /// The run state, after picking up a stop that happened since the last look
    pub fn state(&mut self) -> Result<ProcessState> {
        if self.state == ProcessState::Running {
            let status = waitpid(self.pid, Some(WaitPidFlag::WNOHANG))?;
            self.handle_status(status, false)?;
        }
        Ok(self.state)
    }

    /// Fails unless the process is stopped and can answer requests
    pub fn ensure_stopped(&mut self) -> Result<()> {
        match self.state()? {
            ProcessState::Stopped => Ok(()),
            ProcessState::Running => Err(LiveError::Busy),
            ProcessState::Exited => Err(LiveError::NoTarget),
        }
    }

    pub fn registers(&mut self) -> Result<RegisterSnapshot> {
        self.ensure_stopped()?;
        let regs = ptrace::getregs(self.pid)?;
        Ok(snapshot_from_regs(&regs))
    }

    /// Reads `len` bytes, with breakpoints hidden
    pub fn read_memory(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        self.ensure_stopped()?;
        let mut data = vec![0u8; len];
        let got = mem_read(&mut data, self.pid, addr)?;
        if got != len {
            return Err(LiveError::ReadFailure {
                addr,
                wanted: len,
                got,
            });
        }
        unpatch_breakpoints(&mut data, addr, self.breakpoints.values());
        Ok(data)
    }

    pub fn read_word(&mut self, addr: Addr) -> Result<u64> {
        self.ensure_stopped()?;
        Ok(mem_read_word(self.pid, addr)? as u64)
    }

    pub fn set_breakpoint(&mut self, addr: Addr) -> Result<()> {
        if self.breakpoints.contains_key(&addr) {
            debug!("there already is a breakpoint at {addr}");
            if self.temporary == Some(addr) {
                // a user breakpoint now, keep it after the step
                self.temporary = None;
            }
            return Ok(());
        }
        let mut bp = Breakpoint::new(self.pid, addr);
        bp.enable()?;
        self.breakpoints.insert(addr, bp);
        Ok(())
    }

    fn remove_breakpoint(&mut self, addr: Addr) -> Result<()> {
        if let Some(mut bp) = self.breakpoints.remove(&addr) {
            if bp.is_enabled() && self.state != ProcessState::Exited {
                bp.disable()?;
            }
        }
        Ok(())
    }

    fn ip(&self) -> Result<Addr> {
        Ok(Addr::from(ptrace::getregs(self.pid)?.rip))
    }

    /// Executes one instruction, stepping over a breakpoint at the current address
    pub fn step_into(&mut self) -> Result<()> {
        self.ensure_stopped()?;
        let ip = self.ip()?;
        let armed = self.armed_at(ip);
        if armed {
            if let Some(bp) = self.breakpoints.get_mut(&ip) {
                bp.disable()?;
            }
        }
        ptrace::step(self.pid, self.pending_signal.take())?;
        let status = waitpid(self.pid, None)?;
        self.handle_status(status, true)?;
        if armed && self.state != ProcessState::Exited {
            if let Some(bp) = self.breakpoints.get_mut(&ip) {
                bp.enable()?;
            }
        }
        Ok(())
    }

    /// Like [`Self::step_into`], but runs called functions up to their return
    pub fn step_over(&mut self, settle: Duration) -> Result<()> {
        self.ensure_stopped()?;
        let ip = self.ip()?;
        let code = self.read_memory(ip, MAX_INSTRUCTION_LEN).or_else(|_| {
            // the instruction may sit at the very end of a mapping
            self.read_memory(ip, 1)
        })?;
        match decode_one(&code, ip, 64) {
            Some(insn) if insn.is_call => {
                trace!("stepping over a call of {} bytes", insn.len);
                self.run_to(ip + insn.len, settle)
            }
            _ => self.step_into(),
        }
    }

    /// Runs until the current function returns, assuming a frame pointer based frame
    pub fn step_out(&mut self, settle: Duration) -> Result<()> {
        self.ensure_stopped()?;
        let regs = ptrace::getregs(self.pid)?;
        let return_address = self.read_word(Addr::from(regs.rbp) + 8usize)?;
        if return_address == 0 {
            warn!("no return address found, stepping a single instruction");
            return self.step_into();
        }
        self.run_to(Addr::from(return_address), settle)
    }

    fn run_to(&mut self, target: Addr, settle: Duration) -> Result<()> {
        if !self.breakpoints.contains_key(&target) {
            self.set_breakpoint(target)?;
            self.temporary = Some(target);
        }
        self.cont(settle)
    }

    /// Resumes the process and waits up to `settle` for it to stop again
    pub fn cont(&mut self, settle: Duration) -> Result<()> {
        self.ensure_stopped()?;
        let ip = self.ip()?;
        if self.armed_at(ip) {
            // get off the breakpoint first
            self.step_into()?;
            if self.state != ProcessState::Stopped || self.at_breakpoint()? {
                return Ok(());
            }
        }
        ptrace::cont(self.pid, self.pending_signal.take())?;
        self.state = ProcessState::Running;
        self.settle(settle)
    }

    fn at_breakpoint(&self) -> Result<bool> {
        let ip = self.ip()?;
        Ok(self.armed_at(ip))
    }

    fn armed_at(&self, addr: Addr) -> bool {
        matches!(self.breakpoints.get(&addr), Some(bp) if bp.is_enabled())
    }

    fn settle(&mut self, settle: Duration) -> Result<()> {
        let deadline = Instant::now() + settle;
        loop {
            if self.state()? != ProcessState::Running {
                return Ok(());
            }
            if Instant::now() >= deadline {
                info!("process {} keeps running", self.pid);
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn kill(&mut self) -> Result<()> {
        if self.state == ProcessState::Exited {
            return Ok(());
        }
        ptrace::kill(self.pid)?;
        let status = waitpid(self.pid, None)?;
        trace!("killed {}: {status:?}", self.pid);
        self.state = ProcessState::Exited;
        Ok(())
    }

    fn handle_status(&mut self, status: WaitStatus, single_step: bool) -> Result<()> {
        trace!("wait status: {status:?}");
        match status {
            WaitStatus::StillAlive => return Ok(()),
            WaitStatus::Exited(_, code) => {
                info!("process {} exited with {code}", self.pid);
                self.state = ProcessState::Exited;
                self.temporary = None;
                return Ok(());
            }
            WaitStatus::Signaled(_, signal, _) => {
                info!("process {} was killed by {signal}", self.pid);
                self.state = ProcessState::Exited;
                self.temporary = None;
                return Ok(());
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                self.state = ProcessState::Stopped;
                if !single_step {
                    self.rewind_after_trap()?;
                }
            }
            WaitStatus::Stopped(_, signal) => {
                debug!("process {} stopped by {signal}", self.pid);
                self.pending_signal = Some(signal);
                self.state = ProcessState::Stopped;
            }
            _ => self.state = ProcessState::Stopped,
        }

        // a single step on the way to the temporary breakpoint keeps it
        if !single_step {
            if let Some(temporary) = self.temporary.take() {
                self.remove_breakpoint(temporary)?;
            }
        }
        Ok(())
    }

    /// After hitting an `int3` the instruction pointer is one past the breakpoint
    fn rewind_after_trap(&mut self) -> Result<()> {
        let mut regs = ptrace::getregs(self.pid)?;
        let hit = Addr::from(regs.rip.wrapping_sub(1));
        if self.armed_at(hit) {
            debug!("hit the breakpoint at {hit}");
            regs.rip = hit.u64();
            ptrace::setregs(self.pid, regs)?;
        }
        Ok(())
    }
}

impl Drop for Debuggee {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            warn!("could not kill process {}: {e}", self.pid);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::ArchInfo;

    fn regs() -> user_regs_struct {
        user_regs_struct {
            r15: 15,
            r14: 14,
            r13: 13,
            r12: 12,
            rbp: 0x7ffe_8f40,
            rbx: 2,
            r11: 11,
            r10: 10,
            r9: 9,
            r8: 8,
            rax: 1,
            rcx: 3,
            rdx: 4,
            rsi: 5,
            rdi: 6,
            orig_rax: u64::MAX,
            rip: 0x40_1126,
            cs: 0x33,
            eflags: 0x246,
            rsp: 0x7ffe_8f20,
            ss: 0x2b,
            fs_base: 0x7f00_0000,
            gs_base: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
        }
    }

    #[test]
    fn test_snapshot_matches_arch_names() {
        let s = snapshot_from_regs(&regs());
        let arch = ArchInfo::x86_64();
        assert_eq!(s.require(&arch.ip).unwrap(), Addr::new(0x40_1126));
        assert_eq!(s.require(&arch.sp).unwrap(), Addr::new(0x7ffe_8f20));
        assert_eq!(s.require(&arch.fp).unwrap(), Addr::new(0x7ffe_8f40));
        assert_eq!(s.get(&arch.flags), Some(0x246));
        for name in &arch.registers {
            assert!(s.get(name).is_some(), "{name} is missing");
        }
    }

    #[test]
    fn test_breakpoints_are_hidden() {
        let pid = Pid::from_raw(1);
        let bps = [
            Breakpoint::armed(pid, Addr::new(0x1001), 0x48),
            // outside of the read
            Breakpoint::armed(pid, Addr::new(0x2000), 0x31),
            // never enabled, so nothing to restore
            Breakpoint::new(pid, Addr::new(0x1002)),
        ];
        let mut data = vec![0x55, INT3_BYTE, INT3_BYTE, 0x90];
        unpatch_breakpoints(&mut data, Addr::new(0x1000), bps.iter());
        assert_eq!(data, vec![0x55, 0x48, INT3_BYTE, 0x90]);
    }
}
