//! # Ptrace Backend
//!
//! A [`LiveBackend`] that debugs a local Linux x86_64 executable itself, using ptrace.
//!
//! Breakpoints are remembered at their link time address and armed again on every run. For a
//! position independent executable the load bias is added when arming them; address space
//! randomization is disabled for the debuggee, so the bias is the same on every run.

use std::convert::Infallible;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::fcntl::{open, OFlag};
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::stat::Mode;
use nix::sys::wait::waitpid;
use nix::unistd::{dup2, execv, fork, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::addr::Addr;
use crate::analysis::{image_layout, SymbolTable};
use crate::backtrace::{walk_frames, CallFrame};
use crate::client::{ExecOp, LiveBackend};
use crate::config::LiveConfig;
use crate::debuggee::{Debuggee, ProcessState};
use crate::errors::{LiveError, Result};
use crate::memorymap::ProcessMemoryMap;
use crate::registers::RegisterSnapshot;

pub struct PtraceBackend {
    executable: PathBuf,
    file_name: String,
    arguments: Vec<String>,
    tty: Option<PathBuf>,
    symbols: SymbolTable,
    position_independent: bool,
    image_start: u64,
    /// Link time addresses
    breakpoints: Vec<Addr>,
    settle: Duration,
    max_frames: usize,
    debuggee: Option<Debuggee>,
}

/// Program name followed by the arguments, as the C strings `execv` wants
pub(crate) fn argv(executable: &Path, arguments: &[String]) -> Result<Vec<CString>> {
    let mut argv = Vec::with_capacity(arguments.len() + 1);
    argv.push(CString::new(executable.to_string_lossy().as_bytes())?);
    for arg in arguments {
        argv.push(CString::new(arg.as_str())?);
    }
    Ok(argv)
}

impl PtraceBackend {
    pub fn build(executable: impl AsRef<Path>, config: &LiveConfig) -> Result<Self> {
        let path: &Path = executable.as_ref();
        if !path.exists() {
            let err = LiveError::ExecutableDoesNotExist(path.to_string_lossy().to_string());
            error!("{err}");
            return Err(err);
        }
        if !path.is_file() {
            let err = LiveError::ExecutableIsNotAFile(path.to_string_lossy().to_string());
            error!("{err}");
            return Err(err);
        }

        let data = std::fs::read(path)?;
        let obj = object::File::parse(&*data)?;
        let symbols = SymbolTable::from_object(&obj);
        let (position_independent, image_start) = image_layout(&obj);
        debug!(
            "{} has {} function symbols, position independent: {position_independent}",
            path.display(),
            symbols.len()
        );

        Ok(Self {
            executable: path.to_owned(),
            file_name: path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_default(),
            arguments: Vec::new(),
            tty: None,
            symbols,
            position_independent,
            image_start,
            breakpoints: Vec::new(),
            settle: config.settle_time(),
            max_frames: config.max_frames,
            debuggee: None,
        })
    }

    fn debuggee(&mut self) -> Result<&mut Debuggee> {
        self.debuggee.as_mut().ok_or(LiveError::NoTarget)
    }

    fn bias(&self) -> u64 {
        self.debuggee.as_ref().map_or(0, Debuggee::load_bias)
    }

    /// Starts the executable, stopped at its first instruction
    fn launch(&mut self) -> Result<()> {
        if let Some(mut old) = self.debuggee.take() {
            info!("restarting the debuggee");
            old.kill()?;
        }
        let argv = argv(&self.executable, &self.arguments)?;
        let path = CString::new(self.executable.to_string_lossy().as_bytes())?;

        // SAFETY: the child only sets up its own process and then replaces itself with execv
        let pid = match unsafe { fork() } {
            Err(e) => {
                error!("could not start executable: {e}");
                return Err(e.into());
            }
            Ok(ForkResult::Child) => {
                match exec_child(&path, &argv, self.tty.as_deref()) {
                    Ok(never) => match never {},
                    Err(e) => {
                        eprintln!("could not start the debuggee: {e}");
                        std::process::exit(127);
                    }
                }
            }
            Ok(ForkResult::Parent { child }) => child,
        };

        // stops with SIGTRAP at the exec
        let status = waitpid(pid, None)?;
        debug!("debuggee {pid} started: {status:?}");

        let load_bias = self.load_bias_of(pid);
        let mut debuggee = Debuggee::new(pid, load_bias);
        for addr in &self.breakpoints {
            if let Err(e) = debuggee.set_breakpoint(*addr + load_bias) {
                warn!("could not arm the breakpoint at {addr}: {e}");
            }
        }
        self.debuggee = Some(debuggee);
        Ok(())
    }

    fn load_bias_of(&self, pid: Pid) -> u64 {
        if !self.position_independent {
            return 0;
        }
        let ranges = match proc_maps::get_process_maps(pid.as_raw()) {
            Ok(r) => r,
            Err(e) => {
                warn!("could not read the memory map of {pid}: {e}");
                return 0;
            }
        };
        let map = ProcessMemoryMap::from_ranges(pid.as_raw(), &ranges);
        map.image_base(&self.file_name)
            .map_or(0, |base| base.u64().saturating_sub(self.image_start))
    }
}

fn exec_child(path: &CString, argv: &[CString], tty: Option<&Path>) -> Result<Infallible> {
    if let Some(tty) = tty {
        let fd = open(tty, OFlag::O_RDWR, Mode::empty())?;
        for target in 0..=2 {
            dup2(fd, target)?;
        }
    }
    personality::set(Persona::ADDR_NO_RANDOMIZE)?;
    ptrace::traceme()?;
    Ok(execv(path, argv)?)
}

impl LiveBackend for PtraceBackend {
    fn connect(&mut self) -> Result<bool> {
        // nothing to connect to, the tracer is in this process
        Ok(true)
    }

    fn sync(&mut self) -> Result<bool> {
        match self.debuggee()?.state()? {
            ProcessState::Stopped => Ok(true),
            ProcessState::Running => Err(LiveError::Busy),
            ProcessState::Exited => Err(LiveError::NoTarget),
        }
    }

    fn get_registers(&mut self) -> Result<RegisterSnapshot> {
        let debuggee = self.debuggee()?;
        if debuggee.state()? == ProcessState::Exited {
            return Err(LiveError::NoTarget);
        }
        debuggee.registers()
    }

    fn get_memory(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        self.debuggee()?.read_memory(addr, len)
    }

    fn get_backtrace(&mut self) -> Result<Vec<CallFrame>> {
        let symbols = self.symbols.rebased(self.bias());
        let max_frames = self.max_frames;
        let debuggee = self.debuggee()?;
        let regs = debuggee.registers()?;
        let ip = regs.require("rip")?;
        let fp = regs.require("rbp")?;
        let read = |addr: Addr| debuggee.read_word(addr);
        Ok(walk_frames(ip, fp, 8, &symbols, max_frames, read))
    }

    fn set_breakpoint(&mut self, addr: Addr) -> Result<()> {
        let bias = self.bias();
        // live addresses once the process runs
        let link_addr = Addr::from(addr.u64().saturating_sub(bias));
        if !self.breakpoints.contains(&link_addr) {
            self.breakpoints.push(link_addr);
        }
        if let Some(debuggee) = self.debuggee.as_mut() {
            if debuggee.state()? != ProcessState::Exited {
                debuggee.set_breakpoint(addr)?;
            }
        }
        Ok(())
    }

    fn execute(&mut self, op: ExecOp) -> Result<()> {
        let settle = self.settle;
        match op {
            ExecOp::Run => {
                self.launch()?;
                self.debuggee()?.cont(settle)
            }
            ExecOp::StepInto => self.debuggee()?.step_into(),
            ExecOp::StepOver => self.debuggee()?.step_over(settle),
            ExecOp::StepOut => self.debuggee()?.step_out(settle),
            ExecOp::Continue => self.debuggee()?.cont(settle),
            ExecOp::Kill => {
                if let Some(mut debuggee) = self.debuggee.take() {
                    debuggee.kill()?;
                }
                Ok(())
            }
        }
    }

    fn set_tty(&mut self, tty: &Path) -> Result<()> {
        if !tty.exists() {
            return Err(LiveError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no terminal at {}", tty.display()),
            )));
        }
        info!("the debuggee will use {}", tty.display());
        self.tty = Some(tty.to_owned());
        Ok(())
    }

    fn set_arguments(&mut self, args: &[String]) -> Result<()> {
        self.arguments = args.to_vec();
        Ok(())
    }
}
