//! # stacksight
//!
//! Live views of a stopped process for a static analysis session: registers, the active part
//! of the stack, further memory segments and the call stack, refreshed after every execution
//! step. The address where the current function will return to is estimated from the static
//! model of the binary and highlighted in the stack view.
//!
//! The engine is [`orchestrator::Orchestrator`]. It talks to the process through a
//! [`client::LiveBackend`], and shows what it found through a [`ui::Presenter`]. On Linux x86_64
//! the crate brings its own ptrace backend in [`debugger`].

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
use std::io::{Read, Seek};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
use nix::{sys::ptrace, unistd::Pid};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
use crate::{addr::Addr, errors::Result};

pub mod addr;
pub mod analysis;
pub mod arch;
pub mod backtrace;
pub mod classifier;
pub mod client;
pub mod config;
pub mod diagnostic;
pub mod disassemble;
pub mod errors;
pub mod memorymap;
pub mod orchestrator;
pub mod registers;
pub mod retaddr;
pub mod session;
pub mod stack;
pub mod surface;
pub mod ui;
pub mod window;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod breakpoint;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod debuggee;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod debugger;

#[cfg(test)]
pub(crate) mod testing;

/// A machine word as ptrace reads and writes it
pub type Word = i64;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub(crate) fn mem_write_word(pid: Pid, addr: Addr, value: Word) -> Result<()> {
    Ok(ptrace::write(pid, addr.u64() as ptrace::AddressType, value)?)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub(crate) fn mem_read_word(pid: Pid, addr: Addr) -> Result<Word> {
    Ok(ptrace::read(pid, addr.u64() as ptrace::AddressType)?)
}

/// Reads as much of `data_raw` as the process has mapped at `addr`, returns how much that was
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub(crate) fn mem_read(data_raw: &mut [u8], pid: Pid, addr: Addr) -> Result<usize> {
    let mut file = std::fs::File::options()
        .read(true)
        .write(false)
        .open(format!("/proc/{pid}/mem"))?;
    file.seek(std::io::SeekFrom::Start(addr.u64()))?;

    let mut len = 0;
    while len < data_raw.len() {
        match file.read(&mut data_raw[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            // the rest is not mapped
            Err(e) if len > 0 && e.raw_os_error() == Some(nix::libc::EIO) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(len)
}
