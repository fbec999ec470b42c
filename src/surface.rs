//! # Secondary Analysis Surface
//!
//! The capability the [`ExecutionClassifier`](crate::classifier::ExecutionClassifier) needs to
//! show code that runs from the stack: accept a copy of memory, and recognize a function at an
//! entry point.

use std::cell::RefCell;
use std::fmt::Display;
use std::rc::Rc;

use serde::Serialize;
use tracing::info;

use crate::addr::Addr;
use crate::arch::ArchInfo;
use crate::disassemble::Disassembly;
use crate::errors::Result;

pub trait AnalysisSurface {
    /// Make `bytes` visible at `addr`
    fn write(&mut self, addr: Addr, bytes: &[u8]) -> Result<()>;
    /// Recognize a function starting at `entry` using the default calling convention of `arch`
    fn add_function(&mut self, entry: Addr, arch: &ArchInfo) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct MirroredSegment {
    pub addr: Addr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognizedFunction {
    pub entry: Addr,
    pub disassembly: Disassembly,
}

/// An [`AnalysisSurface`] that disassembles what is mirrored into it
///
/// Segments are kept in the order they were written. Writing the same region twice keeps both
/// copies; lookups use the most recent one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DisassemblySurface {
    segments: Vec<MirroredSegment>,
    functions: Vec<RecognizedFunction>,
}

impl DisassemblySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[MirroredSegment] {
        &self.segments
    }

    pub fn functions(&self) -> &[RecognizedFunction] {
        &self.functions
    }

    fn segment_for(&self, addr: Addr) -> Option<&MirroredSegment> {
        self.segments
            .iter()
            .rev()
            .find(|s| addr.offset_from(s.addr).is_some_and(|o| o < s.bytes.len()))
    }
}

impl AnalysisSurface for DisassemblySurface {
    fn write(&mut self, addr: Addr, bytes: &[u8]) -> Result<()> {
        self.segments.push(MirroredSegment {
            addr,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn add_function(&mut self, entry: Addr, arch: &ArchInfo) -> Result<()> {
        let disassembly = match self.segment_for(entry) {
            Some(seg) => Disassembly::disassemble(&seg.bytes, seg.addr, entry, arch.bits(), true),
            None => Disassembly::empty(),
        };
        info!(
            "recognized a function of {} instructions at {entry}",
            disassembly.len()
        );
        let function = RecognizedFunction { entry, disassembly };
        self.functions.push(function);
        Ok(())
    }
}

/// Lets the owner keep looking at a surface the classifier writes to
impl<S: AnalysisSurface> AnalysisSurface for Rc<RefCell<S>> {
    fn write(&mut self, addr: Addr, bytes: &[u8]) -> Result<()> {
        self.borrow_mut().write(addr, bytes)
    }

    fn add_function(&mut self, entry: Addr, arch: &ArchInfo) -> Result<()> {
        self.borrow_mut().add_function(entry, arch)
    }
}

impl Display for DisassemblySurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for func in &self.functions {
            writeln!(f, "function at {}:", func.entry)?;
            write!(f, "{}", func.disassembly)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_recognize_function_on_mirrored_stack() {
        let mut bytes = vec![0u8; 0x40];
        // mov eax,1 ; ret
        bytes[0x20..0x26].copy_from_slice(&[0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3]);
        let mut s = DisassemblySurface::new();
        s.write(Addr::new(0x7ffe_0000), &bytes).unwrap();
        s.add_function(Addr::new(0x7ffe_0020), &ArchInfo::x86_64())
            .unwrap();

        assert_eq!(s.functions().len(), 1);
        let d = &s.functions()[0].disassembly;
        assert_eq!(d.len(), 2);
        assert!(s.to_string().contains("function at 0x00000000"));
    }

    #[test]
    fn test_duplicates_are_kept() {
        let mut s = DisassemblySurface::new();
        s.write(Addr::new(0x1000), &[0xc3]).unwrap();
        s.write(Addr::new(0x1000), &[0x90, 0xc3]).unwrap();
        assert_eq!(s.segments().len(), 2);
        let arch = ArchInfo::x86_64();
        s.add_function(Addr::new(0x1000), &arch).unwrap();
        // the newest copy is used
        assert_eq!(s.functions()[0].disassembly.len(), 2);
    }

    #[test]
    fn test_shared_surface() {
        let shared = Rc::new(RefCell::new(DisassemblySurface::new()));
        let mut handle: Box<dyn AnalysisSurface> = Box::new(shared.clone());
        handle.write(Addr::new(0x1000), &[0xc3]).unwrap();
        let arch = ArchInfo::x86_64();
        handle.add_function(Addr::new(0x1000), &arch).unwrap();
        assert_eq!(shared.borrow().functions().len(), 1);
    }

    #[test]
    fn test_unknown_entry() {
        let mut s = DisassemblySurface::new();
        s.add_function(Addr::new(0x1000), &ArchInfo::x86()).unwrap();
        assert!(s.functions()[0].disassembly.is_empty());
    }
}
