//! # Architecture Module
//!
//! Register naming and pointer width of the supported targets.

use serde::Serialize;

use crate::errors::{LiveError, Result};

const X86_64_GPRS: &[&str] = &[
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "cs", "ss", "ds", "es", "fs", "gs", "fs_base", "gs_base",
];
const X86_GPRS: &[&str] = &[
    "eax", "ebx", "ecx", "edx", "esi", "edi", "ebp", "esp", "cs", "ss", "ds", "es", "fs", "gs",
];

/// Describes the registers and pointer width of the debugged architecture
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchInfo {
    /// Name as used by the static model, `x86_64` or `x86`
    pub name: String,
    /// Width of a pointer in bytes
    pub pointer_width: usize,
    /// Name of the instruction pointer register
    pub ip: String,
    /// Name of the stack pointer register
    pub sp: String,
    /// Name of the frame pointer register
    pub fp: String,
    /// Name of the flags register
    pub flags: String,
    /// Registers to display, in display order
    pub registers: Vec<String>,
}

impl ArchInfo {
    pub fn x86_64() -> Self {
        Self::build("x86_64", 8, "r", X86_64_GPRS)
    }

    pub fn x86() -> Self {
        Self::build("x86", 4, "e", X86_GPRS)
    }

    fn build(name: &str, pointer_width: usize, prefix: &str, gprs: &[&str]) -> Self {
        let ip = format!("{prefix}ip");
        let flags = format!("{prefix}flags");
        let mut registers = vec![ip.clone(), flags.clone()];
        // vector, x87 and segment base registers only bloat the view
        registers.extend(
            gprs.iter()
                .filter(|r| !r.contains("mm") && !r.starts_with("st") && !r.contains("base"))
                .map(|r| r.to_string()),
        );
        Self {
            name: name.to_string(),
            pointer_width,
            ip,
            sp: format!("{prefix}sp"),
            fp: format!("{prefix}bp"),
            flags,
            registers,
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "x86_64" | "x86-64" | "amd64" => Ok(Self::x86_64()),
            "x86" | "i386" | "i686" => Ok(Self::x86()),
            other => Err(LiveError::UnsupportedArchitecture(other.to_string())),
        }
    }

    pub fn from_object(arch: object::Architecture) -> Result<Self> {
        match arch {
            object::Architecture::X86_64 => Ok(Self::x86_64()),
            object::Architecture::I386 => Ok(Self::x86()),
            other => Err(LiveError::UnsupportedArchitecture(format!("{other:?}"))),
        }
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        (self.pointer_width * 8) as u32
    }

    /// Highest address a pointer of this architecture can hold
    pub fn max_address(&self) -> u64 {
        match self.pointer_width {
            8 => u64::MAX,
            w => (1u64 << (w * 8)) - 1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_x86_64_roles() {
        let arch = ArchInfo::x86_64();
        assert_eq!(arch.ip, "rip");
        assert_eq!(arch.sp, "rsp");
        assert_eq!(arch.fp, "rbp");
        assert_eq!(arch.flags, "rflags");
        assert_eq!(arch.bits(), 64);
        assert_eq!(
            &arch.registers[..2],
            &["rip".to_string(), "rflags".to_string()]
        );
        assert!(!arch.registers.iter().any(|r| r.contains("base")));
    }

    #[test]
    fn test_x86_roles() {
        let arch = ArchInfo::x86();
        assert_eq!(arch.ip, "eip");
        assert_eq!(arch.fp, "ebp");
        assert_eq!(arch.pointer_width, 4);
        assert_eq!(arch.max_address(), 0xffff_ffff);
    }

    #[test]
    fn test_unsupported() {
        assert!(matches!(
            ArchInfo::from_name("msp430"),
            Err(LiveError::UnsupportedArchitecture(_))
        ));
        assert!(ArchInfo::from_object(object::Architecture::Aarch64).is_err());
        assert_eq!(
            ArchInfo::from_object(object::Architecture::X86_64).unwrap(),
            ArchInfo::x86_64()
        );
    }
}
