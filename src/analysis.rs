//! # Static Analysis Module
//!
//! What the live view needs to know about the binary without running it: the architecture,
//! where functions start and end, where each function returns, and the static sections.
//!
//! The [`StaticAnalysis`] trait is the seam to whatever produced that knowledge.
//! [`StaticModel`] implements it from the ELF file itself (using [`object`]) together with a
//! precomputed control flow description in JSON that lists the return sites of each function.
//!
//! A control flow file looks like this:
//!
//! ```json
//! {
//!   "arch": "x86_64",
//!   "functions": [
//!     {
//!       "name": "main",
//!       "start": 4198694,
//!       "end": 4198790,
//!       "return_sites": [
//!         { "address": 4198789, "frame_offset": -8 },
//!         { "address": 4198760, "stack_delta": 16 }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use object::{Object, ObjectKind, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::addr::Addr;
use crate::arch::ArchInfo;
use crate::errors::{LiveError, Result};
use crate::memorymap::ProcessMemoryMap;

/// A point where a function hands control back to its caller
///
/// Carries what static analysis knows about the stack at that point. `frame_offset` is the
/// frame pointer value at the return, relative to the stack pointer at function entry.
/// `stack_delta` is the stack pointer at entry minus the stack pointer at the return site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnSite {
    pub address: Addr,
    #[serde(default)]
    pub frame_offset: Option<i64>,
    #[serde(default)]
    pub stack_delta: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub start: Addr,
    /// First address after the function
    pub end: Addr,
    #[serde(default)]
    pub return_sites: Vec<ReturnSite>,
}

impl FunctionInfo {
    #[inline]
    pub fn contains(&self, addr: Addr) -> bool {
        self.start <= addr && addr < self.end
    }

    fn rebased(&self, bias: u64) -> Self {
        Self {
            name: self.name.clone(),
            start: self.start + bias,
            end: self.end + bias,
            return_sites: self
                .return_sites
                .iter()
                .map(|s| ReturnSite {
                    address: s.address + bias,
                    ..*s
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectionInfo {
    pub start: Addr,
    pub len: usize,
}

/// Everything the live engine asks the static side
pub trait StaticAnalysis {
    fn arch(&self) -> &ArchInfo;

    /// File name of the analysed binary
    fn file_name(&self) -> &str;

    /// The function containing `addr`, in live addresses
    fn function_at(&self, addr: Addr) -> Option<FunctionInfo>;

    fn function_by_name(&self, name: &str) -> Option<FunctionInfo>;

    /// A static section like `.bss`, in live addresses
    fn section(&self, name: &str) -> Option<SectionInfo>;

    /// Adjusts to where the binary was loaded in the live process
    fn relocate(&mut self, _maps: &ProcessMemoryMap) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub start: Addr,
    pub size: u64,
}

/// Function symbols sorted by address, with demangled names
#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|s| s.start);
        symbols.dedup_by_key(|s| s.start);
        Self { symbols }
    }

    pub fn from_object(obj: &object::File<'_>) -> Self {
        let symbols = obj
            .symbols()
            .filter(|s| s.kind() == SymbolKind::Text && s.address() != 0)
            .filter_map(|s| {
                let name = s.name().ok()?;
                Some(Symbol {
                    name: format!("{:#}", rustc_demangle::demangle(name)),
                    start: Addr::from(s.address()),
                    size: s.size(),
                })
            })
            .collect();
        Self::new(symbols)
    }

    /// The symbol covering `addr`
    ///
    /// Symbols without a size cover everything up to the next symbol.
    pub fn lookup(&self, addr: Addr) -> Option<&Symbol> {
        let idx = self.symbols.partition_point(|s| s.start <= addr);
        let sym = self.symbols.get(idx.checked_sub(1)?)?;
        if sym.size == 0 {
            let next = self.symbols.get(idx).map(|s| s.start);
            return next.map_or(true, |n| addr < n).then_some(sym);
        }
        (addr < sym.start + sym.size).then_some(sym)
    }

    pub fn by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    pub fn rebased(&self, bias: u64) -> Self {
        Self {
            symbols: self
                .symbols
                .iter()
                .map(|s| Symbol {
                    start: s.start + bias,
                    ..s.clone()
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Whether the file is a position independent executable, and where its image starts
pub(crate) fn image_layout(obj: &object::File<'_>) -> (bool, u64) {
    let lowest = obj.segments().map(|s| s.address()).min().unwrap_or(0);
    (obj.kind() == ObjectKind::Dynamic, lowest)
}

/// Precomputed control flow of a binary, as read from JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlFlowFile {
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub functions: Vec<FunctionInfo>,
}

impl ControlFlowFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// [`StaticAnalysis`] built from an executable and an optional control flow file
#[derive(Debug, Clone)]
pub struct StaticModel {
    path: PathBuf,
    file_name: String,
    arch: ArchInfo,
    symbols: SymbolTable,
    /// keyed by static start address
    functions: BTreeMap<Addr, FunctionInfo>,
    sections: BTreeMap<String, SectionInfo>,
    position_independent: bool,
    image_start: u64,
    bias: u64,
}

impl StaticModel {
    /// Reads the executable at `path`
    pub fn from_elf(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let obj = object::File::parse(&*data)?;
        let arch = ArchInfo::from_object(obj.architecture())?;
        let symbols = SymbolTable::from_object(&obj);

        let mut sections = BTreeMap::new();
        for section in obj.sections() {
            let Ok(name) = section.name() else {
                continue;
            };
            if name.is_empty() || section.address() == 0 {
                continue;
            }
            sections.insert(
                name.to_string(),
                SectionInfo {
                    start: Addr::from(section.address()),
                    len: section.size() as usize,
                },
            );
        }

        let (position_independent, image_start) = image_layout(&obj);
        let mut model = Self::empty(path, arch);
        model.functions = symbols
            .symbols
            .iter()
            .map(|s| {
                (
                    s.start,
                    FunctionInfo {
                        name: s.name.clone(),
                        start: s.start,
                        end: s.start + s.size.max(1),
                        return_sites: Vec::new(),
                    },
                )
            })
            .collect();
        model.symbols = symbols;
        model.sections = sections;
        model.position_independent = position_independent;
        model.image_start = image_start;
        info!(
            "loaded {} functions and {} sections from {}",
            model.functions.len(),
            model.sections.len(),
            path.display()
        );
        Ok(model)
    }

    /// A model without an executable, only from a control flow file
    pub fn from_control_flow(path: impl AsRef<Path>, flow: ControlFlowFile) -> Result<Self> {
        let arch = match flow.arch.as_deref() {
            Some(name) => ArchInfo::from_name(name)?,
            None => return Err(LiveError::UnsupportedArchitecture("unspecified".to_string())),
        };
        let mut model = Self::empty(path.as_ref(), arch);
        model.merge_control_flow(flow)?;
        Ok(model)
    }

    fn empty(path: &Path, arch: ArchInfo) -> Self {
        Self {
            path: path.to_owned(),
            file_name: path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_default(),
            arch,
            symbols: SymbolTable::default(),
            functions: BTreeMap::new(),
            sections: BTreeMap::new(),
            position_independent: false,
            image_start: 0,
            bias: 0,
        }
    }

    /// Adds the return sites of a control flow file
    ///
    /// Functions already known from the symbol table keep their name and bounds unless the
    /// file says otherwise.
    pub fn merge_control_flow(&mut self, flow: ControlFlowFile) -> Result<()> {
        if let Some(name) = flow.arch.as_deref() {
            let arch = ArchInfo::from_name(name)?;
            if arch != self.arch {
                warn!(
                    "control flow is for {}, but the binary is {}",
                    arch.name, self.arch.name
                );
                return Err(LiveError::UnsupportedArchitecture(arch.name));
            }
        }
        for func in flow.functions {
            debug!("{} has {} return sites", func.name, func.return_sites.len());
            self.functions.insert(func.start, func);
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn bias(&self) -> u64 {
        self.bias
    }

    fn static_function_at(&self, addr: Addr) -> Option<&FunctionInfo> {
        self.functions
            .range(..=addr)
            .next_back()
            .map(|(_, f)| f)
            .filter(|f| f.contains(addr))
    }
}

impl StaticAnalysis for StaticModel {
    fn arch(&self) -> &ArchInfo {
        &self.arch
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn function_at(&self, addr: Addr) -> Option<FunctionInfo> {
        let static_addr = Addr::from(addr.u64().checked_sub(self.bias)?);
        self.static_function_at(static_addr)
            .map(|f| f.rebased(self.bias))
    }

    fn function_by_name(&self, name: &str) -> Option<FunctionInfo> {
        self.functions
            .values()
            .find(|f| f.name == name)
            .map(|f| f.rebased(self.bias))
    }

    fn section(&self, name: &str) -> Option<SectionInfo> {
        let dotted = format!(".{}", name.trim_start_matches('.'));
        self.sections.get(&dotted).map(|s| SectionInfo {
            start: s.start + self.bias,
            len: s.len,
        })
    }

    fn relocate(&mut self, maps: &ProcessMemoryMap) {
        if !self.position_independent {
            return;
        }
        let Some(base) = maps.image_base(&self.file_name) else {
            debug!("{} is not mapped, cannot relocate", self.file_name);
            return;
        };
        let bias = base.u64().saturating_sub(self.image_start);
        if bias != self.bias {
            info!("{} is loaded with a bias of {bias:#x}", self.file_name);
            self.bias = bias;
        }
    }
}
