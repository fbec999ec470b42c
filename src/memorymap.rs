//! # Memory Map Module
//!
//! Finds the debugged process by name and describes its memory layout.
//!
//! The live view does not get a pid from the backend. Instead the process is looked up by the
//! file name of the analysed binary, and its `/proc/<pid>/maps` are read through the
//! [`proc_maps`] crate. The stack window is bounded by the `[stack]` mapping found here.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, trace};

use crate::addr::Addr;
use crate::errors::Result;

/// Linux truncates `/proc/<pid>/comm` to this many bytes
const COMM_LEN: usize = 15;

/// Represents a single region in a process's memory map
///
/// # Examples
///
/// ```
/// use stacksight::memorymap::{MemoryPermissions, MemoryRegion};
/// use stacksight::addr::Addr;
///
/// let region = MemoryRegion {
///     start_address: Addr::from(0x7ffe0000u64),
///     end_address: Addr::from(0x7fff1000u64),
///     size: 0x11000,
///     permissions: MemoryPermissions {
///         read: true,
///         write: true,
///         execute: false,
///         shared: false,
///         private: true,
///     },
///     offset: 0,
///     path: Some("[stack]".to_string()),
/// };
///
/// assert!(region.is_named("stack"));
/// assert!(region.contains(Addr::from(0x7ffe8000u64)));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct MemoryRegion {
    /// Starting address of the memory region
    pub start_address: Addr,
    /// End address of the memory region (exclusive)
    pub end_address: Addr,
    /// Size of the memory region in bytes
    pub size: usize,
    /// Access permissions for the memory region
    pub permissions: MemoryPermissions,
    /// Offset within the mapped file (if any)
    pub offset: usize,
    /// Path to the mapped file or pseudo name like `[stack]`, if any
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub shared: bool,
    pub private: bool,
}

impl MemoryRegion {
    /// Whether this region carries the given name
    ///
    /// Pseudo paths match with their brackets stripped (`[stack]` is `stack`), file backed
    /// regions match on their file name.
    pub fn is_named(&self, name: &str) -> bool {
        let Some(path) = self.path.as_deref() else {
            return false;
        };
        let path = path.trim();
        if path.trim_matches(|c| c == '[' || c == ']') == name {
            return true;
        }
        Path::new(path)
            .file_name()
            .is_some_and(|f| f.to_string_lossy() == name)
    }

    #[inline]
    pub fn contains(&self, addr: Addr) -> bool {
        self.start_address <= addr && addr < self.end_address
    }
}

/// The memory map of a debugged process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessMemoryMap {
    pub pid: i32,
    pub regions: Vec<MemoryRegion>,
}

impl ProcessMemoryMap {
    pub fn from_regions(pid: i32, regions: Vec<MemoryRegion>) -> Self {
        Self { pid, regions }
    }

    pub fn from_ranges(pid: i32, ranges: &[proc_maps::MapRange]) -> Self {
        let regions = ranges
            .iter()
            .map(|range| {
                let start = range.start();
                let size = range.size();

                let is_private = range.flags.len() >= 4 && &range.flags[3..4] == "p";
                let is_shared = range.flags.len() >= 4 && &range.flags[3..4] == "s";

                MemoryRegion {
                    start_address: Addr::from(start),
                    end_address: Addr::from(start + size),
                    size,
                    permissions: MemoryPermissions {
                        read: range.is_read(),
                        write: range.is_write(),
                        execute: range.is_exec(),
                        shared: is_shared,
                        private: is_private,
                    },
                    offset: range.offset,
                    path: range.filename().map(|p| p.to_string_lossy().to_string()),
                }
            })
            .collect();
        Self::from_regions(pid, regions)
    }

    /// The first region carrying `name`, see [`MemoryRegion::is_named`]
    pub fn region(&self, name: &str) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.is_named(name))
    }

    /// The lowest mapping backed by the file `file_name`
    pub fn image_base(&self, file_name: &str) -> Option<Addr> {
        self.regions
            .iter()
            .filter(|r| r.is_named(file_name))
            .map(|r| r.start_address)
            .min()
    }
}

impl Display for ProcessMemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Process Memory Map of {}:", self.pid)?;
        for (i, region) in self.regions.iter().enumerate() {
            let perm_str = format!(
                "{}{}{}{}",
                if region.permissions.read { "r" } else { "-" },
                if region.permissions.write { "w" } else { "-" },
                if region.permissions.execute { "x" } else { "-" },
                if region.permissions.private {
                    "p"
                } else if region.permissions.shared {
                    "s"
                } else {
                    "-"
                },
            );

            writeln!(
                f,
                "#{}: {:016x}-{:016x} {} ({} bytes) {}",
                i,
                region.start_address.u64(),
                region.end_address.u64(),
                perm_str,
                region.size,
                region.path.as_deref().unwrap_or("[anonymous]")
            )?;
        }

        Ok(())
    }
}

/// Name under which the debugged process shows up in the process list
///
/// An explicit file name given when attaching wins. Otherwise the base name of the analysed
/// file is used, with the `.bndb` suffix of an analysis database removed.
pub fn process_name_for(analysed: &Path, explicit: Option<&Path>) -> String {
    let base = |p: &Path| {
        p.file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| p.to_string_lossy().to_string())
    };
    match explicit {
        Some(p) => base(p),
        None => {
            let name = base(analysed);
            name.strip_suffix(".bndb").unwrap_or(&name).to_string()
        }
    }
}

/// Looks up the memory map of a live process by its name
pub trait ProcessLocator {
    /// `Ok(None)` if no process of that name is running
    fn memory_map(&self, process_name: &str) -> Result<Option<ProcessMemoryMap>>;
}

/// [`ProcessLocator`] reading the Linux procfs
#[derive(Debug, Clone)]
pub struct ProcfsLocator {
    root: PathBuf,
}

impl Default for ProcfsLocator {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcfsLocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(&self, pid_dir: &Path, process_name: &str) -> bool {
        let comm = match std::fs::read_to_string(pid_dir.join("comm")) {
            Ok(c) => c.trim_end_matches('\n').to_string(),
            Err(_) => return false,
        };
        if comm == process_name {
            return true;
        }
        // long names only survive in the exe link
        if process_name.len() > COMM_LEN && process_name.starts_with(&comm) {
            return std::fs::read_link(pid_dir.join("exe"))
                .ok()
                .and_then(|exe| exe.file_name().map(|f| f.to_string_lossy() == process_name))
                .unwrap_or(false);
        }
        false
    }

    fn find_pid(&self, process_name: &str) -> Result<Option<i32>> {
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            if self.matches(&entry.path(), process_name) {
                trace!("found {process_name} as pid {pid}");
                return Ok(Some(pid));
            }
        }
        Ok(None)
    }
}

impl ProcessLocator for ProcfsLocator {
    fn memory_map(&self, process_name: &str) -> Result<Option<ProcessMemoryMap>> {
        let Some(pid) = self.find_pid(process_name)? else {
            debug!("no running process is called {process_name}");
            return Ok(None);
        };
        let ranges = proc_maps::get_process_maps(pid)?;
        Ok(Some(ProcessMemoryMap::from_ranges(pid, &ranges)))
    }
}
