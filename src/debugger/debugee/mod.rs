pub mod dwarf;

use crate::debugger::debugee::dwarf::DebugInformation;
use crate::debugger::error::Error;
use object::{Object, ObjectKind};
use std::fs;
use std::path::{Path, PathBuf};

/// Debugee binary facts: mapped ELF plus parsed debug information. Read-only
/// after construction, the running tracee never changes it.
pub struct Debugee {
    /// Path to the executable.
    pub path: PathBuf,
    /// Parsed debug information.
    pub dwarf: DebugInformation,
}

impl Debugee {
    pub fn new(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        // A position-independent image relocates at load time, while the parsed
        // addresses are link-time ones.
        if object.kind() == ObjectKind::Dynamic {
            return Err(Error::PieExecutable(path.to_path_buf()));
        }

        let dwarf = DebugInformation::from_file(&object)?;

        Ok(Self {
            path: path.to_path_buf(),
            dwarf,
        })
    }
}
