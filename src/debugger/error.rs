use nix::unistd::Pid;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- pre-flight errors -----------------------------------------
    #[error("function `{0}` not found in debug information")]
    FunctionNotFound(String),
    #[error("unsupported language `{0}`, only C (C89/C99/C11) is supported")]
    UnsupportedLanguage(String),
    #[error("`{0}` is a position-independent executable, recompile with -no-pie")]
    PieExecutable(PathBuf),
    #[error("function `{0}` has no base-pointer frame, recompile with -fno-omit-frame-pointer")]
    NoFramePointer(String),
    #[error("no debug information for {0}, recompile with -gdwarf-2")]
    NoDebugInformation(&'static str),

    // --------------------------------- per-variable errors ---------------------------------------
    #[error("variable `{0}`: unsupported location expression")]
    UnsupportedLocation(String),
    #[error("variable `{name}`: unsupported size {size}")]
    UnsupportedVariableSize { name: String, size: u64 },

    // --------------------------------- session errors --------------------------------------------
    #[error("tracee {0} is gone")]
    TraceeGone(Pid),
    #[error("memory access at {addr:#x} failed: {source}")]
    MemoryAccess { addr: usize, source: nix::Error },

    // --------------------------------- static analysis errors ------------------------------------
    #[error("static analysis unavailable: {0}")]
    AnalysisUnavailable(String),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
}

impl Error {
    /// Return a hint to the session loop - recover and continue watching, or tear down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::UnsupportedLocation(_) => false,
            Error::UnsupportedVariableSize { .. } => false,
            Error::MemoryAccess { .. } => false,
            Error::TraceeGone(_) => false,

            Error::IO(_) => true,
            Error::FunctionNotFound(_) => true,
            Error::UnsupportedLanguage(_) => true,
            Error::PieExecutable(_) => true,
            Error::NoFramePointer(_) => true,
            Error::NoDebugInformation(_) => true,
            Error::AnalysisUnavailable(_) => true,
            Error::Waitpid(_) => true,
            Error::Ptrace(_) => true,
            Error::DwarfParsing(_) => true,
            Error::ObjParsing(_) => true,
        }
    }
}

/// Degrade a fallible step to an `Option`, leaving the error in the logs at the
/// given level. `Level::Debug` keeps per-hit probe failures out of the user's way.
pub fn ok_or_log<T, E: std::fmt::Display>(result: Result<T, E>, level: log::Level) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            log::log!(target: "debugger", level, "{e:#}");
            None
        }
    }
}
