use crate::debugger::debugee::dwarf::Line;
use crate::debugger::error::Error;
use crate::debugger::error::Error::Ptrace;
use crate::debugger::tracer::{Tracer, WaitEvent};
use itertools::Itertools;
use nix::libc::c_void;
use nix::sys;
use nix::unistd::Pid;
use std::cell::Cell;
use std::collections::HashMap;

/// One-byte trap opcode (INT3).
const TRAP_OPCODE: u8 = 0xCC;

/// Source line number used for synthetic breakpoints (function entry, return address).
pub const SYNTHETIC_LINE: u64 = 0;

/// Breakpoint representation.
pub struct Breakpoint {
    pub addr: usize,
    /// Source line behind the trap, [`SYNTHETIC_LINE`] if none.
    pub line_no: u64,
    pid: Pid,
    saved_data: Cell<u8>,
    enabled: Cell<bool>,
}

impl Breakpoint {
    pub fn new(addr: usize, pid: Pid, line_no: u64) -> Self {
        Self {
            addr,
            line_no,
            pid,
            saved_data: Cell::default(),
            enabled: Cell::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Save the original byte at the breakpoint address and write the trap opcode over it.
    pub fn enable(&self) -> nix::Result<()> {
        let data = sys::ptrace::read(self.pid, self.addr as *mut c_void)?;
        self.saved_data.set((data & 0xff) as u8);
        let data_with_trap = (data as usize & !0xff) | TRAP_OPCODE as usize;
        unsafe {
            sys::ptrace::write(self.pid, self.addr as *mut c_void, data_with_trap as *mut c_void)?;
        }
        self.enabled.set(true);

        Ok(())
    }

    /// Restore the original byte.
    pub fn disable(&self) -> nix::Result<()> {
        let data = sys::ptrace::read(self.pid, self.addr as *mut c_void)?;
        let restored = (data as usize & !0xff) | self.saved_data.get() as usize;
        unsafe {
            sys::ptrace::write(self.pid, self.addr as *mut c_void, restored as *mut c_void)?;
        }
        self.enabled.set(false);

        Ok(())
    }
}

/// Set of traps planted into the tracee, unique per address.
pub struct BreakpointRegistry {
    pid: Pid,
    map: HashMap<usize, Breakpoint>,
    armed: bool,
}

impl BreakpointRegistry {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            map: HashMap::new(),
            armed: false,
        }
    }

    /// Seed the set from every statement-start line record. With the unsafe
    /// "avoid equal statements" policy only the first record per distinct source
    /// line is kept.
    pub fn with_lines(pid: Pid, lines: &[Line], avoid_equal_statements: bool) -> Self {
        let mut registry = Self::new(pid);

        let stmts = lines.iter().filter(|line| line.is_stmt);
        if avoid_equal_statements {
            for line in stmts.unique_by(|line| line.number) {
                registry.add(line.addr, line.number);
            }
        } else {
            for line in stmts {
                registry.add(line.addr, line.number);
            }
        }

        registry
    }

    /// Register a breakpoint without arming it. Idempotent by address.
    pub fn add(&mut self, addr: usize, line_no: u64) {
        self.map
            .entry(addr)
            .or_insert_with(|| Breakpoint::new(addr, self.pid, line_no));
    }

    /// Register a breakpoint at an arbitrary address, arming it right away if the
    /// initial set is already armed. Idempotent by address.
    pub fn create_at(&mut self, addr: usize, line_no: u64) -> Result<(), Error> {
        if self.map.contains_key(&addr) {
            return Ok(());
        }

        let brkpt = Breakpoint::new(addr, self.pid, line_no);
        if self.armed {
            brkpt.enable().map_err(Ptrace)?;
        }
        self.map.insert(addr, brkpt);

        Ok(())
    }

    /// Write the trap opcode at every registered address. An install failure is fatal.
    pub fn arm_all(&mut self) -> Result<(), Error> {
        for brkpt in self.map.values() {
            brkpt.enable().map_err(Ptrace)?;
        }
        self.armed = true;

        Ok(())
    }

    /// Constant-time lookup. The caller must pass `pc - 1` because the trap leaves
    /// the instruction pointer one past the trap byte. A miss is a normal outcome.
    pub fn find(&self, addr: usize) -> Option<&Breakpoint> {
        self.map.get(&addr)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Execute the original instruction behind a hit breakpoint and re-arm it:
    /// restore the saved byte, rewind the program counter onto it, single-step,
    /// then write the trap opcode back.
    ///
    /// Returns an event if the tracee terminated mid-step instead of completing it.
    pub fn step_through(&self, addr: usize, tracer: &Tracer) -> Result<Option<WaitEvent>, Error> {
        let brkpt = &self.map[&addr];

        brkpt.disable().map_err(Ptrace)?;
        tracer.set_pc(brkpt.addr as u64)?;
        tracer.single_step(None)?;

        loop {
            match tracer.wait()? {
                WaitEvent::SingleStep | WaitEvent::Breakpoint => break,
                WaitEvent::Signal(signal) => {
                    // deliver the pending signal and retry the step
                    log::debug!(target: "debugger", "signal {signal} received mid-step");
                    tracer.single_step(Some(signal))?;
                }
                ev @ (WaitEvent::Exited(_) | WaitEvent::Killed(_)) => return Ok(Some(ev)),
            }
        }
        brkpt.enable().map_err(Ptrace)?;

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(addr: usize, number: u64, is_stmt: bool) -> Line {
        Line {
            addr,
            number,
            is_stmt,
            basic_block: false,
            end_sequence: false,
        }
    }

    #[test]
    fn test_line_breakpoints_keep_statement_starts_only() {
        let lines = vec![
            line(0x1000, 10, true),
            line(0x1004, 10, false),
            line(0x1008, 11, true),
            line(0x1010, 12, true),
        ];

        let registry = BreakpointRegistry::with_lines(Pid::from_raw(0), &lines, false);
        assert_eq!(registry.len(), 3);
        assert!(registry.find(0x1000).is_some());
        assert!(registry.find(0x1004).is_none());
        assert!(registry.find(0x1008).is_some());
        assert!(registry.find(0x1010).is_some());
    }

    #[test]
    fn test_avoid_equal_statements_keeps_first_per_line() {
        let lines = vec![
            line(0x1000, 10, true),
            line(0x1008, 10, true),
            line(0x1010, 11, true),
        ];

        let registry = BreakpointRegistry::with_lines(Pid::from_raw(0), &lines, true);
        assert_eq!(registry.len(), 2);
        assert!(registry.find(0x1000).is_some());
        assert!(registry.find(0x1008).is_none());
        assert!(registry.find(0x1010).is_some());
    }

    #[test]
    fn test_registry_is_unique_by_address() {
        let mut registry = BreakpointRegistry::new(Pid::from_raw(0));
        registry.add(0x2000, 42);
        registry.add(0x2000, 43);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(0x2000).map(|b| b.line_no), Some(42));
        assert!(registry.find(0x2001).is_none());
    }
}
