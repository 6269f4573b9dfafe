use crate::debugger::code;
use crate::debugger::error::Error;
use crate::debugger::error::Error::{MemoryAccess, Ptrace, TraceeGone, Waitpid};
use crate::debugger::register::{Register, RegisterMap, PTR_SIZE};
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc::{c_long, c_void};
use nix::sys;
use nix::sys::signal::{Signal, SIGKILL};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::cell::Cell;
use std::io::IoSliceMut;
use std::mem;

/// Tracee stop classification seen by the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// Tracee executed a trap instruction.
    Breakpoint,
    /// Tracee completed a hardware single step.
    SingleStep,
    /// Tracee stopped with an OS signal that must be re-injected.
    Signal(Signal),
    /// Whole tracee process exited with code.
    Exited(i32),
    /// Tracee killed by a signal.
    Killed(Signal),
}

/// Ptrace driver for a single-threaded tracee.
pub struct Tracer {
    pid: Pid,
    /// Set when `process_vm_readv` is unavailable and word-sized reads must be used instead.
    vm_read_broken: Cell<bool>,
}

impl Tracer {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            vm_read_broken: Cell::new(false),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Block until the tracee reports a state change.
    pub fn wait(&self) -> Result<WaitEvent, Error> {
        loop {
            let status = match waitpid(self.pid, None) {
                Ok(status) => status,
                Err(Errno::ECHILD) => return Err(TraceeGone(self.pid)),
                Err(e) => return Err(Waitpid(e)),
            };
            debug!(target: "tracer", "received new tracee status: {status:?}");

            match status {
                WaitStatus::Exited(_, code) => return Ok(WaitEvent::Exited(code)),
                WaitStatus::Signaled(_, signal, _) => return Ok(WaitEvent::Killed(signal)),
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    let info = match sys::ptrace::getsiginfo(self.pid) {
                        Ok(info) => info,
                        Err(Errno::ESRCH) => return Err(TraceeGone(self.pid)),
                        Err(e) => return Err(Ptrace(e)),
                    };
                    match info.si_code {
                        code::TRAP_BRKPT | code::SI_KERNEL => return Ok(WaitEvent::Breakpoint),
                        code::TRAP_TRACE => return Ok(WaitEvent::SingleStep),
                        code => {
                            debug!(target: "tracer", "unexpected SIGTRAP code {code}");
                            return Ok(WaitEvent::SingleStep);
                        }
                    }
                }
                WaitStatus::Stopped(_, signal) => return Ok(WaitEvent::Signal(signal)),
                _ => {
                    warn!(target: "tracer", "unexpected wait status: {status:?}");
                }
            }
        }
    }

    /// Resume the tracee, optionally injecting a signal.
    pub fn cont(&self, signal: Option<Signal>) -> Result<(), Error> {
        match sys::ptrace::cont(self.pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(TraceeGone(self.pid)),
            Err(e) => Err(Ptrace(e)),
        }
    }

    /// Execute exactly one instruction, then stop with `TRAP_TRACE`. A pending
    /// signal is delivered together with the step.
    pub fn single_step(&self, signal: Option<Signal>) -> Result<(), Error> {
        match sys::ptrace::step(self.pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(TraceeGone(self.pid)),
            Err(e) => Err(Ptrace(e)),
        }
    }

    fn register(&self, register: Register) -> Result<u64, Error> {
        let map = RegisterMap::current(self.pid).map_err(Ptrace)?;
        Ok(map.value(register))
    }

    pub fn pc(&self) -> Result<u64, Error> {
        self.register(Register::Pc)
    }

    pub fn set_pc(&self, value: u64) -> Result<(), Error> {
        let mut map = RegisterMap::current(self.pid).map_err(Ptrace)?;
        map.update(Register::Pc, value);
        map.persist(self.pid).map_err(Ptrace)
    }

    /// Base pointer of the live frame.
    pub fn bp(&self) -> Result<u64, Error> {
        self.register(Register::Bp)
    }

    /// Machine word at the current stack pointer. Read immediately after the traced
    /// function first instruction stopped, before the callee has altered the stack.
    pub fn read_return_address(&self) -> Result<u64, Error> {
        let sp = self.register(Register::Sp)?;
        let word = self.read_word(sp as usize)?;
        if PTR_SIZE == 8 {
            Ok(word)
        } else {
            Ok(word & u32::MAX as u64)
        }
    }

    /// Read an 8-byte little-endian word. On 32-bit hosts this is a pair of
    /// 4-byte `ptrace` reads assembled in address order.
    pub fn read_word(&self, addr: usize) -> Result<u64, Error> {
        let word = mem::size_of::<c_long>();
        let mut buf = [0u8; 8];
        let mut off = 0;
        while off < buf.len() {
            let value = sys::ptrace::read(self.pid, (addr + off) as *mut c_void)
                .map_err(|e| MemoryAccess {
                    addr: addr + off,
                    source: e,
                })?;
            buf[off..off + word].copy_from_slice(&value.to_le_bytes());
            off += word;
        }
        Ok(u64::from_le_bytes(buf))
    }

    /// Write an 8-byte little-endian word, split into `c_long`-sized stores.
    pub fn write_word(&self, addr: usize, value: u64) -> Result<(), Error> {
        let word = mem::size_of::<c_long>();
        let bytes = value.to_le_bytes();
        let mut off = 0;
        while off < bytes.len() {
            let mut chunk = [0u8; mem::size_of::<c_long>()];
            chunk.copy_from_slice(&bytes[off..off + word]);
            let data = c_long::from_le_bytes(chunk);
            unsafe {
                sys::ptrace::write(self.pid, (addr + off) as *mut c_void, data as *mut c_void)
                    .map_err(|e| MemoryAccess {
                        addr: addr + off,
                        source: e,
                    })?;
            }
            off += word;
        }
        Ok(())
    }

    /// Fetch an arbitrary span of tracee memory. Prefers the kernel cross-process
    /// read, falling back to a word-at-a-time `ptrace` loop when it is unavailable.
    pub fn read_bytes(&self, addr: usize, len: usize) -> Result<Vec<u8>, Error> {
        if !self.vm_read_broken.get() {
            let mut buf = vec![0u8; len];
            let mut local_iov = [IoSliceMut::new(&mut buf)];
            let remote_iov = [RemoteIoVec { base: addr, len }];
            match process_vm_readv(self.pid, &mut local_iov, &remote_iov) {
                Ok(n) if n == len => return Ok(buf),
                Ok(n) => {
                    debug!(target: "tracer", "partial cross-process read ({n} of {len} bytes)");
                }
                Err(Errno::ENOSYS) | Err(Errno::EPERM) => {
                    self.vm_read_broken.set(true);
                    debug!(target: "tracer", "process_vm_readv unavailable, switch to ptrace reads");
                }
                Err(e) => return Err(MemoryAccess { addr, source: e }),
            }
        }

        let single_read_size = mem::size_of::<c_long>();
        let mut read_reminder = len as isize;
        let mut result = Vec::with_capacity(len);
        let mut addr = addr;
        while read_reminder > 0 {
            let value = sys::ptrace::read(self.pid, addr as *mut c_void)
                .map_err(|e| MemoryAccess { addr, source: e })?;
            result.extend(value.to_le_bytes().into_iter().take(read_reminder as usize));
            read_reminder -= single_read_size as isize;
            addr += single_read_size;
        }
        debug_assert!(result.len() == len);

        Ok(result)
    }

    /// Cancel the session by killing the tracee; the next `wait` returns an exit event.
    pub fn kill(&self) {
        let _ = sys::signal::kill(self.pid, SIGKILL);
    }
}
