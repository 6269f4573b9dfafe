use nix::libc::user_regs_struct;
use nix::sys;
use nix::unistd::Pid;

/// Registers the watcher reads or writes on every tracee stop.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Register {
    /// Program counter (EIP/RIP).
    Pc,
    /// Base pointer (EBP/RBP).
    Bp,
    /// Stack pointer (ESP/RSP).
    Sp,
}

/// Pointer width of the traced ABI in bytes.
pub const PTR_SIZE: usize = arch::PTR_SIZE;

/// DWARF number of the base-pointer register.
pub const DWARF_BP: gimli::Register = arch::DWARF_BP;

/// Snapshot of the tracee general-purpose registers.
pub struct RegisterMap {
    regs: user_regs_struct,
}

impl RegisterMap {
    pub fn current(pid: Pid) -> nix::Result<Self> {
        let regs = sys::ptrace::getregs(pid)?;
        Ok(Self { regs })
    }

    pub fn value(&self, register: Register) -> u64 {
        arch::value(&self.regs, register)
    }

    pub fn update(&mut self, register: Register, value: u64) {
        arch::update(&mut self.regs, register, value);
    }

    pub fn persist(self, pid: Pid) -> nix::Result<()> {
        sys::ptrace::setregs(pid, self.regs)
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::Register;
    use nix::libc::user_regs_struct;

    pub const PTR_SIZE: usize = 8;
    pub const DWARF_BP: gimli::Register = gimli::X86_64::RBP;

    pub fn value(regs: &user_regs_struct, register: Register) -> u64 {
        match register {
            Register::Pc => regs.rip,
            Register::Bp => regs.rbp,
            Register::Sp => regs.rsp,
        }
    }

    pub fn update(regs: &mut user_regs_struct, register: Register, value: u64) {
        match register {
            Register::Pc => regs.rip = value,
            Register::Bp => regs.rbp = value,
            Register::Sp => regs.rsp = value,
        }
    }
}

#[cfg(target_arch = "x86")]
mod arch {
    use super::Register;
    use nix::libc::user_regs_struct;

    pub const PTR_SIZE: usize = 4;
    pub const DWARF_BP: gimli::Register = gimli::X86::EBP;

    pub fn value(regs: &user_regs_struct, register: Register) -> u64 {
        match register {
            Register::Pc => regs.eip as u64,
            Register::Bp => regs.ebp as u64,
            Register::Sp => regs.esp as u64,
        }
    }

    pub fn update(regs: &mut user_regs_struct, register: Register, value: u64) {
        match register {
            Register::Pc => regs.eip = value as _,
            Register::Bp => regs.ebp = value as _,
            Register::Sp => regs.esp = value as _,
        }
    }
}
