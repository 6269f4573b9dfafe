use crate::debugger::error::Error;
use crate::debugger::error::Error::{Ptrace, Waitpid};
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::marker::PhantomData;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Process state.
pub trait State {}

/// Process running and attached with `ptrace` system call.
pub struct Installed;

impl State for Installed {}

/// Process prepare for instantiation by a `fork` call.
pub struct Template;

impl State for Template {}

/// Tracee process handle.
pub struct Child<S: State> {
    pub program: String,
    args: Vec<String>,
    pid: Option<Pid>,
    _p: PhantomData<S>,
}

impl Child<Template> {
    /// Create new process, but dont start it.
    ///
    /// # Arguments
    ///
    /// * `program`: program name
    /// * `args`: program arguments
    pub fn new<ARGS: IntoIterator<Item = I>, I: Into<String>>(
        program: impl Into<String>,
        args: ARGS,
    ) -> Child<Template> {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            pid: None,
            _p: PhantomData,
        }
    }

    /// Instantiate the process with the caller as tracer. The child requests to be
    /// traced and execs the program; address space randomization is disabled so the
    /// non-relocated debug information stays valid. Returns after the post-`execve`
    /// trap has been consumed.
    pub fn install(&self) -> Result<Child<Installed>, Error> {
        let mut debugee_cmd = Command::new(&self.program);
        debugee_cmd.args(&self.args);

        unsafe {
            debugee_cmd.pre_exec(move || {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                sys::ptrace::traceme()?;
                Ok(())
            });
        }

        let child = debugee_cmd.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);

        waitpid(pid, None).map_err(Waitpid)?;
        sys::ptrace::setoptions(pid, Options::PTRACE_O_EXITKILL).map_err(Ptrace)?;

        Ok(Child {
            program: self.program.clone(),
            args: self.args.clone(),
            pid: Some(pid),
            _p: PhantomData,
        })
    }
}

impl Child<Installed> {
    /// Return running process pid.
    pub fn pid(&self) -> Pid {
        self.pid.expect("installed process always has a pid")
    }
}
