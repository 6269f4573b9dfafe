pub mod analysis;
pub mod breakpoint;
mod code;
pub mod debugee;
pub mod error;
pub mod process;
pub mod register;
pub mod tracer;
pub mod variable;

pub use debugee::dwarf::{Function, Language, Line};
pub use variable::{Change, ScopeSelection, TransitionKind, VarFilter};

use crate::debugger::analysis::{AnalysisConfig, AnalysisError};
use crate::debugger::breakpoint::{BreakpointRegistry, SYNTHETIC_LINE};
use crate::debugger::debugee::Debugee;
use crate::debugger::error::Error;
use crate::debugger::process::Child;
use crate::debugger::tracer::{Tracer, WaitEvent};
use crate::debugger::variable::{Descriptor, FunctionContext, Scope};
use log::{info, warn};
use nix::sys::signal::{kill, SIGKILL};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Interface between the session loop and the presentation layer.
pub trait WatchHook {
    /// The traced function was entered, `depth` counts live invocations.
    fn on_enter(&mut self, function: &str, depth: usize) {
        _ = (function, depth);
    }

    /// A statement line is about to execute.
    fn on_statement(&mut self, line: u64) {
        _ = line;
    }

    /// A watched variable (or array element) transitioned at `line`.
    fn on_change(&mut self, line: u64, depth: usize, change: &Change) {
        _ = (line, depth, change);
    }

    /// The traced function invocation at `depth` is returning.
    fn on_return(&mut self, function: &str, depth: usize) {
        _ = (function, depth);
    }

    /// The tracee exited with a code.
    fn on_exit(&mut self, code: i32) {
        _ = code;
    }
}

pub struct DoNothingHook {}

impl WatchHook for DoNothingHook {}

/// Knobs of one watch session.
#[derive(Default)]
pub struct WatchOptions {
    pub filter: VarFilter,
    pub selection: ScopeSelection,
    /// Unsafe: keep a single breakpoint per distinct source line.
    pub avoid_equal_statements: bool,
    /// Narrow breakpoints to assignment-bearing lines via source analysis.
    pub analysis: Option<AnalysisConfig>,
}

/// A variable watcher over one function of one spawned tracee.
pub struct Debugger {
    debugee: Debugee,
    function: Function,
    frame_base_offset: i64,
    descriptors: Vec<Rc<Descriptor>>,
    /// Statement records of the function.
    lines: Vec<Line>,
    /// Possibly analysis-narrowed subset of `lines` that receives breakpoints.
    breakpoint_lines: Vec<Line>,
    source_file: Option<PathBuf>,
    hook: Box<dyn WatchHook>,
    options: WatchOptions,
}

impl Debugger {
    /// Resolve all static facts about the target: function range, frame
    /// convention, watchable variables and the statement line table. Pre-flight
    /// failures (missing function, wrong language, PIE image, no frame pointer)
    /// are reported before any child is spawned.
    pub fn new(
        program: &Path,
        function_name: &str,
        options: WatchOptions,
        hook: impl WatchHook + 'static,
    ) -> Result<Self, Error> {
        let debugee = Debugee::new(program)?;

        let function = debugee.dwarf.find_function(function_name)?;
        let language = debugee.dwarf.language(&function);
        if language == Language::Other {
            return Err(Error::UnsupportedLanguage(language.to_string()));
        }

        let frame_base_offset = debugee.dwarf.frame_base_offset(&function)?;
        let descriptors: Vec<Rc<Descriptor>> = debugee
            .dwarf
            .variables(&function, frame_base_offset, &options.filter, options.selection)
            .into_iter()
            .map(Rc::new)
            .collect();
        let lines = debugee.dwarf.function_lines(&function);
        let source_file = debugee.dwarf.source_file(&function);

        let breakpoint_lines = match options.analysis {
            Some(ref config) => {
                narrow_lines(source_file.as_deref(), &function, config, &lines)?
            }
            None => lines.clone(),
        };

        Ok(Self {
            debugee,
            function,
            frame_base_offset,
            descriptors,
            lines,
            breakpoint_lines,
            source_file,
            hook: Box::new(hook),
            options,
        })
    }

    /// Replace the output capability, e.g. once the source file behind a
    /// presentation hook is known.
    pub fn with_hook(mut self, hook: impl WatchHook + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }

    /// One-shot report of the resolved debug information and the computed
    /// breakpoint plan, without spawning the tracee.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "function {} [{:#x}..={:#x}], frame base offset {}",
            self.function.name, self.function.low_pc, self.function.high_pc, self.frame_base_offset
        )?;
        if let Some(ref source) = self.source_file {
            writeln!(out, "source file {}", source.display())?;
        }

        writeln!(out, "variables ({}):", self.descriptors.len())?;
        for desc in &self.descriptors {
            let location = match desc.scope {
                Scope::Global { addr } => format!("at {addr:#x}"),
                Scope::Local { offset } => format!("bp{offset:+}"),
            };
            match desc.type_meta.array {
                Some(ref shape) => {
                    let extents: Vec<String> =
                        shape.extents.iter().map(|e| format!("[{e}]")).collect();
                    writeln!(
                        out,
                        "  {} {}{}: {} of {}-byte {}, {} bytes total, {}",
                        desc.scope.label(),
                        desc.name,
                        extents.concat(),
                        desc.type_meta.class,
                        shape.element_size,
                        shape.element_class,
                        desc.type_meta.byte_size,
                        location,
                    )?;
                }
                None => {
                    writeln!(
                        out,
                        "  {} {}: {}, {} bytes, {}",
                        desc.scope.label(),
                        desc.name,
                        desc.type_meta.class,
                        desc.type_meta.byte_size,
                        location,
                    )?;
                }
            }
        }

        writeln!(out, "statement lines:")?;
        for line in self.lines.iter().filter(|line| line.is_stmt) {
            writeln!(out, "  line {:<5} {:#x}", line.number, line.addr)?;
        }

        writeln!(out, "breakpoints:")?;
        for line in self.breakpoint_lines.iter().filter(|line| line.is_stmt) {
            writeln!(out, "  {:#x} (line {})", line.addr, line.number)?;
        }
        if !self
            .breakpoint_lines
            .iter()
            .any(|line| line.is_stmt && line.addr == self.function.low_pc)
        {
            writeln!(out, "  {:#x} (function entry)", self.function.low_pc)?;
        }

        Ok(())
    }

    /// Run one debugging session to the tracee end.
    ///
    /// Returns the tracee exit code; watch results are delivered through the hook.
    pub fn run(mut self, args: &[String]) -> Result<i32, Error> {
        let template = Child::new(self.debugee.path.to_string_lossy(), args.iter().cloned());
        let child = template.install()?;
        let tracer = Tracer::new(child.pid());

        // session cancellation: kill the tracee, the next wait observes the end
        let pid = child.pid();
        if let Err(e) = ctrlc::set_handler(move || {
            let _ = kill(pid, SIGKILL);
        }) {
            warn!(target: "debugger", "cancellation handler unavailable: {e}");
        }

        let mut breakpoints = BreakpointRegistry::with_lines(
            tracer.pid(),
            &self.breakpoint_lines,
            self.options.avoid_equal_statements,
        );
        breakpoints.add(self.function.low_pc, SYNTHETIC_LINE);
        breakpoints.arm_all()?;

        let mut contexts = vec![FunctionContext::new(&self.descriptors)];
        let mut active_frames = 0usize;

        tracer.cont(None)?;
        loop {
            match tracer.wait() {
                Err(Error::TraceeGone(_)) => {
                    info!(target: "debugger", "tracee is gone, session complete");
                    return Ok(0);
                }
                Err(e) => return Err(e),
                Ok(WaitEvent::Exited(code)) => {
                    self.hook.on_exit(code);
                    return Ok(code);
                }
                Ok(WaitEvent::Killed(signal)) => {
                    info!(target: "debugger", "tracee killed by {signal}, session complete");
                    return Ok(0);
                }
                Ok(WaitEvent::Signal(signal)) => tracer.cont(Some(signal))?,
                Ok(WaitEvent::SingleStep) => tracer.cont(None)?,
                Ok(WaitEvent::Breakpoint) => {
                    // the trap leaves the program counter one past the trap byte
                    let pc = (tracer.pc()? - 1) as usize;
                    if breakpoints.find(pc).is_none() {
                        // a stop unrelated to the watch set
                        tracer.cont(None)?;
                        continue;
                    }

                    let stop = self.handle_breakpoint(
                        pc,
                        &tracer,
                        &mut breakpoints,
                        &mut contexts,
                        &mut active_frames,
                    )?;
                    match stop {
                        Some(WaitEvent::Exited(code)) => {
                            self.hook.on_exit(code);
                            return Ok(code);
                        }
                        Some(_) => return Ok(0),
                        None => tracer.cont(None)?,
                    }
                }
            }
        }
    }

    /// Dispatch one owned breakpoint hit: function entry, function return or a
    /// statement stop. Always finishes by stepping the tracee through the
    /// original instruction, re-arming the trap.
    fn handle_breakpoint(
        &mut self,
        pc: usize,
        tracer: &Tracer,
        breakpoints: &mut BreakpointRegistry,
        contexts: &mut Vec<FunctionContext>,
        active_frames: &mut usize,
    ) -> Result<Option<WaitEvent>, Error> {
        let top_return_addr = contexts.last().and_then(|ctx| ctx.return_addr);

        if pc == self.function.low_pc {
            if *active_frames > 0 {
                // recursive re-entry, fresh value slots over the shared descriptors
                contexts.push(FunctionContext::new(&self.descriptors));
            } else if !contexts.last().expect("context stack is never empty").needs_init {
                // the function runs again after a completed invocation
                *contexts.last_mut().expect("context stack is never empty") =
                    FunctionContext::new(&self.descriptors);
            }
            *active_frames += 1;
            self.hook.on_enter(&self.function.name, *active_frames);

            // the callee has not touched the stack yet, its return address is on top
            let return_addr = tracer.read_return_address()? as usize;
            let ctx = contexts.last_mut().expect("context stack is never empty");
            ctx.return_addr = Some(return_addr);
            breakpoints.create_at(return_addr, SYNTHETIC_LINE)?;
        } else if *active_frames > 0 && top_return_addr == Some(pc) {
            self.hook.on_return(&self.function.name, *active_frames);
            let ctx = contexts.last_mut().expect("context stack is never empty");
            ctx.free_buffers();
            if contexts.len() > 1 {
                contexts.pop();
            }
            *active_frames -= 1;
        } else if *active_frames > 0 {
            let line_no = breakpoints
                .find(pc)
                .map(|brkpt| brkpt.line_no)
                .unwrap_or(SYNTHETIC_LINE);
            if line_no != SYNTHETIC_LINE {
                self.hook.on_statement(line_no);
            }

            let ctx = contexts.last_mut().expect("context stack is never empty");
            if ctx.needs_init {
                // first statement after the prologue: establish the baseline
                variable::initialize(&mut ctx.variables, tracer);
                ctx.needs_init = false;
            } else {
                // a change is attributed to the statement executed before this stop
                let line = ctx.prev_line.unwrap_or(line_no);
                let changes = variable::check_changes(&mut ctx.variables, tracer);
                for change in &changes {
                    self.hook.on_change(line, *active_frames, change);
                }
            }
            contexts
                .last_mut()
                .expect("context stack is never empty")
                .prev_line = Some(line_no);
        }

        breakpoints.step_through(pc, tracer)
    }
}

/// Apply the static-analysis narrowing with the documented fallback policy: a
/// missing source file is fatal for an explicitly requested analysis, while an
/// unparseable one degrades to the full line-table strategy.
fn narrow_lines(
    source_file: Option<&Path>,
    function: &Function,
    config: &AnalysisConfig,
    lines: &[Line],
) -> Result<Vec<Line>, Error> {
    let Some(source) = source_file else {
        return Err(Error::AnalysisUnavailable(
            "no source path in debug information".to_string(),
        ));
    };

    let recorded = match analysis::assignment_lines(source, &function.name, config) {
        Ok(recorded) => recorded,
        Err(e @ AnalysisError::SourceMissing(_)) => {
            return Err(Error::AnalysisUnavailable(e.to_string()));
        }
        Err(e) => {
            warn!(target: "debugger", "static analysis failed: {e}");
            eprintln!("warning: static analysis failed ({e}), falling back to all statement lines");
            return Ok(lines.to_vec());
        }
    };

    let mut narrowed: Vec<Line> = lines
        .iter()
        .filter(|line| line.is_stmt && recorded.contains(&line.number))
        .copied()
        .collect();

    // anchor the diffing at the end of the function: its last statement record
    // completes changes of the final recorded line
    if let Some(last) = lines.iter().filter(|line| line.is_stmt).max_by_key(|line| line.addr) {
        if !narrowed.iter().any(|line| line.addr == last.addr) {
            narrowed.push(*last);
        }
    }

    Ok(narrowed)
}
