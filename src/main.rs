//! Variable watcher application entry point.

use clap::Parser;
use crossterm::tty::IsTty;
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::exit;
use varwatch::debugger::analysis::AnalysisConfig;
use varwatch::debugger::{Debugger, DoNothingHook, ScopeSelection, VarFilter, WatchOptions};
use varwatch::ui::console::{ConsoleHook, LineEcho};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Executable file (debugee)
    executable: PathBuf,

    /// Function to watch
    function: String,

    /// Arguments are passed to debugee
    #[arg(raw(true))]
    args: Vec<String>,

    /// Echo each executed source line
    #[arg(short = 'l', long)]
    show_lines: bool,

    /// Source context lines shown around each executed line (implies line echo)
    #[arg(short = 'c', long, default_value_t = 0)]
    context: u64,

    /// Watch local variables only
    #[arg(long, conflicts_with = "only_globals")]
    only_locals: bool,

    /// Watch global variables only
    #[arg(long)]
    only_globals: bool,

    /// Never report these variables
    #[arg(short = 'i', long, value_delimiter = ',', conflicts_with = "watch")]
    ignore: Vec<String>,

    /// Report only these variables
    #[arg(short = 'w', long, value_delimiter = ',')]
    watch: Vec<String>,

    /// Redirect watch output to a file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Print resolved debug information and the breakpoint plan, then exit
    #[arg(short = 'd', long)]
    dump_all: bool,

    /// Narrow breakpoints to assignment-bearing statements via source analysis
    #[arg(short = 'S', long)]
    static_analysis: bool,

    /// Include directory for the source analysis preprocessor
    #[arg(short = 'I', long = "include")]
    includes: Vec<String>,

    /// Macro definition for the source analysis preprocessor
    #[arg(short = 'D', long = "define")]
    defines: Vec<String>,

    /// Macro to undefine for the source analysis preprocessor
    #[arg(short = 'U', long = "undef")]
    undefines: Vec<String>,

    /// C standard passed to the source analysis preprocessor
    #[arg(long)]
    std: Option<String>,

    /// Unsafe: keep a single breakpoint per distinct source line
    #[arg(long)]
    avoid_equal_statements: bool,
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = watch(args) {
        eprintln!("error: {e:#}");
        exit(1);
    }
}

fn watch(args: Args) -> anyhow::Result<()> {
    let filter = if !args.watch.is_empty() {
        VarFilter::Watch(HashSet::from_iter(args.watch.iter().cloned()))
    } else if !args.ignore.is_empty() {
        VarFilter::Ignore(HashSet::from_iter(args.ignore.iter().cloned()))
    } else {
        VarFilter::None
    };

    let selection = if args.only_locals {
        ScopeSelection::OnlyLocals
    } else if args.only_globals {
        ScopeSelection::OnlyGlobals
    } else {
        ScopeSelection::All
    };

    let options = WatchOptions {
        filter,
        selection,
        avoid_equal_statements: args.avoid_equal_statements,
        analysis: args.static_analysis.then(|| AnalysisConfig {
            includes: args.includes.clone(),
            defines: args.defines.clone(),
            undefines: args.undefines.clone(),
            std: args.std.clone(),
        }),
    };

    let debugger = Debugger::new(&args.executable, &args.function, options, DoNothingHook {})?;

    let (mut out, colors): (Box<dyn Write>, bool) = match args.output {
        Some(ref path) => (Box::new(std::fs::File::create(path)?), false),
        None => {
            let stdout = io::stdout();
            let colors = stdout.is_tty();
            (Box::new(stdout), colors)
        }
    };

    if args.dump_all {
        debugger.dump(&mut out)?;
        return Ok(());
    }

    let echo = if args.context > 0 {
        LineEcho::Detailed {
            context: args.context,
        }
    } else if args.show_lines {
        LineEcho::Default
    } else {
        LineEcho::Null
    };
    let source = debugger.source_file().map(Path::to_path_buf);
    let hook = ConsoleHook::new(out, colors, echo, source);

    // the tracee exit code is reported through the hook, a completed session
    // itself is a success
    let debugger = debugger.with_hook(hook);
    debugger.run(&args.args)?;

    Ok(())
}
