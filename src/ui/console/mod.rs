use crate::debugger::{Change, WatchHook};
use crossterm::style::Stylize;
use log::warn;
use once_cell::sync::Lazy;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use syntect::easy::HighlightLines;
use syntect::highlighting::ThemeSet;
use syntect::parsing::SyntaxSet;
use syntect::util::as_24_bit_terminal_escaped;

static SYNTAXES: Lazy<SyntaxSet> = Lazy::new(SyntaxSet::load_defaults_newlines);
static THEMES: Lazy<ThemeSet> = Lazy::new(ThemeSet::load_defaults);

/// Paint one line of C source for a true-color terminal. Lines are echoed in
/// execution order, so each one is highlighted on its own.
fn paint_c_line(line: &str) -> String {
    let Some(syntax) = SYNTAXES.find_syntax_by_extension("c") else {
        return line.to_string();
    };
    let mut highlight = HighlightLines::new(syntax, &THEMES.themes["base16-ocean.dark"]);
    match highlight.highlight_line(line, &SYNTAXES) {
        Ok(regions) => format!("{}\x1b[0m", as_24_bit_terminal_escaped(&regions, false)),
        Err(_) => line.to_string(),
    }
}

/// Source lines of the traced function file, loaded once on first use.
struct FileView {
    lines: Vec<String>,
}

impl FileView {
    fn new(path: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self {
            lines: content.lines().map(ToString::to_string).collect(),
        })
    }

    fn line(&self, number: u64) -> Option<&str> {
        self.lines.get(number.checked_sub(1)? as usize).map(String::as_str)
    }

    fn line_count(&self) -> u64 {
        self.lines.len() as u64
    }
}

/// How executed source lines are echoed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEcho {
    /// No echo.
    #[default]
    Null,
    /// Echo each executed line.
    Default,
    /// Echo each executed line with surrounding context.
    Detailed { context: u64 },
}

/// Console implementation of the session output capability. Writes watch
/// notifications to stdout or to a redirect file.
pub struct ConsoleHook {
    out: Box<dyn Write>,
    colors: bool,
    echo: LineEcho,
    source_path: Option<PathBuf>,
    view: Option<FileView>,
}

impl ConsoleHook {
    pub fn new(
        out: Box<dyn Write>,
        colors: bool,
        echo: LineEcho,
        source_path: Option<PathBuf>,
    ) -> Self {
        Self {
            out,
            colors,
            echo,
            source_path,
            view: None,
        }
    }

    fn emit(&mut self, msg: impl AsRef<str>) {
        let _ = writeln!(self.out, "{}", msg.as_ref());
        let _ = self.out.flush();
    }

    /// Load the source file behind the echo lazily, degrading to no echo when
    /// it cannot be read.
    fn view(&mut self) -> Option<&FileView> {
        if self.view.is_none() {
            let Some(ref path) = self.source_path else {
                self.echo = LineEcho::Null;
                return None;
            };
            match FileView::new(path) {
                Ok(view) => self.view = Some(view),
                Err(e) => {
                    warn!(target: "debugger", "source file {} unavailable: {e}", path.display());
                    self.echo = LineEcho::Null;
                    return None;
                }
            }
        }
        self.view.as_ref()
    }

    fn render_source_line(&mut self, number: u64, marked: bool) -> Option<String> {
        let colors = self.colors;
        let text = self.view()?.line(number)?.to_string();
        let marker = if marked { '>' } else { ' ' };

        let rendered = if colors { paint_c_line(&text) } else { text };
        Some(format!("{marker}{number:>5} | {rendered}"))
    }

    fn echo_statement(&mut self, line: u64) {
        match self.echo {
            LineEcho::Null => {}
            LineEcho::Default => {
                if let Some(rendered) = self.render_source_line(line, false) {
                    self.emit(rendered);
                }
            }
            LineEcho::Detailed { context } => {
                let Some(line_count) = self.view().map(FileView::line_count) else {
                    return;
                };
                let first = line.saturating_sub(context).max(1);
                let last = (line + context).min(line_count);
                for number in first..=last {
                    if let Some(rendered) = self.render_source_line(number, number == line) {
                        self.emit(rendered);
                    }
                }
            }
        }
    }
}

impl WatchHook for ConsoleHook {
    fn on_enter(&mut self, function: &str, depth: usize) {
        let msg = format!("Entering function {function} (depth {depth})");
        if self.colors {
            self.emit(msg.bold().to_string());
        } else {
            self.emit(msg);
        }
    }

    fn on_statement(&mut self, line: u64) {
        self.echo_statement(line);
    }

    fn on_change(&mut self, line: u64, depth: usize, change: &Change) {
        let indices: String = change
            .indices
            .iter()
            .map(|index| format!("[{index}]"))
            .collect();
        let mut msg = format!(
            "line {line}: {} {}{indices} {}: {} -> {}",
            change.scope_label, change.name, change.kind, change.before, change.after
        );
        if depth > 1 {
            msg.push_str(&format!(" (depth {depth})"));
        }
        self.emit(msg);
    }

    fn on_return(&mut self, function: &str, depth: usize) {
        let msg = format!("Returning from {function} (depth {depth})");
        if self.colors {
            self.emit(msg.bold().to_string());
        } else {
            self.emit(msg);
        }
    }

    fn on_exit(&mut self, code: i32) {
        self.emit(format!("child exited with code {code}"));
    }
}
