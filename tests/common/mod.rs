use assert_cmd::cargo::CommandCargoExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Flags producing a debugee the watcher fully supports.
pub const SUPPORTED_FLAGS: &[&str] = &[
    "-g",
    "-gdwarf-2",
    "-O0",
    "-fno-omit-frame-pointer",
    "-no-pie",
    "-fno-pic",
];

/// Compile a C fixture with given flags, returning the executable path.
pub fn compile(fixture: &str, out_name: &str, flags: &[&str]) -> PathBuf {
    let src = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(fixture);
    let out = Path::new(env!("CARGO_TARGET_TMPDIR")).join(out_name);

    let status = Command::new("gcc")
        .args(flags)
        .arg("-o")
        .arg(&out)
        .arg(&src)
        .status()
        .expect("gcc is available");
    assert!(status.success(), "fixture `{fixture}` compilation failed");

    out
}

/// Run the watcher binary over a debugee and capture its output.
pub fn run_vw(debugee: &Path, function: &str, extra_args: &[&str]) -> Output {
    let mut cmd = Command::cargo_bin("vw").expect("binary exists");
    cmd.args(extra_args)
        .arg(debugee)
        .arg(function)
        .output()
        .expect("debugger runs")
}

pub fn stdout_of(output: &Output) -> String {
    String::from_utf8(output.stdout.clone()).expect("utf-8 output")
}

pub fn stderr_of(output: &Output) -> String {
    String::from_utf8(output.stderr.clone()).expect("utf-8 output")
}
