mod common;

use common::{compile, run_vw, stderr_of, stdout_of, SUPPORTED_FLAGS};
use serial_test::serial;

#[test]
#[serial]
fn test_scalar_initialisation_and_global_change() {
    let debugee = compile("vars.c", "vars", SUPPORTED_FLAGS);
    let output = run_vw(&debugee, "target", &[]);

    assert!(output.status.success());
    let stdout = stdout_of(&output);
    assert!(stdout.contains("Entering function target (depth 1)"));
    assert!(stdout.contains("line 12: local a initialized: 0 -> 3"));
    assert!(stdout.contains("line 13: global g_counter changed: 5 -> 6"));
    assert!(stdout.contains("line 14: local a changed: 3 -> 4"));
    assert!(stdout.contains("Returning from target (depth 1)"));
    assert!(stdout.contains("child exited with code 0"));
}

#[test]
#[serial]
fn test_one_dimensional_array() {
    let debugee = compile("array1d.c", "array1d", SUPPORTED_FLAGS);
    let output = run_vw(&debugee, "fill", &[]);

    assert!(output.status.success());
    let stdout = stdout_of(&output);
    for index in 0..10 {
        let expected = format!("line 9: local arr[{index}] changed: 0 -> {}", index + 1);
        assert!(
            stdout.contains(&expected),
            "missing element message `{expected}`:\n{stdout}"
        );
    }
}

#[test]
#[serial]
fn test_three_dimensional_array_single_cell() {
    let debugee = compile("array3d.c", "array3d", SUPPORTED_FLAGS);
    let output = run_vw(&debugee, "poke", &[]);

    assert!(output.status.success());
    let stdout = stdout_of(&output);
    assert!(stdout.contains("line 5: global cube[5][7][6] changed: 0 -> 1"));
    assert_eq!(
        stdout.lines().filter(|line| line.contains("cube[")).count(),
        1,
        "exactly one element must be reported:\n{stdout}"
    );
}

#[test]
#[serial]
fn test_recursion_tracks_contexts_separately() {
    let debugee = compile("recursion.c", "recursion", SUPPORTED_FLAGS);
    let output = run_vw(&debugee, "factorial", &[]);

    assert!(output.status.success());
    let stdout = stdout_of(&output);

    assert!(stdout.contains("Entering function factorial (depth 1)"));
    assert!(stdout.contains("Entering function factorial (depth 2)"));
    assert!(stdout.contains("Entering function factorial (depth 3)"));

    assert!(stdout.contains("line 5: local result initialized: 0 -> 3"));
    assert!(stdout.contains("line 5: local result initialized: 0 -> 2 (depth 2)"));
    assert!(stdout.contains("line 5: local result initialized: 0 -> 1 (depth 3)"));
    assert!(stdout.contains("line 7: local result changed: 3 -> 6"));

    // returns unwind in strict call order
    let ret3 = stdout
        .find("Returning from factorial (depth 3)")
        .expect("deepest return present");
    let ret2 = stdout
        .find("Returning from factorial (depth 2)")
        .expect("middle return present");
    let ret1 = stdout
        .find("Returning from factorial (depth 1)")
        .expect("outer return present");
    assert!(ret3 < ret2 && ret2 < ret1);
}

#[test]
#[serial]
fn test_ignore_list_suppresses_variables() {
    let debugee = compile("vars.c", "vars_ignore", SUPPORTED_FLAGS);
    let output = run_vw(&debugee, "target", &["-i", "a"]);

    assert!(output.status.success());
    let stdout = stdout_of(&output);
    assert!(!stdout.contains("local a"), "ignored variable leaked:\n{stdout}");
    assert!(stdout.contains("line 13: global g_counter changed: 5 -> 6"));
}

#[test]
#[serial]
fn test_watch_list_restricts_variables() {
    let debugee = compile("vars.c", "vars_watch", SUPPORTED_FLAGS);
    let output = run_vw(&debugee, "target", &["-w", "a"]);

    assert!(output.status.success());
    let stdout = stdout_of(&output);
    assert!(stdout.contains("line 12: local a initialized: 0 -> 3"));
    assert!(!stdout.contains("g_counter"), "unwatched variable leaked:\n{stdout}");
}

#[test]
#[serial]
fn test_only_globals_selection() {
    let debugee = compile("vars.c", "vars_globals", SUPPORTED_FLAGS);
    let output = run_vw(&debugee, "target", &["--only-globals"]);

    assert!(output.status.success());
    let stdout = stdout_of(&output);
    assert!(!stdout.contains("local a"));
    assert!(stdout.contains("line 13: global g_counter changed: 5 -> 6"));
}

#[test]
#[serial]
fn test_static_analysis_keeps_transitions() {
    let debugee = compile("vars.c", "vars_analysis", SUPPORTED_FLAGS);
    let output = run_vw(&debugee, "target", &["-S"]);

    assert!(output.status.success());
    let stdout = stdout_of(&output);
    assert!(stdout.contains("line 12: local a initialized: 0 -> 3"));
    assert!(stdout.contains("line 13: global g_counter changed: 5 -> 6"));
    assert!(stdout.contains("line 14: local a changed: 3 -> 4"));
}

#[test]
#[serial]
fn test_dump_all_reports_plan_without_running() {
    let debugee = compile("vars.c", "vars_dump", SUPPORTED_FLAGS);
    let output = run_vw(&debugee, "target", &["--dump-all"]);

    assert!(output.status.success());
    let stdout = stdout_of(&output);
    assert!(stdout.contains("function target"));
    assert!(stdout.contains("global g_counter"));
    assert!(stdout.contains("local a"));
    assert!(stdout.contains("statement lines:"));
    assert!(stdout.contains("breakpoints:"));
    // the tracee never runs in dump mode
    assert!(!stdout.contains("Entering function"));
}

#[test]
#[serial]
fn test_pie_executable_is_rejected() {
    let debugee = compile(
        "vars.c",
        "vars_pie",
        &["-g", "-gdwarf-2", "-O0", "-fno-omit-frame-pointer", "-pie", "-fPIC"],
    );
    let output = run_vw(&debugee, "target", &[]);

    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("position-independent"));
}

#[test]
#[serial]
fn test_missing_debug_info_is_rejected() {
    let debugee = compile("vars.c", "vars_nodebug", &["-O0", "-no-pie", "-fno-pic"]);
    let output = run_vw(&debugee, "target", &[]);

    assert!(!output.status.success());
    // the toolchain start files may carry stray units, either way `target`
    // has no usable debug information
    let stderr = stderr_of(&output);
    assert!(stderr.contains("no debug information") || stderr.contains("not found"));
}

#[test]
#[serial]
fn test_omitted_frame_pointer_is_rejected() {
    let debugee = compile(
        "vars.c",
        "vars_noframe",
        &["-g", "-gdwarf-2", "-O0", "-fomit-frame-pointer", "-no-pie", "-fno-pic"],
    );
    let output = run_vw(&debugee, "target", &[]);

    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("no base-pointer frame"));
}

#[test]
#[serial]
fn test_unknown_function_is_rejected() {
    let debugee = compile("vars.c", "vars_nofunc", SUPPORTED_FLAGS);
    let output = run_vw(&debugee, "no_such_function", &[]);

    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("not found"));
}
