/// Scripted monitor sessions: breakpoints, conditional breakpoints,
/// watchpoints, stepping and the expression evaluator over live frames.

use std::io::Cursor;

use a68::clauses::RunOutcome;
use a68::conf::Conf;
use a68::monitor;
use a68::{genie_for, Genie, SharedOut};

const PROGRAM: &str = "BEGIN\nINT i := 2 + 3;\nprint(i)\nEND";

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn session(src: &str, script: &str, breakpoint: Option<u32>) -> (Genie, SharedOut) {
    let (mut genie, out) = genie_for(src, Conf::default()).expect("program should parse");
    if let Some(line) = breakpoint {
        let hits = monitor::set_line_breakpoint(&mut genie, line, None);
        assert!(hits > 0, "the breakpoint must land on a unit");
    }
    genie.monitor.set_input(Box::new(Cursor::new(script.as_bytes().to_vec())));
    (genie, out)
}

// ─── Breakpoints ──────────────────────────────────────────────────────────────

#[test]
fn breakpoint_suspends_and_evaluate_reads_the_frame() {
    let (mut genie, out) = session(PROGRAM, "evaluate i\ncontinue\n", Some(3));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    let text = out.take_string();
    assert!(text.contains("stopped at line 3"), "monitor must announce the stop:\n{}", text);
    assert!(text.contains("+5"), "evaluate i prints +5:\n{}", text);
    assert!(text.ends_with("         +5"), "the program still completes:\n{}", text);
}

#[test]
fn x_abbreviates_evaluate_and_expressions_use_the_runtime() {
    let (mut genie, out) = session(PROGRAM, "x i * 2 + 1\ncontinue\n", Some(3));
    genie.run();
    let text = out.take_string();
    assert!(text.contains("+11"), "x i * 2 + 1 must print +11:\n{}", text);
}

#[test]
fn conditional_breakpoint_false_never_stops() {
    let (mut genie, out) = genie_for(PROGRAM, Conf::default()).expect("program should parse");
    monitor::set_line_breakpoint(&mut genie, 3, Some("i > 10".into()));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    let text = out.take_string();
    assert!(!text.contains("stopped"), "a false condition never enters the monitor");
    assert_eq!(text, "         +5");
}

#[test]
fn conditional_breakpoint_true_stops() {
    let (mut genie, out) = genie_for(PROGRAM, Conf::default()).expect("program should parse");
    monitor::set_line_breakpoint(&mut genie, 3, Some("i > 1".into()));
    genie.monitor.set_input(Box::new(Cursor::new(b"continue\n".to_vec())));
    genie.run();
    let text = out.take_string();
    assert!(text.contains("stopped at line 3"), "{}", text);
}

#[test]
fn non_bool_condition_removes_the_breakpoint_with_a_warning() {
    let (mut genie, out) = genie_for(PROGRAM, Conf::default()).expect("program should parse");
    monitor::set_line_breakpoint(&mut genie, 3, Some("i + 1".into()));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    let text = out.take_string();
    assert!(text.contains("does not yield BOOL"), "{}", text);
    assert!(text.ends_with("         +5"), "{}", text);
}

#[test]
fn watchpoint_fires_when_the_condition_holds() {
    let (mut genie, out) = genie_for(PROGRAM, Conf::default()).expect("program should parse");
    genie.monitor.watch = Some("i = 5".into());
    genie.monitor.set_input(Box::new(Cursor::new(b"continue\n".to_vec())));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    let text = out.take_string();
    assert!(text.contains("watchpoint 'i = 5' holds"), "{}", text);
}

// ─── Stepping ─────────────────────────────────────────────────────────────────

#[test]
fn step_stops_at_the_next_interruptible_unit() {
    let (mut genie, out) = session(PROGRAM, "step\ncontinue\n", Some(2));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    let text = out.take_string();
    assert!(text.contains("stopped at line 2"), "{}", text);
    assert!(text.contains("stopped at line 3"), "step must stop again:\n{}", text);
}

#[test]
fn next_does_not_descend_into_callees() {
    let src = "BEGIN\nPROC f = (INT n) INT: n + 1;\nINT a := 1;\nINT b := f(a);\nprint(b)\nEND";
    let (mut genie, out) = session(src, "next\ncontinue\n", Some(3));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    let text = out.take_string();
    assert!(text.contains("stopped at line 3"), "{}", text);
    assert!(text.contains("stopped at line 4"), "next stops at the caller level:\n{}", text);
}

// ─── Session control ──────────────────────────────────────────────────────────

#[test]
fn quit_is_a_force_quit() {
    let (mut genie, _out) = session(PROGRAM, "quit\n", Some(3));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: true });
}

#[test]
fn eof_at_the_prompt_is_exit() {
    let (mut genie, _out) = session(PROGRAM, "", Some(3));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: true });
}

#[test]
fn rerun_restarts_the_same_job() {
    let (mut genie, out) = session(PROGRAM, "rerun\ncontinue\n", Some(3));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    let text = out.take_string();
    let stops = text.matches("stopped at line 3").count();
    assert_eq!(stops, 2, "rerun re-enters the breakpoint:\n{}", text);
    assert!(text.ends_with("         +5"), "{}", text);
}

#[test]
fn inspection_commands_render_frames_and_storage() {
    let script = "where\nstack\nframe\nsizes\nheap\nexamine i\nlist 1 4\nbreakpoint list\ncontinue\n";
    let (mut genie, out) = session(PROGRAM, script, Some(3));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    let text = out.take_string();
    assert!(text.contains("at line 3"), "{}", text);
    assert!(text.contains("level"), "stack lists frames:\n{}", text);
    assert!(text.contains("REF INT i"), "frame shows the tag:\n{}", text);
    assert!(text.contains("expression stack"), "sizes reports storage:\n{}", text);
    assert!(text.contains("heap:"), "{}", text);
    assert!(text.contains("breakpoint at line 3"), "{}", text);
}

#[test]
fn ht_and_rt_gate_the_transput() {
    let (mut genie, out) = session(PROGRAM, "ht\ncontinue\n", Some(3));
    genie.run();
    let text = out.take_string();
    assert!(!text.ends_with("+5"), "ht suppresses program output:\n{}", text);

    let (mut genie, out) = session(PROGRAM, "ht\nrt\ncontinue\n", Some(3));
    genie.run();
    let text = out.take_string();
    assert!(text.ends_with("         +5"), "rt restores program output:\n{}", text);
}

#[test]
fn error_under_debug_reenters_the_monitor() {
    let src = "BEGIN\nINT i;\nprint(i)\nEND";
    let conf = Conf { debug: true, ..Conf::default() };
    let (mut genie, out) = genie_for(src, conf).expect("program should parse");
    genie.monitor.set_input(Box::new(Cursor::new(b"stack\nquit\n".to_vec())));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: true });
    let text = out.take_string();
    assert!(text.contains("runtime error"), "{}", text);
}

#[test]
fn unknown_commands_are_reported_not_fatal() {
    let (mut genie, out) = session(PROGRAM, "frobnicate\ncontinue\n", Some(3));
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    let text = out.take_string();
    assert!(text.contains("unknown command"), "{}", text);
}
