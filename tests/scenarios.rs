/// End-to-end interpreter scenarios: whole programs through the
/// front-end, the optimising dispatch layer and the genie, with the
/// default INT transput format pinned exactly.

use pretty_assertions::assert_eq;

use a68::clauses::RunOutcome;
use a68::errors::GenieError;
use a68::{run_source, Conf};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn run(src: &str) -> (RunOutcome, String) {
    run_source(src, Conf::default()).expect("program should parse")
}

fn run_ok(src: &str) -> String {
    let (outcome, out) = run(src);
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false }, "program should succeed");
    out
}

fn run_err(src: &str) -> GenieError {
    let (outcome, _) = run(src);
    match outcome {
        RunOutcome::Failed { error, .. } => error,
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

// ─── Default transput format ──────────────────────────────────────────────────

#[test]
fn int_addition_prints_in_eleven_columns() {
    let out = run_ok("BEGIN INT i := 2 + 3; print(i) END");
    assert_eq!(out, "         +5");
}

#[test]
fn row_subscription_prints_the_element() {
    let out = run_ok("BEGIN [1:3] INT a := (10,20,30); print(a[2]) END");
    assert_eq!(out, "        +20");
}

#[test]
fn recursive_procedure_computes_factorial() {
    let out = run_ok(
        "BEGIN PROC fac = (INT n) INT: IF n<=1 THEN 1 ELSE n * fac(n-1) FI; print(fac(5)) END",
    );
    assert_eq!(out, "       +120");
}

#[test]
fn counted_loop_prints_each_value() {
    let out = run_ok("BEGIN FOR i FROM 1 TO 3 DO print(i) OD END");
    assert_eq!(out, "         +1         +2         +3");
}

#[test]
fn loc_and_heap_generators_assign_through_names() {
    let out = run_ok("BEGIN REF INT r; r := LOC INT := 7; print(r) END");
    assert_eq!(out, "         +7");
    let out = run_ok("BEGIN REF INT r; r := HEAP INT := 7; print(r) END");
    assert_eq!(out, "         +7");
}

#[test]
fn heap_generation_is_observable_in_gc_stats() {
    let (mut genie, out) =
        a68::genie_for("BEGIN REF INT r; r := HEAP INT := 7; print(r) END", Conf::default())
            .expect("program should parse");
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    assert_eq!(out.take_string(), "         +7");
    assert!(genie.gc_stats().allocations >= 1, "HEAP must allocate a handle");
}

// ─── Clauses ──────────────────────────────────────────────────────────────────

#[test]
fn conditional_branches_on_the_enquiry() {
    let out = run_ok("BEGIN INT x := 10; IF x > 5 THEN print(x) ELSE print(0) FI END");
    assert_eq!(out, "        +10");
}

#[test]
fn elif_chains_share_one_fi() {
    let out = run_ok(
        "BEGIN INT x := 2; IF x = 1 THEN print(1) ELIF x = 2 THEN print(2) ELSE print(3) FI END",
    );
    assert_eq!(out, "         +2");
}

#[test]
fn brief_conditional_selects_a_value() {
    let out = run_ok("BEGIN INT x := 7; print((x > 5 | 1 | 0)) END");
    assert_eq!(out, "         +1");
}

#[test]
fn omitted_else_yields_an_undefined_value_only_if_read() {
    let out = run_ok("BEGIN INT x := 5; INT y = IF x > 9 THEN 1 FI; print(1) END");
    assert_eq!(out, "         +1");
    let err = run_err("BEGIN INT x := 5; INT y = IF x > 9 THEN 1 FI; print(y) END");
    assert!(matches!(err, GenieError::UninitialisedValue { .. }), "got {:?}", err);
}

#[test]
fn integer_case_picks_the_kth_unit() {
    let out = run_ok("BEGIN INT k := 2; print(CASE k IN 10, 20, 30 ESAC) END");
    assert_eq!(out, "        +20");
}

#[test]
fn integer_case_misses_into_the_out_part() {
    let out = run_ok("BEGIN INT k := 9; print(CASE k IN 10, 20 OUT 99 ESAC) END");
    assert_eq!(out, "        +99");
}

#[test]
fn conformity_case_matches_the_runtime_mode() {
    let out = run_ok(
        "BEGIN UNION (INT, REAL) u := 42; CASE u IN (INT i): print(i), (REAL r): print(0) ESAC END",
    );
    assert_eq!(out, "        +42");
}

#[test]
fn conformity_without_matching_specifier_or_out_part_is_an_error() {
    let err = run_err(
        "BEGIN UNION (INT, CHAR) u := \"x\"; CASE u IN (INT i): print(i) ESAC END",
    );
    assert_eq!(err, GenieError::ConformityMismatch);
}

#[test]
fn while_loop_runs_until_the_enquiry_fails() {
    let out = run_ok("BEGIN INT i := 0; WHILE i < 3 DO i := i + 1 OD; print(i) END");
    assert_eq!(out, "         +3");
}

#[test]
fn to_loop_without_for_still_counts() {
    let out = run_ok("BEGIN INT s := 0; TO 3 DO s := s + 1 OD; print(s) END");
    assert_eq!(out, "         +3");
}

#[test]
fn downto_counts_downwards() {
    let out = run_ok("BEGIN FOR i FROM 3 DOWNTO 1 DO print(i) OD END");
    assert_eq!(out, "         +3         +2         +1");
}

#[test]
fn until_part_stops_the_loop() {
    let out = run_ok("BEGIN INT i := 0; DO i := i + 1 UNTIL i >= 4 OD; print(i) END");
    assert_eq!(out, "         +4");
}

// ─── Jumps ────────────────────────────────────────────────────────────────────

#[test]
fn goto_resumes_the_serial_clause_at_the_label() {
    let out = run_ok(
        "BEGIN INT i := 0; again: i := i + 1; IF i < 3 THEN GOTO again FI; print(i) END",
    );
    assert_eq!(out, "         +3");
}

#[test]
fn goto_unwinds_out_of_nested_frames() {
    let out = run_ok(
        "BEGIN INT i := 0; again: i := i + 1; BEGIN IF i < 2 THEN GOTO again FI END; print(i) END",
    );
    assert_eq!(out, "         +2");
}

// ─── Declarations, operators, procedures ──────────────────────────────────────

#[test]
fn identity_declarations_bind_constants() {
    let out = run_ok("BEGIN INT n = 5; print(n * n) END");
    assert_eq!(out, "        +25");
}

#[test]
fn user_operators_shadow_nothing_and_dispatch_by_mode() {
    let out = run_ok(
        "BEGIN PRIO PLUS = 6; OP PLUS = (INT a, INT b) INT: a + b + 100; print(1 PLUS 2) END",
    );
    assert_eq!(out, "       +103");
}

#[test]
fn partial_parametrisation_returns_a_new_proc() {
    let out = run_ok(
        "BEGIN PROC add = (INT a, INT b) INT: a + b; PROC (INT) INT add2 := add(2); print(add2(3)) END",
    );
    assert_eq!(out, "         +5");
}

#[test]
fn procedures_capture_their_environ() {
    let out = run_ok(
        "BEGIN INT base := 40; PROC bump = (INT n) INT: base + n; print(bump(2)) END",
    );
    assert_eq!(out, "        +42");
}

#[test]
fn structures_select_fields_through_names() {
    let out = run_ok(
        "BEGIN STRUCT (INT x, INT y) p := (3, 4); print(y OF p) END",
    );
    assert_eq!(out, "         +4");
}

// ─── Identity relations and values ────────────────────────────────────────────

#[test]
fn unassigned_ref_variables_are_nil() {
    let out = run_ok("BEGIN REF INT r; print(r IS NIL) END");
    assert_eq!(out, "T");
    let out = run_ok("BEGIN REF INT r; r := LOC INT := 1; print(r IS NIL) END");
    assert_eq!(out, "F");
    let out = run_ok("BEGIN REF INT r; print(r ISNT NIL) END");
    assert_eq!(out, "F");
}

#[test]
fn skip_yields_an_initialised_value() {
    let out = run_ok("BEGIN INT x := SKIP; print(1) END");
    assert_eq!(out, "         +1");
}

#[test]
fn short_circuit_operators_skip_the_right_operand() {
    // The right operand would divide by zero if evaluated.
    let out = run_ok("BEGIN INT z := 0; print(FALSE ANDF 1 OVER z > 0) END");
    assert_eq!(out, "F");
    let out = run_ok("BEGIN INT z := 0; print(TRUE ORF 1 OVER z > 0) END");
    assert_eq!(out, "T");
}

#[test]
fn empty_row_display_builds_a_well_formed_descriptor() {
    let out = run_ok("BEGIN [] INT e = (); print(99) END");
    assert_eq!(out, "        +99");
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[test]
fn reading_an_uninitialised_value_is_detected() {
    let err = run_err("BEGIN INT i; print(i) END");
    assert!(matches!(err, GenieError::UninitialisedValue { .. }), "got {:?}", err);
}

#[test]
fn scope_violations_are_refused_at_assignment() {
    let err = run_err("BEGIN REF INT r; BEGIN INT x := 1; r := x END END");
    assert!(matches!(err, GenieError::ScopeViolation { .. }), "got {:?}", err);
}

#[test]
fn integer_overflow_is_a_runtime_error() {
    let err = run_err("BEGIN print(max int + 1) END");
    assert!(matches!(err, GenieError::IntegerOverflow { .. }), "got {:?}", err);
}

#[test]
fn integer_division_by_zero_is_a_runtime_error() {
    let err = run_err("BEGIN INT z := 0; print(1 OVER z) END");
    assert_eq!(err, GenieError::DivisionByZero);
}

#[test]
fn subscripts_are_bounds_checked() {
    let err = run_err("BEGIN [1:3] INT a := (1,2,3); print(a[4]) END");
    assert_eq!(err, GenieError::IndexOutOfBounds { index: 4, lower: 1, upper: 3 });
}

#[test]
fn multiple_assign_requires_matching_bounds() {
    let err = run_err("BEGIN [1:3] INT a := (1,2,3); [1:2] INT b := (1,2); a := b END");
    assert_eq!(err, GenieError::DifferentBounds);
}

#[test]
fn false_assertions_are_runtime_errors() {
    let err = run_err("BEGIN ASSERT 1 > 2; print(1) END");
    assert_eq!(err, GenieError::FalseAssertion);
    let out = run_ok("BEGIN ASSERT 2 > 1; print(1) END");
    assert_eq!(out, "         +1");
}

#[test]
fn assigning_through_nil_is_an_error() {
    let err = run_err("BEGIN REF INT r = NIL; r := 1; print(1) END");
    assert!(
        matches!(err, GenieError::AccessThroughNil | GenieError::NilDereference),
        "got {:?}",
        err
    );
}

// ─── Stack discipline ─────────────────────────────────────────────────────────

#[test]
fn the_expression_stack_balances_after_a_run() {
    let (mut genie, _out) = a68::genie_for(
        "BEGIN INT i := 1; FOR k TO 3 DO i := i + k OD; print(i) END",
        Conf::default(),
    )
    .expect("program should parse");
    genie.run();
    assert_eq!(genie.sp(), 0, "a voided program leaves an empty expression stack");
}

#[test]
fn a_yielding_program_leaves_exactly_its_result() {
    let (mut genie, _out) =
        a68::genie_for("BEGIN 40 + 2 END", Conf::default()).expect("program should parse");
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    assert_eq!(genie.sp(), 1, "one INT slot for one INT program");
}

// ─── Determinism ──────────────────────────────────────────────────────────────

#[test]
fn evaluation_is_deterministic_across_runs() {
    let src = "BEGIN INT a := 3; INT b := 4; print(a * b + a OVER b) END";
    let first = run_ok(src);
    let second = run_ok(src);
    assert_eq!(first, second);
}

#[test]
fn random_draws_change_but_stay_in_range() {
    let out = run_ok(
        "BEGIN REAL x := random; ASSERT x >= 0.0 ANDF x < 1.0; print(1) END",
    );
    assert_eq!(out, "         +1");
}
