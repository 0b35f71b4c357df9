/// Code generator behaviour: eligibility, constant folding, symbol
/// naming, PROP patching and semantic equivalence with generic
/// evaluation across optimisation levels.

use a68::clauses::RunOutcome;
use a68::codegen::CodeOp;
use a68::conf::Conf;
use a68::errors::GenieError;
use a68::value::Value;
use a68::{genie_for, run_source};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn run_at(src: &str, opt: u8) -> (RunOutcome, String) {
    let conf = Conf { opt_level: opt, ..Conf::default() };
    run_source(src, conf).expect("program should parse")
}

// ─── Equivalence across levels ────────────────────────────────────────────────

#[test]
fn compiled_threads_match_generic_evaluation() {
    let programs = [
        "BEGIN INT i := 1; i := i + 2; print(i) END",
        "BEGIN INT a := 6; INT b := 7; a := a * b; print(a) END",
        "BEGIN [1:3] INT a := (0,0,0); FOR i TO 3 DO a[i] := i * 10 OD; print(a[2]) END",
        "BEGIN REAL x := 2.0; x := x * 4.0; print(ENTIER x) END",
    ];
    for src in programs {
        let (o0, out0) = run_at(src, 0);
        let (o3, out3) = run_at(src, 3);
        assert_eq!(o0, RunOutcome::Exited { status: 0, force: false }, "{}", src);
        assert_eq!(o0, o3, "{}", src);
        assert_eq!(out0, out3, "levels must agree on {}", src);
    }
}

// ─── Eligibility and symbols ──────────────────────────────────────────────────

#[test]
fn eligible_units_register_deterministic_symbols() {
    let src = "BEGIN INT i := 1; i := i + 2; print(i) END";
    let (mut genie, _out) =
        genie_for(src, Conf { opt_level: 2, ..Conf::default() }).expect("program should parse");
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    assert!(!genie.plugin.is_empty(), "the voided assignation compiles");
    for i in 0..genie.plugin.len() as u32 {
        let unit = genie.plugin.unit(i).expect("registered unit");
        assert!(unit.name.starts_with("genie_"), "symbol scheme: {}", unit.name);
        assert!(
            genie.plugin.lookup(&unit.name) == Some(i),
            "exports are discovered by name"
        );
    }
}

#[test]
fn transput_calls_stay_interpreted() {
    let src = "BEGIN print(1) END";
    let (mut genie, out) =
        genie_for(src, Conf { opt_level: 3, ..Conf::default() }).expect("program should parse");
    genie.run();
    assert_eq!(out.take_string(), "         +1");
    assert!(genie.plugin.is_empty(), "print is never lifted into a thread");
}

// ─── Constant folding ─────────────────────────────────────────────────────────

#[test]
fn foldable_sources_become_literals() {
    let src = "BEGIN INT i := 1; i := 2 + 3; print(i) END";
    let (mut genie, out) =
        genie_for(src, Conf { opt_level: 2, ..Conf::default() }).expect("program should parse");
    genie.run();
    assert_eq!(out.take_string(), "         +5");
    let folded = (0..genie.plugin.len() as u32).any(|i| {
        genie.plugin.unit(i).map_or(false, |u| {
            u.ops.iter().any(|op| {
                matches!(op, CodeOp::PushConst(slots)
                    if slots.len() == 1 && slots[0] == Value::Int(5))
            })
        })
    });
    assert!(folded, "2 + 3 folds to a literal 5 in the emitted thread");
}

#[test]
fn folding_aborts_when_a_real_reaches_infinity() {
    let src = "BEGIN REAL r := 0.0; r := 1.0e308 * 10.0; print(1) END";
    let (outcome, _) = run_at(src, 2);
    match outcome {
        RunOutcome::Failed { error, .. } => {
            assert!(matches!(error, GenieError::MathError { .. }), "got {:?}", error)
        }
        other => panic!("the overflowing formula must fail at run time, got {:?}", other),
    }
}

// ─── Safety of emitted threads ────────────────────────────────────────────────

#[test]
fn emitted_threads_retain_initialisation_checks() {
    let src = "BEGIN INT i; INT j := 0; j := i + 1; print(j) END";
    let (outcome, _) = run_at(src, 2);
    match outcome {
        RunOutcome::Failed { error, .. } => {
            assert!(matches!(error, GenieError::UninitialisedValue { .. }), "got {:?}", error)
        }
        other => panic!("reading i must fail under --check, got {:?}", other),
    }
}

#[test]
fn emitted_threads_never_lose_bounds_checks() {
    let src = "BEGIN [1:3] INT a := (1,2,3); INT k := 4; a[k] := 0; print(1) END";
    let (outcome, _) = run_at(src, 3);
    match outcome {
        RunOutcome::Failed { error, .. } => {
            assert_eq!(error, GenieError::IndexOutOfBounds { index: 4, lower: 1, upper: 3 })
        }
        other => panic!("the compiled slice must bounds-check, got {:?}", other),
    }
}

#[test]
fn intermediate_text_is_assembled_from_emission_strings() {
    let src = "BEGIN INT i := 1; i := i + 2; print(i) END";
    let (mut genie, _out) =
        genie_for(src, Conf { opt_level: 2, ..Conf::default() }).expect("program should parse");
    genie.run();
    let any_text = (0..genie.plugin.len() as u32)
        .any(|i| genie.plugin.unit(i).map_or(false, |u| !u.text.is_empty()));
    assert!(any_text, "threads carry their intermediate text");
}
