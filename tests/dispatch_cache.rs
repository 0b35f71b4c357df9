/// Dispatch-cache behaviour observed through whole programs: PROP
/// installation, sequence threading, the OPTIMAL flag and self-tuning
/// on repeated execution.

use a68::clauses::{current_prop, RunOutcome};
use a68::conf::Conf;
use a68::genie_for;
use a68::prop::Prop;
use a68::tree::{NodeId, Status};

fn run_genie(src: &str, opt: u8) -> a68::Genie {
    let conf = Conf { opt_level: opt, ..Conf::default() };
    let (mut genie, _out) = genie_for(src, conf).expect("program should parse");
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    genie
}

fn props_of(genie: &a68::Genie) -> Vec<Prop> {
    (0..genie.tree.len() as u32).map(|i| current_prop(genie, NodeId(i))).collect()
}

#[test]
fn first_execution_installs_specialised_props() {
    let genie = run_genie("BEGIN INT i := 2 + 3; print(i) END", 0);
    let props = props_of(&genie);
    assert!(
        props.iter().any(|p| matches!(p, Prop::Constant)),
        "denotations cache constant blobs"
    );
    assert!(
        props.iter().any(|p| matches!(p, Prop::DyadicStd { .. })),
        "standenv formulas specialise to inline calls"
    );
    assert!(
        props.iter().any(|p| matches!(p, Prop::FrameLoad { .. })),
        "frame identifiers specialise to offset loads"
    );
    assert!(
        props.iter().any(|p| matches!(p, Prop::FrameDeref { .. })),
        "DEREF of a frame identifier earns its own evaluator"
    );
    assert!(
        props.iter().any(|p| matches!(p, Prop::StandProcCall(_))),
        "standard-environ calls dispatch directly"
    );
}

#[test]
fn standenv_identifiers_in_value_positions_push_the_procedure() {
    // `random` is deprocedured, so the identifier itself is evaluated
    // as a value and keeps the identifier PROP, distinct from the
    // call-site one.
    let genie = run_genie("BEGIN REAL r := random; print(1) END", 0);
    assert!(
        props_of(&genie).iter().any(|p| matches!(p, Prop::StandCall(_))),
        "a standenv identifier as a value installs its own evaluator"
    );
}

#[test]
fn standenv_calls_repeat_across_iterations() {
    // The call PROP must re-run arguments and the entry every time; a
    // cached one-shot would print once and leak a PROC slot.
    let conf = Conf::default();
    let (mut genie, out) =
        genie_for("BEGIN FOR i FROM 1 TO 3 DO print(i) OD END", conf).expect("program should parse");
    let outcome = genie.run();
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    assert_eq!(out.take_string(), "         +1         +2         +3");
    assert_eq!(genie.sp(), 0, "repeated standenv calls keep the stack balanced");
}

#[test]
fn slices_with_basic_indexers_specialise() {
    let genie = run_genie("BEGIN [1:3] INT a := (1,2,3); print(a[2]) END", 0);
    assert!(
        props_of(&genie).iter().any(|p| matches!(p, Prop::SliceBasic)),
        "a denotation-indexed slice installs the direct-indexing PROP"
    );
}

#[test]
fn single_unit_serial_clauses_are_optimal() {
    let genie = run_genie("BEGIN print(1) END", 0);
    let optimal = (0..genie.tree.len() as u32)
        .any(|i| genie.info.status(NodeId(i)).contains(Status::OPTIMAL | Status::SEQUENCE));
    assert!(optimal, "one-unit worklists are flagged OPTIMAL");
}

#[test]
fn repeated_execution_hits_the_cache() {
    let genie = run_genie(
        "BEGIN INT s := 0; FOR i TO 50 DO s := s + i OD; print(s) END",
        0,
    );
    assert!(
        genie.info.stats.specialised_hits > 50,
        "the loop body re-dispatches through installed PROPs ({} hits)",
        genie.info.stats.specialised_hits
    );
    assert!(genie.info.stats.installs > 0);
}

#[test]
fn codegen_promotion_rewrites_props_to_compiled_threads() {
    let genie = run_genie("BEGIN INT i := 1; i := i + 2; print(i) END", 2);
    assert!(
        props_of(&genie).iter().any(|p| matches!(p, Prop::Compiled(_))),
        "a compiled unit's PROP points at the exported thread"
    );
}

#[test]
fn cached_dispatch_is_equivalent_to_generic_evaluation() {
    // The loop body executes once generically (installing PROPs) and
    // once from the cache; the accumulated result must agree.
    let src = "BEGIN INT a := 0; FOR i TO 2 DO a := a + 3 * 7 OD; print(a) END";
    let (outcome, out) = a68::run_source(src, Conf::default()).expect("program should parse");
    assert_eq!(outcome, RunOutcome::Exited { status: 0, force: false });
    assert_eq!(out, "        +42");
}
