/// Algol 68 genie: tree-walking interpreter with an optimising dispatch
/// cache and an interactive monitor.
///
/// Module layout:
///   - conf        — documented runtime options
///   - errors      — runtime error taxonomy + typed interrupts
///   - diagnostics — central diagnostic routine, code taxonomy, backtrace
///   - mode        — interned mode table, sizes, short dispatch ids
///   - tree        — annotated syntax tree, tag tables, builder interface
///   - value       — the universal Value enum, names, descriptors
///   - mem         — frame stack, expression stack, heap + handle pool
///   - gc          — mark-sweep collector over the handle pool
///   - stowed      — clone/store/trim/slice and descriptor algebra
///   - prop        — per-node dispatch cache (PROP) + genie-info slab
///   - stdenv      — standard environ tables and transput formatting
///   - genie       — interpreter core (units, coercions, calls)
///   - clauses     — enclosed clauses, loops, serial/jump machinery
///   - codegen     — optimising generator, plugin registry, threads
///   - monitor     — breakpoints, stepping, frame/heap inspection
///   - rng         — taus113 generator with .Random.seed persistence
///   - front       — reduced front-end (stand-in collaborator)

pub mod clauses;
pub mod codegen;
pub mod conf;
pub mod diagnostics;
pub mod errors;
pub mod front;
pub mod gc;
pub mod genie;
pub mod mem;
pub mod mode;
pub mod monitor;
pub mod prop;
pub mod rng;
pub mod stdenv;
pub mod stowed;
pub mod tree;
pub mod value;

pub use clauses::RunOutcome;
pub use conf::Conf;
pub use errors::{Exec, GenieError, Irq, Severity};
pub use front::{parse_program, FrontError};
pub use genie::{Genie, SharedOut};
pub use mode::{ModeId, ModeTable};
pub use prop::Prop;
pub use rng::Taus113;
pub use tree::{Attribute, NodeId, Status, Tree, TreeBuilder};
pub use value::Value;

/// Parse and prepare a program, with program output captured through a
/// shared sink. The test suites and the driver both run through here.
pub fn genie_for(src: &str, conf: Conf) -> Result<(Genie, SharedOut), FrontError> {
    let tree = parse_program(src)?;
    let out = SharedOut::default();
    let genie = Genie::new(tree, conf).with_out(Box::new(out.clone()));
    Ok((genie, out))
}

/// Parse, run and collect (outcome, transput).
pub fn run_source(src: &str, conf: Conf) -> Result<(RunOutcome, String), FrontError> {
    let (mut genie, out) = genie_for(src, conf)?;
    let outcome = genie.run();
    Ok((outcome, out.take_string()))
}
