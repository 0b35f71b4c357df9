/// Optimising code generator.
///
/// Walks the prepared tree ahead of execution and, for every unit whose
/// mode and structure are "basic", emits a compact evaluation thread —
/// the in-process transport for generated code — registered in the
/// plugin under a deterministic symbol. On first use of a node whose
/// compile name was set, the interpreter rewrites its PROP to the
/// exported thread; a missing symbol falls back to generic evaluation.
///
/// Emission is three interleaved phases per unit (declare, execute,
/// yield) with a common-subexpression table keyed by (action, phase,
/// identifier) and a unique-name table that lets identical denotations
/// share one symbol across the plugin.

use std::collections::HashMap;

use tracing::debug;

use crate::errors::{Exec, GenieError, Irq};
use crate::genie::Genie;
use crate::mode::{ModeDef, ModeId};
use crate::prop::Prop;
use crate::stdenv;
use crate::tree::{Attribute, NodeId, Status};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Compiled threads and the plugin registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CodeOp {
    PushConst(Box<[Value]>),
    /// Load frame slots; the initialisation check is retained when the
    /// unit was emitted under `--check`.
    LoadFrame { level: u32, offset: usize, size: usize, check: bool },
    /// Pop a name, push the referenced slots.
    Deref { size: usize, check: bool },
    StoreTemp(u16),
    LoadTemp(u16),
    StdDyad(u32),
    StdMonad(u32),
    StdProcCall(u32),
    /// Pop an element name through `dims` integer subscripts below a row
    /// name; bounds checks are never eliminated.
    SliceName { dims: usize },
    /// Offset bump on the name at the stack top.
    Select { offset: usize },
    Widen(ModeId),
    /// Pop `width` source slots and the destination name beneath them,
    /// scope-check, store; push the name back unless voided.
    Assign { mode: ModeId, width: usize, yields: bool },
    Void { width: usize },
    JumpIfFalse(usize),
    Jump(usize),
}

#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub name: String,
    pub ops: Vec<CodeOp>,
    /// Temporaries bound during the execute phase.
    pub temps: u16,
    /// The C-like intermediate text assembled from emission strings.
    pub text: String,
}

#[derive(Debug, Default)]
pub struct Plugin {
    units: Vec<CompiledUnit>,
    symbols: HashMap<String, u32>,
}

impl Plugin {
    pub fn new() -> Self {
        Plugin::default()
    }

    pub fn register(&mut self, unit: CompiledUnit) -> u32 {
        if let Some(&i) = self.symbols.get(&unit.name) {
            return i;
        }
        let i = self.units.len() as u32;
        self.symbols.insert(unit.name.clone(), i);
        self.units.push(unit);
        i
    }

    /// Discover an export by name.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.symbols.get(name).copied()
    }

    pub fn unit(&self, i: u32) -> Option<&CompiledUnit> {
        self.units.get(i as usize)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Thread execution — the (node) → PROP half of the contract
// ---------------------------------------------------------------------------

pub fn run_thread(g: &mut Genie, unit: &CompiledUnit, n: NodeId) -> Exec {
    let mut temps: Vec<Vec<Value>> = vec![Vec::new(); unit.temps as usize];
    let mut ip = 0usize;
    while ip < unit.ops.len() {
        match &unit.ops[ip] {
            CodeOp::PushConst(slots) => g.push_slots(slots.to_vec(), n)?,
            CodeOp::LoadFrame { level, offset, size, check } => {
                let frame = g.frames.frame_at_level(*level).ok_or_else(|| {
                    Irq::error(GenieError::Internal("static chain misses a level".into()), n)
                })?;
                let slots = g.frames.frame(frame).slots[*offset..offset + size].to_vec();
                if *check {
                    for v in &slots {
                        if !v.is_initialised() {
                            return Err(Irq::error(
                                GenieError::UninitialisedValue { mode: "value".into() },
                                n,
                            ));
                        }
                    }
                }
                g.push_slots(slots, n)?;
            }
            CodeOp::Deref { size, check } => {
                let name = g.pop_name(n)?;
                let slots = g.read_name(n, name, *size)?;
                if *check {
                    for v in &slots {
                        if !v.is_initialised() {
                            return Err(Irq::error(
                                GenieError::UninitialisedValue { mode: "value".into() },
                                n,
                            ));
                        }
                    }
                }
                g.push_slots(slots, n)?;
            }
            CodeOp::StoreTemp(t) => {
                let v = g.pop();
                temps[*t as usize] = vec![v];
            }
            CodeOp::LoadTemp(t) => {
                g.push_slots(temps[*t as usize].clone(), n)?;
            }
            CodeOp::StdDyad(i) => (stdenv::dyad(*i).proc_)(g, n)?,
            CodeOp::StdMonad(i) => (stdenv::monad(*i).proc_)(g, n)?,
            CodeOp::StdProcCall(i) => (stdenv::proc_entry(*i).proc_)(g, n)?,
            CodeOp::SliceName { dims } => {
                let mut indices = vec![0i64; *dims];
                for i in (0..*dims).rev() {
                    indices[i] = g.pop_int_value(n)?;
                }
                let name = g.pop_name(n)?;
                if name.is_nil() {
                    return Err(Irq::error(GenieError::AccessThroughNil, n));
                }
                let desc = match g.read_name(n, name, 1)?.into_iter().next() {
                    Some(Value::Row(d)) => *d,
                    _ => {
                        return Err(Irq::error(
                            GenieError::UninitialisedValue { mode: "row".into() },
                            n,
                        ))
                    }
                };
                let at = desc.slot_of(&indices).map_err(|e| Irq::error(e, n))?;
                let elem = g.element_name(name.scope, desc.elems, at);
                g.push(Value::Name(elem), n)?;
            }
            CodeOp::Select { offset } => {
                let name = g.pop_name(n)?;
                if name.is_nil() {
                    return Err(Irq::error(GenieError::AccessThroughNil, n));
                }
                g.push(Value::Name(name.shifted(*offset)), n)?;
            }
            CodeOp::Widen(target) => {
                let v = g.pop();
                let target = *target;
                let widened = widen_for_thread(g, v, target, n)?;
                g.push_slots(widened, n)?;
            }
            CodeOp::Assign { mode, width, yields } => {
                let slots = g.pop_slots(*width);
                let name = g.pop_name(n)?;
                if name.is_nil() {
                    return Err(Irq::error(GenieError::AccessThroughNil, n));
                }
                let src_scope = g.scope_of_slots(&slots);
                if src_scope > name.scope {
                    return Err(Irq::error(
                        GenieError::ScopeViolation { src_scope, dest: name.scope },
                        n,
                    ));
                }
                g.store_through(n, name, *mode, slots)?;
                if *yields {
                    g.push(Value::Name(name), n)?;
                }
            }
            CodeOp::Void { width } => {
                g.pop_slots(*width);
            }
            CodeOp::JumpIfFalse(target) => {
                let b = g.pop_bool_value(n)?;
                if !b {
                    ip = *target;
                    continue;
                }
            }
            CodeOp::Jump(target) => {
                ip = *target;
                continue;
            }
        }
        ip += 1;
    }
    Ok(())
}

fn widen_for_thread(g: &mut Genie, v: Value, target: ModeId, n: NodeId) -> Exec<Vec<Value>> {
    match (v, g.tree.modes.def(target)) {
        (Value::Int(i), ModeDef::Real) => Ok(vec![Value::Real(i as f64)]),
        (Value::Int(i), ModeDef::LongInt) => Ok(vec![Value::LongInt(i as i128)]),
        (Value::Real(r), ModeDef::LongReal) => Ok(vec![Value::LongReal(r)]),
        (Value::Real(r), ModeDef::Complex) => Ok(vec![Value::Complex(r, 0.0)]),
        (Value::Empty, _) => Err(Irq::error(
            GenieError::UninitialisedValue { mode: g.tree.modes.spell(target) },
            n,
        )),
        (v, _) => Err(Irq::error(
            GenieError::Internal(format!("thread widening of {:?}", v)),
            n,
        )),
    }
}

// ---------------------------------------------------------------------------
// Eligibility — the "basic unit" predicate, by level
// ---------------------------------------------------------------------------

pub fn basic_unit(g: &Genie, n: NodeId, level: u8) -> bool {
    let node = g.tree.node(n);
    let modes = &g.tree.modes;
    let primitive_ish = |m: ModeId| {
        modes.is_primitive(m) || modes.deref(m).map_or(false, |inner| modes.is_primitive(inner))
    };
    match node.attr {
        // Level 1: denotations, identifiers of primitive or
        // REF-primitive mode, standenv formulas and calls, deref of
        // identifier, cast.
        Attribute::Denotation => true,
        Attribute::Identifier => {
            primitive_ish(node.mode)
                && node.tag.map_or(false, |t| g.tree.tag(t).stand.is_none())
        }
        Attribute::Dereferencing => {
            let sub = node.sub.expect("coercion wraps a unit");
            g.tree.node(sub).attr == Attribute::Identifier && basic_unit(g, sub, level)
        }
        Attribute::Formula => {
            let lhs = node.sub.expect("formula keeps operands");
            let rhs = g.tree.node(lhs).next.expect("dyadic formula has two operands");
            node.tag.is_none()
                && known_dyad(g, n, lhs, rhs)
                && basic_unit(g, lhs, level)
                && basic_unit(g, rhs, level)
        }
        Attribute::MonadicFormula => {
            let operand = node.sub.expect("monadic formula keeps its operand");
            node.tag.is_none()
                && known_monad(g, n, operand)
                && basic_unit(g, operand, level)
        }
        Attribute::Call => {
            let primary = node.sub.expect("call keeps its primary");
            let prim = g.tree.node(primary);
            let is_stand = prim.attr == Attribute::Identifier
                && prim.tag.map_or(false, |t| g.tree.tag(t).stand.is_some());
            is_stand
                && g.tree
                    .children(n)
                    .skip(1)
                    .all(|a| basic_unit(g, a, level))
                // Transput stays interpreted: its arity is open.
                && g.tree.children(n).skip(1).count() <= 1
                && prim.symbol != "print"
                && prim.symbol != "write"
                && prim.symbol != "read"
        }
        Attribute::Cast => {
            let sub = node.sub.expect("cast wraps a unit");
            basic_unit(g, sub, level)
        }

        // Level 2 adds voided assignation, widening, slice, selection,
        // identity relations over primitive-ish operands.
        Attribute::Voiding if level >= 2 => {
            let sub = node.sub.expect("voiding wraps a unit");
            match g.tree.node(sub).attr {
                Attribute::Assignation => basic_assignation(g, sub, level),
                _ => basic_unit(g, sub, level),
            }
        }
        Attribute::Assignation if level >= 2 => basic_assignation(g, n, level),
        Attribute::Widening if level >= 2 => {
            let sub = node.sub.expect("coercion wraps a unit");
            modes.is_primitive(node.mode) && basic_unit(g, sub, level)
        }
        Attribute::Slice if level >= 2 => basic_slice(g, n, level),
        Attribute::Selection if level >= 2 => {
            let sec = node.sub.expect("selection keeps its secondary");
            let sec_mode = g.tree.node(sec).mode;
            modes.deref(sec_mode).is_some()
                && g.tree.node(sec).attr == Attribute::Identifier
        }
        Attribute::IdentityRelation if level >= 2 => {
            g.tree.children(n).all(|c| {
                let cm = g.tree.node(c).mode;
                matches!(g.tree.node(c).attr, Attribute::Identifier | Attribute::Nihil)
                    && (modes.deref(cm).is_none()
                        || modes.deref(cm).map_or(false, |m| {
                            modes.is_primitive(m) || matches!(modes.def(m), ModeDef::Complex)
                        }))
            })
        }

        // Level 3 adds enclosed clauses whose bodies are basic
        // throughout.
        Attribute::ClosedClause if level >= 3 => {
            let serial = node.sub.expect("closed clause wraps a serial clause");
            basic_unit(g, serial, level)
        }
        Attribute::SerialClause if level >= 3 => {
            g.tree.table(node.table).frame_size == 0
                && !g.tree.table(node.table).has_labels
                && g.tree.children(n).all(|c| basic_unit(g, c, level))
        }
        Attribute::ConditionalClause if level >= 3 => basic_conditional(g, n, level),
        Attribute::IntegerCaseClause | Attribute::ConformityClause | Attribute::LoopClause
            if level >= 3 =>
        {
            enclosed_parts_basic(g, n, level)
        }
        _ => false,
    }
}

fn basic_assignation(g: &Genie, n: NodeId, level: u8) -> bool {
    let node = g.tree.node(n);
    let dest = node.sub.expect("assignation keeps its destination");
    let source = g.tree.node(dest).next.expect("assignation has a source");
    let dest_ok = match g.tree.node(dest).attr {
        Attribute::Identifier => true,
        Attribute::Slice => basic_slice(g, dest, level),
        Attribute::Selection => {
            let sec = g.tree.node(dest).sub.expect("selection keeps its secondary");
            g.tree.node(sec).attr == Attribute::Identifier
        }
        _ => false,
    };
    dest_ok && basic_unit(g, source, level)
}

fn basic_slice(g: &Genie, n: NodeId, level: u8) -> bool {
    let node = g.tree.node(n);
    let primary = node.sub.expect("slice keeps its primary");
    g.tree.node(primary).attr == Attribute::Identifier
        && g.tree.modes.deref(g.tree.node(primary).mode).is_some()
        && g.tree.children(n).skip(1).all(|ix| {
            g.tree.node(ix).attr != Attribute::Trimmer && basic_unit(g, ix, level)
        })
}

fn basic_conditional(g: &Genie, n: NodeId, level: u8) -> bool {
    if g.tree.table(g.tree.node(n).table).frame_size != 0 {
        return false;
    }
    g.tree.children(n).all(|part| {
        let pn = g.tree.node(part);
        match pn.attr {
            Attribute::EnquiryClause | Attribute::ThenPart | Attribute::ElsePart => {
                let inner = pn.sub.expect("part wraps its clause");
                basic_unit(g, inner, level)
            }
            _ => false,
        }
    })
}

fn enclosed_parts_basic(g: &Genie, n: NodeId, level: u8) -> bool {
    g.tree.children(n).all(|part| {
        let pn = g.tree.node(part);
        match pn.sub {
            Some(inner) => basic_unit(g, inner, level),
            None => true,
        }
    })
}

fn known_dyad(g: &Genie, n: NodeId, lhs: NodeId, rhs: NodeId) -> bool {
    let key = format!(
        "{}{}",
        g.tree.modes.short_id(g.tree.node(lhs).mode),
        g.tree.modes.short_id(g.tree.node(rhs).mode)
    );
    stdenv::find_dyad(&g.tree.node(n).symbol, &key).is_some()
}

fn known_monad(g: &Genie, n: NodeId, operand: NodeId) -> bool {
    let key = g.tree.modes.short_id(g.tree.node(operand).mode).to_string();
    stdenv::find_monad(&g.tree.node(n).symbol, &key).is_some()
}

// ---------------------------------------------------------------------------
// Constant folder
// ---------------------------------------------------------------------------

/// Parallel predicate over the same shapes: true when the unit can be
/// executed at compile time and its value emitted as a literal.
pub fn constant_unit(g: &Genie, n: NodeId) -> bool {
    let node = g.tree.node(n);
    match node.attr {
        Attribute::Denotation => true,
        Attribute::Identifier => node
            .tag
            .map_or(false, |t| g.tag_consts.contains_key(&(t.table, t.index))),
        Attribute::Formula | Attribute::MonadicFormula => {
            node.tag.is_none() && g.tree.children(n).all(|c| constant_unit(g, c))
        }
        Attribute::Widening | Attribute::Cast => {
            let sub = node.sub.expect("coercion wraps a unit");
            constant_unit(g, sub)
        }
        _ => false,
    }
}

/// Execute a constant unit with the interpreter itself; `None` declines
/// the fold (a REAL reaching ±∞ aborts it).
fn fold(g: &mut Genie, n: NodeId) -> Option<Box<[Value]>> {
    let width = g.tree.modes.size(g.tree.node(n).mode);
    let sp = g.sp();
    match g.evaluate_generic(n) {
        Ok(()) => {
            let slots = g.pop_slots(width);
            debug_assert_eq!(g.sp(), sp);
            for v in &slots {
                if let Value::Real(r) = v {
                    if !r.is_finite() {
                        return None;
                    }
                }
            }
            // Literals must not pin heap handles into the plugin.
            if !crate::genie::slots_cacheable(&slots) {
                return None;
            }
            Some(slots.into_boxed_slice())
        }
        Err(_) => {
            while g.sp() > sp {
                g.pop();
            }
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Phase {
    Declare,
    Execute,
    Yield,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Action {
    Load,
    Deref,
}

struct Emitter {
    ops: Vec<CodeOp>,
    text: String,
    temps: u16,
    /// CSE booking: (action, phase, identifier) → bound temporary.
    cse: HashMap<(Action, Phase, String), u16>,
    /// Disabled for the stripped -O0 pass.
    cse_enabled: bool,
    check: bool,
}

impl Emitter {
    fn new(check: bool, cse_enabled: bool) -> Self {
        Emitter { ops: Vec::new(), text: String::new(), temps: 0, cse: HashMap::new(), cse_enabled, check }
    }

    fn declare_temp(&mut self) -> u16 {
        let t = self.temps;
        self.temps += 1;
        self.text.push_str(&format!("  A68_VALUE t{};\n", t));
        t
    }

    /// Load an identifier's frame slot, reusing the bound temporary on
    /// repeated occurrence within the unit.
    fn load_ident(&mut self, action: Action, name: &str, level: u32, offset: usize, size: usize) {
        let key = (action, Phase::Execute, name.to_string());
        if self.cse_enabled {
            if let Some(&t) = self.cse.get(&key) {
                self.ops.push(CodeOp::LoadTemp(t));
                self.text.push_str(&format!("  /* reuse */ push(t{});\n", t));
                return;
            }
        }
        self.ops.push(CodeOp::LoadFrame { level, offset, size, check: self.check });
        match action {
            Action::Load => {}
            Action::Deref => self.ops.push(CodeOp::Deref { size, check: self.check }),
        }
        if self.cse_enabled && size == 1 {
            let t = self.declare_temp();
            self.ops.push(CodeOp::StoreTemp(t));
            self.ops.push(CodeOp::LoadTemp(t));
            self.text
                .push_str(&format!("  t{} = frame({}, {}); push(t{});\n", t, level, offset, t));
            self.cse.insert(key, t);
        } else {
            self.text.push_str(&format!("  push(frame({}, {}));\n", level, offset));
        }
    }
}

/// Deterministic export names: `genie_<moid>_<kind>_<nodeNumber>`, or
/// the idKey form for identifier-rooted units.
fn symbol_for(g: &Genie, n: NodeId, kind: &str) -> String {
    let node = g.tree.node(n);
    let moid = g.tree.modes.short_id(node.mode);
    if let Some(t) = node.tag {
        let tag = g.tree.tag(t);
        return format!("genie_{}_{}_{}_{}_{}", moid, kind, t.table, tag.level, tag.offset);
    }
    format!("genie_{}_{}_{}", moid, kind, n.0)
}

fn kind_of(attr: Attribute) -> &'static str {
    match attr {
        Attribute::Denotation => "deno",
        Attribute::Identifier => "ident",
        Attribute::Dereferencing => "deref",
        Attribute::Formula => "formula",
        Attribute::MonadicFormula => "monad",
        Attribute::Call => "call",
        Attribute::Cast => "cast",
        Attribute::Voiding => "void",
        Attribute::Assignation => "assign",
        Attribute::Slice => "slice",
        Attribute::Selection => "select",
        Attribute::Widening => "widen",
        Attribute::IdentityRelation => "is",
        Attribute::ClosedClause | Attribute::SerialClause => "clause",
        Attribute::ConditionalClause => "cond",
        _ => "unit",
    }
}

pub struct CodeGen {
    max_level: u8,
    stripped: bool,
    /// Constant routines: identical denotations share one symbol.
    unique_names: HashMap<String, String>,
    compiled: usize,
}

impl CodeGen {
    pub fn new(opt_level: u8) -> Self {
        CodeGen {
            max_level: match opt_level {
                0 => 1,
                1 => 1,
                2 => 2,
                _ => 3,
            },
            stripped: opt_level == 0,
            unique_names: HashMap::new(),
            compiled: 0,
        }
    }

    /// Emit one unit; `None` declines (the node keeps generic dispatch).
    fn emit_unit(&mut self, g: &mut Genie, n: NodeId) -> Option<CompiledUnit> {
        let mut e = Emitter::new(g.conf.check_init, !self.stripped);
        let attr = g.tree.node(n).attr;
        self.emit_into(g, n, &mut e)?;
        let name = match attr {
            Attribute::Denotation => {
                // Unique-name table: one symbol per distinct literal.
                let key = format!(
                    "{}:{}",
                    g.tree.node(n).symbol,
                    g.tree.modes.short_id(g.tree.node(n).mode)
                );
                match self.unique_names.get(&key) {
                    Some(s) => s.clone(),
                    None => {
                        let s = symbol_for(g, n, "deno");
                        self.unique_names.insert(key, s.clone());
                        s
                    }
                }
            }
            _ => symbol_for(g, n, kind_of(attr)),
        };
        Some(CompiledUnit { name, ops: e.ops, temps: e.temps, text: e.text })
    }

    /// The three phases interleave here: declare allocates temporaries,
    /// execute emits the side-effecting statements, yield leaves the
    /// expression value on the stack.
    fn emit_into(&mut self, g: &mut Genie, n: NodeId, e: &mut Emitter) -> Option<()> {
        // Foldable subunits become literals.
        if constant_unit(g, n) {
            let slots = fold(g, n)?;
            e.text.push_str(&format!("  push_literal({:?});\n", slots));
            e.ops.push(CodeOp::PushConst(slots));
            return Some(());
        }

        let node = g.tree.node(n).clone();
        match node.attr {
            Attribute::Identifier => {
                let tag = g.tree.tag(node.tag?);
                let size = g.tree.modes.size(tag.mode);
                e.load_ident(Action::Load, &node.symbol, tag.level, tag.offset, size);
                Some(())
            }
            Attribute::Dereferencing => {
                let sub = node.sub?;
                let sub_node = g.tree.node(sub);
                let tag = g.tree.tag(sub_node.tag?);
                let size = g.tree.modes.size(g.tree.modes.deref(tag.mode)?);
                let (level, offset) = (tag.level, tag.offset);
                let symbol = sub_node.symbol.clone();
                e.load_ident(Action::Deref, &symbol, level, offset, size);
                Some(())
            }
            Attribute::Formula => {
                let lhs = node.sub?;
                let rhs = g.tree.node(lhs).next?;
                let key = format!(
                    "{}{}",
                    g.tree.modes.short_id(g.tree.node(lhs).mode),
                    g.tree.modes.short_id(g.tree.node(rhs).mode)
                );
                let index = stdenv::find_dyad(&node.symbol, &key)?;
                self.emit_into(g, lhs, e)?;
                self.emit_into(g, rhs, e)?;
                e.ops.push(CodeOp::StdDyad(index));
                e.text.push_str(&format!(
                    "  push({});\n",
                    stdenv::dyad(index).emit.replace("%1", "pop2()").replace("%2", "pop()")
                ));
                Some(())
            }
            Attribute::MonadicFormula => {
                let operand = node.sub?;
                let key = g.tree.modes.short_id(g.tree.node(operand).mode).to_string();
                let index = stdenv::find_monad(&node.symbol, &key)?;
                self.emit_into(g, operand, e)?;
                e.ops.push(CodeOp::StdMonad(index));
                e.text.push_str(&format!(
                    "  push({});\n",
                    stdenv::monad(index).emit.replace("%1", "pop()")
                ));
                Some(())
            }
            Attribute::Call => {
                let primary = node.sub?;
                let prim = g.tree.node(primary);
                let stand = g.tree.tag(prim.tag?).stand?;
                let args: Vec<NodeId> = g.tree.children(n).skip(1).collect();
                for a in args {
                    self.emit_into(g, a, e)?;
                }
                e.ops.push(CodeOp::StdProcCall(stand));
                let entry = stdenv::proc_entry(stand);
                if entry.emit.is_empty() {
                    e.text.push_str(&format!("  push(genie_{}(pop()));\n", entry.code_name));
                } else {
                    e.text.push_str(&format!(
                        "  push({});\n",
                        entry.emit.replace("%1", "pop()")
                    ));
                }
                // Math-error checks follow REAL formulas; the entry
                // performs them before pushing.
                Some(())
            }
            Attribute::Cast => self.emit_into(g, node.sub?, e),
            Attribute::Widening if self.max_level >= 2 => {
                self.emit_into(g, node.sub?, e)?;
                e.ops.push(CodeOp::Widen(node.mode));
                e.text.push_str("  widen();\n");
                Some(())
            }
            Attribute::Voiding if self.max_level >= 2 => {
                let sub = node.sub?;
                let width = g.tree.modes.size(g.tree.node(sub).mode);
                match g.tree.node(sub).attr {
                    Attribute::Assignation => self.emit_assignation(g, sub, e, false),
                    _ => {
                        self.emit_into(g, sub, e)?;
                        e.ops.push(CodeOp::Void { width });
                        e.text.push_str("  drop();\n");
                        Some(())
                    }
                }
            }
            Attribute::Assignation if self.max_level >= 2 => {
                self.emit_assignation(g, n, e, true)
            }
            Attribute::Slice if self.max_level >= 2 => {
                self.emit_slice(g, n, e)?;
                let size = g.tree.modes.size(g.tree.node(n).mode);
                // A slice in a value position dereferences the element.
                if g.tree.modes.deref(node.mode).is_none() {
                    e.ops.push(CodeOp::Deref { size, check: e.check });
                }
                Some(())
            }
            Attribute::Selection if self.max_level >= 2 => {
                let sec = node.sub?;
                let sec_mode = g.tree.node(sec).mode;
                let struct_mode = g.tree.modes.deref(sec_mode)?;
                let (offset, _) = g.tree.modes.field(struct_mode, &node.symbol)?;
                self.emit_into(g, sec, e)?;
                e.ops.push(CodeOp::Select { offset });
                e.text.push_str(&format!("  select({});\n", offset));
                if g.tree.modes.deref(node.mode).is_none() {
                    let size = g.tree.modes.size(node.mode);
                    e.ops.push(CodeOp::Deref { size, check: e.check });
                }
                Some(())
            }
            Attribute::ClosedClause if self.max_level >= 3 => {
                let serial = node.sub?;
                self.emit_into(g, serial, e)
            }
            Attribute::SerialClause if self.max_level >= 3 => {
                if g.tree.table(node.table).frame_size != 0
                    || g.tree.table(node.table).has_labels
                {
                    return None;
                }
                for c in g.tree.children(n).collect::<Vec<_>>() {
                    self.emit_into(g, c, e)?;
                }
                Some(())
            }
            Attribute::ConditionalClause if self.max_level >= 3 => {
                self.emit_conditional(g, n, e)
            }
            _ => None,
        }
    }

    fn emit_assignation(
        &mut self,
        g: &mut Genie,
        n: NodeId,
        e: &mut Emitter,
        yields: bool,
    ) -> Option<()> {
        let node = g.tree.node(n).clone();
        let dest = node.sub?;
        let source = g.tree.node(dest).next?;
        let src_mode = g.tree.node(source).mode;
        let width = g.tree.modes.size(src_mode);

        match g.tree.node(dest).attr {
            Attribute::Identifier => {
                // The destination name is the value stored in the slot.
                let tag = g.tree.tag(g.tree.node(dest).tag?);
                let (level, offset) = (tag.level, tag.offset);
                e.ops.push(CodeOp::LoadFrame { level, offset, size: 1, check: e.check });
                e.text.push_str(&format!("  push_name(frame({}, {}));\n", level, offset));
            }
            Attribute::Slice => self.emit_slice(g, dest, e)?,
            Attribute::Selection => {
                let sec = g.tree.node(dest).sub?;
                let sec_mode = g.tree.node(sec).mode;
                let struct_mode = g.tree.modes.deref(sec_mode)?;
                let (offset, _) = g.tree.modes.field(struct_mode, &g.tree.node(dest).symbol)?;
                self.emit_into(g, sec, e)?;
                e.ops.push(CodeOp::Select { offset });
            }
            _ => return None,
        }
        self.emit_into(g, source, e)?;
        e.ops.push(CodeOp::Assign { mode: src_mode, width, yields });
        e.text.push_str("  assign();\n");
        Some(())
    }

    /// Emit a slice destination/primary: row name plus integer
    /// subscripts, yielding the element name.
    fn emit_slice(&mut self, g: &mut Genie, n: NodeId, e: &mut Emitter) -> Option<()> {
        let node = g.tree.node(n).clone();
        let primary = node.sub?;
        let prim = g.tree.node(primary);
        let tag = g.tree.tag(prim.tag?);
        let (level, offset) = (tag.level, tag.offset);
        // SliceName reads the descriptor through the row name stored in
        // the slot.
        e.ops.push(CodeOp::LoadFrame { level, offset, size: 1, check: e.check });
        e.text.push_str(&format!("  slice_name(frame({}, {}));\n", level, offset));
        let indexers: Vec<NodeId> = g.tree.children(n).skip(1).collect();
        let dims = indexers.len();
        for ix in indexers {
            if g.tree.node(ix).attr == Attribute::Trimmer {
                return None;
            }
            self.emit_into(g, ix, e)?;
        }
        e.ops.push(CodeOp::SliceName { dims });
        Some(())
    }

    fn emit_conditional(&mut self, g: &mut Genie, n: NodeId, e: &mut Emitter) -> Option<()> {
        let enquiry = g.tree.child(n, Attribute::EnquiryClause)?;
        let enquiry_serial = g.tree.node(enquiry).sub?;
        let then_part = g.tree.child(n, Attribute::ThenPart)?;
        let then_inner = g.tree.node(then_part).sub?;
        let else_inner =
            g.tree.child(n, Attribute::ElsePart).and_then(|p| g.tree.node(p).sub);

        self.emit_into(g, enquiry_serial, e)?;
        let branch_at = e.ops.len();
        e.ops.push(CodeOp::JumpIfFalse(0));
        e.text.push_str("  if (!pop_bool()) goto else;\n");
        self.emit_into(g, then_inner, e)?;
        let jump_end = e.ops.len();
        e.ops.push(CodeOp::Jump(0));
        let else_start = e.ops.len();
        e.ops[branch_at] = CodeOp::JumpIfFalse(else_start);
        match else_inner {
            Some(inner) => self.emit_into(g, inner, e)?,
            None => {
                // An omitted ELSE still yields the undefined value of
                // the required mode.
                let width = g.tree.modes.size(g.tree.node(n).mode);
                if width > 0 {
                    e.ops.push(CodeOp::PushConst(
                        vec![Value::Empty; width].into_boxed_slice(),
                    ));
                }
            }
        }
        let end = e.ops.len();
        e.ops[jump_end] = CodeOp::Jump(end);
        Some(())
    }
}

/// Walk the prepared tree, compile every eligible serial-clause unit and
/// register the exports. PROPs are patched lazily on first use.
pub fn compile_tree(g: &mut Genie) {
    let mut cg = CodeGen::new(g.conf.opt_level);
    let candidates: Vec<NodeId> = (0..g.tree.len() as u32)
        .map(NodeId)
        .filter(|&n| g.info.status(n).contains(Status::INTERRUPTIBLE))
        .collect();
    for n in candidates {
        if !basic_unit(g, n, cg.max_level) {
            continue;
        }
        if let Some(unit) = cg.emit_unit(g, n) {
            let name = unit.name.clone();
            g.plugin.register(unit);
            g.info.info_mut(n).compile_name = Some(name);
            cg.compiled += 1;
        }
    }
    debug!(units = cg.compiled, symbols = g.plugin.len(), "code generation finished");
}

/// First-use PROP patch: called by the interpreter when it meets a node
/// whose compile name is set but whose PROP is still unset.
pub fn patch_prop(g: &mut Genie, n: NodeId) -> Option<Prop> {
    let name = g.info.info(n).compile_name.clone()?;
    match g.plugin.lookup(&name) {
        Some(sym) => {
            let prop = Prop::Compiled(sym);
            g.info.install(n, prop.clone());
            Some(prop)
        }
        // Missing export: generic evaluation remains.
        None => None,
    }
}
