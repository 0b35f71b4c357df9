/// The genie: recursive evaluation of units over the frame stack, the
/// expression stack and the heap.
///
/// `evaluate` consults the node's PROP first; an unset PROP routes to
/// generic evaluation, which installs the most specialised evaluator it
/// can determine before returning. Enclosed-clause evaluation lives in
/// `clauses.rs`; both halves are one `impl` split across files.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::codegen::Plugin;
use crate::conf::Conf;
use crate::errors::{Exec, GenieError, Irq, Jump};
use crate::gc;
use crate::mem::{frame_scope, FrameStack, Heap, HeapObj, Locale};
use crate::mode::{self, ModeDef, ModeId, M_BOOL, M_CHAR, M_VOID};
use crate::monitor::MonitorState;
use crate::prop::{GInfoTable, Prop};
use crate::rng::Taus113;
use crate::stdenv;
use crate::stowed;
use crate::tree::{Attribute, NodeId, Status, TagRef, Tree};
use crate::value::{
    FormatVal, HandleId, Name, ProcBody, ProcVal, RowDesc, Target, Value, PRIMAL_SCOPE,
};

const MAX_CALL_DEPTH: usize = 4096;

/// Slots that keep no handles alive may be cached as constant blobs.
pub fn slots_cacheable(slots: &[Value]) -> bool {
    let mut handles = 0usize;
    for v in slots {
        v.each_handle(&mut |_| handles += 1);
    }
    handles == 0
}

/// Shared transput sink so tests can capture program output.
#[derive(Clone, Default)]
pub struct SharedOut(pub Arc<Mutex<Vec<u8>>>);

impl SharedOut {
    pub fn take_string(&self) -> String {
        let mut buf = self.0.lock();
        String::from_utf8_lossy(&std::mem::take(&mut *buf)).into_owned()
    }
}

impl Write for SharedOut {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// The interpreter context
// ---------------------------------------------------------------------------

pub struct Genie {
    pub tree: Tree,
    pub conf: Conf,
    pub frames: FrameStack,
    pub stack: Vec<Value>,
    pub heap: Heap,
    pub info: GInfoTable,
    pub plugin: Plugin,
    pub rng: Taus113,
    pub monitor: MonitorState,
    pub out: Box<dyn Write>,
    /// Promoted-constant tags: identity declarations whose source was
    /// CONSTANT cache their slots here.
    pub tag_consts: std::collections::HashMap<(u32, u32), Box<[Value]>>,
    pub cur_node: NodeId,
    pub cur_thread: u32,
    call_depth: usize,
    soft_warned: bool,
    /// Transput echo; toggled by the monitor `ht`/`rt` commands.
    pub echo: bool,
}

impl Genie {
    pub fn new(tree: Tree, conf: Conf) -> Self {
        let info = GInfoTable::new(tree.len().max(1), tree.tables.len().max(1));
        let heap = Heap::new(conf.heap_limit);
        let rng = Taus113::new(conf.seed.unwrap_or(0x2545_F491));
        let root = tree.root;
        let mut g = Genie {
            tree,
            conf,
            frames: FrameStack::default(),
            stack: Vec::new(),
            heap,
            info,
            plugin: Plugin::new(),
            rng,
            monitor: MonitorState::new(),
            out: Box::new(std::io::stdout()),
            tag_consts: std::collections::HashMap::new(),
            cur_node: root,
            cur_thread: 0,
            call_depth: 0,
            soft_warned: false,
            echo: true,
        };
        g.prepare();
        g
    }

    pub fn with_out(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    /// Tree preparation: mark interruptible units and propagate levels
    /// and offsets into the genie-info slab.
    fn prepare(&mut self) {
        for i in 0..self.tree.len() {
            let n = NodeId(i as u32);
            let node = self.tree.node(n);
            if node.attr == Attribute::SerialClause {
                for c in self.tree.children(n).collect::<Vec<_>>() {
                    self.info.set_status(c, Status::INTERRUPTIBLE);
                }
            }
            if let Some(tag) = node.tag {
                let t = self.tree.tag(tag).clone();
                let gi = self.info.info_mut(n);
                gi.level = t.level;
                gi.offset = t.offset;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Expression stack
    // -----------------------------------------------------------------------

    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, v: Value, n: NodeId) -> Exec {
        if self.stack.len() >= self.conf.expr_stack_limit {
            return Err(Irq::error(GenieError::ExpressionStackOverflow, n));
        }
        if !self.soft_warned && self.stack.len() >= self.conf.soft_limit(self.conf.expr_stack_limit)
        {
            self.soft_warned = true;
            debug!("expression stack crossing the storage-overhead margin");
        }
        self.stack.push(v);
        Ok(())
    }

    pub fn push_slots(&mut self, slots: Vec<Value>, n: NodeId) -> Exec {
        for v in slots {
            self.push(v, n)?;
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Empty)
    }

    pub fn pop_slots(&mut self, size: usize) -> Vec<Value> {
        let at = self.stack.len().saturating_sub(size);
        self.stack.split_off(at)
    }

    pub fn pop_name(&mut self, n: NodeId) -> Exec<Name> {
        match self.pop() {
            Value::Name(name) => Ok(name),
            Value::Empty => {
                Err(Irq::error(GenieError::UninitialisedValue { mode: "REF".into() }, n))
            }
            other => Err(Irq::error(
                GenieError::Internal(format!("name expected on stack, found {:?}", other)),
                n,
            )),
        }
    }

    pub fn pop_bool_value(&mut self, n: NodeId) -> Exec<bool> {
        match self.pop() {
            Value::Bool(b) => Ok(b),
            Value::Empty => {
                Err(Irq::error(GenieError::UninitialisedValue { mode: "BOOL".into() }, n))
            }
            other => Err(Irq::error(
                GenieError::Internal(format!("BOOL expected on stack, found {:?}", other)),
                n,
            )),
        }
    }

    pub fn pop_int_value(&mut self, n: NodeId) -> Exec<i64> {
        match self.pop() {
            Value::Int(v) => Ok(v),
            Value::Empty => {
                Err(Irq::error(GenieError::UninitialisedValue { mode: "INT".into() }, n))
            }
            other => Err(Irq::error(
                GenieError::Internal(format!("INT expected on stack, found {:?}", other)),
                n,
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Transput
    // -----------------------------------------------------------------------

    pub fn write_out(&mut self, text: &str) {
        if self.echo {
            let _ = self.out.write_all(text.as_bytes());
        }
    }

    pub fn format_slots(&self, slots: &[Value]) -> String {
        let mut s = String::new();
        for v in slots {
            s.push_str(&self.format_value(v));
        }
        s
    }

    pub fn format_value(&self, v: &Value) -> String {
        match v {
            Value::Int(i) => stdenv::whole_int(*i),
            Value::Real(r) => stdenv::whole_real(*r),
            Value::Bool(b) => if *b { "T" } else { "F" }.to_string(),
            Value::Char(c) => c.to_string(),
            Value::Bits(w) => format!("{:b}", w),
            Value::LongInt(i) => format!("{:+}", i),
            Value::LongReal(r) => stdenv::whole_real(*r),
            Value::Complex(re, im) => {
                format!("{}{}⊥", stdenv::whole_real(*re), stdenv::whole_real(*im))
            }
            Value::Bytes(b) => String::from_utf8_lossy(&b[..]).trim_end().to_string(),
            Value::Row(desc) => self.format_row(desc),
            Value::United(_, slots) => self.format_slots(slots),
            Value::Name(n) if n.is_nil() => "NIL".to_string(),
            Value::Name(_) => "REF".to_string(),
            Value::Proc(_) => "PROC".to_string(),
            Value::Format(_) => "FORMAT".to_string(),
            Value::Void | Value::Empty => String::new(),
            Value::Sound(_) => "SOUND".to_string(),
        }
    }

    fn format_row(&self, desc: &RowDesc) -> String {
        let chars = desc.elem_mode == M_CHAR;
        let mut s = String::new();
        for indices in crate::value::TupleIter::new(desc) {
            if let Ok(at) = desc.slot_of(&indices) {
                let slots = &self.heap.slots(desc.elems)[at..at + desc.elem_size];
                if chars {
                    if let Value::Char(c) = slots[0] {
                        s.push(c);
                        continue;
                    }
                }
                s.push_str(&self.format_slots(slots));
            }
        }
        s
    }

    // -----------------------------------------------------------------------
    // Node dispatch
    // -----------------------------------------------------------------------

    pub fn evaluate(&mut self, n: NodeId) -> Exec {
        self.cur_node = n;
        let st = self.info.status(n);
        if st.intersects(Status::BREAK_MASK) || self.monitor.wants_stop(&st, self.frames.depth()) {
            crate::monitor::enter(self, n)?;
        }
        if self.monitor.watch_armed() && st.contains(Status::INTERRUPTIBLE) {
            crate::monitor::check_watch(self, n)?;
        }

        match self.info.prop(n).clone() {
            Prop::Unset => {
                // A compile name set by the generator rewrites the PROP
                // to the exported thread on first use; a missing symbol
                // falls back to generic evaluation.
                if let Some(prop) = crate::codegen::patch_prop(self, n) {
                    return self.run_prop(n, prop);
                }
                self.evaluate_generic(n)
            }
            Prop::Generic => self.evaluate_generic(n),
            prop => {
                self.info.stats.specialised_hits += 1;
                self.run_prop(n, prop)
            }
        }
    }

    /// Run an installed specialised evaluator. Each arm is semantically
    /// equivalent to the generic evaluation of the same node.
    fn run_prop(&mut self, n: NodeId, prop: Prop) -> Exec {
        match prop {
            Prop::Unset | Prop::Generic => self.evaluate_generic(n),
            Prop::Constant => {
                let slots = self
                    .info
                    .info(n)
                    .constant
                    .clone()
                    .ok_or_else(|| {
                        Irq::error(GenieError::Internal("constant PROP without blob".into()), n)
                    })?;
                self.push_slots(slots.into_vec(), n)
            }
            Prop::StandCall(i) => self.stand_identifier(n, i),
            Prop::StandProcCall(i) => {
                let args: Vec<NodeId> = self.tree.children(n).skip(1).collect();
                for a in &args {
                    self.evaluate(*a)?;
                }
                (stdenv::proc_entry(i).proc_)(self, n)
            }
            Prop::FrameLoad { level, offset, size } => self.frame_load(n, level, offset, size),
            Prop::FrameDeref { level, offset } => {
                let name = match self.frame_slot(n, level, offset)? {
                    Value::Name(name) => name,
                    Value::Empty => {
                        return Err(Irq::error(
                            GenieError::UninitialisedValue { mode: "REF".into() },
                            n,
                        ))
                    }
                    other => {
                        return Err(Irq::error(
                            GenieError::Internal(format!("REF expected in frame, found {:?}", other)),
                            n,
                        ))
                    }
                };
                let size = self.tree.modes.size(self.tree.node(n).mode);
                self.deref_name(n, name, size)
            }
            Prop::SliceBasic => self.slice_unit(n),
            Prop::SelectRef { offset } => {
                let node = self.tree.node(n);
                let sec = node.sub.expect("selection keeps its secondary");
                self.evaluate(sec)?;
                let name = self.pop_name(n)?;
                if name.is_nil() {
                    return Err(Irq::error(GenieError::AccessThroughNil, n));
                }
                self.push(Value::Name(name.shifted(offset)), n)
            }
            Prop::DyadicStd { index } => {
                let node = self.tree.node(n);
                let lhs = node.sub.expect("formula keeps operands");
                let rhs = self.tree.node(lhs).next.expect("dyadic formula has two operands");
                self.evaluate(lhs)?;
                self.evaluate(rhs)?;
                (stdenv::dyad(index).proc_)(self, n)
            }
            Prop::AssignConst => self.assignation(n),
            Prop::Voided(inner) => {
                let sub = self.tree.node(n).sub.expect("voiding wraps a unit");
                let width = self.tree.modes.size(self.tree.node(sub).mode);
                self.run_prop(sub, *inner)?;
                self.pop_slots(width);
                Ok(())
            }
            Prop::Compiled(sym) => self.run_compiled(n, sym),
        }
    }

    fn run_compiled(&mut self, n: NodeId, sym: u32) -> Exec {
        let unit = self.plugin.unit(sym).cloned().ok_or_else(|| {
            Irq::error(GenieError::Internal("compiled PROP without thread".into()), n)
        })?;
        crate::codegen::run_thread(self, &unit, n)
    }

    pub fn evaluate_generic(&mut self, n: NodeId) -> Exec {
        let attr = self.tree.node(n).attr;
        if attr.is_coercion() {
            return self.coerce(n, attr);
        }
        match attr {
            Attribute::ParticularProgram => {
                let sub = self.tree.node(n).sub.expect("program has a clause");
                self.evaluate(sub)
            }
            Attribute::ClosedClause => self.closed_clause(n),
            Attribute::SerialClause => self.serial_clause(n),
            Attribute::ConditionalClause => self.conditional_clause(n),
            Attribute::IntegerCaseClause => self.integer_case(n),
            Attribute::ConformityClause => self.conformity_case(n),
            Attribute::LoopClause => self.loop_clause(n),
            Attribute::CollateralClause => self.row_display(n),
            Attribute::Denotation => self.denotation(n),
            Attribute::Identifier => self.identifier(n),
            Attribute::Formula => self.formula(n),
            Attribute::MonadicFormula => self.monadic_formula(n),
            Attribute::Call => self.call(n),
            Attribute::Slice => self.slice_unit(n),
            Attribute::Selection => self.selection(n),
            Attribute::Assignation => self.assignation(n),
            Attribute::IdentityRelation => self.identity_relation(n),
            Attribute::Cast => {
                let sub = self.tree.node(n).sub.expect("cast wraps a unit");
                self.evaluate(sub)
            }
            Attribute::Skip => {
                self.info.install(n, Prop::Generic);
                let mode = self.tree.node(n).mode;
                let v = self.skip_slots(mode, n)?;
                self.push_slots(v, n)
            }
            Attribute::Nihil => {
                self.info.install(n, Prop::Generic);
                self.push(Value::Name(Name::nil()), n)
            }
            Attribute::Jump => self.jump(n),
            Attribute::Assertion => {
                let sub = self.tree.node(n).sub.expect("assertion wraps a BOOL unit");
                self.evaluate(sub)?;
                if self.pop_bool_value(n)? {
                    Ok(())
                } else {
                    Err(Irq::error(GenieError::FalseAssertion, n))
                }
            }
            Attribute::CodeClause => Err(Irq::error(GenieError::CodeClause, n)),
            Attribute::RoutineText => {
                self.info.install(n, Prop::Generic);
                let mode = self.tree.node(n).mode;
                let environ = if self.frames.is_empty() {
                    None
                } else {
                    Some(self.frames.top_number())
                };
                self.push(
                    Value::Proc(Box::new(ProcVal {
                        mode,
                        body: ProcBody::Routine(n),
                        environ,
                        locale: None,
                        skip: false,
                    })),
                    n,
                )
            }
            Attribute::AndFunction | Attribute::OrFunction => self.short_circuit(n, attr),
            Attribute::IdentityDeclaration => self.identity_declaration(n),
            Attribute::VariableDeclaration => self.variable_declaration(n),
            Attribute::OperatorDeclaration | Attribute::ProcedureDeclaration => {
                self.identity_declaration(n)
            }
            Attribute::ModeDeclaration | Attribute::PriorityDeclaration => {
                // Resolved entirely at preparation time.
                self.info.install(n, Prop::Generic);
                Ok(())
            }
            Attribute::LocGenerator | Attribute::HeapGenerator => self.generator(n),
            Attribute::Label => Ok(()),
            other => Err(Irq::error(
                GenieError::Internal(format!("no evaluation for attribute {:?}", other)),
                n,
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Denotations and identifiers
    // -----------------------------------------------------------------------

    fn denotation(&mut self, n: NodeId) -> Exec {
        let node = self.tree.node(n);
        let mode = node.mode;
        let text = node.symbol.clone();
        let slots: Vec<Value> = match self.tree.modes.def(mode) {
            ModeDef::Int => {
                let v: i64 = text.replace(' ', "").parse().map_err(|_| {
                    Irq::error(
                        GenieError::InvalidDenotation { mode: "INT".into(), text: text.clone() },
                        n,
                    )
                })?;
                if !(mode::MIN_INT..=mode::MAX_INT).contains(&v) {
                    return Err(Irq::error(
                        GenieError::InvalidDenotation { mode: "INT".into(), text },
                        n,
                    ));
                }
                vec![Value::Int(v)]
            }
            ModeDef::Real => {
                let v: f64 = text.replace(' ', "").parse().map_err(|_| {
                    Irq::error(
                        GenieError::InvalidDenotation { mode: "REAL".into(), text: text.clone() },
                        n,
                    )
                })?;
                vec![Value::Real(v)]
            }
            ModeDef::Bool => vec![Value::Bool(text == "TRUE")],
            ModeDef::Char => vec![Value::Char(text.chars().next().unwrap_or(' '))],
            ModeDef::Bits => {
                let digits = text.trim_start_matches("2r");
                let v = u64::from_str_radix(digits, 2).map_err(|_| {
                    Irq::error(
                        GenieError::InvalidDenotation { mode: "BITS".into(), text: text.clone() },
                        n,
                    )
                })?;
                vec![Value::Bits(v)]
            }
            ModeDef::LongInt => {
                let v: i128 = text.replace(' ', "").parse().map_err(|_| {
                    Irq::error(
                        GenieError::InvalidDenotation {
                            mode: "LONG INT".into(),
                            text: text.clone(),
                        },
                        n,
                    )
                })?;
                vec![Value::LongInt(v)]
            }
            ModeDef::Row { of, .. } if *of == M_CHAR => {
                // String denotation: a fresh []CHAR on the heap.
                let chars: Vec<Value> = text.chars().map(Value::Char).collect();
                let desc =
                    stowed::make_row(&mut self.heap, &self.tree.modes, M_CHAR, chars.len(), &chars)
                        .map_err(|e| Irq::error(e, n))?;
                self.heap.pin(desc.elems);
                vec![Value::Row(Box::new(desc))]
            }
            other => {
                return Err(Irq::error(
                    GenieError::InvalidDenotation { mode: format!("{:?}", other), text },
                    n,
                ))
            }
        };
        // Heap-bearing blobs (string rows) are not cached: the cached
        // handles would not survive a rerun.
        if slots_cacheable(&slots) {
            self.info.info_mut(n).constant = Some(slots.clone().into_boxed_slice());
            self.info.set_status(n, Status::CONSTANT);
            self.info.install(n, Prop::Constant);
        } else {
            self.info.install(n, Prop::Generic);
        }
        self.push_slots(slots, n)
    }

    fn identifier(&mut self, n: NodeId) -> Exec {
        let tag_ref = self.tree.node(n).tag.ok_or_else(|| {
            Irq::error(GenieError::UnknownIdentifier { name: self.tree.node(n).symbol.clone() }, n)
        })?;
        let tag = self.tree.tag(tag_ref).clone();

        if let Some(stand) = tag.stand {
            self.info.install(n, Prop::StandCall(stand));
            return self.stand_identifier(n, stand);
        }
        if let Some(blob) = self.tag_consts.get(&(tag_ref.table, tag_ref.index)).cloned() {
            self.info.info_mut(n).constant = Some(blob.clone());
            self.info.set_status(n, Status::CONSTANT);
            self.info.install(n, Prop::Constant);
            return self.push_slots(blob.into_vec(), n);
        }
        let size = self.tree.modes.size(tag.mode);
        self.info.install(n, Prop::FrameLoad { level: tag.level, offset: tag.offset, size });
        self.frame_load(n, tag.level, tag.offset, size)
    }

    fn stand_identifier(&mut self, n: NodeId, index: u32) -> Exec {
        let entry = stdenv::proc_entry(index);
        if stdenv::is_constant_entry(index) {
            // Niladic constant: the entry pushes its value directly.
            return (entry.proc_)(self, n);
        }
        let mode = self.tree.node(n).mode;
        self.push(Value::Proc(Box::new(ProcVal::standenv(mode, index))), n)
    }

    pub fn frame_slot(&self, n: NodeId, level: u32, offset: usize) -> Exec<Value> {
        let frame = self.frames.frame_at_level(level).ok_or_else(|| {
            Irq::error(GenieError::Internal("static chain misses a level".into()), n)
        })?;
        Ok(self.frames.frame(frame).slots[offset].clone())
    }

    fn frame_load(&mut self, n: NodeId, level: u32, offset: usize, size: usize) -> Exec {
        let frame = self.frames.frame_at_level(level).ok_or_else(|| {
            Irq::error(GenieError::Internal("static chain misses a level".into()), n)
        })?;
        let slots = self.frames.frame(frame).slots[offset..offset + size].to_vec();
        for v in &slots {
            if !v.is_initialised() {
                let mode = self.tree.modes.spell(self.tree.node(n).mode);
                return Err(Irq::error(GenieError::UninitialisedValue { mode }, n));
            }
        }
        self.push_slots(slots, n)
    }

    // -----------------------------------------------------------------------
    // Coercions
    // -----------------------------------------------------------------------

    fn coerce(&mut self, n: NodeId, attr: Attribute) -> Exec {
        let sub = self.tree.node(n).sub.expect("coercion wraps a unit");
        match attr {
            Attribute::Voiding => {
                let width = self.tree.modes.size(self.tree.node(sub).mode);
                self.evaluate(sub)?;
                self.pop_slots(width);
                self.install_voided(n, sub);
                Ok(())
            }
            Attribute::Dereferencing => {
                let size = self.tree.modes.size(self.tree.node(n).mode);
                // DEREF of an identifier in a frame earns the dedicated PROP.
                let sub_node = self.tree.node(sub);
                if sub_node.attr == Attribute::Identifier {
                    if let Some(tag_ref) = sub_node.tag {
                        let tag = self.tree.tag(tag_ref);
                        if tag.stand.is_none() {
                            let (level, offset) = (tag.level, tag.offset);
                            self.info.install(n, Prop::FrameDeref { level, offset });
                        }
                    }
                }
                self.evaluate(sub)?;
                let name = self.pop_name(n)?;
                self.deref_name(n, name, size)
            }
            Attribute::Deproceduring => {
                self.evaluate(sub)?;
                let p = match self.pop() {
                    Value::Proc(p) => *p,
                    Value::Empty => {
                        return Err(Irq::error(
                            GenieError::UninitialisedValue { mode: "PROC".into() },
                            n,
                        ))
                    }
                    other => {
                        return Err(Irq::error(
                            GenieError::Internal(format!("PROC expected, found {:?}", other)),
                            n,
                        ))
                    }
                };
                self.invoke(p, Vec::new(), n)
            }
            Attribute::Uniting => {
                let inner_mode = self.tree.node(sub).mode;
                let width = self.tree.modes.size(inner_mode);
                self.evaluate(sub)?;
                let slots = self.pop_slots(width);
                self.push(Value::United(inner_mode, slots.into_boxed_slice()), n)
            }
            Attribute::Widening => self.widening(n, sub),
            Attribute::Rowing => self.rowing(n, sub),
            _ => unreachable!("not a coercion: {:?}", attr),
        }
    }

    fn install_voided(&mut self, n: NodeId, sub: NodeId) {
        if let p @ (Prop::Constant
        | Prop::FrameLoad { .. }
        | Prop::FrameDeref { .. }
        | Prop::DyadicStd { .. }
        | Prop::StandProcCall(_)
        | Prop::AssignConst) = self.info.prop(sub).clone()
        {
            self.info.install(n, Prop::Voided(Box::new(p)));
        }
    }

    pub fn deref_name(&mut self, n: NodeId, name: Name, size: usize) -> Exec {
        let slots = self.read_name(n, name, size)?;
        for v in &slots {
            if !v.is_initialised() {
                let mode = self.tree.modes.spell(self.tree.node(n).mode);
                return Err(Irq::error(GenieError::UninitialisedValue { mode }, n));
            }
        }
        self.push_slots(slots, n)
    }

    pub fn read_name(&self, n: NodeId, name: Name, size: usize) -> Exec<Vec<Value>> {
        match name.target {
            Target::Nil => Err(Irq::error(GenieError::NilDereference, n)),
            Target::Frame { frame, offset } => {
                Ok(self.frames.frame(frame).slots[offset..offset + size].to_vec())
            }
            Target::Heap { handle, offset } => {
                Ok(self.heap.slots(handle)[offset..offset + size].to_vec())
            }
        }
    }

    fn widening(&mut self, n: NodeId, sub: NodeId) -> Exec {
        let target = self.tree.node(n).mode;
        self.evaluate(sub)?;
        let v = self.pop();
        let widened = self.widen_value(n, v, target)?;
        self.push_slots(widened, n)?;
        // Constant denotations fold through the widening.
        if self.info.status(sub).contains(Status::CONSTANT) && self.info.prop(n).is_unset() {
            let width = self.tree.modes.size(target);
            let slots = self.stack[self.stack.len() - width..].to_vec();
            if slots_cacheable(&slots) {
                self.info.info_mut(n).constant = Some(slots.into_boxed_slice());
                self.info.set_status(n, Status::CONSTANT);
                self.info.install(n, Prop::Constant);
            }
        }
        Ok(())
    }

    fn widen_value(&mut self, n: NodeId, v: Value, target: ModeId) -> Exec<Vec<Value>> {
        let out = match (v, self.tree.modes.def(target).clone()) {
            (Value::Int(i), ModeDef::Real) => vec![Value::Real(i as f64)],
            (Value::Int(i), ModeDef::LongInt) => vec![Value::LongInt(i as i128)],
            (Value::LongInt(i), ModeDef::LongReal) => vec![Value::LongReal(i as f64)],
            (Value::Real(r), ModeDef::LongReal) => vec![Value::LongReal(r)],
            (Value::LongReal(r), ModeDef::Real) => {
                // Narrowing direction exists only for denotation folding.
                vec![Value::Real(r)]
            }
            (Value::Real(r), ModeDef::Complex) => vec![Value::Complex(r, 0.0)],
            (Value::Bits(w), ModeDef::Row { of, .. }) if of == M_BOOL => {
                let bools: Vec<Value> =
                    (0..64).rev().map(|i| Value::Bool(w >> i & 1 == 1)).collect();
                let desc = stowed::make_row(&mut self.heap, &self.tree.modes, M_BOOL, 64, &bools)
                    .map_err(|e| Irq::error(e, n))?;
                vec![Value::Row(Box::new(desc))]
            }
            (Value::Bytes(b), ModeDef::Row { of, .. }) if of == M_CHAR => {
                let chars: Vec<Value> =
                    b.iter().map(|&c| Value::Char(c as char)).collect();
                let desc = stowed::make_row(&mut self.heap, &self.tree.modes, M_CHAR, 32, &chars)
                    .map_err(|e| Irq::error(e, n))?;
                vec![Value::Row(Box::new(desc))]
            }
            (Value::Empty, _) => {
                return Err(Irq::error(
                    GenieError::UninitialisedValue { mode: self.tree.modes.spell(target) },
                    n,
                ))
            }
            (v, _) => {
                return Err(Irq::error(
                    GenieError::Internal(format!(
                        "no widening from {:?} to {}",
                        v,
                        self.tree.modes.spell(target)
                    )),
                    n,
                ))
            }
        };
        Ok(out)
    }

    fn rowing(&mut self, n: NodeId, sub: NodeId) -> Exec {
        let target = self.tree.node(n).mode;
        let sub_mode = self.tree.node(sub).mode;
        self.evaluate(sub)?;

        // Rowing a name: REF amode -> REF [1:1] amode; NIL stays NIL.
        if let (Some(ref_row), Some(_)) = (self.tree.modes.deref(target), self.tree.modes.deref(sub_mode)) {
            if let Some((elem, _, _)) = self.tree.modes.row_of(ref_row) {
                let name = self.pop_name(n)?;
                if name.is_nil() {
                    return self.push(Value::Name(Name::nil()), n);
                }
                let elem_size = self.tree.modes.size(elem);
                let frame_slots = match name.target {
                    Target::Frame { frame, offset } => {
                        Some(self.frames.frame(frame).slots[offset..offset + elem_size].to_vec())
                    }
                    _ => None,
                };
                let desc = stowed::make_ref_row_of_row(
                    &mut self.heap,
                    &self.tree.modes,
                    name,
                    elem,
                    frame_slots.as_deref(),
                )
                .map_err(|e| Irq::error(e, n))?
                .expect("non-NIL name rows to a descriptor");
                let row_val = Value::Row(Box::new(desc));
                let holder = self
                    .heap
                    .alloc(ref_row, HeapObj::Slots(vec![row_val]))
                    .map_err(|e| Irq::error(e, n))?;
                return self.push(
                    Value::Name(Name {
                        scope: name.scope,
                        target: Target::Heap { handle: holder, offset: 0 },
                    }),
                    n,
                );
            }
        }

        // Rowing a value into [1:1], or a row into a row of higher rank.
        let (elem, dims, _) = self.tree.modes.row_of(target).ok_or_else(|| {
            Irq::error(GenieError::Internal("rowing to a non-row mode".into()), n)
        })?;
        if dims == 1 || self.tree.modes.row_of(sub_mode).is_none() {
            let width = self.tree.modes.size(sub_mode);
            let mut slots = vec![Value::Empty; width];
            for i in (0..width).rev() {
                slots[i] = self.pop();
            }
            let desc = stowed::make_row(&mut self.heap, &self.tree.modes, elem, 1, &slots)
                .map_err(|e| Irq::error(e, n))?;
            self.push(Value::Row(Box::new(desc)), n)
        } else {
            let src = match self.pop() {
                Value::Row(d) => *d,
                other => {
                    return Err(Irq::error(
                        GenieError::Internal(format!("row expected for rowing, found {:?}", other)),
                        n,
                    ))
                }
            };
            let desc = stowed::make_rowrow(&mut self.heap, &self.tree.modes, &[src])
                .map_err(|e| Irq::error(e, n))?;
            self.push(Value::Row(Box::new(desc)), n)
        }
    }

    // -----------------------------------------------------------------------
    // Formulas
    // -----------------------------------------------------------------------

    fn operand_key(&self, m: ModeId) -> String {
        self.tree.modes.short_id(m).to_string()
    }

    fn formula(&mut self, n: NodeId) -> Exec {
        let node = self.tree.node(n);
        let lhs = node.sub.expect("formula keeps operands");
        let rhs = self.tree.node(lhs).next.expect("dyadic formula has two operands");
        let symbol = node.symbol.clone();

        // A user-declared operator shadows the standard environ.
        if let Some(tag_ref) = node.tag {
            let tag = self.tree.tag(tag_ref).clone();
            if tag.stand.is_none() {
                self.evaluate(lhs)?;
                self.evaluate(rhs)?;
                return self.call_tagged_routine(n, tag_ref, 2);
            }
        }

        let key = format!(
            "{}{}",
            self.operand_key(self.tree.node(lhs).mode),
            self.operand_key(self.tree.node(rhs).mode)
        );
        let index = stdenv::find_dyad(&symbol, &key).ok_or_else(|| {
            Irq::error(GenieError::UnknownIdentifier { name: format!("OP {}", symbol) }, n)
        })?;
        self.info.install(n, Prop::DyadicStd { index });
        self.evaluate(lhs)?;
        self.evaluate(rhs)?;
        (stdenv::dyad(index).proc_)(self, n)
    }

    fn monadic_formula(&mut self, n: NodeId) -> Exec {
        let node = self.tree.node(n);
        let operand = node.sub.expect("monadic formula keeps its operand");
        let symbol = node.symbol.clone();
        if let Some(tag_ref) = node.tag {
            let tag = self.tree.tag(tag_ref).clone();
            if tag.stand.is_none() {
                self.evaluate(operand)?;
                return self.call_tagged_routine(n, tag_ref, 1);
            }
        }
        let key = self.operand_key(self.tree.node(operand).mode);
        let index = stdenv::find_monad(&symbol, &key).ok_or_else(|| {
            Irq::error(GenieError::UnknownIdentifier { name: format!("OP {}", symbol) }, n)
        })?;
        self.evaluate(operand)?;
        (stdenv::monad(index).proc_)(self, n)
    }

    fn short_circuit(&mut self, n: NodeId, attr: Attribute) -> Exec {
        let node = self.tree.node(n);
        let lhs = node.sub.expect("short-circuit keeps operands");
        let rhs = self.tree.node(lhs).next.expect("short-circuit has two operands");
        self.evaluate(lhs)?;
        let l = self.pop_bool_value(n)?;
        match (attr, l) {
            (Attribute::AndFunction, false) => self.push(Value::Bool(false), n),
            (Attribute::OrFunction, true) => self.push(Value::Bool(true), n),
            _ => self.evaluate(rhs),
        }
    }

    /// Call the routine a tag binds (user-defined operators), with
    /// `arity` operand values already on the stack.
    fn call_tagged_routine(&mut self, n: NodeId, tag_ref: TagRef, arity: usize) -> Exec {
        let tag = self.tree.tag(tag_ref).clone();
        let body = tag.body.ok_or_else(|| {
            Irq::error(GenieError::Internal(format!("operator {} has no body", tag.name)), n)
        })?;
        // Operand slots are on the stack in declaration order.
        let environ = self.frames.frame_at_level(tag.level);
        let p = ProcVal {
            mode: tag.mode,
            body: ProcBody::Routine(body),
            environ,
            locale: None,
            skip: false,
        };
        let mut args = Vec::with_capacity(arity);
        let routine_params = self.routine_params(body);
        for (_, pmode) in routine_params.iter().rev() {
            let width = self.tree.modes.size(*pmode);
            let mut slots = self.pop_slots(width);
            args.push(std::mem::take(&mut slots));
        }
        args.reverse();
        self.invoke_with(p, args, n)
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn call(&mut self, n: NodeId) -> Exec {
        let node = self.tree.node(n);
        let primary = node.sub.expect("call keeps its primary");
        let args: Vec<NodeId> = self.tree.children(n).skip(1).collect();

        // Standard-environ call: arguments straight onto the stack, the
        // entry pops them itself. The call node gets its own PROP; the
        // identifier-value evaluator would push a PROC instead.
        let prim_node = self.tree.node(primary);
        if prim_node.attr == Attribute::Identifier {
            if let Some(tag_ref) = prim_node.tag {
                if let Some(stand) = self.tree.tag(tag_ref).stand {
                    self.info.install(n, Prop::StandProcCall(stand));
                    for a in &args {
                        self.evaluate(*a)?;
                    }
                    return (stdenv::proc_entry(stand).proc_)(self, n);
                }
            }
        }

        self.evaluate(primary)?;
        let p = match self.pop() {
            Value::Proc(p) => *p,
            Value::Empty => {
                return Err(Irq::error(GenieError::UninitialisedValue { mode: "PROC".into() }, n))
            }
            other => {
                return Err(Irq::error(
                    GenieError::Internal(format!("PROC expected, found {:?}", other)),
                    n,
                ))
            }
        };
        let mut arg_values: Vec<Vec<Value>> = Vec::with_capacity(args.len());
        for a in &args {
            self.evaluate(*a)?;
            let width = self.tree.modes.size(self.tree.node(*a).mode);
            arg_values.push(self.pop_slots(width));
        }
        self.invoke_with(p, arg_values, n)
    }

    /// Pop the argument values of a standard-environ call, outermost
    /// argument first, using the call node's children for their widths.
    pub fn take_call_args(&mut self, call: NodeId) -> Exec<Vec<Vec<Value>>> {
        let args: Vec<NodeId> = self.tree.children(call).skip(1).collect();
        let mut out: Vec<Vec<Value>> = Vec::with_capacity(args.len());
        for a in args.iter().rev() {
            let width = self.tree.modes.size(self.tree.node(*a).mode);
            out.push(self.pop_slots(width));
        }
        out.reverse();
        Ok(out)
    }

    /// Invoke with no arguments (deproceduring).
    pub fn invoke(&mut self, p: ProcVal, args: Vec<Vec<Value>>, n: NodeId) -> Exec {
        self.invoke_with(p, args, n)
    }

    fn routine_params(&self, routine: NodeId) -> Vec<(TagRef, ModeId)> {
        self.tree
            .children(routine)
            .filter(|&c| self.tree.node(c).attr == Attribute::DefiningIdentifier)
            .map(|c| {
                let tag = self.tree.node(c).tag.expect("parameter has a tag");
                (tag, self.tree.tag(tag).mode)
            })
            .collect()
    }

    /// Procedure call: open a procedure frame statically linked to the
    /// captured environ, fill parameter slots, recurse on the body.
    /// Partial argument lists extend the locale and rebuild a PROC value
    /// instead of executing.
    pub fn invoke_with(&mut self, p: ProcVal, args: Vec<Vec<Value>>, n: NodeId) -> Exec {
        if p.skip {
            let yields = match self.tree.modes.def(p.mode) {
                ModeDef::Proc { yields, .. } => *yields,
                _ => M_VOID,
            };
            let slots = self.skip_slots(yields, n)?;
            return self.push_slots(slots, n);
        }
        match p.body {
            ProcBody::Stand(i) => {
                for a in args {
                    self.push_slots(a, n)?;
                }
                (stdenv::proc_entry(i).proc_)(self, n)
            }
            ProcBody::Routine(routine) => {
                if self.call_depth >= MAX_CALL_DEPTH {
                    return Err(Irq::error(GenieError::SystemStackOverflow, n));
                }
                let params = self.routine_params(routine);

                // Merge the locale with the new arguments.
                let mut filled: Vec<Option<Vec<Value>>> = match p.locale {
                    Some(h) => self.heap.locale(h).filled.clone(),
                    None => vec![None; params.len()],
                };
                let mut supply = args.into_iter();
                for slot in filled.iter_mut() {
                    if slot.is_none() {
                        match supply.next() {
                            Some(v) => *slot = Some(v),
                            None => break,
                        }
                    }
                }

                if filled.iter().any(Option::is_none) {
                    // Fewer filled locale slots than parameters: a new
                    // PROC value, not an invocation.
                    let locale = Locale {
                        params: params.iter().map(|(_, m)| *m).collect(),
                        filled,
                    };
                    let h = self
                        .heap
                        .alloc(p.mode, HeapObj::Locale(locale))
                        .map_err(|e| Irq::error(e, n))?;
                    return self.push(
                        Value::Proc(Box::new(ProcVal { locale: Some(h), ..p })),
                        n,
                    );
                }

                let routine_node = self.tree.node(routine);
                let table = routine_node.table;
                let level = self.tree.table(table).level;
                let size = self.tree.table(table).frame_size;
                let body = self
                    .tree
                    .children(routine)
                    .find(|&c| self.tree.node(c).attr != Attribute::DefiningIdentifier)
                    .expect("routine has a body");

                self.call_depth += 1;
                let sp = self.sp();
                let fno = self
                    .frames
                    .open(
                        &self.conf,
                        routine,
                        table,
                        level,
                        size,
                        p.environ,
                        true,
                        self.tree.table(table).has_labels,
                        self.cur_thread,
                        sp,
                    )
                    .map_err(|e| Irq::error(e, n))?;
                for ((tag_ref, _), slots) in params.iter().zip(filled) {
                    let offset = self.tree.tag(*tag_ref).offset;
                    let slots = slots.expect("all locale slots are filled");
                    let frame = self.frames.frame_mut(fno);
                    frame.slots[offset..offset + slots.len()].clone_from_slice(&slots);
                }

                let result = self.evaluate(body);
                self.call_depth -= 1;
                match result {
                    Ok(()) => {
                        self.frames.unwind_to(fno);
                        self.frames.close();
                        Ok(())
                    }
                    Err(irq) => {
                        if let Irq::Jump(j) = &irq {
                            if j.frame < fno {
                                self.frames.unwind_to(fno);
                                self.frames.close();
                            }
                        }
                        Err(irq)
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Slices and selections
    // -----------------------------------------------------------------------

    fn slice_unit(&mut self, n: NodeId) -> Exec {
        let node = self.tree.node(n);
        let primary = node.sub.expect("slice keeps its primary");
        let indexers: Vec<NodeId> = self.tree.children(n).skip(1).collect();
        let prim_mode = self.tree.node(primary).mode;
        let on_name = self.tree.modes.deref(prim_mode).is_some();

        self.evaluate(primary)?;
        let (desc, name) = if on_name {
            let name = self.pop_name(n)?;
            if name.is_nil() {
                return Err(Irq::error(GenieError::AccessThroughNil, n));
            }
            let slots = self.read_name(n, name, 1)?;
            match slots.into_iter().next() {
                Some(Value::Row(d)) => (*d, Some(name)),
                Some(Value::Empty) | None => {
                    return Err(Irq::error(
                        GenieError::UninitialisedValue {
                            mode: self.tree.modes.spell(prim_mode),
                        },
                        n,
                    ))
                }
                Some(other) => {
                    return Err(Irq::error(
                        GenieError::Internal(format!("row expected, found {:?}", other)),
                        n,
                    ))
                }
            }
        } else {
            match self.pop() {
                Value::Row(d) => (*d, None),
                Value::Empty => {
                    return Err(Irq::error(
                        GenieError::UninitialisedValue {
                            mode: self.tree.modes.spell(prim_mode),
                        },
                        n,
                    ))
                }
                other => {
                    return Err(Irq::error(
                        GenieError::Internal(format!("row expected, found {:?}", other)),
                        n,
                    ))
                }
            }
        };

        // Evaluate indexers left to right.
        let mut specs = Vec::with_capacity(indexers.len());
        let mut basic = true;
        for &ix in &indexers {
            let ix_node = self.tree.node(ix);
            if ix_node.attr == Attribute::Trimmer {
                basic = false;
                let mut lower = None;
                let mut upper = None;
                let mut at = None;
                for part in self.tree.children(ix).collect::<Vec<_>>() {
                    let part_attr = self.tree.node(part).attr;
                    let unit = self.tree.node(part).sub.expect("trim part wraps a unit");
                    self.evaluate(unit)?;
                    let v = self.pop_int_value(n)?;
                    match part_attr {
                        Attribute::TrimLower => lower = Some(v),
                        Attribute::TrimUpper => upper = Some(v),
                        Attribute::TrimAt => at = Some(v),
                        _ => {}
                    }
                }
                specs.push(stowed::SliceSpec::Trim { lower, upper, at });
            } else {
                if !matches!(ix_node.attr, Attribute::Denotation | Attribute::Identifier) {
                    basic = false;
                }
                self.evaluate(ix)?;
                specs.push(stowed::SliceSpec::Index(self.pop_int_value(n)?));
            }
        }

        let sliced = stowed::slice(&desc, &specs).map_err(|e| Irq::error(e, n))?;
        if basic && name.is_some() {
            self.info.install(n, Prop::SliceBasic);
        }
        match (sliced, name) {
            (stowed::Sliced::Element(at), Some(name)) => self.push(
                Value::Name(Name {
                    scope: name.scope,
                    target: Target::Heap { handle: desc.elems, offset: at },
                }),
                n,
            ),
            (stowed::Sliced::Element(at), None) => {
                let slots = self.heap.slots(desc.elems)[at..at + desc.elem_size].to_vec();
                for v in &slots {
                    if !v.is_initialised() {
                        let mode = self.tree.modes.spell(self.tree.node(n).mode);
                        return Err(Irq::error(GenieError::UninitialisedValue { mode }, n));
                    }
                }
                self.push_slots(slots, n)
            }
            (stowed::Sliced::SubRow(sub), None) => self.push(Value::Row(Box::new(sub)), n),
            (stowed::Sliced::SubRow(sub), Some(name)) => {
                // A trim of a name materialises its descriptor on the heap.
                let mode = self.tree.node(n).mode;
                let holder = self
                    .heap
                    .alloc(mode, HeapObj::Slots(vec![Value::Row(Box::new(sub))]))
                    .map_err(|e| Irq::error(e, n))?;
                self.push(
                    Value::Name(Name {
                        scope: name.scope,
                        target: Target::Heap { handle: holder, offset: 0 },
                    }),
                    n,
                )
            }
        }
    }

    fn selection(&mut self, n: NodeId) -> Exec {
        let node = self.tree.node(n);
        let secondary = node.sub.expect("selection keeps its secondary");
        let field_name = node.symbol.clone();
        let sec_mode = self.tree.node(secondary).mode;

        if let Some(struct_mode) = self.tree.modes.deref(sec_mode) {
            // Selection through a REF: bump the name by the field offset.
            let (offset, fmode) =
                self.tree.modes.field(struct_mode, &field_name).ok_or_else(|| {
                    Irq::error(GenieError::UnknownIdentifier { name: field_name.clone() }, n)
                })?;
            let _ = fmode;
            self.info.install(n, Prop::SelectRef { offset });
            self.evaluate(secondary)?;
            let name = self.pop_name(n)?;
            if name.is_nil() {
                return Err(Irq::error(GenieError::AccessThroughNil, n));
            }
            return self.push(Value::Name(name.shifted(offset)), n);
        }

        if let Some((elem, _, _)) = self.tree.modes.row_of(sec_mode) {
            // Field selection distributes over rows: descriptor-only.
            let (offset, fmode) = self.tree.modes.field(elem, &field_name).ok_or_else(|| {
                Irq::error(GenieError::UnknownIdentifier { name: field_name.clone() }, n)
            })?;
            self.evaluate(secondary)?;
            let desc = match self.pop() {
                Value::Row(d) => *d,
                other => {
                    return Err(Irq::error(
                        GenieError::Internal(format!("row expected, found {:?}", other)),
                        n,
                    ))
                }
            };
            let mut out = desc;
            out.field += offset;
            out.elem_mode = fmode;
            return self.push(Value::Row(Box::new(out)), n);
        }

        let (offset, fmode) = self.tree.modes.field(sec_mode, &field_name).ok_or_else(|| {
            Irq::error(GenieError::UnknownIdentifier { name: field_name.clone() }, n)
        })?;
        let fsize = self.tree.modes.size(fmode);
        let total = self.tree.modes.size(sec_mode);
        self.evaluate(secondary)?;
        let slots = self.pop_slots(total);
        self.push_slots(slots[offset..offset + fsize].to_vec(), n)
    }

    // -----------------------------------------------------------------------
    // Assignation and identity
    // -----------------------------------------------------------------------

    pub fn assignation(&mut self, n: NodeId) -> Exec {
        let node = self.tree.node(n);
        let dest = node.sub.expect("assignation keeps its destination");
        let source = self.tree.node(dest).next.expect("assignation has a source");
        let src_mode = self.tree.node(source).mode;
        let width = self.tree.modes.size(src_mode);

        self.evaluate(dest)?;
        let name = self.pop_name(n)?;
        if name.is_nil() {
            return Err(Irq::error(GenieError::AccessThroughNil, n));
        }
        self.evaluate(source)?;
        let slots = self.pop_slots(width);

        // The scope check runs at push time, before any copy.
        let src_scope = self.scope_of_slots(&slots);
        if src_scope > name.scope {
            return Err(Irq::error(
                GenieError::ScopeViolation { src_scope, dest: name.scope },
                n,
            ));
        }

        self.store_through(n, name, src_mode, slots)?;
        if self.info.status(source).contains(Status::CONSTANT) && self.info.prop(n).is_unset() {
            self.info.install(n, Prop::AssignConst);
        }
        // An assignation yields its destination.
        self.push(Value::Name(name), n)
    }

    /// Copy `slots` of `mode` through `name`. Values with rows clone or
    /// store; flat values move directly.
    pub fn store_through(
        &mut self,
        n: NodeId,
        name: Name,
        mode: ModeId,
        slots: Vec<Value>,
    ) -> Exec {
        let flex = matches!(self.tree.modes.def(mode), ModeDef::Row { flex: true, .. });
        if let Some((_, _, _)) = self.tree.modes.row_of(mode) {
            let src = match slots.into_iter().next() {
                Some(Value::Row(d)) => *d,
                Some(Value::Empty) | None => {
                    return Err(Irq::error(
                        GenieError::UninitialisedValue { mode: self.tree.modes.spell(mode) },
                        n,
                    ))
                }
                Some(other) => {
                    return Err(Irq::error(
                        GenieError::Internal(format!("row expected, found {:?}", other)),
                        n,
                    ))
                }
            };
            let current = self.read_name(n, name, 1)?.into_iter().next();
            match current {
                Some(Value::Row(dst)) if !flex => {
                    stowed::store_row(&mut self.heap, &self.tree.modes, &dst, &src)
                        .map_err(|e| Irq::error(e, n))?;
                    return Ok(());
                }
                _ => {
                    let cloned = stowed::clone_row(&mut self.heap, &self.tree.modes, &src, None)
                        .map_err(|e| Irq::error(e, n))?;
                    return self.write_name(n, name, vec![Value::Row(Box::new(cloned))]);
                }
            }
        }

        let cloned = if self.tree.modes.is_stowed(mode) {
            stowed::clone_slots(&mut self.heap, &self.tree.modes, &slots)
                .map_err(|e| Irq::error(e, n))?
        } else {
            slots
        };
        self.write_name(n, name, cloned)
    }

    pub fn write_name(&mut self, n: NodeId, name: Name, slots: Vec<Value>) -> Exec {
        match name.target {
            Target::Nil => Err(Irq::error(GenieError::AccessThroughNil, n)),
            Target::Frame { frame, offset } => {
                let f = self.frames.frame_mut(frame);
                f.slots[offset..offset + slots.len()].clone_from_slice(&slots);
                Ok(())
            }
            Target::Heap { handle, offset } => {
                let v = self.heap.slots_mut(handle);
                v[offset..offset + slots.len()].clone_from_slice(&slots);
                Ok(())
            }
        }
    }

    /// Dynamic scope of a value: the youngest scope any contained name
    /// or routine environ pins.
    pub fn scope_of_slots(&self, slots: &[Value]) -> u32 {
        let mut scope = PRIMAL_SCOPE;
        for v in slots {
            scope = scope.max(self.scope_of_value(v));
        }
        scope
    }

    fn scope_of_value(&self, v: &Value) -> u32 {
        match v {
            Value::Name(name) => name.scope,
            Value::Proc(p) => p.environ.map_or(PRIMAL_SCOPE, frame_scope),
            Value::Format(f) => frame_scope(f.environ),
            Value::United(_, slots) => self.scope_of_slots(slots),
            Value::Row(desc) => {
                let mut scope = PRIMAL_SCOPE;
                if self.heap.is_live(desc.elems) {
                    for slot in self.heap.slots(desc.elems) {
                        scope = scope.max(self.scope_of_value(slot));
                    }
                }
                scope
            }
            _ => PRIMAL_SCOPE,
        }
    }

    fn identity_relation(&mut self, n: NodeId) -> Exec {
        let node = self.tree.node(n);
        let lhs = node.sub.expect("identity relation keeps operands");
        let rhs = self.tree.node(lhs).next.expect("identity relation has two operands");
        let negated = node.symbol == "ISNT";
        self.evaluate(lhs)?;
        let a = self.pop_name(n)?;
        self.evaluate(rhs)?;
        let b = self.pop_name(n)?;
        let same = match (a.target, b.target) {
            (Target::Nil, Target::Nil) => true,
            (Target::Nil, _) | (_, Target::Nil) => false,
            (ta, tb) => ta == tb,
        };
        self.push(Value::Bool(same != negated), n)
    }

    // -----------------------------------------------------------------------
    // Declarations and generators
    // -----------------------------------------------------------------------

    fn identity_declaration(&mut self, n: NodeId) -> Exec {
        let def = self
            .tree
            .child(n, Attribute::DefiningIdentifier)
            .expect("identity declaration defines a tag");
        let source = self.tree.node(def).next.expect("identity declaration has a source");
        let tag_ref = self.tree.node(def).tag.expect("defining identifier has a tag");
        let tag = self.tree.tag(tag_ref).clone();
        let width = self.tree.modes.size(tag.mode);

        self.evaluate(source)?;
        let slots = self.pop_slots(width);
        let frame = self.frames.top_number();
        let f = self.frames.frame_mut(frame);
        f.slots[tag.offset..tag.offset + width].clone_from_slice(&slots);

        // A constant source promotes the tag itself to CONSTANT.
        if self.info.status(source).contains(Status::CONSTANT) && slots_cacheable(&slots) {
            self.tag_consts
                .insert((tag_ref.table, tag_ref.index), slots.into_boxed_slice());
        }
        self.info.install(n, Prop::Generic);
        Ok(())
    }

    fn variable_declaration(&mut self, n: NodeId) -> Exec {
        let def = self
            .tree
            .child(n, Attribute::DefiningIdentifier)
            .expect("variable declaration defines a tag");
        let tag_ref = self.tree.node(def).tag.expect("defining identifier has a tag");
        let tag = self.tree.tag(tag_ref).clone();

        let gen = self
            .tree
            .children(n)
            .find(|&c| {
                matches!(
                    self.tree.node(c).attr,
                    Attribute::LocGenerator | Attribute::HeapGenerator
                )
            })
            .expect("variable declaration carries its generator");
        self.evaluate(gen)?;
        let name = self.pop_name(n)?;
        let frame = self.frames.top_number();
        self.frames.frame_mut(frame).slots[tag.offset] = Value::Name(name);

        // Optional initialising assignment.
        if let Some(init) = self.tree.children(n).find(|&c| {
            c != def
                && c != gen
                && self.tree.node(c).attr != Attribute::DefiningIdentifier
        }) {
            let src_mode = self.tree.node(init).mode;
            let width = self.tree.modes.size(src_mode);
            self.evaluate(init)?;
            let slots = self.pop_slots(width);
            let src_scope = self.scope_of_slots(&slots);
            if src_scope > name.scope {
                return Err(Irq::error(
                    GenieError::ScopeViolation { src_scope, dest: name.scope },
                    n,
                ));
            }
            self.store_through(n, name, src_mode, slots)?;
        }
        self.info.install(n, Prop::Generic);
        Ok(())
    }

    /// LOC carves space from the frame; HEAP allocates a handle. Row
    /// bounds are evaluated before allocation and checked for positive
    /// sizes.
    fn generator(&mut self, n: NodeId) -> Exec {
        let node = self.tree.node(n);
        let heap_gen = node.attr == Attribute::HeapGenerator;
        let base_mode = self
            .tree
            .modes
            .deref(node.mode)
            .expect("generator yields a name");
        let bounds: Vec<NodeId> = self
            .tree
            .children(n)
            .filter(|&c| self.tree.node(c).attr == Attribute::BoundPair)
            .collect();

        let initial: Vec<Value> = if let Some((elem, dims, _)) = self.tree.modes.row_of(base_mode) {
            let mut tuples = Vec::with_capacity(dims as usize);
            for b in &bounds {
                let lo_unit = self.tree.node(*b).sub.expect("bound pair has a lower bound");
                let up_unit = self.tree.node(lo_unit).next.expect("bound pair has an upper bound");
                self.evaluate(lo_unit)?;
                let lo = self.pop_int_value(n)?;
                self.evaluate(up_unit)?;
                let up = self.pop_int_value(n)?;
                if up - lo < -1 {
                    return Err(Irq::error(GenieError::InvalidBound, n));
                }
                tuples.push((lo, up));
            }
            while tuples.len() < dims as usize {
                tuples.push((1, 0));
            }
            let elem_size = self.tree.modes.size(elem).max(1);
            let count: i64 = tuples.iter().map(|(l, u)| (u - l + 1).max(0)).product();
            let flat = vec![Value::Empty; (count.max(1) as usize) * elem_size];
            let elems = self
                .heap
                .alloc(elem, HeapObj::Slots(flat))
                .map_err(|e| Irq::error(e, n))?;
            let mut spans = vec![1i64; tuples.len()];
            for i in (0..tuples.len().saturating_sub(1)).rev() {
                spans[i] = spans[i + 1] * (tuples[i + 1].1 - tuples[i + 1].0 + 1).max(1);
            }
            let desc = RowDesc {
                elem_mode: elem,
                elem_size,
                field: 0,
                elems,
                tuples: tuples
                    .iter()
                    .zip(spans)
                    .map(|(&(l, u), s)| crate::value::Tuple::new(l, u, s))
                    .collect(),
            };
            desc.check_size().map_err(|e| Irq::error(e, n))?;
            vec![Value::Row(Box::new(desc))]
        } else if self.tree.modes.deref(base_mode).is_some() {
            // An unassigned name is NIL, not garbage.
            vec![Value::Name(Name::nil())]
        } else {
            vec![Value::Empty; self.tree.modes.size(base_mode)]
        };

        if heap_gen {
            let handle = self
                .heap
                .alloc(base_mode, HeapObj::Slots(initial))
                .map_err(|e| Irq::error(e, n))?;
            self.maybe_collect();
            self.push(
                Value::Name(Name {
                    scope: PRIMAL_SCOPE,
                    target: Target::Heap { handle, offset: 0 },
                }),
                n,
            )
        } else {
            // The anonymous storage tag carved from the frame.
            let tag_ref = self.tree.node(n).tag.expect("LOC generator owns a storage tag");
            let tag = self.tree.tag(tag_ref).clone();
            let frame = self
                .frames
                .frame_at_level(tag.level)
                .expect("generator level is on the static chain");
            {
                let f = self.frames.frame_mut(frame);
                f.slots[tag.offset..tag.offset + initial.len()].clone_from_slice(&initial);
            }
            self.push(
                Value::Name(Name {
                    scope: frame_scope(frame),
                    target: Target::Frame { frame, offset: tag.offset },
                }),
                n,
            )
        }
    }

    pub fn skip_slots(&mut self, mode: ModeId, n: NodeId) -> Exec<Vec<Value>> {
        let out = match self.tree.modes.def(mode).clone() {
            ModeDef::Int => vec![Value::Int(0)],
            ModeDef::Real => vec![Value::Real(0.0)],
            ModeDef::Bool => vec![Value::Bool(false)],
            ModeDef::Char => vec![Value::Char(' ')],
            ModeDef::Bits => vec![Value::Bits(0)],
            ModeDef::LongInt => vec![Value::LongInt(0)],
            ModeDef::LongReal => vec![Value::LongReal(0.0)],
            ModeDef::Complex => vec![Value::Complex(0.0, 0.0)],
            ModeDef::Bytes => vec![Value::bytes_from_str("")],
            ModeDef::Void => vec![],
            ModeDef::Ref(_) => vec![Value::Name(Name::nil())],
            ModeDef::Proc { .. } => vec![Value::Proc(Box::new(ProcVal {
                mode,
                body: ProcBody::Routine(self.tree.root),
                environ: None,
                locale: None,
                skip: true,
            }))],
            ModeDef::Format => vec![Value::Format(Box::new(FormatVal {
                body: self.tree.root,
                environ: 0,
            }))],
            ModeDef::Row { of, dims, .. } => {
                let elem_size = self.tree.modes.size(of).max(1);
                let elems = self
                    .heap
                    .alloc(of, HeapObj::Slots(vec![Value::Empty; elem_size]))
                    .map_err(|e| Irq::error(e, n))?;
                let tuples = (0..dims).map(|_| crate::value::Tuple::new(1, 0, 1)).collect();
                vec![Value::Row(Box::new(RowDesc {
                    elem_mode: of,
                    elem_size,
                    field: 0,
                    elems,
                    tuples,
                }))]
            }
            ModeDef::Struct { fields } => {
                let mut slots = Vec::new();
                for (_, fm) in fields {
                    slots.extend(self.skip_slots(fm, n)?);
                }
                slots
            }
            ModeDef::Union { members } => {
                let member = members[0];
                let inner = self.skip_slots(member, n)?;
                vec![Value::United(member, inner.into_boxed_slice())]
            }
            ModeDef::File | ModeDef::Channel | ModeDef::Sound => {
                return Err(Irq::error(
                    GenieError::InvalidCast { mode: self.tree.modes.spell(mode) },
                    n,
                ))
            }
        };
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Jumps
    // -----------------------------------------------------------------------

    fn jump(&mut self, n: NodeId) -> Exec {
        let tag_ref = self.tree.node(n).tag.ok_or_else(|| {
            Irq::error(GenieError::UnknownIdentifier { name: self.tree.node(n).symbol.clone() }, n)
        })?;
        let tag = self.tree.tag(tag_ref).clone();
        let unit = tag.body.ok_or_else(|| {
            Irq::error(GenieError::Internal(format!("label {} binds no unit", tag.name)), n)
        })?;

        // Innermost dynamically enclosing frame owning the label's table
        // with a live continuation.
        let mut cur = Some(self.frames.top_number());
        let mut target = None;
        while let Some(fno) = cur {
            let f = self.frames.frame(fno);
            if f.table == tag_ref.table && f.jump_capable {
                if f.thread != self.cur_thread {
                    return Err(Irq::error(GenieError::ParallelJump, n));
                }
                target = Some(fno);
                break;
            }
            cur = f.dynamic_link;
        }
        let frame = target.ok_or_else(|| Irq::error(GenieError::DeadContinuation, n))?;
        self.info.jump_to[tag_ref.table as usize] = Some(unit);
        Err(Irq::Jump(Jump { table: tag_ref.table, unit, frame }))
    }

    // -----------------------------------------------------------------------
    // Safe points
    // -----------------------------------------------------------------------

    /// Cooperative collection at clause boundaries and allocation.
    pub fn maybe_collect(&mut self) {
        if gc::pressure(&self.heap, self.conf.gc_threshold_pct) {
            gc::collect(&mut self.heap, &self.frames, &self.stack);
        }
    }

    pub fn gc_stats(&self) -> crate::mem::HeapStats {
        self.heap.stats.clone()
    }

    /// Lift an element handle reference into a name for row elements.
    pub fn element_name(&self, scope: u32, elems: HandleId, offset: usize) -> Name {
        Name { scope, target: Target::Heap { handle: elems, offset } }
    }
}
