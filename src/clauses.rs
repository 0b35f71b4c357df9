/// Enclosed clauses: closed, conditional, case, conformity, loop and the
/// serial clause with its sequence worklist and jump catching. Also the
/// top-level run loop that owns the rerun/stop protocol.
///
/// Serial clauses are the only jump catchers: a jump request unwinds the
/// evaluation stack as a typed interrupt until the serial clause whose
/// frame owns the target label catches it, restores the stack pointer
/// captured at frame open, and resumes at the JUMP_TO unit.

use crate::errors::{Exec, GenieError, Irq};
use crate::genie::Genie;
use crate::mode::{ModeDef, MAX_INT, MIN_INT};
use crate::prop::Prop;
use crate::tree::{Attribute, NodeId, Status};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Exited { status: i32, force: bool },
    Failed { error: GenieError, node: NodeId },
}

impl Genie {
    // -----------------------------------------------------------------------
    // Top level
    // -----------------------------------------------------------------------

    pub fn run(&mut self) -> RunOutcome {
        // -O0 still runs the stripped level-1 pass.
        crate::codegen::compile_tree(self);
        loop {
            let root = self.tree.root;
            match self.evaluate(root) {
                Ok(()) => return RunOutcome::Exited { status: 0, force: false },
                Err(Irq::Stop { status, force }) => return RunOutcome::Exited { status, force },
                Err(Irq::Rerun) => {
                    self.reset_state();
                    continue;
                }
                Err(Irq::Jump(_)) => {
                    return RunOutcome::Failed {
                        error: GenieError::DeadContinuation,
                        node: self.cur_node,
                    }
                }
                Err(Irq::Error { error, node }) => {
                    if self.conf.debug && !error.is_fatal() {
                        match crate::monitor::enter_on_error(self, node, &error) {
                            Err(Irq::Rerun) => {
                                self.reset_state();
                                continue;
                            }
                            Err(Irq::Stop { status, force }) => {
                                return RunOutcome::Exited { status, force }
                            }
                            _ => {}
                        }
                    }
                    return RunOutcome::Failed { error, node };
                }
            }
        }
    }

    /// Restart the interpreter on the same job: fresh runtime state, same
    /// tree, breakpoints kept.
    pub fn reset_state(&mut self) {
        self.frames = Default::default();
        self.stack.clear();
        self.heap = crate::mem::Heap::new(self.conf.heap_limit);
        self.tag_consts.clear();
        for slot in self.info.jump_to.iter_mut() {
            *slot = None;
        }
    }

    // -----------------------------------------------------------------------
    // Closed and serial clauses
    // -----------------------------------------------------------------------

    pub(crate) fn closed_clause(&mut self, n: NodeId) -> Exec {
        let serial = self.tree.node(n).sub.expect("closed clause wraps a serial clause");
        self.run_enclosed(serial)
    }

    /// Open a frame for a serial clause's table, run it, close the frame.
    pub(crate) fn run_enclosed(&mut self, serial: NodeId) -> Exec {
        let table = self.tree.node(serial).table;
        let level = self.tree.table(table).level;
        let size = self.tree.table(table).frame_size;
        let has_labels = self.tree.table(table).has_labels;
        let static_link =
            if self.frames.is_empty() { None } else { Some(self.frames.top_number()) };
        let sp = self.sp();
        let node = serial;
        let fno = self
            .frames
            .open(
                &self.conf,
                node,
                table,
                level,
                size,
                static_link,
                false,
                has_labels,
                self.cur_thread,
                sp,
            )
            .map_err(|e| Irq::error(e, node))?;

        let r = self.serial_clause(serial);
        match r {
            Ok(()) => {
                self.frames.unwind_to(fno);
                self.frames.close();
                Ok(())
            }
            Err(Irq::Jump(j)) if j.frame < fno => {
                self.frames.unwind_to(fno);
                self.frames.close();
                Err(Irq::Jump(j))
            }
            Err(other) => Err(other),
        }
    }

    pub(crate) fn serial_clause(&mut self, n: NodeId) -> Exec {
        let table = self.tree.node(n).table;
        if !self.info.status(n).contains(Status::SEQUENCE) {
            let units: Vec<NodeId> = self
                .tree
                .children(n)
                .filter(|&c| self.tree.node(c).attr != Attribute::Label)
                .collect();
            self.info.thread_sequence(n, &units);
            self.info.info_mut(n).seq = units.first().copied();
        }
        let first = match self.info.info(n).seq {
            Some(u) => u,
            None => return Ok(()),
        };
        let fno = self.frames.top_number();

        'restart: loop {
            let mut skipping = self.info.jump_to[table as usize].take();
            let mut cur = Some(first);
            while let Some(u) = cur {
                let next = self.info.info(u).seq;
                if let Some(target) = skipping {
                    if u != target {
                        cur = next;
                        continue;
                    }
                    skipping = None;
                }
                match self.evaluate(u) {
                    Ok(()) => {}
                    Err(Irq::Jump(j)) if j.frame == fno && j.table == table => {
                        // Restore the pointers captured at frame open,
                        // then resume at the JUMP_TO unit.
                        self.frames.unwind_to(fno);
                        let sp = self.frames.frame(fno).sp_at_open;
                        self.stack.truncate(sp);
                        continue 'restart;
                    }
                    Err(e) => return Err(e),
                }
                self.maybe_collect();
                cur = next;
            }
            return Ok(());
        }
    }

    // -----------------------------------------------------------------------
    // Conditional
    // -----------------------------------------------------------------------

    pub(crate) fn conditional_clause(&mut self, n: NodeId) -> Exec {
        let enquiry = self
            .tree
            .child(n, Attribute::EnquiryClause)
            .expect("conditional keeps its enquiry");
        let enquiry_serial = self.tree.node(enquiry).sub.expect("enquiry wraps a serial clause");

        let table = self.tree.node(n).table;
        let level = self.tree.table(table).level;
        let size = self.tree.table(table).frame_size;
        let has_labels = self.tree.table(table).has_labels;
        let static_link =
            if self.frames.is_empty() { None } else { Some(self.frames.top_number()) };
        let sp = self.sp();
        let fno = self
            .frames
            .open(
                &self.conf,
                n,
                table,
                level,
                size,
                static_link,
                false,
                has_labels,
                self.cur_thread,
                sp,
            )
            .map_err(|e| Irq::error(e, n))?;

        let r = self.conditional_body(n, enquiry_serial);
        match &r {
            Err(Irq::Jump(j)) if j.frame >= fno => {}
            _ => {
                self.frames.unwind_to(fno);
                self.frames.close();
            }
        }
        r
    }

    fn conditional_body(&mut self, n: NodeId, enquiry_serial: NodeId) -> Exec {
        self.serial_clause(enquiry_serial)?;
        let cond = self.pop_bool_value(n)?;

        let then_part = self.tree.child(n, Attribute::ThenPart);
        let else_part = self.tree.child(n, Attribute::ElsePart);
        let chosen = if cond { then_part } else { else_part };
        match chosen {
            Some(part) => {
                let inner = self.tree.node(part).sub.expect("choice wraps its clause");
                match self.tree.node(inner).attr {
                    // ELIF chains nest a conditional directly.
                    Attribute::ConditionalClause => self.evaluate(inner),
                    _ => self.run_enclosed(inner),
                }
            }
            None => {
                // An omitted ELSE on a non-void conditional yields an
                // undefined value of the required mode.
                let width = self.tree.modes.size(self.tree.node(n).mode);
                for _ in 0..width {
                    self.push(Value::Empty, n)?;
                }
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Case clauses
    // -----------------------------------------------------------------------

    pub(crate) fn integer_case(&mut self, n: NodeId) -> Exec {
        let enquiry = self.tree.child(n, Attribute::EnquiryClause).expect("case keeps its enquiry");
        let enquiry_serial = self.tree.node(enquiry).sub.expect("enquiry wraps a serial clause");

        let table = self.tree.node(n).table;
        let level = self.tree.table(table).level;
        let size = self.tree.table(table).frame_size;
        let has_labels = self.tree.table(table).has_labels;
        let static_link =
            if self.frames.is_empty() { None } else { Some(self.frames.top_number()) };
        let sp = self.sp();
        let fno = self
            .frames
            .open(
                &self.conf,
                n,
                table,
                level,
                size,
                static_link,
                false,
                has_labels,
                self.cur_thread,
                sp,
            )
            .map_err(|e| Irq::error(e, n))?;

        let r = (|| -> Exec {
            self.serial_clause(enquiry_serial)?;
            let k = self.pop_int_value(n)?;
            let parts: Vec<NodeId> = self
                .tree
                .children(n)
                .filter(|&c| self.tree.node(c).attr == Attribute::CasePart)
                .collect();
            if k >= 1 && (k as usize) <= parts.len() {
                let unit =
                    self.tree.node(parts[k as usize - 1]).sub.expect("case part wraps a unit");
                return self.evaluate(unit);
            }
            match self.tree.child(n, Attribute::OutPart) {
                Some(out) => {
                    let serial = self.tree.node(out).sub.expect("out part wraps a serial clause");
                    self.run_enclosed(serial)
                }
                None => {
                    let width = self.tree.modes.size(self.tree.node(n).mode);
                    for _ in 0..width {
                        self.push(Value::Empty, n)?;
                    }
                    Ok(())
                }
            }
        })();
        match &r {
            Err(Irq::Jump(j)) if j.frame >= fno => {}
            _ => {
                self.frames.unwind_to(fno);
                self.frames.close();
            }
        }
        r
    }

    /// Conformity case: match the united value's runtime mode against
    /// each specifier.
    pub(crate) fn conformity_case(&mut self, n: NodeId) -> Exec {
        let enquiry = self.tree.child(n, Attribute::EnquiryClause).expect("case keeps its enquiry");
        let enquiry_serial = self.tree.node(enquiry).sub.expect("enquiry wraps a serial clause");

        let table = self.tree.node(n).table;
        let level = self.tree.table(table).level;
        let size = self.tree.table(table).frame_size;
        let has_labels = self.tree.table(table).has_labels;
        let static_link =
            if self.frames.is_empty() { None } else { Some(self.frames.top_number()) };
        let sp = self.sp();
        let fno = self
            .frames
            .open(
                &self.conf,
                n,
                table,
                level,
                size,
                static_link,
                false,
                has_labels,
                self.cur_thread,
                sp,
            )
            .map_err(|e| Irq::error(e, n))?;

        let r = (|| -> Exec {
            self.serial_clause(enquiry_serial)?;
            let (member, slots) = match self.pop() {
                Value::United(m, slots) => (m, slots),
                Value::Empty => {
                    return Err(Irq::error(
                        GenieError::UninitialisedValue { mode: "UNION".into() },
                        n,
                    ))
                }
                other => {
                    return Err(Irq::error(
                        GenieError::Internal(format!("united value expected, found {:?}", other)),
                        n,
                    ))
                }
            };

            for spec in self
                .tree
                .children(n)
                .filter(|&c| self.tree.node(c).attr == Attribute::Specifier)
                .collect::<Vec<_>>()
            {
                let smode = self.tree.node(spec).mode;
                if smode == member || self.tree.modes.union_accepts(smode, member) {
                    let serial =
                        self.tree.node(spec).sub.expect("specifier wraps a serial clause");
                    let part_table = self.tree.node(serial).table;
                    let part_level = self.tree.table(part_table).level;
                    let part_size = self.tree.table(part_table).frame_size;
                    let has_labels = self.tree.table(part_table).has_labels;
                    let sp2 = self.sp();
                    let link = Some(self.frames.top_number());
                    let part_fno = self
                        .frames
                        .open(
                            &self.conf,
                            serial,
                            part_table,
                            part_level,
                            part_size,
                            link,
                            false,
                            has_labels,
                            self.cur_thread,
                            sp2,
                        )
                        .map_err(|e| Irq::error(e, n))?;
                    // The declared identifier binds the member value.
                    if let Some(tag_ref) = self.tree.node(spec).tag {
                        let offset = self.tree.tag(tag_ref).offset;
                        let f = self.frames.frame_mut(part_fno);
                        f.slots[offset..offset + slots.len()].clone_from_slice(&slots);
                    }
                    let r = self.serial_clause(serial);
                    match &r {
                        Err(Irq::Jump(j)) if j.frame >= part_fno => {}
                        _ => {
                            self.frames.unwind_to(part_fno);
                            self.frames.close();
                        }
                    }
                    return r;
                }
            }

            match self.tree.child(n, Attribute::OutPart) {
                Some(out) => {
                    let serial = self.tree.node(out).sub.expect("out part wraps a serial clause");
                    self.run_enclosed(serial)
                }
                None => Err(Irq::error(GenieError::ConformityMismatch, n)),
            }
        })();
        match &r {
            Err(Irq::Jump(j)) if j.frame >= fno => {}
            _ => {
                self.frames.unwind_to(fno);
                self.frames.close();
            }
        }
        r
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    /// FOR/FROM/BY/TO|DOWNTO/WHILE/DO/UNTIL. The loop parts are parsed
    /// into integers once; the body frame is opened once and cleared and
    /// reinitialised per iteration. The counter is maintained only when
    /// FOR or TO is present, and counter overflow is a runtime error.
    pub(crate) fn loop_clause(&mut self, n: NodeId) -> Exec {
        let table = self.tree.node(n).table;
        let level = self.tree.table(table).level;
        let size = self.tree.table(table).frame_size;
        let has_labels = self.tree.table(table).has_labels;
        let static_link =
            if self.frames.is_empty() { None } else { Some(self.frames.top_number()) };
        let sp = self.sp();
        let fno = self
            .frames
            .open(
                &self.conf,
                n,
                table,
                level,
                size,
                static_link,
                false,
                has_labels,
                self.cur_thread,
                sp,
            )
            .map_err(|e| Irq::error(e, n))?;

        let r = self.loop_body(n, fno);
        match &r {
            Err(Irq::Jump(j)) if j.frame >= fno => {}
            _ => {
                self.frames.unwind_to(fno);
                self.frames.close();
            }
        }
        r
    }

    fn loop_body(&mut self, n: NodeId, loop_fno: usize) -> Exec {
        let for_tag = self.tree.child(n, Attribute::ForPart).map(|p| {
            let def = self.tree.node(p).sub.expect("FOR part declares its counter");
            self.tree.node(def).tag.expect("counter has a tag")
        });
        let downto = self.tree.child(n, Attribute::DowntoPart).is_some();

        let from = match self.tree.child(n, Attribute::FromPart) {
            Some(p) => {
                let unit = self.tree.node(p).sub.expect("FROM part wraps a unit");
                self.evaluate(unit)?;
                self.pop_int_value(n)?
            }
            None => 1,
        };
        let by = match self.tree.child(n, Attribute::ByPart) {
            Some(p) => {
                let unit = self.tree.node(p).sub.expect("BY part wraps a unit");
                self.evaluate(unit)?;
                self.pop_int_value(n)?
            }
            None => 1,
        };
        let to = match self
            .tree
            .child(n, Attribute::ToPart)
            .or_else(|| self.tree.child(n, Attribute::DowntoPart))
        {
            Some(p) => {
                let unit = self.tree.node(p).sub.expect("TO part wraps a unit");
                self.evaluate(unit)?;
                Some(self.pop_int_value(n)?)
            }
            None => None,
        };

        let while_serial = self
            .tree
            .child(n, Attribute::WhilePart)
            .map(|p| self.tree.node(p).sub.expect("WHILE part wraps a serial clause"));
        let until_serial = self
            .tree
            .child(n, Attribute::UntilPart)
            .map(|p| self.tree.node(p).sub.expect("UNTIL part wraps a serial clause"));
        let do_serial = self
            .tree
            .child(n, Attribute::DoPart)
            .map(|p| self.tree.node(p).sub.expect("DO part wraps a serial clause"))
            .expect("loop keeps its DO part");

        // Counter is maintained only when FOR or TO is present.
        let counted = for_tag.is_some() || to.is_some();

        // One body frame reused across iterations.
        let body_table = self.tree.node(do_serial).table;
        let body_level = self.tree.table(body_table).level;
        let body_size = self.tree.table(body_table).frame_size;
        let body_labels = self.tree.table(body_table).has_labels;
        let sp = self.sp();
        let body_fno = self
            .frames
            .open(
                &self.conf,
                do_serial,
                body_table,
                body_level,
                body_size,
                Some(loop_fno),
                false,
                body_labels,
                self.cur_thread,
                sp,
            )
            .map_err(|e| Irq::error(e, n))?;

        let mut counter = from;
        let result = 'iterate: loop {
            if let Some(limit) = to {
                let past = if downto { counter < limit } else { counter > limit };
                if past {
                    break 'iterate Ok(());
                }
            }
            if let Some(tag_ref) = for_tag {
                let offset = self.tree.tag(tag_ref).offset;
                self.frames.frame_mut(loop_fno).slots[offset] = Value::Int(counter);
            }

            // Clear and reinitialise the body frame.
            for slot in self.frames.frame_mut(body_fno).slots.iter_mut() {
                *slot = Value::Empty;
            }

            if let Some(ws) = while_serial {
                match self.serial_clause(ws) {
                    Ok(()) => {}
                    Err(e) => break 'iterate Err(e),
                }
                match self.pop_bool_value(n) {
                    Ok(true) => {}
                    Ok(false) => break 'iterate Ok(()),
                    Err(e) => break 'iterate Err(e),
                }
            }

            match self.serial_clause(do_serial) {
                Ok(()) => {}
                Err(Irq::Jump(j)) if j.frame == body_fno => {
                    // Serial clauses catch their own jumps; anything
                    // escaping here targets an outer frame.
                    break 'iterate Err(Irq::Jump(j));
                }
                Err(e) => break 'iterate Err(e),
            }

            if let Some(us) = until_serial {
                match self.serial_clause(us) {
                    Ok(()) => {}
                    Err(e) => break 'iterate Err(e),
                }
                match self.pop_bool_value(n) {
                    Ok(true) => break 'iterate Ok(()),
                    Ok(false) => {}
                    Err(e) => break 'iterate Err(e),
                }
            }

            if counted {
                let step = if downto { -by } else { by };
                counter += step;
                if !(MIN_INT..=MAX_INT).contains(&counter) {
                    break 'iterate Err(Irq::error(GenieError::LoopCounterOverflow, n));
                }
            }
            self.maybe_collect();
        };

        match &result {
            Err(Irq::Jump(j)) if j.frame >= body_fno => {}
            _ => {
                self.frames.unwind_to(body_fno);
                self.frames.close();
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Collateral clauses (displays)
    // -----------------------------------------------------------------------

    pub(crate) fn row_display(&mut self, n: NodeId) -> Exec {
        let mode = self.tree.node(n).mode;
        let units: Vec<NodeId> = self.tree.children(n).collect();

        match self.tree.modes.def(mode).clone() {
            ModeDef::Struct { .. } => {
                // Structure display: fields evaluate onto contiguous slots.
                for u in units {
                    self.evaluate(u)?;
                }
                Ok(())
            }
            ModeDef::Row { of, dims, .. } => {
                if dims == 1 {
                    let elem_size = self.tree.modes.size(of).max(1);
                    for u in &units {
                        self.evaluate(*u)?;
                    }
                    let slots = self.pop_slots(units.len() * elem_size);
                    let desc =
                        crate::stowed::make_row(&mut self.heap, &self.tree.modes, of, units.len(), &slots)
                            .map_err(|e| Irq::error(e, n))?;
                    self.push(Value::Row(Box::new(desc)), n)
                } else {
                    let mut rows = Vec::with_capacity(units.len());
                    for u in &units {
                        self.evaluate(*u)?;
                        match self.pop() {
                            Value::Row(d) => rows.push(*d),
                            other => {
                                return Err(Irq::error(
                                    GenieError::Internal(format!(
                                        "row expected in display, found {:?}",
                                        other
                                    )),
                                    n,
                                ))
                            }
                        }
                    }
                    let desc = crate::stowed::make_rowrow(&mut self.heap, &self.tree.modes, &rows)
                        .map_err(|e| Irq::error(e, n))?;
                    self.push(Value::Row(Box::new(desc)), n)
                }
            }
            other => Err(Irq::error(
                GenieError::Internal(format!("display of non-stowed mode {:?}", other)),
                n,
            )),
        }
    }
}

/// Sequence worklists survive re-execution: a serial clause threaded
/// once keeps SEQUENCE and, for one-unit clauses, OPTIMAL. Exposed for
/// the code generator's eligibility walk.
pub fn is_optimal(genie: &Genie, serial: NodeId) -> bool {
    genie.info.status(serial).contains(Status::OPTIMAL)
}

/// Install-time helper shared with the code generator: the PROP a node
/// currently owns, for tests and promotion decisions.
pub fn current_prop(genie: &Genie, n: NodeId) -> Prop {
    genie.info.prop(n).clone()
}
