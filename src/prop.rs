/// Per-node dispatch cache ("PROP") and the genie-info slab.
///
/// A PROP is a tagged variant of specialised evaluators plus the generic
/// fallback. First execution of a node installs the most specialised
/// evaluator the interpreter can determine; promotion is write-once per
/// node, and only the code generator may overwrite an installed PROP —
/// with a compiled evaluation thread. Cached dispatch is semantically
/// equivalent to generic evaluation of the same node.

use crate::tree::{NodeId, Status};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Prop {
    /// Never visited.
    Unset,
    /// Generic recursive evaluation.
    Generic,
    /// Identifier of a standard-environ procedure in a value position:
    /// push the procedure value (or the niladic constant) directly.
    StandCall(u32),
    /// Call whose primary names a standard-environ procedure: evaluate
    /// the arguments and invoke the entry through the function table.
    StandProcCall(u32),
    /// Node carries CONSTANT status: copy the cached slots.
    Constant,
    /// Identifier in the current frame: frame-offset load.
    FrameLoad { level: u32, offset: usize, size: usize },
    /// DEREF of an identifier in a frame: offset load plus dereference.
    FrameDeref { level: u32, offset: usize },
    /// Slice whose indexers are all basic: bounds-checked direct indexing.
    SliceBasic,
    /// Selection through a REF: offset bump on the name.
    SelectRef { offset: usize },
    /// Dyadic formula with a standard-environ operator: inline call.
    DyadicStd { index: u32 },
    /// Assignation whose source is CONSTANT: copy cached slots into the
    /// target.
    AssignConst,
    /// Voiding of a specialised evaluator: same, then discard.
    Voided(Box<Prop>),
    /// Compiled evaluation thread in the plugin registry.
    Compiled(u32),
}

impl Prop {
    pub fn is_unset(&self) -> bool {
        matches!(self, Prop::Unset)
    }
}

#[derive(Debug, Default, Clone)]
pub struct PropStats {
    pub installs: u64,
    pub specialised_hits: u64,
    pub compiled_promotions: u64,
}

// ---------------------------------------------------------------------------
// Genie info
// ---------------------------------------------------------------------------

/// The mutable per-node slab the interpreter populates: cached evaluator,
/// constant blob, compile name, argument size, level and frame offset.
#[derive(Debug, Clone)]
pub struct GInfo {
    pub prop: Prop,
    pub status: Status,
    /// Sequence link threading consecutive units of a serial clause.
    pub seq: Option<NodeId>,
    pub constant: Option<Box<[Value]>>,
    pub compile_name: Option<String>,
    pub argsize: usize,
    pub level: u32,
    pub offset: usize,
}

impl Default for GInfo {
    fn default() -> Self {
        GInfo {
            prop: Prop::Unset,
            status: Status::empty(),
            seq: None,
            constant: None,
            compile_name: None,
            argsize: 0,
            level: 0,
            offset: 0,
        }
    }
}

#[derive(Debug)]
pub struct GInfoTable {
    infos: Vec<GInfo>,
    /// Per-tag-table JUMP_TO slot inspected when a serial clause restarts
    /// under a jump.
    pub jump_to: Vec<Option<NodeId>>,
    pub stats: PropStats,
}

impl GInfoTable {
    pub fn new(nodes: usize, tables: usize) -> Self {
        GInfoTable {
            infos: vec![GInfo::default(); nodes],
            jump_to: vec![None; tables],
            stats: PropStats::default(),
        }
    }

    pub fn info(&self, n: NodeId) -> &GInfo {
        &self.infos[n.idx()]
    }

    pub fn info_mut(&mut self, n: NodeId) -> &mut GInfo {
        &mut self.infos[n.idx()]
    }

    pub fn prop(&self, n: NodeId) -> &Prop {
        &self.infos[n.idx()].prop
    }

    /// Install a PROP. First install wins; afterwards only promotion to a
    /// compiled thread replaces the entry.
    pub fn install(&mut self, n: NodeId, prop: Prop) {
        let slot = &mut self.infos[n.idx()].prop;
        match (&slot, &prop) {
            (Prop::Unset, _) => {
                self.stats.installs += 1;
                *slot = prop;
            }
            (_, Prop::Compiled(_)) => {
                self.stats.compiled_promotions += 1;
                *slot = prop;
            }
            _ => {}
        }
    }

    pub fn status(&self, n: NodeId) -> Status {
        self.infos[n.idx()].status
    }

    pub fn set_status(&mut self, n: NodeId, flags: Status) {
        self.infos[n.idx()].status.insert(flags);
    }

    pub fn clear_status(&mut self, n: NodeId, flags: Status) {
        self.infos[n.idx()].status.remove(flags);
    }

    pub fn node_count(&self) -> usize {
        self.infos.len()
    }

    /// Thread `units` into a sequence worklist and flag the clause.
    /// A single-entry worklist earns OPTIMAL.
    pub fn thread_sequence(&mut self, clause: NodeId, units: &[NodeId]) {
        for pair in units.windows(2) {
            self.infos[pair[0].idx()].seq = Some(pair[1]);
        }
        if let Some(&last) = units.last() {
            self.infos[last.idx()].seq = None;
        }
        self.set_status(clause, Status::SEQUENCE);
        if units.len() == 1 {
            self.set_status(clause, Status::OPTIMAL);
        }
    }

    /// Walk an already-threaded worklist starting at `first`.
    pub fn sequence_from(&self, first: NodeId) -> SeqIter<'_> {
        SeqIter { table: self, cur: Some(first) }
    }
}

pub struct SeqIter<'a> {
    table: &'a GInfoTable,
    cur: Option<NodeId>,
}

impl Iterator for SeqIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cur?;
        self.cur = self.table.infos[id.idx()].seq;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_install_wins() {
        let mut t = GInfoTable::new(4, 1);
        let n = NodeId(2);
        t.install(n, Prop::FrameLoad { level: 0, offset: 1, size: 1 });
        t.install(n, Prop::Generic);
        assert_eq!(*t.prop(n), Prop::FrameLoad { level: 0, offset: 1, size: 1 });
    }

    #[test]
    fn only_compiled_threads_replace_an_installed_prop() {
        let mut t = GInfoTable::new(4, 1);
        let n = NodeId(0);
        t.install(n, Prop::Generic);
        t.install(n, Prop::Compiled(7));
        assert_eq!(*t.prop(n), Prop::Compiled(7));
        assert_eq!(t.stats.compiled_promotions, 1);
    }

    #[test]
    fn sequence_threading_sets_flags_and_links() {
        let mut t = GInfoTable::new(8, 1);
        let clause = NodeId(0);
        let units = [NodeId(1), NodeId(2), NodeId(3)];
        t.thread_sequence(clause, &units);
        assert!(t.status(clause).contains(Status::SEQUENCE));
        assert!(!t.status(clause).contains(Status::OPTIMAL));
        let walked: Vec<NodeId> = t.sequence_from(NodeId(1)).collect();
        assert_eq!(walked, units);
    }

    #[test]
    fn single_unit_worklists_are_optimal() {
        let mut t = GInfoTable::new(4, 1);
        t.thread_sequence(NodeId(0), &[NodeId(1)]);
        assert!(t.status(NodeId(0)).contains(Status::OPTIMAL));
    }
}
