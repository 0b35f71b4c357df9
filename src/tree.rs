/// Annotated syntax tree, tag tables and the builder interface through
/// which the front-end collaborator hands programs to the interpreter.
///
/// Nodes are immutable once the tree is built. Everything the interpreter
/// mutates per node — dispatch cache, status bits, sequence links, cached
/// constants, compile names — lives in side tables owned by the
/// interpreter context and indexed by `NodeId`.

use bitflags::bitflags;

use crate::mode::{ModeId, ModeTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    // Program structure.
    ParticularProgram,
    SerialClause,
    ClosedClause,
    CollateralClause,
    ConditionalClause,
    IntegerCaseClause,
    ConformityClause,
    LoopClause,
    EnquiryClause,
    ThenPart,
    ElsePart,
    CasePart,
    Specifier,
    OutPart,
    ForPart,
    FromPart,
    ByPart,
    ToPart,
    DowntoPart,
    WhilePart,
    UntilPart,
    DoPart,
    Label,
    // Declarations.
    IdentityDeclaration,
    VariableDeclaration,
    ProcedureDeclaration,
    OperatorDeclaration,
    ModeDeclaration,
    PriorityDeclaration,
    DefiningIdentifier,
    LocGenerator,
    HeapGenerator,
    BoundPair,
    // Units.
    Denotation,
    Identifier,
    MonadicFormula,
    Formula,
    Call,
    Slice,
    Trimmer,
    TrimLower,
    TrimUpper,
    TrimAt,
    Selection,
    Assignation,
    IdentityRelation,
    Cast,
    Skip,
    Nihil,
    Jump,
    Assertion,
    CodeClause,
    RoutineText,
    AndFunction,
    OrFunction,
    // Coercions inserted by the front-end.
    Voiding,
    Uniting,
    Widening,
    Rowing,
    Dereferencing,
    Deproceduring,
}

impl Attribute {
    pub fn is_coercion(self) -> bool {
        matches!(
            self,
            Attribute::Voiding
                | Attribute::Uniting
                | Attribute::Widening
                | Attribute::Rowing
                | Attribute::Dereferencing
                | Attribute::Deproceduring
        )
    }
}

// ---------------------------------------------------------------------------
// Node status
// ---------------------------------------------------------------------------

bitflags! {
    /// Mutable per-node status, kept in a side table in the interpreter
    /// context. The breakpoint group mirrors the monitor entry conditions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u32 {
        const BREAKPOINT           = 1 << 0;
        const BREAKPOINT_TEMPORARY = 1 << 1;
        const BREAKPOINT_WATCH     = 1 << 2;
        const BREAKPOINT_INTERRUPT = 1 << 3;
        const BREAKPOINT_ERROR     = 1 << 4;
        const BREAKPOINT_TRACE     = 1 << 5;
        /// Sequence worklist built for this clause.
        const SEQUENCE             = 1 << 6;
        /// Worklist has exactly one entry.
        const OPTIMAL              = 1 << 7;
        /// Side-effect-free, frame-independent evaluation; bytes cached.
        const CONSTANT             = 1 << 8;
        const ASSERT               = 1 << 9;
        const SKIP                 = 1 << 10;
        const INIT                 = 1 << 11;
        /// The monitor may stop here (unit boundaries).
        const INTERRUPTIBLE        = 1 << 12;
    }
}

impl Status {
    pub const BREAK_MASK: Status = Status::BREAKPOINT
        .union(Status::BREAKPOINT_TEMPORARY)
        .union(Status::BREAKPOINT_WATCH)
        .union(Status::BREAKPOINT_INTERRUPT)
        .union(Status::BREAKPOINT_ERROR)
        .union(Status::BREAKPOINT_TRACE);
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagRef {
    pub table: u32,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Identifier,
    Operator,
    Label,
    Indicant,
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub name: String,
    pub kind: TagKind,
    pub mode: ModeId,
    /// Slot offset inside the owning frame.
    pub offset: usize,
    /// Lexical level of the owning table.
    pub level: u32,
    /// Body node for routines and labelled units.
    pub body: Option<NodeId>,
    pub constant: bool,
    pub proc_decl: bool,
    /// Standard-environ table index when this tag names a built-in.
    pub stand: Option<u32>,
}

#[derive(Debug)]
pub struct TagTable {
    pub id: u32,
    pub parent: Option<u32>,
    pub level: u32,
    pub tags: Vec<Tag>,
    /// Slots a frame for this table must reserve.
    pub frame_size: usize,
    /// Table introduces labels, so its frame captures a continuation.
    pub has_labels: bool,
}

impl TagTable {
    pub fn lookup(&self, name: &str, kind: TagKind) -> Option<u32> {
        self.tags
            .iter()
            .position(|t| t.kind == kind && t.name == name)
            .map(|i| i as u32)
    }
}

// ---------------------------------------------------------------------------
// Nodes and the tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Node {
    pub attr: Attribute,
    pub symbol: String,
    pub mode: ModeId,
    pub table: u32,
    pub line: u32,
    pub sub: Option<NodeId>,
    pub next: Option<NodeId>,
    pub parent: Option<NodeId>,
    /// Resolved tag for identifiers, operators and labels.
    pub tag: Option<TagRef>,
}

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    pub tables: Vec<TagTable>,
    pub modes: ModeTable,
    /// Retained source lines for the monitor `list`/`xref` commands.
    pub source: Vec<String>,
    pub root: NodeId,
}

impl Tree {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.idx()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn table(&self, id: u32) -> &TagTable {
        &self.tables[id as usize]
    }

    pub fn tag(&self, r: TagRef) -> &Tag {
        &self.tables[r.table as usize].tags[r.index as usize]
    }

    /// Iterate a node's children through the sub/next chain.
    pub fn children(&self, id: NodeId) -> Children<'_> {
        Children { tree: self, cur: self.node(id).sub }
    }

    /// First child with the given attribute, if any.
    pub fn child(&self, id: NodeId, attr: Attribute) -> Option<NodeId> {
        self.children(id).find(|&c| self.node(c).attr == attr)
    }

    /// Is `table` equal to or statically enclosed by `ancestor`?
    pub fn table_within(&self, table: u32, ancestor: u32) -> bool {
        let mut cur = Some(table);
        while let Some(t) = cur {
            if t == ancestor {
                return true;
            }
            cur = self.tables[t as usize].parent;
        }
        false
    }

    /// Search the static table chain for a tag of the given kind.
    pub fn find_tag(&self, mut table: u32, name: &str, kind: TagKind) -> Option<TagRef> {
        loop {
            let t = &self.tables[table as usize];
            if let Some(index) = t.lookup(name, kind) {
                return Some(TagRef { table, index });
            }
            match t.parent {
                Some(p) => table = p,
                None => return None,
            }
        }
    }
}

pub struct Children<'t> {
    tree: &'t Tree,
    cur: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cur?;
        self.cur = self.tree.node(id).next;
        Some(id)
    }
}

// ---------------------------------------------------------------------------
// Builder — the input interface the front-end collaborator drives
// ---------------------------------------------------------------------------

pub struct TreeBuilder {
    nodes: Vec<Node>,
    tables: Vec<TagTable>,
    pub modes: ModeTable,
    source: Vec<String>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        TreeBuilder {
            nodes: Vec::new(),
            tables: Vec::new(),
            modes: ModeTable::new(),
            source: Vec::new(),
        }
    }

    pub fn set_source(&mut self, text: &str) {
        self.source = text.lines().map(str::to_owned).collect();
    }

    pub fn new_table(&mut self, parent: Option<u32>) -> u32 {
        let id = self.tables.len() as u32;
        let level = parent.map_or(0, |p| self.tables[p as usize].level + 1);
        self.tables.push(TagTable {
            id,
            parent,
            level,
            tags: Vec::new(),
            frame_size: 0,
            has_labels: false,
        });
        id
    }

    pub fn table_mut(&mut self, id: u32) -> &mut TagTable {
        &mut self.tables[id as usize]
    }

    /// Declare a tag, reserving frame slots for its mode.
    pub fn add_tag(&mut self, table: u32, name: &str, kind: TagKind, mode: ModeId) -> TagRef {
        let size = self.modes.size(mode);
        let t = &mut self.tables[table as usize];
        let offset = t.frame_size;
        t.frame_size += size;
        if kind == TagKind::Label {
            t.has_labels = true;
        }
        let index = t.tags.len() as u32;
        t.tags.push(Tag {
            name: name.to_owned(),
            kind,
            mode,
            offset,
            level: t.level,
            body: None,
            constant: false,
            proc_decl: false,
            stand: None,
        });
        TagRef { table, index }
    }

    pub fn tag_mut(&mut self, r: TagRef) -> &mut Tag {
        &mut self.tables[r.table as usize].tags[r.index as usize]
    }

    pub fn tag(&self, r: TagRef) -> &Tag {
        &self.tables[r.table as usize].tags[r.index as usize]
    }

    /// Search the static table chain, as applied occurrences resolve.
    pub fn find_tag(&self, mut table: u32, name: &str, kind: TagKind) -> Option<TagRef> {
        loop {
            let t = &self.tables[table as usize];
            if let Some(index) = t.lookup(name, kind) {
                return Some(TagRef { table, index });
            }
            match t.parent {
                Some(p) => table = p,
                None => return None,
            }
        }
    }

    pub fn add_node(
        &mut self,
        attr: Attribute,
        symbol: impl Into<String>,
        mode: ModeId,
        table: u32,
        line: u32,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            attr,
            symbol: symbol.into(),
            mode,
            table,
            line,
            sub: None,
            next: None,
            parent: None,
            tag: None,
        });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.idx()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.idx()]
    }

    /// Attach `children` as the sub/next chain of `parent`.
    pub fn adopt(&mut self, parent: NodeId, children: &[NodeId]) {
        self.nodes[parent.idx()].sub = children.first().copied();
        for pair in children.windows(2) {
            self.nodes[pair[0].idx()].next = Some(pair[1]);
        }
        for &c in children {
            self.nodes[c.idx()].parent = Some(parent);
        }
    }

    pub fn finish(self, root: NodeId) -> Tree {
        Tree {
            nodes: self.nodes,
            tables: self.tables,
            modes: self.modes,
            source: self.source,
            root,
        }
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A placeholder node id for contexts built before any node exists.
pub fn no_node() -> NodeId {
    NodeId(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{M_INT, M_REAL, M_VOID};

    #[test]
    fn adopt_builds_sub_next_chains() {
        let mut b = TreeBuilder::new();
        let t = b.new_table(None);
        let p = b.add_node(Attribute::SerialClause, "", M_VOID, t, 1);
        let a = b.add_node(Attribute::Skip, "SKIP", M_INT, t, 1);
        let c = b.add_node(Attribute::Skip, "SKIP", M_REAL, t, 1);
        b.adopt(p, &[a, c]);
        let tree = b.finish(p);
        let kids: Vec<NodeId> = tree.children(p).collect();
        assert_eq!(kids, vec![a, c]);
        assert_eq!(tree.node(a).parent, Some(p));
    }

    #[test]
    fn tag_offsets_accumulate_by_mode_size() {
        let mut b = TreeBuilder::new();
        let t = b.new_table(None);
        let pair = b.modes.intern(crate::mode::ModeDef::Struct {
            fields: vec![("re".into(), M_REAL), ("im".into(), M_REAL)],
        });
        let x = b.add_tag(t, "x", TagKind::Identifier, pair);
        let y = b.add_tag(t, "y", TagKind::Identifier, M_INT);
        let tree = b.finish(no_node());
        assert_eq!(tree.tag(x).offset, 0);
        assert_eq!(tree.tag(y).offset, 2);
        assert_eq!(tree.table(t).frame_size, 3);
    }

    #[test]
    fn label_tags_mark_the_table_jump_capable() {
        let mut b = TreeBuilder::new();
        let t = b.new_table(None);
        b.add_tag(t, "again", TagKind::Label, M_VOID);
        assert!(b.table_mut(t).has_labels);
    }
}
