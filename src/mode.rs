/// Mode (type) table.
///
/// Modes arrive fully resolved from the front-end and are interned here;
/// equality of `ModeId`s is mode equivalence. Each mode carries a slot
/// size (the number of `Value` slots a value of the mode occupies), a
/// digit count for the multiprecision variants, and a one-character short
/// id used as a dispatch key by the standard-environ tables and the code
/// generator's symbol names.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModeId(pub u32);

impl ModeId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

// Well-known modes, interned ahead of any program mode in `ModeTable::new`.
pub const M_VOID: ModeId = ModeId(0);
pub const M_INT: ModeId = ModeId(1);
pub const M_REAL: ModeId = ModeId(2);
pub const M_BOOL: ModeId = ModeId(3);
pub const M_CHAR: ModeId = ModeId(4);
pub const M_BITS: ModeId = ModeId(5);
pub const M_LONG_INT: ModeId = ModeId(6);
pub const M_LONG_REAL: ModeId = ModeId(7);
pub const M_COMPLEX: ModeId = ModeId(8);
pub const M_BYTES: ModeId = ModeId(9);
pub const M_FORMAT: ModeId = ModeId(10);
pub const M_FILE: ModeId = ModeId(11);
pub const M_CHANNEL: ModeId = ModeId(12);
pub const M_SOUND: ModeId = ModeId(13);
pub const M_ROW_CHAR: ModeId = ModeId(14);
pub const M_ROW_BOOL: ModeId = ModeId(15);
pub const M_REF_INT: ModeId = ModeId(16);
pub const M_REF_REAL: ModeId = ModeId(17);
pub const M_REF_BOOL: ModeId = ModeId(18);
pub const M_REF_CHAR: ModeId = ModeId(19);
pub const M_ROW_INT: ModeId = ModeId(20);

/// INT is 32-bit; LONG INT widens through i128.
pub const MAX_INT: i64 = i32::MAX as i64;
pub const MIN_INT: i64 = i32::MIN as i64;
/// Columns of the default INT transput: sign + ten digits.
pub const INT_WIDTH: usize = 11;
/// Guard for `span * (upper - lower + 1)` in descriptors.
pub const MAX_ROW_ELEMS: i64 = 1 << 40;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModeDef {
    Int,
    Real,
    Bool,
    Char,
    Bits,
    LongInt,
    LongReal,
    Complex,
    Void,
    Bytes,
    Format,
    File,
    Channel,
    Sound,
    Ref(ModeId),
    Proc { params: Vec<ModeId>, yields: ModeId },
    Row { of: ModeId, dims: u32, flex: bool },
    Struct { fields: Vec<(String, ModeId)> },
    Union { members: Vec<ModeId> },
}

pub struct ModeTable {
    defs: Vec<ModeDef>,
    interned: HashMap<ModeDef, ModeId>,
}

impl ModeTable {
    pub fn new() -> Self {
        let mut t = ModeTable { defs: Vec::new(), interned: HashMap::new() };
        // Order must match the M_* constants above.
        for def in [
            ModeDef::Void,
            ModeDef::Int,
            ModeDef::Real,
            ModeDef::Bool,
            ModeDef::Char,
            ModeDef::Bits,
            ModeDef::LongInt,
            ModeDef::LongReal,
            ModeDef::Complex,
            ModeDef::Bytes,
            ModeDef::Format,
            ModeDef::File,
            ModeDef::Channel,
            ModeDef::Sound,
            ModeDef::Row { of: M_CHAR, dims: 1, flex: true },
            ModeDef::Row { of: M_BOOL, dims: 1, flex: false },
            ModeDef::Ref(M_INT),
            ModeDef::Ref(M_REAL),
            ModeDef::Ref(M_BOOL),
            ModeDef::Ref(M_CHAR),
            ModeDef::Row { of: M_INT, dims: 1, flex: false },
        ] {
            t.intern(def);
        }
        t
    }

    pub fn intern(&mut self, def: ModeDef) -> ModeId {
        if let Some(&id) = self.interned.get(&def) {
            return id;
        }
        let id = ModeId(self.defs.len() as u32);
        self.defs.push(def.clone());
        self.interned.insert(def, id);
        id
    }

    pub fn def(&self, id: ModeId) -> &ModeDef {
        &self.defs[id.idx()]
    }

    pub fn reference(&mut self, of: ModeId) -> ModeId {
        self.intern(ModeDef::Ref(of))
    }

    pub fn row(&mut self, of: ModeId, dims: u32, flex: bool) -> ModeId {
        self.intern(ModeDef::Row { of, dims, flex })
    }

    pub fn procedure(&mut self, params: Vec<ModeId>, yields: ModeId) -> ModeId {
        self.intern(ModeDef::Proc { params, yields })
    }

    /// Slot size of a value of this mode. Structs flatten into consecutive
    /// slots; everything else occupies one.
    pub fn size(&self, id: ModeId) -> usize {
        match self.def(id) {
            ModeDef::Void => 0,
            ModeDef::Struct { fields } => {
                fields.iter().map(|(_, m)| self.size(*m)).sum::<usize>().max(1)
            }
            _ => 1,
        }
    }

    /// Multiprecision digit count; zero for single-length modes.
    pub fn digits(&self, id: ModeId) -> u32 {
        match self.def(id) {
            ModeDef::LongInt | ModeDef::LongReal => 35,
            _ => 0,
        }
    }

    /// Slot offset and mode of a named field inside a STRUCT.
    pub fn field(&self, id: ModeId, name: &str) -> Option<(usize, ModeId)> {
        if let ModeDef::Struct { fields } = self.def(id) {
            let mut offset = 0;
            for (fname, fmode) in fields {
                if fname == name {
                    return Some((offset, *fmode));
                }
                offset += self.size(*fmode);
            }
        }
        None
    }

    pub fn deref(&self, id: ModeId) -> Option<ModeId> {
        match self.def(id) {
            ModeDef::Ref(m) => Some(*m),
            _ => None,
        }
    }

    pub fn row_of(&self, id: ModeId) -> Option<(ModeId, u32, bool)> {
        match self.def(id) {
            ModeDef::Row { of, dims, flex } => Some((*of, *dims, *flex)),
            _ => None,
        }
    }

    pub fn is_primitive(&self, id: ModeId) -> bool {
        matches!(
            self.def(id),
            ModeDef::Int
                | ModeDef::Real
                | ModeDef::Bool
                | ModeDef::Char
                | ModeDef::Bits
                | ModeDef::LongInt
                | ModeDef::LongReal
                | ModeDef::Complex
                | ModeDef::Bytes
        )
    }

    pub fn is_stowed(&self, id: ModeId) -> bool {
        matches!(
            self.def(id),
            ModeDef::Row { .. } | ModeDef::Struct { .. } | ModeDef::Union { .. } | ModeDef::Sound
        )
    }

    pub fn union_accepts(&self, union: ModeId, member: ModeId) -> bool {
        match self.def(union) {
            ModeDef::Union { members } => members.contains(&member),
            _ => false,
        }
    }

    /// One-character dispatch key, composed into `genie_<moid>_<kind>_…`
    /// symbol names and standard-environ lookup strings.
    pub fn short_id(&self, id: ModeId) -> char {
        match self.def(id) {
            ModeDef::Void => 'v',
            ModeDef::Int => 'i',
            ModeDef::Real => 'r',
            ModeDef::Bool => 'b',
            ModeDef::Char => 'c',
            ModeDef::Bits => 'w',
            ModeDef::LongInt => 'l',
            ModeDef::LongReal => 'm',
            ModeDef::Complex => 'z',
            ModeDef::Bytes => 'y',
            ModeDef::Format => 'f',
            ModeDef::File => 'F',
            ModeDef::Channel => 'C',
            ModeDef::Sound => 'S',
            ModeDef::Ref(_) => 'n',
            ModeDef::Proc { .. } => 'p',
            ModeDef::Row { .. } => 'o',
            ModeDef::Struct { .. } => 's',
            ModeDef::Union { .. } => 'u',
        }
    }

    /// Human-readable spelling, used in diagnostics.
    pub fn spell(&self, id: ModeId) -> String {
        match self.def(id) {
            ModeDef::Void => "VOID".into(),
            ModeDef::Int => "INT".into(),
            ModeDef::Real => "REAL".into(),
            ModeDef::Bool => "BOOL".into(),
            ModeDef::Char => "CHAR".into(),
            ModeDef::Bits => "BITS".into(),
            ModeDef::LongInt => "LONG INT".into(),
            ModeDef::LongReal => "LONG REAL".into(),
            ModeDef::Complex => "COMPL".into(),
            ModeDef::Bytes => "BYTES".into(),
            ModeDef::Format => "FORMAT".into(),
            ModeDef::File => "FILE".into(),
            ModeDef::Channel => "CHANNEL".into(),
            ModeDef::Sound => "SOUND".into(),
            ModeDef::Ref(m) => format!("REF {}", self.spell(*m)),
            ModeDef::Proc { params, yields } => {
                if params.is_empty() {
                    format!("PROC {}", self.spell(*yields))
                } else {
                    let ps: Vec<String> = params.iter().map(|p| self.spell(*p)).collect();
                    format!("PROC ({}) {}", ps.join(", "), self.spell(*yields))
                }
            }
            ModeDef::Row { of, dims, flex } => {
                let commas = ",".repeat(*dims as usize - 1);
                let flex = if *flex { "FLEX " } else { "" };
                format!("{}[{}] {}", flex, commas, self.spell(*of))
            }
            ModeDef::Struct { fields } => {
                let fs: Vec<String> =
                    fields.iter().map(|(n, m)| format!("{} {}", self.spell(*m), n)).collect();
                format!("STRUCT ({})", fs.join(", "))
            }
            ModeDef::Union { members } => {
                let ms: Vec<String> = members.iter().map(|m| self.spell(*m)).collect();
                format!("UNION ({})", ms.join(", "))
            }
        }
    }
}

impl Default for ModeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModeTable({} modes)", self.defs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut t = ModeTable::new();
        let a = t.reference(M_INT);
        let b = t.reference(M_INT);
        assert_eq!(a, b);
        assert_eq!(a, M_REF_INT);
    }

    #[test]
    fn struct_fields_flatten_into_offsets() {
        let mut t = ModeTable::new();
        let pair = t.intern(ModeDef::Struct {
            fields: vec![("re".into(), M_REAL), ("im".into(), M_REAL)],
        });
        assert_eq!(t.size(pair), 2);
        assert_eq!(t.field(pair, "im"), Some((1, M_REAL)));
        let nested = t.intern(ModeDef::Struct {
            fields: vec![("z".into(), pair), ("n".into(), M_INT)],
        });
        assert_eq!(t.size(nested), 3);
        assert_eq!(t.field(nested, "n"), Some((2, M_INT)));
    }

    #[test]
    fn spelling_reads_like_the_language() {
        let mut t = ModeTable::new();
        let r = t.reference(M_REAL);
        assert_eq!(t.spell(r), "REF REAL");
        let row = t.row(M_INT, 2, false);
        assert_eq!(t.spell(row), "[,] INT");
    }
}
