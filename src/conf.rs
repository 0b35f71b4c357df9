/// Runtime configuration.
///
/// Every tunable is a documented property with a default and a category,
/// settable from the CLI. `Conf` is the resolved set carried by the
/// interpreter context.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Category {
    Memory,
    Gc,
    Optimisation,
    Checking,
    Monitor,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub struct PropDef {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
    pub category: Category,
}

pub static ALL_PROPS: &[PropDef] = &[
    PropDef {
        name: "frame-stack",
        default: "65536",
        description: "Frame stack limit in slots. Opening a frame past the limit \
                      raises a frame-stack overflow.",
        category: Category::Memory,
    },
    PropDef {
        name: "expr-stack",
        default: "65536",
        description: "Expression stack limit in slots; argument passing and \
                      intermediate results live here.",
        category: Category::Memory,
    },
    PropDef {
        name: "heap",
        default: "262144",
        description: "Heap limit in slots, reached through handles.",
        category: Category::Memory,
    },
    PropDef {
        name: "overhead",
        default: "4096",
        description: "Reserved storage-overhead margin in slots. Crossing into the \
                      margin raises a soft-overflow diagnostic before hard exhaustion.",
        category: Category::Memory,
    },
    PropDef {
        name: "gc-threshold",
        default: "75",
        description: "Heap utilisation percentage past which a preemptive \
                      collection fires at the next safe point.",
        category: Category::Gc,
    },
    PropDef {
        name: "optimise",
        default: "2",
        description: "Code generator level. 0 restricts to safe denotations, \
                      identifiers and formulas; higher levels engage the full \
                      multi-phase engine over clauses and loops.",
        category: Category::Optimisation,
    },
    PropDef {
        name: "check",
        default: "on",
        description: "Keep initialisation checks in generated evaluation threads.",
        category: Category::Checking,
    },
    PropDef {
        name: "backtrace",
        default: "off",
        description: "Dump the frame stack before exiting on a runtime error.",
        category: Category::Checking,
    },
    PropDef {
        name: "debug",
        default: "off",
        description: "Re-enter the monitor at the failing node instead of exiting.",
        category: Category::Monitor,
    },
    PropDef {
        name: "prompt",
        default: "(a68) ",
        description: "Monitor prompt string; changeable at run time with the \
                      `prompt` command.",
        category: Category::Monitor,
    },
];

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    pub frame_stack_limit: usize,
    pub expr_stack_limit: usize,
    pub heap_limit: usize,
    pub overhead: usize,
    pub gc_threshold_pct: usize,
    pub opt_level: u8,
    pub check_init: bool,
    pub backtrace: bool,
    pub debug: bool,
    pub prompt: String,
    /// Seed for the combined Tausworthe generator; 0 coerces to 1.
    pub seed: Option<u32>,
}

impl Default for Conf {
    fn default() -> Self {
        Conf {
            frame_stack_limit: 65_536,
            expr_stack_limit: 65_536,
            heap_limit: 262_144,
            overhead: 4_096,
            gc_threshold_pct: 75,
            opt_level: 2,
            check_init: true,
            backtrace: false,
            debug: false,
            prompt: "(a68) ".to_string(),
            seed: None,
        }
    }
}

impl Conf {
    /// Slots left before the soft margin of `limit` is crossed.
    pub fn soft_limit(&self, limit: usize) -> usize {
        limit.saturating_sub(self.overhead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_property_list() {
        let c = Conf::default();
        for p in ALL_PROPS {
            match p.name {
                "frame-stack" => assert_eq!(c.frame_stack_limit.to_string(), p.default),
                "heap" => assert_eq!(c.heap_limit.to_string(), p.default),
                "optimise" => assert_eq!(c.opt_level.to_string(), p.default),
                _ => {}
            }
        }
    }

    #[test]
    fn soft_limit_reserves_the_margin() {
        let c = Conf::default();
        assert_eq!(c.soft_limit(10_000), 10_000 - c.overhead);
    }
}
