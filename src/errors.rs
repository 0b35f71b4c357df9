/// Runtime error taxonomy and the typed interrupt that carries non-local
/// exits (errors, jumps, termination) up the evaluation stack.
///
/// Severities:
///   Warning     — diagnostic only, evaluation continues
///   MathWarning — precision loss, evaluation continues
///   Runtime     — recoverable only by the monitor
///   ForceQuit   — unconditional termination
///   Rerun       — restart the interpreter on the same job

use thiserror::Error;

use crate::tree::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    MathWarning,
    Runtime,
    ForceQuit,
    Rerun,
}

// ---------------------------------------------------------------------------
// Runtime errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenieError {
    #[error("attempt to use an uninitialised {mode} value")]
    UninitialisedValue { mode: String },

    #[error("attempt to dereference NIL")]
    NilDereference,

    #[error("scope violation: source scope {src_scope} is younger than name scope {dest}")]
    ScopeViolation { src_scope: u32, dest: u32 },

    #[error("attempt to access a value through NIL")]
    AccessThroughNil,

    #[error("index {index} out of bounds [{lower}:{upper}]")]
    IndexOutOfBounds { index: i64, lower: i64, upper: i64 },

    #[error("trimmer [{lower}:{upper}] exceeds row bounds [{row_lower}:{row_upper}]")]
    TrimOutOfBounds { lower: i64, upper: i64, row_lower: i64, row_upper: i64 },

    #[error("row size exceeds the configured maximum")]
    RowTooLarge,

    #[error("negative or malformed bound in row generator")]
    InvalidBound,

    #[error("bounds of source and destination differ")]
    DifferentBounds,

    #[error("cannot take a value from an empty {mode}")]
    EmptyValueFrom { mode: String },

    #[error("united value matches no specifier in conformity clause")]
    ConformityMismatch,

    #[error("invalid cast to {mode}")]
    InvalidCast { mode: String },

    #[error("invalid {mode} denotation '{text}'")]
    InvalidDenotation { mode: String, text: String },

    #[error("integer overflow in {op}")]
    IntegerOverflow { op: &'static str },

    #[error("loop counter overflow")]
    LoopCounterOverflow,

    #[error("integer division by zero")]
    DivisionByZero,

    #[error("math error in {func}")]
    MathError { func: &'static str },

    #[error("precision lost widening to {mode}")]
    PrecisionLoss { mode: String },

    #[error("frame stack overflow")]
    FrameStackOverflow,

    #[error("expression stack overflow")]
    ExpressionStackOverflow,

    #[error("system stack overflow")]
    SystemStackOverflow,

    #[error("heap exhausted")]
    HeapExhausted,

    #[error("jump into a parallel clause of another worker")]
    ParallelJump,

    #[error("jump to a label whose frame has been unwound")]
    DeadContinuation,

    #[error("false assertion")]
    FalseAssertion,

    #[error("CODE clause reached at run time")]
    CodeClause,

    #[error("internal consistency check failed: {0}")]
    Internal(String),

    // Monitor-originated.
    #[error("unknown identifier '{name}'")]
    UnknownIdentifier { name: String },

    #[error("cannot parse expression '{text}'")]
    UnparsableExpression { text: String },

    #[error("breakpoint expression '{text}' does not yield BOOL")]
    InvalidBreakpointExpression { text: String },
}

impl GenieError {
    pub fn severity(&self) -> Severity {
        match self {
            GenieError::PrecisionLoss { .. } | GenieError::MathError { .. } => Severity::MathWarning,
            GenieError::Internal(_) => Severity::ForceQuit,
            _ => Severity::Runtime,
        }
    }

    /// Internal consistency failures are fatal and bypass the monitor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GenieError::Internal(_))
    }
}

// ---------------------------------------------------------------------------
// Typed interrupts
// ---------------------------------------------------------------------------

/// A pending non-local goto, unwinding towards the frame that owns `table`.
#[derive(Debug, Clone, PartialEq)]
pub struct Jump {
    /// Tag table (symbol-table id) defining the target label.
    pub table: u32,
    /// The labelled unit the serial clause must resume at.
    pub unit: NodeId,
    /// Frame number of the catcher, fixed when the jump is raised.
    pub frame: usize,
}

/// Carried through every `Exec` result instead of a platform longjmp.
#[derive(Debug, Clone, PartialEq)]
pub enum Irq {
    /// A runtime error at a node; the top-level handler or the monitor
    /// turns it into a diagnostic.
    Error { error: GenieError, node: NodeId },
    /// Non-local goto in flight; serial clauses test whether they catch it.
    Jump(Jump),
    /// Terminate evaluation with a status. `force` carries FORCE_QUIT.
    Stop { status: i32, force: bool },
    /// Restart the interpreter on the same job (monitor `rerun`).
    Rerun,
}

impl Irq {
    pub fn error(error: GenieError, node: NodeId) -> Self {
        Irq::Error { error, node }
    }
}

pub type Exec<T = ()> = Result<T, Irq>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_follow_the_taxonomy() {
        assert_eq!(GenieError::NilDereference.severity(), Severity::Runtime);
        assert_eq!(
            GenieError::PrecisionLoss { mode: "LONG REAL".into() }.severity(),
            Severity::MathWarning
        );
        assert!(GenieError::Internal("broken chain".into()).is_fatal());
    }
}
