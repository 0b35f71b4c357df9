/// Diagnostic engine: every runtime and monitor error is routed through
/// one central routine, keyed by severity and a message code, and
/// rendered through miette with the offending source line when a
/// position is known.
///
/// Code taxonomy:
///   A68_1xx — front-end (lexical / syntactic / moding)
///   A68_2xx — value and scope errors
///   A68_3xx — bounds and stowed-object errors
///   A68_4xx — numeric errors
///   A68_5xx — storage exhaustion
///   A68_6xx — control flow and monitor

use std::io::Write;

use colored::Colorize;
use miette::Diagnostic;
use thiserror::Error;

use crate::errors::{GenieError, Severity};
use crate::genie::Genie;
use crate::tree::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Front = 100,
    Uninitialised = 201,
    NilAccess = 202,
    ScopeViolation = 203,
    Bounds = 301,
    DifferentBounds = 302,
    EmptyValue = 303,
    Conformity = 304,
    InvalidDenotation = 305,
    Overflow = 401,
    MathError = 402,
    PrecisionLoss = 403,
    StackOverflow = 501,
    HeapExhausted = 502,
    ParallelJump = 601,
    DeadJump = 602,
    Assertion = 603,
    CodeClause = 604,
    Internal = 605,
    Monitor = 606,
}

impl Code {
    pub fn of(e: &GenieError) -> Code {
        use GenieError::*;
        match e {
            UninitialisedValue { .. } => Code::Uninitialised,
            NilDereference | AccessThroughNil => Code::NilAccess,
            ScopeViolation { .. } => Code::ScopeViolation,
            IndexOutOfBounds { .. } | TrimOutOfBounds { .. } | RowTooLarge | InvalidBound => {
                Code::Bounds
            }
            DifferentBounds => Code::DifferentBounds,
            EmptyValueFrom { .. } => Code::EmptyValue,
            ConformityMismatch | InvalidCast { .. } => Code::Conformity,
            InvalidDenotation { .. } => Code::InvalidDenotation,
            IntegerOverflow { .. } | LoopCounterOverflow | DivisionByZero => Code::Overflow,
            MathError { .. } => Code::MathError,
            PrecisionLoss { .. } => Code::PrecisionLoss,
            FrameStackOverflow | ExpressionStackOverflow | SystemStackOverflow => {
                Code::StackOverflow
            }
            HeapExhausted => Code::HeapExhausted,
            ParallelJump => Code::ParallelJump,
            DeadContinuation => Code::DeadJump,
            FalseAssertion => Code::Assertion,
            CodeClause => Code::CodeClause,
            Internal(_) => Code::Internal,
            UnknownIdentifier { .. } | UnparsableExpression { .. }
            | InvalidBreakpointExpression { .. } => Code::Monitor,
        }
    }

    pub fn prefix(self) -> String {
        format!("[A68_{:03}]", self as u32)
    }
}

/// A rendered runtime diagnostic, miette-ready.
#[derive(Debug, Error, Diagnostic)]
#[error("{prefix} {message}")]
pub struct RuntimeDiagnostic {
    prefix: String,
    message: String,
    #[help]
    help: Option<String>,
}

impl RuntimeDiagnostic {
    pub fn new(e: &GenieError, line: Option<u32>, source_line: Option<&str>) -> Self {
        let code = Code::of(e);
        let message = match line {
            Some(l) => format!("{} (line {})", e, l),
            None => e.to_string(),
        };
        let help = source_line.map(|s| {
            format!("{:>5} {}", line.unwrap_or(0), s)
        });
        RuntimeDiagnostic { prefix: code.prefix(), message, help }
    }
}

/// The central diagnostic routine. Warnings return; runtime severities
/// are printed and the caller decides whether the monitor re-enters.
pub fn report(g: &mut Genie, error: &GenieError, node: NodeId) {
    let line = g.tree.node(node).line;
    let source_line = g.tree.source.get(line as usize - 1).cloned();
    let diag = RuntimeDiagnostic::new(error, Some(line), source_line.as_deref());
    let severity = match error.severity() {
        Severity::Warning => "warning".yellow().to_string(),
        Severity::MathWarning => "math warning".yellow().to_string(),
        Severity::Runtime => "runtime error".red().bold().to_string(),
        Severity::ForceQuit => "fatal".red().bold().to_string(),
        Severity::Rerun => "rerun".cyan().to_string(),
    };
    let text = format!("{}: {}\n", severity, diag);
    let _ = g.out.write_all(text.as_bytes());
    if let Some(src) = source_line {
        let _ = g.out.write_all(format!("{:>5} {}\n", line, src).as_bytes());
    }
}

/// `--backtrace`: a frame dump in monitor `stack` format preceding exit.
pub fn backtrace(g: &mut Genie) {
    if g.frames.is_empty() {
        let _ = g.out.write_all(b"no frames\n");
        return;
    }
    let mut cur = Some(g.frames.top_number());
    let mut lines = Vec::new();
    while let Some(fno) = cur {
        let f = g.frames.frame(fno);
        let line = g.tree.node(f.node).line;
        lines.push(format!(
            "#{:<3} level {:<2} line {:<4}{}",
            f.number,
            f.level,
            line,
            if f.proc_frame { " procedure" } else { "" }
        ));
        cur = f.dynamic_link;
    }
    for l in lines {
        let _ = g.out.write_all(l.as_bytes());
        let _ = g.out.write_all(b"\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_partition_the_taxonomy() {
        assert_eq!(Code::of(&GenieError::NilDereference), Code::NilAccess);
        assert_eq!(Code::of(&GenieError::DifferentBounds), Code::DifferentBounds);
        assert_eq!(Code::of(&GenieError::LoopCounterOverflow), Code::Overflow);
        assert_eq!(
            Code::of(&GenieError::UnknownIdentifier { name: "x".into() }),
            Code::Monitor
        );
        assert_eq!(Code::DeadJump.prefix(), "[A68_602]");
    }

    #[test]
    fn diagnostics_carry_line_context() {
        let d = RuntimeDiagnostic::new(
            &GenieError::DivisionByZero,
            Some(3),
            Some("x := 1 OVER 0"),
        );
        let text = d.to_string();
        assert!(text.contains("[A68_401]"));
        assert!(text.contains("line 3"));
    }
}
