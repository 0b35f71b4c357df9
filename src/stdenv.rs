/// Standard environ: monadic operators, dyadic operators and procedures,
/// held in three parallel descriptor tables. Each entry carries the
/// native procedure, the generated-code name used for plugin symbols,
/// and the emission string the code generator splices into its
/// intermediate text.
///
/// Dispatch keys are strings of mode short-ids ("ii" = INT×INT); lookup
/// is by operator symbol plus key.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::errors::{Exec, GenieError, Irq};
use crate::genie::Genie;
use crate::mode::{MAX_INT, MIN_INT, INT_WIDTH};
use crate::tree::NodeId;
use crate::value::Value;

pub type StdProc = fn(&mut Genie, NodeId) -> Exec;

pub struct StdEntry {
    /// Operator or identifier spelling in the language.
    pub name: &'static str,
    /// Operand dispatch key (mode short-ids); empty for niladic entries.
    pub key: &'static str,
    pub proc_: StdProc,
    /// Generated-code name, composed into plugin symbols.
    pub code_name: &'static str,
    /// Emission string for the intermediate text; %1/%2 are operand holes.
    pub emit: &'static str,
}

// ---------------------------------------------------------------------------
// Value plumbing shared by the table entries
// ---------------------------------------------------------------------------

fn err(e: GenieError, n: NodeId) -> Irq {
    Irq::error(e, n)
}

fn pop_int(g: &mut Genie, n: NodeId) -> Exec<i64> {
    match g.pop() {
        Value::Int(v) => Ok(v),
        Value::Empty => Err(err(GenieError::UninitialisedValue { mode: "INT".into() }, n)),
        other => Err(err(GenieError::Internal(format!("INT operand, found {:?}", other)), n)),
    }
}

fn pop_real(g: &mut Genie, n: NodeId) -> Exec<f64> {
    match g.pop() {
        Value::Real(v) => Ok(v),
        Value::Empty => Err(err(GenieError::UninitialisedValue { mode: "REAL".into() }, n)),
        other => Err(err(GenieError::Internal(format!("REAL operand, found {:?}", other)), n)),
    }
}

fn pop_bool(g: &mut Genie, n: NodeId) -> Exec<bool> {
    match g.pop() {
        Value::Bool(v) => Ok(v),
        Value::Empty => Err(err(GenieError::UninitialisedValue { mode: "BOOL".into() }, n)),
        other => Err(err(GenieError::Internal(format!("BOOL operand, found {:?}", other)), n)),
    }
}

fn pop_char(g: &mut Genie, n: NodeId) -> Exec<char> {
    match g.pop() {
        Value::Char(v) => Ok(v),
        Value::Empty => Err(err(GenieError::UninitialisedValue { mode: "CHAR".into() }, n)),
        other => Err(err(GenieError::Internal(format!("CHAR operand, found {:?}", other)), n)),
    }
}

fn pop_bits(g: &mut Genie, n: NodeId) -> Exec<u64> {
    match g.pop() {
        Value::Bits(v) => Ok(v),
        Value::Empty => Err(err(GenieError::UninitialisedValue { mode: "BITS".into() }, n)),
        other => Err(err(GenieError::Internal(format!("BITS operand, found {:?}", other)), n)),
    }
}

fn checked_int(v: i64, op: &'static str, n: NodeId) -> Exec<Value> {
    if (MIN_INT..=MAX_INT).contains(&v) {
        Ok(Value::Int(v))
    } else {
        Err(err(GenieError::IntegerOverflow { op }, n))
    }
}

/// Math-error check after a libm call.
fn checked_real(v: f64, func: &'static str, n: NodeId) -> Exec<Value> {
    if v.is_finite() {
        Ok(Value::Real(v))
    } else {
        Err(err(GenieError::MathError { func }, n))
    }
}

// ---------------------------------------------------------------------------
// Entry bodies
// ---------------------------------------------------------------------------

macro_rules! dyad_ii {
    ($f:ident, $op:literal, $body:expr) => {
        fn $f(g: &mut Genie, n: NodeId) -> Exec {
            let rhs = pop_int(g, n)?;
            let lhs = pop_int(g, n)?;
            let combine: fn(i64, i64, NodeId) -> Exec<Value> = $body;
            let v = combine(lhs, rhs, n)?;
            g.push(v, n)
        }
    };
}

macro_rules! dyad_rr {
    ($f:ident, $body:expr) => {
        fn $f(g: &mut Genie, n: NodeId) -> Exec {
            let rhs = pop_real(g, n)?;
            let lhs = pop_real(g, n)?;
            let combine: fn(f64, f64, NodeId) -> Exec<Value> = $body;
            let v = combine(lhs, rhs, n)?;
            g.push(v, n)
        }
    };
}

dyad_ii!(add_int, "+", |a, b, n| checked_int(a + b, "+", n));
dyad_ii!(sub_int, "-", |a, b, n| checked_int(a - b, "-", n));
dyad_ii!(mul_int, "*", |a, b, n| checked_int(a * b, "*", n));
dyad_ii!(over_int, "OVER", |a, b, n| {
    if b == 0 {
        Err(err(GenieError::DivisionByZero, n))
    } else {
        checked_int(a / b, "OVER", n)
    }
});
dyad_ii!(mod_int, "MOD", |a, b, n| {
    if b == 0 {
        Err(err(GenieError::DivisionByZero, n))
    } else {
        // Euclidean remainder: MOD yields a non-negative result.
        checked_int(a.rem_euclid(b), "MOD", n)
    }
});

fn div_int(g: &mut Genie, n: NodeId) -> Exec {
    let rhs = pop_int(g, n)?;
    let lhs = pop_int(g, n)?;
    if rhs == 0 {
        return Err(err(GenieError::DivisionByZero, n));
    }
    g.push(Value::Real(lhs as f64 / rhs as f64), n)
}

fn pow_int(g: &mut Genie, n: NodeId) -> Exec {
    let exp = pop_int(g, n)?;
    let base = pop_int(g, n)?;
    if exp < 0 {
        return Err(err(GenieError::InvalidCast { mode: "INT ** negative".into() }, n));
    }
    let mut acc: i64 = 1;
    for _ in 0..exp {
        acc = acc.checked_mul(base).ok_or_else(|| err(GenieError::IntegerOverflow { op: "**" }, n))?;
        if !(MIN_INT..=MAX_INT).contains(&acc) {
            return Err(err(GenieError::IntegerOverflow { op: "**" }, n));
        }
    }
    g.push(Value::Int(acc), n)
}

macro_rules! cmp_ii {
    ($f:ident, $op:tt) => {
        fn $f(g: &mut Genie, n: NodeId) -> Exec {
            let rhs = pop_int(g, n)?;
            let lhs = pop_int(g, n)?;
            g.push(Value::Bool(lhs $op rhs), n)
        }
    };
}

cmp_ii!(eq_int, ==);
cmp_ii!(ne_int, !=);
cmp_ii!(lt_int, <);
cmp_ii!(le_int, <=);
cmp_ii!(gt_int, >);
cmp_ii!(ge_int, >=);

dyad_rr!(add_real, |a, b, n| checked_real(a + b, "+", n));
dyad_rr!(sub_real, |a, b, n| checked_real(a - b, "-", n));
dyad_rr!(mul_real, |a, b, n| checked_real(a * b, "*", n));
dyad_rr!(div_real, |a, b, n| {
    if b == 0.0 {
        Err(err(GenieError::MathError { func: "/" }, n))
    } else {
        checked_real(a / b, "/", n)
    }
});

macro_rules! cmp_rr {
    ($f:ident, $op:tt) => {
        fn $f(g: &mut Genie, n: NodeId) -> Exec {
            let rhs = pop_real(g, n)?;
            let lhs = pop_real(g, n)?;
            g.push(Value::Bool(lhs $op rhs), n)
        }
    };
}

cmp_rr!(eq_real, ==);
cmp_rr!(ne_real, !=);
cmp_rr!(lt_real, <);
cmp_rr!(le_real, <=);
cmp_rr!(gt_real, >);
cmp_rr!(ge_real, >=);

fn and_bool(g: &mut Genie, n: NodeId) -> Exec {
    let rhs = pop_bool(g, n)?;
    let lhs = pop_bool(g, n)?;
    g.push(Value::Bool(lhs && rhs), n)
}

fn or_bool(g: &mut Genie, n: NodeId) -> Exec {
    let rhs = pop_bool(g, n)?;
    let lhs = pop_bool(g, n)?;
    g.push(Value::Bool(lhs || rhs), n)
}

fn eq_bool(g: &mut Genie, n: NodeId) -> Exec {
    let rhs = pop_bool(g, n)?;
    let lhs = pop_bool(g, n)?;
    g.push(Value::Bool(lhs == rhs), n)
}

fn ne_bool(g: &mut Genie, n: NodeId) -> Exec {
    let rhs = pop_bool(g, n)?;
    let lhs = pop_bool(g, n)?;
    g.push(Value::Bool(lhs != rhs), n)
}

macro_rules! cmp_cc {
    ($f:ident, $op:tt) => {
        fn $f(g: &mut Genie, n: NodeId) -> Exec {
            let rhs = pop_char(g, n)?;
            let lhs = pop_char(g, n)?;
            g.push(Value::Bool(lhs $op rhs), n)
        }
    };
}

cmp_cc!(eq_char, ==);
cmp_cc!(ne_char, !=);
cmp_cc!(lt_char, <);
cmp_cc!(le_char, <=);
cmp_cc!(gt_char, >);
cmp_cc!(ge_char, >=);

fn and_bits(g: &mut Genie, n: NodeId) -> Exec {
    let rhs = pop_bits(g, n)?;
    let lhs = pop_bits(g, n)?;
    g.push(Value::Bits(lhs & rhs), n)
}

fn or_bits(g: &mut Genie, n: NodeId) -> Exec {
    let rhs = pop_bits(g, n)?;
    let lhs = pop_bits(g, n)?;
    g.push(Value::Bits(lhs | rhs), n)
}

fn xor_bits(g: &mut Genie, n: NodeId) -> Exec {
    let rhs = pop_bits(g, n)?;
    let lhs = pop_bits(g, n)?;
    g.push(Value::Bits(lhs ^ rhs), n)
}

fn add_complex(g: &mut Genie, n: NodeId) -> Exec {
    let (c, d) = pop_complex(g, n)?;
    let (a, b) = pop_complex(g, n)?;
    g.push(Value::Complex(a + c, b + d), n)
}

fn sub_complex(g: &mut Genie, n: NodeId) -> Exec {
    let (c, d) = pop_complex(g, n)?;
    let (a, b) = pop_complex(g, n)?;
    g.push(Value::Complex(a - c, b - d), n)
}

fn mul_complex(g: &mut Genie, n: NodeId) -> Exec {
    let (c, d) = pop_complex(g, n)?;
    let (a, b) = pop_complex(g, n)?;
    g.push(Value::Complex(a * c - b * d, a * d + b * c), n)
}

fn pop_complex(g: &mut Genie, n: NodeId) -> Exec<(f64, f64)> {
    match g.pop() {
        Value::Complex(re, im) => Ok((re, im)),
        Value::Empty => Err(err(GenieError::UninitialisedValue { mode: "COMPL".into() }, n)),
        other => Err(err(GenieError::Internal(format!("COMPL operand, found {:?}", other)), n)),
    }
}

// Monads.

fn neg_int(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_int(g, n)?;
    checked_int(-v, "-", n).and_then(|v| g.push(v, n))
}

fn neg_real(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_real(g, n)?;
    g.push(Value::Real(-v), n)
}

fn abs_int(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_int(g, n)?;
    checked_int(v.abs(), "ABS", n).and_then(|v| g.push(v, n))
}

fn abs_real(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_real(g, n)?;
    g.push(Value::Real(v.abs()), n)
}

fn abs_char(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_char(g, n)?;
    g.push(Value::Int(v as i64), n)
}

fn repr_int(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_int(g, n)?;
    let c = u32::try_from(v)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| err(GenieError::InvalidCast { mode: "CHAR".into() }, n))?;
    g.push(Value::Char(c), n)
}

fn not_bool(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_bool(g, n)?;
    g.push(Value::Bool(!v), n)
}

fn not_bits(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_bits(g, n)?;
    g.push(Value::Bits(!v), n)
}

fn entier_real(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_real(g, n)?;
    checked_int(v.floor() as i64, "ENTIER", n).and_then(|v| g.push(v, n))
}

fn round_real(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_real(g, n)?;
    checked_int(v.round() as i64, "ROUND", n).and_then(|v| g.push(v, n))
}

fn sign_int(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_int(g, n)?;
    g.push(Value::Int(v.signum()), n)
}

fn odd_int(g: &mut Genie, n: NodeId) -> Exec {
    let v = pop_int(g, n)?;
    g.push(Value::Bool(v.rem_euclid(2) == 1), n)
}

fn neg_complex(g: &mut Genie, n: NodeId) -> Exec {
    let (re, im) = pop_complex(g, n)?;
    g.push(Value::Complex(-re, -im), n)
}

// Procedures.

macro_rules! libm_proc {
    ($f:ident, $name:literal, $call:expr) => {
        fn $f(g: &mut Genie, n: NodeId) -> Exec {
            let v = pop_real(g, n)?;
            let apply: fn(f64) -> f64 = $call;
            let out = checked_real(apply(v), $name, n)?;
            g.push(out, n)
        }
    };
}

libm_proc!(p_sqrt, "sqrt", |v| v.sqrt());
libm_proc!(p_exp, "exp", |v| v.exp());
libm_proc!(p_ln, "ln", |v| v.ln());
libm_proc!(p_sin, "sin", |v| v.sin());
libm_proc!(p_cos, "cos", |v| v.cos());
libm_proc!(p_tan, "tan", |v| v.tan());
libm_proc!(p_arctan, "arctan", |v| v.atan());

fn p_random(g: &mut Genie, n: NodeId) -> Exec {
    let v = g.rng.next_double();
    g.push(Value::Real(v), n)
}

fn p_re(g: &mut Genie, n: NodeId) -> Exec {
    let (re, _) = pop_complex(g, n)?;
    g.push(Value::Real(re), n)
}

fn p_im(g: &mut Genie, n: NodeId) -> Exec {
    let (_, im) = pop_complex(g, n)?;
    g.push(Value::Real(im), n)
}

fn p_max_int(g: &mut Genie, n: NodeId) -> Exec {
    g.push(Value::Int(MAX_INT), n)
}

fn p_max_real(g: &mut Genie, n: NodeId) -> Exec {
    g.push(Value::Real(f64::MAX), n)
}

fn p_small_real(g: &mut Genie, n: NodeId) -> Exec {
    g.push(Value::Real(f64::EPSILON), n)
}

fn p_pi(g: &mut Genie, n: NodeId) -> Exec {
    g.push(Value::Real(std::f64::consts::PI), n)
}

/// Standard write: formats each argument by its mode and sends it to the
/// transput sink. The call machinery leaves arguments on the expression
/// stack with the call node's children describing their modes.
fn p_print(g: &mut Genie, n: NodeId) -> Exec {
    let args = g.take_call_args(n)?;
    let mut text = String::new();
    for slots in &args {
        text.push_str(&g.format_slots(slots));
    }
    g.write_out(&text);
    Ok(())
}

fn p_read(g: &mut Genie, n: NodeId) -> Exec {
    // Unformatted read hook: the transput collaborator owns real input.
    let _ = g.take_call_args(n)?;
    Ok(())
}

fn p_newline(g: &mut Genie, _n: NodeId) -> Exec {
    g.write_out("\n");
    Ok(())
}

// ---------------------------------------------------------------------------
// Default transput formatting
// ---------------------------------------------------------------------------

/// Default INT transput: sign and digits right-justified in eleven
/// columns.
pub fn whole_int(v: i64) -> String {
    format!("{:>width$}", format!("{:+}", v), width = INT_WIDTH)
}

pub fn whole_real(v: f64) -> String {
    // Sign, 14 fraction digits, explicit exponent sign.
    let s = format!("{:+.14e}", v);
    match s.split_once('e') {
        Some((m, e)) if !e.starts_with('-') => format!("{}e+{}", m, e),
        _ => s,
    }
}

// ---------------------------------------------------------------------------
// The three parallel tables
// ---------------------------------------------------------------------------

pub static MONADS: &[StdEntry] = &[
    StdEntry { name: "-", key: "i", proc_: neg_int, code_name: "neg_int", emit: "(-%1)" },
    StdEntry { name: "-", key: "r", proc_: neg_real, code_name: "neg_real", emit: "(-%1)" },
    StdEntry { name: "-", key: "z", proc_: neg_complex, code_name: "neg_complex", emit: "cneg(%1)" },
    StdEntry { name: "ABS", key: "i", proc_: abs_int, code_name: "abs_int", emit: "labs(%1)" },
    StdEntry { name: "ABS", key: "r", proc_: abs_real, code_name: "abs_real", emit: "fabs(%1)" },
    StdEntry { name: "ABS", key: "c", proc_: abs_char, code_name: "abs_char", emit: "(int)(%1)" },
    StdEntry { name: "REPR", key: "i", proc_: repr_int, code_name: "repr_int", emit: "(char)(%1)" },
    StdEntry { name: "NOT", key: "b", proc_: not_bool, code_name: "not_bool", emit: "(!%1)" },
    StdEntry { name: "NOT", key: "w", proc_: not_bits, code_name: "not_bits", emit: "(~%1)" },
    StdEntry { name: "ENTIER", key: "r", proc_: entier_real, code_name: "entier_real", emit: "floor(%1)" },
    StdEntry { name: "ROUND", key: "r", proc_: round_real, code_name: "round_real", emit: "round(%1)" },
    StdEntry { name: "SIGN", key: "i", proc_: sign_int, code_name: "sign_int", emit: "sign(%1)" },
    StdEntry { name: "ODD", key: "i", proc_: odd_int, code_name: "odd_int", emit: "((%1 & 1) == 1)" },
];

pub static DYADS: &[StdEntry] = &[
    StdEntry { name: "+", key: "ii", proc_: add_int, code_name: "add_int", emit: "(%1 + %2)" },
    StdEntry { name: "-", key: "ii", proc_: sub_int, code_name: "sub_int", emit: "(%1 - %2)" },
    StdEntry { name: "*", key: "ii", proc_: mul_int, code_name: "mul_int", emit: "(%1 * %2)" },
    StdEntry { name: "/", key: "ii", proc_: div_int, code_name: "div_int", emit: "((double)%1 / %2)" },
    StdEntry { name: "OVER", key: "ii", proc_: over_int, code_name: "over_int", emit: "(%1 / %2)" },
    StdEntry { name: "MOD", key: "ii", proc_: mod_int, code_name: "mod_int", emit: "a68_mod(%1, %2)" },
    StdEntry { name: "**", key: "ii", proc_: pow_int, code_name: "pow_int", emit: "a68_ipow(%1, %2)" },
    StdEntry { name: "=", key: "ii", proc_: eq_int, code_name: "eq_int", emit: "(%1 == %2)" },
    StdEntry { name: "/=", key: "ii", proc_: ne_int, code_name: "ne_int", emit: "(%1 != %2)" },
    StdEntry { name: "<", key: "ii", proc_: lt_int, code_name: "lt_int", emit: "(%1 < %2)" },
    StdEntry { name: "<=", key: "ii", proc_: le_int, code_name: "le_int", emit: "(%1 <= %2)" },
    StdEntry { name: ">", key: "ii", proc_: gt_int, code_name: "gt_int", emit: "(%1 > %2)" },
    StdEntry { name: ">=", key: "ii", proc_: ge_int, code_name: "ge_int", emit: "(%1 >= %2)" },
    StdEntry { name: "+", key: "rr", proc_: add_real, code_name: "add_real", emit: "(%1 + %2)" },
    StdEntry { name: "-", key: "rr", proc_: sub_real, code_name: "sub_real", emit: "(%1 - %2)" },
    StdEntry { name: "*", key: "rr", proc_: mul_real, code_name: "mul_real", emit: "(%1 * %2)" },
    StdEntry { name: "/", key: "rr", proc_: div_real, code_name: "div_real", emit: "(%1 / %2)" },
    StdEntry { name: "=", key: "rr", proc_: eq_real, code_name: "eq_real", emit: "(%1 == %2)" },
    StdEntry { name: "/=", key: "rr", proc_: ne_real, code_name: "ne_real", emit: "(%1 != %2)" },
    StdEntry { name: "<", key: "rr", proc_: lt_real, code_name: "lt_real", emit: "(%1 < %2)" },
    StdEntry { name: "<=", key: "rr", proc_: le_real, code_name: "le_real", emit: "(%1 <= %2)" },
    StdEntry { name: ">", key: "rr", proc_: gt_real, code_name: "gt_real", emit: "(%1 > %2)" },
    StdEntry { name: ">=", key: "rr", proc_: ge_real, code_name: "ge_real", emit: "(%1 >= %2)" },
    StdEntry { name: "AND", key: "bb", proc_: and_bool, code_name: "and_bool", emit: "(%1 && %2)" },
    StdEntry { name: "OR", key: "bb", proc_: or_bool, code_name: "or_bool", emit: "(%1 || %2)" },
    StdEntry { name: "=", key: "bb", proc_: eq_bool, code_name: "eq_bool", emit: "(%1 == %2)" },
    StdEntry { name: "/=", key: "bb", proc_: ne_bool, code_name: "ne_bool", emit: "(%1 != %2)" },
    StdEntry { name: "=", key: "cc", proc_: eq_char, code_name: "eq_char", emit: "(%1 == %2)" },
    StdEntry { name: "/=", key: "cc", proc_: ne_char, code_name: "ne_char", emit: "(%1 != %2)" },
    StdEntry { name: "<", key: "cc", proc_: lt_char, code_name: "lt_char", emit: "(%1 < %2)" },
    StdEntry { name: "<=", key: "cc", proc_: le_char, code_name: "le_char", emit: "(%1 <= %2)" },
    StdEntry { name: ">", key: "cc", proc_: gt_char, code_name: "gt_char", emit: "(%1 > %2)" },
    StdEntry { name: ">=", key: "cc", proc_: ge_char, code_name: "ge_char", emit: "(%1 >= %2)" },
    StdEntry { name: "AND", key: "ww", proc_: and_bits, code_name: "and_bits", emit: "(%1 & %2)" },
    StdEntry { name: "OR", key: "ww", proc_: or_bits, code_name: "or_bits", emit: "(%1 | %2)" },
    StdEntry { name: "XOR", key: "ww", proc_: xor_bits, code_name: "xor_bits", emit: "(%1 ^ %2)" },
    StdEntry { name: "+", key: "zz", proc_: add_complex, code_name: "add_complex", emit: "cadd(%1, %2)" },
    StdEntry { name: "-", key: "zz", proc_: sub_complex, code_name: "sub_complex", emit: "csub(%1, %2)" },
    StdEntry { name: "*", key: "zz", proc_: mul_complex, code_name: "mul_complex", emit: "cmul(%1, %2)" },
];

pub static PROCS: &[StdEntry] = &[
    StdEntry { name: "print", key: "*", proc_: p_print, code_name: "print", emit: "" },
    StdEntry { name: "write", key: "*", proc_: p_print, code_name: "write", emit: "" },
    StdEntry { name: "read", key: "*", proc_: p_read, code_name: "read", emit: "" },
    StdEntry { name: "new line", key: "", proc_: p_newline, code_name: "new_line", emit: "" },
    StdEntry { name: "sqrt", key: "r", proc_: p_sqrt, code_name: "sqrt", emit: "sqrt(%1)" },
    StdEntry { name: "exp", key: "r", proc_: p_exp, code_name: "exp", emit: "exp(%1)" },
    StdEntry { name: "ln", key: "r", proc_: p_ln, code_name: "ln", emit: "log(%1)" },
    StdEntry { name: "sin", key: "r", proc_: p_sin, code_name: "sin", emit: "sin(%1)" },
    StdEntry { name: "cos", key: "r", proc_: p_cos, code_name: "cos", emit: "cos(%1)" },
    StdEntry { name: "tan", key: "r", proc_: p_tan, code_name: "tan", emit: "tan(%1)" },
    StdEntry { name: "arctan", key: "r", proc_: p_arctan, code_name: "arctan", emit: "atan(%1)" },
    StdEntry { name: "random", key: "", proc_: p_random, code_name: "random", emit: "" },
    StdEntry { name: "re", key: "z", proc_: p_re, code_name: "re_complex", emit: "creal(%1)" },
    StdEntry { name: "im", key: "z", proc_: p_im, code_name: "im_complex", emit: "cimag(%1)" },
    StdEntry { name: "max int", key: "", proc_: p_max_int, code_name: "max_int", emit: "" },
    StdEntry { name: "max real", key: "", proc_: p_max_real, code_name: "max_real", emit: "" },
    StdEntry { name: "small real", key: "", proc_: p_small_real, code_name: "small_real", emit: "" },
    StdEntry { name: "pi", key: "", proc_: p_pi, code_name: "pi", emit: "" },
];

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

static PROC_INDEX: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    PROCS.iter().enumerate().map(|(i, e)| (e.name, i as u32)).collect()
});

pub fn find_dyad(name: &str, key: &str) -> Option<u32> {
    DYADS
        .iter()
        .position(|e| e.name == name && e.key == key)
        .map(|i| i as u32)
}

pub fn find_monad(name: &str, key: &str) -> Option<u32> {
    MONADS
        .iter()
        .position(|e| e.name == name && e.key == key)
        .map(|i| i as u32)
}

pub fn find_proc(name: &str) -> Option<u32> {
    PROC_INDEX.get(name).copied()
}

pub fn dyad(i: u32) -> &'static StdEntry {
    &DYADS[i as usize]
}

pub fn monad(i: u32) -> &'static StdEntry {
    &MONADS[i as usize]
}

pub fn proc_entry(i: u32) -> &'static StdEntry {
    &PROCS[i as usize]
}

/// Niladic standenv entries denote constants (`max int`, `pi`).
pub fn is_constant_entry(i: u32) -> bool {
    let e = proc_entry(i);
    e.key.is_empty() && e.name != "new line" && e.name != "random"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dyad_lookup_is_keyed_by_symbol_and_operands() {
        let plus_ii = find_dyad("+", "ii").unwrap();
        let plus_rr = find_dyad("+", "rr").unwrap();
        assert_ne!(plus_ii, plus_rr);
        assert_eq!(dyad(plus_ii).code_name, "add_int");
        assert!(find_dyad("+", "bb").is_none());
    }

    #[test]
    fn whole_int_matches_default_transput() {
        assert_eq!(whole_int(5), "         +5");
        assert_eq!(whole_int(20), "        +20");
        assert_eq!(whole_int(120), "       +120");
        assert_eq!(whole_int(-7), "         -7");
        assert_eq!(whole_int(2_147_483_647), "+2147483647");
    }

    #[test]
    fn real_formatting_keeps_a_signed_exponent() {
        let s = whole_real(1.0);
        assert!(s.starts_with("+1."));
        assert!(s.contains("e+"), "{}", s);
    }

    #[test]
    fn constant_entries_are_niladic_and_pure() {
        assert!(is_constant_entry(find_proc("max int").unwrap()));
        assert!(is_constant_entry(find_proc("pi").unwrap()));
        assert!(!is_constant_entry(find_proc("random").unwrap()));
        assert!(!is_constant_entry(find_proc("print").unwrap()));
    }
}
