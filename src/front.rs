/// Reduced front-end: lexer, recursive-descent parser and bottom-up
/// moder for the pragmatic subset the interpreter, the monitor and the
/// driver need. It stands in for the external parser collaborator and
/// builds trees exclusively through the tree builder; the interpreter
/// never sees anything it could not have received from outside.

use std::collections::HashMap;

use miette::Diagnostic;
use thiserror::Error;

use crate::mode::{
    ModeDef, ModeId, M_BITS, M_BOOL, M_CHAR, M_COMPLEX, M_INT, M_REAL, M_ROW_CHAR, M_VOID,
};
use crate::stdenv;
use crate::tree::{Attribute, NodeId, TagKind, Tree, TreeBuilder};

#[derive(Debug, Clone, Error, Diagnostic, PartialEq)]
#[error("line {line}: {message}")]
pub struct FrontError {
    pub message: String,
    pub line: u32,
}

fn err<T>(message: impl Into<String>, line: u32) -> Result<T, FrontError> {
    Err(FrontError { message: message.into(), line })
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Bold(String),
    Ident(String),
    IntLit(String),
    RealLit(String),
    StrLit(String),
    BitsLit(String),
    Becomes,
    Op(String),
    Semicolon,
    Comma,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    At,
    Bar,
    Eof,
}

/// Multi-word standard identifiers joined by the lexer.
const MULTI_WORD: &[&str] = &["max int", "max real", "small real", "new line"];

pub(crate) fn lex(src: &str) -> Result<Vec<(Tok, u32)>, FrontError> {
    let mut out = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut line = 1u32;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            ' ' | '\t' | '\r' => i += 1,
            '#' => {
                i += 1;
                while i < chars.len() && chars[i] != '#' {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            'A'..='Z' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_uppercase() {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "CO" | "COMMENT" => {
                        // Skip to the matching closer.
                        loop {
                            while i < chars.len() && !chars[i].is_ascii_uppercase() {
                                if chars[i] == '\n' {
                                    line += 1;
                                }
                                i += 1;
                            }
                            if i >= chars.len() {
                                return err("unterminated comment", line);
                            }
                            let s = i;
                            while i < chars.len() && chars[i].is_ascii_uppercase() {
                                i += 1;
                            }
                            let w: String = chars[s..i].iter().collect();
                            if w == word {
                                break;
                            }
                        }
                    }
                    _ => out.push((Tok::Bold(word), line)),
                }
            }
            'a'..='z' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_lowercase() || chars[i].is_ascii_digit() || chars[i] == '_')
                {
                    i += 1;
                }
                let mut word: String = chars[start..i].iter().collect();
                // Join known multi-word identifiers ("max int").
                let mut j = i;
                while j < chars.len() && chars[j] == ' ' {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_lowercase() {
                    let s2 = j;
                    let mut k = j;
                    while k < chars.len() && chars[k].is_ascii_lowercase() {
                        k += 1;
                    }
                    let second: String = chars[s2..k].iter().collect();
                    let joined = format!("{} {}", word, second);
                    if MULTI_WORD.contains(&joined.as_str()) {
                        word = joined;
                        i = k;
                    }
                }
                out.push((Tok::Ident(word), line));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i < chars.len() && chars[i] == 'r' {
                    // Radix denotation, 2r1010.
                    i += 1;
                    let ds = i;
                    while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                        i += 1;
                    }
                    let digits: String = chars[ds..i].iter().collect();
                    out.push((Tok::BitsLit(format!("2r{}", digits)), line));
                } else if i < chars.len()
                    && (chars[i] == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit()
                        || chars[i] == 'e')
                {
                    if chars[i] == '.' {
                        i += 1;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                    if i < chars.len() && chars[i] == 'e' {
                        i += 1;
                        if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                            i += 1;
                        }
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                    out.push((Tok::RealLit(chars[start..i].iter().collect()), line));
                } else {
                    out.push((Tok::IntLit(chars[start..i].iter().collect()), line));
                }
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                while i < chars.len() {
                    if chars[i] == '"' {
                        if i + 1 < chars.len() && chars[i + 1] == '"' {
                            s.push('"');
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return err("unterminated string denotation", line);
                }
                i += 1;
                out.push((Tok::StrLit(s), line));
            }
            ':' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    out.push((Tok::Becomes, line));
                    i += 2;
                } else {
                    out.push((Tok::Colon, line));
                    i += 1;
                }
            }
            '/' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    out.push((Tok::Op("/=".into()), line));
                    i += 2;
                } else {
                    out.push((Tok::Op("/".into()), line));
                    i += 1;
                }
            }
            '<' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    out.push((Tok::Op("<=".into()), line));
                    i += 2;
                } else {
                    out.push((Tok::Op("<".into()), line));
                    i += 1;
                }
            }
            '>' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    out.push((Tok::Op(">=".into()), line));
                    i += 2;
                } else {
                    out.push((Tok::Op(">".into()), line));
                    i += 1;
                }
            }
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    out.push((Tok::Op("**".into()), line));
                    i += 2;
                } else {
                    out.push((Tok::Op("*".into()), line));
                    i += 1;
                }
            }
            '=' => {
                out.push((Tok::Op("=".into()), line));
                i += 1;
            }
            '+' => {
                out.push((Tok::Op("+".into()), line));
                i += 1;
            }
            '-' => {
                out.push((Tok::Op("-".into()), line));
                i += 1;
            }
            '%' => {
                out.push((Tok::Op("OVER".into()), line));
                i += 1;
            }
            ';' => {
                out.push((Tok::Semicolon, line));
                i += 1;
            }
            ',' => {
                out.push((Tok::Comma, line));
                i += 1;
            }
            '(' => {
                out.push((Tok::LParen, line));
                i += 1;
            }
            ')' => {
                out.push((Tok::RParen, line));
                i += 1;
            }
            '[' => {
                out.push((Tok::LBracket, line));
                i += 1;
            }
            ']' => {
                out.push((Tok::RBracket, line));
                i += 1;
            }
            '@' => {
                out.push((Tok::At, line));
                i += 1;
            }
            '|' => {
                out.push((Tok::Bar, line));
                i += 1;
            }
            other => return err(format!("unexpected character '{}'", other), line),
        }
    }
    out.push((Tok::Eof, line));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// How a serial clause's last unit is coerced.
#[derive(Clone, Copy, PartialEq)]
enum LastUnit {
    Keep,
    To(ModeId),
    /// Dereference/deprocedure to a base value.
    Value,
    Void,
}

pub struct Parser {
    toks: Vec<(Tok, u32)>,
    pos: usize,
    b: TreeBuilder,
    scopes: Vec<u32>,
    mode_aliases: HashMap<String, ModeId>,
    priorities: HashMap<String, u8>,
    /// GOTO occurrences resolved after the whole program is parsed.
    jumps: Vec<(NodeId, u32, String, u32)>,
}

pub fn parse_program(src: &str) -> Result<Tree, FrontError> {
    let mut p = Parser::new(src)?;
    p.program()
}

impl Parser {
    fn new(src: &str) -> Result<Self, FrontError> {
        let toks = lex(src)?;
        let mut b = TreeBuilder::new();
        b.set_source(src);
        let std_table = b.new_table(None);
        install_standenv(&mut b, std_table);
        Ok(Parser {
            toks,
            pos: 0,
            b,
            scopes: vec![std_table],
            mode_aliases: HashMap::new(),
            priorities: HashMap::new(),
            jumps: Vec::new(),
        })
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.pos].0
    }

    fn peek_at(&self, n: usize) -> &Tok {
        let i = (self.pos + n).min(self.toks.len() - 1);
        &self.toks[i].0
    }

    fn line(&self) -> u32 {
        self.toks[self.pos].1
    }

    fn next(&mut self) -> Tok {
        let t = self.toks[self.pos].0.clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn at_bold(&self, w: &str) -> bool {
        matches!(self.peek(), Tok::Bold(b) if b == w)
    }

    fn eat_bold(&mut self, w: &str) -> bool {
        if self.at_bold(w) {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect_bold(&mut self, w: &str) -> Result<(), FrontError> {
        if self.eat_bold(w) {
            Ok(())
        } else {
            err(format!("expected {}, found {:?}", w, self.peek()), self.line())
        }
    }

    fn expect(&mut self, t: Tok) -> Result<(), FrontError> {
        if *self.peek() == t {
            self.next();
            Ok(())
        } else {
            err(format!("expected {:?}, found {:?}", t, self.peek()), self.line())
        }
    }

    fn table(&self) -> u32 {
        *self.scopes.last().expect("a scope is always open")
    }

    // -------------------------------------------------------------------
    // Program
    // -------------------------------------------------------------------

    fn program(&mut self) -> Result<Tree, FrontError> {
        let line = self.line();
        let clause = self.enclosed()?;
        if *self.peek() != Tok::Eof {
            return err(format!("trailing input: {:?}", self.peek()), self.line());
        }
        let mode = self.b.node(clause).mode;
        let root = self.b.add_node(Attribute::ParticularProgram, "", mode, self.table(), line);
        self.b.adopt(root, &[clause]);
        self.resolve_jumps()?;
        let b = std::mem::take(&mut self.b);
        Ok(b.finish(root))
    }

    fn resolve_jumps(&mut self) -> Result<(), FrontError> {
        for (node, table, name, line) in std::mem::take(&mut self.jumps) {
            match self.b.find_tag(table, &name, TagKind::Label) {
                Some(tag) => self.b.node_mut(node).tag = Some(tag),
                None => return err(format!("unknown label '{}'", name), line),
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Enclosed clauses
    // -------------------------------------------------------------------

    fn enclosed(&mut self) -> Result<NodeId, FrontError> {
        match self.peek().clone() {
            Tok::Bold(w) if w == "BEGIN" => {
                self.next();
                self.closed("END")
            }
            Tok::LParen => self.paren(),
            Tok::Bold(w) if w == "IF" => {
                self.next();
                self.conditional(true)
            }
            Tok::Bold(w) if w == "CASE" => {
                self.next();
                self.case_clause()
            }
            Tok::Bold(w)
                if matches!(w.as_str(), "FOR" | "FROM" | "BY" | "TO" | "DOWNTO" | "WHILE" | "DO") =>
            {
                self.loop_clause()
            }
            other => err(format!("expected an enclosed clause, found {:?}", other), self.line()),
        }
    }

    fn closed(&mut self, end: &str) -> Result<NodeId, FrontError> {
        let line = self.line();
        let table = self.b.new_table(Some(self.table()));
        self.scopes.push(table);
        let serial = self.serial(table, &[end], LastUnit::Keep)?;
        self.scopes.pop();
        self.expect_bold(end)?;
        let mode = self.b.node(serial).mode;
        let node = self.b.add_node(Attribute::ClosedClause, "", mode, table, line);
        self.b.adopt(node, &[serial]);
        Ok(node)
    }

    /// `( … )` is a parenthesised unit, a display, a brief conditional
    /// or a closed clause, decided by the separator that follows.
    fn paren(&mut self) -> Result<NodeId, FrontError> {
        let line = self.line();
        self.expect(Tok::LParen)?;
        if *self.peek() == Tok::RParen {
            // Empty display.
            self.next();
            let node =
                self.b.add_node(Attribute::CollateralClause, "", M_VOID, self.table(), line);
            return Ok(node);
        }
        // A declaration inside parens forces a closed clause.
        if self.looks_like_declaration() {
            return self.closed_from_paren(line, None);
        }
        let first = self.unit()?;
        match self.peek().clone() {
            Tok::RParen => {
                self.next();
                Ok(first)
            }
            Tok::Comma => {
                let mut items = vec![first];
                while *self.peek() == Tok::Comma {
                    self.next();
                    items.push(self.unit()?);
                }
                self.expect(Tok::RParen)?;
                self.display(items, line)
            }
            Tok::Bar => {
                self.next();
                self.brief_conditional(first, line)
            }
            Tok::Semicolon => self.closed_from_paren(line, Some(first)),
            other => err(format!("expected ',', '|', ';' or ')', found {:?}", other), self.line()),
        }
    }

    fn closed_from_paren(
        &mut self,
        line: u32,
        first: Option<NodeId>,
    ) -> Result<NodeId, FrontError> {
        // Reparse inside a fresh table as a serial clause up to ')'.
        let table = self.b.new_table(Some(self.table()));
        self.scopes.push(table);
        let serial = self.serial_with_first(table, first, &[")"], LastUnit::Keep)?;
        self.scopes.pop();
        self.expect(Tok::RParen)?;
        let mode = self.b.node(serial).mode;
        let node = self.b.add_node(Attribute::ClosedClause, "", mode, table, line);
        self.b.adopt(node, &[serial]);
        Ok(node)
    }

    fn display(&mut self, items: Vec<NodeId>, line: u32) -> Result<NodeId, FrontError> {
        // Unify element base modes into a row mode; a mixed display
        // stays VOID and is only legal as a transput argument pack.
        let mut elems = Vec::with_capacity(items.len());
        for it in &items {
            elems.push(self.value_of(*it)?);
        }
        let mode = if elems.is_empty() {
            M_VOID
        } else {
            let m0 = self.b.node(elems[0]).mode;
            if elems.iter().all(|&e| self.b.node(e).mode == m0) {
                match self.b.modes.def(m0).clone() {
                    ModeDef::Row { of, dims, .. } => self.b.modes.row(of, dims + 1, false),
                    _ => self.b.modes.row(m0, 1, false),
                }
            } else {
                M_VOID
            }
        };
        let node = self.b.add_node(Attribute::CollateralClause, "", mode, self.table(), line);
        self.b.adopt(node, &elems);
        Ok(node)
    }

    fn brief_conditional(&mut self, cond: NodeId, line: u32) -> Result<NodeId, FrontError> {
        // ( enquiry | then | else )
        let table = self.b.new_table(Some(self.table()));
        let cond = self.coerce(cond, M_BOOL)?;
        let enquiry_serial = self.wrap_serial(table, cond);
        let enquiry =
            self.b.add_node(Attribute::EnquiryClause, "", M_BOOL, table, line);
        self.b.adopt(enquiry, &[enquiry_serial]);

        self.scopes.push(table);
        let then_table = self.b.new_table(Some(table));
        self.scopes.push(then_table);
        let then_unit = self.unit()?;
        self.scopes.pop();
        let then_serial = self.wrap_serial(then_table, then_unit);
        let then_mode = self.b.node(then_serial).mode;
        let then_part = self.b.add_node(Attribute::ThenPart, "", then_mode, then_table, line);
        self.b.adopt(then_part, &[then_serial]);

        let mut children = vec![enquiry, then_part];
        let mut mode = then_mode;
        if *self.peek() == Tok::Bar {
            self.next();
            let else_table = self.b.new_table(Some(table));
            self.scopes.push(else_table);
            let else_unit = self.unit()?;
            self.scopes.pop();
            let else_serial = self.wrap_serial(else_table, else_unit);
            let else_mode = self.b.node(else_serial).mode;
            let else_part =
                self.b.add_node(Attribute::ElsePart, "", else_mode, else_table, line);
            self.b.adopt(else_part, &[else_serial]);
            children.push(else_part);
            if else_mode != mode {
                mode = M_VOID;
            }
        }
        self.scopes.pop();
        self.expect(Tok::RParen)?;
        let node = self.b.add_node(Attribute::ConditionalClause, "", mode, table, line);
        self.b.adopt(node, &children);
        Ok(node)
    }

    /// Wrap a single unit as a serial clause over `table`.
    fn wrap_serial(&mut self, table: u32, unit: NodeId) -> NodeId {
        let mode = self.b.node(unit).mode;
        let line = self.b.node(unit).line;
        let serial = self.b.add_node(Attribute::SerialClause, "", mode, table, line);
        self.b.adopt(serial, &[unit]);
        serial
    }

    fn conditional(&mut self, expect_fi: bool) -> Result<NodeId, FrontError> {
        let line = self.line();
        let table = self.b.new_table(Some(self.table()));
        self.scopes.push(table);
        let enquiry_serial = self.serial(table, &["THEN"], LastUnit::To(M_BOOL))?;
        self.expect_bold("THEN")?;
        let enquiry = self.b.add_node(Attribute::EnquiryClause, "", M_BOOL, table, line);
        self.b.adopt(enquiry, &[enquiry_serial]);

        let then_table = self.b.new_table(Some(table));
        self.scopes.push(then_table);
        let then_serial =
            self.serial(then_table, &["ELSE", "ELIF", "FI"], LastUnit::Keep)?;
        self.scopes.pop();
        let then_mode = self.b.node(then_serial).mode;
        let then_part = self.b.add_node(Attribute::ThenPart, "", then_mode, then_table, line);
        self.b.adopt(then_part, &[then_serial]);

        let mut children = vec![enquiry, then_part];
        let mut mode = then_mode;
        if self.eat_bold("ELSE") {
            let else_table = self.b.new_table(Some(table));
            self.scopes.push(else_table);
            let else_serial = self.serial(else_table, &["FI"], LastUnit::Keep)?;
            self.scopes.pop();
            let else_mode = self.b.node(else_serial).mode;
            let else_part =
                self.b.add_node(Attribute::ElsePart, "", else_mode, else_table, line);
            self.b.adopt(else_part, &[else_serial]);
            children.push(else_part);
            if else_mode != mode {
                mode = M_VOID;
            }
        } else if self.at_bold("ELIF") {
            self.next();
            // The nested conditional shares the one closing FI.
            let nested = self.conditional(false)?;
            let nested_mode = self.b.node(nested).mode;
            let else_part = self.b.add_node(
                Attribute::ElsePart,
                "",
                nested_mode,
                self.b.node(nested).table,
                line,
            );
            self.b.adopt(else_part, &[nested]);
            children.push(else_part);
            if nested_mode != mode {
                mode = M_VOID;
            }
        }
        self.scopes.pop();
        if expect_fi {
            self.expect_bold("FI")?;
        }
        let node = self.b.add_node(Attribute::ConditionalClause, "", mode, table, line);
        self.b.adopt(node, &children);
        Ok(node)
    }

    fn case_clause(&mut self) -> Result<NodeId, FrontError> {
        let line = self.line();
        let table = self.b.new_table(Some(self.table()));
        self.scopes.push(table);

        // Conformity when the first alternative is a specifier.
        let enquiry_last = LastUnit::Value;
        let enquiry_serial = self.serial(table, &["IN"], enquiry_last)?;
        self.expect_bold("IN")?;
        let enquiry_mode = self.b.node(enquiry_serial).mode;
        let enquiry = self.b.add_node(Attribute::EnquiryClause, "", enquiry_mode, table, line);
        self.b.adopt(enquiry, &[enquiry_serial]);

        let conformity = matches!(self.b.modes.def(enquiry_mode), ModeDef::Union { .. });
        let mut children = vec![enquiry];
        let mut mode: Option<ModeId> = None;

        if conformity {
            loop {
                let spec_line = self.line();
                self.expect(Tok::LParen)?;
                let smode = self.declarer()?.0;
                let ident = match self.peek().clone() {
                    Tok::Ident(name) => {
                        self.next();
                        Some(name)
                    }
                    _ => None,
                };
                self.expect(Tok::RParen)?;
                self.expect(Tok::Colon)?;

                let part_table = self.b.new_table(Some(table));
                let tag = ident.as_ref().map(|name| {
                    self.b.add_tag(part_table, name, TagKind::Identifier, smode)
                });
                self.scopes.push(part_table);
                let serial =
                    self.serial(part_table, &[",", "OUT", "ESAC"], LastUnit::Keep)?;
                self.scopes.pop();
                let spec =
                    self.b.add_node(Attribute::Specifier, ident.unwrap_or_default(), smode, part_table, spec_line);
                self.b.node_mut(spec).tag = tag;
                self.b.adopt(spec, &[serial]);
                let smode_yield = self.b.node(serial).mode;
                mode = Some(match mode {
                    None => smode_yield,
                    Some(m) if m == smode_yield => m,
                    _ => M_VOID,
                });
                children.push(spec);
                if *self.peek() == Tok::Comma {
                    self.next();
                    continue;
                }
                break;
            }
            self.finish_case(&mut children, &mut mode, table)?;
            self.scopes.pop();
            let node =
                self.b.add_node(Attribute::ConformityClause, "", mode.unwrap_or(M_VOID), table, line);
            self.b.adopt(node, &children);
            return Ok(node);
        }

        // Integer case: a unit list.
        loop {
            let part_line = self.line();
            let unit = self.unit()?;
            let umode = self.b.node(unit).mode;
            let part = self.b.add_node(Attribute::CasePart, "", umode, table, part_line);
            self.b.adopt(part, &[unit]);
            mode = Some(match mode {
                None => umode,
                Some(m) if m == umode => m,
                _ => M_VOID,
            });
            children.push(part);
            if *self.peek() == Tok::Comma {
                self.next();
                continue;
            }
            break;
        }
        self.finish_case(&mut children, &mut mode, table)?;
        self.scopes.pop();
        let node =
            self.b.add_node(Attribute::IntegerCaseClause, "", mode.unwrap_or(M_VOID), table, line);
        self.b.adopt(node, &children);
        Ok(node)
    }

    fn finish_case(
        &mut self,
        children: &mut Vec<NodeId>,
        mode: &mut Option<ModeId>,
        table: u32,
    ) -> Result<(), FrontError> {
        if self.eat_bold("OUT") {
            let line = self.line();
            let out_table = self.b.new_table(Some(table));
            self.scopes.push(out_table);
            let serial = self.serial(out_table, &["ESAC"], LastUnit::Keep)?;
            self.scopes.pop();
            let omode = self.b.node(serial).mode;
            let out = self.b.add_node(Attribute::OutPart, "", omode, out_table, line);
            self.b.adopt(out, &[serial]);
            if mode.map_or(false, |m| m != omode) {
                *mode = Some(M_VOID);
            }
            children.push(out);
        }
        self.expect_bold("ESAC")
    }

    fn loop_clause(&mut self) -> Result<NodeId, FrontError> {
        let line = self.line();
        let loop_table = self.b.new_table(Some(self.table()));
        self.scopes.push(loop_table);
        let mut children = Vec::new();

        if self.eat_bold("FOR") {
            let name = match self.next() {
                Tok::Ident(n) => n,
                other => return err(format!("expected a FOR identifier, found {:?}", other), line),
            };
            let tag = self.b.add_tag(loop_table, &name, TagKind::Identifier, M_INT);
            let def = self.b.add_node(Attribute::DefiningIdentifier, name, M_INT, loop_table, line);
            self.b.node_mut(def).tag = Some(tag);
            let part = self.b.add_node(Attribute::ForPart, "", M_INT, loop_table, line);
            self.b.adopt(part, &[def]);
            children.push(part);
        }
        for (kw, attr) in [("FROM", Attribute::FromPart), ("BY", Attribute::ByPart)] {
            if self.eat_bold(kw) {
                let unit = self.unit()?;
                let unit = self.coerce(unit, M_INT)?;
                let part = self.b.add_node(attr, "", M_INT, loop_table, line);
                self.b.adopt(part, &[unit]);
                children.push(part);
            }
        }
        if self.eat_bold("TO") {
            let unit = self.unit()?;
            let unit = self.coerce(unit, M_INT)?;
            let part = self.b.add_node(Attribute::ToPart, "", M_INT, loop_table, line);
            self.b.adopt(part, &[unit]);
            children.push(part);
        } else if self.eat_bold("DOWNTO") {
            let unit = self.unit()?;
            let unit = self.coerce(unit, M_INT)?;
            let part = self.b.add_node(Attribute::DowntoPart, "", M_INT, loop_table, line);
            self.b.adopt(part, &[unit]);
            children.push(part);
        }

        let body_table = self.b.new_table(Some(loop_table));
        if self.eat_bold("WHILE") {
            self.scopes.push(body_table);
            let serial = self.serial(body_table, &["DO"], LastUnit::To(M_BOOL))?;
            self.scopes.pop();
            let part = self.b.add_node(Attribute::WhilePart, "", M_BOOL, body_table, line);
            self.b.adopt(part, &[serial]);
            children.push(part);
        }
        self.expect_bold("DO")?;
        self.scopes.push(body_table);
        let do_serial = self.serial(body_table, &["OD", "UNTIL"], LastUnit::Void)?;
        self.scopes.pop();
        let do_part = self.b.add_node(Attribute::DoPart, "", M_VOID, body_table, line);
        self.b.adopt(do_part, &[do_serial]);
        children.push(do_part);

        if self.eat_bold("UNTIL") {
            self.scopes.push(body_table);
            let serial = self.serial(body_table, &["OD"], LastUnit::To(M_BOOL))?;
            self.scopes.pop();
            let part = self.b.add_node(Attribute::UntilPart, "", M_BOOL, body_table, line);
            self.b.adopt(part, &[serial]);
            children.push(part);
        }
        self.expect_bold("OD")?;
        self.scopes.pop();
        let node = self.b.add_node(Attribute::LoopClause, "", M_VOID, loop_table, line);
        self.b.adopt(node, &children);
        Ok(node)
    }

    // -------------------------------------------------------------------
    // Serial clauses
    // -------------------------------------------------------------------

    fn terminator(&self, terminators: &[&str]) -> bool {
        match self.peek() {
            Tok::Bold(w) => terminators.contains(&w.as_str()),
            Tok::RParen => terminators.contains(&")"),
            Tok::Comma => terminators.contains(&","),
            Tok::Eof => true,
            _ => false,
        }
    }

    fn serial(
        &mut self,
        table: u32,
        terminators: &[&str],
        last: LastUnit,
    ) -> Result<NodeId, FrontError> {
        self.serial_with_first(table, None, terminators, last)
    }

    fn serial_with_first(
        &mut self,
        table: u32,
        first: Option<NodeId>,
        terminators: &[&str],
        last: LastUnit,
    ) -> Result<NodeId, FrontError> {
        let line = self.line();
        let mut children: Vec<NodeId> = Vec::new();
        // (item, is_declaration) for the voiding pass.
        let mut units: Vec<(usize, bool)> = Vec::new();

        if let Some(f) = first {
            children.push(f);
            units.push((0, false));
            if *self.peek() == Tok::Semicolon {
                self.next();
            }
        }

        loop {
            if self.terminator(terminators) {
                break;
            }
            // Label?
            if let (Tok::Ident(name), Tok::Colon) = (self.peek().clone(), self.peek_at(1).clone()) {
                let name = name.clone();
                self.next();
                self.next();
                let tag = self.b.add_tag(table, &name, TagKind::Label, M_VOID);
                let label =
                    self.b.add_node(Attribute::Label, name, M_VOID, table, self.line());
                self.b.node_mut(label).tag = Some(tag);
                children.push(label);
                // Bind the label to the unit that follows it.
                let unit_index = children.len();
                if self.terminator(terminators) {
                    return err("a label must precede a unit", self.line());
                }
                let item = self.item(table)?;
                for it in item {
                    children.push(it);
                    units.push((children.len() - 1, self.is_declaration(children[children.len() - 1])));
                }
                self.b.tag_mut(tag).body = Some(children[unit_index]);
                self.b.table_mut(table).has_labels = true;
            } else {
                let item = self.item(table)?;
                for it in item {
                    children.push(it);
                    units.push((children.len() - 1, self.is_declaration(children[children.len() - 1])));
                }
            }
            if *self.peek() == Tok::Semicolon {
                self.next();
                continue;
            }
            if self.terminator(terminators) {
                break;
            }
            return err(format!("expected ';' or a terminator, found {:?}", self.peek()), self.line());
        }

        // Voiding pass: every unit except the last is voided; the last
        // is coerced per the caller's request.
        let n_units = units.len();
        let mut replaced: HashMap<NodeId, NodeId> = HashMap::new();
        for (k, (idx, is_decl)) in units.iter().enumerate() {
            let is_last = k + 1 == n_units;
            if *is_decl {
                continue;
            }
            let node = children[*idx];
            let node_mode = self.b.node(node).mode;
            if !is_last || last == LastUnit::Void {
                if node_mode != M_VOID {
                    let v =
                        self.b.add_node(Attribute::Voiding, "", M_VOID, table, self.b.node(node).line);
                    self.b.adopt(v, &[node]);
                    replaced.insert(node, v);
                    children[*idx] = v;
                }
            } else {
                let coerced = match last {
                    LastUnit::To(t) => self.coerce(node, t)?,
                    LastUnit::Value => self.value_of(node)?,
                    _ => node,
                };
                if coerced != node {
                    replaced.insert(node, coerced);
                }
                children[*idx] = coerced;
            }
        }
        // Labels keep pointing at the units the worklist will hold.
        for &c in &children {
            if self.b.node(c).attr == Attribute::Label {
                if let Some(tag) = self.b.node(c).tag {
                    if let Some(body) = self.b.tag(tag).body {
                        if let Some(&wrapped) = replaced.get(&body) {
                            self.b.tag_mut(tag).body = Some(wrapped);
                        }
                    }
                }
            }
        }

        let mode = match (last, units.last()) {
            (LastUnit::Void, _) | (_, None) => M_VOID,
            (_, Some((idx, is_decl))) => {
                if *is_decl {
                    M_VOID
                } else {
                    self.b.node(children[*idx]).mode
                }
            }
        };
        let serial = self.b.add_node(Attribute::SerialClause, "", mode, table, line);
        self.b.adopt(serial, &children);
        Ok(serial)
    }

    fn is_declaration(&self, n: NodeId) -> bool {
        matches!(
            self.b.node(n).attr,
            Attribute::IdentityDeclaration
                | Attribute::VariableDeclaration
                | Attribute::ProcedureDeclaration
                | Attribute::OperatorDeclaration
                | Attribute::ModeDeclaration
                | Attribute::PriorityDeclaration
        )
    }

    /// One serial item: a declaration (possibly a comma list) or a unit.
    fn item(&mut self, table: u32) -> Result<Vec<NodeId>, FrontError> {
        if self.looks_like_declaration() {
            return self.declaration(table);
        }
        Ok(vec![self.unit()?])
    }

    fn looks_like_declaration(&self) -> bool {
        match self.peek() {
            Tok::Bold(w) => match w.as_str() {
                "MODE" | "PRIO" | "OP" => true,
                "PROC" => self.proc_leads_to_declaration(),
                "LOC" | "HEAP" => self.declarer_follows(1),
                "INT" | "REAL" | "BOOL" | "CHAR" | "BITS" | "BYTES" | "COMPL" | "STRING"
                | "LONG" | "REF" | "FLEX" | "STRUCT" | "UNION" => self.declarer_follows(0),
                _ => false,
            },
            Tok::LBracket => true,
            Tok::Ident(name) => {
                // A declared MODE indicant.
                self.mode_aliases.contains_key(name)
                    && matches!(self.peek_at(1), Tok::Ident(_))
            }
            _ => false,
        }
    }

    /// `PROC f = …` and `PROC (…) yield p` declare; `PROC (…) yield :`
    /// is an anonymous routine text.
    fn proc_leads_to_declaration(&self) -> bool {
        if matches!(self.peek_at(1), Tok::Ident(_)) {
            return true;
        }
        let mut k = 1;
        if matches!(self.peek_at(k), Tok::LParen) {
            let mut depth = 0usize;
            loop {
                match self.peek_at(k) {
                    Tok::LParen => depth += 1,
                    Tok::RParen => {
                        depth -= 1;
                        if depth == 0 {
                            k += 1;
                            break;
                        }
                    }
                    Tok::Eof => return false,
                    _ => {}
                }
                k += 1;
            }
        }
        // Skip the yield declarer.
        loop {
            match self.peek_at(k) {
                Tok::Bold(_) => k += 1,
                Tok::Ident(_) => return true,
                Tok::Colon => return false,
                _ => return false,
            }
        }
    }

    /// Does a declarer starting at offset `k` lead into a defining
    /// identifier (a declaration) rather than a unit?
    fn declarer_follows(&self, mut k: usize) -> bool {
        // Walk over the declarer tokens conservatively.
        loop {
            match self.peek_at(k) {
                Tok::Bold(w)
                    if matches!(
                        w.as_str(),
                        "REF" | "FLEX" | "LONG" | "LOC" | "HEAP"
                    ) =>
                {
                    k += 1;
                }
                Tok::Bold(w)
                    if matches!(
                        w.as_str(),
                        "INT" | "REAL" | "BOOL" | "CHAR" | "BITS" | "BYTES" | "COMPL" | "STRING"
                    ) =>
                {
                    k += 1;
                    break;
                }
                Tok::LBracket => {
                    // Skip the bounds.
                    let mut depth = 0usize;
                    loop {
                        match self.peek_at(k) {
                            Tok::LBracket => depth += 1,
                            Tok::RBracket => {
                                depth -= 1;
                                if depth == 0 {
                                    k += 1;
                                    break;
                                }
                            }
                            Tok::Eof => return false,
                            _ => {}
                        }
                        k += 1;
                    }
                }
                Tok::Bold(w) if matches!(w.as_str(), "STRUCT" | "UNION" | "PROC") => return true,
                _ => return false,
            }
        }
        matches!(self.peek_at(k), Tok::Ident(_))
    }

    // -------------------------------------------------------------------
    // Declarers
    // -------------------------------------------------------------------

    /// Parse a declarer. Returns the mode and, for row declarers, the
    /// parsed bound units (lower, upper) per dimension.
    #[allow(clippy::type_complexity)]
    fn declarer(&mut self) -> Result<(ModeId, Vec<(NodeId, NodeId)>), FrontError> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Bold(w) => match w.as_str() {
                "INT" => {
                    self.next();
                    Ok((M_INT, Vec::new()))
                }
                "REAL" => {
                    self.next();
                    Ok((M_REAL, Vec::new()))
                }
                "BOOL" => {
                    self.next();
                    Ok((M_BOOL, Vec::new()))
                }
                "CHAR" => {
                    self.next();
                    Ok((M_CHAR, Vec::new()))
                }
                "BITS" => {
                    self.next();
                    Ok((M_BITS, Vec::new()))
                }
                "BYTES" => {
                    self.next();
                    Ok((crate::mode::M_BYTES, Vec::new()))
                }
                "COMPL" => {
                    self.next();
                    Ok((M_COMPLEX, Vec::new()))
                }
                "STRING" => {
                    self.next();
                    Ok((M_ROW_CHAR, Vec::new()))
                }
                "VOID" => {
                    self.next();
                    Ok((M_VOID, Vec::new()))
                }
                "LONG" => {
                    self.next();
                    match self.next() {
                        Tok::Bold(w2) if w2 == "INT" => Ok((crate::mode::M_LONG_INT, Vec::new())),
                        Tok::Bold(w2) if w2 == "REAL" => Ok((crate::mode::M_LONG_REAL, Vec::new())),
                        other => err(format!("expected INT or REAL after LONG, found {:?}", other), line),
                    }
                }
                "REF" => {
                    self.next();
                    let (of, _) = self.declarer()?;
                    Ok((self.b.modes.reference(of), Vec::new()))
                }
                "FLEX" => {
                    self.next();
                    let (inner, bounds) = self.declarer()?;
                    let flexed = match self.b.modes.def(inner).clone() {
                        ModeDef::Row { of, dims, .. } => {
                            self.b.modes.intern(ModeDef::Row { of, dims, flex: true })
                        }
                        _ => return err("FLEX needs a row declarer", line),
                    };
                    Ok((flexed, bounds))
                }
                "STRUCT" => {
                    self.next();
                    self.expect(Tok::LParen)?;
                    let mut fields = Vec::new();
                    loop {
                        let (fmode, _) = self.declarer()?;
                        loop {
                            match self.next() {
                                Tok::Ident(fname) => fields.push((fname, fmode)),
                                other => {
                                    return err(
                                        format!("expected a field name, found {:?}", other),
                                        line,
                                    )
                                }
                            }
                            if *self.peek() == Tok::Comma
                                && matches!(self.peek_at(1), Tok::Ident(_))
                                && !matches!(self.peek_at(2), Tok::Ident(_))
                            {
                                // Same-declarer field list: STRUCT (REAL re, im).
                                self.next();
                                continue;
                            }
                            break;
                        }
                        if *self.peek() == Tok::Comma {
                            self.next();
                            continue;
                        }
                        break;
                    }
                    self.expect(Tok::RParen)?;
                    Ok((self.b.modes.intern(ModeDef::Struct { fields }), Vec::new()))
                }
                "UNION" => {
                    self.next();
                    self.expect(Tok::LParen)?;
                    let mut members = Vec::new();
                    loop {
                        members.push(self.declarer()?.0);
                        if *self.peek() == Tok::Comma {
                            self.next();
                            continue;
                        }
                        break;
                    }
                    self.expect(Tok::RParen)?;
                    Ok((self.b.modes.intern(ModeDef::Union { members }), Vec::new()))
                }
                "PROC" => {
                    self.next();
                    let mut params = Vec::new();
                    if *self.peek() == Tok::LParen {
                        self.next();
                        loop {
                            params.push(self.declarer()?.0);
                            if *self.peek() == Tok::Comma {
                                self.next();
                                continue;
                            }
                            break;
                        }
                        self.expect(Tok::RParen)?;
                    }
                    let (yields, _) = self.declarer()?;
                    Ok((self.b.modes.procedure(params, yields), Vec::new()))
                }
                other => err(format!("expected a declarer, found {}", other), line),
            },
            Tok::LBracket => {
                // Row declarer with bounds: [1:3, 1:n] …  A bare [] (or
                // [,]) gives the dimensions without bounds.
                self.next();
                if matches!(self.peek(), Tok::RBracket | Tok::Comma) {
                    let mut dims = 1;
                    while *self.peek() == Tok::Comma {
                        self.next();
                        dims += 1;
                    }
                    self.expect(Tok::RBracket)?;
                    let (of, _) = self.declarer()?;
                    return Ok((self.b.modes.row(of, dims, false), Vec::new()));
                }
                let mut bounds = Vec::new();
                loop {
                    // A bound pair, or a single upper bound with an
                    // implicit lower bound of one.
                    let first = self.unit()?;
                    let first = self.coerce(first, M_INT)?;
                    if *self.peek() == Tok::Colon {
                        self.next();
                        let upper = self.unit()?;
                        let upper = self.coerce(upper, M_INT)?;
                        bounds.push((first, upper));
                    } else {
                        let one =
                            self.b.add_node(Attribute::Denotation, "1", M_INT, self.table(), self.line());
                        bounds.push((one, first));
                    }
                    if *self.peek() == Tok::Comma {
                        self.next();
                        continue;
                    }
                    break;
                }
                self.expect(Tok::RBracket)?;
                let (of, _) = self.declarer()?;
                let mode = self.b.modes.row(of, bounds.len() as u32, false);
                Ok((mode, bounds))
            }
            Tok::Ident(name) => match self.mode_aliases.get(&name).copied() {
                Some(m) => {
                    self.next();
                    Ok((m, Vec::new()))
                }
                None => err(format!("unknown mode indicant '{}'", name), line),
            },
            other => err(format!("expected a declarer, found {:?}", other), line),
        }
    }

    // -------------------------------------------------------------------
    // Declarations
    // -------------------------------------------------------------------

    fn declaration(&mut self, table: u32) -> Result<Vec<NodeId>, FrontError> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Bold(w) if w == "MODE" => {
                self.next();
                let name = match self.next() {
                    Tok::Ident(n) => n,
                    other => return err(format!("expected a mode name, found {:?}", other), line),
                };
                self.expect(Tok::Op("=".into()))?;
                let (mode, _) = self.declarer()?;
                self.mode_aliases.insert(name, mode);
                let node = self.b.add_node(Attribute::ModeDeclaration, "", M_VOID, table, line);
                Ok(vec![node])
            }
            Tok::Bold(w) if w == "PRIO" => {
                self.next();
                let name = match self.next() {
                    Tok::Bold(n) => n,
                    Tok::Op(n) => n,
                    other => return err(format!("expected an operator, found {:?}", other), line),
                };
                self.expect(Tok::Op("=".into()))?;
                let prio = match self.next() {
                    Tok::IntLit(n) => n.parse::<u8>().unwrap_or(7),
                    other => return err(format!("expected a priority, found {:?}", other), line),
                };
                self.priorities.insert(name, prio);
                let node = self.b.add_node(Attribute::PriorityDeclaration, "", M_VOID, table, line);
                Ok(vec![node])
            }
            Tok::Bold(w) if w == "OP" => {
                self.next();
                let name = match self.next() {
                    Tok::Bold(n) => n,
                    Tok::Op(n) => n,
                    other => return err(format!("expected an operator symbol, found {:?}", other), line),
                };
                self.expect(Tok::Op("=".into()))?;
                let routine = self.routine_text()?;
                let rmode = self.b.node(routine).mode;
                let tag = self.b.add_tag(table, &name, TagKind::Operator, rmode);
                self.b.tag_mut(tag).body = Some(routine);
                self.b.tag_mut(tag).proc_decl = true;
                let def =
                    self.b.add_node(Attribute::DefiningIdentifier, name, rmode, table, line);
                self.b.node_mut(def).tag = Some(tag);
                let node = self.b.add_node(Attribute::OperatorDeclaration, "", M_VOID, table, line);
                self.b.adopt(node, &[def, routine]);
                Ok(vec![node])
            }
            Tok::Bold(w) if w == "PROC" && matches!(self.peek_at(1), Tok::Ident(_)) => {
                self.next();
                let name = match self.next() {
                    Tok::Ident(n) => n,
                    other => return err(format!("expected a name, found {:?}", other), line),
                };
                self.expect(Tok::Op("=".into()))?;
                // Declare before the body so recursion resolves.
                let probe = self.pos;
                let rmode = self.routine_mode_probe()?;
                self.pos = probe;
                let tag = self.b.add_tag(table, &name, TagKind::Identifier, rmode);
                let routine = self.routine_text()?;
                self.b.tag_mut(tag).body = Some(routine);
                self.b.tag_mut(tag).proc_decl = true;
                let def = self.b.add_node(Attribute::DefiningIdentifier, name, rmode, table, line);
                self.b.node_mut(def).tag = Some(tag);
                let node =
                    self.b.add_node(Attribute::ProcedureDeclaration, "", M_VOID, table, line);
                self.b.adopt(node, &[def, routine]);
                Ok(vec![node])
            }
            _ => self.value_declarations(table),
        }
    }

    /// Identity and variable declarations, comma lists included:
    /// `INT a = 1, b = 2` / `[LOC|HEAP] INT i := 0, j`.
    fn value_declarations(&mut self, table: u32) -> Result<Vec<NodeId>, FrontError> {
        let line = self.line();
        let heap_gen = self.eat_bold("HEAP");
        if !heap_gen {
            self.eat_bold("LOC");
        }
        let (dmode, bounds) = self.declarer()?;
        let mut out = Vec::new();

        loop {
            let name = match self.next() {
                Tok::Ident(n) => n,
                other => return err(format!("expected a name, found {:?}", other), line),
            };
            if *self.peek() == Tok::Op("=".into()) {
                // Identity declaration.
                self.next();
                let tag = self.b.add_tag(table, &name, TagKind::Identifier, dmode);
                let def =
                    self.b.add_node(Attribute::DefiningIdentifier, name, dmode, table, line);
                self.b.node_mut(def).tag = Some(tag);
                let source = self.unit()?;
                let source = self.coerce(source, dmode)?;
                let node =
                    self.b.add_node(Attribute::IdentityDeclaration, "", M_VOID, table, line);
                self.b.adopt(node, &[def, source]);
                out.push(node);
            } else {
                // Variable declaration.
                let ref_mode = self.b.modes.reference(dmode);
                let tag = self.b.add_tag(table, &name, TagKind::Identifier, ref_mode);
                let def =
                    self.b.add_node(Attribute::DefiningIdentifier, name, ref_mode, table, line);
                self.b.node_mut(def).tag = Some(tag);
                let gen = self.generator_node(heap_gen, dmode, &bounds, line)?;
                let mut children = vec![def, gen];
                if *self.peek() == Tok::Becomes {
                    self.next();
                    let source = self.unit()?;
                    let source = self.coerce(source, dmode)?;
                    children.push(source);
                }
                let node =
                    self.b.add_node(Attribute::VariableDeclaration, "", M_VOID, table, line);
                self.b.adopt(node, &children);
                out.push(node);
            }
            if *self.peek() == Tok::Comma {
                self.next();
                continue;
            }
            break;
        }
        Ok(out)
    }

    fn generator_node(
        &mut self,
        heap_gen: bool,
        dmode: ModeId,
        bounds: &[(NodeId, NodeId)],
        line: u32,
    ) -> Result<NodeId, FrontError> {
        let attr = if heap_gen { Attribute::HeapGenerator } else { Attribute::LocGenerator };
        let ref_mode = self.b.modes.reference(dmode);
        let table = self.table();
        let gen = self.b.add_node(attr, "", ref_mode, table, line);
        if !heap_gen {
            // Anonymous storage carved from the frame.
            let anon = self.b.add_tag(table, "", TagKind::Anonymous, dmode);
            self.b.node_mut(gen).tag = Some(anon);
        }
        let mut pairs = Vec::with_capacity(bounds.len());
        for (lo, up) in bounds {
            let pair = self.b.add_node(Attribute::BoundPair, "", M_INT, table, line);
            self.b.adopt(pair, &[*lo, *up]);
            pairs.push(pair);
        }
        self.b.adopt(gen, &pairs);
        Ok(gen)
    }

    /// Probe the PROC mode of a routine text; the caller rewinds.
    fn routine_mode_probe(&mut self) -> Result<ModeId, FrontError> {
        let mut params = Vec::new();
        if *self.peek() == Tok::LParen {
            self.next();
            loop {
                let (pmode, _) = self.declarer()?;
                loop {
                    match self.next() {
                        Tok::Ident(_) => params.push(pmode),
                        other => {
                            return err(
                                format!("expected a parameter name, found {:?}", other),
                                self.line(),
                            )
                        }
                    }
                    // (INT a, b) shares the declarer.
                    if *self.peek() == Tok::Comma
                        && matches!(self.peek_at(1), Tok::Ident(_))
                        && matches!(self.peek_at(2), Tok::Comma | Tok::RParen)
                    {
                        self.next();
                        continue;
                    }
                    break;
                }
                if *self.peek() == Tok::Comma {
                    self.next();
                    continue;
                }
                break;
            }
            self.expect(Tok::RParen)?;
        }
        let (yields, _) = self.declarer()?;
        self.expect(Tok::Colon)?;
        Ok(self.b.modes.procedure(params, yields))
    }

    /// `( params ) yield : body`
    fn routine_text(&mut self) -> Result<NodeId, FrontError> {
        let line = self.line();
        let routine_table = self.b.new_table(Some(self.table()));
        let mut params: Vec<NodeId> = Vec::new();
        let mut param_modes = Vec::new();

        if *self.peek() == Tok::LParen {
            self.next();
            loop {
                let (pmode, _) = self.declarer()?;
                loop {
                    let pname = match self.next() {
                        Tok::Ident(n) => n,
                        other => {
                            return err(format!("expected a parameter name, found {:?}", other), line)
                        }
                    };
                    let tag = self.b.add_tag(routine_table, &pname, TagKind::Identifier, pmode);
                    let def = self.b.add_node(
                        Attribute::DefiningIdentifier,
                        pname,
                        pmode,
                        routine_table,
                        line,
                    );
                    self.b.node_mut(def).tag = Some(tag);
                    params.push(def);
                    param_modes.push(pmode);
                    // (INT a, b) shares the declarer when no new
                    // declarer follows the comma.
                    if *self.peek() == Tok::Comma
                        && matches!(self.peek_at(1), Tok::Ident(_))
                        && matches!(self.peek_at(2), Tok::Comma | Tok::RParen)
                    {
                        self.next();
                        continue;
                    }
                    break;
                }
                if *self.peek() == Tok::Comma {
                    self.next();
                    continue;
                }
                break;
            }
            self.expect(Tok::RParen)?;
        }
        let (yields, _) = self.declarer()?;
        self.expect(Tok::Colon)?;

        let mode = self.b.modes.procedure(param_modes, yields);
        self.scopes.push(routine_table);
        let body = self.unit()?;
        let body = if yields == M_VOID {
            let bmode = self.b.node(body).mode;
            if bmode != M_VOID {
                let v = self.b.add_node(Attribute::Voiding, "", M_VOID, routine_table, line);
                self.b.adopt(v, &[body]);
                v
            } else {
                body
            }
        } else {
            self.coerce(body, yields)?
        };
        self.scopes.pop();

        let node = self.b.add_node(Attribute::RoutineText, "", mode, routine_table, line);
        let mut children = params;
        children.push(body);
        self.b.adopt(node, &children);
        Ok(node)
    }

    // -------------------------------------------------------------------
    // Units
    // -------------------------------------------------------------------

    fn unit(&mut self) -> Result<NodeId, FrontError> {
        let lhs = self.formula(0)?;
        match self.peek().clone() {
            Tok::Becomes => {
                let line = self.line();
                self.next();
                let lmode = self.b.node(lhs).mode;
                let base = match self.b.modes.deref(lmode) {
                    Some(b) => b,
                    None => return err("destination of ':=' is not a name", line),
                };
                let source = self.unit()?;
                let source = self.coerce(source, base)?;
                let node =
                    self.b.add_node(Attribute::Assignation, "", lmode, self.table(), line);
                self.b.adopt(node, &[lhs, source]);
                Ok(node)
            }
            Tok::Bold(w) if w == "IS" || w == "ISNT" => {
                let line = self.line();
                self.next();
                let rhs = self.formula(0)?;
                let (lhs, rhs) = self.balance_names(lhs, rhs, line)?;
                let node =
                    self.b.add_node(Attribute::IdentityRelation, w, M_BOOL, self.table(), line);
                self.b.adopt(node, &[lhs, rhs]);
                Ok(node)
            }
            _ => Ok(lhs),
        }
    }

    fn dyadic_priority(&self, sym: &str) -> Option<u8> {
        if let Some(&p) = self.priorities.get(sym) {
            return Some(p);
        }
        Some(match sym {
            "ORF" => 1,
            "ANDF" => 1,
            "OR" => 2,
            "AND" => 3,
            "XOR" => 3,
            "=" | "/=" => 4,
            "<" | "<=" | ">" | ">=" => 5,
            "+" | "-" => 6,
            "*" | "/" | "OVER" | "MOD" | "ELEM" => 7,
            "**" => 8,
            _ => return None,
        })
    }

    fn peek_dyadic(&self) -> Option<String> {
        match self.peek() {
            Tok::Op(s) => Some(s.clone()),
            Tok::Bold(w)
                if matches!(
                    w.as_str(),
                    "AND" | "OR" | "XOR" | "OVER" | "MOD" | "ELEM" | "ANDF" | "ORF"
                ) || self.priorities.contains_key(w) =>
            {
                Some(w.clone())
            }
            _ => None,
        }
    }

    fn formula(&mut self, min_prio: u8) -> Result<NodeId, FrontError> {
        let mut lhs = self.monadic()?;
        while let Some(sym) = self.peek_dyadic() {
            let prio = match self.dyadic_priority(&sym) {
                Some(p) if p >= min_prio => p,
                _ => break,
            };
            let line = self.line();
            self.next();
            let rhs = self.formula(prio + 1)?;
            lhs = self.build_dyadic(&sym, lhs, rhs, line)?;
        }
        Ok(lhs)
    }

    fn build_dyadic(
        &mut self,
        sym: &str,
        lhs: NodeId,
        rhs: NodeId,
        line: u32,
    ) -> Result<NodeId, FrontError> {
        if sym == "ANDF" || sym == "ORF" {
            let lhs = self.coerce(lhs, M_BOOL)?;
            let rhs = self.coerce(rhs, M_BOOL)?;
            let attr =
                if sym == "ANDF" { Attribute::AndFunction } else { Attribute::OrFunction };
            let node = self.b.add_node(attr, sym, M_BOOL, self.table(), line);
            self.b.adopt(node, &[lhs, rhs]);
            return Ok(node);
        }

        // A visible user operator takes precedence over the standard
        // environ.
        if let Some(tag) = self.b.find_tag(self.table(), sym, TagKind::Operator) {
            let tmode = self.b.tag(tag).mode;
            if let ModeDef::Proc { params, yields } = self.b.modes.def(tmode).clone() {
                if params.len() == 2 {
                    let l = self.coerce(lhs, params[0]);
                    let r = self.coerce(rhs, params[1]);
                    if let (Ok(l), Ok(r)) = (l, r) {
                        let node =
                            self.b.add_node(Attribute::Formula, sym, yields, self.table(), line);
                        self.b.node_mut(node).tag = Some(tag);
                        self.b.adopt(node, &[l, r]);
                        return Ok(node);
                    }
                }
            }
        }

        let mut l = self.value_of(lhs)?;
        let mut r = self.value_of(rhs)?;
        // Balance INT against REAL.
        let (lm, rm) = (self.b.node(l).mode, self.b.node(r).mode);
        if lm == M_INT && rm == M_REAL {
            l = self.coerce(l, M_REAL)?;
        } else if lm == M_REAL && rm == M_INT {
            r = self.coerce(r, M_REAL)?;
        }
        let key = format!(
            "{}{}",
            self.b.modes.short_id(self.b.node(l).mode),
            self.b.modes.short_id(self.b.node(r).mode)
        );
        if stdenv::find_dyad(sym, &key).is_none() {
            return err(format!("no operator {} for operands '{}'", sym, key), line);
        }
        let mode = dyad_result(sym, &key, self.b.node(l).mode)
            .ok_or(FrontError { message: format!("no result mode for {} '{}'", sym, key), line })?;
        let node = self.b.add_node(Attribute::Formula, sym, mode, self.table(), line);
        self.b.adopt(node, &[l, r]);
        Ok(node)
    }

    fn monadic(&mut self) -> Result<NodeId, FrontError> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Op(s) if s == "-" || s == "+" => {
                self.next();
                if s == "+" {
                    return self.monadic();
                }
                let operand = self.monadic()?;
                let operand = self.value_of(operand)?;
                let key = self.b.modes.short_id(self.b.node(operand).mode).to_string();
                if stdenv::find_monad("-", &key).is_none() {
                    return err(format!("no monadic - for operand '{}'", key), line);
                }
                let mode = self.b.node(operand).mode;
                let node = self.b.add_node(Attribute::MonadicFormula, "-", mode, self.table(), line);
                self.b.adopt(node, &[operand]);
                Ok(node)
            }
            Tok::Bold(w)
                if matches!(
                    w.as_str(),
                    "NOT" | "ABS" | "ENTIER" | "ROUND" | "SIGN" | "ODD" | "REPR"
                ) =>
            {
                self.next();
                let operand = self.monadic()?;
                let operand = self.value_of(operand)?;
                let key = self.b.modes.short_id(self.b.node(operand).mode).to_string();
                if stdenv::find_monad(&w, &key).is_none() {
                    return err(format!("no operator {} for operand '{}'", w, key), line);
                }
                let mode = monad_result(&w, &key).ok_or(FrontError {
                    message: format!("no result mode for {} '{}'", w, key),
                    line,
                })?;
                let node =
                    self.b.add_node(Attribute::MonadicFormula, w, mode, self.table(), line);
                self.b.adopt(node, &[operand]);
                Ok(node)
            }
            Tok::Bold(w) if w == "GOTO" || w == "GO" => {
                self.next();
                if w == "GO" {
                    self.expect_bold("TO")?;
                }
                let name = match self.next() {
                    Tok::Ident(n) => n,
                    other => return err(format!("expected a label, found {:?}", other), line),
                };
                let node = self.b.add_node(Attribute::Jump, name.clone(), M_VOID, self.table(), line);
                self.jumps.push((node, self.table(), name, line));
                Ok(node)
            }
            Tok::Bold(w) if w == "ASSERT" => {
                self.next();
                let operand = self.formula(0)?;
                let operand = self.coerce(operand, M_BOOL)?;
                let node = self.b.add_node(Attribute::Assertion, "", M_VOID, self.table(), line);
                self.b.adopt(node, &[operand]);
                Ok(node)
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<NodeId, FrontError> {
        let mut p = self.primary()?;
        loop {
            match self.peek().clone() {
                Tok::LParen => {
                    p = self.call(p)?;
                }
                Tok::LBracket => {
                    p = self.slice(p)?;
                }
                _ => break,
            }
        }
        Ok(p)
    }

    fn call(&mut self, primary: NodeId) -> Result<NodeId, FrontError> {
        let line = self.line();
        // Deprocedure a name holding a PROC before calling it.
        let mut primary = primary;
        loop {
            let m = self.b.node(primary).mode;
            match self.b.modes.def(m) {
                ModeDef::Ref(_) => primary = self.deref_node(primary)?,
                _ => break,
            }
        }
        let pmode = self.b.node(primary).mode;
        let (params, yields) = match self.b.modes.def(pmode).clone() {
            ModeDef::Proc { params, yields } => (params, yields),
            _ => return err("call of a non-procedure", line),
        };
        let variadic = {
            let n = self.b.node(primary);
            n.attr == Attribute::Identifier
                && matches!(n.symbol.as_str(), "print" | "write" | "read")
        };

        self.expect(Tok::LParen)?;
        let mut args = Vec::new();
        if *self.peek() != Tok::RParen {
            loop {
                args.push(self.unit()?);
                if *self.peek() == Tok::Comma {
                    self.next();
                    continue;
                }
                break;
            }
        }
        self.expect(Tok::RParen)?;

        let coerced: Vec<NodeId> = if variadic {
            let mut out = Vec::new();
            for a in args {
                // A mixed display is an argument pack: splice it.
                let a_node = self.b.node(a);
                if a_node.attr == Attribute::CollateralClause && a_node.mode == M_VOID {
                    let kids: Vec<NodeId> = {
                        let mut v = Vec::new();
                        let mut cur = self.b.node(a).sub;
                        while let Some(c) = cur {
                            v.push(c);
                            cur = self.b.node(c).next;
                        }
                        v
                    };
                    for k in kids {
                        let k = self.value_of(k)?;
                        out.push(k);
                    }
                } else {
                    out.push(self.value_of(a)?);
                }
            }
            out
        } else {
            if args.len() > params.len() {
                return err(
                    format!("call with {} arguments for {} parameters", args.len(), params.len()),
                    line,
                );
            }
            let mut out = Vec::new();
            for (a, p) in args.iter().zip(params.iter()) {
                out.push(self.coerce(*a, *p)?);
            }
            out
        };

        // A call with fewer arguments than parameters yields a partially
        // parametrised PROC.
        let mode = if !variadic && coerced.len() < params.len() {
            self.b.modes.procedure(params[coerced.len()..].to_vec(), yields)
        } else {
            yields
        };
        let node = self.b.add_node(Attribute::Call, "", mode, self.table(), line);
        let mut children = vec![primary];
        children.extend(coerced);
        self.b.adopt(node, &children);
        Ok(node)
    }

    fn slice(&mut self, primary: NodeId) -> Result<NodeId, FrontError> {
        let line = self.line();
        let pmode = self.b.node(primary).mode;
        let (elem, dims, on_name) = match self.b.modes.deref(pmode) {
            Some(base) => match self.b.modes.row_of(base) {
                Some((e, d, _)) => (e, d, true),
                None => return err("subscripting a non-row name", line),
            },
            None => match self.b.modes.row_of(pmode) {
                Some((e, d, _)) => (e, d, false),
                None => return err("subscripting a non-row value", line),
            },
        };

        self.expect(Tok::LBracket)?;
        let mut indexers = Vec::new();
        let mut trims = 0u32;
        loop {
            // Trimmer or subscript.
            let has_lower = !matches!(self.peek(), Tok::Colon);
            let mut lower = None;
            if has_lower {
                let u = self.unit()?;
                lower = Some(self.coerce(u, M_INT)?);
            }
            if *self.peek() == Tok::Colon {
                self.next();
                let mut upper = None;
                if !matches!(self.peek(), Tok::Comma | Tok::RBracket | Tok::At) {
                    let u = self.unit()?;
                    upper = Some(self.coerce(u, M_INT)?);
                }
                let mut at = None;
                if *self.peek() == Tok::At {
                    self.next();
                    let u = self.unit()?;
                    at = Some(self.coerce(u, M_INT)?);
                }
                trims += 1;
                let trimmer =
                    self.b.add_node(Attribute::Trimmer, "", M_INT, self.table(), line);
                let mut parts = Vec::new();
                if let Some(lo) = lower {
                    let p = self.b.add_node(Attribute::TrimLower, "", M_INT, self.table(), line);
                    self.b.adopt(p, &[lo]);
                    parts.push(p);
                }
                if let Some(up) = upper {
                    let p = self.b.add_node(Attribute::TrimUpper, "", M_INT, self.table(), line);
                    self.b.adopt(p, &[up]);
                    parts.push(p);
                }
                if let Some(a) = at {
                    let p = self.b.add_node(Attribute::TrimAt, "", M_INT, self.table(), line);
                    self.b.adopt(p, &[a]);
                    parts.push(p);
                }
                self.b.adopt(trimmer, &parts);
                indexers.push(trimmer);
            } else {
                indexers.push(lower.expect("a subscript has a unit"));
            }
            if *self.peek() == Tok::Comma {
                self.next();
                continue;
            }
            break;
        }
        self.expect(Tok::RBracket)?;
        if indexers.len() as u32 != dims {
            return err(
                format!("{} subscripts for a rank-{} row", indexers.len(), dims),
                line,
            );
        }

        let result_base = if trims == 0 {
            elem
        } else {
            self.b.modes.row(elem, trims, false)
        };
        let mode =
            if on_name { self.b.modes.reference(result_base) } else { result_base };
        let node = self.b.add_node(Attribute::Slice, "", mode, self.table(), line);
        let mut children = vec![primary];
        children.extend(indexers);
        self.b.adopt(node, &children);
        Ok(node)
    }

    fn primary(&mut self) -> Result<NodeId, FrontError> {
        let line = self.line();
        match self.peek().clone() {
            Tok::IntLit(text) => {
                self.next();
                Ok(self.b.add_node(Attribute::Denotation, text, M_INT, self.table(), line))
            }
            Tok::RealLit(text) => {
                self.next();
                Ok(self.b.add_node(Attribute::Denotation, text, M_REAL, self.table(), line))
            }
            Tok::BitsLit(text) => {
                self.next();
                Ok(self.b.add_node(Attribute::Denotation, text, M_BITS, self.table(), line))
            }
            Tok::StrLit(text) => {
                self.next();
                let mode = if text.chars().count() == 1 { M_CHAR } else { M_ROW_CHAR };
                Ok(self.b.add_node(Attribute::Denotation, text, mode, self.table(), line))
            }
            Tok::Bold(w) if w == "TRUE" || w == "FALSE" => {
                self.next();
                Ok(self.b.add_node(Attribute::Denotation, w, M_BOOL, self.table(), line))
            }
            Tok::Bold(w) if w == "NIL" => {
                self.next();
                let mode = self.b.modes.reference(M_VOID);
                Ok(self.b.add_node(Attribute::Nihil, "NIL", mode, self.table(), line))
            }
            Tok::Bold(w) if w == "SKIP" => {
                self.next();
                Ok(self.b.add_node(Attribute::Skip, "SKIP", M_VOID, self.table(), line))
            }
            Tok::Bold(w) if w == "LOC" || w == "HEAP" => {
                self.next();
                let (dmode, bounds) = self.declarer()?;
                self.generator_node(w == "HEAP", dmode, &bounds, line)
            }
            Tok::Bold(w) if w == "PROC" => {
                // Anonymous routine text: PROC (INT n) INT: …
                self.next();
                self.routine_text()
            }
            Tok::Ident(name) => {
                // Field selection reads `field OF secondary`.
                if matches!(self.peek_at(1), Tok::Bold(w) if w == "OF") {
                    self.next();
                    self.next();
                    let secondary = self.postfix()?;
                    return self.selection(&name, secondary, line);
                }
                self.next();
                match self.b.find_tag(self.table(), &name, TagKind::Identifier) {
                    Some(tag) => {
                        let mode = self.b.tag(tag).mode;
                        let node =
                            self.b.add_node(Attribute::Identifier, name, mode, self.table(), line);
                        self.b.node_mut(node).tag = Some(tag);
                        Ok(node)
                    }
                    None => err(format!("unknown identifier '{}'", name), line),
                }
            }
            _ => self.enclosed(),
        }
    }

    fn selection(
        &mut self,
        field: &str,
        secondary: NodeId,
        line: u32,
    ) -> Result<NodeId, FrontError> {
        let smode = self.b.node(secondary).mode;
        if let Some(base) = self.b.modes.deref(smode) {
            if let Some((_, fmode)) = self.b.modes.field(base, field) {
                let mode = self.b.modes.reference(fmode);
                let node = self.b.add_node(Attribute::Selection, field, mode, self.table(), line);
                self.b.adopt(node, &[secondary]);
                return Ok(node);
            }
        }
        if let Some((_, fmode)) = self.b.modes.field(smode, field) {
            let node = self.b.add_node(Attribute::Selection, field, fmode, self.table(), line);
            self.b.adopt(node, &[secondary]);
            return Ok(node);
        }
        if let Some((elem, dims, _)) = self.b.modes.row_of(smode) {
            if let Some((_, fmode)) = self.b.modes.field(elem, field) {
                let mode = self.b.modes.row(fmode, dims, false);
                let node = self.b.add_node(Attribute::Selection, field, mode, self.table(), line);
                self.b.adopt(node, &[secondary]);
                return Ok(node);
            }
        }
        err(format!("no field '{}' in {}", field, self.b.modes.spell(smode)), line)
    }

    /// Identity relations compare names of one REF mode: the deeper
    /// side dereferences down to the other, and NIL adopts the
    /// resulting mode.
    fn balance_names(
        &mut self,
        mut lhs: NodeId,
        mut rhs: NodeId,
        line: u32,
    ) -> Result<(NodeId, NodeId), FrontError> {
        let depth = |p: &Parser, n: NodeId| {
            let mut d = 0;
            let mut m = p.b.node(n).mode;
            while let Some(inner) = p.b.modes.deref(m) {
                d += 1;
                m = inner;
            }
            d
        };
        let lhs_nil = self.b.node(lhs).attr == Attribute::Nihil;
        let rhs_nil = self.b.node(rhs).attr == Attribute::Nihil;
        if !lhs_nil && !rhs_nil {
            while depth(self, lhs) > depth(self, rhs).max(1) {
                lhs = self.deref_node(lhs)?;
            }
            while depth(self, rhs) > depth(self, lhs).max(1) {
                rhs = self.deref_node(rhs)?;
            }
        } else if lhs_nil && !rhs_nil {
            while depth(self, rhs) > 1 {
                rhs = self.deref_node(rhs)?;
            }
            let m = self.b.node(rhs).mode;
            self.b.node_mut(lhs).mode = m;
        } else if rhs_nil && !lhs_nil {
            while depth(self, lhs) > 1 {
                lhs = self.deref_node(lhs)?;
            }
            let m = self.b.node(lhs).mode;
            self.b.node_mut(rhs).mode = m;
        }
        if self.b.modes.deref(self.b.node(lhs).mode).is_none()
            || self.b.modes.deref(self.b.node(rhs).mode).is_none()
        {
            return err("identity relation needs names", line);
        }
        Ok((lhs, rhs))
    }

    // -------------------------------------------------------------------
    // Coercion insertion
    // -------------------------------------------------------------------

    fn deref_node(&mut self, n: NodeId) -> Result<NodeId, FrontError> {
        let m = self.b.node(n).mode;
        let base = self
            .b
            .modes
            .deref(m)
            .ok_or(FrontError { message: "dereferencing a non-name".into(), line: self.b.node(n).line })?;
        let node = self.b.add_node(
            Attribute::Dereferencing,
            "",
            base,
            self.b.node(n).table,
            self.b.node(n).line,
        );
        self.b.adopt(node, &[n]);
        Ok(node)
    }

    /// Dereference and deprocedure to a base value.
    fn value_of(&mut self, mut n: NodeId) -> Result<NodeId, FrontError> {
        loop {
            let m = self.b.node(n).mode;
            match self.b.modes.def(m).clone() {
                ModeDef::Ref(_) => n = self.deref_node(n)?,
                ModeDef::Proc { params, yields } if params.is_empty() && yields != M_VOID => {
                    // Only deprocedure applied identifiers; routine
                    // texts stay PROC values.
                    if matches!(self.b.node(n).attr, Attribute::Identifier | Attribute::Call) {
                        let node = self.b.add_node(
                            Attribute::Deproceduring,
                            "",
                            yields,
                            self.b.node(n).table,
                            self.b.node(n).line,
                        );
                        self.b.adopt(node, &[n]);
                        n = node;
                    } else {
                        return Ok(n);
                    }
                }
                _ => return Ok(n),
            }
        }
    }

    /// Insert the coercions that take `n` to `target`, or fail.
    fn coerce(&mut self, n: NodeId, target: ModeId) -> Result<NodeId, FrontError> {
        let line = self.b.node(n).line;
        // SKIP, NIL and empty displays adopt the required mode directly.
        match self.b.node(n).attr {
            Attribute::Skip => {
                self.b.node_mut(n).mode = target;
                return Ok(n);
            }
            Attribute::Nihil if self.b.modes.deref(target).is_some() => {
                self.b.node_mut(n).mode = target;
                return Ok(n);
            }
            Attribute::CollateralClause
                if self.b.node(n).sub.is_none()
                    && self.b.modes.row_of(target).is_some() =>
            {
                self.b.node_mut(n).mode = target;
                return Ok(n);
            }
            // A display doubles as a structure display when the target
            // mode's fields line up with its elements.
            Attribute::CollateralClause
                if matches!(self.b.modes.def(target), ModeDef::Struct { .. }) =>
            {
                let fields = match self.b.modes.def(target).clone() {
                    ModeDef::Struct { fields } => fields,
                    _ => unreachable!(),
                };
                let mut kids = Vec::new();
                let mut cur = self.b.node(n).sub;
                while let Some(c) = cur {
                    kids.push(c);
                    cur = self.b.node(c).next;
                }
                if kids.len() == fields.len() {
                    let mut coerced = Vec::with_capacity(kids.len());
                    for (k, (_, fmode)) in kids.iter().zip(&fields) {
                        coerced.push(self.coerce(*k, *fmode)?);
                    }
                    self.b.adopt(n, &coerced);
                    self.b.node_mut(n).mode = target;
                    return Ok(n);
                }
            }
            _ => {}
        }

        let mut cur = n;
        for _ in 0..8 {
            let m = self.b.node(cur).mode;
            if m == target {
                return Ok(cur);
            }
            // Uniting.
            if self.b.modes.union_accepts(target, m) {
                let node = self.b.add_node(Attribute::Uniting, "", target, self.b.node(cur).table, line);
                self.b.adopt(node, &[cur]);
                return Ok(node);
            }
            // Widening.
            let widened = match (self.b.modes.def(m).clone(), self.b.modes.def(target).clone()) {
                (ModeDef::Int, ModeDef::Real)
                | (ModeDef::Int, ModeDef::LongInt)
                | (ModeDef::Real, ModeDef::LongReal)
                | (ModeDef::Real, ModeDef::Complex) => true,
                (ModeDef::Int, ModeDef::LongReal) | (ModeDef::Int, ModeDef::Complex) => {
                    // Two steps through REAL.
                    let mid = self.b.add_node(Attribute::Widening, "", M_REAL, self.b.node(cur).table, line);
                    self.b.adopt(mid, &[cur]);
                    cur = mid;
                    continue;
                }
                (ModeDef::Bits, ModeDef::Row { of, .. }) if of == M_BOOL => true,
                (ModeDef::Bytes, ModeDef::Row { of, .. }) if of == M_CHAR => true,
                _ => false,
            };
            if widened {
                let node = self.b.add_node(Attribute::Widening, "", target, self.b.node(cur).table, line);
                self.b.adopt(node, &[cur]);
                return Ok(node);
            }
            // Rowing.
            if let Some((elem, dims, _)) = self.b.modes.row_of(target) {
                let rowable = m == elem
                    || matches!(self.b.modes.row_of(m), Some((e, d, _)) if e == elem && d + 1 == dims)
                    || (dims == 1 && m == M_CHAR && elem == M_CHAR);
                if rowable {
                    let node =
                        self.b.add_node(Attribute::Rowing, "", target, self.b.node(cur).table, line);
                    self.b.adopt(node, &[cur]);
                    return Ok(node);
                }
            }
            // Dereferencing.
            if self.b.modes.deref(m).is_some() {
                cur = self.deref_node(cur)?;
                continue;
            }
            // Deproceduring.
            if let ModeDef::Proc { params, yields } = self.b.modes.def(m).clone() {
                if params.is_empty() {
                    let node = self.b.add_node(
                        Attribute::Deproceduring,
                        "",
                        yields,
                        self.b.node(cur).table,
                        line,
                    );
                    self.b.adopt(node, &[cur]);
                    cur = node;
                    continue;
                }
            }
            break;
        }
        err(
            format!(
                "cannot coerce {} to {}",
                self.b.modes.spell(self.b.node(cur).mode),
                self.b.modes.spell(target)
            ),
            line,
        )
    }
}

// ---------------------------------------------------------------------------
// Result modes
// ---------------------------------------------------------------------------

fn dyad_result(sym: &str, key: &str, operand: ModeId) -> Option<ModeId> {
    Some(match (sym, key) {
        ("+" | "-" | "*" | "OVER" | "MOD" | "**", "ii") => M_INT,
        ("/", "ii") => M_REAL,
        ("+" | "-" | "*" | "/", "rr") => M_REAL,
        ("+" | "-" | "*", "zz") => M_COMPLEX,
        ("=" | "/=" | "<" | "<=" | ">" | ">=", _) => M_BOOL,
        ("AND" | "OR", "bb") => M_BOOL,
        ("AND" | "OR" | "XOR", "ww") => M_BITS,
        _ => {
            let _ = operand;
            return None;
        }
    })
}

fn monad_result(sym: &str, key: &str) -> Option<ModeId> {
    Some(match (sym, key) {
        ("-", "i") => M_INT,
        ("-", "r") => M_REAL,
        ("-", "z") => M_COMPLEX,
        ("ABS", "i") => M_INT,
        ("ABS", "r") => M_REAL,
        ("ABS", "c") => M_INT,
        ("NOT", "b") => M_BOOL,
        ("NOT", "w") => M_BITS,
        ("ENTIER" | "ROUND", "r") => M_INT,
        ("SIGN", "i") => M_INT,
        ("ODD", "i") => M_BOOL,
        ("REPR", "i") => M_CHAR,
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Standard environ tags
// ---------------------------------------------------------------------------

fn install_standenv(b: &mut TreeBuilder, table: u32) {
    for (i, entry) in stdenv::PROCS.iter().enumerate() {
        let mode = match entry.name {
            "print" | "write" | "read" => b.modes.procedure(vec![], M_VOID),
            "new line" => b.modes.procedure(vec![], M_VOID),
            "sqrt" | "exp" | "ln" | "sin" | "cos" | "tan" | "arctan" => {
                b.modes.procedure(vec![M_REAL], M_REAL)
            }
            "random" => b.modes.procedure(vec![], M_REAL),
            "re" | "im" => b.modes.procedure(vec![M_COMPLEX], M_REAL),
            "max int" => M_INT,
            "max real" | "small real" | "pi" => M_REAL,
            _ => M_VOID,
        };
        let tag = b.add_tag(table, entry.name, TagKind::Identifier, mode);
        b.tag_mut(tag).stand = Some(i as u32);
        b.tag_mut(tag).constant = stdenv::is_constant_entry(i as u32);
    }
}
