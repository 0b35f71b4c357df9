/// Interactive monitor.
///
/// Entered when the current node carries a breakpoint mask, when a step
/// boundary is reached, or when a runtime error occurs under `--debug`.
/// Commands are case-insensitive and prefix-abbreviated; EOF at the
/// prompt is `exit`. The expression evaluator is a small Pratt parser
/// over the same lexer, tag tables, mode system and runtime the
/// interpreter uses, scoped to the frame chain rooted at the selected
/// activation.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use colored::Colorize;
use tracing::debug;

use crate::errors::{Exec, GenieError, Irq};
use crate::front::{lex, Tok};
use crate::genie::Genie;
use crate::mode::{ModeId, M_BOOL, M_INT, M_REAL, M_CHAR};
use crate::stdenv;
use crate::tree::{NodeId, Status, TagKind, TagRef};
use crate::value::{Name, Target, Value};

pub struct MonitorState {
    pub input: Option<Box<dyn BufRead>>,
    /// Conditional breakpoints, keyed by source line.
    pub conditions: HashMap<u32, Option<String>>,
    pub watch: Option<String>,
    /// `next` stops only at or above this frame depth.
    pub next_depth_bound: Option<usize>,
    /// `finish` stops once the frame stack shrinks to this depth.
    pub finish_depth: Option<usize>,
    pub cur_frame: usize,
    /// Display limit for stowed values (`elems N`).
    pub elems_limit: usize,
    pub active: bool,
}

impl MonitorState {
    pub fn new() -> Self {
        MonitorState {
            input: None,
            conditions: HashMap::new(),
            watch: None,
            next_depth_bound: None,
            finish_depth: None,
            cur_frame: 0,
            elems_limit: 24,
            active: false,
        }
    }

    /// Scripted input for tests and `--monitor-script`.
    pub fn set_input(&mut self, input: Box<dyn BufRead>) {
        self.input = Some(input);
    }

    pub fn watch_armed(&self) -> bool {
        self.watch.is_some() && !self.active
    }

    /// Non-mask stop conditions checked at every node.
    pub fn wants_stop(&self, st: &Status, depth: usize) -> bool {
        if self.active {
            return false;
        }
        match self.finish_depth {
            Some(d) => st.contains(Status::INTERRUPTIBLE) && depth <= d,
            None => false,
        }
    }
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::new()
    }
}

fn mon_write(g: &mut Genie, text: &str) {
    let _ = g.out.write_all(text.as_bytes());
}

fn mon_line(g: &mut Genie, text: &str) {
    mon_write(g, text);
    mon_write(g, "\n");
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn enter(g: &mut Genie, n: NodeId) -> Exec {
    if g.monitor.active {
        return Ok(());
    }
    let st = g.info.status(n);
    let line = g.tree.node(n).line;

    // A temporary hit below the `next` bound keeps running.
    if st.contains(Status::BREAKPOINT_TEMPORARY)
        && !st.intersects(Status::BREAK_MASK.difference(Status::BREAKPOINT_TEMPORARY))
    {
        if let Some(bound) = g.monitor.next_depth_bound {
            if g.frames.depth() > bound {
                return Ok(());
            }
        }
    }

    // Conditional breakpoints evaluate their stored source fragment.
    if st.contains(Status::BREAKPOINT) {
        if let Some(Some(cond)) = g.monitor.conditions.get(&line).cloned() {
            match eval_condition(g, &cond) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) if condition_is_broken(&e) => {
                    clear_line_breakpoint(g, line);
                    g.monitor.conditions.remove(&line);
                    mon_line(
                        g,
                        &format!(
                            "warning: breakpoint condition '{}' does not yield BOOL; breakpoint removed",
                            cond
                        ),
                    );
                    return Ok(());
                }
                // Transient evaluation failures keep running.
                Err(_) => return Ok(()),
            }
        }
    }

    clear_temporaries(g);
    g.monitor.next_depth_bound = None;
    g.monitor.finish_depth = None;
    g.monitor.cur_frame = g.frames.top_number();
    debug!(line, "monitor entered");
    let loc = format!("stopped at line {}", line);
    mon_line(g, &loc.bold().to_string());
    show_source_line(g, line);
    command_loop(g, n)
}

/// Runtime error under `--debug`: the monitor is re-entered at the
/// failing node.
pub fn enter_on_error(g: &mut Genie, n: NodeId, error: &GenieError) -> Exec {
    if g.monitor.active {
        return Ok(());
    }
    g.monitor.cur_frame = g.frames.top_number().min(g.frames.depth().saturating_sub(1));
    let line = g.tree.node(n).line;
    mon_line(
        g,
        &format!("{} at line {}: {}", "runtime error".red().bold(), line, error),
    );
    show_source_line(g, line);
    command_loop(g, n)
}

/// The armed watchpoint, re-checked at every interruptible node.
pub fn check_watch(g: &mut Genie, n: NodeId) -> Exec {
    let cond = match g.monitor.watch.clone() {
        Some(c) => c,
        None => return Ok(()),
    };
    match eval_condition(g, &cond) {
        Ok(true) => {
            mon_line(g, &format!("watchpoint '{}' holds", cond));
            enter(g, n)
        }
        Ok(false) => Ok(()),
        Err(e) if condition_is_broken(&e) => {
            g.monitor.watch = None;
            mon_line(
                g,
                &format!("warning: watch condition '{}' does not yield BOOL; watchpoint removed", cond),
            );
            Ok(())
        }
        // Not decidable yet (an operand is still uninitialised).
        Err(_) => Ok(()),
    }
}

/// Static failures invalidate the stored fragment; runtime failures are
/// transient.
fn condition_is_broken(e: &GenieError) -> bool {
    matches!(
        e,
        GenieError::UnparsableExpression { .. }
            | GenieError::UnknownIdentifier { .. }
            | GenieError::InvalidBreakpointExpression { .. }
    )
}

fn eval_condition(g: &mut Genie, cond: &str) -> Result<bool, GenieError> {
    g.monitor.active = true;
    let frame = g.frames.top_number();
    let out = evaluate_text(g, frame, cond);
    g.monitor.active = false;
    match out? {
        (slots, mode) if mode == M_BOOL => match slots.first() {
            Some(Value::Bool(b)) => Ok(*b),
            _ => Err(GenieError::InvalidBreakpointExpression { text: cond.to_string() }),
        },
        _ => Err(GenieError::InvalidBreakpointExpression { text: cond.to_string() }),
    }
}

// ---------------------------------------------------------------------------
// The command loop
// ---------------------------------------------------------------------------

fn read_command(g: &mut Genie) -> Option<String> {
    let prompt = g.conf.prompt.clone();
    mon_write(g, &prompt);
    let _ = g.out.flush();
    let mut line = String::new();
    let n = match g.monitor.input.as_mut() {
        Some(input) => input.read_line(&mut line).ok()?,
        None => std::io::stdin().lock().read_line(&mut line).ok()?,
    };
    if n == 0 {
        return None;
    }
    Some(line.trim().to_string())
}

fn command_loop(g: &mut Genie, n: NodeId) -> Exec {
    g.monitor.active = true;
    let out = command_loop_inner(g, n);
    g.monitor.active = false;
    out
}

fn command_loop_inner(g: &mut Genie, n: NodeId) -> Exec {
    loop {
        let line = match read_command(g) {
            // EOF at the prompt is exit.
            None => return Err(Irq::Stop { status: 0, force: true }),
            Some(l) => l,
        };
        if line.is_empty() {
            continue;
        }
        let (cmd, rest) = split_command(&line);
        match dispatch(g, n, &cmd, rest)? {
            Flow::Stay => {}
            Flow::Resume => return Ok(()),
        }
    }
}

fn split_command(line: &str) -> (String, &str) {
    let trimmed = line.trim_start();
    match trimmed.find(char::is_whitespace) {
        Some(i) => (trimmed[..i].to_lowercase(), trimmed[i..].trim_start()),
        None => (trimmed.to_lowercase(), ""),
    }
}

enum Flow {
    Stay,
    Resume,
}

/// Canonical command spellings, matched exact-first then by prefix.
const COMMANDS: &[&str] = &[
    "help", "apropos", "info", "breakpoint", "calls", "continue", "resume", "do", "exec",
    "elems", "evaluate", "x", "examine", "exit", "quit", "hx", "finish", "out", "frame",
    "heap", "ht", "rt", "link", "list", "next", "prompt", "rerun", "restart", "reset",
    "sizes", "stack", "bt", "step", "until", "where", "xref",
];

fn resolve_command(word: &str) -> Option<&'static str> {
    if let Some(&c) = COMMANDS.iter().find(|&&c| c == word) {
        return Some(c);
    }
    COMMANDS.iter().find(|&&c| c.starts_with(word)).copied()
}

fn dispatch(g: &mut Genie, n: NodeId, cmd: &str, rest: &str) -> Exec<Flow> {
    let canonical = match resolve_command(cmd) {
        Some(c) => c,
        None => {
            mon_line(g, &format!("unknown command '{}'; try help", cmd));
            return Ok(Flow::Stay);
        }
    };
    match canonical {
        "help" | "apropos" | "info" => {
            cmd_help(g, rest);
            Ok(Flow::Stay)
        }
        "breakpoint" => {
            cmd_breakpoint(g, rest);
            Ok(Flow::Stay)
        }
        "calls" => {
            cmd_calls(g, rest.parse().unwrap_or(usize::MAX));
            Ok(Flow::Stay)
        }
        "continue" | "resume" => Ok(Flow::Resume),
        "do" | "exec" => {
            cmd_do(g, rest);
            Ok(Flow::Stay)
        }
        "elems" => {
            if let Ok(k) = rest.parse() {
                g.monitor.elems_limit = k;
            }
            let text = format!("stowed display limit is {}", g.monitor.elems_limit);
            mon_line(g, &text);
            Ok(Flow::Stay)
        }
        "evaluate" | "x" => {
            cmd_evaluate(g, rest);
            Ok(Flow::Stay)
        }
        "examine" => {
            cmd_examine(g, rest);
            Ok(Flow::Stay)
        }
        // A force-quit differentiates user-requested termination.
        "exit" | "quit" | "hx" => Err(Irq::Stop { status: 0, force: true }),
        "finish" | "out" => {
            g.monitor.finish_depth = Some(g.frames.depth().saturating_sub(1));
            Ok(Flow::Resume)
        }
        "frame" => {
            cmd_frame(g, rest);
            Ok(Flow::Stay)
        }
        "heap" => {
            cmd_heap(g, rest.parse().unwrap_or(8));
            Ok(Flow::Stay)
        }
        "ht" => {
            g.echo = false;
            mon_line(g, "transput halted");
            Ok(Flow::Stay)
        }
        "rt" => {
            g.echo = true;
            mon_line(g, "transput resumed");
            Ok(Flow::Stay)
        }
        "link" => {
            cmd_link(g, rest.parse().unwrap_or(usize::MAX));
            Ok(Flow::Stay)
        }
        "list" => {
            cmd_list(g, n, rest);
            Ok(Flow::Stay)
        }
        "next" => {
            arm_temporaries(g);
            g.monitor.next_depth_bound = Some(g.frames.depth());
            Ok(Flow::Resume)
        }
        "prompt" => {
            let p = rest.trim().trim_matches('"');
            if !p.is_empty() {
                g.conf.prompt = format!("{} ", p.trim_end());
            }
            Ok(Flow::Stay)
        }
        "rerun" | "restart" => Err(Irq::Rerun),
        "reset" => {
            clear_all_breakpoints(g);
            g.monitor.watch = None;
            mon_line(g, "all breakpoints and the watchpoint cleared");
            Ok(Flow::Stay)
        }
        "sizes" => {
            cmd_sizes(g);
            Ok(Flow::Stay)
        }
        "stack" | "bt" => {
            cmd_stack(g, rest.parse().unwrap_or(usize::MAX));
            Ok(Flow::Stay)
        }
        "step" => {
            arm_temporaries(g);
            Ok(Flow::Resume)
        }
        "until" => match rest.parse::<u32>() {
            Ok(line) => {
                arm_line_temporaries(g, line);
                Ok(Flow::Resume)
            }
            Err(_) => {
                mon_line(g, "until needs a line number");
                Ok(Flow::Stay)
            }
        },
        "where" => {
            let line = g.tree.node(n).line;
            mon_line(g, &format!("at line {}", line));
            show_source_line(g, line);
            Ok(Flow::Stay)
        }
        "xref" => {
            cmd_xref(g, rest);
            Ok(Flow::Stay)
        }
        _ => Ok(Flow::Stay),
    }
}

// ---------------------------------------------------------------------------
// Breakpoints and stepping
// ---------------------------------------------------------------------------

pub fn set_line_breakpoint(g: &mut Genie, line: u32, condition: Option<String>) -> usize {
    let mut hits = 0;
    for i in 0..g.info.node_count() {
        let id = NodeId(i as u32);
        if g.tree.node(id).line == line && g.info.status(id).contains(Status::INTERRUPTIBLE) {
            g.info.set_status(id, Status::BREAKPOINT);
            hits += 1;
        }
    }
    if hits > 0 {
        g.monitor.conditions.insert(line, condition);
    }
    hits
}

fn clear_line_breakpoint(g: &mut Genie, line: u32) {
    for i in 0..g.info.node_count() {
        let id = NodeId(i as u32);
        if g.tree.node(id).line == line {
            g.info.clear_status(id, Status::BREAKPOINT);
        }
    }
    g.monitor.conditions.remove(&line);
}

fn clear_all_breakpoints(g: &mut Genie) {
    for i in 0..g.info.node_count() {
        g.info.clear_status(
            NodeId(i as u32),
            Status::BREAKPOINT.union(Status::BREAKPOINT_TEMPORARY),
        );
    }
    g.monitor.conditions.clear();
}

/// `step` arms a temporary breakpoint on every interruptible unit.
fn arm_temporaries(g: &mut Genie) {
    for i in 0..g.info.node_count() {
        let id = NodeId(i as u32);
        if g.info.status(id).contains(Status::INTERRUPTIBLE) {
            g.info.set_status(id, Status::BREAKPOINT_TEMPORARY);
        }
    }
}

fn arm_line_temporaries(g: &mut Genie, line: u32) {
    for i in 0..g.info.node_count() {
        let id = NodeId(i as u32);
        if g.tree.node(id).line == line && g.info.status(id).contains(Status::INTERRUPTIBLE) {
            g.info.set_status(id, Status::BREAKPOINT_TEMPORARY);
        }
    }
}

fn clear_temporaries(g: &mut Genie) {
    for i in 0..g.info.node_count() {
        g.info.clear_status(NodeId(i as u32), Status::BREAKPOINT_TEMPORARY);
    }
}

fn cmd_breakpoint(g: &mut Genie, rest: &str) {
    let rest = rest.trim();
    if rest.is_empty() || rest.eq_ignore_ascii_case("list") {
        let lines: Vec<u32> = g.monitor.conditions.keys().copied().collect();
        if lines.is_empty() && g.monitor.watch.is_none() {
            mon_line(g, "no breakpoints set");
        }
        for line in lines {
            let cond = g.monitor.conditions.get(&line).cloned().flatten();
            match cond {
                Some(c) => mon_line(g, &format!("breakpoint at line {} if {}", line, c)),
                None => mon_line(g, &format!("breakpoint at line {}", line)),
            }
        }
        if let Some(w) = g.monitor.watch.clone() {
            mon_line(g, &format!("watchpoint: {}", w));
        }
        return;
    }
    if let Some(expr) = rest.strip_prefix("watch ") {
        g.monitor.watch = Some(expr.trim().to_string());
        mon_line(g, "watchpoint armed");
        return;
    }
    if let Some(what) = rest.strip_prefix("clear") {
        match what.trim() {
            "watchpoint" => g.monitor.watch = None,
            "breakpoints" => clear_all_breakpoints(g),
            _ => {
                clear_all_breakpoints(g);
                g.monitor.watch = None;
            }
        }
        mon_line(g, "cleared");
        return;
    }
    let mut parts = rest.splitn(2, ' ');
    let line: u32 = match parts.next().and_then(|w| w.parse().ok()) {
        Some(l) => l,
        None => {
            mon_line(g, "breakpoint needs a line number");
            return;
        }
    };
    match parts.next().map(str::trim) {
        Some("clear") => {
            clear_line_breakpoint(g, line);
            mon_line(g, &format!("breakpoint at line {} cleared", line));
        }
        Some(cond) if cond.starts_with("if ") => {
            let c = cond[3..].trim().to_string();
            let hits = set_line_breakpoint(g, line, Some(c));
            mon_line(g, &format!("conditional breakpoint on {} unit(s) at line {}", hits, line));
        }
        _ => {
            let hits = set_line_breakpoint(g, line, None);
            mon_line(g, &format!("breakpoint on {} unit(s) at line {}", hits, line));
        }
    }
}

// ---------------------------------------------------------------------------
// Inspection commands
// ---------------------------------------------------------------------------

fn show_source_line(g: &mut Genie, line: u32) {
    if line >= 1 {
        if let Some(text) = g.tree.source.get(line as usize - 1).cloned() {
            mon_line(g, &format!("{:>5} {}", line, text));
        }
    }
}

fn cmd_help(g: &mut Genie, topic: &str) {
    if !topic.is_empty() {
        if let Some(c) = resolve_command(&topic.to_lowercase()) {
            mon_line(g, &format!("{} — see the monitor summary (help)", c));
            return;
        }
    }
    mon_line(g, "monitor commands (prefix-abbreviated, case-insensitive):");
    mon_line(g, "  breakpoint N [if EXPR | clear] | breakpoint list|watch EXPR|clear");
    mon_line(g, "  calls [N]   continue|resume   do|exec CMD      elems N");
    mon_line(g, "  evaluate EXPR | x EXPR         examine NAME    exit|quit|hx");
    mon_line(g, "  finish|out  frame [N]  heap [N]  ht|rt  link [N]  list [N [M]]");
    mon_line(g, "  next  prompt \"STR\"  rerun|restart  reset  sizes  stack|bt [N]");
    mon_line(g, "  step  until N  where  xref [N]");
}

fn cmd_list(g: &mut Genie, n: NodeId, rest: &str) {
    let cur = g.tree.node(n).line as i64;
    let mut parts = rest.split_whitespace();
    let from = parts.next().and_then(|w| w.parse::<i64>().ok()).unwrap_or((cur - 4).max(1));
    let to = parts.next().and_then(|w| w.parse::<i64>().ok()).unwrap_or(from + 9);
    for line in from..=to {
        if line >= 1 && (line as usize) <= g.tree.source.len() {
            show_source_line(g, line as u32);
        }
    }
}

fn cmd_stack(g: &mut Genie, limit: usize) {
    let mut cur = Some(g.frames.top_number());
    let mut shown = 0;
    while let Some(fno) = cur {
        if g.frames.is_empty() || shown >= limit {
            break;
        }
        let f = g.frames.frame(fno);
        let next = f.dynamic_link;
        let line = g.tree.node(f.node).line;
        let marker = if fno == g.monitor.cur_frame { "*" } else { " " };
        let text = format!(
            "{}#{:<3} level {:<2} line {:<4} {}{}",
            marker,
            f.number,
            f.level,
            line,
            if f.proc_frame { "procedure " } else { "" },
            if f.jump_capable { "(labels)" } else { "" },
        );
        mon_line(g, &text);
        cur = next;
        shown += 1;
    }
}

fn cmd_calls(g: &mut Genie, limit: usize) {
    let mut cur = Some(g.frames.top_number());
    let mut shown = 0;
    while let Some(fno) = cur {
        if g.frames.is_empty() || shown >= limit {
            break;
        }
        let f = g.frames.frame(fno);
        let next = f.dynamic_link;
        let text = if f.proc_frame {
            let line = g.tree.node(f.node).line;
            Some(format!("#{:<3} call at line {}", f.number, line))
        } else {
            None
        };
        if let Some(t) = text {
            mon_line(g, &t);
            shown += 1;
        }
        cur = next;
    }
    if shown == 0 {
        mon_line(g, "no active calls");
    }
}

fn cmd_link(g: &mut Genie, limit: usize) {
    let mut cur = Some(g.monitor.cur_frame);
    let mut shown = 0;
    while let Some(fno) = cur {
        if g.frames.is_empty() || shown >= limit {
            break;
        }
        let f = g.frames.frame(fno);
        let next = f.static_link;
        let text = format!("#{:<3} level {}", f.number, f.level);
        mon_line(g, &text);
        cur = next;
        shown += 1;
    }
}

fn cmd_frame(g: &mut Genie, rest: &str) {
    if let Ok(k) = rest.trim().parse::<usize>() {
        if k < g.frames.depth() {
            g.monitor.cur_frame = k;
        } else {
            mon_line(g, &format!("no frame #{}", k));
            return;
        }
    }
    if g.frames.is_empty() {
        mon_line(g, "no frames");
        return;
    }
    let fno = g.monitor.cur_frame;
    let f = g.frames.frame(fno);
    let table = f.table;
    let level = f.level;
    let line = g.tree.node(f.node).line;
    let header = format!("frame #{} level {} at line {}", fno, level, line);
    mon_line(g, &header);
    // Show the frame's named slots.
    let tags: Vec<(String, TagRef)> = g
        .tree
        .table(table)
        .tags
        .iter()
        .enumerate()
        .filter(|(_, t)| t.kind == TagKind::Identifier && !t.name.is_empty())
        .map(|(i, t)| (t.name.clone(), TagRef { table, index: i as u32 }))
        .collect();
    for (name, tag_ref) in tags {
        let tag = g.tree.tag(tag_ref).clone();
        let size = g.tree.modes.size(tag.mode);
        let slots = g.frames.frame(fno).slots[tag.offset..tag.offset + size].to_vec();
        let text = render_slots(g, &slots);
        let spelled = g.tree.modes.spell(tag.mode);
        let line = format!("  {} {} = {}", spelled, name, text);
        mon_line(g, &line);
    }
}

fn cmd_heap(g: &mut Genie, limit: usize) {
    let stats = g.heap.stats.clone();
    let header = format!(
        "heap: {} / {} slots used, {} handles, {} collections, {} swept, peak {}",
        g.heap.used_slots,
        g.heap.limit,
        g.heap.handle_count(),
        stats.collections,
        stats.handles_swept,
        stats.peak_used,
    );
    mon_line(g, &header);
    let entries: Vec<(u32, usize, ModeId, bool)> = g
        .heap
        .live_handles()
        .take(limit)
        .map(|(id, h)| (id.0, h.size, h.mode, h.pinned))
        .collect();
    for (id, size, mode, pinned) in entries {
        let spelled = g.tree.modes.spell(mode);
        let text = format!(
            "  handle {:<4} {:<4} slots {}{}",
            id,
            size,
            spelled,
            if pinned { " (pinned)" } else { "" }
        );
        mon_line(g, &text);
    }
}

fn cmd_sizes(g: &mut Genie) {
    let frames: usize = g.frames.iter().map(|f| f.slots.len()).sum();
    let text = format!(
        "frame stack: {} slots in {} frames\nexpression stack: {} slots\nheap: {} / {} slots in {} handles",
        frames,
        g.frames.depth(),
        g.stack.len(),
        g.heap.used_slots,
        g.heap.limit,
        g.heap.handle_count(),
    );
    mon_line(g, &text);
}

fn cmd_xref(g: &mut Genie, rest: &str) {
    let only: Option<u32> = rest.trim().parse().ok();
    for t in 0..g.tree.tables.len() as u32 {
        if only.map_or(false, |o| o != t) {
            continue;
        }
        let names: Vec<String> = g
            .tree
            .table(t)
            .tags
            .iter()
            .filter(|tag| !tag.name.is_empty())
            .map(|tag| format!("{} {}", g.tree.modes.spell(tag.mode), tag.name))
            .collect();
        if names.is_empty() {
            continue;
        }
        let header = format!("table {} (level {}):", t, g.tree.table(t).level);
        mon_line(g, &header);
        for n in names {
            let text = format!("  {}", n);
            mon_line(g, &text);
        }
    }
}

fn cmd_do(g: &mut Genie, rest: &str) {
    if rest.is_empty() {
        mon_line(g, "do needs a host command");
        return;
    }
    match std::process::Command::new("sh").arg("-c").arg(rest).output() {
        Ok(out) => {
            mon_write(g, &String::from_utf8_lossy(&out.stdout));
            mon_write(g, &String::from_utf8_lossy(&out.stderr));
        }
        Err(e) => mon_line(g, &format!("cannot run '{}': {}", rest, e)),
    }
}

fn cmd_examine(g: &mut Genie, rest: &str) {
    let name = rest.trim();
    if name.is_empty() {
        mon_line(g, "examine needs an identifier");
        return;
    }
    let frame = g.monitor.cur_frame;
    match lookup_in_frames(g, frame, name) {
        Some((slots, mode)) => {
            let spelled = g.tree.modes.spell(mode);
            // Show the referred-to value for names.
            let display = match evaluate_text(g, frame, name) {
                Ok((v, _)) => render_slots(g, &v),
                Err(_) => render_slots(g, &slots),
            };
            mon_line(g, &format!("{} {} = {}", spelled, name, display));
        }
        None => mon_line(g, &format!("unknown identifier '{}'", name)),
    }
}

fn cmd_evaluate(g: &mut Genie, rest: &str) {
    if rest.trim().is_empty() {
        mon_line(g, "evaluate needs an expression");
        return;
    }
    let frame = g.monitor.cur_frame;
    match evaluate_text(g, frame, rest) {
        Ok((slots, _mode)) => {
            let text = render_slots(g, &slots);
            mon_line(g, &text);
        }
        Err(e) => mon_line(g, &format!("cannot evaluate '{}': {}", rest.trim(), e)),
    }
}

fn render_slots(g: &Genie, slots: &[Value]) -> String {
    if slots.iter().all(|s| !s.is_initialised()) {
        return "uninitialised".to_string();
    }
    let mut s = g.format_slots(slots).trim_start().to_string();
    if s.is_empty() {
        s = "()".to_string();
    }
    s
}

// ---------------------------------------------------------------------------
// Expression evaluator over live frames
// ---------------------------------------------------------------------------

/// Find an identifier through the static chain rooted at `frame` and
/// read its slots.
fn lookup_in_frames(g: &Genie, frame: usize, name: &str) -> Option<(Vec<Value>, ModeId)> {
    if g.frames.is_empty() {
        return None;
    }
    let table = g.frames.frame(frame).table;
    let tag_ref = g.tree.find_tag(table, name, TagKind::Identifier)?;
    let tag = g.tree.tag(tag_ref).clone();
    if tag.stand.is_some() {
        return None;
    }
    // Walk static links from the chosen activation to the tag's level.
    let mut cur = frame;
    loop {
        let f = g.frames.frame(cur);
        if f.level == tag.level {
            let size = g.tree.modes.size(tag.mode);
            return Some((f.slots[tag.offset..tag.offset + size].to_vec(), tag.mode));
        }
        cur = f.static_link?;
    }
}

pub fn evaluate_text(
    g: &mut Genie,
    frame: usize,
    text: &str,
) -> Result<(Vec<Value>, ModeId), GenieError> {
    let toks = lex(text)
        .map_err(|_| GenieError::UnparsableExpression { text: text.to_string() })?;
    let mut p = MParser { g, frame, toks, pos: 0 };
    let (slots, mode) = p.expression(0)?;
    if !matches!(p.toks[p.pos].0, Tok::Eof) {
        return Err(GenieError::UnparsableExpression { text: text.to_string() });
    }
    // Names print as the values they refer to.
    p.to_value(slots, mode)
}

struct MParser<'g> {
    g: &'g mut Genie,
    frame: usize,
    toks: Vec<(Tok, u32)>,
    pos: usize,
}

impl MParser<'_> {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos].0
    }

    fn next(&mut self) -> Tok {
        let t = self.toks[self.pos].0.clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn bad(&self) -> GenieError {
        GenieError::UnparsableExpression {
            text: self
                .toks
                .iter()
                .map(|(t, _)| format!("{:?}", t))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    fn expression(&mut self, min_prio: u8) -> Result<(Vec<Value>, ModeId), GenieError> {
        let mut lhs = self.monadic()?;
        loop {
            let sym = match self.peek() {
                Tok::Op(s) => s.clone(),
                Tok::Bold(w)
                    if matches!(w.as_str(), "AND" | "OR" | "XOR" | "OVER" | "MOD") =>
                {
                    w.clone()
                }
                _ => break,
            };
            let prio = match sym.as_str() {
                "OR" => 2,
                "AND" | "XOR" => 3,
                "=" | "/=" => 4,
                "<" | "<=" | ">" | ">=" => 5,
                "+" | "-" => 6,
                "*" | "/" | "OVER" | "MOD" => 7,
                "**" => 8,
                _ => break,
            };
            if prio < min_prio {
                break;
            }
            self.next();
            let rhs = self.expression(prio + 1)?;
            lhs = self.apply_dyad(&sym, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn monadic(&mut self) -> Result<(Vec<Value>, ModeId), GenieError> {
        match self.peek().clone() {
            Tok::Op(s) if s == "-" => {
                self.next();
                let (v, m) = self.monadic()?;
                self.apply_monad("-", v, m)
            }
            Tok::Bold(w) if matches!(w.as_str(), "NOT" | "ABS" | "ENTIER" | "ROUND" | "ODD") => {
                self.next();
                let (v, m) = self.monadic()?;
                self.apply_monad(&w, v, m)
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<(Vec<Value>, ModeId), GenieError> {
        let mut p = self.primary()?;
        while *self.peek() == Tok::LBracket {
            self.next();
            let mut indices = Vec::new();
            loop {
                let (v, m) = self.expression(0)?;
                let (v, _) = self.to_value(v, m)?;
                match v.first() {
                    Some(Value::Int(i)) => indices.push(*i),
                    _ => return Err(self.bad()),
                }
                if *self.peek() == Tok::Comma {
                    self.next();
                    continue;
                }
                break;
            }
            if !matches!(self.next(), Tok::RBracket) {
                return Err(self.bad());
            }
            p = self.index(p, &indices)?;
        }
        Ok(p)
    }

    fn index(
        &mut self,
        (slots, mode): (Vec<Value>, ModeId),
        indices: &[i64],
    ) -> Result<(Vec<Value>, ModeId), GenieError> {
        let (slots, mode) = self.to_value(slots, mode)?;
        let desc = match slots.into_iter().next() {
            Some(Value::Row(d)) => *d,
            _ => return Err(GenieError::UnparsableExpression { text: "subscript of a non-row".into() }),
        };
        if indices.len() != desc.dims() {
            return Err(GenieError::UnparsableExpression { text: "wrong subscript count".into() });
        }
        let at = desc.slot_of(indices)?;
        let out = self.g.heap.slots(desc.elems)[at..at + desc.elem_size].to_vec();
        let elem_mode = desc.elem_mode;
        let _ = mode;
        Ok((out, elem_mode))
    }

    fn primary(&mut self) -> Result<(Vec<Value>, ModeId), GenieError> {
        match self.next() {
            Tok::IntLit(text) => {
                let v: i64 = text.parse().map_err(|_| self.bad())?;
                Ok((vec![Value::Int(v)], M_INT))
            }
            Tok::RealLit(text) => {
                let v: f64 = text.parse().map_err(|_| self.bad())?;
                Ok((vec![Value::Real(v)], M_REAL))
            }
            Tok::StrLit(text) => {
                if text.chars().count() == 1 {
                    Ok((vec![Value::Char(text.chars().next().unwrap())], M_CHAR))
                } else {
                    Err(self.bad())
                }
            }
            Tok::Bold(w) if w == "TRUE" => Ok((vec![Value::Bool(true)], M_BOOL)),
            Tok::Bold(w) if w == "FALSE" => Ok((vec![Value::Bool(false)], M_BOOL)),
            Tok::Bold(w) if w == "NIL" => {
                Ok((vec![Value::Name(Name::nil())], crate::mode::M_REF_INT))
            }
            Tok::LParen => {
                let out = self.expression(0)?;
                if !matches!(self.next(), Tok::RParen) {
                    return Err(self.bad());
                }
                Ok(out)
            }
            Tok::Ident(name) => lookup_in_frames(self.g, self.frame, &name)
                .ok_or(GenieError::UnknownIdentifier { name }),
            _ => Err(self.bad()),
        }
    }

    /// Dereference names so operators see base values.
    fn to_value(
        &mut self,
        slots: Vec<Value>,
        mode: ModeId,
    ) -> Result<(Vec<Value>, ModeId), GenieError> {
        let mut slots = slots;
        let mut mode = mode;
        loop {
            match slots.first().cloned() {
                Some(Value::Name(name)) => {
                    if name.is_nil() {
                        return Err(GenieError::NilDereference);
                    }
                    let base = self.g.tree.modes.deref(mode).unwrap_or(mode);
                    let size = self.g.tree.modes.size(base).max(1);
                    let read = match name.target {
                        Target::Nil => return Err(GenieError::NilDereference),
                        Target::Frame { frame, offset } => {
                            self.g.frames.frame(frame).slots[offset..offset + size].to_vec()
                        }
                        Target::Heap { handle, offset } => {
                            self.g.heap.slots(handle)[offset..offset + size].to_vec()
                        }
                    };
                    if read.iter().any(|v| !v.is_initialised()) {
                        return Err(GenieError::UninitialisedValue {
                            mode: self.g.tree.modes.spell(base),
                        });
                    }
                    slots = read;
                    mode = base;
                }
                Some(Value::Empty) => {
                    return Err(GenieError::UninitialisedValue {
                        mode: self.g.tree.modes.spell(mode),
                    })
                }
                _ => return Ok((slots, mode)),
            }
        }
    }

    fn key_of(&self, v: &Value) -> Option<char> {
        Some(match v {
            Value::Int(_) => 'i',
            Value::Real(_) => 'r',
            Value::Bool(_) => 'b',
            Value::Char(_) => 'c',
            Value::Bits(_) => 'w',
            Value::Complex(..) => 'z',
            _ => return None,
        })
    }

    fn apply_dyad(
        &mut self,
        sym: &str,
        lhs: (Vec<Value>, ModeId),
        rhs: (Vec<Value>, ModeId),
    ) -> Result<(Vec<Value>, ModeId), GenieError> {
        let (mut l, lm) = self.to_value(lhs.0, lhs.1)?;
        let (mut r, rm) = self.to_value(rhs.0, rhs.1)?;
        // Balance INT against REAL, as the interpreter's moder does.
        if matches!(l.first(), Some(Value::Int(_))) && matches!(r.first(), Some(Value::Real(_))) {
            if let Some(Value::Int(i)) = l.first() {
                l = vec![Value::Real(*i as f64)];
            }
        } else if matches!(l.first(), Some(Value::Real(_)))
            && matches!(r.first(), Some(Value::Int(_)))
        {
            if let Some(Value::Int(i)) = r.first() {
                r = vec![Value::Real(*i as f64)];
            }
        }
        let key: String = [
            self.key_of(l.first().ok_or_else(|| self.bad())?).ok_or_else(|| self.bad())?,
            self.key_of(r.first().ok_or_else(|| self.bad())?).ok_or_else(|| self.bad())?,
        ]
        .iter()
        .collect();
        let index = stdenv::find_dyad(sym, &key).ok_or_else(|| self.bad())?;
        let n = self.g.cur_node;
        let sp = self.g.sp();
        self.g.stack.extend(l);
        self.g.stack.extend(r);
        let out = (stdenv::dyad(index).proc_)(self.g, n);
        match out {
            Ok(()) => {
                let slots = self.g.pop_slots(self.g.sp() - sp);
                let mode = self.mode_of_result(&slots, lm, rm, sym);
                Ok((slots, mode))
            }
            Err(Irq::Error { error, .. }) => Err(error),
            Err(_) => Err(self.bad()),
        }
    }

    fn apply_monad(
        &mut self,
        sym: &str,
        v: Vec<Value>,
        m: ModeId,
    ) -> Result<(Vec<Value>, ModeId), GenieError> {
        let (v, m) = self.to_value(v, m)?;
        let key: String = [self
            .key_of(v.first().ok_or_else(|| self.bad())?)
            .ok_or_else(|| self.bad())?]
        .iter()
        .collect();
        let index = stdenv::find_monad(sym, &key).ok_or_else(|| self.bad())?;
        let n = self.g.cur_node;
        let sp = self.g.sp();
        self.g.stack.extend(v);
        match (stdenv::monad(index).proc_)(self.g, n) {
            Ok(()) => {
                let slots = self.g.pop_slots(self.g.sp() - sp);
                let mode = match slots.first() {
                    Some(Value::Bool(_)) => M_BOOL,
                    Some(Value::Real(_)) => M_REAL,
                    Some(Value::Char(_)) => M_CHAR,
                    _ => m,
                };
                Ok((slots, mode))
            }
            Err(Irq::Error { error, .. }) => Err(error),
            Err(_) => Err(self.bad()),
        }
    }

    fn mode_of_result(&self, slots: &[Value], lm: ModeId, _rm: ModeId, _sym: &str) -> ModeId {
        match slots.first() {
            Some(Value::Bool(_)) => M_BOOL,
            Some(Value::Int(_)) => M_INT,
            Some(Value::Real(_)) => M_REAL,
            Some(Value::Char(_)) => M_CHAR,
            _ => lm,
        }
    }
}
