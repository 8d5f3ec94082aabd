use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::ast::{
    as_fn, as_fn2, dval, CharPred, ChainMark, DynFn, DynFn2, DynFn3, DynPred, DynVal, FixTarget,
    LoopStop, MsgFn, BindFn,
};
use crate::codegen::Program;

/// Fixed register bank size. Addressing a fifth register is a programming
/// error, checked at `Reg` construction.
pub(crate) const REGISTERS: usize = 4;

// ── Positions ────────────────────────────────────────────────────────

/// A source position. `line` and `col` are zero-based; `offset` counts
/// code points. A tab advances the column to the next multiple of four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pos {
    pub offset: usize,
    pub line: usize,
    pub col: usize,
}

// ── Parse failures ───────────────────────────────────────────────────

/// The user-facing failure: deepest position reached, the set of labels
/// that would have been legal there, what was actually found, and any raw
/// `fail` messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseFailure {
    pub pos: Pos,
    pub expected: BTreeSet<String>,
    pub unexpected: Option<String>,
    pub messages: Vec<String>,
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at line {}, column {}", self.pos.line, self.pos.col)?;
        if let Some(u) = &self.unexpected {
            write!(f, ": unexpected {u}")?;
        }
        if !self.expected.is_empty() {
            let joined = self.expected.iter().cloned().collect::<Vec<_>>().join(" or ");
            write!(f, "; expected {joined}")?;
        }
        for m in &self.messages {
            write!(f, "; {m}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseFailure {}

// ── Trace seam ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePhase {
    Enter,
    ExitSuccess,
    ExitFailure,
}

/// Snapshot handed to a [`Tracer`] at `debug` taps. `window` shows the
/// input around the cursor with a `•` at the current position.
#[derive(Debug)]
pub struct TraceEvent<'a> {
    pub name: &'a str,
    pub phase: TracePhase,
    pub pos: Pos,
    pub window: String,
    pub stack_depth: usize,
    pub handler_depth: usize,
    pub break_hit: bool,
}

pub trait Tracer {
    fn event(&self, event: &TraceEvent<'_>);
}

// ── Instructions ─────────────────────────────────────────────────────

/// One machine instruction. Fields typed `u32` hold a label placeholder
/// until resolution rewrites them to absolute offsets.
#[derive(Clone)]
pub(crate) enum Instr {
    // value stack
    Push(DynVal),
    Pop,
    Exchange(DynVal),
    Apply,
    Perform(DynFn),
    Lift2(DynFn2),
    Lift3(DynFn3),
    // input primitives
    CharTok { c: char, expected: Option<String> },
    StringTok { s: Rc<str>, expected: Option<String> },
    Satisfy { pred: CharPred, expected: Option<String> },
    Keyword { kw: Rc<str>, expected: Option<String> },
    Operator { op: Rc<str>, expected: Option<String> },
    StringLit { raw: bool, expected: Option<String> },
    Eof { expected: Option<String> },
    Line,
    Col,
    // fused primitives
    CharTokFastPerform { c: char, f: DynFn, expected: Option<String> },
    StringTokFastPerform { s: Rc<str>, f: DynFn, expected: Option<String> },
    CharTokExchange { c: char, x: DynVal, expected: Option<String> },
    StringTokExchange { s: Rc<str>, x: DynVal, expected: Option<String> },
    SatisfyExchange { pred: CharPred, x: DynVal, expected: Option<String> },
    // failure
    Empty { expected: Option<String> },
    Fail { msg: String },
    Unexpected { msg: String },
    FastFail { gen: MsgFn },
    FastUnexpected { gen: MsgFn },
    // filtering
    Ensure { pred: DynPred },
    Guard { pred: DynPred, msg: String },
    FastGuard { pred: DynPred, gen: MsgFn },
    // control flow
    Jump(u32),
    IfFalse(u32),
    JumpGood(u32),
    PushHandler(u32),
    InputCheck(u32),
    Catch,
    RecoverWith(DynVal),
    AlwaysRecoverWith(DynVal),
    JumpGoodAttempt(u32),
    Attempt,
    Look,
    NotFollowedBy { expected: Option<String> },
    // loops
    Many { body: u32, acc: RefCell<Vec<DynVal>> },
    SkipMany { body: u32 },
    ManyUntil { body: u32 },
    ChainPre { body: u32 },
    ChainPost { body: u32 },
    ChainLeft { body: u32 },
    Commit,
    ChainRight { body: u32 },
    SepEndBy { body: u32 },
    // tablified alternation
    JumpTable { table: HashMap<char, u32>, default: u32, expected: Vec<String> },
    // calls
    GoSub { target: u32, expected: Option<String> },
    Return,
    Call { target: FixTarget, cache: RefCell<Option<Rc<Program>>>, expected: Option<String> },
    DynCall { k: BindFn },
    // registers
    Get(usize),
    PutReg(usize),
    ModifyReg { reg: usize, f: DynFn },
    LocalEntry(usize),
    LocalExit(usize),
    // trace
    LogBegin { name: Rc<str>, brk: bool },
    LogEnd { name: Rc<str>, brk: bool },
    // pseudo-instructions, removed by label resolution
    Label(u32),
    Nop,
}

impl Instr {
    /// Instructions carrying per-execution mutable state; their positions
    /// are indexed so snapshots can replace them wholesale.
    pub(crate) fn is_stateful(&self) -> bool {
        matches!(self, Instr::Many { .. } | Instr::Call { .. })
    }

    /// A copy with pristine runtime state.
    pub(crate) fn refreshed(&self) -> Instr {
        match self {
            Instr::Many { body, .. } => Instr::Many { body: *body, acc: RefCell::new(Vec::new()) },
            Instr::Call { target, expected, .. } => Instr::Call {
                target: target.clone(),
                cache: RefCell::new(None),
                expected: expected.clone(),
            },
            other => other.clone(),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Instr::Push(_) => "Push",
            Instr::Pop => "Pop",
            Instr::Exchange(_) => "Exchange",
            Instr::Apply => "Apply",
            Instr::Perform(_) => "Perform",
            Instr::Lift2(_) => "Lift2",
            Instr::Lift3(_) => "Lift3",
            Instr::CharTok { .. } => "CharTok",
            Instr::StringTok { .. } => "StringTok",
            Instr::Satisfy { .. } => "Satisfy",
            Instr::Keyword { .. } => "Keyword",
            Instr::Operator { .. } => "Operator",
            Instr::StringLit { .. } => "StringLit",
            Instr::Eof { .. } => "Eof",
            Instr::Line => "Line",
            Instr::Col => "Col",
            Instr::CharTokFastPerform { .. } => "CharTokFastPerform",
            Instr::StringTokFastPerform { .. } => "StringTokFastPerform",
            Instr::CharTokExchange { .. } => "CharTokExchange",
            Instr::StringTokExchange { .. } => "StringTokExchange",
            Instr::SatisfyExchange { .. } => "SatisfyExchange",
            Instr::Empty { .. } => "Empty",
            Instr::Fail { .. } => "Fail",
            Instr::Unexpected { .. } => "Unexpected",
            Instr::FastFail { .. } => "FastFail",
            Instr::FastUnexpected { .. } => "FastUnexpected",
            Instr::Ensure { .. } => "Ensure",
            Instr::Guard { .. } => "Guard",
            Instr::FastGuard { .. } => "FastGuard",
            Instr::Jump(_) => "Jump",
            Instr::IfFalse(_) => "IfFalse",
            Instr::JumpGood(_) => "JumpGood",
            Instr::PushHandler(_) => "PushHandler",
            Instr::InputCheck(_) => "InputCheck",
            Instr::Catch => "Catch",
            Instr::RecoverWith(_) => "RecoverWith",
            Instr::AlwaysRecoverWith(_) => "AlwaysRecoverWith",
            Instr::JumpGoodAttempt(_) => "JumpGoodAttempt",
            Instr::Attempt => "Attempt",
            Instr::Look => "Look",
            Instr::NotFollowedBy { .. } => "NotFollowedBy",
            Instr::Many { .. } => "Many",
            Instr::SkipMany { .. } => "SkipMany",
            Instr::ManyUntil { .. } => "ManyUntil",
            Instr::ChainPre { .. } => "ChainPre",
            Instr::ChainPost { .. } => "ChainPost",
            Instr::ChainLeft { .. } => "ChainLeft",
            Instr::Commit => "Commit",
            Instr::ChainRight { .. } => "ChainRight",
            Instr::SepEndBy { .. } => "SepEndBy",
            Instr::JumpTable { .. } => "JumpTable",
            Instr::GoSub { .. } => "GoSub",
            Instr::Return => "Return",
            Instr::Call { .. } => "Call",
            Instr::DynCall { .. } => "DynCall",
            Instr::Get(_) => "Get",
            Instr::PutReg(_) => "PutReg",
            Instr::ModifyReg { .. } => "ModifyReg",
            Instr::LocalEntry(_) => "LocalEntry",
            Instr::LocalExit(_) => "LocalExit",
            Instr::LogBegin { .. } => "LogBegin",
            Instr::LogEnd { .. } => "LogEnd",
            Instr::Label(_) => "Label",
            Instr::Nop => "Nop",
        }
    }
}

impl fmt::Debug for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::CharTok { c, .. } => write!(f, "CharTok({c:?})"),
            Instr::StringTok { s, .. } => write!(f, "StringTok({s:?})"),
            Instr::Jump(t) => write!(f, "Jump({t})"),
            Instr::JumpGood(t) => write!(f, "JumpGood({t})"),
            Instr::PushHandler(t) => write!(f, "PushHandler({t})"),
            Instr::InputCheck(t) => write!(f, "InputCheck({t})"),
            Instr::Label(l) => write!(f, "Label({l})"),
            Instr::JumpTable { table, .. } => write!(f, "JumpTable({} leads)", table.len()),
            other => f.write_str(other.name()),
        }
    }
}

// ── Machine state ────────────────────────────────────────────────────

/// A recovery point. Depths are restored on entry to the handler; the
/// saved input is only restored by attempt-family instructions.
struct Handler {
    code: Rc<[Instr]>,
    pc: usize,
    offset: usize,
    line: usize,
    col: usize,
    stack_depth: usize,
    call_depth: usize,
}

enum Frame {
    Return {
        code: Rc<[Instr]>,
        pc: usize,
        site_offset: usize,
        label: Option<String>,
        entered: Option<*const Instr>,
    },
    RegSave {
        reg: usize,
        saved: Option<DynVal>,
    },
}

enum Expected {
    Nothing,
    One(String),
    Set(Vec<String>),
}

struct FailState {
    offset: usize,
    line: usize,
    col: usize,
    expected: BTreeSet<String>,
    unexpected: Option<String>,
    messages: Vec<String>,
}

struct Machine {
    input: Vec<char>,
    offset: usize,
    line: usize,
    col: usize,
    code: Rc<[Instr]>,
    pc: usize,
    stack: Vec<DynVal>,
    handlers: Vec<Handler>,
    frames: Vec<Frame>,
    regs: [Option<DynVal>; REGISTERS],
    fired: Option<Handler>,
    err: Option<FailState>,
    halted: Option<ParseFailure>,
    active: HashMap<*const Instr, usize>,
    copies: HashMap<(*const Instr, usize), Rc<Program>>,
    tracer: Option<Rc<dyn Tracer>>,
}

fn code_key(code: &Rc<[Instr]>) -> *const Instr {
    Rc::as_ptr(code) as *const Instr
}

/// Execute a frozen program against an input, yielding the final stack
/// value and the end position, or the deepest failure.
pub(crate) fn run(
    program: &Rc<Program>,
    input: &str,
    tracer: Option<Rc<dyn Tracer>>,
) -> Result<(DynVal, Pos), ParseFailure> {
    let mut m = Machine {
        input: input.chars().collect(),
        offset: 0,
        line: 0,
        col: 0,
        code: Rc::clone(&program.code),
        pc: 0,
        stack: Vec::new(),
        handlers: Vec::new(),
        frames: Vec::new(),
        regs: [None, None, None, None],
        fired: None,
        err: None,
        halted: None,
        active: HashMap::new(),
        copies: HashMap::new(),
        tracer,
    };
    m.active.insert(code_key(&m.code), 1);

    loop {
        if let Some(failure) = m.halted.take() {
            return Err(failure);
        }
        let code = Rc::clone(&m.code);
        if m.pc >= code.len() {
            match m.frames.pop() {
                Some(Frame::Return { code: prev, pc, entered, .. }) => {
                    if let Some(key) = entered {
                        m.dec_active(key);
                    }
                    m.code = prev;
                    m.pc = pc;
                    continue;
                }
                Some(Frame::RegSave { .. }) => {
                    panic!("unbalanced register frame at end of program")
                }
                None => {
                    let value = m.stack.pop().expect("program finished with an empty stack");
                    return Ok((value, m.pos()));
                }
            }
        }
        let instr = &code[m.pc];
        m.pc += 1;
        m.step(instr);
    }
}

impl Machine {
    fn pos(&self) -> Pos {
        Pos { offset: self.offset, line: self.line, col: self.col }
    }

    fn pop(&mut self) -> DynVal {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek_char(&self) -> Option<char> {
        self.input.get(self.offset).copied()
    }

    fn advance(&mut self, ch: char) {
        self.offset += 1;
        match ch {
            '\n' => {
                self.line += 1;
                self.col = 0;
            }
            '\t' => self.col = (self.col / 4 + 1) * 4,
            _ => self.col += 1,
        }
    }

    fn input_has(&self, s: &str) -> bool {
        let mut i = self.offset;
        for ch in s.chars() {
            if self.input.get(i) != Some(&ch) {
                return false;
            }
            i += 1;
        }
        true
    }

    fn advance_str(&mut self, s: &str) {
        for ch in s.chars() {
            self.advance(ch);
        }
    }

    fn here(&self) -> String {
        match self.peek_char() {
            Some(c) => format!("\"{c}\""),
            None => "end of input".to_string(),
        }
    }

    fn window(&self) -> String {
        let start = self.offset.saturating_sub(8);
        let end = (self.offset + 8).min(self.input.len());
        let before: String = self.input[start..self.offset].iter().collect();
        let after: String = self.input[self.offset..end].iter().collect();
        format!("{before}\u{2022}{after}")
    }

    // ── failure plumbing ─────────────────────────────────────────

    /// A labelled call frame whose call site is at the current offset
    /// relabels any failure raised here; the outermost such label wins.
    fn call_site_label(&self) -> Option<String> {
        self.frames.iter().find_map(|f| match f {
            Frame::Return { site_offset, label: Some(l), .. } if *site_offset == self.offset => {
                Some(l.clone())
            }
            _ => None,
        })
    }

    fn record(&mut self, expected: Expected, unexpected: Option<String>, message: Option<String>) {
        let replace = match &self.err {
            None => true,
            Some(e) => self.offset > e.offset,
        };
        if replace {
            self.err = Some(FailState {
                offset: self.offset,
                line: self.line,
                col: self.col,
                expected: BTreeSet::new(),
                unexpected: None,
                messages: Vec::new(),
            });
        }
        let e = self.err.as_mut().expect("failure state just ensured");
        if e.offset == self.offset {
            match expected {
                Expected::Nothing => {}
                Expected::One(s) => {
                    e.expected.insert(s);
                }
                Expected::Set(v) => e.expected.extend(v),
            }
            if e.unexpected.is_none() {
                e.unexpected = unexpected;
            }
            if let Some(m) = message {
                e.messages.push(m);
            }
        }
    }

    fn failure(&mut self) -> ParseFailure {
        let e = self.err.take().unwrap_or(FailState {
            offset: self.offset,
            line: self.line,
            col: self.col,
            expected: BTreeSet::new(),
            unexpected: None,
            messages: Vec::new(),
        });
        ParseFailure {
            pos: Pos { offset: e.offset, line: e.line, col: e.col },
            expected: e.expected,
            unexpected: e.unexpected,
            messages: e.messages,
        }
    }

    fn fail(&mut self, expected: Expected, unexpected: Option<String>, message: Option<String>) {
        let expected = match self.call_site_label() {
            Some(l) => Expected::One(l),
            None => expected,
        };
        self.record(expected, unexpected, message);
        self.refail();
    }

    /// Unwind to the next handler without recording new error information.
    fn refail(&mut self) {
        match self.handlers.pop() {
            Some(h) => self.unwind_to(h),
            None => self.halted = Some(self.failure()),
        }
    }

    fn unwind_to(&mut self, h: Handler) {
        self.stack.truncate(h.stack_depth);
        while self.frames.len() > h.call_depth {
            match self.frames.pop().expect("call stack shorter than handler depth") {
                Frame::Return { entered, .. } => {
                    if let Some(key) = entered {
                        self.dec_active(key);
                    }
                }
                Frame::RegSave { reg, saved } => self.regs[reg] = saved,
            }
        }
        self.code = Rc::clone(&h.code);
        self.pc = h.pc;
        self.fired = Some(h);
    }

    fn restore_input(&mut self, h: &Handler) {
        self.offset = h.offset;
        self.line = h.line;
        self.col = h.col;
    }

    fn push_handler(&mut self, target: u32) {
        self.handlers.push(Handler {
            code: Rc::clone(&self.code),
            pc: target as usize,
            offset: self.offset,
            line: self.line,
            col: self.col,
            stack_depth: self.stack.len(),
            call_depth: self.frames.len(),
        });
    }

    fn pop_handler(&mut self) -> Handler {
        self.handlers.pop().expect("handler stack underflow")
    }

    /// Move the top handler's consumption checkpoint to the cursor.
    fn update_check(&mut self) {
        let h = self.handlers.last_mut().expect("loop without its handler");
        h.offset = self.offset;
        h.line = self.line;
        h.col = self.col;
    }

    /// Extend the top handler to cover one more committed stack slot and
    /// move its checkpoint.
    fn commit_slot(&mut self) {
        let h = self.handlers.last_mut().expect("commit without a handler");
        h.stack_depth += 1;
        h.offset = self.offset;
        h.line = self.line;
        h.col = self.col;
    }

    // ── program activation ───────────────────────────────────────

    fn dec_active(&mut self, key: *const Instr) {
        if let Some(n) = self.active.get_mut(&key) {
            *n -= 1;
        }
    }

    /// Enter a compiled program. A program already active (recursion) runs
    /// on a depth-indexed isolated copy so stateful instructions are never
    /// shared between activations.
    fn enter_program(&mut self, program: Rc<Program>, label: Option<String>) {
        let key = code_key(&program.code);
        let depth = *self.active.get(&key).unwrap_or(&0);
        let actual = if depth == 0 || !program.has_loop_state {
            program
        } else {
            self.copies
                .entry((key, depth))
                .or_insert_with(|| Rc::new(program.isolated_program()))
                .clone()
        };
        *self.active.entry(key).or_insert(0) += 1;
        self.frames.push(Frame::Return {
            code: Rc::clone(&self.code),
            pc: self.pc,
            site_offset: self.offset,
            label,
            entered: Some(key),
        });
        self.code = Rc::clone(&actual.code);
        self.pc = 0;
    }

    fn trace(&self, name: &str, phase: TracePhase, break_hit: bool) {
        if let Some(t) = &self.tracer {
            t.event(&TraceEvent {
                name,
                phase,
                pos: self.pos(),
                window: self.window(),
                stack_depth: self.stack.len(),
                handler_depth: self.handlers.len(),
                break_hit,
            });
        }
    }

    // ── dispatch ─────────────────────────────────────────────────

    fn step(&mut self, instr: &Instr) {
        match instr {
            Instr::Push(x) => self.stack.push(x.clone()),
            Instr::Pop => {
                self.pop();
            }
            Instr::Exchange(x) => {
                let top = self.stack.last_mut().expect("value stack underflow");
                *top = x.clone();
            }
            Instr::Apply => {
                let x = self.pop();
                let f = self.pop();
                self.stack.push(as_fn(&f)(x));
            }
            Instr::Perform(f) => {
                let x = self.pop();
                self.stack.push(f(x));
            }
            Instr::Lift2(f) => {
                let y = self.pop();
                let x = self.pop();
                self.stack.push(f(x, y));
            }
            Instr::Lift3(f) => {
                let z = self.pop();
                let y = self.pop();
                let x = self.pop();
                self.stack.push(f(x, y, z));
            }

            // ── input primitives ─────────────────────────────────
            Instr::CharTok { c, expected } => match self.peek_char() {
                Some(ch) if ch == *c => {
                    self.advance(ch);
                    self.stack.push(dval(*c));
                }
                _ => self.fail_char(*c, expected),
            },
            Instr::CharTokFastPerform { c, f, expected } => match self.peek_char() {
                Some(ch) if ch == *c => {
                    self.advance(ch);
                    self.stack.push(f(dval(*c)));
                }
                _ => self.fail_char(*c, expected),
            },
            Instr::CharTokExchange { c, x, expected } => match self.peek_char() {
                Some(ch) if ch == *c => {
                    self.advance(ch);
                    self.stack.push(x.clone());
                }
                _ => self.fail_char(*c, expected),
            },
            Instr::StringTok { s, expected } => {
                if self.input_has(s) {
                    self.advance_str(s);
                    self.stack.push(dval(s.to_string()));
                } else {
                    self.fail_string(s, expected);
                }
            }
            Instr::StringTokFastPerform { s, f, expected } => {
                if self.input_has(s) {
                    self.advance_str(s);
                    self.stack.push(f(dval(s.to_string())));
                } else {
                    self.fail_string(s, expected);
                }
            }
            Instr::StringTokExchange { s, x, expected } => {
                if self.input_has(s) {
                    self.advance_str(s);
                    self.stack.push(x.clone());
                } else {
                    self.fail_string(s, expected);
                }
            }
            Instr::Satisfy { pred, expected } => match self.peek_char() {
                Some(ch) if pred(ch) => {
                    self.advance(ch);
                    self.stack.push(dval(ch));
                }
                _ => {
                    let exp = expected.clone().map_or(Expected::Nothing, Expected::One);
                    let found = self.here();
                    self.fail(exp, Some(found), None);
                }
            },
            Instr::SatisfyExchange { pred, x, expected } => match self.peek_char() {
                Some(ch) if pred(ch) => {
                    self.advance(ch);
                    self.stack.push(x.clone());
                }
                _ => {
                    let exp = expected.clone().map_or(Expected::Nothing, Expected::One);
                    let found = self.here();
                    self.fail(exp, Some(found), None);
                }
            },
            Instr::Keyword { kw, expected } => {
                let boundary = {
                    let after = self.offset + kw.chars().count();
                    !matches!(self.input.get(after), Some(c) if c.is_alphanumeric() || *c == '_')
                };
                if self.input_has(kw) && boundary {
                    self.advance_str(kw);
                    self.stack.push(dval(()));
                } else {
                    let exp = Expected::One(expected.clone().unwrap_or_else(|| kw.to_string()));
                    let found = self.here();
                    self.fail(exp, Some(found), None);
                }
            }
            Instr::Operator { op, expected } => {
                if self.input_has(op) {
                    self.advance_str(op);
                    self.stack.push(dval(()));
                } else {
                    let exp = Expected::One(expected.clone().unwrap_or_else(|| op.to_string()));
                    let found = self.here();
                    self.fail(exp, Some(found), None);
                }
            }
            Instr::StringLit { raw, expected } => match self.scan_string_literal(*raw) {
                Some((content, consumed)) => {
                    for _ in 0..consumed {
                        let ch = self.input[self.offset];
                        self.advance(ch);
                    }
                    self.stack.push(dval(content));
                }
                None => {
                    let exp =
                        Expected::One(expected.clone().unwrap_or_else(|| "string".to_string()));
                    let found = self.here();
                    self.fail(exp, Some(found), None);
                }
            },
            Instr::Eof { expected } => {
                if self.offset == self.input.len() {
                    self.stack.push(dval(()));
                } else {
                    let exp = Expected::One(
                        expected.clone().unwrap_or_else(|| "end of input".to_string()),
                    );
                    let found = self.here();
                    self.fail(exp, Some(found), None);
                }
            }
            Instr::Line => self.stack.push(dval(self.line)),
            Instr::Col => self.stack.push(dval(self.col)),

            // ── failure ──────────────────────────────────────────
            Instr::Empty { expected } => {
                let exp = expected.clone().map_or(Expected::Nothing, Expected::One);
                self.fail(exp, None, None);
            }
            Instr::Fail { msg } => self.fail(Expected::Nothing, None, Some(msg.clone())),
            Instr::Unexpected { msg } => self.fail(Expected::Nothing, Some(msg.clone()), None),
            Instr::FastFail { gen } => {
                let x = self.pop();
                let msg = gen(x);
                self.fail(Expected::Nothing, None, Some(msg));
            }
            Instr::FastUnexpected { gen } => {
                let x = self.pop();
                let msg = gen(x);
                self.fail(Expected::Nothing, Some(msg), None);
            }

            // ── filtering ────────────────────────────────────────
            Instr::Ensure { pred } => {
                let x = self.pop();
                if pred(&x) {
                    self.stack.push(x);
                } else {
                    self.fail(Expected::Nothing, None, None);
                }
            }
            Instr::Guard { pred, msg } => {
                let x = self.pop();
                if pred(&x) {
                    self.stack.push(x);
                } else {
                    self.fail(Expected::Nothing, None, Some(msg.clone()));
                }
            }
            Instr::FastGuard { pred, gen } => {
                let x = self.pop();
                if pred(&x) {
                    self.stack.push(x);
                } else {
                    let msg = gen(x);
                    self.fail(Expected::Nothing, None, Some(msg));
                }
            }

            // ── control flow ─────────────────────────────────────
            Instr::Jump(t) => self.pc = *t as usize,
            Instr::IfFalse(t) => {
                let b: bool = crate::ast::take(self.pop());
                if !b {
                    self.pc = *t as usize;
                }
            }
            Instr::JumpGood(t) => {
                self.pop_handler();
                self.pc = *t as usize;
            }
            Instr::PushHandler(t) | Instr::InputCheck(t) => self.push_handler(*t),
            Instr::Catch => {
                let h = self.fired.take().expect("catch entered without a failure");
                if h.offset != self.offset {
                    self.refail();
                }
            }
            Instr::RecoverWith(x) => {
                let h = self.fired.take().expect("recover entered without a failure");
                if h.offset == self.offset {
                    self.stack.push(x.clone());
                } else {
                    self.refail();
                }
            }
            Instr::AlwaysRecoverWith(x) => match self.fired.take() {
                Some(h) => {
                    self.restore_input(&h);
                    self.stack.push(x.clone());
                }
                None => {
                    self.pop_handler();
                }
            },
            Instr::JumpGoodAttempt(t) => match self.fired.take() {
                Some(h) => self.restore_input(&h),
                None => {
                    self.pop_handler();
                    self.pc = *t as usize;
                }
            },
            Instr::Attempt => match self.fired.take() {
                Some(h) => {
                    self.restore_input(&h);
                    self.refail();
                }
                None => {
                    self.pop_handler();
                }
            },
            Instr::Look => match self.fired.take() {
                Some(_) => self.refail(),
                None => {
                    let h = self.pop_handler();
                    self.restore_input(&h);
                }
            },
            Instr::NotFollowedBy { expected } => match self.fired.take() {
                Some(h) => {
                    self.restore_input(&h);
                    self.stack.push(dval(()));
                }
                None => {
                    let h = self.pop_handler();
                    self.restore_input(&h);
                    let exp = expected.clone().map_or(Expected::Nothing, Expected::One);
                    self.fail(exp, None, None);
                }
            },

            // ── loops ────────────────────────────────────────────
            Instr::Many { body, acc } => match self.fired.take() {
                Some(h) => {
                    let items = acc.take();
                    if h.offset == self.offset {
                        self.stack.push(dval(items));
                    } else {
                        self.refail();
                    }
                }
                None => {
                    let v = self.pop();
                    acc.borrow_mut().push(v);
                    self.update_check();
                    self.pc = *body as usize;
                }
            },
            Instr::SkipMany { body } => match self.fired.take() {
                Some(h) => {
                    if h.offset == self.offset {
                        self.stack.push(dval(()));
                    } else {
                        self.refail();
                    }
                }
                None => {
                    self.pop();
                    self.update_check();
                    self.pc = *body as usize;
                }
            },
            Instr::ManyUntil { body } => {
                // items accumulate on the stack above the chain mark, so a
                // failure unwinding past the loop leaves no stale state
                let v = self.pop();
                if v.is::<LoopStop>() {
                    let mut items = Vec::new();
                    loop {
                        let v = self.pop();
                        if v.is::<ChainMark>() {
                            break;
                        }
                        items.push(v);
                    }
                    items.reverse();
                    self.stack.push(dval(items));
                } else {
                    self.stack.push(v);
                    self.pc = *body as usize;
                }
            }
            Instr::ChainPre { body } => match self.fired.take() {
                Some(h) => {
                    if h.offset != self.offset {
                        self.refail();
                    }
                    // composed function stays on the stack for the operand
                }
                None => {
                    let f = self.pop();
                    let acc = self.pop();
                    self.stack
                        .push(crate::ast::fn_val(crate::ast::compose(as_fn(&acc), as_fn(&f))));
                    self.update_check();
                    self.pc = *body as usize;
                }
            },
            Instr::ChainPost { body } => match self.fired.take() {
                Some(h) => {
                    if h.offset != self.offset {
                        self.refail();
                    }
                }
                None => {
                    let f = self.pop();
                    let v = self.pop();
                    self.stack.push(as_fn(&f)(v));
                    self.update_check();
                    self.pc = *body as usize;
                }
            },
            Instr::ChainLeft { body } => match self.fired.take() {
                Some(h) => {
                    if h.offset != self.offset {
                        self.refail();
                    }
                }
                None => {
                    let y = self.pop();
                    let f = self.pop();
                    let x = self.pop();
                    self.stack.push(as_fn2(&f)(x, y));
                    self.update_check();
                    self.pc = *body as usize;
                }
            },
            Instr::Commit => self.commit_slot(),
            Instr::ChainRight { body } => match self.fired.take() {
                Some(h) => {
                    if h.offset != self.offset {
                        self.refail();
                    } else {
                        self.fold_chain_right();
                    }
                }
                None => {
                    // operator value committed on the stack, operand pending
                    let h = self.handlers.last_mut().expect("loop without its handler");
                    h.stack_depth += 1;
                    self.pc = *body as usize;
                }
            },
            Instr::SepEndBy { body } => match self.fired.take() {
                Some(h) => {
                    if h.offset != self.offset {
                        self.refail();
                    } else {
                        self.collect_sep_end_by();
                    }
                }
                None => {
                    self.pop();
                    self.update_check();
                    self.pc = *body as usize;
                }
            },

            // ── tablified alternation ────────────────────────────
            Instr::JumpTable { table, default, expected } => {
                self.push_handler(*default);
                match self.peek_char().and_then(|c| table.get(&c)) {
                    Some(t) => self.pc = *t as usize,
                    None => {
                        let found = self.here();
                        self.fail(Expected::Set(expected.clone()), Some(found), None);
                    }
                }
            }

            // ── calls ────────────────────────────────────────────
            Instr::GoSub { target, expected } => {
                self.frames.push(Frame::Return {
                    code: Rc::clone(&self.code),
                    pc: self.pc,
                    site_offset: self.offset,
                    label: expected.clone(),
                    entered: None,
                });
                self.pc = *target as usize;
            }
            Instr::Return => match self.frames.pop() {
                Some(Frame::Return { code, pc, entered, .. }) => {
                    if let Some(key) = entered {
                        self.dec_active(key);
                    }
                    self.code = code;
                    self.pc = pc;
                }
                _ => panic!("return without a call frame"),
            },
            Instr::Call { target, cache, expected } => {
                let program = {
                    let cached = cache.borrow().clone();
                    match cached {
                        Some(p) => p,
                        None => {
                            let node = target.upgrade();
                            let p = crate::codegen::compile(&node).unwrap_or_else(|e| {
                                panic!("recursive parser failed to compile: {e}")
                            });
                            *cache.borrow_mut() = Some(p.clone());
                            p
                        }
                    }
                };
                self.enter_program(program, expected.clone());
            }
            Instr::DynCall { k } => {
                let x = self.pop();
                let node = k(x);
                let program = crate::codegen::compile(&node)
                    .unwrap_or_else(|e| panic!("bound parser failed to compile: {e}"));
                self.enter_program(program, None);
            }

            // ── registers ────────────────────────────────────────
            Instr::Get(reg) => {
                let v = self.regs[*reg]
                    .clone()
                    .unwrap_or_else(|| panic!("register {reg} read before it was written"));
                self.stack.push(v);
            }
            Instr::PutReg(reg) => {
                let v = self.pop();
                self.regs[*reg] = Some(v);
                self.stack.push(dval(()));
            }
            Instr::ModifyReg { reg, f } => {
                let cur = self.regs[*reg]
                    .take()
                    .unwrap_or_else(|| panic!("register {reg} modified before it was written"));
                self.regs[*reg] = Some(f(cur));
                self.stack.push(dval(()));
            }
            Instr::LocalEntry(reg) => {
                let v = self.pop();
                self.frames.push(Frame::RegSave { reg: *reg, saved: self.regs[*reg].take() });
                self.regs[*reg] = Some(v);
            }
            Instr::LocalExit(reg) => match self.frames.pop() {
                Some(Frame::RegSave { reg: r, saved }) if r == *reg => self.regs[r] = saved,
                _ => panic!("local exit without its register frame"),
            },

            // ── trace ────────────────────────────────────────────
            Instr::LogBegin { name, brk } => self.trace(name, TracePhase::Enter, *brk),
            Instr::LogEnd { name, brk } => match self.fired.take() {
                Some(_) => {
                    self.trace(name, TracePhase::ExitFailure, *brk);
                    self.refail();
                }
                None => {
                    self.pop_handler();
                    self.trace(name, TracePhase::ExitSuccess, *brk);
                }
            },

            Instr::Label(_) | Instr::Nop => panic!("pseudo-instruction in frozen program"),
        }
    }

    fn fail_char(&mut self, c: char, expected: &Option<String>) {
        let exp = Expected::One(expected.clone().unwrap_or_else(|| format!("\"{c}\"")));
        let found = self.here();
        self.fail(exp, Some(found), None);
    }

    fn fail_string(&mut self, s: &str, expected: &Option<String>) {
        let exp = Expected::One(expected.clone().unwrap_or_else(|| format!("\"{s}\"")));
        let found = self.here();
        self.fail(exp, Some(found), None);
    }

    /// Scan a double-quoted literal without moving the cursor. Returns the
    /// decoded content and the number of code points the literal spans.
    fn scan_string_literal(&self, raw: bool) -> Option<(String, usize)> {
        let mut i = self.offset;
        if self.input.get(i) != Some(&'"') {
            return None;
        }
        i += 1;
        let mut out = String::new();
        while let Some(&c) = self.input.get(i) {
            match c {
                '"' => return Some((out, i + 1 - self.offset)),
                '\\' if !raw => {
                    match self.input.get(i + 1) {
                        Some('n') => out.push('\n'),
                        Some('t') => out.push('\t'),
                        Some('\\') => out.push('\\'),
                        Some('"') => out.push('"'),
                        _ => return None,
                    }
                    i += 2;
                }
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        None
    }

    /// Fold the committed `x f x f … x` run above the chain mark into a
    /// right-associated application.
    fn fold_chain_right(&mut self) {
        let mut items = Vec::new();
        loop {
            let v = self.pop();
            if v.is::<ChainMark>() {
                break;
            }
            items.push(v);
        }
        items.reverse();
        if items.is_empty() || items.len() % 2 == 0 {
            // no operand at all, or a trailing operator with no operand
            self.refail();
            return;
        }
        let mut acc = items.pop().expect("chain fold operand");
        while let Some(f) = items.pop() {
            let x = items.pop().expect("chain fold operand under operator");
            acc = as_fn2(&f)(x, acc);
        }
        self.stack.push(acc);
    }

    fn collect_sep_end_by(&mut self) {
        let mut items = Vec::new();
        loop {
            let v = self.pop();
            if v.is::<ChainMark>() {
                break;
            }
            items.push(v);
        }
        items.reverse();
        if items.is_empty() {
            self.refail();
        } else {
            self.stack.push(dval(items));
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
