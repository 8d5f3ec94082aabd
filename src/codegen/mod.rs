use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::ast::{as_fn, fn_val, identity_fn, ChainMark, Comb, Node, NodeRef};
use crate::combinator::DebugBreak;
use crate::preprocess::preprocess;
use crate::optimise::optimise;
use crate::vm::Instr;

// ── Build errors ─────────────────────────────────────────────────────

/// Combinator misuse caught while compiling, as opposed to a parse
/// failure at run time.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("`{combinator}` loop body can succeed without consuming input")]
    NonConsumingLoop { combinator: &'static str },
    #[error("recursive parser was never tied back to a definition")]
    UnboundParser,
}

// ── Frozen programs ──────────────────────────────────────────────────

/// A resolved, frozen instruction array plus the index of positions that
/// hold per-execution mutable state.
pub(crate) struct Program {
    pub(crate) code: Rc<[Instr]>,
    pub(crate) stateful: Box<[usize]>,
    /// Whether any instruction accumulates across loop iterations; only
    /// such programs need isolated copies for re-entrant activations.
    pub(crate) has_loop_state: bool,
}

impl Program {
    /// A copy whose stateful slots are fresh, safe to run while another
    /// activation of the original is in flight.
    pub(crate) fn isolated_program(&self) -> Program {
        let mut code: Vec<Instr> = self.code.to_vec();
        for &i in self.stateful.iter() {
            code[i] = code[i].refreshed();
        }
        Program {
            code: code.into(),
            stateful: self.stateful.clone(),
            has_loop_state: self.has_loop_state,
        }
    }
}

/// Run the whole pipeline for a root node, reusing the node's cached
/// program if it was compiled before.
pub(crate) fn compile(root: &NodeRef) -> Result<Rc<Program>, CompileError> {
    if let Some(p) = root.cached_program() {
        return Ok(p);
    }
    let processed = preprocess(root)?;
    optimise(&processed)?;
    let program = Rc::new(emit(&processed)?);
    root.cache_program(program.clone());
    Ok(program)
}

// ── Emission ─────────────────────────────────────────────────────────

enum Work {
    Gen(NodeRef),
    Emit(Instr),
}

struct Emitter {
    buf: Vec<Instr>,
    next_label: u32,
    sub_labels: HashMap<*const Node, u32>,
    sub_queue: VecDeque<NodeRef>,
}

fn emit(root: &NodeRef) -> Result<Program, CompileError> {
    let mut e = Emitter {
        buf: Vec::new(),
        next_label: 0,
        sub_labels: HashMap::new(),
        sub_queue: VecDeque::new(),
    };
    e.generate(root.clone());

    // callable suffix: subroutines queued during the main program (and any
    // queued from inside other subroutines) follow a jump over them
    if !e.sub_queue.is_empty() {
        let end = e.fresh_label();
        e.buf.push(Instr::Jump(end));
        while let Some(body) = e.sub_queue.pop_front() {
            let label = e.sub_labels[&Rc::as_ptr(&body)];
            e.buf.push(Instr::Label(label));
            e.generate(body);
            e.buf.push(Instr::Return);
        }
        e.buf.push(Instr::Label(end));
    }

    Ok(resolve_labels(e.buf))
}

impl Emitter {
    fn fresh_label(&mut self) -> u32 {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    fn sub_label(&mut self, body: &NodeRef) -> u32 {
        let key = Rc::as_ptr(body);
        if let Some(&l) = self.sub_labels.get(&key) {
            return l;
        }
        let l = self.fresh_label();
        self.sub_labels.insert(key, l);
        self.sub_queue.push_back(body.clone());
        l
    }

    /// Top-down generation on an explicit work stack; composites push
    /// their shape in reverse so it pops in order.
    fn generate(&mut self, root: NodeRef) {
        let mut work = vec![Work::Gen(root)];
        while let Some(item) = work.pop() {
            match item {
                Work::Emit(i) => self.buf.push(i),
                Work::Gen(n) => {
                    let items = self.expand(&n);
                    work.extend(items.into_iter().rev());
                }
            }
        }
    }

    fn expand(&mut self, n: &NodeRef) -> Vec<Work> {
        use Work::{Emit, Gen};
        let comb = n.comb_clone();
        match comb {
            Comb::Pure(x) => vec![Emit(Instr::Push(x))],
            Comb::Line => vec![Emit(Instr::Line)],
            Comb::Col => vec![Emit(Instr::Col)],
            Comb::Get(r) => vec![Emit(Instr::Get(r))],
            Comb::Modify(r, f) => vec![Emit(Instr::ModifyReg { reg: r, f })],
            Comb::Put(r, p) => vec![Gen(p), Emit(Instr::PutReg(r))],
            Comb::Local { reg, init, body } => vec![
                Gen(init),
                Emit(Instr::LocalEntry(reg)),
                Gen(body),
                Emit(Instr::LocalExit(reg)),
            ],

            Comb::CharTok { c, expected } => vec![Emit(Instr::CharTok { c, expected })],
            Comb::StringTok { s, expected } => vec![Emit(Instr::StringTok { s, expected })],
            Comb::Satisfy { pred, expected } => vec![Emit(Instr::Satisfy { pred, expected })],
            Comb::Eof { expected } => vec![Emit(Instr::Eof { expected })],
            Comb::Keyword { kw, expected } => vec![Emit(Instr::Keyword { kw, expected })],
            Comb::Operator { op, expected } => vec![Emit(Instr::Operator { op, expected })],
            Comb::StringLiteral { raw, expected } => {
                vec![Emit(Instr::StringLit { raw, expected })]
            }

            Comb::Empty { expected } => vec![Emit(Instr::Empty { expected })],
            Comb::Fail { msg } => vec![Emit(Instr::Fail { msg })],
            Comb::Unexpected { msg } => vec![Emit(Instr::Unexpected { msg })],
            Comb::FastFail { p, gen } => vec![Gen(p), Emit(Instr::FastFail { gen })],
            Comb::FastUnexpected { p, gen } => {
                vec![Gen(p), Emit(Instr::FastUnexpected { gen })]
            }
            Comb::Ensure { p, pred } => vec![Gen(p), Emit(Instr::Ensure { pred })],
            Comb::Guard { p, pred, msg } => vec![Gen(p), Emit(Instr::Guard { pred, msg })],
            Comb::FastGuard { p, pred, gen } => {
                vec![Gen(p), Emit(Instr::FastGuard { pred, gen })]
            }

            Comb::Apply(pf, px) => {
                // map over a token folds into one instruction
                if let Comb::Pure(f) = pf.comb_clone() {
                    let f = as_fn(&f);
                    return match px.comb_clone() {
                        Comb::CharTok { c, expected } => {
                            vec![Emit(Instr::CharTokFastPerform { c, f, expected })]
                        }
                        Comb::StringTok { s, expected } => {
                            vec![Emit(Instr::StringTokFastPerform { s, f, expected })]
                        }
                        _ => vec![Gen(px), Emit(Instr::Perform(f))],
                    };
                }
                vec![Gen(pf), Gen(px), Emit(Instr::Apply)]
            }
            Comb::ThenRight(p, q) => {
                if let Comb::Pure(x) = q.comb_clone() {
                    return match p.comb_clone() {
                        Comb::CharTok { c, expected } => {
                            vec![Emit(Instr::CharTokExchange { c, x, expected })]
                        }
                        Comb::StringTok { s, expected } => {
                            vec![Emit(Instr::StringTokExchange { s, x, expected })]
                        }
                        Comb::Satisfy { pred, expected } => {
                            vec![Emit(Instr::SatisfyExchange { pred, x, expected })]
                        }
                        _ => vec![Gen(p), Emit(Instr::Exchange(x))],
                    };
                }
                vec![Gen(p), Emit(Instr::Pop), Gen(q)]
            }
            Comb::ThenLeft(p, q) => vec![Gen(p), Gen(q), Emit(Instr::Pop)],
            Comb::Lift2(f, p, q) => vec![Gen(p), Gen(q), Emit(Instr::Lift2(f))],
            Comb::Lift3(f, p, q, r) => vec![Gen(p), Gen(q), Gen(r), Emit(Instr::Lift3(f))],
            Comb::Bind(p, k) => vec![Gen(p), Emit(Instr::DynCall { k })],

            Comb::Ternary { b, t, f } => {
                let on_false = self.fresh_label();
                let end = self.fresh_label();
                vec![
                    Gen(b),
                    Emit(Instr::IfFalse(on_false)),
                    Gen(t),
                    Emit(Instr::Jump(end)),
                    Emit(Instr::Label(on_false)),
                    Gen(f),
                    Emit(Instr::Label(end)),
                ]
            }

            Comb::Alt(..) => self.expand_alt(n),

            Comb::Attempt(p) => {
                let h = self.fresh_label();
                vec![
                    Emit(Instr::PushHandler(h)),
                    Gen(p),
                    Emit(Instr::Label(h)),
                    Emit(Instr::Attempt),
                ]
            }
            Comb::LookAhead(p) => {
                let h = self.fresh_label();
                vec![
                    Emit(Instr::PushHandler(h)),
                    Gen(p),
                    Emit(Instr::Label(h)),
                    Emit(Instr::Look),
                ]
            }
            Comb::NotFollowedBy { p, expected } => {
                let h = self.fresh_label();
                vec![
                    Emit(Instr::PushHandler(h)),
                    Gen(p),
                    Emit(Instr::Label(h)),
                    Emit(Instr::NotFollowedBy { expected }),
                ]
            }

            Comb::Many(p) => {
                let (body, h) = (self.fresh_label(), self.fresh_label());
                vec![
                    Emit(Instr::InputCheck(h)),
                    Emit(Instr::Label(body)),
                    Gen(p),
                    Emit(Instr::Label(h)),
                    Emit(Instr::Many { body, acc: Default::default() }),
                ]
            }
            Comb::SkipMany(p) => {
                let (body, h) = (self.fresh_label(), self.fresh_label());
                vec![
                    Emit(Instr::InputCheck(h)),
                    Emit(Instr::Label(body)),
                    Gen(p),
                    Emit(Instr::Label(h)),
                    Emit(Instr::SkipMany { body }),
                ]
            }
            Comb::ManyUntil { body: p } => {
                let body = self.fresh_label();
                vec![
                    Emit(Instr::Push(crate::ast::dval(ChainMark))),
                    Emit(Instr::Label(body)),
                    Gen(p),
                    Emit(Instr::ManyUntil { body }),
                ]
            }
            Comb::ChainPre { op, p } => {
                let (body, h) = (self.fresh_label(), self.fresh_label());
                vec![
                    Emit(Instr::Push(fn_val(identity_fn()))),
                    Emit(Instr::InputCheck(h)),
                    Emit(Instr::Label(body)),
                    Gen(op),
                    Emit(Instr::Label(h)),
                    Emit(Instr::ChainPre { body }),
                    Gen(p),
                    Emit(Instr::Apply),
                ]
            }
            Comb::ChainPost { p, op } => {
                let (body, h) = (self.fresh_label(), self.fresh_label());
                vec![
                    Gen(p),
                    Emit(Instr::InputCheck(h)),
                    Emit(Instr::Label(body)),
                    Gen(op),
                    Emit(Instr::Label(h)),
                    Emit(Instr::ChainPost { body }),
                ]
            }
            Comb::ChainLeft { p, op } => {
                let (body, h) = (self.fresh_label(), self.fresh_label());
                vec![
                    Gen(p.clone()),
                    Emit(Instr::InputCheck(h)),
                    Emit(Instr::Label(body)),
                    Gen(op),
                    Gen(p),
                    Emit(Instr::Label(h)),
                    Emit(Instr::ChainLeft { body }),
                ]
            }
            Comb::ChainRight { p, op } => {
                let (body, h) = (self.fresh_label(), self.fresh_label());
                vec![
                    Emit(Instr::Push(crate::ast::dval(ChainMark))),
                    Emit(Instr::InputCheck(h)),
                    Emit(Instr::Label(body)),
                    Gen(p),
                    Emit(Instr::Commit),
                    Gen(op),
                    Emit(Instr::Label(h)),
                    Emit(Instr::ChainRight { body }),
                ]
            }
            Comb::SepEndBy1 { p, sep } => {
                let (body, h) = (self.fresh_label(), self.fresh_label());
                vec![
                    Emit(Instr::Push(crate::ast::dval(ChainMark))),
                    Emit(Instr::InputCheck(h)),
                    Emit(Instr::Label(body)),
                    Gen(p),
                    Emit(Instr::Commit),
                    Gen(sep),
                    Emit(Instr::Label(h)),
                    Emit(Instr::SepEndBy { body }),
                ]
            }

            Comb::Subroutine { p, expected } => {
                let target = self.sub_label(&p);
                vec![Emit(Instr::GoSub { target, expected })]
            }
            Comb::Fixpoint { target, expected } => vec![Emit(Instr::Call {
                target,
                cache: Default::default(),
                expected,
            })],

            Comb::Debug { p, name, brk } => {
                let h = self.fresh_label();
                let on_entry = matches!(brk, DebugBreak::OnEntry | DebugBreak::Always);
                let on_exit = matches!(brk, DebugBreak::OnExit | DebugBreak::Always);
                vec![
                    Emit(Instr::LogBegin { name: name.clone(), brk: on_entry }),
                    Emit(Instr::PushHandler(h)),
                    Gen(p),
                    Emit(Instr::Label(h)),
                    Emit(Instr::LogEnd { name, brk: on_exit }),
                ]
            }

            Comb::ErrorRelabel { .. } => {
                panic!("label node survived preprocess; codegen must never see one")
            }
        }
    }

    // ── alternation ──────────────────────────────────────────────

    fn expand_alt(&mut self, n: &NodeRef) -> Vec<Work> {
        // collect the right spine
        let mut branches = Vec::new();
        let mut cur = n.clone();
        loop {
            match cur.comb_clone() {
                Comb::Alt(p, q) => {
                    branches.push(p);
                    cur = q;
                }
                _ => {
                    branches.push(cur);
                    break;
                }
            }
        }

        // the longest prefix of branches with a known discriminating first
        // character goes into the table; the rest is the default path
        let mut leads = Vec::new();
        for b in &branches {
            match leading_token(b) {
                Some(lead) => leads.push(lead),
                None => break,
            }
        }
        let distinct: std::collections::HashSet<char> =
            leads.iter().map(|(c, _)| *c).collect();
        if leads.len() >= 2 && distinct.len() >= 2 {
            return self.expand_table(&branches, &leads);
        }

        self.expand_alt_plain(n)
    }

    /// The two-branch shapes. `n` is an `Alt` node; nested alternations in
    /// its right branch expand recursively through the work stack.
    fn expand_alt_plain(&mut self, n: &NodeRef) -> Vec<Work> {
        use Work::{Emit, Gen};
        let (p, q) = match n.comb_clone() {
            Comb::Alt(p, q) => (p, q),
            _ => unreachable!("plain alternation on a non-alt node"),
        };

        if let Comb::Attempt(u) = p.comb_clone() {
            let h = self.fresh_label();
            if let Comb::Pure(x) = q.comb_clone() {
                return vec![
                    Emit(Instr::PushHandler(h)),
                    Gen(u),
                    Emit(Instr::Label(h)),
                    Emit(Instr::AlwaysRecoverWith(x)),
                ];
            }
            let s = self.fresh_label();
            return vec![
                Emit(Instr::PushHandler(h)),
                Gen(u),
                Emit(Instr::Label(h)),
                Emit(Instr::JumpGoodAttempt(s)),
                Gen(q),
                Emit(Instr::Label(s)),
            ];
        }

        let h = self.fresh_label();
        let s = self.fresh_label();
        if let Comb::Pure(x) = q.comb_clone() {
            return vec![
                Emit(Instr::InputCheck(h)),
                Gen(p),
                Emit(Instr::JumpGood(s)),
                Emit(Instr::Label(h)),
                Emit(Instr::RecoverWith(x)),
                Emit(Instr::Label(s)),
            ];
        }
        vec![
            Emit(Instr::InputCheck(h)),
            Gen(p),
            Emit(Instr::JumpGood(s)),
            Emit(Instr::Label(h)),
            Emit(Instr::Catch),
            Gen(q),
            Emit(Instr::Label(s)),
        ]
    }

    fn expand_table(&mut self, branches: &[NodeRef], leads: &[(char, String)]) -> Vec<Work> {
        use Work::{Emit, Gen};
        let end = self.fresh_label();
        let default = self.fresh_label();

        // group same-lead branches in order; each group keeps alternation
        // order among its members
        let mut groups: Vec<(char, Vec<NodeRef>)> = Vec::new();
        for (branch, (c, _)) in branches.iter().zip(leads.iter()) {
            match groups.iter_mut().find(|(gc, _)| gc == c) {
                Some((_, members)) => members.push(branch.clone()),
                None => groups.push((*c, vec![branch.clone()])),
            }
        }
        let expected: Vec<String> = leads.iter().map(|(_, l)| l.clone()).collect();

        let mut table = HashMap::new();
        let mut items = Vec::new();
        let mut group_work = Vec::new();
        for (c, members) in groups {
            let label = self.fresh_label();
            table.insert(c, label);
            group_work.push(Emit(Instr::Label(label)));
            group_work.push(Gen(fold_alt(members)));
            group_work.push(Emit(Instr::JumpGood(end)));
        }

        items.push(Emit(Instr::JumpTable { table, default, expected }));
        items.extend(group_work);
        items.push(Emit(Instr::Label(default)));
        items.push(Emit(Instr::Catch));
        let rest = &branches[leads.len()..];
        if rest.is_empty() {
            items.push(Emit(Instr::Empty { expected: None }));
        } else {
            items.push(Gen(fold_alt(rest.to_vec())));
        }
        items.push(Emit(Instr::Label(end)));
        items
    }
}

/// Right-nest a branch list back into alternation nodes.
fn fold_alt(mut branches: Vec<NodeRef>) -> NodeRef {
    let mut acc = branches.pop().expect("alternation fold of no branches");
    while let Some(b) = branches.pop() {
        let n = Node::new(Comb::Alt(b, acc));
        n.mark_done();
        acc = n;
    }
    acc
}

/// The discriminating first character of a branch, with the label it
/// contributes to the table's expected set. Walks only through wrappers
/// that are guaranteed to read their first character from this position.
fn leading_token(n: &NodeRef) -> Option<(char, String)> {
    let mut cur = n.clone();
    loop {
        match cur.comb_clone() {
            Comb::CharTok { c, expected } => {
                return Some((c, expected.unwrap_or_else(|| format!("\"{c}\""))));
            }
            Comb::StringTok { s, expected } => {
                let first = s.chars().next()?;
                return Some((first, expected.unwrap_or_else(|| format!("\"{s}\""))));
            }
            Comb::Keyword { kw, expected } => {
                let first = kw.chars().next()?;
                return Some((first, expected.unwrap_or_else(|| kw.to_string())));
            }
            Comb::Operator { op, expected } => {
                let first = op.chars().next()?;
                return Some((first, expected.unwrap_or_else(|| op.to_string())));
            }
            Comb::StringLiteral { expected, .. } => {
                return Some(('"', expected.unwrap_or_else(|| "string".to_string())));
            }
            Comb::Attempt(p) => cur = p,
            Comb::Apply(pf, px) => {
                if matches!(pf.comb_clone(), Comb::Pure(_)) {
                    cur = px;
                } else {
                    return None;
                }
            }
            Comb::Lift2(_, p, _) | Comb::Lift3(_, p, _, _) => cur = p,
            Comb::ThenRight(p, _) | Comb::ThenLeft(p, _) => cur = p,
            _ => return None,
        }
    }
}

// ── Label resolution ─────────────────────────────────────────────────

/// Two sweeps over the raw buffer: the first nulls label markers (after a
/// local peephole over adjacent pairs) and records their offsets in the
/// compacted array; the second rewrites every target to an absolute offset
/// and drops the null slots. The stateful-position index is built from the
/// final array.
fn resolve_labels(mut buf: Vec<Instr>) -> Program {
    // peephole on directly adjacent pairs; a label between two
    // instructions keeps them apart, so jump targets stay sound
    for i in 0..buf.len().saturating_sub(1) {
        let fuse = match (&buf[i], &buf[i + 1]) {
            (Instr::Push(_), Instr::Pop) => Some(None),
            (Instr::Push(_), Instr::Exchange(x)) => Some(Some(x.clone())),
            _ => None,
        };
        match fuse {
            Some(None) => {
                buf[i] = Instr::Nop;
                buf[i + 1] = Instr::Nop;
            }
            Some(Some(x)) => {
                buf[i] = Instr::Nop;
                buf[i + 1] = Instr::Push(x);
            }
            None => {}
        }
    }

    // sweep 1: record label offsets in the compacted array
    let mut offsets: HashMap<u32, u32> = HashMap::new();
    let mut compact = 0u32;
    for instr in buf.iter_mut() {
        match instr {
            Instr::Label(l) => {
                offsets.insert(*l, compact);
                *instr = Instr::Nop;
            }
            Instr::Nop => {}
            _ => compact += 1,
        }
    }

    // sweep 2: rewrite targets and drop the null slots
    let at = |l: u32| *offsets.get(&l).expect("jump to an unemitted label");
    let mut out = Vec::with_capacity(compact as usize);
    for instr in buf {
        let rewritten = match instr {
            Instr::Nop => continue,
            Instr::Jump(l) => Instr::Jump(at(l)),
            Instr::IfFalse(l) => Instr::IfFalse(at(l)),
            Instr::JumpGood(l) => Instr::JumpGood(at(l)),
            Instr::JumpGoodAttempt(l) => Instr::JumpGoodAttempt(at(l)),
            Instr::PushHandler(l) => Instr::PushHandler(at(l)),
            Instr::InputCheck(l) => Instr::InputCheck(at(l)),
            Instr::Many { body, acc } => Instr::Many { body: at(body), acc },
            Instr::SkipMany { body } => Instr::SkipMany { body: at(body) },
            Instr::ManyUntil { body } => Instr::ManyUntil { body: at(body) },
            Instr::ChainPre { body } => Instr::ChainPre { body: at(body) },
            Instr::ChainPost { body } => Instr::ChainPost { body: at(body) },
            Instr::ChainLeft { body } => Instr::ChainLeft { body: at(body) },
            Instr::ChainRight { body } => Instr::ChainRight { body: at(body) },
            Instr::SepEndBy { body } => Instr::SepEndBy { body: at(body) },
            Instr::GoSub { target, expected } => {
                Instr::GoSub { target: at(target), expected }
            }
            Instr::JumpTable { table, default, expected } => Instr::JumpTable {
                table: table.into_iter().map(|(c, l)| (c, at(l))).collect(),
                default: at(default),
                expected,
            },
            other => other,
        };
        out.push(rewritten);
    }

    let stateful: Vec<usize> = out
        .iter()
        .enumerate()
        .filter_map(|(i, instr)| instr.is_stateful().then_some(i))
        .collect();
    let has_loop_state = out.iter().any(|i| matches!(i, Instr::Many { .. }));
    Program {
        code: out.into(),
        stateful: stateful.into_boxed_slice(),
        has_loop_state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::*;

    fn program_of<A: Clone + 'static>(p: &Parser<A>) -> Rc<Program> {
        compile(&p.node()).expect("compile")
    }

    fn has(p: &Rc<Program>, name: &str) -> bool {
        p.code.iter().any(|i| i.name() == name)
    }

    #[test]
    fn labels_never_survive_resolution() {
        let p = many(char_('a').or(char_('b'))).then(eof());
        let program = program_of(&p);
        assert!(!program.code.iter().any(|i| matches!(i, Instr::Label(_) | Instr::Nop)));
    }

    #[test]
    fn map_over_char_fuses_to_one_instruction() {
        let p = char_('a').map(|c| c.to_ascii_uppercase());
        let program = program_of(&p);
        assert!(has(&program, "CharTokFastPerform"));
        assert!(!has(&program, "Perform"));
    }

    #[test]
    fn then_pure_on_char_becomes_exchange() {
        let p = char_('a').then(pure(7usize));
        let program = program_of(&p);
        assert!(has(&program, "CharTokExchange"));
    }

    #[test]
    fn discriminating_alternation_tablifies() {
        let p = string("foo")
            .or(string("bar"))
            .or(string("baz"))
            .or(string("qux"));
        let program = program_of(&p);
        let table = program.code.iter().find_map(|i| match i {
            Instr::JumpTable { table, expected, .. } => Some((table.len(), expected.len())),
            _ => None,
        });
        // 'b' leads two branches, so three distinct leads for four branches
        assert_eq!(table, Some((3, 4)));
    }

    #[test]
    fn single_lead_alternation_stays_plain() {
        let p = string("foo").or(string("far"));
        let program = program_of(&p);
        assert!(!has(&program, "JumpTable"));
        assert!(has(&program, "InputCheck"));
    }

    #[test]
    fn alternation_with_opaque_branch_keeps_it_as_default() {
        let p = string("foo")
            .or(string("bar"))
            .or(many(char_('z')).map(|v| v.into_iter().collect::<String>()));
        let program = program_of(&p);
        assert!(has(&program, "JumpTable"));
        assert!(has(&program, "Many"));
    }

    #[test]
    fn subroutine_emits_call_suffix_once() {
        let shared = char_('a').subroutine();
        let p = shared.clone().then(shared);
        let program = program_of(&p);
        let gosubs = program.code.iter().filter(|i| i.name() == "GoSub").count();
        let returns = program.code.iter().filter(|i| i.name() == "Return").count();
        let chars = program.code.iter().filter(|i| i.name() == "CharTok").count();
        assert_eq!(gosubs, 2);
        assert_eq!(returns, 1);
        assert_eq!(chars, 1);
    }

    #[test]
    fn stateful_positions_are_indexed() {
        let p = many(char_('a'));
        let program = program_of(&p);
        assert_eq!(program.stateful.len(), 1);
        assert!(program.code[program.stateful[0]].is_stateful());
    }

    #[test]
    fn isolated_program_shares_no_loop_state() {
        let p = many(char_('a'));
        let program = program_of(&p);
        let copy = program.isolated_program();
        assert_eq!(copy.code.len(), program.code.len());
        assert_eq!(copy.stateful, program.stateful);
    }

    #[test]
    fn recursive_parser_compiles_to_a_call() {
        let p = fix(|rec| char_('a').then(rec).or(char_('b')));
        let program = program_of(&p);
        assert!(has(&program, "Call"));
    }

    #[test]
    fn compilation_is_cached_on_the_node() {
        let p = char_('a');
        let one = program_of(&p);
        let two = program_of(&p);
        assert!(Rc::ptr_eq(&one, &two));
    }

    #[test]
    fn non_consuming_loop_is_reported() {
        let p = many(pure(1usize));
        assert_eq!(
            compile(&p.node()).err(),
            Some(CompileError::NonConsumingLoop { combinator: "many" })
        );
    }
}
