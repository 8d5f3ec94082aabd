use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::codegen::{CompileError, Program};
use crate::combinator::DebugBreak;

// ── Dynamic values ───────────────────────────────────────────────────
//
// The machine's value stack is heterogeneous: every parse result is an
// `Rc<dyn Any>`, and functions travelling through `Apply`/`Perform` are
// themselves stack values wrapping a `DynFn`. The typed surface in
// `combinator` erases on the way in and downcasts on the way out.

pub(crate) type DynVal = Rc<dyn Any>;
pub(crate) type DynFn = Rc<dyn Fn(DynVal) -> DynVal>;
pub(crate) type DynFn2 = Rc<dyn Fn(DynVal, DynVal) -> DynVal>;
pub(crate) type DynFn3 = Rc<dyn Fn(DynVal, DynVal, DynVal) -> DynVal>;
pub(crate) type DynPred = Rc<dyn Fn(&DynVal) -> bool>;
pub(crate) type CharPred = Rc<dyn Fn(char) -> bool>;
pub(crate) type MsgFn = Rc<dyn Fn(DynVal) -> String>;
pub(crate) type BindFn = Rc<dyn Fn(DynVal) -> NodeRef>;

pub(crate) fn dval<A: 'static>(x: A) -> DynVal {
    Rc::new(x)
}

/// Unwrap a dynamic value back into `A`, avoiding a clone when the value is
/// uniquely owned.
pub(crate) fn take<A: Clone + 'static>(v: DynVal) -> A {
    match v.downcast::<A>() {
        Ok(rc) => Rc::try_unwrap(rc).unwrap_or_else(|rc| (*rc).clone()),
        Err(_) => panic!(
            "parser produced a value of an unexpected type (wanted {})",
            std::any::type_name::<A>()
        ),
    }
}

pub(crate) fn as_fn(v: &DynVal) -> DynFn {
    match v.clone().downcast::<DynFn>() {
        Ok(rc) => (*rc).clone(),
        Err(_) => panic!("expected a function value on the stack"),
    }
}

pub(crate) fn as_fn2(v: &DynVal) -> DynFn2 {
    match v.clone().downcast::<DynFn2>() {
        Ok(rc) => (*rc).clone(),
        Err(_) => panic!("expected a binary function value on the stack"),
    }
}

pub(crate) fn fn_val(f: DynFn) -> DynVal {
    Rc::new(f)
}

pub(crate) fn fn2_val(f: DynFn2) -> DynVal {
    Rc::new(f)
}

pub(crate) fn compose(f: DynFn, g: DynFn) -> DynFn {
    Rc::new(move |x| f(g(x)))
}

pub(crate) fn identity_fn() -> DynFn {
    Rc::new(|x| x)
}

/// Sentinel pushed under loop items so the recovery instruction can find
/// where the committed prefix starts.
pub(crate) struct ChainMark;

/// Sentinel value produced by the terminator branch of `many_until`.
pub(crate) struct LoopStop;

// ── Combinator nodes ─────────────────────────────────────────────────

/// The closed combinator family. Children are node references; leaves that
/// can carry a user-supplied error label do so in an `expected` slot, which
/// preprocess fills when a `label` wrapper is absorbed.
#[derive(Clone)]
pub(crate) enum Comb {
    // value producers
    Pure(DynVal),
    Line,
    Col,
    Get(usize),
    Modify(usize, DynFn),
    // primitive consumers
    CharTok { c: char, expected: Option<String> },
    StringTok { s: Rc<str>, expected: Option<String> },
    Satisfy { pred: CharPred, expected: Option<String> },
    Eof { expected: Option<String> },
    Keyword { kw: Rc<str>, expected: Option<String> },
    Operator { op: Rc<str>, expected: Option<String> },
    StringLiteral { raw: bool, expected: Option<String> },
    // sequencing
    Apply(NodeRef, NodeRef),
    ThenRight(NodeRef, NodeRef),
    ThenLeft(NodeRef, NodeRef),
    Bind(NodeRef, BindFn),
    Lift2(DynFn2, NodeRef, NodeRef),
    Lift3(DynFn3, NodeRef, NodeRef, NodeRef),
    // choice
    Alt(NodeRef, NodeRef),
    Attempt(NodeRef),
    LookAhead(NodeRef),
    NotFollowedBy { p: NodeRef, expected: Option<String> },
    Ternary { b: NodeRef, t: NodeRef, f: NodeRef },
    // iteration
    Many(NodeRef),
    SkipMany(NodeRef),
    ChainPre { op: NodeRef, p: NodeRef },
    ChainPost { p: NodeRef, op: NodeRef },
    ChainLeft { p: NodeRef, op: NodeRef },
    ChainRight { p: NodeRef, op: NodeRef },
    SepEndBy1 { p: NodeRef, sep: NodeRef },
    ManyUntil { body: NodeRef },
    // failure
    Empty { expected: Option<String> },
    Fail { msg: String },
    Unexpected { msg: String },
    FastFail { p: NodeRef, gen: MsgFn },
    FastUnexpected { p: NodeRef, gen: MsgFn },
    // filtering
    Ensure { p: NodeRef, pred: DynPred },
    Guard { p: NodeRef, pred: DynPred, msg: String },
    FastGuard { p: NodeRef, pred: DynPred, gen: MsgFn },
    // state
    Put(usize, NodeRef),
    Local { reg: usize, init: NodeRef, body: NodeRef },
    // meta
    ErrorRelabel { p: NodeRef, label: String },
    Subroutine { p: NodeRef, expected: Option<String> },
    Fixpoint { target: FixTarget, expected: Option<String> },
    Debug { p: NodeRef, name: Rc<str>, brk: DebugBreak },
}

/// A `Fixpoint` introduced for a back-edge must not own its target (the
/// target is an ancestor; an owning reference would leak the whole cycle).
/// One introduced by the optimiser's monadic expansion is the only owner of
/// the freshly built subtree, so it holds it strongly.
#[derive(Clone)]
pub(crate) enum FixTarget {
    Back(Weak<Node>),
    Owned(NodeRef),
}

impl FixTarget {
    pub(crate) fn upgrade(&self) -> NodeRef {
        match self {
            FixTarget::Back(w) => w
                .upgrade()
                .expect("fixpoint target dropped while still referenced"),
            FixTarget::Owned(n) => n.clone(),
        }
    }
}

impl Comb {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Comb::Pure(_) => "pure",
            Comb::Line => "line",
            Comb::Col => "col",
            Comb::Get(_) => "get",
            Comb::Modify(..) => "modify",
            Comb::CharTok { .. } => "char",
            Comb::StringTok { .. } => "string",
            Comb::Satisfy { .. } => "satisfy",
            Comb::Eof { .. } => "eof",
            Comb::Keyword { .. } => "keyword",
            Comb::Operator { .. } => "operator",
            Comb::StringLiteral { .. } => "string-literal",
            Comb::Apply(..) => "apply",
            Comb::ThenRight(..) => "then",
            Comb::ThenLeft(..) => "before",
            Comb::Bind(..) => "bind",
            Comb::Lift2(..) => "lift2",
            Comb::Lift3(..) => "lift3",
            Comb::Alt(..) => "alt",
            Comb::Attempt(_) => "attempt",
            Comb::LookAhead(_) => "look-ahead",
            Comb::NotFollowedBy { .. } => "not-followed-by",
            Comb::Ternary { .. } => "branch",
            Comb::Many(_) => "many",
            Comb::SkipMany(_) => "skip_many",
            Comb::ChainPre { .. } => "chain_pre",
            Comb::ChainPost { .. } => "chain_post",
            Comb::ChainLeft { .. } => "chain_left1",
            Comb::ChainRight { .. } => "chain_right1",
            Comb::SepEndBy1 { .. } => "sep_end_by1",
            Comb::ManyUntil { .. } => "many_until",
            Comb::Empty { .. } => "empty",
            Comb::Fail { .. } => "fail",
            Comb::Unexpected { .. } => "unexpected",
            Comb::FastFail { .. } => "fail_with",
            Comb::FastUnexpected { .. } => "unexpected_with",
            Comb::Ensure { .. } => "filter",
            Comb::Guard { .. } => "guard",
            Comb::FastGuard { .. } => "guard_with",
            Comb::Put(..) => "put",
            Comb::Local { .. } => "local",
            Comb::ErrorRelabel { .. } => "label",
            Comb::Subroutine { .. } => "subroutine",
            Comb::Fixpoint { .. } => "fixpoint",
            Comb::Debug { .. } => "debug",
        }
    }

    /// `Empty`, `Fail`, `Unexpected` and the message-generating failures.
    pub(crate) fn is_mzero(&self) -> bool {
        matches!(
            self,
            Comb::Empty { .. }
                | Comb::Fail { .. }
                | Comb::Unexpected { .. }
                | Comb::FastFail { .. }
                | Comb::FastUnexpected { .. }
        )
    }

    /// Child slots in evaluation order. `Fixpoint` targets and `Bind`
    /// continuations are deliberately not children: the former would turn
    /// the DAG walk into a cycle, the latter only exists at run time.
    pub(crate) fn children(&self) -> Vec<NodeRef> {
        match self {
            Comb::Apply(a, b)
            | Comb::ThenRight(a, b)
            | Comb::ThenLeft(a, b)
            | Comb::Alt(a, b)
            | Comb::Lift2(_, a, b) => vec![a.clone(), b.clone()],
            Comb::Lift3(_, a, b, c) => vec![a.clone(), b.clone(), c.clone()],
            Comb::Ternary { b, t, f } => vec![b.clone(), t.clone(), f.clone()],
            Comb::Bind(p, _)
            | Comb::Attempt(p)
            | Comb::LookAhead(p)
            | Comb::NotFollowedBy { p, .. }
            | Comb::Many(p)
            | Comb::SkipMany(p)
            | Comb::ManyUntil { body: p }
            | Comb::FastFail { p, .. }
            | Comb::FastUnexpected { p, .. }
            | Comb::Ensure { p, .. }
            | Comb::Guard { p, .. }
            | Comb::FastGuard { p, .. }
            | Comb::Put(_, p)
            | Comb::ErrorRelabel { p, .. }
            | Comb::Subroutine { p, .. }
            | Comb::Debug { p, .. } => vec![p.clone()],
            Comb::ChainPre { op, p } => vec![op.clone(), p.clone()],
            Comb::ChainPost { p, op }
            | Comb::ChainLeft { p, op }
            | Comb::ChainRight { p, op } => vec![p.clone(), op.clone()],
            Comb::SepEndBy1 { p, sep } => vec![p.clone(), sep.clone()],
            Comb::Local { init, body, .. } => vec![init.clone(), body.clone()],
            _ => Vec::new(),
        }
    }

    /// Rebuild this combinator with replacement children, in the same order
    /// `children` reports them.
    pub(crate) fn with_children(&self, kids: Vec<NodeRef>) -> Comb {
        let mut it = kids.into_iter();
        let mut next = || it.next().expect("child count mismatch");
        match self {
            Comb::Apply(..) => Comb::Apply(next(), next()),
            Comb::ThenRight(..) => Comb::ThenRight(next(), next()),
            Comb::ThenLeft(..) => Comb::ThenLeft(next(), next()),
            Comb::Alt(..) => Comb::Alt(next(), next()),
            Comb::Lift2(f, ..) => Comb::Lift2(f.clone(), next(), next()),
            Comb::Lift3(f, ..) => Comb::Lift3(f.clone(), next(), next(), next()),
            Comb::Ternary { .. } => Comb::Ternary { b: next(), t: next(), f: next() },
            Comb::Bind(_, k) => Comb::Bind(next(), k.clone()),
            Comb::Attempt(_) => Comb::Attempt(next()),
            Comb::LookAhead(_) => Comb::LookAhead(next()),
            Comb::NotFollowedBy { expected, .. } => Comb::NotFollowedBy {
                p: next(),
                expected: expected.clone(),
            },
            Comb::Many(_) => Comb::Many(next()),
            Comb::SkipMany(_) => Comb::SkipMany(next()),
            Comb::ManyUntil { .. } => Comb::ManyUntil { body: next() },
            Comb::FastFail { gen, .. } => Comb::FastFail { p: next(), gen: gen.clone() },
            Comb::FastUnexpected { gen, .. } => Comb::FastUnexpected { p: next(), gen: gen.clone() },
            Comb::Ensure { pred, .. } => Comb::Ensure { p: next(), pred: pred.clone() },
            Comb::Guard { pred, msg, .. } => Comb::Guard {
                p: next(),
                pred: pred.clone(),
                msg: msg.clone(),
            },
            Comb::FastGuard { pred, gen, .. } => Comb::FastGuard {
                p: next(),
                pred: pred.clone(),
                gen: gen.clone(),
            },
            Comb::Put(reg, _) => Comb::Put(*reg, next()),
            Comb::ErrorRelabel { label, .. } => Comb::ErrorRelabel {
                p: next(),
                label: label.clone(),
            },
            Comb::Subroutine { expected, .. } => Comb::Subroutine {
                p: next(),
                expected: expected.clone(),
            },
            Comb::Debug { name, brk, .. } => Comb::Debug {
                p: next(),
                name: name.clone(),
                brk: *brk,
            },
            Comb::ChainPre { .. } => Comb::ChainPre { op: next(), p: next() },
            Comb::ChainPost { .. } => Comb::ChainPost { p: next(), op: next() },
            Comb::ChainLeft { .. } => Comb::ChainLeft { p: next(), op: next() },
            Comb::ChainRight { .. } => Comb::ChainRight { p: next(), op: next() },
            Comb::SepEndBy1 { .. } => Comb::SepEndBy1 { p: next(), sep: next() },
            Comb::Local { reg, .. } => Comb::Local {
                reg: *reg,
                init: next(),
                body: next(),
            },
            leaf => leaf.clone(),
        }
    }
}

impl fmt::Debug for Comb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Node cells ───────────────────────────────────────────────────────

pub(crate) type NodeRef = Rc<Node>;

pub(crate) enum NodeState {
    /// `fix` hole before the knot is tied.
    Hole,
    /// Deferred construction; forced by the first resolve.
    Lazy(Option<Box<dyn FnOnce() -> NodeRef>>),
    /// Indirection left behind by forcing a `Lazy`/`Hole`.
    Forwarded(NodeRef),
    Built(Comb),
}

/// One physical combinator node. Identity (the `Rc` pointer) is what the
/// preprocess path set, subroutine labels and fixpoint targets key on.
pub(crate) struct Node {
    state: RefCell<NodeState>,
    safe: Cell<bool>,
    done: Cell<bool>,
    compiled: RefCell<Option<Rc<Program>>>,
}

impl Node {
    pub(crate) fn new(comb: Comb) -> NodeRef {
        Rc::new(Node {
            state: RefCell::new(NodeState::Built(comb)),
            safe: Cell::new(true),
            done: Cell::new(false),
            compiled: RefCell::new(None),
        })
    }

    pub(crate) fn hole() -> NodeRef {
        Rc::new(Node {
            state: RefCell::new(NodeState::Hole),
            safe: Cell::new(true),
            done: Cell::new(false),
            compiled: RefCell::new(None),
        })
    }

    pub(crate) fn lazy(f: Box<dyn FnOnce() -> NodeRef>) -> NodeRef {
        Rc::new(Node {
            state: RefCell::new(NodeState::Lazy(Some(f))),
            safe: Cell::new(true),
            done: Cell::new(false),
            compiled: RefCell::new(None),
        })
    }

    pub(crate) fn fill(&self, target: NodeRef) {
        *self.state.borrow_mut() = NodeState::Forwarded(target);
    }

    pub(crate) fn comb_clone(&self) -> Comb {
        match &*self.state.borrow() {
            NodeState::Built(c) => c.clone(),
            _ => panic!("combinator node used before it was resolved"),
        }
    }

    pub(crate) fn set_comb(&self, comb: Comb) {
        *self.state.borrow_mut() = NodeState::Built(comb);
    }

    pub(crate) fn is_safe(&self) -> bool {
        self.safe.get()
    }

    pub(crate) fn set_safe(&self, safe: bool) {
        self.safe.set(safe);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.get()
    }

    pub(crate) fn mark_done(&self) {
        self.done.set(true);
    }

    pub(crate) fn cached_program(&self) -> Option<Rc<Program>> {
        self.compiled.borrow().clone()
    }

    pub(crate) fn cache_program(&self, p: Rc<Program>) {
        *self.compiled.borrow_mut() = Some(p);
    }
}

impl Comb {
    /// Node references this combinator keeps alive, including owned
    /// fixpoint targets (which `children` deliberately excludes).
    fn owned_refs(&self) -> Vec<NodeRef> {
        let mut refs = self.children();
        if let Comb::Fixpoint { target: FixTarget::Owned(t), .. } = self {
            refs.push(t.clone());
        }
        refs
    }
}

// Dropping a deeply nested parser must not recurse through the whole
// chain of nodes. The tree is dismantled with an explicit stack instead:
// each uniquely owned node is emptied before its cell is released.
impl Drop for Node {
    fn drop(&mut self) {
        let state = std::mem::replace(self.state.get_mut(), NodeState::Hole);
        let mut stack: Vec<NodeRef> = match state {
            NodeState::Built(comb) => comb.owned_refs(),
            NodeState::Forwarded(t) => vec![t],
            _ => return,
        };
        while let Some(n) = stack.pop() {
            if let Ok(mut node) = Rc::try_unwrap(n) {
                match std::mem::replace(node.state.get_mut(), NodeState::Hole) {
                    NodeState::Built(comb) => stack.extend(comb.owned_refs()),
                    NodeState::Forwarded(t) => stack.push(t),
                    _ => {}
                }
            }
        }
    }
}

enum ResolveStep {
    Done,
    Forward(NodeRef),
    Unbound,
    Force(Box<dyn FnOnce() -> NodeRef>),
}

/// Chase `Lazy`/`Forwarded` indirections until a built node appears,
/// forcing thunks along the way.
pub(crate) fn resolve(n: &NodeRef) -> Result<NodeRef, CompileError> {
    let mut cur = n.clone();
    let mut hops = 0usize;
    loop {
        let step = {
            let mut state = cur.state.borrow_mut();
            match &mut *state {
                NodeState::Built(_) => ResolveStep::Done,
                NodeState::Forwarded(t) => ResolveStep::Forward(t.clone()),
                NodeState::Hole => ResolveStep::Unbound,
                NodeState::Lazy(thunk) => match thunk.take() {
                    Some(f) => ResolveStep::Force(f),
                    None => ResolveStep::Unbound,
                },
            }
        };
        match step {
            ResolveStep::Done => return Ok(cur),
            ResolveStep::Forward(t) => {
                if Rc::ptr_eq(&cur, &t) {
                    return Err(CompileError::UnboundParser);
                }
                cur = t;
                hops += 1;
                if hops > 100_000 {
                    return Err(CompileError::UnboundParser);
                }
            }
            ResolveStep::Unbound => return Err(CompileError::UnboundParser),
            // A lazy thunk that recursively resolves its own node finds a
            // `Hole` and reports the unbound recursion instead of looping.
            ResolveStep::Force(f) => {
                *cur.state.borrow_mut() = NodeState::Hole;
                let target = f();
                cur.fill(target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_roundtrips_values() {
        let v = dval(42usize);
        assert_eq!(take::<usize>(v), 42);
        let s = dval(String::from("hi"));
        assert_eq!(take::<String>(s), "hi");
    }

    #[test]
    #[should_panic(expected = "unexpected type")]
    fn take_wrong_type_panics() {
        let v = dval(42usize);
        let _: String = take::<String>(v);
    }

    #[test]
    fn function_values_roundtrip() {
        let f: DynFn = Rc::new(|v| dval(take::<usize>(v) + 1));
        let v = fn_val(f);
        let g = as_fn(&v);
        assert_eq!(take::<usize>(g(dval(1usize))), 2);
    }

    #[test]
    fn compose_applies_right_first() {
        let f: DynFn = Rc::new(|v| dval(take::<usize>(v) * 2));
        let g: DynFn = Rc::new(|v| dval(take::<usize>(v) + 1));
        let h = compose(f, g);
        // f(g(3)) = (3 + 1) * 2
        assert_eq!(take::<usize>(h(dval(3usize))), 8);
    }

    #[test]
    fn resolve_forces_lazy_once() {
        let n = Node::lazy(Box::new(|| Node::new(Comb::Line)));
        let a = resolve(&n).unwrap();
        let b = resolve(&n).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert!(matches!(a.comb_clone(), Comb::Line));
    }

    #[test]
    fn resolve_reports_unfilled_hole() {
        let n = Node::hole();
        assert!(resolve(&n).is_err());
    }

    #[test]
    fn resolve_reports_self_reference() {
        let n = Node::hole();
        n.fill(n.clone());
        assert!(resolve(&n).is_err());
    }

    #[test]
    fn children_with_children_roundtrip() {
        let a = Node::new(Comb::Line);
        let b = Node::new(Comb::Col);
        let alt = Comb::Alt(a.clone(), b.clone());
        let kids = alt.children();
        assert_eq!(kids.len(), 2);
        let rebuilt = alt.with_children(kids);
        match rebuilt {
            Comb::Alt(x, y) => {
                assert!(Rc::ptr_eq(&x, &a));
                assert!(Rc::ptr_eq(&y, &b));
            }
            _ => panic!("expected alt"),
        }
    }

    #[test]
    fn safe_latch_defaults_on() {
        let n = Node::new(Comb::Line);
        assert!(n.is_safe());
        n.set_safe(false);
        assert!(!n.is_safe());
    }
}
