use std::marker::PhantomData;
use std::rc::Rc;

use crate::ast::{
    dval, fn2_val, fn_val, take, BindFn, Comb, DynFn, DynFn2, DynFn3, DynVal, LoopStop, Node,
    NodeRef,
};
use crate::codegen::{self, CompileError, Program};
use crate::vm::{self, ParseFailure, Pos, Tracer, REGISTERS};

// ── Public shapes ────────────────────────────────────────────────────

/// Where a `debug` tap marks its events as pause points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugBreak {
    Never,
    OnEntry,
    OnExit,
    Always,
}

/// Function payloads carried through parsers. Results of parsers must be
/// `Clone + 'static`, so function results travel as shared closures.
pub type MapFn<A, B> = Rc<dyn Fn(A) -> B>;
pub type BinFn<A> = Rc<dyn Fn(A, A) -> A>;
pub type UnFn<A> = Rc<dyn Fn(A) -> A>;

/// A successful parse: the value and the position the cursor stopped at.
/// Parsers do not have to consume the whole input; pair with [`eof`] when
/// they should.
#[derive(Debug, Clone, PartialEq)]
pub struct Success<A> {
    pub value: A,
    pub end: Pos,
}

// ── Parsers ──────────────────────────────────────────────────────────

/// A composable parser producing `A`. Cheap to clone; clones share the
/// same underlying node, which is how the compiler recognises shared
/// subtrees and recursion.
pub struct Parser<A> {
    node: NodeRef,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for Parser<A> {
    fn clone(&self) -> Self {
        Parser { node: self.node.clone(), _marker: PhantomData }
    }
}

impl<A: Clone + 'static> Parser<A> {
    fn wrap(node: NodeRef) -> Self {
        Parser { node, _marker: PhantomData }
    }

    fn comb(comb: Comb) -> Self {
        Self::wrap(Node::new(comb))
    }

    pub(crate) fn node(&self) -> NodeRef {
        self.node.clone()
    }

    pub fn pure(x: A) -> Self {
        Self::comb(Comb::Pure(dval(x)))
    }

    fn map_raw<B: Clone + 'static>(&self, f: DynFn) -> Parser<B> {
        Parser::comb(Comb::Apply(Node::new(Comb::Pure(fn_val(f))), self.node.clone()))
    }

    pub fn map<B: Clone + 'static>(&self, f: impl Fn(A) -> B + 'static) -> Parser<B> {
        self.map_raw(Rc::new(move |v| dval(f(take::<A>(v)))))
    }

    /// Sequence, discarding this parser's result.
    pub fn then<B: Clone + 'static>(&self, q: Parser<B>) -> Parser<B> {
        Parser::comb(Comb::ThenRight(self.node.clone(), q.node))
    }

    /// Sequence, discarding the second parser's result.
    pub fn before<B: Clone + 'static>(&self, q: Parser<B>) -> Parser<A> {
        Parser::comb(Comb::ThenLeft(self.node.clone(), q.node))
    }

    pub fn bind<B: Clone + 'static>(&self, k: impl Fn(A) -> Parser<B> + 'static) -> Parser<B> {
        let k: BindFn = Rc::new(move |v| k(take::<A>(v)).node);
        Parser::comb(Comb::Bind(self.node.clone(), k))
    }

    /// Alternation. Commits to this parser as soon as it consumes input;
    /// wrap it in [`attempt`] to allow backtracking past consumption.
    pub fn or(&self, q: Parser<A>) -> Parser<A> {
        Parser::comb(Comb::Alt(self.node.clone(), q.node))
    }

    /// Replace the "expected" labels of this parser's leaves.
    pub fn label(&self, msg: impl Into<String>) -> Parser<A> {
        Parser::comb(Comb::ErrorRelabel { p: self.node.clone(), label: msg.into() })
    }

    pub fn filter(&self, pred: impl Fn(&A) -> bool + 'static) -> Parser<A> {
        let pred: crate::ast::DynPred =
            Rc::new(move |v: &DynVal| pred(v.downcast_ref::<A>().expect("filter type")));
        Parser::comb(Comb::Ensure { p: self.node.clone(), pred })
    }

    pub fn guard(&self, pred: impl Fn(&A) -> bool + 'static, msg: impl Into<String>) -> Parser<A> {
        let pred: crate::ast::DynPred =
            Rc::new(move |v: &DynVal| pred(v.downcast_ref::<A>().expect("guard type")));
        Parser::comb(Comb::Guard { p: self.node.clone(), pred, msg: msg.into() })
    }

    pub fn guard_with(
        &self,
        pred: impl Fn(&A) -> bool + 'static,
        gen: impl Fn(&A) -> String + 'static,
    ) -> Parser<A> {
        let pred: crate::ast::DynPred =
            Rc::new(move |v: &DynVal| pred(v.downcast_ref::<A>().expect("guard type")));
        let gen: crate::ast::MsgFn = Rc::new(move |v| {
            let a = take::<A>(v);
            gen(&a)
        });
        Parser::comb(Comb::FastGuard { p: self.node.clone(), pred, gen })
    }

    /// Run this parser, then fail with a message computed from its value.
    pub fn fail_with<B: Clone + 'static>(
        &self,
        gen: impl Fn(A) -> String + 'static,
    ) -> Parser<B> {
        let gen: crate::ast::MsgFn = Rc::new(move |v| gen(take::<A>(v)));
        Parser::comb(Comb::FastFail { p: self.node.clone(), gen })
    }

    pub fn unexpected_with<B: Clone + 'static>(
        &self,
        gen: impl Fn(A) -> String + 'static,
    ) -> Parser<B> {
        let gen: crate::ast::MsgFn = Rc::new(move |v| gen(take::<A>(v)));
        Parser::comb(Comb::FastUnexpected { p: self.node.clone(), gen })
    }

    /// Share this parser's compiled code between call sites instead of
    /// inlining it at each one.
    pub fn subroutine(&self) -> Parser<A> {
        Parser::comb(Comb::Subroutine { p: self.node.clone(), expected: None })
    }

    /// Clear the purity latch: the optimiser will no longer call functions
    /// reachable from this node at compile time.
    pub fn impure(self) -> Parser<A> {
        self.node.set_safe(false);
        self
    }

    pub fn debug(&self, name: impl Into<String>) -> Parser<A> {
        self.debug_with(name, DebugBreak::Never)
    }

    pub fn debug_with(&self, name: impl Into<String>, brk: DebugBreak) -> Parser<A> {
        Parser::comb(Comb::Debug {
            p: self.node.clone(),
            name: Rc::from(name.into().as_str()),
            brk,
        })
    }

    /// Freeze this parser into an executable program. The instruction
    /// array is cached on the parser, so compiling twice is free.
    pub fn compile(&self) -> Result<Compiled<A>, CompileError> {
        let program = codegen::compile(&self.node)?;
        Ok(Compiled { program, root: self.node.clone(), _marker: PhantomData })
    }

    /// Compile and run in one step.
    pub fn parse(&self, input: &str) -> Result<Success<A>, crate::Error> {
        Ok(self.compile()?.run(input)?)
    }
}

// ── Compiled parsers ─────────────────────────────────────────────────

/// A frozen parser. Reusable across inputs; runs must not overlap on the
/// same value, since loop instructions carry state. Take an
/// [`Compiled::isolated`] snapshot for each concurrent consumer.
pub struct Compiled<A> {
    program: Rc<Program>,
    root: NodeRef,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for Compiled<A> {
    fn clone(&self) -> Self {
        Compiled { program: self.program.clone(), root: self.root.clone(), _marker: PhantomData }
    }
}

impl<A: Clone + 'static> Compiled<A> {
    pub fn run(&self, input: &str) -> Result<Success<A>, ParseFailure> {
        let (value, end) = vm::run(&self.program, input, None)?;
        Ok(Success { value: take::<A>(value), end })
    }

    pub fn run_traced(
        &self,
        input: &str,
        tracer: Rc<dyn Tracer>,
    ) -> Result<Success<A>, ParseFailure> {
        let (value, end) = vm::run(&self.program, input, Some(tracer))?;
        Ok(Success { value: take::<A>(value), end })
    }

    /// A snapshot whose stateful instruction slots are fresh copies,
    /// decoupled from this one.
    pub fn isolated(&self) -> Compiled<A> {
        Compiled {
            program: Rc::new(self.program.isolated_program()),
            root: self.root.clone(),
            _marker: PhantomData,
        }
    }
}

// ── Value producers and primitives ───────────────────────────────────

pub fn pure<A: Clone + 'static>(x: A) -> Parser<A> {
    Parser::pure(x)
}

/// The parser that always fails, contributing nothing to the error.
pub fn empty<A: Clone + 'static>() -> Parser<A> {
    Parser::comb(Comb::Empty { expected: None })
}

pub fn fail<A: Clone + 'static>(msg: impl Into<String>) -> Parser<A> {
    Parser::comb(Comb::Fail { msg: msg.into() })
}

pub fn unexpected<A: Clone + 'static>(msg: impl Into<String>) -> Parser<A> {
    Parser::comb(Comb::Unexpected { msg: msg.into() })
}

pub fn char_(c: char) -> Parser<char> {
    Parser::comb(Comb::CharTok { c, expected: None })
}

pub fn string(s: &str) -> Parser<String> {
    Parser::comb(Comb::StringTok { s: Rc::from(s), expected: None })
}

pub fn satisfy(pred: impl Fn(char) -> bool + 'static) -> Parser<char> {
    Parser::comb(Comb::Satisfy { pred: Rc::new(pred), expected: None })
}

/// Any single character.
pub fn item() -> Parser<char> {
    satisfy(|_| true)
}

/// A literal word that must not be followed by an identifier character.
pub fn keyword(kw: &str) -> Parser<()> {
    Parser::comb(Comb::Keyword { kw: Rc::from(kw), expected: None })
}

pub fn operator(op: &str) -> Parser<()> {
    Parser::comb(Comb::Operator { op: Rc::from(op), expected: None })
}

/// A double-quoted literal with `\n`, `\t`, `\\` and `\"` escapes.
pub fn string_literal() -> Parser<String> {
    Parser::comb(Comb::StringLiteral { raw: false, expected: None })
}

/// A double-quoted literal with no escape processing.
pub fn raw_string_literal() -> Parser<String> {
    Parser::comb(Comb::StringLiteral { raw: true, expected: None })
}

pub fn eof() -> Parser<()> {
    Parser::comb(Comb::Eof { expected: None })
}

/// Current line, zero-based.
pub fn line() -> Parser<usize> {
    Parser::comb(Comb::Line)
}

/// Current column, zero-based; tabs align to multiples of four.
pub fn col() -> Parser<usize> {
    Parser::comb(Comb::Col)
}

pub fn pos() -> Parser<(usize, usize)> {
    lift2(|l, c| (l, c), line(), col())
}

// ── Sequencing ───────────────────────────────────────────────────────

pub fn ap<A: Clone + 'static, B: Clone + 'static>(
    pf: Parser<MapFn<A, B>>,
    px: Parser<A>,
) -> Parser<B> {
    let conv: DynFn = Rc::new(|v| {
        let f = take::<MapFn<A, B>>(v);
        fn_val(Rc::new(move |x| dval(f(take::<A>(x)))))
    });
    Parser::comb(Comb::Apply(pf.map_raw::<DynVal>(conv).node, px.node))
}

pub fn lift2<A: Clone + 'static, B: Clone + 'static, C: Clone + 'static>(
    f: impl Fn(A, B) -> C + 'static,
    p: Parser<A>,
    q: Parser<B>,
) -> Parser<C> {
    let f: DynFn2 = Rc::new(move |a, b| dval(f(take::<A>(a), take::<B>(b))));
    Parser::comb(Comb::Lift2(f, p.node, q.node))
}

pub fn lift3<
    A: Clone + 'static,
    B: Clone + 'static,
    C: Clone + 'static,
    D: Clone + 'static,
>(
    f: impl Fn(A, B, C) -> D + 'static,
    p: Parser<A>,
    q: Parser<B>,
    r: Parser<C>,
) -> Parser<D> {
    let f: DynFn3 = Rc::new(move |a, b, c| dval(f(take::<A>(a), take::<B>(b), take::<C>(c))));
    Parser::comb(Comb::Lift3(f, p.node, q.node, r.node))
}

pub fn sequence<A: Clone + 'static>(ps: Vec<Parser<A>>) -> Parser<Vec<A>> {
    let mut acc = Parser::pure(Vec::<A>::new());
    for p in ps {
        acc = lift2(
            |mut xs: Vec<A>, x: A| {
                xs.push(x);
                xs
            },
            acc,
            p,
        );
    }
    acc
}

pub fn traverse<T, A: Clone + 'static>(
    f: impl Fn(T) -> Parser<A>,
    xs: Vec<T>,
) -> Parser<Vec<A>> {
    sequence(xs.into_iter().map(f).collect())
}

/// Collapse a parser-producing parser.
pub fn join<A: Clone + 'static>(pp: Parser<Parser<A>>) -> Parser<A> {
    pp.bind(|p| p)
}

// ── Choice ───────────────────────────────────────────────────────────

/// Backtrack on failure even after consuming input.
pub fn attempt<A: Clone + 'static>(p: Parser<A>) -> Parser<A> {
    Parser::comb(Comb::Attempt(p.node))
}

/// Run `p` and restore the cursor on success.
pub fn look_ahead<A: Clone + 'static>(p: Parser<A>) -> Parser<A> {
    Parser::comb(Comb::LookAhead(p.node))
}

/// Succeed without consuming exactly when `p` fails.
pub fn not_followed_by<A: Clone + 'static>(p: Parser<A>) -> Parser<()> {
    Parser::comb(Comb::NotFollowedBy { p: p.node, expected: None })
}

/// Choose a branch with a parsed condition.
pub fn branch<A: Clone + 'static>(
    b: Parser<bool>,
    t: Parser<A>,
    f: Parser<A>,
) -> Parser<A> {
    Parser::comb(Comb::Ternary { b: b.node, t: t.node, f: f.node })
}

// ── Iteration ────────────────────────────────────────────────────────

fn from_dyn_list<A: Clone + 'static>(node: NodeRef) -> Parser<Vec<A>> {
    Parser::<Vec<DynVal>>::wrap(node).map_raw(Rc::new(|v| {
        let xs = take::<Vec<DynVal>>(v);
        dval(xs.into_iter().map(take::<A>).collect::<Vec<A>>())
    }))
}

pub fn many<A: Clone + 'static>(p: Parser<A>) -> Parser<Vec<A>> {
    from_dyn_list(Node::new(Comb::Many(p.node)))
}

pub fn many1<A: Clone + 'static>(p: Parser<A>) -> Parser<Vec<A>> {
    lift2(
        |x, mut xs: Vec<A>| {
            xs.insert(0, x);
            xs
        },
        p.clone(),
        many(p),
    )
}

pub fn skip_many<A: Clone + 'static>(p: Parser<A>) -> Parser<()> {
    Parser::comb(Comb::SkipMany(p.node))
}

/// Zero or more `p` until `end` matches; `end`'s result is discarded.
pub fn many_until<A: Clone + 'static, B: Clone + 'static>(
    p: Parser<A>,
    end: Parser<B>,
) -> Parser<Vec<A>> {
    let stop = Node::new(Comb::ThenRight(end.node, Node::new(Comb::Pure(dval(LoopStop)))));
    let body = Node::new(Comb::Alt(stop, p.node));
    from_dyn_list(Node::new(Comb::ManyUntil { body }))
}

/// One or more `p` separated by `sep`, allowing a trailing separator.
pub fn sep_end_by1<A: Clone + 'static, B: Clone + 'static>(
    p: Parser<A>,
    sep: Parser<B>,
) -> Parser<Vec<A>> {
    from_dyn_list(Node::new(Comb::SepEndBy1 { p: p.node, sep: sep.node }))
}

fn op2_node<A: Clone + 'static>(op: &Parser<BinFn<A>>) -> NodeRef {
    let conv: DynFn = Rc::new(|v| {
        let g = take::<BinFn<A>>(v);
        fn2_val(Rc::new(move |a, b| dval(g(take::<A>(a), take::<A>(b)))))
    });
    op.map_raw::<DynVal>(conv).node
}

fn op1_node<A: Clone + 'static>(op: &Parser<UnFn<A>>) -> NodeRef {
    let conv: DynFn = Rc::new(|v| {
        let g = take::<UnFn<A>>(v);
        fn_val(Rc::new(move |a| dval(g(take::<A>(a)))))
    });
    op.map_raw::<DynVal>(conv).node
}

/// `p (op p)*`, folded left.
pub fn chain_left1<A: Clone + 'static>(p: Parser<A>, op: Parser<BinFn<A>>) -> Parser<A> {
    Parser::comb(Comb::ChainLeft { p: p.node, op: op2_node(&op) })
}

/// `p (op p)*`, folded right.
pub fn chain_right1<A: Clone + 'static>(p: Parser<A>, op: Parser<BinFn<A>>) -> Parser<A> {
    Parser::comb(Comb::ChainRight { p: p.node, op: op2_node(&op) })
}

/// `op* p`: prefix operators applied innermost-last.
pub fn chain_pre<A: Clone + 'static>(op: Parser<UnFn<A>>, p: Parser<A>) -> Parser<A> {
    Parser::comb(Comb::ChainPre { op: op1_node(&op), p: p.node })
}

/// `p op*`: postfix operators applied in reading order.
pub fn chain_post<A: Clone + 'static>(p: Parser<A>, op: Parser<UnFn<A>>) -> Parser<A> {
    Parser::comb(Comb::ChainPost { p: p.node, op: op1_node(&op) })
}

// ── Recursion ────────────────────────────────────────────────────────

/// Tie a recursive knot: the closure receives a handle to the parser it
/// is defining. Recursion must flow through that handle (or a clone of
/// it) so the compiler can see the repeated identity.
pub fn fix<A: Clone + 'static>(f: impl FnOnce(Parser<A>) -> Parser<A>) -> Parser<A> {
    let hole = Node::hole();
    let handle = Parser::wrap(hole.clone());
    let built = f(handle);
    hole.fill(built.node.clone());
    built
}

/// Defer construction until first compile.
pub fn lazy<A: Clone + 'static>(f: impl FnOnce() -> Parser<A> + 'static) -> Parser<A> {
    Parser::wrap(Node::lazy(Box::new(move || f().node)))
}

// ── Registers ────────────────────────────────────────────────────────

/// Handle to one of the machine's four registers. The register's content
/// type is not checked across `put`/`get` pairs beyond the runtime
/// downcast; mixing types through one register is a programming error.
pub struct Reg<A> {
    index: usize,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for Reg<A> {
    fn clone(&self) -> Self {
        Reg { index: self.index, _marker: PhantomData }
    }
}

impl<A> Copy for Reg<A> {}

impl<A: Clone + 'static> Reg<A> {
    pub fn new(index: usize) -> Self {
        assert!(
            index < REGISTERS,
            "register index {index} out of range: the machine has {REGISTERS} registers"
        );
        Reg { index, _marker: PhantomData }
    }
}

pub fn get<A: Clone + 'static>(r: &Reg<A>) -> Parser<A> {
    Parser::comb(Comb::Get(r.index))
}

/// Evaluate `p` and store its result, producing `()`.
pub fn put<A: Clone + 'static>(r: &Reg<A>, p: Parser<A>) -> Parser<()> {
    Parser::comb(Comb::Put(r.index, p.node))
}

pub fn put_value<A: Clone + 'static>(r: &Reg<A>, x: A) -> Parser<()> {
    put(r, pure(x))
}

pub fn modify<A: Clone + 'static>(r: &Reg<A>, f: impl Fn(A) -> A + 'static) -> Parser<()> {
    let f: DynFn = Rc::new(move |v| dval(f(take::<A>(v))));
    Parser::comb(Comb::Modify(r.index, f))
}

/// Run `init`, store its result in `r`, run `body`, then restore the
/// register's previous value whether `body` succeeded or failed.
pub fn local<A: Clone + 'static, B: Clone + 'static>(
    r: &Reg<A>,
    init: Parser<A>,
    body: Parser<B>,
) -> Parser<B> {
    Parser::comb(Comb::Local { reg: r.index, init: init.node, body: body.node })
}

pub fn local_value<A: Clone + 'static, B: Clone + 'static>(
    r: &Reg<A>,
    x: A,
    body: Parser<B>,
) -> Parser<B> {
    local(r, pure(x), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value<A: Clone + 'static>(p: &Parser<A>, input: &str) -> A {
        p.compile().expect("compile").run(input).expect("parse").value
    }

    #[test]
    fn pure_consumes_nothing() {
        let p = pure(5usize);
        let s = p.compile().unwrap().run("abc").unwrap();
        assert_eq!(s.value, 5);
        assert_eq!(s.end.offset, 0);
    }

    #[test]
    fn map_then_before_compose() {
        let p = char_('a').map(|c| c as u32).before(char_('b'));
        assert_eq!(value(&p, "ab"), 'a' as u32);
        let q = char_('a').then(char_('b'));
        assert_eq!(value(&q, "ab"), 'b');
    }

    #[test]
    fn bind_threads_the_parsed_value() {
        let digit = satisfy(|c| c.is_ascii_digit()).map(|c| c.to_digit(10).unwrap() as usize);
        let p = digit.bind(|n| many(char_('x')).filter(move |xs| xs.len() == n).map(|xs| xs.len()));
        assert_eq!(value(&p, "2xx"), 2);
        assert!(p.compile().unwrap().run("3xx").is_err());
    }

    #[test]
    fn ap_applies_parsed_function() {
        let f: Parser<MapFn<char, String>> =
            pure(Rc::new(|c: char| c.to_string().repeat(2)) as MapFn<char, String>);
        let p = ap(f, char_('z'));
        assert_eq!(value(&p, "z"), "zz");
    }

    #[test]
    fn lift3_zips_three_results() {
        let p = lift3(|a, b, c| format!("{a}{b}{c}"), char_('x'), char_('y'), char_('z'));
        assert_eq!(value(&p, "xyz"), "xyz");
    }

    #[test]
    fn sequence_collects_in_order() {
        let p = sequence(vec![char_('a'), char_('b'), char_('c')]);
        assert_eq!(value(&p, "abc"), vec!['a', 'b', 'c']);
    }

    #[test]
    fn traverse_maps_then_sequences() {
        let p = traverse(char_, vec!['a', 'b']);
        assert_eq!(value(&p, "ab"), vec!['a', 'b']);
    }

    #[test]
    fn join_flattens() {
        let pp = char_('a').map(|_| char_('b'));
        let p = join(pp);
        assert_eq!(value(&p, "ab"), 'b');
    }

    #[test]
    fn many1_requires_one() {
        let p = many1(char_('a'));
        assert_eq!(value(&p, "aa"), vec!['a', 'a']);
        assert!(p.compile().unwrap().run("b").is_err());
    }

    #[test]
    fn many_until_stops_at_terminator() {
        let p = many_until(item(), string("-->"));
        assert_eq!(value(&p, "ab-->"), vec!['a', 'b']);
    }

    #[test]
    fn sep_end_by1_allows_trailing_separator() {
        let p = sep_end_by1(satisfy(|c| c.is_ascii_digit()), char_(','));
        assert_eq!(value(&p, "1,2,3"), vec!['1', '2', '3']);
        assert_eq!(value(&p, "1,2,"), vec!['1', '2']);
        assert!(p.compile().unwrap().run(",").is_err());
    }

    #[test]
    fn chain_left_and_right_fold_directionally() {
        let num = satisfy(|c| c.is_ascii_digit()).map(|c| c.to_digit(10).unwrap() as i64);
        let minus: Parser<BinFn<i64>> =
            char_('-').map(|_| Rc::new(|a: i64, b: i64| a - b) as BinFn<i64>);
        let left = chain_left1(num.clone(), minus.clone());
        assert_eq!(value(&left, "8-3-2"), 3); // (8-3)-2
        let right = chain_right1(num, minus);
        assert_eq!(value(&right, "8-3-2"), 7); // 8-(3-2)
    }

    #[test]
    fn chain_pre_and_post_apply_unary_operators() {
        let num = satisfy(|c| c.is_ascii_digit()).map(|c| c.to_digit(10).unwrap() as i64);
        let neg: Parser<UnFn<i64>> = char_('-').map(|_| Rc::new(|a: i64| -a) as UnFn<i64>);
        let pre = chain_pre(neg, num.clone());
        assert_eq!(value(&pre, "--7"), 7);
        assert_eq!(value(&pre, "-7"), -7);
        let bang: Parser<UnFn<i64>> = char_('!').map(|_| Rc::new(|a: i64| a * 10) as UnFn<i64>);
        let post = chain_post(num, bang);
        assert_eq!(value(&post, "7!!"), 700);
    }

    #[test]
    fn branch_follows_parsed_condition() {
        let cond = char_('t').map(|_| true).or(char_('f').map(|_| false));
        let p = branch(cond, string("yes"), string("no"));
        assert_eq!(value(&p, "tyes"), "yes");
        assert_eq!(value(&p, "fno"), "no");
    }

    #[test]
    fn fix_builds_recursive_parsers() {
        // nested parens: p = '(' p ')' | 'x'
        let p = fix(|p| char_('(').then(p).before(char_(')')).or(char_('x')));
        assert_eq!(value(&p, "x"), 'x');
        assert_eq!(value(&p, "((x))"), 'x');
        assert!(p.compile().unwrap().run("((x)").is_err());
    }

    #[test]
    fn lazy_defers_construction() {
        let p = lazy(|| char_('a'));
        assert_eq!(value(&p, "a"), 'a');
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn fifth_register_is_rejected() {
        let _: Reg<usize> = Reg::new(4);
    }

    #[test]
    fn modify_applies_in_place() {
        let r: Reg<i64> = Reg::new(2);
        let p = put_value(&r, 10).then(modify(&r, |x| x + 5)).then(get(&r));
        assert_eq!(value(&p, ""), 15);
    }

    #[test]
    fn label_replaces_expected() {
        let p = char_('a').label("the letter a");
        let err = p.compile().unwrap().run("z").unwrap_err();
        assert!(err.expected.contains("the letter a"));
        assert!(!err.expected.contains("\"a\""));
    }
}
