//! The combinator algebra, checked by observation: both sides of each law
//! are compiled and run over a shared input corpus, comparing parsed
//! values, end positions and failure reports. Tree shapes are never
//! compared, since the optimiser is free to rewrite either side.

use std::rc::Rc;

use parsnip::{
    ap, char_, empty, item, many, pure, run_parser, satisfy, string, BinFn, Error, MapFn,
    Parser,
};

const CORPUS: &[&str] = &[
    "", "a", "b", "c", "z", "ab", "ba", "aa", "bb", "abc", "aab", "abab", "ba ba", "foo",
];

type Observation<A> = Result<(A, usize), (usize, Vec<String>, Option<String>)>;

fn observe<A: Clone + 'static>(p: &Parser<A>, input: &str) -> Observation<A> {
    match run_parser(p, input) {
        Ok(s) => Ok((s.value, s.end.offset)),
        Err(Error::Parse(f)) => Err((
            f.pos.offset,
            f.expected.iter().cloned().collect(),
            f.unexpected,
        )),
        Err(Error::Build(e)) => panic!("law operand failed to build: {e}"),
    }
}

fn assert_equiv<A>(name: &str, lhs: Parser<A>, rhs: Parser<A>)
where
    A: Clone + PartialEq + std::fmt::Debug + 'static,
{
    for input in CORPUS.iter().copied() {
        let l = observe(&lhs, input);
        let r = observe(&rhs, input);
        assert_eq!(l, r, "law `{name}` diverges on input {input:?}");
    }
}

/// A parser with interesting behavior across the corpus: consumes one or
/// two characters, fails on others.
fn probe() -> Parser<char> {
    char_('a').or(char_('b').then(char_('a')))
}

#[test]
fn functor_identity() {
    assert_equiv("map id", probe().map(|c| c), probe());
}

#[test]
fn functor_composition() {
    let f = |n: u32| n + 1;
    let g = |c: char| c as u32;
    assert_equiv(
        "map f . map g",
        probe().map(g).map(f),
        probe().map(move |c| f(g(c))),
    );
}

#[test]
fn applicative_identity() {
    let id: Parser<MapFn<char, char>> = pure(Rc::new(|c: char| c) as MapFn<char, char>);
    assert_equiv("pure id <*>", ap(id, probe()), probe());
}

#[test]
fn applicative_homomorphism() {
    let f = |n: i64| n * 3;
    let pf: Parser<MapFn<i64, i64>> = pure(Rc::new(f) as MapFn<i64, i64>);
    assert_equiv("pure f <*> pure x", ap(pf, pure(14i64)), pure(f(14)));
}

#[test]
fn applicative_interchange() {
    // u consumes input before producing its function
    let u: Parser<MapFn<i64, i64>> =
        char_('a').map(|_| Rc::new(|n: i64| n + 1) as MapFn<i64, i64>);
    let x = 41i64;
    let lhs = ap(u.clone(), pure(x));
    let apply_x: MapFn<MapFn<i64, i64>, i64> = Rc::new(move |f| f(x));
    let rhs = ap(pure(apply_x), u);
    assert_equiv("interchange", lhs, rhs);
}

#[test]
fn monad_left_identity() {
    let k = |c: char| char_(c).map(|c| c as u32);
    assert_equiv("pure x >>= k", pure('a').bind(k), k('a'));
}

#[test]
fn monad_right_identity() {
    assert_equiv("p >>= pure", probe().bind(Parser::pure), probe());
}

#[test]
fn monad_associativity() {
    let m = item();
    let g = |c: char| satisfy(move |d| d == c);
    let k = |c: char| pure(c as u32);
    let lhs = m.clone().bind(g).bind(k);
    let rhs = m.bind(move |x| g(x).bind(k));
    assert_equiv("bind associativity", lhs, rhs);
}

#[test]
fn alternative_left_catch() {
    assert_equiv("pure x <|> q", pure('x').or(probe()), pure('x'));
}

#[test]
fn alternative_associativity() {
    let u = || string("ab");
    let v = || string("ac");
    let w = || string("b");
    assert_equiv(
        "alt associativity",
        u().or(v()).or(w()),
        u().or(v().or(w())),
    );
}

#[test]
fn empty_is_identity_for_alt() {
    assert_equiv("empty <|> p", empty::<char>().or(probe()), probe());
    assert_equiv("p <|> empty", probe().or(empty()), probe());
}

#[test]
fn fused_maps_observe_like_unfused() {
    // the char/string fast-perform fusions must be invisible
    let lhs = char_('a').map(|c| c.to_ascii_uppercase());
    for input in CORPUS.iter().copied() {
        match observe(&lhs, input) {
            Ok((v, end)) => {
                assert_eq!(v, 'A');
                assert_eq!(end, 1);
                assert!(input.starts_with('a'));
            }
            Err((off, expected, _)) => {
                assert_eq!(off, 0);
                assert!(!input.starts_with('a'));
                assert_eq!(expected, vec!["\"a\"".to_string()]);
            }
        }
    }
}

#[test]
fn chain_left_agrees_with_manual_fold() {
    let digit = satisfy(|c| c.is_ascii_digit()).map(|c| c.to_digit(10).unwrap() as i64);
    let sub: Parser<BinFn<i64>> =
        char_('-').map(|_| Rc::new(|a: i64, b: i64| a - b) as BinFn<i64>);
    let chained = parsnip::chain_left1(digit.clone(), sub);
    // equivalent formulation from first principles
    let folded = parsnip::lift2(
        |x: i64, rest: Vec<i64>| rest.into_iter().fold(x, |a, b| a - b),
        digit.clone(),
        many(char_('-').then(digit)),
    );
    for input in ["1", "9-3", "9-3-2", "7-", "x", ""] {
        assert_eq!(
            observe(&chained, input).ok(),
            observe(&folded, input).ok(),
            "chain_left1 diverges on {input:?}"
        );
    }
}
