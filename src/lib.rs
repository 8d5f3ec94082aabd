//! Parser combinators that compile before they run.
//!
//! A parser built from this crate's combinators is not a closure; it is a
//! small algebraic tree. Compilation preprocesses that tree (resolving
//! recursion and absorbing error labels), rewrites it by the applicative,
//! alternative and monadic laws, and flattens it into an instruction array
//! executed by a backtracking stack machine.
//!
//! ```
//! use parsnip::{char_, many, run_parser};
//!
//! let p = many(char_('a'));
//! let s = run_parser(&p, "aaab").unwrap();
//! assert_eq!(s.value, vec!['a', 'a', 'a']);
//! assert_eq!(s.end.offset, 3);
//! ```

#![warn(clippy::all)]

mod ast;
mod codegen;
mod combinator;
pub mod diagnostic;
mod optimise;
mod preprocess;
mod vm;

pub use codegen::CompileError;
pub use combinator::{
    ap, attempt, branch, chain_left1, chain_post, chain_pre, chain_right1, char_, col,
    empty, eof, fail, fix, get, item, join, keyword, lazy, lift2, lift3, line, local,
    local_value, look_ahead, many, many1, many_until, modify, not_followed_by, operator,
    pos, pure, put, put_value, raw_string_literal, satisfy, sep_end_by1, sequence,
    skip_many, string, string_literal, traverse, unexpected, BinFn, Compiled, DebugBreak,
    MapFn, Parser, Reg, Success, UnFn,
};
pub use vm::{ParseFailure, Pos, TraceEvent, TracePhase, Tracer};

/// Either kind of failure from the one-shot entry point: a build error
/// (combinator misuse caught while compiling) or a parse failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Build(#[from] CompileError),
    #[error(transparent)]
    Parse(#[from] ParseFailure),
}

/// Compile (or reuse the cached program) and run in one step.
pub fn run_parser<A: Clone + 'static>(p: &Parser<A>, input: &str) -> Result<Success<A>, Error> {
    p.parse(input)
}
