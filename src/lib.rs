//! # verdict
//!
//! A compact embeddable expression language for policy rules, data-extraction
//! formulas, and spreadsheet-like computations over dynamic values.
//!
//! Expressions are compiled once into an in-memory tree and evaluated against
//! a caller-supplied context of variables and functions:
//!
//! ```
//! use verdict::{compile, Context, Value};
//!
//! let expr = compile("users.filter(u, u.age >= limit).map(u, u.name)").unwrap();
//!
//! let mut ctx = Context::new();
//! ctx.set("limit", 18i64);
//! ctx.set("users", Value::from_json_str(
//!     r#"[{"name": "Ada", "age": 36}, {"name": "Tim", "age": 9}]"#,
//! ).unwrap());
//!
//! let names = expr.evaluate(&mut ctx).unwrap();
//! assert_eq!(names.to_string(), r#"["Ada"]"#);
//! ```
//!
//! ## Architecture
//!
//! - `parser` - lexer and Pratt parser (source text to AST)
//! - `ast` - expression tree definitions
//! - `evaluator` - tree-walking evaluator, context, builtin functions
//! - `functions` - builtin function bodies
//! - `datetime` - timestamp and duration parsing/formatting
//! - `compiler` - metadata analysis, constant folding, compile cache
//! - `value` - the dynamic `Value` type
//!
//! ## Language surface
//!
//! Arithmetic (`+ - * / % ^`), comparison (`== != < <= > >=`), short-circuit
//! logic (`&& || !`, or the keywords `and`/`or`/`not`), SQL-ish membership
//! and matching (`in`, `not in`, `between .. and ..`, `like`), ternary
//! (`cond ? a : b`), array and map literals, list comprehensions
//! (`[n * n | n in xs, n > 2]`), collection macros with a lexically bound
//! variable (`xs.filter(n, n > 5)`, `.map`, `.flatMap`, `.all`, `.exists`,
//! `.find`, `.sort`, `.groupBy`, `.size`, `.reverse`), method calls on
//! strings/arrays/maps, and some fifty builtin functions.

use thiserror::Error;

pub mod ast;
pub mod compiler;
pub mod datetime;
pub mod evaluator;
pub mod functions;
pub mod parser;
mod utils;
pub mod value;

pub use ast::{BinaryOp, Expr, MacroKind, UnaryOp};
pub use compiler::{clear_cache, compile, set_cache_capacity, CompiledExpression, ExpressionMeta};
pub use evaluator::{Context, EvalError, NativeFunction};
pub use parser::{parse, LexError, ParseError, Parser};
pub use value::Value;

/// Any failure the public API can report, spanning the lex, parse, and
/// evaluate stages.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Compile and evaluate in one call.
///
/// Compilation still goes through the process-wide cache, so repeated
/// evaluations of the same source only parse once. For hot paths, prefer
/// holding on to the result of [`compile`].
pub fn evaluate(source: &str, ctx: &mut Context) -> Result<Value, Error> {
    let compiled = compile(source)?;
    Ok(compiled.evaluate(ctx)?)
}
