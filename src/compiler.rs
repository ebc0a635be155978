//! Expression compiler: analysis, constant folding, and the compile cache.
//!
//! `compile()` parses the source, walks the AST once to collect metadata
//! (free variables, referenced methods, a rough complexity score, constness
//! and side-effect flags), pre-evaluates constant expressions, and caches the
//! compiled form keyed by the source text in a process-wide bounded map.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::ast::Expr;
use crate::evaluator::{self, Context, EvalError};
use crate::parser;
use crate::value::Value;

/// Names whose results vary between calls or touch the outside world.
/// Expressions referencing any of these are never pre-evaluated.
const SIDE_EFFECT_NAMES: &[&str] = &[
    "now", "random", "uuid", "print", "println", "log", "write", "save",
];

/// Static facts about an expression, gathered in one AST walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpressionMeta {
    /// Free variables: names the caller must bind before evaluating.
    /// Macro- and comprehension-bound variables are excluded.
    pub variables: BTreeSet<String>,
    /// Function and method names the expression references.
    pub methods: BTreeSet<String>,
    /// Rough cost estimate; macros weigh the most.
    pub complexity: u32,
    /// No free variables anywhere.
    pub is_constant: bool,
    /// References at least one name from the side-effecting set.
    pub has_side_effects: bool,
}

/// Analyze an AST, producing its metadata.
pub fn analyze(expr: &Expr) -> ExpressionMeta {
    let mut meta = ExpressionMeta::default();
    let mut bound: Vec<&str> = Vec::new();
    walk(expr, &mut meta, &mut bound);
    meta.is_constant = meta.variables.is_empty();
    meta
}

fn note_callee(name: &str, meta: &mut ExpressionMeta) {
    meta.methods.insert(name.to_string());
    if SIDE_EFFECT_NAMES.contains(&name) {
        meta.has_side_effects = true;
    }
}

fn walk<'a>(expr: &'a Expr, meta: &mut ExpressionMeta, bound: &mut Vec<&'a str>) {
    match expr {
        Expr::Literal(_) => {}

        Expr::Variable(name) => {
            meta.complexity += 1;
            // A builtin name in identifier position is a function reference,
            // not a binding the caller must supply
            if !bound.iter().any(|b| *b == name) && !evaluator::is_builtin(name) {
                meta.variables.insert(name.clone());
            }
        }

        Expr::Unary { operand, .. } => {
            meta.complexity += 1;
            walk(operand, meta, bound);
        }

        Expr::Binary { lhs, rhs, .. } => {
            meta.complexity += 1;
            walk(lhs, meta, bound);
            walk(rhs, meta, bound);
        }

        Expr::Ternary {
            condition,
            then_branch,
            else_branch,
        } => {
            meta.complexity += 2;
            walk(condition, meta, bound);
            walk(then_branch, meta, bound);
            walk(else_branch, meta, bound);
        }

        Expr::Between {
            value, low, high, ..
        } => {
            meta.complexity += 2;
            walk(value, meta, bound);
            walk(low, meta, bound);
            walk(high, meta, bound);
        }

        Expr::ArrayLiteral(elements) => {
            meta.complexity += 1;
            for element in elements {
                walk(element, meta, bound);
            }
        }

        Expr::MapLiteral(pairs) => {
            meta.complexity += 1;
            for (key, value) in pairs {
                walk(key, meta, bound);
                walk(value, meta, bound);
            }
        }

        Expr::Comprehension {
            body,
            variable,
            source,
            condition,
        } => {
            meta.complexity += 5;
            walk(source, meta, bound);
            bound.push(variable);
            if let Some(condition) = condition {
                walk(condition, meta, bound);
            }
            walk(body, meta, bound);
            bound.pop();
        }

        Expr::Call { name, args } => {
            meta.complexity += 3;
            note_callee(name, meta);
            // The function-form macros bind their first argument
            if matches!(name.as_str(), "filter" | "map" | "all" | "exists" | "find")
                && args.len() == 3
            {
                if let Expr::Variable(variable) = &args[0] {
                    walk(&args[1], meta, bound);
                    bound.push(variable);
                    walk(&args[2], meta, bound);
                    bound.pop();
                    return;
                }
            }
            for arg in args {
                walk(arg, meta, bound);
            }
        }

        Expr::MethodCall {
            receiver,
            method,
            args,
        } => {
            meta.complexity += 2;
            note_callee(method, meta);
            walk(receiver, meta, bound);
            for arg in args {
                walk(arg, meta, bound);
            }
        }

        Expr::FieldAccess { receiver, .. } => {
            meta.complexity += 1;
            walk(receiver, meta, bound);
        }

        Expr::IndexAccess { receiver, index } => {
            meta.complexity += 1;
            walk(receiver, meta, bound);
            walk(index, meta, bound);
        }

        Expr::Macro {
            receiver,
            kind,
            variable,
            body,
        } => {
            meta.complexity += 5;
            note_callee(kind.name(), meta);
            walk(receiver, meta, bound);
            if let (Some(variable), Some(body)) = (variable, body) {
                bound.push(variable);
                walk(body, meta, bound);
                bound.pop();
            }
        }
    }
}

/// The immutable product of `compile()`: the AST plus metadata and, for
/// constant expressions, the pre-evaluated result. Safe to share across
/// threads and evaluate repeatedly.
#[derive(Debug)]
pub struct CompiledExpression {
    source: String,
    ast: Expr,
    meta: ExpressionMeta,
    constant: Option<Value>,
}

impl CompiledExpression {
    /// Parse and analyze without touching the process-wide cache.
    pub fn new(source: &str) -> Result<Self, crate::Error> {
        let ast = parser::parse(source)?;
        let meta = analyze(&ast);
        let mut compiled = CompiledExpression {
            source: source.to_string(),
            ast,
            meta,
            constant: None,
        };

        if compiled.meta.is_constant && !compiled.meta.has_side_effects {
            // Pre-evaluation failures are swallowed here; a failing constant
            // simply isn't cached and will report its error at evaluate time
            if let Ok(v) = compiled.ast.evaluate(&mut Context::new()) {
                compiled.constant = Some(v);
            }
        }

        Ok(compiled)
    }

    /// Evaluate against a context, returning the folded constant when one
    /// was computed at compile time.
    pub fn evaluate(&self, ctx: &mut Context) -> Result<Value, EvalError> {
        if let Some(v) = &self.constant {
            return Ok(v.clone());
        }
        self.ast.evaluate(ctx)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn metadata(&self) -> &ExpressionMeta {
        &self.meta
    }

    /// The pre-evaluated result, when the expression folded to a constant.
    pub fn constant(&self) -> Option<&Value> {
        self.constant.as_ref()
    }
}

// ── Compile cache ────────────────────────────────────────────────────────────

static CACHE: Lazy<Mutex<HashMap<String, Arc<CompiledExpression>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static CACHE_CAPACITY: AtomicUsize = AtomicUsize::new(10_000);

fn cache_guard() -> MutexGuard<'static, HashMap<String, Arc<CompiledExpression>>> {
    match CACHE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Change the cache bound. Lowering it takes effect on subsequent inserts.
pub fn set_cache_capacity(capacity: usize) {
    CACHE_CAPACITY.store(capacity, Ordering::Relaxed);
}

/// Drop every cached compiled expression.
pub fn clear_cache() {
    cache_guard().clear();
}

/// Compile a source string, consulting and populating the process-wide cache.
///
/// Concurrent compiles of the same source converge on a single shared
/// compiled object. When the cache is full an arbitrary entry is evicted,
/// best-effort.
pub fn compile(source: &str) -> Result<Arc<CompiledExpression>, crate::Error> {
    if let Some(hit) = cache_guard().get(source) {
        return Ok(hit.clone());
    }

    let compiled = Arc::new(CompiledExpression::new(source)?);

    let mut cache = cache_guard();
    // Insert-or-fetch: a racing compile may have beaten us here
    if let Some(existing) = cache.get(source) {
        return Ok(existing.clone());
    }
    let capacity = CACHE_CAPACITY.load(Ordering::Relaxed);
    if capacity > 0 && cache.len() >= capacity {
        if let Some(victim) = cache.keys().next().cloned() {
            cache.remove(&victim);
        }
    }
    cache.insert(source.to_string(), compiled.clone());
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value;
    use crate::value::Value;

    #[test]
    fn test_metadata_variables() {
        let compiled = CompiledExpression::new("age > limit && age < 100").unwrap();
        let meta = compiled.metadata();
        assert_eq!(
            meta.variables,
            ["age", "limit"].iter().map(|s| s.to_string()).collect()
        );
        assert!(!meta.is_constant);
    }

    #[test]
    fn test_metadata_excludes_macro_bound_variables() {
        let compiled = CompiledExpression::new("xs.filter(n, n > lo)").unwrap();
        let meta = compiled.metadata();
        assert_eq!(
            meta.variables,
            ["xs", "lo"].iter().map(|s| s.to_string()).collect()
        );

        let compiled = CompiledExpression::new("[x * 2 | x in xs, x > 0]").unwrap();
        assert_eq!(
            compiled.metadata().variables,
            ["xs"].iter().map(|s| s.to_string()).collect()
        );

        let compiled = CompiledExpression::new("filter(n, xs, n > 5)").unwrap();
        assert_eq!(
            compiled.metadata().variables,
            ["xs"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn test_metadata_methods() {
        let compiled = CompiledExpression::new("users.filter(u, u.name.upper() == q)").unwrap();
        let meta = compiled.metadata();
        assert!(meta.methods.contains("filter"));
        assert!(meta.methods.contains("upper"));
    }

    #[test]
    fn test_metadata_side_effects() {
        let pure = CompiledExpression::new("upper('x')").unwrap();
        assert!(!pure.metadata().has_side_effects);

        let clocky = CompiledExpression::new("now() > deadline").unwrap();
        assert!(clocky.metadata().has_side_effects);
    }

    #[test]
    fn test_metadata_complexity_ordering() {
        let simple = CompiledExpression::new("1 + 2").unwrap();
        let heavy = CompiledExpression::new("xs.filter(n, n > 1).map(n, n * 2)").unwrap();
        assert!(heavy.metadata().complexity > simple.metadata().complexity);
    }

    #[test]
    fn test_constant_folding() {
        let compiled = CompiledExpression::new("1 + 2 * 3").unwrap();
        assert!(compiled.metadata().is_constant);
        assert_eq!(compiled.constant(), Some(&Value::Int(7)));
        assert_eq!(
            compiled.evaluate(&mut Context::new()).unwrap(),
            Value::Int(7)
        );

        let folded = CompiledExpression::new("upper('abc') + '!'").unwrap();
        assert_eq!(folded.constant(), Some(&Value::string("ABC!")));

        let folded = CompiledExpression::new("[n * n | n in [1, 2, 3]]").unwrap();
        assert_eq!(folded.constant(), Some(&value!([1, 4, 9])));
    }

    #[test]
    fn test_no_folding_with_free_variables() {
        let compiled = CompiledExpression::new("x + 1").unwrap();
        assert!(compiled.constant().is_none());
    }

    #[test]
    fn test_no_folding_with_side_effects() {
        let compiled = CompiledExpression::new("now()").unwrap();
        assert!(compiled.metadata().is_constant);
        assert!(compiled.constant().is_none());
    }

    #[test]
    fn test_failing_constant_not_cached() {
        // Constant but erroring: the fold is abandoned and the error
        // surfaces at evaluate time
        let compiled = CompiledExpression::new("1 / 0").unwrap();
        assert!(compiled.constant().is_none());
        assert!(matches!(
            compiled.evaluate(&mut Context::new()),
            Err(EvalError::DivisionByZero)
        ));
    }

    #[test]
    fn test_cache_identity_and_eviction() {
        // One test owns every assertion about the process-wide cache, so
        // parallel test threads cannot interleave capacity changes
        let a = compile("7 * 191").unwrap();
        let b = compile("7 * 191").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.evaluate(&mut Context::new()).unwrap(), Value::Int(1337));

        set_cache_capacity(4);
        clear_cache();
        for i in 0..20 {
            compile(&format!("{} + 0", i)).unwrap();
        }
        assert!(cache_guard().len() <= 4);
        set_cache_capacity(10_000);
        clear_cache();
    }

    #[test]
    fn test_compile_error_propagates() {
        assert!(compile("1 +").is_err());
        assert!(compile("'open").is_err());
    }

    #[test]
    fn test_compiled_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CompiledExpression>();
    }
}
