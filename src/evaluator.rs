// Expression evaluator
// A recursive walk over the AST against an evaluation context. Operators
// dispatch on the pair of value variants; macros rebind their loop variable
// with save/restore semantics so the context is unchanged on exit.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::ast::{BinaryOp, Expr, MacroKind, UnaryOp};
use crate::datetime::{self, DateTimeError};
use crate::functions;
use crate::utils;
use crate::value::Value;

/// Evaluation errors
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("undefined function: {0}")]
    UndefinedFunction(String),

    #[error("method {method} not available on {type_name}")]
    MethodNotFound {
        type_name: &'static str,
        method: String,
    },

    #[error("type error: {0}")]
    TypeError(String),

    #[error("{name}() expects {expected} argument(s), got {actual}")]
    ArityError {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid pattern: {0}")]
    PatternError(String),

    #[error("conversion error: {0}")]
    ConversionError(String),
}

impl From<DateTimeError> for EvalError {
    fn from(e: DateTimeError) -> Self {
        EvalError::ConversionError(e.to_string())
    }
}

/// A caller-registered function.
pub type NativeFunction = Arc<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>;

/// Clock hook so `now()` is deterministic under test.
pub type TimeSource = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Evaluation context: variable bindings, registered functions, and the
/// time source. Created by the caller, populated before evaluation, and
/// borrowed mutably for the duration of one evaluate call.
pub struct Context {
    pub(crate) variables: HashMap<String, Value>,
    pub(crate) functions: HashMap<String, NativeFunction>,
    time_now: TimeSource,
}

impl Context {
    pub fn new() -> Self {
        Context {
            variables: HashMap::new(),
            functions: HashMap::new(),
            time_now: Arc::new(Utc::now),
        }
    }

    /// Bind a variable.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Bind several variables at once.
    pub fn set_batch(&mut self, vars: impl IntoIterator<Item = (String, Value)>) {
        for (name, value) in vars {
            self.variables.insert(name, value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn unset(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    /// Register a caller-supplied function, callable by name from expressions.
    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    ) {
        self.functions.insert(name.into(), Arc::new(f));
    }

    /// Override the clock used by `now()` and zero-argument `timestamp()`.
    pub fn set_time_source(&mut self, f: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) {
        self.time_now = Arc::new(f);
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.time_now)()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tree walk ────────────────────────────────────────────────────────────────

impl Expr {
    /// Evaluate this expression against a context.
    pub fn evaluate(&self, ctx: &mut Context) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),

            Expr::Variable(name) => lookup_identifier(name, ctx),

            Expr::Unary { op, operand } => {
                let v = operand.evaluate(ctx)?;
                eval_unary(*op, &v)
            }

            Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, ctx),

            Expr::Ternary {
                condition,
                then_branch,
                else_branch,
            } => {
                // Only the selected branch is evaluated
                if condition.evaluate(ctx)?.is_truthy() {
                    then_branch.evaluate(ctx)
                } else {
                    else_branch.evaluate(ctx)
                }
            }

            Expr::Between {
                value,
                low,
                high,
                negated,
            } => {
                let v = value.evaluate(ctx)?;
                let lo = low.evaluate(ctx)?;
                let hi = high.evaluate(ctx)?;
                let inside = matches!(v.compare(&lo), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(v.compare(&hi), Some(Ordering::Less | Ordering::Equal));
                Ok(Value::Bool(inside != *negated))
            }

            Expr::ArrayLiteral(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(element.evaluate(ctx)?);
                }
                Ok(Value::array(values))
            }

            Expr::MapLiteral(pairs) => {
                let mut map = IndexMap::with_capacity(pairs.len());
                for (key_expr, value_expr) in pairs {
                    let key = key_expr.evaluate(ctx)?;
                    let key = match key {
                        Value::String(s) => s.to_string(),
                        other => {
                            return Err(EvalError::TypeError(format!(
                                "map key must be a string, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key, value_expr.evaluate(ctx)?);
                }
                Ok(Value::object(map))
            }

            Expr::Comprehension {
                body,
                variable,
                source,
                condition,
            } => eval_comprehension(body, variable, source, condition.as_deref(), ctx),

            Expr::Call { name, args } => eval_call(name, args, ctx),

            Expr::MethodCall {
                receiver,
                method,
                args,
            } => {
                let recv = receiver.evaluate(ctx)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.evaluate(ctx)?);
                }
                call_method(&recv, method, &values)
            }

            Expr::FieldAccess { receiver, field } => {
                let recv = receiver.evaluate(ctx)?;
                match recv {
                    Value::Object(map) => Ok(map.get(field).cloned().unwrap_or(Value::Null)),
                    // Chaining through a missing record stays null
                    Value::Null => Ok(Value::Null),
                    other => Err(EvalError::TypeError(format!(
                        "cannot access field '{}' on {}",
                        field,
                        other.type_name()
                    ))),
                }
            }

            Expr::IndexAccess { receiver, index } => {
                let recv = receiver.evaluate(ctx)?;
                let idx = index.evaluate(ctx)?;
                eval_index(&recv, &idx)
            }

            Expr::Macro {
                receiver,
                kind,
                variable,
                body,
            } => {
                let source = receiver.evaluate(ctx)?;
                eval_macro(*kind, &source, variable.as_deref(), body.as_deref(), ctx)
            }
        }
    }
}

fn lookup_identifier(name: &str, ctx: &Context) -> Result<Value, EvalError> {
    if let Some(v) = ctx.variables.get(name) {
        return Ok(v.clone());
    }
    // Function names resolve to first-class callable references
    if ctx.functions.contains_key(name) || BUILTIN_NAMES.contains(name) {
        return Ok(Value::callable(name));
    }
    Err(EvalError::UndefinedVariable(name.to_string()))
}

// ── Operators ────────────────────────────────────────────────────────────────

fn eval_unary(op: UnaryOp, v: &Value) -> Result<Value, EvalError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
        UnaryOp::Negate => match v {
            Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
            Value::Float(n) => Ok(Value::Float(-n)),
            Value::Duration(d) => chrono::Duration::zero()
                .checked_sub(d)
                .map(Value::Duration)
                .ok_or_else(|| EvalError::TypeError("duration overflow".to_string())),
            other => Err(EvalError::TypeError(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        },
    }
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, ctx: &mut Context) -> Result<Value, EvalError> {
    // Logical operators short-circuit: the right side is not evaluated (and
    // its errors not observed) when the left side decides the result.
    match op {
        BinaryOp::And => {
            if !lhs.evaluate(ctx)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(rhs.evaluate(ctx)?.is_truthy()));
        }
        BinaryOp::Or => {
            if lhs.evaluate(ctx)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(rhs.evaluate(ctx)?.is_truthy()));
        }
        _ => {}
    }

    let left = lhs.evaluate(ctx)?;
    let right = rhs.evaluate(ctx)?;

    match op {
        BinaryOp::Add => add(&left, &right),
        BinaryOp::Subtract => subtract(&left, &right),
        BinaryOp::Multiply => multiply(&left, &right),
        BinaryOp::Divide => divide(&left, &right),
        BinaryOp::Modulo => functions::numeric::modulo(&left, &right),
        BinaryOp::Power => functions::numeric::pow(&left, &right),

        BinaryOp::Equal => Ok(Value::Bool(left == right)),
        BinaryOp::NotEqual => Ok(Value::Bool(left != right)),
        BinaryOp::LessThan => Ok(Value::Bool(matches!(
            left.compare(&right),
            Some(Ordering::Less)
        ))),
        BinaryOp::LessThanOrEqual => Ok(Value::Bool(matches!(
            left.compare(&right),
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOp::GreaterThan => Ok(Value::Bool(matches!(
            left.compare(&right),
            Some(Ordering::Greater)
        ))),
        BinaryOp::GreaterThanOrEqual => Ok(Value::Bool(matches!(
            left.compare(&right),
            Some(Ordering::Greater | Ordering::Equal)
        ))),

        BinaryOp::In => in_operator(&left, &right),
        BinaryOp::NotIn => {
            let result = in_operator(&left, &right)?;
            Ok(Value::Bool(!result.is_truthy()))
        }
        BinaryOp::Like => Ok(Value::Bool(utils::like_match(
            &left.to_string(),
            &right.to_string(),
        ))),

        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(
            // Handled above; kept total for exhaustiveness
            left.is_truthy() && right.is_truthy(),
        )),
    }
}

fn add(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        // String concatenation coerces the other operand
        (Value::String(a), b) => Ok(Value::string(format!("{}{}", a, b))),
        (a, Value::String(b)) => Ok(Value::string(format!("{}{}", a, b))),
        (Value::Timestamp(t), Value::Duration(d)) | (Value::Duration(d), Value::Timestamp(t)) => t
            .checked_add_signed(*d)
            .map(Value::Timestamp)
            .ok_or_else(|| EvalError::TypeError("timestamp out of range".to_string())),
        (Value::Duration(a), Value::Duration(b)) => a
            .checked_add(b)
            .map(Value::Duration)
            .ok_or_else(|| EvalError::TypeError("duration overflow".to_string())),
        (a, b) => Err(binary_type_error("+", a, b)),
    }
}

fn subtract(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 - b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a - *b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Ok(Value::Duration(*a - *b)),
        (Value::Timestamp(t), Value::Duration(d)) => t
            .checked_sub_signed(*d)
            .map(Value::Timestamp)
            .ok_or_else(|| EvalError::TypeError("timestamp out of range".to_string())),
        (Value::Duration(a), Value::Duration(b)) => a
            .checked_sub(b)
            .map(Value::Duration)
            .ok_or_else(|| EvalError::TypeError("duration overflow".to_string())),
        (a, b) => Err(binary_type_error("-", a, b)),
    }
}

fn multiply(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 * b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a * *b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a * b)),
        (a, b) => Err(binary_type_error("*", a, b)),
    }
}

fn divide(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(Value::Int(a.wrapping_div(*b)))
            }
        }
        // Float division by zero yields IEEE infinity/NaN
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 / b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a / *b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a / b)),
        (a, b) => Err(binary_type_error("/", a, b)),
    }
}

fn binary_type_error(op: &str, left: &Value, right: &Value) -> EvalError {
    EvalError::TypeError(format!(
        "invalid operands for {}: {} {} {}",
        op,
        left.type_name(),
        op,
        right.type_name()
    ))
}

fn in_operator(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match right {
        Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| item == left))),
        Value::String(s) => Ok(Value::Bool(s.contains(&left.to_string()))),
        other => Err(EvalError::TypeError(format!(
            "in requires an array or string on the right, got {}",
            other.type_name()
        ))),
    }
}

fn eval_index(receiver: &Value, index: &Value) -> Result<Value, EvalError> {
    match (receiver, index) {
        (Value::Array(items), _) if index.is_number() => {
            let i = index_position(index, items.len());
            Ok(i.and_then(|i| items.get(i)).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(map), Value::String(key)) => {
            Ok(map.get(&**key).cloned().unwrap_or(Value::Null))
        }
        (Value::String(s), _) if index.is_number() => {
            let chars: Vec<char> = s.chars().collect();
            let i = index_position(index, chars.len());
            Ok(i.and_then(|i| chars.get(i))
                .map(|c| Value::string(c.to_string()))
                .unwrap_or(Value::Null))
        }
        (recv, idx) => Err(EvalError::TypeError(format!(
            "cannot index {} with {}",
            recv.type_name(),
            idx.type_name()
        ))),
    }
}

/// Resolve a numeric index against a length; negative indexes count from the
/// end, anything out of range is None.
fn index_position(index: &Value, len: usize) -> Option<usize> {
    let raw = match index {
        Value::Int(n) => *n,
        Value::Float(n) if n.fract() == 0.0 => *n as i64,
        _ => return None,
    };
    let resolved = if raw < 0 { raw + len as i64 } else { raw };
    if resolved < 0 || resolved >= len as i64 {
        None
    } else {
        Some(resolved as usize)
    }
}

// ── Macros ───────────────────────────────────────────────────────────────────

fn eval_macro(
    kind: MacroKind,
    source: &Value,
    variable: Option<&str>,
    body: Option<&Expr>,
    ctx: &mut Context,
) -> Result<Value, EvalError> {
    match kind {
        MacroKind::Size => functions::collection::size(source),
        MacroKind::Reverse => match source {
            Value::Array(items) => {
                let mut reversed = (**items).clone();
                reversed.reverse();
                Ok(Value::array(reversed))
            }
            Value::String(s) => Ok(Value::string(s.chars().rev().collect::<String>())),
            other => Err(EvalError::TypeError(format!(
                "reverse() requires an array or string, got {}",
                other.type_name()
            ))),
        },
        _ => {
            let items = match source {
                Value::Array(items) => items.clone(),
                other => {
                    return Err(EvalError::TypeError(format!(
                        "{}() requires an array, got {}",
                        kind.name(),
                        other.type_name()
                    )))
                }
            };
            let (variable, body) = match (variable, body) {
                (Some(v), Some(b)) => (v, b),
                _ => {
                    return Err(EvalError::TypeError(format!(
                        "{}() requires a variable and body",
                        kind.name()
                    )))
                }
            };
            run_macro(kind, &items, variable, body, ctx)
        }
    }
}

/// Execute a macro body once per element with the loop variable bound.
///
/// The prior binding of the variable (or its absence) is restored on every
/// exit path, including early exit and error, so nested macros with shadowed
/// names and failing bodies leave the context untouched.
pub(crate) fn run_macro(
    kind: MacroKind,
    items: &[Value],
    variable: &str,
    body: &Expr,
    ctx: &mut Context,
) -> Result<Value, EvalError> {
    let saved = ctx.variables.get(variable).cloned();
    let result = macro_loop(kind, items, variable, body, ctx);
    restore_binding(ctx, variable, saved);
    result
}

fn restore_binding(ctx: &mut Context, variable: &str, saved: Option<Value>) {
    match saved {
        Some(v) => {
            ctx.variables.insert(variable.to_string(), v);
        }
        None => {
            ctx.variables.remove(variable);
        }
    }
}

fn macro_loop(
    kind: MacroKind,
    items: &[Value],
    variable: &str,
    body: &Expr,
    ctx: &mut Context,
) -> Result<Value, EvalError> {
    let mut bind = |ctx: &mut Context, item: &Value| {
        ctx.variables.insert(variable.to_string(), item.clone());
    };

    match kind {
        MacroKind::Filter => {
            let mut result = Vec::with_capacity(items.len());
            for item in items {
                bind(ctx, item);
                if body.evaluate(ctx)?.is_truthy() {
                    result.push(item.clone());
                }
            }
            Ok(Value::array(result))
        }

        MacroKind::Map => {
            let mut result = Vec::with_capacity(items.len());
            for item in items {
                bind(ctx, item);
                result.push(body.evaluate(ctx)?);
            }
            Ok(Value::array(result))
        }

        MacroKind::FlatMap => {
            let mut result = Vec::with_capacity(items.len());
            for item in items {
                bind(ctx, item);
                match body.evaluate(ctx)? {
                    // One level of flattening only
                    Value::Array(inner) => result.extend(inner.iter().cloned()),
                    other => result.push(other),
                }
            }
            Ok(Value::array(result))
        }

        MacroKind::All => {
            for item in items {
                bind(ctx, item);
                if !body.evaluate(ctx)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }

        MacroKind::Exists => {
            for item in items {
                bind(ctx, item);
                if body.evaluate(ctx)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }

        MacroKind::Find => {
            for item in items {
                bind(ctx, item);
                if body.evaluate(ctx)?.is_truthy() {
                    return Ok(item.clone());
                }
            }
            Ok(Value::Null)
        }

        MacroKind::Sort => {
            // Decorate with keys first so the body runs once per element,
            // then stable-sort on the key
            let mut keyed = Vec::with_capacity(items.len());
            for item in items {
                bind(ctx, item);
                keyed.push((body.evaluate(ctx)?, item.clone()));
            }
            keyed.sort_by(|(ka, _), (kb, _)| match ka.compare(kb) {
                Some(ordering) => ordering,
                None => ka.to_string().cmp(&kb.to_string()),
            });
            Ok(Value::array(keyed.into_iter().map(|(_, item)| item).collect()))
        }

        MacroKind::GroupBy => {
            let mut groups: IndexMap<String, Vec<Value>> = IndexMap::new();
            for item in items {
                bind(ctx, item);
                let key = body.evaluate(ctx)?.to_string();
                groups.entry(key).or_default().push(item.clone());
            }
            let map: IndexMap<String, Value> = groups
                .into_iter()
                .map(|(k, group)| (k, Value::array(group)))
                .collect();
            Ok(Value::object(map))
        }

        MacroKind::Size | MacroKind::Reverse => Err(EvalError::TypeError(format!(
            "{}() takes no body",
            kind.name()
        ))),
    }
}

/// `[body | x in source, cond]` is filter-then-map per element, with the same
/// binding discipline as the macros.
fn eval_comprehension(
    body: &Expr,
    variable: &str,
    source: &Expr,
    condition: Option<&Expr>,
    ctx: &mut Context,
) -> Result<Value, EvalError> {
    let source_value = source.evaluate(ctx)?;
    let items = match source_value {
        Value::Array(items) => items,
        other => {
            return Err(EvalError::TypeError(format!(
                "comprehension source must be an array, got {}",
                other.type_name()
            )))
        }
    };

    let saved = ctx.variables.get(variable).cloned();
    let result = (|| {
        let mut out = Vec::with_capacity(items.len());
        for item in items.iter() {
            ctx.variables.insert(variable.to_string(), item.clone());
            if let Some(cond) = condition {
                if !cond.evaluate(ctx)?.is_truthy() {
                    continue;
                }
            }
            out.push(body.evaluate(ctx)?);
        }
        Ok(Value::array(out))
    })();
    restore_binding(ctx, variable, saved);
    result
}

// ── Function calls ───────────────────────────────────────────────────────────

/// Function-form macros: `filter(x, coll, body)` and friends route through
/// the same macro engine as the method form.
fn function_form_macro(name: &str) -> Option<MacroKind> {
    match name {
        "filter" => Some(MacroKind::Filter),
        "map" => Some(MacroKind::Map),
        "all" => Some(MacroKind::All),
        "exists" => Some(MacroKind::Exists),
        "find" => Some(MacroKind::Find),
        _ => None,
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &mut Context) -> Result<Value, EvalError> {
    if let Some(kind) = function_form_macro(name) {
        if args.len() != 3 {
            return Err(EvalError::ArityError {
                name: name.to_string(),
                expected: 3,
                actual: args.len(),
            });
        }
        let variable = match &args[0] {
            Expr::Variable(v) => v.clone(),
            _ => {
                return Err(EvalError::TypeError(format!(
                    "{}() first argument must be a variable name",
                    name
                )))
            }
        };
        let source = args[1].evaluate(ctx)?;
        let items = match source {
            Value::Array(items) => items,
            other => {
                return Err(EvalError::TypeError(format!(
                    "{}() requires an array, got {}",
                    name,
                    other.type_name()
                )))
            }
        };
        return run_macro(kind, &items, &variable, &args[2], ctx);
    }

    // Arguments evaluate left-to-right before the call
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(arg.evaluate(ctx)?);
    }
    call_named(name, &values, ctx)
}

/// Resolve a call by name: builtins first, then user-registered functions,
/// then a variable holding a callable reference.
fn call_named(name: &str, args: &[Value], ctx: &mut Context) -> Result<Value, EvalError> {
    if BUILTIN_NAMES.contains(name) {
        return call_builtin(name, args, ctx);
    }
    if let Some(f) = ctx.functions.get(name).cloned() {
        return f(args);
    }
    if let Some(Value::Callable(target)) = ctx.variables.get(name).cloned() {
        if &*target != name {
            return call_named(&target, args, ctx);
        }
    }
    Err(EvalError::UndefinedFunction(name.to_string()))
}

// ── Method dispatch ──────────────────────────────────────────────────────────

fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    match receiver {
        Value::Array(items) => array_method(items, method, args),
        Value::String(s) => string_method(s, method, args),
        Value::Object(map) => object_method(map, method, args),
        other => Err(EvalError::MethodNotFound {
            type_name: other.type_name(),
            method: method.to_string(),
        }),
    }
}

fn array_method(items: &[Value], method: &str, args: &[Value]) -> Result<Value, EvalError> {
    match method {
        // Collection-chain stages (filter(...).map(...).join(...))
        "join" => {
            check_arity(method, 1, args.len())?;
            let sep = want_str(method, &args[0])?;
            Ok(functions::collection::join(items, sep))
        }
        "distinct" => {
            check_arity(method, 0, args.len())?;
            Ok(functions::collection::distinct(items))
        }
        "flatten" => {
            check_arity(method, 0, args.len())?;
            Ok(functions::collection::flatten(items))
        }
        "sum" => {
            check_arity(method, 0, args.len())?;
            functions::collection::sum(items)
        }
        "avg" => {
            check_arity(method, 0, args.len())?;
            functions::collection::avg(items)
        }
        "min" | "max" => {
            check_arity(method, 0, args.len())?;
            if items.is_empty() {
                return Ok(Value::Null);
            }
            if method == "min" {
                functions::numeric::min(items)
            } else {
                functions::numeric::max(items)
            }
        }
        "first" => {
            check_arity(method, 0, args.len())?;
            Ok(items.first().cloned().unwrap_or(Value::Null))
        }
        "last" => {
            check_arity(method, 0, args.len())?;
            Ok(items.last().cloned().unwrap_or(Value::Null))
        }
        "length" => {
            check_arity(method, 0, args.len())?;
            Ok(Value::Int(items.len() as i64))
        }
        "contains" => {
            check_arity(method, 1, args.len())?;
            Ok(functions::collection::contains(items, &args[0]))
        }
        _ => Err(EvalError::MethodNotFound {
            type_name: "array",
            method: method.to_string(),
        }),
    }
}

fn string_method(s: &str, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    match method {
        "upper" => {
            check_arity(method, 0, args.len())?;
            Ok(functions::string::upper(s))
        }
        "lower" => {
            check_arity(method, 0, args.len())?;
            Ok(functions::string::lower(s))
        }
        "trim" => {
            check_arity(method, 0, args.len())?;
            Ok(functions::string::trim(s))
        }
        "length" => {
            check_arity(method, 0, args.len())?;
            Ok(functions::string::length(s))
        }
        "replace" => {
            check_arity(method, 2, args.len())?;
            let from = want_str(method, &args[0])?;
            let to = want_str(method, &args[1])?;
            Ok(functions::string::replace(s, from, to))
        }
        "contains" => {
            check_arity(method, 1, args.len())?;
            Ok(functions::string::contains(s, want_str(method, &args[0])?))
        }
        "startsWith" => {
            check_arity(method, 1, args.len())?;
            Ok(functions::string::starts_with(
                s,
                want_str(method, &args[0])?,
            ))
        }
        "endsWith" => {
            check_arity(method, 1, args.len())?;
            Ok(functions::string::ends_with(s, want_str(method, &args[0])?))
        }
        "substring" => {
            if args.is_empty() || args.len() > 2 {
                return Err(EvalError::ArityError {
                    name: method.to_string(),
                    expected: 2,
                    actual: args.len(),
                });
            }
            let start = want_index(method, &args[0])?;
            let end = match args.get(1) {
                Some(v) => Some(want_index(method, v)?),
                None => None,
            };
            Ok(functions::string::substring(s, start, end))
        }
        "split" => {
            check_arity(method, 1, args.len())?;
            Ok(functions::string::split(s, want_str(method, &args[0])?))
        }
        "matches" => {
            check_arity(method, 1, args.len())?;
            functions::string::matches(s, want_str(method, &args[0])?)
        }
        _ => Err(EvalError::MethodNotFound {
            type_name: "string",
            method: method.to_string(),
        }),
    }
}

fn object_method(
    map: &IndexMap<String, Value>,
    method: &str,
    args: &[Value],
) -> Result<Value, EvalError> {
    match method {
        "keys" => {
            check_arity(method, 0, args.len())?;
            Ok(Value::array(
                map.keys().map(|k| Value::string(k.clone())).collect(),
            ))
        }
        "values" => {
            check_arity(method, 0, args.len())?;
            Ok(Value::array(map.values().cloned().collect()))
        }
        "has" => {
            check_arity(method, 1, args.len())?;
            Ok(Value::Bool(map.contains_key(want_str(method, &args[0])?)))
        }
        "field" => {
            check_arity(method, 1, args.len())?;
            let key = want_str(method, &args[0])?;
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        "length" => {
            check_arity(method, 0, args.len())?;
            Ok(Value::Int(map.len() as i64))
        }
        _ => Err(EvalError::MethodNotFound {
            type_name: "map",
            method: method.to_string(),
        }),
    }
}

// ── Builtin registry ─────────────────────────────────────────────────────────

/// Names resolvable as builtins, initialized once; also consulted by
/// identifier lookup to produce callable references.
pub(crate) static BUILTIN_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // string
        "upper",
        "lower",
        "trim",
        "replace",
        "split",
        "length",
        "contains",
        "startsWith",
        "endsWith",
        "substring",
        "matches",
        "findAll",
        "replaceRegex",
        // math
        "abs",
        "ceil",
        "floor",
        "round",
        "sqrt",
        "pow",
        "power",
        "mod",
        "min",
        "max",
        // collections
        "sum",
        "avg",
        "distinct",
        "flatten",
        "size",
        "first",
        "last",
        "sort",
        "join",
        // json
        "toJson",
        "fromJson",
        // time
        "now",
        "date",
        "timestamp",
        "formatTime",
        "addDuration",
        "subDuration",
        "duration",
        "getYear",
        "getMonth",
        "getDay",
        "getHour",
        // type
        "type",
        "int",
        "double",
        "string",
        "toString",
        "bytes",
        "optional",
    ]
    .into_iter()
    .collect()
});

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(name) || function_form_macro(name).is_some()
}

fn check_arity(name: &str, expected: usize, actual: usize) -> Result<(), EvalError> {
    if expected != actual {
        return Err(EvalError::ArityError {
            name: name.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn want_str<'a>(name: &str, v: &'a Value) -> Result<&'a str, EvalError> {
    v.as_str().ok_or_else(|| {
        EvalError::TypeError(format!(
            "{}() requires a string argument, got {}",
            name,
            v.type_name()
        ))
    })
}

fn want_array<'a>(name: &str, v: &'a Value) -> Result<&'a Vec<Value>, EvalError> {
    v.as_array().ok_or_else(|| {
        EvalError::TypeError(format!(
            "{}() requires an array argument, got {}",
            name,
            v.type_name()
        ))
    })
}

fn want_index(name: &str, v: &Value) -> Result<i64, EvalError> {
    match v {
        Value::Int(n) => Ok(*n),
        Value::Float(n) if n.fract() == 0.0 => Ok(*n as i64),
        other => Err(EvalError::TypeError(format!(
            "{}() requires an integer argument, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn want_timestamp(name: &str, v: &Value) -> Result<DateTime<Utc>, EvalError> {
    v.as_timestamp().ok_or_else(|| {
        EvalError::TypeError(format!(
            "{}() requires a timestamp argument, got {}",
            name,
            v.type_name()
        ))
    })
}

fn want_duration(name: &str, v: &Value) -> Result<chrono::Duration, EvalError> {
    v.as_duration().ok_or_else(|| {
        EvalError::TypeError(format!(
            "{}() requires a duration argument, got {}",
            name,
            v.type_name()
        ))
    })
}

fn call_builtin(name: &str, args: &[Value], ctx: &Context) -> Result<Value, EvalError> {
    match name {
        // ── string ───────────────────────────────────────────────────
        "upper" => {
            check_arity(name, 1, args.len())?;
            Ok(functions::string::upper(want_str(name, &args[0])?))
        }
        "lower" => {
            check_arity(name, 1, args.len())?;
            Ok(functions::string::lower(want_str(name, &args[0])?))
        }
        "trim" => {
            check_arity(name, 1, args.len())?;
            Ok(functions::string::trim(want_str(name, &args[0])?))
        }
        "replace" => {
            check_arity(name, 3, args.len())?;
            Ok(functions::string::replace(
                want_str(name, &args[0])?,
                want_str(name, &args[1])?,
                want_str(name, &args[2])?,
            ))
        }
        "split" => {
            check_arity(name, 2, args.len())?;
            Ok(functions::string::split(
                want_str(name, &args[0])?,
                want_str(name, &args[1])?,
            ))
        }
        "length" | "size" => {
            check_arity(name, 1, args.len())?;
            functions::collection::size(&args[0])
        }
        "contains" => {
            check_arity(name, 2, args.len())?;
            match &args[0] {
                Value::Array(items) => Ok(functions::collection::contains(items, &args[1])),
                Value::String(s) => Ok(functions::string::contains(s, want_str(name, &args[1])?)),
                other => Err(EvalError::TypeError(format!(
                    "contains() requires a string or array, got {}",
                    other.type_name()
                ))),
            }
        }
        "startsWith" => {
            check_arity(name, 2, args.len())?;
            Ok(functions::string::starts_with(
                want_str(name, &args[0])?,
                want_str(name, &args[1])?,
            ))
        }
        "endsWith" => {
            check_arity(name, 2, args.len())?;
            Ok(functions::string::ends_with(
                want_str(name, &args[0])?,
                want_str(name, &args[1])?,
            ))
        }
        "substring" => {
            if args.len() < 2 || args.len() > 3 {
                return Err(EvalError::ArityError {
                    name: name.to_string(),
                    expected: 3,
                    actual: args.len(),
                });
            }
            let s = want_str(name, &args[0])?;
            let start = want_index(name, &args[1])?;
            let end = match args.get(2) {
                Some(v) => Some(want_index(name, v)?),
                None => None,
            };
            Ok(functions::string::substring(s, start, end))
        }
        "matches" => {
            check_arity(name, 2, args.len())?;
            functions::string::matches(want_str(name, &args[0])?, want_str(name, &args[1])?)
        }
        "findAll" => {
            check_arity(name, 2, args.len())?;
            functions::string::find_all(want_str(name, &args[0])?, want_str(name, &args[1])?)
        }
        "replaceRegex" => {
            check_arity(name, 3, args.len())?;
            functions::string::replace_regex(
                want_str(name, &args[0])?,
                want_str(name, &args[1])?,
                want_str(name, &args[2])?,
            )
        }

        // ── math ─────────────────────────────────────────────────────
        "abs" => {
            check_arity(name, 1, args.len())?;
            functions::numeric::abs(&args[0])
        }
        "ceil" => {
            check_arity(name, 1, args.len())?;
            functions::numeric::ceil(&args[0])
        }
        "floor" => {
            check_arity(name, 1, args.len())?;
            functions::numeric::floor(&args[0])
        }
        "round" => {
            check_arity(name, 1, args.len())?;
            functions::numeric::round(&args[0])
        }
        "sqrt" => {
            check_arity(name, 1, args.len())?;
            functions::numeric::sqrt(&args[0])
        }
        "pow" | "power" => {
            check_arity(name, 2, args.len())?;
            functions::numeric::pow(&args[0], &args[1])
        }
        "mod" => {
            check_arity(name, 2, args.len())?;
            functions::numeric::modulo(&args[0], &args[1])
        }
        "min" | "max" => {
            if args.len() < 2 {
                return Err(EvalError::ArityError {
                    name: name.to_string(),
                    expected: 2,
                    actual: args.len(),
                });
            }
            if name == "min" {
                functions::numeric::min(args)
            } else {
                functions::numeric::max(args)
            }
        }

        // ── collections ──────────────────────────────────────────────
        "sum" => {
            check_arity(name, 1, args.len())?;
            functions::collection::sum(want_array(name, &args[0])?)
        }
        "avg" => {
            check_arity(name, 1, args.len())?;
            functions::collection::avg(want_array(name, &args[0])?)
        }
        "distinct" => {
            check_arity(name, 1, args.len())?;
            Ok(functions::collection::distinct(want_array(name, &args[0])?))
        }
        "flatten" => {
            check_arity(name, 1, args.len())?;
            Ok(functions::collection::flatten(want_array(name, &args[0])?))
        }
        "first" => {
            check_arity(name, 1, args.len())?;
            functions::collection::first(&args[0])
        }
        "last" => {
            check_arity(name, 1, args.len())?;
            functions::collection::last(&args[0])
        }
        "sort" => {
            check_arity(name, 1, args.len())?;
            Ok(functions::collection::sort(want_array(name, &args[0])?))
        }
        "join" => {
            check_arity(name, 2, args.len())?;
            Ok(functions::collection::join(
                want_array(name, &args[0])?,
                want_str(name, &args[1])?,
            ))
        }

        // ── json ─────────────────────────────────────────────────────
        "toJson" => {
            check_arity(name, 1, args.len())?;
            functions::json::to_json(&args[0])
        }
        "fromJson" => {
            check_arity(name, 1, args.len())?;
            functions::json::from_json(want_str(name, &args[0])?)
        }

        // ── time ─────────────────────────────────────────────────────
        "now" => {
            check_arity(name, 0, args.len())?;
            Ok(Value::Timestamp(ctx.now()))
        }
        "date" => {
            check_arity(name, 3, args.len())?;
            let year = want_index(name, &args[0])?;
            let month = want_index(name, &args[1])?;
            let day = want_index(name, &args[2])?;
            if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
                return Err(EvalError::ConversionError(format!(
                    "invalid date: {}-{}-{}",
                    year, month, day
                )));
            }
            Utc.with_ymd_and_hms(year as i32, month as u32, day as u32, 0, 0, 0)
                .single()
                .map(Value::Timestamp)
                .ok_or_else(|| {
                    EvalError::ConversionError(format!("invalid date: {}-{}-{}", year, month, day))
                })
        }
        "timestamp" => match args.len() {
            0 => Ok(Value::Timestamp(ctx.now())),
            1 => match &args[0] {
                Value::Timestamp(t) => Ok(Value::Timestamp(*t)),
                Value::String(s) => Ok(Value::Timestamp(datetime::parse_timestamp(s)?)),
                other => Err(EvalError::ConversionError(format!(
                    "cannot convert {} to timestamp",
                    other.type_name()
                ))),
            },
            actual => Err(EvalError::ArityError {
                name: name.to_string(),
                expected: 1,
                actual,
            }),
        },
        "formatTime" => {
            check_arity(name, 2, args.len())?;
            let t = want_timestamp(name, &args[0])?;
            let pattern = want_str(name, &args[1])?;
            Ok(Value::string(datetime::format_timestamp(&t, pattern)?))
        }
        "addDuration" => {
            check_arity(name, 2, args.len())?;
            let t = want_timestamp(name, &args[0])?;
            let d = want_duration(name, &args[1])?;
            t.checked_add_signed(d)
                .map(Value::Timestamp)
                .ok_or_else(|| EvalError::TypeError("timestamp out of range".to_string()))
        }
        "subDuration" => {
            check_arity(name, 2, args.len())?;
            let t = want_timestamp(name, &args[0])?;
            let d = want_duration(name, &args[1])?;
            t.checked_sub_signed(d)
                .map(Value::Timestamp)
                .ok_or_else(|| EvalError::TypeError("timestamp out of range".to_string()))
        }
        "duration" => {
            check_arity(name, 1, args.len())?;
            match &args[0] {
                Value::Duration(d) => Ok(Value::Duration(*d)),
                Value::String(s) => Ok(Value::Duration(datetime::parse_duration(s)?)),
                Value::Int(n) => Ok(Value::Duration(chrono::Duration::nanoseconds(*n))),
                Value::Float(n) => Ok(Value::Duration(chrono::Duration::nanoseconds(*n as i64))),
                other => Err(EvalError::ConversionError(format!(
                    "cannot convert {} to duration",
                    other.type_name()
                ))),
            }
        }
        "getYear" => {
            check_arity(name, 1, args.len())?;
            Ok(Value::Int(want_timestamp(name, &args[0])?.year() as i64))
        }
        "getMonth" => {
            check_arity(name, 1, args.len())?;
            Ok(Value::Int(want_timestamp(name, &args[0])?.month() as i64))
        }
        "getDay" => {
            check_arity(name, 1, args.len())?;
            Ok(Value::Int(want_timestamp(name, &args[0])?.day() as i64))
        }
        "getHour" => {
            check_arity(name, 1, args.len())?;
            Ok(Value::Int(want_timestamp(name, &args[0])?.hour() as i64))
        }

        // ── type ─────────────────────────────────────────────────────
        "type" => {
            check_arity(name, 1, args.len())?;
            Ok(functions::conv::type_of(&args[0]))
        }
        "int" => {
            check_arity(name, 1, args.len())?;
            functions::conv::to_int(&args[0])
        }
        "double" => {
            check_arity(name, 1, args.len())?;
            functions::conv::to_double(&args[0])
        }
        "string" | "toString" => {
            check_arity(name, 1, args.len())?;
            Ok(functions::conv::to_string(&args[0]))
        }
        "bytes" => {
            check_arity(name, 1, args.len())?;
            functions::conv::to_bytes(&args[0])
        }
        "optional" => {
            check_arity(name, 1, args.len())?;
            Ok(functions::conv::to_optional(&args[0]))
        }

        other => Err(EvalError::UndefinedFunction(other.to_string())),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::value;

    fn eval(src: &str, ctx: &mut Context) -> Result<Value, EvalError> {
        let expr = parse(src).expect(src);
        expr.evaluate(ctx)
    }

    fn eval_ok(src: &str, ctx: &mut Context) -> Value {
        eval(src, ctx).expect(src)
    }

    #[test]
    fn test_arithmetic() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("1 + 2 * 3", ctx), Value::Int(7));
        assert_eq!(eval_ok("5 - 3", ctx), Value::Int(2));
        assert_eq!(eval_ok("10 / 4", ctx), Value::Int(2));
        assert_eq!(eval_ok("10.0 / 4", ctx), Value::Float(2.5));
        assert_eq!(eval_ok("17 % 5", ctx), Value::Int(2));
        assert_eq!(eval_ok("2 ^ 10", ctx), Value::Int(1024));
        assert_eq!(eval_ok("2 ^ 3 ^ 2", ctx), Value::Int(512));
        assert_eq!(eval_ok("-5 + 3", ctx), Value::Int(-2));
    }

    #[test]
    fn test_numeric_promotion() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("1 + 2.5", ctx), Value::Float(3.5));
        assert_eq!(eval_ok("2.5 * 2", ctx), Value::Float(5.0));
        assert_eq!(eval_ok("2.0 ^ 3", ctx), Value::Float(8.0));
        assert_eq!(eval_ok("7.5 % 2", ctx), Value::Float(1.5));
    }

    #[test]
    fn test_division_by_zero() {
        let ctx = &mut Context::new();
        assert!(matches!(eval("1 / 0", ctx), Err(EvalError::DivisionByZero)));
        assert!(matches!(eval("1 % 0", ctx), Err(EvalError::DivisionByZero)));
        // Float division by zero is IEEE infinity, not an error
        assert_eq!(eval_ok("1.0 / 0", ctx), Value::Float(f64::INFINITY));
    }

    #[test]
    fn test_string_concatenation() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("'foo' + 'bar'", ctx), Value::string("foobar"));
        assert_eq!(eval_ok("'x = ' + 42", ctx), Value::string("x = 42"));
        assert_eq!(eval_ok("42 + 'x'", ctx), Value::string("42x"));
        assert_eq!(eval_ok("'v' + 1.5", ctx), Value::string("v1.5"));
        assert_eq!(eval_ok("'b:' + true", ctx), Value::string("b:true"));
    }

    #[test]
    fn test_arithmetic_type_errors() {
        let ctx = &mut Context::new();
        assert!(matches!(eval("true + 1", ctx), Err(EvalError::TypeError(_))));
        assert!(matches!(
            eval("[1] * 2", ctx),
            Err(EvalError::TypeError(_))
        ));
    }

    #[test]
    fn test_comparisons() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("1 < 2", ctx), Value::Bool(true));
        assert_eq!(eval_ok("2 <= 2", ctx), Value::Bool(true));
        assert_eq!(eval_ok("3 > 2.5", ctx), Value::Bool(true));
        assert_eq!(eval_ok("'abc' < 'abd'", ctx), Value::Bool(true));
        // Cross-type comparisons are false, never an error
        assert_eq!(eval_ok("1 < 'x'", ctx), Value::Bool(false));
        assert_eq!(eval_ok("null < 1", ctx), Value::Bool(false));
        assert_eq!(eval_ok("null > 1", ctx), Value::Bool(false));
    }

    #[test]
    fn test_equality() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("1 == 1.0", ctx), Value::Bool(true));
        assert_eq!(eval_ok("null == null", ctx), Value::Bool(true));
        assert_eq!(eval_ok("1 == '1'", ctx), Value::Bool(false));
        assert_eq!(eval_ok("[1, 2] == [1, 2]", ctx), Value::Bool(true));
        assert_eq!(
            eval_ok("{'a': 1} == {'a': 1}", ctx),
            Value::Bool(true)
        );
        assert_eq!(eval_ok("1 != 2", ctx), Value::Bool(true));
    }

    #[test]
    fn test_logical_short_circuit() {
        let ctx = &mut Context::new();
        // raises() would error; the un-taken side must not surface it
        assert_eq!(eval_ok("false && (1 / 0 == 0)", ctx), Value::Bool(false));
        assert_eq!(eval_ok("true || (1 / 0 == 0)", ctx), Value::Bool(true));
        assert!(eval("true && (1 / 0 == 0)", ctx).is_err());
    }

    #[test]
    fn test_logical_truthiness() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("1 && 'x'", ctx), Value::Bool(true));
        assert_eq!(eval_ok("0 || ''", ctx), Value::Bool(false));
        assert_eq!(eval_ok("!0", ctx), Value::Bool(true));
        assert_eq!(eval_ok("!'abc'", ctx), Value::Bool(false));
        assert_eq!(eval_ok("not null", ctx), Value::Bool(true));
    }

    #[test]
    fn test_ternary() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("1 < 2 ? 'yes' : 'no'", ctx), Value::string("yes"));
        // Condition uses truthiness, and only the taken branch evaluates
        assert_eq!(eval_ok("0 ? (1 / 0) : 'safe'", ctx), Value::string("safe"));
        assert_eq!(eval_ok("'x' ? 1 : (1 / 0)", ctx), Value::Int(1));
    }

    #[test]
    fn test_between() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("5 between 1 and 10", ctx), Value::Bool(true));
        assert_eq!(eval_ok("1 between 1 and 10", ctx), Value::Bool(true));
        assert_eq!(eval_ok("10 between 1 and 10", ctx), Value::Bool(true));
        assert_eq!(eval_ok("0 between 1 and 10", ctx), Value::Bool(false));
        assert_eq!(eval_ok("0 not between 1 and 10", ctx), Value::Bool(true));
        assert_eq!(
            eval_ok("'m' between 'a' and 'z'", ctx),
            Value::Bool(true)
        );
        // Incomparable bounds make between false, not an error
        assert_eq!(eval_ok("5 between 'a' and 'z'", ctx), Value::Bool(false));
    }

    #[test]
    fn test_in_operator() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("2 in [1, 2, 3]", ctx), Value::Bool(true));
        assert_eq!(eval_ok("5 in [1, 2, 3]", ctx), Value::Bool(false));
        assert_eq!(eval_ok("5 not in [1, 2, 3]", ctx), Value::Bool(true));
        assert_eq!(eval_ok("'ell' in 'hello'", ctx), Value::Bool(true));
        assert_eq!(eval_ok("'z' not in 'hello'", ctx), Value::Bool(true));
        assert!(matches!(eval("1 in 2", ctx), Err(EvalError::TypeError(_))));
    }

    #[test]
    fn test_like_operator() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("'abcd' like 'a%d'", ctx), Value::Bool(true));
        assert_eq!(eval_ok("'abcd' like 'a_cd'", ctx), Value::Bool(true));
        assert_eq!(eval_ok("'abcd' like 'a_d'", ctx), Value::Bool(false));
        assert_eq!(eval_ok("'ab%' like 'ab%'", ctx), Value::Bool(true));
    }

    #[test]
    fn test_variables() {
        let ctx = &mut Context::new();
        ctx.set("age", 30i64);
        ctx.set("isActive", true);
        assert_eq!(eval_ok("age > 25 && isActive", ctx), Value::Bool(true));
        assert!(matches!(
            eval("missing", ctx),
            Err(EvalError::UndefinedVariable(_))
        ));
    }

    #[test]
    fn test_field_access() {
        let ctx = &mut Context::new();
        ctx.set("user", value!({"name": "Alice", "address": {"city": "Oslo"}}));
        assert_eq!(eval_ok("user.name", ctx), Value::string("Alice"));
        assert_eq!(eval_ok("user.address.city", ctx), Value::string("Oslo"));
        // Missing keys are null, and chaining through them stays null
        assert_eq!(eval_ok("user.missing", ctx), Value::Null);
        assert_eq!(eval_ok("user.missing.deeper", ctx), Value::Null);
        assert!(matches!(
            eval("user.name.huh", ctx),
            Err(EvalError::TypeError(_))
        ));
    }

    #[test]
    fn test_index_access() {
        let ctx = &mut Context::new();
        ctx.set("xs", value!([10, 20, 30]));
        ctx.set("m", value!({"k": "v"}));
        assert_eq!(eval_ok("xs[0]", ctx), Value::Int(10));
        assert_eq!(eval_ok("xs[2]", ctx), Value::Int(30));
        assert_eq!(eval_ok("xs[-1]", ctx), Value::Int(30));
        assert_eq!(eval_ok("xs[9]", ctx), Value::Null);
        assert_eq!(eval_ok("m['k']", ctx), Value::string("v"));
        assert_eq!(eval_ok("m['nope']", ctx), Value::Null);
        assert_eq!(eval_ok("'abc'[1]", ctx), Value::string("b"));
        assert!(matches!(
            eval("xs['a']", ctx),
            Err(EvalError::TypeError(_))
        ));
    }

    #[test]
    fn test_array_and_map_literals() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("[1, 2 + 3, 'x']", ctx), value!([1, 5, "x"]));
        assert_eq!(
            eval_ok("{'a': 1 + 1, 'b': 'x'}", ctx),
            value!({"a": 2, "b": "x"})
        );
        assert!(matches!(
            eval("{1: 'x'}", ctx),
            Err(EvalError::TypeError(_))
        ));
    }

    #[test]
    fn test_macro_filter_map() {
        let ctx = &mut Context::new();
        ctx.set("numbers", value!([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
        assert_eq!(
            eval_ok("numbers.filter(n, n > 5)", ctx),
            value!([6, 7, 8, 9, 10])
        );
        assert_eq!(
            eval_ok("numbers.filter(n, n > 5).sum()", ctx),
            Value::Int(40)
        );
        assert_eq!(
            eval_ok("[1, 2, 3].map(n, n * 2)", ctx),
            value!([2, 4, 6])
        );
    }

    #[test]
    fn test_macro_flat_map() {
        let ctx = &mut Context::new();
        assert_eq!(
            eval_ok("[1, 2, 3].flatMap(n, [n, n * 10])", ctx),
            value!([1, 10, 2, 20, 3, 30])
        );
        // Only one level flattens
        assert_eq!(
            eval_ok("[1].flatMap(n, [[n]])", ctx),
            value!([[1]])
        );
        // Non-array body values pass through
        assert_eq!(eval_ok("[1, 2].flatMap(n, n)", ctx), value!([1, 2]));
    }

    #[test]
    fn test_macro_all_exists_find() {
        let ctx = &mut Context::new();
        ctx.set("xs", value!([2, 4, 6]));
        assert_eq!(eval_ok("xs.all(n, n % 2 == 0)", ctx), Value::Bool(true));
        assert_eq!(eval_ok("xs.all(n, n > 3)", ctx), Value::Bool(false));
        assert_eq!(eval_ok("[].all(n, n > 3)", ctx), Value::Bool(true));
        assert_eq!(eval_ok("xs.exists(n, n == 4)", ctx), Value::Bool(true));
        assert_eq!(eval_ok("[].exists(n, true)", ctx), Value::Bool(false));
        assert_eq!(eval_ok("xs.find(n, n > 3)", ctx), Value::Int(4));
        assert_eq!(eval_ok("xs.find(n, n > 100)", ctx), Value::Null);
    }

    #[test]
    fn test_macro_short_circuit_errors() {
        let ctx = &mut Context::new();
        // all() stops at the first falsy body before the erroring element
        assert_eq!(
            eval_ok("[1, 0, 'x'].all(n, n / 1 != 99 && n)", ctx),
            Value::Bool(false)
        );
        // exists() stops at the first truthy body
        assert_eq!(
            eval_ok("[1, 2].exists(n, n == 1 || 1 / 0 == 0)", ctx),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_macro_sort() {
        let ctx = &mut Context::new();
        ctx.set(
            "users",
            value!([
                {"name": "carol", "age": 25},
                {"name": "alice", "age": 30},
                {"name": "bob", "age": 25}
            ]),
        );
        assert_eq!(
            eval_ok("users.sort(u, u.age).map(u, u.name)", ctx),
            value!(["carol", "bob", "alice"])
        );
        assert_eq!(
            eval_ok("[3, 1, 2].sort(n, n)", ctx),
            value!([1, 2, 3])
        );
        // Descending via negated key
        assert_eq!(
            eval_ok("[3, 1, 2].sort(n, -n)", ctx),
            value!([3, 2, 1])
        );
    }

    #[test]
    fn test_macro_group_by() {
        let ctx = &mut Context::new();
        ctx.set(
            "words",
            value!(["apple", "avocado", "banana", "blueberry", "cherry"]),
        );
        let grouped = eval_ok("words.groupBy(w, w.substring(0, 1))", ctx);
        assert_eq!(
            grouped,
            value!({
                "a": ["apple", "avocado"],
                "b": ["banana", "blueberry"],
                "c": ["cherry"]
            })
        );
        // First-seen key order is preserved
        let keys = eval_ok("words.groupBy(w, w.substring(0, 1)).keys()", ctx);
        assert_eq!(keys, value!(["a", "b", "c"]));
    }

    #[test]
    fn test_macro_size_reverse() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("[1, 2, 3].size()", ctx), Value::Int(3));
        assert_eq!(eval_ok("'hello'.size()", ctx), Value::Int(5));
        assert_eq!(eval_ok("{'a': 1}.size()", ctx), Value::Int(1));
        assert_eq!(eval_ok("[1, 2, 3].reverse()", ctx), value!([3, 2, 1]));
        assert_eq!(eval_ok("'abc'.reverse()", ctx), Value::string("cba"));
    }

    #[test]
    fn test_macro_binding_restored() {
        let ctx = &mut Context::new();
        ctx.set("n", 99i64);
        ctx.set("xs", value!([1, 2, 3]));
        assert_eq!(eval_ok("xs.map(n, n * 2)", ctx), value!([2, 4, 6]));
        // The outer binding survives
        assert_eq!(ctx.get("n"), Some(&Value::Int(99)));
    }

    #[test]
    fn test_macro_binding_removed_when_previously_unbound() {
        let ctx = &mut Context::new();
        ctx.set("xs", value!([1, 2, 3]));
        eval_ok("xs.map(x, x * 2)", ctx);
        assert_eq!(ctx.get("x"), None);
    }

    #[test]
    fn test_macro_binding_restored_after_error() {
        let ctx = &mut Context::new();
        ctx.set("v", Value::string("outer"));
        ctx.set("xs", value!([1, 2, 3]));
        // Body errors midway through the iteration
        assert!(eval("xs.map(v, v / 0)", ctx).is_err());
        assert_eq!(ctx.get("v"), Some(&Value::string("outer")));

        assert!(eval("xs.map(fresh, fresh / 0)", ctx).is_err());
        assert_eq!(ctx.get("fresh"), None);
    }

    #[test]
    fn test_nested_macros_with_shadowing() {
        let ctx = &mut Context::new();
        ctx.set("xs", value!([[1, 2], [3]]));
        // The inner macro shadows and restores the outer binding each pass
        assert_eq!(
            eval_ok("xs.map(x, x.map(x, x * 10))", ctx),
            value!([[10, 20], [30]])
        );
        assert_eq!(ctx.get("x"), None);
    }

    #[test]
    fn test_function_form_macros() {
        let ctx = &mut Context::new();
        ctx.set("numbers", value!([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
        assert_eq!(
            eval_ok("sum(filter(n, numbers, n > 5))", ctx),
            Value::Int(40)
        );
        assert_eq!(
            eval_ok("map(n, [1, 2], n + 1)", ctx),
            value!([2, 3])
        );
        assert_eq!(
            eval_ok("all(n, numbers, n > 0)", ctx),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("exists(n, numbers, n == 7)", ctx),
            Value::Bool(true)
        );
        assert_eq!(eval_ok("find(n, numbers, n > 8)", ctx), Value::Int(9));
        // The function form shares the macro binding discipline
        eval_ok("map(q, numbers, q)", ctx);
        assert_eq!(ctx.get("q"), None);
        assert!(matches!(
            eval("filter(numbers)", ctx),
            Err(EvalError::ArityError { .. })
        ));
    }

    #[test]
    fn test_comprehension() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("[x | x in [1, 2, 3]]", ctx), value!([1, 2, 3]));
        assert_eq!(
            eval_ok("[x * x | x in [1, 2, 3, 4], x % 2 == 0]", ctx),
            value!([4, 16])
        );
        assert_eq!(ctx.get("x"), None);
    }

    #[test]
    fn test_string_methods() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("'  pad  '.trim()", ctx), Value::string("pad"));
        assert_eq!(eval_ok("'abc'.upper()", ctx), Value::string("ABC"));
        assert_eq!(eval_ok("'ABC'.lower()", ctx), Value::string("abc"));
        assert_eq!(eval_ok("'hello'.length()", ctx), Value::Int(5));
        assert_eq!(
            eval_ok("'hello'.replace('l', 'L')", ctx),
            Value::string("heLLo")
        );
        assert_eq!(eval_ok("'hello'.contains('ell')", ctx), Value::Bool(true));
        assert_eq!(eval_ok("'hello'.startsWith('he')", ctx), Value::Bool(true));
        assert_eq!(eval_ok("'hello'.endsWith('lo')", ctx), Value::Bool(true));
        assert_eq!(
            eval_ok("'hello'.substring(1, 3)", ctx),
            Value::string("el")
        );
        assert_eq!(eval_ok("'a,b'.split(',')", ctx), value!(["a", "b"]));
        assert_eq!(
            eval_ok("'a1b'.matches('[0-9]')", ctx),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_array_methods() {
        let ctx = &mut Context::new();
        assert_eq!(
            eval_ok("['a', 'b'].join('-')", ctx),
            Value::string("a-b")
        );
        assert_eq!(eval_ok("[1, 2, 2, 3].distinct()", ctx), value!([1, 2, 3]));
        assert_eq!(
            eval_ok("[[1], [2, 3]].flatten()", ctx),
            value!([1, 2, 3])
        );
        assert_eq!(eval_ok("[1, 2, 3].sum()", ctx), Value::Int(6));
        assert_eq!(eval_ok("[1, 2, 3].avg()", ctx), Value::Float(2.0));
        assert_eq!(eval_ok("[2, 9, 4].min()", ctx), Value::Int(2));
        assert_eq!(eval_ok("[2, 9, 4].max()", ctx), Value::Int(9));
        assert_eq!(eval_ok("[1, 2].first()", ctx), Value::Int(1));
        assert_eq!(eval_ok("[1, 2].last()", ctx), Value::Int(2));
        assert_eq!(eval_ok("[].first()", ctx), Value::Null);
        assert_eq!(eval_ok("[1, 2].contains(2)", ctx), Value::Bool(true));
    }

    #[test]
    fn test_object_methods() {
        let ctx = &mut Context::new();
        ctx.set("m", value!({"a": 1, "b": 2}));
        assert_eq!(eval_ok("m.keys()", ctx), value!(["a", "b"]));
        assert_eq!(eval_ok("m.values()", ctx), value!([1, 2]));
        assert_eq!(eval_ok("m.has('a')", ctx), Value::Bool(true));
        assert_eq!(eval_ok("m.has('z')", ctx), Value::Bool(false));
        assert_eq!(eval_ok("m.field('b')", ctx), Value::Int(2));
        assert_eq!(eval_ok("m.field('z')", ctx), Value::Null);
    }

    #[test]
    fn test_method_not_found() {
        let ctx = &mut Context::new();
        match eval("'abc'.frobnicate()", ctx) {
            Err(EvalError::MethodNotFound { type_name, method }) => {
                assert_eq!(type_name, "string");
                assert_eq!(method, "frobnicate");
            }
            other => panic!("expected MethodNotFound, got {:?}", other),
        }
        assert!(matches!(
            eval("42.upper()", ctx),
            Err(EvalError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn test_builtin_functions() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("upper('hi')", ctx), Value::string("HI"));
        assert_eq!(eval_ok("abs(-3)", ctx), Value::Int(3));
        assert_eq!(eval_ok("min(3, 1, 2)", ctx), Value::Int(1));
        assert_eq!(eval_ok("max(3, 1, 2)", ctx), Value::Int(3));
        assert_eq!(eval_ok("size([1, 2])", ctx), Value::Int(2));
        assert_eq!(eval_ok("size('abc')", ctx), Value::Int(3));
        assert_eq!(eval_ok("length('abcd')", ctx), Value::Int(4));
        assert_eq!(eval_ok("first([7, 8])", ctx), Value::Int(7));
        assert_eq!(eval_ok("last('xyz')", ctx), Value::string("z"));
        assert_eq!(eval_ok("sort([3, 1, 2])", ctx), value!([1, 2, 3]));
        assert_eq!(eval_ok("join(['a', 'b'], '+')", ctx), Value::string("a+b"));
        assert_eq!(eval_ok("distinct([1, 1, 2])", ctx), value!([1, 2]));
        assert_eq!(eval_ok("avg([1, 2, 3])", ctx), Value::Float(2.0));
        assert_eq!(eval_ok("contains('abc', 'b')", ctx), Value::Bool(true));
        assert_eq!(eval_ok("contains([1, 2], 3)", ctx), Value::Bool(false));
        assert_eq!(
            eval_ok("substring('hello', 1, 3)", ctx),
            Value::string("el")
        );
    }

    #[test]
    fn test_builtin_arity_errors() {
        let ctx = &mut Context::new();
        match eval("upper()", ctx) {
            Err(EvalError::ArityError {
                name,
                expected,
                actual,
            }) => {
                assert_eq!(name, "upper");
                assert_eq!(expected, 1);
                assert_eq!(actual, 0);
            }
            other => panic!("expected ArityError, got {:?}", other),
        }
        assert!(matches!(
            eval("min(1)", ctx),
            Err(EvalError::ArityError { .. })
        ));
        assert!(matches!(
            eval("replace('a', 'b')", ctx),
            Err(EvalError::ArityError { .. })
        ));
    }

    #[test]
    fn test_regex_builtins() {
        let ctx = &mut Context::new();
        assert_eq!(
            eval_ok("matches('a1b', '[0-9]')", ctx),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("findAll('a1 b22', '[0-9]+')", ctx),
            value!(["1", "22"])
        );
        assert_eq!(
            eval_ok("replaceRegex('a1b2', '[0-9]', '#')", ctx),
            Value::string("a#b#")
        );
        assert!(matches!(
            eval("matches('x', '(')", ctx),
            Err(EvalError::PatternError(_))
        ));
    }

    #[test]
    fn test_json_builtins() {
        let ctx = &mut Context::new();
        assert_eq!(
            eval_ok("toJson([1, 'a'])", ctx),
            Value::string(r#"[1,"a"]"#)
        );
        assert_eq!(
            eval_ok("fromJson('{\"k\": 1}')", ctx),
            value!({"k": 1})
        );
        assert!(matches!(
            eval("fromJson('{')", ctx),
            Err(EvalError::ConversionError(_))
        ));
    }

    #[test]
    fn test_conversion_builtins() {
        let ctx = &mut Context::new();
        assert_eq!(eval_ok("int('42')", ctx), Value::Int(42));
        assert_eq!(eval_ok("int(3.7)", ctx), Value::Int(3));
        assert_eq!(eval_ok("double('2.5')", ctx), Value::Float(2.5));
        assert_eq!(eval_ok("string(42)", ctx), Value::string("42"));
        assert_eq!(eval_ok("toString([1])", ctx), Value::string("[1]"));
        assert_eq!(eval_ok("type('x')", ctx), Value::string("string"));
        assert_eq!(eval_ok("type(1.5)", ctx), Value::string("double"));
        assert!(matches!(
            eval("int('nope')", ctx),
            Err(EvalError::ConversionError(_))
        ));
        assert_eq!(eval_ok("optional(null) == null", ctx), Value::Bool(true));
        assert_eq!(eval_ok("optional(3) == optional(3)", ctx), Value::Bool(true));
    }

    #[test]
    fn test_time_builtins_with_fixed_clock() {
        let ctx = &mut Context::new();
        let fixed = datetime::parse_timestamp("2024-03-15T10:30:00Z").unwrap();
        ctx.set_time_source(move || fixed);

        assert_eq!(eval_ok("now()", ctx), Value::Timestamp(fixed));
        assert_eq!(eval_ok("getYear(now())", ctx), Value::Int(2024));
        assert_eq!(eval_ok("getMonth(now())", ctx), Value::Int(3));
        assert_eq!(eval_ok("getDay(now())", ctx), Value::Int(15));
        assert_eq!(eval_ok("getHour(now())", ctx), Value::Int(10));
        assert_eq!(
            eval_ok("formatTime(now(), '%Y-%m-%d')", ctx),
            Value::string("2024-03-15")
        );
        assert_eq!(
            eval_ok("addDuration(now(), duration('90m'))", ctx),
            Value::Timestamp(fixed + chrono::Duration::minutes(90)),
        );
        assert_eq!(
            eval_ok("subDuration(now(), duration('1h'))", ctx),
            Value::Timestamp(fixed - chrono::Duration::hours(1)),
        );
        assert_eq!(
            eval_ok("timestamp('2024-03-15T10:30:00Z') == now()", ctx),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("date(2024, 3, 15) < now()", ctx),
            Value::Bool(true)
        );
        assert!(matches!(
            eval("timestamp('garbage')", ctx),
            Err(EvalError::ConversionError(_))
        ));
        assert!(matches!(
            eval("date(2024, 13, 1)", ctx),
            Err(EvalError::ConversionError(_))
        ));
    }

    #[test]
    fn test_timestamp_and_duration_arithmetic() {
        let ctx = &mut Context::new();
        assert_eq!(
            eval_ok(
                "timestamp('2024-03-15T10:00:00Z') + duration('30m') == timestamp('2024-03-15T10:30:00Z')",
                ctx
            ),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok(
                "timestamp('2024-03-15T10:30:00Z') - timestamp('2024-03-15T10:00:00Z') == duration('30m')",
                ctx
            ),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("duration('1h') + duration('30m') == duration('90m')", ctx),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok(
                "timestamp('2024-01-01') < timestamp('2024-06-01')",
                ctx
            ),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("duration('1h') < duration('2h')", ctx),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_user_functions() {
        let ctx = &mut Context::new();
        ctx.register_function("double", |args| match args {
            [Value::Int(n)] => Ok(Value::Int(n * 2)),
            _ => Err(EvalError::TypeError("double() wants one int".to_string())),
        });
        assert_eq!(eval_ok("double(21)", ctx), Value::Int(42));
        assert!(matches!(
            eval("nosuch(1)", ctx),
            Err(EvalError::UndefinedFunction(_))
        ));
    }

    #[test]
    fn test_callable_references() {
        let ctx = &mut Context::new();
        // A bare builtin name resolves to a callable value
        assert_eq!(eval_ok("upper", ctx), Value::callable("upper"));
        // Calling through a variable bound to a callable dispatches by name
        ctx.set("f", Value::callable("upper"));
        assert_eq!(eval_ok("f('hi')", ctx), Value::string("HI"));
    }

    #[test]
    fn test_set_batch() {
        let ctx = &mut Context::new();
        ctx.set_batch(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
        ]);
        assert_eq!(eval_ok("a + b", ctx), Value::Int(3));
    }
}
