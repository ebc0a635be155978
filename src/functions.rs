// Built-in function implementations
// Argument arity and receiver typing are enforced by the evaluator's dispatch;
// the bodies here take already-validated shapes where practical.

use crate::evaluator::EvalError;
use crate::utils;
use crate::value::Value;

/// Built-in string functions
pub mod string {
    use super::*;

    /// upper() - uppercase, returning the input untouched when nothing changes
    pub fn upper(s: &str) -> Value {
        if s.bytes().any(|b| b.is_ascii_lowercase()) || s.chars().any(|c| c.is_lowercase()) {
            Value::string(s.to_uppercase())
        } else {
            Value::string(s)
        }
    }

    /// lower() - lowercase counterpart of upper()
    pub fn lower(s: &str) -> Value {
        if s.bytes().any(|b| b.is_ascii_uppercase()) || s.chars().any(|c| c.is_uppercase()) {
            Value::string(s.to_lowercase())
        } else {
            Value::string(s)
        }
    }

    pub fn trim(s: &str) -> Value {
        Value::string(s.trim())
    }

    /// replace() - replace every occurrence; no-op fast path when absent
    pub fn replace(s: &str, from: &str, to: &str) -> Value {
        if !s.contains(from) {
            return Value::string(s);
        }
        Value::string(s.replace(from, to))
    }

    pub fn split(s: &str, separator: &str) -> Value {
        let parts: Vec<Value> = if separator.is_empty() {
            s.chars().map(|c| Value::string(c.to_string())).collect()
        } else {
            s.split(separator).map(Value::string).collect()
        };
        Value::array(parts)
    }

    pub fn length(s: &str) -> Value {
        Value::Int(s.chars().count() as i64)
    }

    pub fn contains(s: &str, needle: &str) -> Value {
        Value::Bool(s.contains(needle))
    }

    pub fn starts_with(s: &str, prefix: &str) -> Value {
        Value::Bool(s.starts_with(prefix))
    }

    pub fn ends_with(s: &str, suffix: &str) -> Value {
        Value::Bool(s.ends_with(suffix))
    }

    /// substring() - character-indexed slice with clamping bounds
    pub fn substring(s: &str, start: i64, end: Option<i64>) -> Value {
        let chars: Vec<char> = s.chars().collect();
        let len = chars.len() as i64;
        let start = start.clamp(0, len) as usize;
        let end = end.unwrap_or(len).clamp(0, len) as usize;
        if end <= start {
            return Value::string("");
        }
        Value::string(chars[start..end].iter().collect::<String>())
    }

    pub fn matches(s: &str, pattern: &str) -> Result<Value, EvalError> {
        let re = compile_regex(pattern)?;
        Ok(Value::Bool(re.is_match(s)))
    }

    pub fn find_all(s: &str, pattern: &str) -> Result<Value, EvalError> {
        let re = compile_regex(pattern)?;
        let found: Vec<Value> = re.find_iter(s).map(|m| Value::string(m.as_str())).collect();
        Ok(Value::array(found))
    }

    pub fn replace_regex(s: &str, pattern: &str, replacement: &str) -> Result<Value, EvalError> {
        let re = compile_regex(pattern)?;
        Ok(Value::string(re.replace_all(s, replacement).into_owned()))
    }

    fn compile_regex(pattern: &str) -> Result<regex::Regex, EvalError> {
        regex::Regex::new(pattern).map_err(|e| EvalError::PatternError(e.to_string()))
    }
}

/// Built-in math functions
pub mod numeric {
    use super::*;

    /// abs() - integers stay integers
    pub fn abs(v: &Value) -> Result<Value, EvalError> {
        match v {
            Value::Int(n) => Ok(Value::Int(n.wrapping_abs())),
            Value::Float(n) => Ok(Value::Float(n.abs())),
            other => Err(numeric_arg_error("abs", other)),
        }
    }

    pub fn ceil(v: &Value) -> Result<Value, EvalError> {
        let n = v.as_f64().ok_or_else(|| numeric_arg_error("ceil", v))?;
        Ok(Value::Float(n.ceil()))
    }

    pub fn floor(v: &Value) -> Result<Value, EvalError> {
        let n = v.as_f64().ok_or_else(|| numeric_arg_error("floor", v))?;
        Ok(Value::Float(n.floor()))
    }

    pub fn round(v: &Value) -> Result<Value, EvalError> {
        let n = v.as_f64().ok_or_else(|| numeric_arg_error("round", v))?;
        Ok(Value::Float(n.round()))
    }

    pub fn sqrt(v: &Value) -> Result<Value, EvalError> {
        let n = v.as_f64().ok_or_else(|| numeric_arg_error("sqrt", v))?;
        Ok(Value::Float(n.sqrt()))
    }

    /// pow() - integer base and non-negative integer exponent stay integer
    pub fn pow(base: &Value, exp: &Value) -> Result<Value, EvalError> {
        match (base, exp) {
            (Value::Int(b), Value::Int(e)) if *e >= 0 && *e <= u32::MAX as i64 => {
                Ok(Value::Int(b.wrapping_pow(*e as u32)))
            }
            _ => {
                let b = base.as_f64().ok_or_else(|| numeric_arg_error("pow", base))?;
                let e = exp.as_f64().ok_or_else(|| numeric_arg_error("pow", exp))?;
                Ok(Value::Float(b.powf(e)))
            }
        }
    }

    /// mod() - truncated remainder; integer divisor of zero fails
    pub fn modulo(a: &Value, b: &Value) -> Result<Value, EvalError> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                if *y == 0 {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(Value::Int(x.wrapping_rem(*y)))
                }
            }
            _ => {
                let x = a.as_f64().ok_or_else(|| numeric_arg_error("mod", a))?;
                let y = b.as_f64().ok_or_else(|| numeric_arg_error("mod", b))?;
                Ok(Value::Float(x % y))
            }
        }
    }

    pub fn min(args: &[Value]) -> Result<Value, EvalError> {
        fold_extremum("min", args, |candidate, best| candidate < best)
    }

    pub fn max(args: &[Value]) -> Result<Value, EvalError> {
        fold_extremum("max", args, |candidate, best| candidate > best)
    }

    fn fold_extremum(
        name: &str,
        args: &[Value],
        better: impl Fn(f64, f64) -> bool,
    ) -> Result<Value, EvalError> {
        let first = args.first().ok_or_else(|| EvalError::ArityError {
            name: name.to_string(),
            expected: 2,
            actual: 0,
        })?;
        let mut best_idx = 0;
        let mut best = first.as_f64().ok_or_else(|| numeric_arg_error(name, first))?;
        for (i, arg) in args.iter().enumerate().skip(1) {
            let n = arg.as_f64().ok_or_else(|| numeric_arg_error(name, arg))?;
            if better(n, best) {
                best = n;
                best_idx = i;
            }
        }
        Ok(args[best_idx].clone())
    }

    fn numeric_arg_error(name: &str, v: &Value) -> EvalError {
        EvalError::TypeError(format!(
            "{}() requires a numeric argument, got {}",
            name,
            v.type_name()
        ))
    }
}

/// Built-in collection functions
pub mod collection {
    use super::*;

    /// sum() - Int when every element is an Int, Float otherwise
    pub fn sum(items: &[Value]) -> Result<Value, EvalError> {
        let mut int_sum: i64 = 0;
        let mut float_sum: f64 = 0.0;
        let mut all_int = true;
        for item in items {
            match item {
                Value::Int(n) => {
                    int_sum = int_sum.wrapping_add(*n);
                    float_sum += *n as f64;
                }
                Value::Float(n) => {
                    all_int = false;
                    float_sum += *n;
                }
                other => {
                    return Err(EvalError::TypeError(format!(
                        "sum() requires numeric elements, got {}",
                        other.type_name()
                    )))
                }
            }
        }
        if all_int {
            Ok(Value::Int(int_sum))
        } else {
            Ok(Value::Float(float_sum))
        }
    }

    pub fn avg(items: &[Value]) -> Result<Value, EvalError> {
        if items.is_empty() {
            return Ok(Value::Float(0.0));
        }
        let total = match sum(items)? {
            Value::Int(n) => n as f64,
            Value::Float(n) => n,
            _ => 0.0,
        };
        Ok(Value::Float(total / items.len() as f64))
    }

    /// distinct() - dedup by string coercion, first-seen order preserved
    pub fn distinct(items: &[Value]) -> Value {
        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::with_capacity(items.len());
        for item in items {
            if seen.insert(item.to_string()) {
                result.push(item.clone());
            }
        }
        Value::array(result)
    }

    pub fn flatten(items: &[Value]) -> Value {
        Value::array(utils::flatten_deep(items))
    }

    pub fn first(v: &Value) -> Result<Value, EvalError> {
        match v {
            Value::Array(arr) => Ok(arr.first().cloned().unwrap_or(Value::Null)),
            Value::String(s) => Ok(s
                .chars()
                .next()
                .map(|c| Value::string(c.to_string()))
                .unwrap_or(Value::Null)),
            other => Err(EvalError::TypeError(format!(
                "first() requires an array or string, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn last(v: &Value) -> Result<Value, EvalError> {
        match v {
            Value::Array(arr) => Ok(arr.last().cloned().unwrap_or(Value::Null)),
            Value::String(s) => Ok(s
                .chars()
                .last()
                .map(|c| Value::string(c.to_string()))
                .unwrap_or(Value::Null)),
            other => Err(EvalError::TypeError(format!(
                "last() requires an array or string, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn size(v: &Value) -> Result<Value, EvalError> {
        match v {
            Value::Array(arr) => Ok(Value::Int(arr.len() as i64)),
            Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::Object(map) => Ok(Value::Int(map.len() as i64)),
            Value::Bytes(b) => Ok(Value::Int(b.len() as i64)),
            other => Err(EvalError::TypeError(format!(
                "size() requires an array, string, or map, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn join(items: &[Value], separator: &str) -> Value {
        let mut out = String::new();
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(separator);
            }
            out.push_str(&item.to_string());
        }
        Value::string(out)
    }

    /// sort() - natural ascending order, stable; incomparable pairs fall
    /// back to string coercion
    pub fn sort(items: &[Value]) -> Value {
        let mut sorted = items.to_vec();
        sorted.sort_by(|a, b| match a.compare(b) {
            Some(ordering) => ordering,
            None => a.to_string().cmp(&b.to_string()),
        });
        Value::array(sorted)
    }

    pub fn contains(items: &[Value], needle: &Value) -> Value {
        Value::Bool(items.iter().any(|item| item == needle))
    }
}

/// JSON codec
pub mod json {
    use super::*;

    pub fn to_json(v: &Value) -> Result<Value, EvalError> {
        v.to_json_string()
            .map(Value::string)
            .map_err(|e| EvalError::ConversionError(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Value, EvalError> {
        Value::from_json_str(s).map_err(|e| EvalError::ConversionError(e.to_string()))
    }
}

/// Type inspection and coercion
pub mod conv {
    use super::*;

    pub fn type_of(v: &Value) -> Value {
        Value::string(v.type_name())
    }

    pub fn to_int(v: &Value) -> Result<Value, EvalError> {
        match v {
            Value::Int(n) => Ok(Value::Int(*n)),
            Value::Float(n) => Ok(Value::Int(*n as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| EvalError::ConversionError(format!("cannot convert '{}' to int", s))),
            other => Err(EvalError::ConversionError(format!(
                "cannot convert {} to int",
                other.type_name()
            ))),
        }
    }

    pub fn to_double(v: &Value) -> Result<Value, EvalError> {
        match v {
            Value::Int(n) => Ok(Value::Float(*n as f64)),
            Value::Float(n) => Ok(Value::Float(*n)),
            Value::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                EvalError::ConversionError(format!("cannot convert '{}' to double", s))
            }),
            other => Err(EvalError::ConversionError(format!(
                "cannot convert {} to double",
                other.type_name()
            ))),
        }
    }

    pub fn to_string(v: &Value) -> Value {
        Value::string(v.to_string())
    }

    pub fn to_bytes(v: &Value) -> Result<Value, EvalError> {
        match v {
            Value::String(s) => Ok(Value::bytes(s.as_bytes().to_vec())),
            Value::Bytes(b) => Ok(Value::Bytes(b.clone())),
            other => Err(EvalError::ConversionError(format!(
                "cannot convert {} to bytes",
                other.type_name()
            ))),
        }
    }

    /// optional() - null wraps to absent, everything else to present
    pub fn to_optional(v: &Value) -> Value {
        match v {
            Value::Null => Value::absent(),
            other => Value::present(other.clone()),
        }
    }
}
