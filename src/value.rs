// Value: Arc-wrapped dynamic value type for O(1) cloning
// Shared by the parser (literals), evaluator, and compiler (folded constants)

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::datetime;

/// A runtime value with O(1) clone semantics via Arc-wrapping.
///
/// Heap-backed variants (String, Bytes, Array, Object) share their payload on
/// clone. `Arc` rather than `Rc` because folded constants travel inside
/// `CompiledExpression` objects held in a process-wide cache.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    Bytes(Arc<[u8]>),
    Timestamp(DateTime<Utc>),
    Duration(chrono::Duration),
    Array(Arc<Vec<Value>>),
    Object(Arc<IndexMap<String, Value>>),
    /// Present/absent wrapper produced by `optional()`.
    Optional(Option<Arc<Value>>),
    /// Reference to a builtin or registered function, by name.
    Callable(Arc<str>),
}

// ── Type checks ──────────────────────────────────────────────────────────────

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    #[inline]
    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    #[inline]
    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Callable(_))
    }

    /// Variant name as reported by the `type()` builtin and method-dispatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "double",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Duration(_) => "duration",
            Value::Array(_) => "array",
            Value::Object(_) => "map",
            Value::Optional(_) => "optional",
            Value::Callable(_) => "function",
        }
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

impl Value {
    /// Numeric view with Int→Float promotion.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    #[inline]
    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    #[inline]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    #[inline]
    pub fn as_duration(&self) -> Option<chrono::Duration> {
        match self {
            Value::Duration(d) => Some(*d),
            _ => None,
        }
    }

    /// Index into an object by key.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Index into an array by position.
    #[inline]
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Array(arr) => arr.get(index),
            _ => None,
        }
    }
}

// ── Constructors ─────────────────────────────────────────────────────────────

impl Value {
    #[inline]
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Value::String(s.into())
    }

    #[inline]
    pub fn bytes(b: impl Into<Arc<[u8]>>) -> Self {
        Value::Bytes(b.into())
    }

    #[inline]
    pub fn array(v: Vec<Value>) -> Self {
        Value::Array(Arc::new(v))
    }

    #[inline]
    pub fn object(m: IndexMap<String, Value>) -> Self {
        Value::Object(Arc::new(m))
    }

    #[inline]
    pub fn callable(name: impl Into<Arc<str>>) -> Self {
        Value::Callable(name.into())
    }

    #[inline]
    pub fn present(inner: Value) -> Self {
        Value::Optional(Some(Arc::new(inner)))
    }

    #[inline]
    pub fn absent() -> Self {
        Value::Optional(None)
    }
}

// ── From impls ───────────────────────────────────────────────────────────────

impl From<bool> for Value {
    #[inline]
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    #[inline]
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<usize> for Value {
    #[inline]
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    #[inline]
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Vec<Value>> for Value {
    #[inline]
    fn from(v: Vec<Value>) -> Self {
        Value::Array(Arc::new(v))
    }
}

impl From<IndexMap<String, Value>> for Value {
    #[inline]
    fn from(m: IndexMap<String, Value>) -> Self {
        Value::Object(Arc::new(m))
    }
}

impl From<DateTime<Utc>> for Value {
    #[inline]
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}

impl From<chrono::Duration> for Value {
    #[inline]
    fn from(d: chrono::Duration) -> Self {
        Value::Duration(d)
    }
}

// ── Truthiness ───────────────────────────────────────────────────────────────

impl Value {
    /// Boolean coercion used by logical operators, ternary, and macro bodies.
    ///
    /// Bool as-is; numbers non-zero; string/bytes/array/object non-empty;
    /// null and an absent optional are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::Array(arr) => !arr.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Optional(inner) => inner.is_some(),
            Value::Timestamp(_) | Value::Duration(_) | Value::Callable(_) => true,
        }
    }
}

// ── Ordering ─────────────────────────────────────────────────────────────────

impl Value {
    /// Ordering for `<`/`<=`/`>`/`>=`, `between`, and `sort` keys.
    ///
    /// Defined on numeric pairs (with Int→Float promotion), strings (byte
    /// order), bools, timestamps, and durations. Mixed-variant pairs are
    /// incomparable and return `None` — relational operators then yield false
    /// rather than failing.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

// ── PartialEq ────────────────────────────────────────────────────────────────

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            // An absent optional equals itself and null
            (Value::Optional(None), Value::Null) | (Value::Null, Value::Optional(None)) => true,
            (Value::Optional(a), Value::Optional(b)) => match (a, b) {
                (None, None) => true,
                (Some(x), Some(y)) => **x == **y,
                _ => false,
            },
            (Value::Bool(a), Value::Bool(b)) => a == b,
            // Numbers compare numerically across Int/Float; NaN != NaN
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            (Value::Callable(a), Value::Callable(b)) => a == b,
            _ => false,
        }
    }
}

// ── Display ──────────────────────────────────────────────────────────────────

// Display is the language's string coercion: strings render unquoted at the
// top level, while values nested inside arrays/objects render JSON-style.

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            _ => self.fmt_nested(f),
        }
    }
}

impl Value {
    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => format_float(*n, f),
            Value::String(s) => write!(f, "\"{}\"", escape_string(s)),
            Value::Bytes(b) => write!(f, "\"{}\"", escape_string(&String::from_utf8_lossy(b))),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Duration(d) => write!(f, "{}", datetime::format_duration(*d)),
            Value::Array(arr) => {
                write!(f, "[")?;
                for (i, v) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    v.fmt_nested(f)?;
                }
                write!(f, "]")
            }
            Value::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": ", escape_string(k))?;
                    v.fmt_nested(f)?;
                }
                write!(f, "}}")
            }
            Value::Optional(Some(inner)) => inner.fmt_nested(f),
            Value::Optional(None) => write!(f, "null"),
            Value::Callable(name) => write!(f, "<fn {}>", name),
        }
    }
}

fn escape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            c if c < '\x20' => {
                result.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => result.push(c),
        }
    }
    result
}

fn format_float(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !n.is_finite() {
        if n.is_nan() {
            write!(f, "NaN")
        } else if n > 0.0 {
            write!(f, "Infinity")
        } else {
            write!(f, "-Infinity")
        }
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{}", n)
    }
}

// ── Serialization (for the toJson builtin) ───────────────────────────────────

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(n) => {
                if n.is_finite() {
                    serializer.serialize_f64(*n)
                } else {
                    serializer.serialize_none()
                }
            }
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
            Value::Timestamp(t) => serializer.serialize_str(&t.to_rfc3339()),
            Value::Duration(d) => serializer.serialize_str(&datetime::format_duration(*d)),
            Value::Array(arr) => {
                let mut seq = serializer.serialize_seq(Some(arr.len()))?;
                for v in arr.iter() {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map.iter() {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            Value::Optional(Some(inner)) => inner.serialize(serializer),
            Value::Optional(None) => serializer.serialize_none(),
            Value::Callable(_) => serializer.serialize_none(),
        }
    }
}

// ── Deserialization (for the fromJson builtin) ───────────────────────────────

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "any valid JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        if v <= i64::MAX as u64 {
            Ok(Value::Int(v as i64))
        } else {
            Ok(Value::Float(v as f64))
        }
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::string(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v.into()))
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut vec = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(elem) = seq.next_element()? {
            vec.push(elem);
        }
        Ok(Value::array(vec))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut m = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((k, v)) = map.next_entry()? {
            m.insert(k, v);
        }
        Ok(Value::object(m))
    }
}

// ── JSON string I/O ──────────────────────────────────────────────────────────

impl Value {
    /// Serialize to a JSON string.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON string into a Value (integral numbers become Int).
    pub fn from_json_str(s: &str) -> Result<Value, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// ── value! macro ─────────────────────────────────────────────────────────────

/// Macro for constructing Value literals, similar to serde_json::json!
///
/// Usage:
///   value!(null)           → Value::Null
///   value!(true)           → Value::Bool(true)
///   value!(42)             → Value::Int(42)
///   value!(3.14)           → Value::Float(3.14)
///   value!("hello")        → Value::String(Arc::from("hello"))
///   value!([1, 2, 3])      → Value::Array(Arc::new(vec![...]))
///   value!({"k": v, ...})  → Value::Object(Arc::new(IndexMap from pairs))
///   value!(expr)           → Value::from(expr)
#[macro_export]
macro_rules! value {
    // null
    (null) => {
        $crate::value::Value::Null
    };

    // true
    (true) => {
        $crate::value::Value::Bool(true)
    };

    // false
    (false) => {
        $crate::value::Value::Bool(false)
    };

    // Array
    ([ $($elem:tt),* $(,)? ]) => {
        $crate::value::Value::Array(std::sync::Arc::new(vec![ $( $crate::value!($elem) ),* ]))
    };

    // Object
    ({ $($key:tt : $val:tt),* $(,)? }) => {
        {
            #[allow(unused_mut)]
            let mut map = indexmap::IndexMap::new();
            $(
                map.insert(($key).to_string(), $crate::value!($val));
            )*
            $crate::value::Value::Object(std::sync::Arc::new(map))
        }
    };

    // Expression (fallback — numbers, variables, function calls, etc.)
    ($other:expr) => {
        $crate::value::Value::from($other)
    };
}

// ── Tests ────────────────────────────────────────────────────────────────────
